//! Keys of the ordered metadata keyspace.
//!
//! Records are grouped by kind, then ordered by their identifying fields, so
//! a prefix scan over one kind (all entries of a directory, all chunks of a
//! file) is a contiguous range.

use kfs_types::{ChunkOff, Fid};

/// Key of one record in the metadata keyspace.
///
/// The derived `Ord` sorts all attribute records first, then directory
/// entries grouped by parent, then chunk records grouped by file and ordered
/// by offset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaKey {
    /// Attribute record of one file or directory.
    Fattr(Fid),
    /// One name inside one directory.
    Dentry { dir: Fid, name: String },
    /// One chunk stripe of one file.
    Chunk { fid: Fid, offset: ChunkOff },
}

impl MetaKey {
    /// Smallest key of the dentry range of a directory.
    pub fn dentry_range_start(dir: Fid) -> MetaKey {
        MetaKey::Dentry {
            dir,
            name: String::new(),
        }
    }

    /// Smallest key of the chunk range of a file.
    pub fn chunk_range_start(fid: Fid) -> MetaKey {
        MetaKey::Chunk { fid, offset: 0 }
    }

    /// Whether this key belongs to the dentry range of `dir`.
    pub fn in_dentry_range(&self, dir: Fid) -> bool {
        matches!(self, MetaKey::Dentry { dir: d, .. } if *d == dir)
    }

    /// Whether this key belongs to the chunk range of `fid`.
    pub fn in_chunk_range(&self, fid: Fid) -> bool {
        matches!(self, MetaKey::Chunk { fid: f, .. } if *f == fid)
    }
}
