use std::fmt;

use serde::{Deserialize, Serialize};

strong_type!(Fid, u64);
strong_type!(ChunkId, u64);
strong_type!(ChunkVersion, u64);
strong_type!(LeaseId, u64);

/// Request sequence number as carried in the `Cseq` header. Clients may send
/// arbitrary values; -1 marks an absent header.
pub type Seq = i64;

/// Byte offset of a chunk within its file. Always a multiple of the chunk
/// size.
pub type ChunkOff = u64;

/// What a file id names: a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Dir,
}

impl FileKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, FileKind::Dir)
    }
}

impl fmt::Display for FileKind {
    /// The wire form used in `Type:` response headers.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::File => write!(f, "file"),
            FileKind::Dir => write!(f, "dir"),
        }
    }
}
