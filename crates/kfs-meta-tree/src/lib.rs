//! The metadata tree: a single ordered keyspace holding directory entries,
//! file attributes, and chunk-info records, plus the namespace operators that
//! mutate it.
//!
//! The tree owns the global id counters (`fid`, `chunkId`, `chunkVersionInc`)
//! and the dumpster of chunk records awaiting deletion; all of it is
//! persisted through the checkpoint header and rebuilt from checkpoint plus
//! log replay.

pub mod key;
pub mod record;
pub mod tree;

pub use key::MetaKey;
pub use record::{ChunkInfo, DirEntry, FileAttr, MetaRecord};
pub use tree::{AllocOutcome, MetaTree, TruncateOutcome};
