//! Runtime knowledge about chunks and chunk servers: the chunk-to-server
//! mapping, placement policy, leases, replication control, and the
//! per-server session machines.

pub mod chunk_server;
pub mod lease;
pub mod layout_manager;
pub mod placement;
pub mod rebalance;

pub use chunk_server::{ChunkServer, SessionState};
pub use layout_manager::{LayoutConfig, LayoutManager, WriteLeaseState};
pub use lease::{Lease, LeaseTable};
pub use rebalance::{plan_moves, ChunkMove, ServerUsage};

/// Handle of a suspended processor operation awaiting chunk-server acks.
pub type OpId = u64;
