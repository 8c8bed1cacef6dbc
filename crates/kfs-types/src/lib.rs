#[allow(non_snake_case)]
pub mod status_code;

pub mod status;
pub mod result;

#[macro_use]
pub mod strong_type;

pub mod ids;
pub mod location;

// Re-export commonly used items at the crate root.
pub use ids::*;
pub use location::ServerLocation;
pub use result::{make_error, make_error_msg, Result};
pub use status::Status;
pub use status_code::*;

/// Fixed chunk size: 64 MiB. Every chunk offset is a multiple of this.
pub const CHUNK_SIZE: u64 = 1 << 26;

/// File id of the root directory. It exists permanently and cannot be
/// removed or renamed.
pub const ROOT_FID: Fid = Fid(2);

/// Default write/read lease interval, in seconds.
pub const LEASE_INTERVAL_SECS: i64 = 60;

/// Hard cap on per-file replication degree.
pub const MAX_REPLICAS_PER_FILE: u32 = 3;

/// Protocol version string carried on every outbound chunk-server RPC.
pub const PROTO_VERSION: &str = "KFS/1.0";
