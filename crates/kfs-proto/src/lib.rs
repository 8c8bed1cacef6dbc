//! Wire protocol for the metaserver: text request parsing and response /
//! outbound-RPC rendering.
//!
//! Every message is a command token on the first line, `Header: value` pairs
//! on the following lines, a blank line, and an optional body whose length is
//! given by `Content-length`.

pub mod chunk_rpc;
pub mod properties;
pub mod request;
pub mod response;

pub use chunk_rpc::ChunkRpc;
pub use properties::Properties;
pub use request::{parse_command, ClientRequest, LeaseType};
pub use response::{ChunkLayoutInfo, FattrSummary};
