//! Outbound RPCs from the metaserver to chunk servers.
//!
//! Each RPC renders as a text request in the same framing as client commands,
//! carrying `Cseq` and `Version: KFS/1.0`. Replies are matched back to the
//! originating RPC by sequence number.

use std::fmt::Write as _;

use kfs_types::{ChunkId, ChunkVersion, Fid, LeaseId, Seq, ServerLocation, PROTO_VERSION};

/// A command queued for delivery to one chunk server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRpc {
    /// Create a chunk replica. `servers` lists the whole replica set so the
    /// chunk server can forward writes.
    Allocate {
        fid: Fid,
        chunk_id: ChunkId,
        version: ChunkVersion,
        lease_id: Option<LeaseId>,
        servers: Vec<String>,
    },
    Delete {
        chunk_id: ChunkId,
    },
    Truncate {
        chunk_id: ChunkId,
        size: u64,
    },
    Heartbeat,
    StaleChunks {
        chunk_ids: Vec<ChunkId>,
    },
    VersChange {
        fid: Fid,
        chunk_id: ChunkId,
        version: ChunkVersion,
    },
    Replicate {
        fid: Fid,
        chunk_id: ChunkId,
        version: ChunkVersion,
        src: ServerLocation,
    },
}

impl ChunkRpc {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkRpc::Allocate { .. } => "ALLOCATE",
            ChunkRpc::Delete { .. } => "DELETE",
            ChunkRpc::Truncate { .. } => "TRUNCATE",
            ChunkRpc::Heartbeat => "HEARTBEAT",
            ChunkRpc::StaleChunks { .. } => "STALE_CHUNKS",
            ChunkRpc::VersChange { .. } => "CHUNK_VERS_CHANGE",
            ChunkRpc::Replicate { .. } => "REPLICATE",
        }
    }

    /// Render the request text for the given sequence number.
    pub fn request(&self, seq: Seq) -> String {
        let mut os = format!(
            "{} \r\nCseq: {}\r\nVersion: {}\r\n",
            self.name(),
            seq,
            PROTO_VERSION
        );
        match self {
            ChunkRpc::Allocate {
                fid,
                chunk_id,
                version,
                lease_id,
                servers,
            } => {
                let _ = write!(os, "File-handle: {}\r\n", fid);
                let _ = write!(os, "Chunk-handle: {}\r\n", chunk_id);
                let _ = write!(os, "Chunk-version: {}\r\n", version);
                if let Some(lease) = lease_id {
                    let _ = write!(os, "Lease-id: {}\r\n", lease);
                }
                let _ = write!(os, "Num-servers: {}\r\n", servers.len());
                os.push_str("Servers:");
                for s in servers {
                    let _ = write!(os, " {}", s);
                }
                os.push_str("\r\n\r\n");
            }
            ChunkRpc::Delete { chunk_id } => {
                let _ = write!(os, "Chunk-handle: {}\r\n\r\n", chunk_id);
            }
            ChunkRpc::Truncate { chunk_id, size } => {
                let _ = write!(os, "Chunk-handle: {}\r\n", chunk_id);
                let _ = write!(os, "Chunk-size: {}\r\n\r\n", size);
            }
            ChunkRpc::Heartbeat => {
                os.push_str("\r\n");
            }
            ChunkRpc::StaleChunks { chunk_ids } => {
                let mut body = String::new();
                for id in chunk_ids {
                    let _ = write!(body, "{} ", id);
                }
                let _ = write!(os, "Num-chunks: {}\r\n", chunk_ids.len());
                let _ = write!(os, "Content-length: {}\r\n\r\n", body.len());
                os.push_str(&body);
            }
            ChunkRpc::VersChange {
                fid,
                chunk_id,
                version,
            } => {
                let _ = write!(os, "File-handle: {}\r\n", fid);
                let _ = write!(os, "Chunk-handle: {}\r\n", chunk_id);
                let _ = write!(os, "Chunk-version: {}\r\n\r\n", version);
            }
            ChunkRpc::Replicate {
                fid,
                chunk_id,
                version,
                src,
            } => {
                let _ = write!(os, "File-handle: {}\r\n", fid);
                let _ = write!(os, "Chunk-handle: {}\r\n", chunk_id);
                let _ = write!(os, "Chunk-version: {}\r\n", version);
                let _ = write!(os, "Chunk-location: {}\r\n\r\n", src);
            }
        }
        os
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_request() {
        let rpc = ChunkRpc::Allocate {
            fid: Fid(10),
            chunk_id: ChunkId(77),
            version: ChunkVersion(1),
            lease_id: Some(LeaseId(4)),
            servers: vec!["cs1:1000".to_string(), "cs2:1001".to_string()],
        };
        let text = rpc.request(12);
        assert!(text.starts_with("ALLOCATE \r\nCseq: 12\r\nVersion: KFS/1.0\r\n"));
        assert!(text.contains("File-handle: 10\r\n"));
        assert!(text.contains("Lease-id: 4\r\n"));
        assert!(text.contains("Num-servers: 2\r\n"));
        assert!(text.contains("Servers: cs1:1000 cs2:1001\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_heartbeat_request() {
        let text = ChunkRpc::Heartbeat.request(3);
        assert_eq!(text, "HEARTBEAT \r\nCseq: 3\r\nVersion: KFS/1.0\r\n\r\n");
    }

    #[test]
    fn test_stale_chunks_body() {
        let rpc = ChunkRpc::StaleChunks {
            chunk_ids: vec![ChunkId(5), ChunkId(9)],
        };
        let text = rpc.request(1);
        assert!(text.contains("Num-chunks: 2\r\n"));
        assert!(text.contains("Content-length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\n5 9 "));
    }

    #[test]
    fn test_vers_change_request() {
        let rpc = ChunkRpc::VersChange {
            fid: Fid(10),
            chunk_id: ChunkId(77),
            version: ChunkVersion(3),
        };
        let text = rpc.request(8);
        assert!(text.starts_with("CHUNK_VERS_CHANGE \r\n"));
        assert!(text.contains("Chunk-version: 3\r\n"));
    }

    #[test]
    fn test_replicate_request_names_source() {
        let rpc = ChunkRpc::Replicate {
            fid: Fid(1),
            chunk_id: ChunkId(2),
            version: ChunkVersion(1),
            src: ServerLocation::new("cs1", 1000),
        };
        let text = rpc.request(2);
        assert!(text.contains("Chunk-location: cs1 1000\r\n"));
    }
}
