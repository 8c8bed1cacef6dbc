//! Typed client and chunk-server requests, parsed from the text protocol.
//!
//! Parsing follows the same model as the original metaserver: the command
//! token selects a per-command parser, the headers are dumped into a
//! [`Properties`] table, and each parser extracts its required fields in any
//! order.

use std::fmt;

use kfs_types::{
    make_error, make_error_msg, ChunkId, ChunkOff, Errno, Fid, LeaseId, Result, Seq,
    ServerLocation, MAX_REPLICAS_PER_FILE,
};

use crate::properties::Properties;

/// Lease flavor as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseType {
    Read,
    Write,
}

impl fmt::Display for LeaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseType::Read => write!(f, "READ_LEASE"),
            LeaseType::Write => write!(f, "WRITE_LEASE"),
        }
    }
}

/// A chunk server's HELLO registration.
#[derive(Debug, Clone)]
pub struct HelloRequest {
    pub location: ServerLocation,
    pub total_space: u64,
    pub used_space: u64,
    pub num_chunks: usize,
    pub content_length: usize,
    /// Hosted chunks, from the message body. Each token is `<id>` or
    /// `<id>:<version>` when the server reports the version it holds.
    pub chunks: Vec<(ChunkId, Option<u64>)>,
}

impl HelloRequest {
    /// Parse the space-separated chunk list from the message body.
    pub fn parse_body(&mut self, body: &str) -> Result<()> {
        self.chunks.clear();
        for token in body.split_whitespace() {
            let (id, version) = match token.split_once(':') {
                Some((id, vers)) => {
                    let vers: u64 = vers.parse().map_err(|_| {
                        kfs_types::Status::with_message(
                            Errno::EINVAL,
                            format!("bad chunk version in hello body: {:?}", token),
                        )
                    })?;
                    (id, Some(vers))
                }
                None => (token, None),
            };
            let id: u64 = id.parse().map_err(|_| {
                kfs_types::Status::with_message(
                    Errno::EINVAL,
                    format!("bad chunk id in hello body: {:?}", token),
                )
            })?;
            self.chunks.push((ChunkId(id), version));
        }
        if self.chunks.len() != self.num_chunks {
            tracing::warn!(
                expected = self.num_chunks,
                got = self.chunks.len(),
                server = %self.location.id(),
                "hello body chunk count mismatch"
            );
        }
        Ok(())
    }
}

/// One parsed client (or chunk-server) command.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Lookup {
        dir: Fid,
        name: String,
    },
    LookupPath {
        root: Fid,
        path: String,
    },
    Create {
        dir: Fid,
        name: String,
        num_replicas: u32,
    },
    Mkdir {
        dir: Fid,
        name: String,
    },
    Remove {
        dir: Fid,
        name: String,
    },
    Rmdir {
        dir: Fid,
        name: String,
    },
    Readdir {
        dir: Fid,
    },
    Getalloc {
        fid: Fid,
        offset: ChunkOff,
    },
    Getlayout {
        fid: Fid,
    },
    Allocate {
        fid: Fid,
        offset: ChunkOff,
    },
    Truncate {
        fid: Fid,
        offset: u64,
    },
    Rename {
        dir: Fid,
        old_name: String,
        new_name: String,
        overwrite: bool,
    },
    LeaseAcquire {
        chunk_id: ChunkId,
    },
    LeaseRenew {
        chunk_id: ChunkId,
        lease_id: LeaseId,
        lease_type: LeaseType,
    },
    Hello(HelloRequest),
    Ping,
    Stats,
}

impl ClientRequest {
    /// Short op name, used for counters and logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::Lookup { .. } => "lookup",
            ClientRequest::LookupPath { .. } => "lookup_path",
            ClientRequest::Create { .. } => "create",
            ClientRequest::Mkdir { .. } => "mkdir",
            ClientRequest::Remove { .. } => "remove",
            ClientRequest::Rmdir { .. } => "rmdir",
            ClientRequest::Readdir { .. } => "readdir",
            ClientRequest::Getalloc { .. } => "getalloc",
            ClientRequest::Getlayout { .. } => "getlayout",
            ClientRequest::Allocate { .. } => "allocate",
            ClientRequest::Truncate { .. } => "truncate",
            ClientRequest::Rename { .. } => "rename",
            ClientRequest::LeaseAcquire { .. } => "lease_acquire",
            ClientRequest::LeaseRenew { .. } => "lease_renew",
            ClientRequest::Hello(_) => "hello",
            ClientRequest::Ping => "ping",
            ClientRequest::Stats => "stats",
        }
    }
}

fn required_fid(props: &Properties, key: &str) -> Result<Fid> {
    let raw = props.get_num(key, -1i64);
    if raw < 0 {
        return make_error_msg(Errno::EINVAL, format!("missing header {:?}", key));
    }
    Ok(Fid(raw as u64))
}

fn required_str(props: &Properties, key: &str) -> Result<String> {
    match props.get_str(key) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => make_error_msg(Errno::EINVAL, format!("missing header {:?}", key)),
    }
}

fn required_off(props: &Properties, key: &str) -> Result<u64> {
    let raw = props.get_num(key, -1i64);
    if raw < 0 {
        return make_error_msg(Errno::EINVAL, format!("missing header {:?}", key));
    }
    Ok(raw as u64)
}

/// Parse a full command header block (first line plus headers, without the
/// body) into its sequence number and typed request.
pub fn parse_command(msg: &str) -> Result<(Seq, ClientRequest)> {
    let mut lines = msg.splitn(2, '\n');
    let first = lines.next().unwrap_or("");
    let rest = lines.next().unwrap_or("");

    let cmd = first
        .split(|c: char| c == ' ' || c == '\r')
        .next()
        .unwrap_or("");
    let props = Properties::load(rest);
    let cseq: Seq = props.get_num("Cseq", -1i64);

    let req = match cmd {
        "LOOKUP" => ClientRequest::Lookup {
            dir: required_fid(&props, "Parent File-handle")?,
            name: required_str(&props, "Filename")?,
        },
        "LOOKUP_PATH" => ClientRequest::LookupPath {
            root: required_fid(&props, "Root File-handle")?,
            path: required_str(&props, "Pathname")?,
        },
        "CREATE" => {
            let num_replicas = props.get_num("Num-replicas", 1i64);
            if num_replicas == 0 {
                return make_error_msg(Errno::EINVAL, "replication degree 0");
            }
            ClientRequest::Create {
                dir: required_fid(&props, "Parent File-handle")?,
                name: required_str(&props, "Filename")?,
                num_replicas: (num_replicas.max(1) as u32).min(MAX_REPLICAS_PER_FILE),
            }
        }
        "MKDIR" => ClientRequest::Mkdir {
            dir: required_fid(&props, "Parent File-handle")?,
            name: required_str(&props, "Directory")?,
        },
        "REMOVE" => ClientRequest::Remove {
            dir: required_fid(&props, "Parent File-handle")?,
            name: required_str(&props, "Filename")?,
        },
        "RMDIR" => ClientRequest::Rmdir {
            dir: required_fid(&props, "Parent File-handle")?,
            name: required_str(&props, "Directory")?,
        },
        "READDIR" => ClientRequest::Readdir {
            dir: required_fid(&props, "Directory File-handle")?,
        },
        "GETALLOC" => ClientRequest::Getalloc {
            fid: required_fid(&props, "File-handle")?,
            offset: required_off(&props, "Chunk-offset")?,
        },
        "GETLAYOUT" => ClientRequest::Getlayout {
            fid: required_fid(&props, "File-handle")?,
        },
        "ALLOCATE" => ClientRequest::Allocate {
            fid: required_fid(&props, "File-handle")?,
            offset: required_off(&props, "Chunk-offset")?,
        },
        "TRUNCATE" => ClientRequest::Truncate {
            fid: required_fid(&props, "File-handle")?,
            offset: required_off(&props, "Offset")?,
        },
        "RENAME" => ClientRequest::Rename {
            dir: required_fid(&props, "Parent File-handle")?,
            old_name: required_str(&props, "Old-name")?,
            new_name: required_str(&props, "New-path")?,
            overwrite: props.get_num("Overwrite", 0i64) == 1,
        },
        "LEASE_ACQUIRE" => {
            let chunk = props.get_num("Chunk-handle", -1i64);
            if chunk < 0 {
                return make_error_msg(Errno::EINVAL, "missing Chunk-handle");
            }
            ClientRequest::LeaseAcquire {
                chunk_id: ChunkId(chunk as u64),
            }
        }
        "LEASE_RENEW" => {
            let chunk = props.get_num("Chunk-handle", -1i64);
            let lease = props.get_num("Lease-id", -1i64);
            if chunk < 0 || lease < 0 {
                return make_error_msg(Errno::EINVAL, "missing lease headers");
            }
            let lease_type = match props.get_str("Lease-type") {
                Some("WRITE_LEASE") => LeaseType::Write,
                _ => LeaseType::Read,
            };
            ClientRequest::LeaseRenew {
                chunk_id: ChunkId(chunk as u64),
                lease_id: LeaseId(lease as u64),
                lease_type,
            }
        }
        "HELLO" => {
            let location = ServerLocation::new(
                props.get_str("Chunk-server-name").unwrap_or("").to_string(),
                props.get_num("Chunk-server-port", 0i64).max(0) as u16,
            );
            if !location.is_valid() {
                return make_error_msg(Errno::EINVAL, "invalid chunk server location");
            }
            ClientRequest::Hello(HelloRequest {
                location,
                total_space: props.get_num("Total-space", 0i64).max(0) as u64,
                used_space: props.get_num("Used-space", 0i64).max(0) as u64,
                num_chunks: props.get_num("Num-chunks", 0i64).max(0) as usize,
                content_length: props.get_num("Content-length", 0i64).max(0) as usize,
                chunks: Vec::new(),
            })
        }
        "PING" => ClientRequest::Ping,
        "STATS" => ClientRequest::Stats,
        _ => return make_error(Errno::ENOSYS),
    };

    Ok((cseq, req))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lookup() {
        let msg = "LOOKUP \r\nCseq: 7\r\nParent File-handle: 2\r\nFilename: a\r\n";
        let (cseq, req) = parse_command(msg).unwrap();
        assert_eq!(cseq, 7);
        match req {
            ClientRequest::Lookup { dir, name } => {
                assert_eq!(dir, Fid(2));
                assert_eq!(name, "a");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_create_clamps_replicas() {
        let msg =
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\nNum-replicas: 10\r\n";
        let (_, req) = parse_command(msg).unwrap();
        match req {
            ClientRequest::Create { num_replicas, .. } => {
                assert_eq!(num_replicas, MAX_REPLICAS_PER_FILE)
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_create_rejects_zero_replicas() {
        let msg =
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\nNum-replicas: 0\r\n";
        assert!(parse_command(msg).is_err());
    }

    #[test]
    fn test_parse_create_defaults_to_one_replica() {
        let msg = "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\n";
        let (_, req) = parse_command(msg).unwrap();
        match req {
            ClientRequest::Create { num_replicas, .. } => assert_eq!(num_replicas, 1),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_parent_fails() {
        let msg = "LOOKUP\r\nCseq: 1\r\nFilename: a\r\n";
        assert!(parse_command(msg).is_err());
    }

    #[test]
    fn test_parse_unknown_command() {
        let err = parse_command("FROBNICATE\r\nCseq: 1\r\n").unwrap_err();
        assert_eq!(err.code(), Errno::ENOSYS);
    }

    #[test]
    fn test_parse_rename_overwrite_flag() {
        let msg = "RENAME\r\nCseq: 5\r\nParent File-handle: 2\r\nOld-name: a\r\nNew-path: b\r\nOverwrite: 1\r\n";
        let (_, req) = parse_command(msg).unwrap();
        match req {
            ClientRequest::Rename {
                overwrite,
                old_name,
                new_name,
                ..
            } => {
                assert!(overwrite);
                assert_eq!(old_name, "a");
                assert_eq!(new_name, "b");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_lease_renew_defaults_to_read() {
        let msg = "LEASE_RENEW\r\nCseq: 2\r\nChunk-handle: 9\r\nLease-id: 4\r\n";
        let (_, req) = parse_command(msg).unwrap();
        match req {
            ClientRequest::LeaseRenew { lease_type, .. } => {
                assert_eq!(lease_type, LeaseType::Read)
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_hello_and_body() {
        let msg = "HELLO\r\nCseq: 3\r\nChunk-server-name: cs1\r\nChunk-server-port: 20000\r\n\
                   Total-space: 1000\r\nUsed-space: 100\r\nNum-chunks: 2\r\nContent-length: 9\r\n";
        let (_, req) = parse_command(msg).unwrap();
        let mut hello = match req {
            ClientRequest::Hello(h) => h,
            other => panic!("unexpected request: {:?}", other),
        };
        assert_eq!(hello.location.id(), "cs1:20000");
        assert_eq!(hello.num_chunks, 2);

        hello.parse_body("17 23:4 ").unwrap();
        assert_eq!(hello.chunks, vec![(ChunkId(17), None), (ChunkId(23), Some(4))]);
    }

    #[test]
    fn test_parse_hello_rejects_bad_location() {
        let msg = "HELLO\r\nCseq: 3\r\nChunk-server-name: cs1\r\n";
        assert!(parse_command(msg).is_err());
    }

    #[test]
    fn test_hello_body_rejects_garbage() {
        let msg = "HELLO\r\nCseq: 3\r\nChunk-server-name: cs1\r\nChunk-server-port: 1\r\n";
        let (_, req) = parse_command(msg).unwrap();
        let mut hello = match req {
            ClientRequest::Hello(h) => h,
            _ => unreachable!(),
        };
        assert!(hello.parse_body("12 notanumber").is_err());
    }
}
