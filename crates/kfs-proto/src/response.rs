//! Response rendering for the text protocol.
//!
//! All responses share a shape: `OK\r\n`, `Cseq`, `Status`, kind-specific
//! headers, blank line, optional body. `status` is the wire value: 0 on
//! success, the negated status code on failure.

use std::fmt::Write as _;

use kfs_types::{ChunkId, ChunkOff, ChunkVersion, Fid, FileKind, LeaseId, Seq, ServerLocation};

/// The attribute fields sent back for lookup-style operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FattrSummary {
    pub fid: Fid,
    pub kind: FileKind,
    pub chunk_count: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub crtime: i64,
}

/// Layout of one chunk as reported by GETLAYOUT.
#[derive(Debug, Clone)]
pub struct ChunkLayoutInfo {
    pub offset: ChunkOff,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub locations: Vec<ServerLocation>,
}

impl ChunkLayoutInfo {
    /// One body line: offset, chunk id, version, replica count, then
    /// `host port` pairs.
    pub fn to_line(&self) -> String {
        let mut s = format!(
            "{} {} {} {}",
            self.offset,
            self.chunk_id,
            self.version,
            self.locations.len()
        );
        for loc in &self.locations {
            let _ = write!(s, " {}", loc);
        }
        s.push('\n');
        s
    }
}

fn header(cseq: Seq, status: i32) -> String {
    format!("OK\r\nCseq: {}\r\nStatus: {}\r\n", cseq, status)
}

/// Response with no kind-specific headers.
pub fn status_only(cseq: Seq, status: i32) -> String {
    let mut os = header(cseq, status);
    os.push_str("\r\n");
    os
}

/// Response for LOOKUP / LOOKUP_PATH.
pub fn fattr(cseq: Seq, status: i32, attr: Option<&FattrSummary>) -> String {
    let mut os = header(cseq, status);
    let attr = match (status, attr) {
        (s, Some(attr)) if s >= 0 => attr,
        _ => {
            os.push_str("\r\n");
            return os;
        }
    };
    let _ = write!(os, "File-handle: {}\r\n", attr.fid);
    let _ = write!(os, "Type: {}\r\n", attr.kind);
    let _ = write!(os, "Chunk-count: {}\r\n", attr.chunk_count);
    let _ = write!(os, "M-Time: {}\r\n", attr.mtime);
    let _ = write!(os, "C-Time: {}\r\n", attr.ctime);
    let _ = write!(os, "CR-Time: {}\r\n\r\n", attr.crtime);
    os
}

/// Response for CREATE / MKDIR.
pub fn created(cseq: Seq, status: i32, fid: Fid) -> String {
    let mut os = header(cseq, status);
    if status < 0 {
        os.push_str("\r\n");
        return os;
    }
    let _ = write!(os, "File-handle: {}\r\n\r\n", fid);
    os
}

/// Response for READDIR: one name per body line.
pub fn readdir(cseq: Seq, status: i32, names: &[String]) -> String {
    let mut os = header(cseq, status);
    if status < 0 {
        os.push_str("\r\n");
        return os;
    }
    let mut body = String::new();
    for name in names {
        body.push_str(name);
        body.push('\n');
    }
    let _ = write!(os, "Num-Entries: {}\r\n", names.len());
    let _ = write!(os, "Content-length: {}\r\n\r\n", body.len());
    os.push_str(&body);
    os
}

/// Response for GETALLOC.
pub fn getalloc(
    cseq: Seq,
    status: i32,
    chunk_id: ChunkId,
    version: ChunkVersion,
    locations: &[ServerLocation],
) -> String {
    let mut os = header(cseq, status);
    if status < 0 {
        os.push_str("\r\n");
        return os;
    }
    let _ = write!(os, "Chunk-handle: {}\r\n", chunk_id);
    let _ = write!(os, "Chunk-version: {}\r\n", version);
    let _ = write!(os, "Num-replicas: {}\r\n", locations.len());
    os.push_str("Replicas:");
    for loc in locations {
        let _ = write!(os, " {}", loc);
    }
    os.push_str("\r\n\r\n");
    os
}

/// Response for GETLAYOUT: one [`ChunkLayoutInfo`] line per chunk, in offset
/// order.
pub fn getlayout(cseq: Seq, status: i32, chunks: &[ChunkLayoutInfo]) -> String {
    let mut os = header(cseq, status);
    if status < 0 {
        os.push_str("\r\n");
        return os;
    }
    let mut body = String::new();
    for c in chunks {
        body.push_str(&c.to_line());
    }
    let _ = write!(os, "Num-chunks: {}\r\n", chunks.len());
    let _ = write!(os, "Content-length: {}\r\n\r\n", body.len());
    os.push_str(&body);
    os
}

/// Response for ALLOCATE. The master and replicas are reported by their
/// `host:port` identities.
pub fn allocate(
    cseq: Seq,
    status: i32,
    chunk_id: ChunkId,
    version: ChunkVersion,
    master: &str,
    replicas: &[String],
) -> String {
    let mut os = header(cseq, status);
    if status < 0 {
        os.push_str("\r\n");
        return os;
    }
    let _ = write!(os, "Chunk-handle: {}\r\n", chunk_id);
    let _ = write!(os, "Chunk-version: {}\r\n", version);
    let _ = write!(os, "Master: {}\r\n", master);
    let _ = write!(os, "Num-replicas: {}\r\n", replicas.len());
    os.push_str("Replicas:");
    for r in replicas {
        let _ = write!(os, " {}", r);
    }
    os.push_str("\r\n\r\n");
    os
}

/// Response for LEASE_ACQUIRE.
pub fn lease_acquire(cseq: Seq, status: i32, lease_id: Option<LeaseId>) -> String {
    let mut os = header(cseq, status);
    if status >= 0 {
        if let Some(id) = lease_id {
            let _ = write!(os, "Lease-id: {}\r\n", id);
        }
    }
    os.push_str("\r\n");
    os
}

/// Response for PING: the live server list.
pub fn ping(cseq: Seq, status: i32, servers: &str) -> String {
    let mut os = header(cseq, status);
    let _ = write!(os, "Servers: {}\r\n\r\n", servers);
    os
}

/// Response for STATS: the counter table as the body.
pub fn stats(cseq: Seq, status: i32, table: &str) -> String {
    let mut os = header(cseq, status);
    os.push_str(table);
    os.push_str("\r\n");
    os
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_shape() {
        let rsp = status_only(9, -2);
        assert_eq!(rsp, "OK\r\nCseq: 9\r\nStatus: -2\r\n\r\n");
    }

    #[test]
    fn test_fattr_success() {
        let attr = FattrSummary {
            fid: Fid(17),
            kind: FileKind::File,
            chunk_count: 3,
            mtime: 100,
            ctime: 100,
            crtime: 90,
        };
        let rsp = fattr(1, 0, Some(&attr));
        assert!(rsp.contains("File-handle: 17\r\n"));
        assert!(rsp.contains("Type: file\r\n"));
        assert!(rsp.contains("Chunk-count: 3\r\n"));
        assert!(rsp.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_fattr_failure_has_no_attrs() {
        let rsp = fattr(1, -2, None);
        assert_eq!(rsp, "OK\r\nCseq: 1\r\nStatus: -2\r\n\r\n");
    }

    #[test]
    fn test_readdir_body() {
        let rsp = readdir(4, 0, &["a".to_string(), "b".to_string()]);
        assert!(rsp.contains("Num-Entries: 2\r\n"));
        assert!(rsp.contains("Content-length: 4\r\n"));
        assert!(rsp.ends_with("\r\n\r\na\nb\n"));
    }

    #[test]
    fn test_getalloc_replica_list() {
        let locs = vec![
            ServerLocation::new("cs1", 1000),
            ServerLocation::new("cs2", 1001),
        ];
        let rsp = getalloc(2, 0, ChunkId(5), ChunkVersion(1), &locs);
        assert!(rsp.contains("Chunk-handle: 5\r\n"));
        assert!(rsp.contains("Chunk-version: 1\r\n"));
        assert!(rsp.contains("Num-replicas: 2\r\n"));
        assert!(rsp.contains("Replicas: cs1 1000 cs2 1001\r\n"));
    }

    #[test]
    fn test_allocate_names_master() {
        let rsp = allocate(
            3,
            0,
            ChunkId(8),
            ChunkVersion(2),
            "cs1:1000",
            &["cs1:1000".to_string(), "cs2:1001".to_string()],
        );
        assert!(rsp.contains("Master: cs1:1000\r\n"));
        assert!(rsp.contains("Replicas: cs1:1000 cs2:1001\r\n"));
    }

    #[test]
    fn test_layout_line() {
        let info = ChunkLayoutInfo {
            offset: 0,
            chunk_id: ChunkId(11),
            version: ChunkVersion(1),
            locations: vec![ServerLocation::new("cs1", 1000)],
        };
        assert_eq!(info.to_line(), "0 11 1 1 cs1 1000\n");
    }

    #[test]
    fn test_lease_acquire_success_and_failure() {
        let ok = lease_acquire(1, 0, Some(LeaseId(6)));
        assert!(ok.contains("Lease-id: 6\r\n"));
        let fail = lease_acquire(1, -1004, None);
        assert!(!fail.contains("Lease-id"));
    }
}
