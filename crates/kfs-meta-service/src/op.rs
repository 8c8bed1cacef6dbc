//! Typed operations flowing through the request processor.
//!
//! Each operation is a variant carrying both its parsed inputs and the
//! fields it needs to resume after a suspension (servers, chunk id, version
//! for an allocation). Resume events are delivered on the processor queue
//! tagged with the op handle.

use std::sync::Arc;

use kfs_layout::{ChunkServer, OpId};
use kfs_proto::request::HelloRequest;
use kfs_proto::response::{self, ChunkLayoutInfo, FattrSummary};
use kfs_proto::LeaseType;
use kfs_types::{
    ChunkId, ChunkOff, ChunkVersion, Fid, LeaseId, Seq, ServerLocation,
};

/// Channel on which the finished response text is handed back to the
/// connection that submitted the op.
pub type Responder = tokio::sync::oneshot::Sender<String>;

/// Everything the processor consumes from its queue.
pub enum Event {
    Submit(Box<MetaRequest>),
    /// Re-enter a suspended op's handler. `status` is 0 on success or a
    /// negative wire status describing the failure.
    Resume { op_id: OpId, status: i32 },
    /// A chunk-server RPC reply arrived.
    RpcReply {
        server_id: String,
        seq: Seq,
        ok: bool,
    },
    Shutdown,
}

/// State carried by an allocation across its suspensions.
pub struct AllocateOp {
    pub fid: Fid,
    pub offset: ChunkOff,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub servers: Vec<String>,
    pub master: String,
    pub lease_id: Option<LeaseId>,
    /// Set by the resume that carries the chunk-server ack outcome.
    pub layout_done: bool,
    pub rpc_ok: bool,
    /// Failure path: waiting for the incarnation bump to become durable.
    pub awaiting_inc: bool,
    /// Internal sub-op of a truncate; resume the parent on completion.
    pub for_truncate: Option<OpId>,
}

impl AllocateOp {
    pub fn new(fid: Fid, offset: ChunkOff) -> Self {
        Self {
            fid,
            offset,
            chunk_id: ChunkId(0),
            version: ChunkVersion(0),
            servers: Vec::new(),
            master: String::new(),
            lease_id: None,
            layout_done: false,
            rpc_ok: false,
            awaiting_inc: false,
            for_truncate: None,
        }
    }
}

pub enum OpBody {
    Lookup {
        dir: Fid,
        name: String,
        result: Option<FattrSummary>,
    },
    LookupPath {
        root: Fid,
        path: String,
        result: Option<FattrSummary>,
    },
    Create {
        dir: Fid,
        name: String,
        num_replicas: u32,
        fid: Fid,
    },
    Mkdir {
        dir: Fid,
        name: String,
        fid: Fid,
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
        names: Vec<String>,
    },
    Getalloc {
        fid: Fid,
        offset: ChunkOff,
        chunk_id: ChunkId,
        version: ChunkVersion,
        locations: Vec<ServerLocation>,
    },
    Getlayout {
        fid: Fid,
        chunks: Vec<ChunkLayoutInfo>,
    },
    Allocate(AllocateOp),
    Truncate {
        fid: Fid,
        offset: u64,
        /// Status delivered by the resume of an internal allocate sub-op.
        alloc_status: Option<i32>,
    },
    Rename {
        dir: Fid,
        old_name: String,
        new_name: String,
        overwrite: bool,
    },
    LeaseAcquire {
        chunk_id: ChunkId,
        lease_id: Option<LeaseId>,
    },
    LeaseRenew {
        chunk_id: ChunkId,
        lease_id: LeaseId,
        lease_type: LeaseType,
    },
    Hello {
        hello: HelloRequest,
        /// Lets the accepting connection take over the registered session.
        session: Option<tokio::sync::oneshot::Sender<Arc<ChunkServer>>>,
    },
    /// Connection to a chunk server was lost.
    Bye {
        server_id: String,
    },
    Ping {
        servers: String,
    },
    Stats {
        table: String,
    },
    /// Periodic internal ops submitted by the timers.
    LeaseCleanup,
    ReplicationCheck,
    HeartbeatCheck,
    Checkpoint,
    /// Persist a bumped `chunkVersionInc`; resumes `dependent` once durable.
    ChunkVersionInc {
        value: u64,
        dependent: Option<OpId>,
    },
}

impl OpBody {
    /// Build the op for a parsed client command. HELLO ops get their session
    /// channel attached by the connection handler afterwards.
    pub fn from_client(req: kfs_proto::ClientRequest) -> OpBody {
        use kfs_proto::ClientRequest as C;
        match req {
            C::Lookup { dir, name } => OpBody::Lookup {
                dir,
                name,
                result: None,
            },
            C::LookupPath { root, path } => OpBody::LookupPath {
                root,
                path,
                result: None,
            },
            C::Create {
                dir,
                name,
                num_replicas,
            } => OpBody::Create {
                dir,
                name,
                num_replicas,
                fid: Fid(0),
            },
            C::Mkdir { dir, name } => OpBody::Mkdir {
                dir,
                name,
                fid: Fid(0),
            },
            C::Remove { dir, name } => OpBody::Remove { dir, name },
            C::Rmdir { dir, name } => OpBody::Rmdir { dir, name },
            C::Readdir { dir } => OpBody::Readdir {
                dir,
                names: Vec::new(),
            },
            C::Getalloc { fid, offset } => OpBody::Getalloc {
                fid,
                offset,
                chunk_id: ChunkId(0),
                version: ChunkVersion(0),
                locations: Vec::new(),
            },
            C::Getlayout { fid } => OpBody::Getlayout {
                fid,
                chunks: Vec::new(),
            },
            C::Allocate { fid, offset } => OpBody::Allocate(AllocateOp::new(fid, offset)),
            C::Truncate { fid, offset } => OpBody::Truncate {
                fid,
                offset,
                alloc_status: None,
            },
            C::Rename {
                dir,
                old_name,
                new_name,
                overwrite,
            } => OpBody::Rename {
                dir,
                old_name,
                new_name,
                overwrite,
            },
            C::LeaseAcquire { chunk_id } => OpBody::LeaseAcquire {
                chunk_id,
                lease_id: None,
            },
            C::LeaseRenew {
                chunk_id,
                lease_id,
                lease_type,
            } => OpBody::LeaseRenew {
                chunk_id,
                lease_id,
                lease_type,
            },
            C::Hello(hello) => OpBody::Hello {
                hello,
                session: None,
            },
            C::Ping => OpBody::Ping {
                servers: String::new(),
            },
            C::Stats => OpBody::Stats {
                table: String::new(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpBody::Lookup { .. } => "lookup",
            OpBody::LookupPath { .. } => "lookup_path",
            OpBody::Create { .. } => "create",
            OpBody::Mkdir { .. } => "mkdir",
            OpBody::Remove { .. } => "remove",
            OpBody::Rmdir { .. } => "rmdir",
            OpBody::Readdir { .. } => "readdir",
            OpBody::Getalloc { .. } => "getalloc",
            OpBody::Getlayout { .. } => "getlayout",
            OpBody::Allocate(_) => "allocate",
            OpBody::Truncate { .. } => "truncate",
            OpBody::Rename { .. } => "rename",
            OpBody::LeaseAcquire { .. } => "lease_acquire",
            OpBody::LeaseRenew { .. } => "lease_renew",
            OpBody::Hello { .. } => "hello",
            OpBody::Bye { .. } => "bye",
            OpBody::Ping { .. } => "ping",
            OpBody::Stats { .. } => "stats",
            OpBody::LeaseCleanup => "lease_cleanup",
            OpBody::ReplicationCheck => "replication_check",
            OpBody::HeartbeatCheck => "heartbeat_check",
            OpBody::Checkpoint => "checkpoint",
            OpBody::ChunkVersionInc { .. } => "chunk_version_inc",
        }
    }
}

/// One request travelling through the processor.
pub struct MetaRequest {
    pub id: OpId,
    pub cseq: Seq,
    /// Wire status: 0 on success, negative code on failure.
    pub status: i32,
    pub suspended: bool,
    pub body: OpBody,
    pub responder: Option<Responder>,
}

impl MetaRequest {
    pub fn new(id: OpId, cseq: Seq, body: OpBody, responder: Option<Responder>) -> Self {
        Self {
            id,
            cseq,
            status: 0,
            suspended: false,
            body,
            responder,
        }
    }

    /// The oplog line for this op, if it mutated the namespace. Only emitted
    /// when the op succeeded.
    pub fn log_line(&self) -> Option<String> {
        if self.status != 0 {
            return None;
        }
        match &self.body {
            OpBody::Create {
                dir,
                name,
                num_replicas,
                fid,
            } => Some(format!(
                "create/dir/{}/name/{}/id/{}/numReplicas/{}",
                dir, name, fid, num_replicas
            )),
            OpBody::Mkdir { dir, name, fid } => {
                Some(format!("mkdir/dir/{}/name/{}/id/{}", dir, name, fid))
            }
            OpBody::Remove { dir, name } => Some(format!("remove/dir/{}/name/{}", dir, name)),
            OpBody::Rmdir { dir, name } => Some(format!("rmdir/dir/{}/name/{}", dir, name)),
            OpBody::Rename {
                dir,
                old_name,
                new_name,
                ..
            } => Some(format!(
                "rename/dir/{}/old/{}/new/{}",
                dir, old_name, new_name
            )),
            OpBody::Allocate(a) => Some(format!(
                "allocate/file/{}/offset/{}/chunkId/{}/chunkVersion/{}",
                a.fid, a.offset, a.chunk_id, a.version
            )),
            OpBody::Truncate { fid, offset, .. } => {
                Some(format!("truncate/file/{}/offset/{}", fid, offset))
            }
            OpBody::ChunkVersionInc { value, .. } => {
                Some(format!("chunkVersionInc/{}", value))
            }
            _ => None,
        }
    }

    /// Render the client response, if this op has one.
    pub fn response(&self) -> Option<String> {
        let cseq = self.cseq;
        let status = self.status;
        match &self.body {
            OpBody::Lookup { result, .. } | OpBody::LookupPath { result, .. } => {
                Some(response::fattr(cseq, status, result.as_ref()))
            }
            OpBody::Create { fid, .. } | OpBody::Mkdir { fid, .. } => {
                Some(response::created(cseq, status, *fid))
            }
            OpBody::Remove { .. }
            | OpBody::Rmdir { .. }
            | OpBody::Rename { .. }
            | OpBody::Truncate { .. }
            | OpBody::LeaseRenew { .. } => Some(response::status_only(cseq, status)),
            OpBody::Readdir { names, .. } => Some(response::readdir(cseq, status, names)),
            OpBody::Getalloc {
                chunk_id,
                version,
                locations,
                ..
            } => Some(response::getalloc(cseq, status, *chunk_id, *version, locations)),
            OpBody::Getlayout { chunks, .. } => {
                Some(response::getlayout(cseq, status, chunks))
            }
            OpBody::Allocate(a) => {
                // Sub-ops of a truncate answer through their parent.
                if a.for_truncate.is_some() {
                    None
                } else {
                    Some(response::allocate(
                        cseq,
                        status,
                        a.chunk_id,
                        a.version,
                        &a.master,
                        &a.servers,
                    ))
                }
            }
            OpBody::LeaseAcquire { lease_id, .. } => {
                Some(response::lease_acquire(cseq, status, *lease_id))
            }
            OpBody::Ping { servers } => Some(response::ping(cseq, status, servers)),
            OpBody::Stats { table } => Some(response::stats(cseq, status, table)),
            OpBody::Hello { .. }
            | OpBody::Bye { .. }
            | OpBody::LeaseCleanup
            | OpBody::ReplicationCheck
            | OpBody::HeartbeatCheck
            | OpBody::Checkpoint
            | OpBody::ChunkVersionInc { .. } => None,
        }
    }
}

/// What the oplog writer does once an op's entry is durable.
pub struct Finish {
    /// `(channel, response text, cseq)`; the cseq lets the writer synthesize
    /// an EIO response if the flush itself fails.
    pub respond: Option<(Responder, String, Seq)>,
    /// Resume a dependent op with this status.
    pub resume: Option<(OpId, i32)>,
    /// Rotate the log before finishing (the checkpoint op).
    pub rotate: bool,
}

impl Finish {
    pub fn none() -> Self {
        Self {
            respond: None,
            resume: None,
            rotate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_create() {
        let req = MetaRequest::new(
            1,
            5,
            OpBody::Create {
                dir: Fid(2),
                name: "a".into(),
                num_replicas: 3,
                fid: Fid(7),
            },
            None,
        );
        assert_eq!(
            req.log_line().unwrap(),
            "create/dir/2/name/a/id/7/numReplicas/3"
        );
    }

    #[test]
    fn test_failed_op_logs_nothing() {
        let mut req = MetaRequest::new(
            1,
            5,
            OpBody::Remove {
                dir: Fid(2),
                name: "a".into(),
            },
            None,
        );
        req.status = -2;
        assert!(req.log_line().is_none());
    }

    #[test]
    fn test_read_only_op_logs_nothing() {
        let req = MetaRequest::new(
            1,
            5,
            OpBody::Lookup {
                dir: Fid(2),
                name: "a".into(),
                result: None,
            },
            None,
        );
        assert!(req.log_line().is_none());
        assert!(req.response().is_some());
    }

    #[test]
    fn test_chunk_version_inc_line() {
        let req = MetaRequest::new(
            1,
            -1,
            OpBody::ChunkVersionInc {
                value: 4,
                dependent: None,
            },
            None,
        );
        assert_eq!(req.log_line().unwrap(), "chunkVersionInc/4");
        assert!(req.response().is_none());
    }

    #[test]
    fn test_truncate_sub_alloc_has_no_response() {
        let mut alloc = AllocateOp::new(Fid(3), 0);
        alloc.for_truncate = Some(9);
        let req = MetaRequest::new(2, 5, OpBody::Allocate(alloc), None);
        assert!(req.response().is_none());
    }

    #[test]
    fn test_allocate_log_line() {
        let mut alloc = AllocateOp::new(Fid(3), 67108864);
        alloc.chunk_id = ChunkId(12);
        alloc.version = ChunkVersion(2);
        let req = MetaRequest::new(2, 5, OpBody::Allocate(alloc), None);
        assert_eq!(
            req.log_line().unwrap(),
            "allocate/file/3/offset/67108864/chunkId/12/chunkVersion/2"
        );
    }
}
