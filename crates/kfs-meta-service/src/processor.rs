//! The request processor: a single-threaded cooperative dispatcher.
//!
//! Ops are dequeued one at a time and dispatched by kind. A handler that
//! must wait on chunk-server RPCs sets the op's `suspended` flag; the op is
//! parked in the pending table and re-entered when its resume event arrives
//! on the same queue. Completed ops flow to the oplog writer, which sends
//! the response only after the log entry is durable.
//!
//! All tree and layout state is touched only from this thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kfs_layout::layout_manager::{ReplyOutcome, WriteLeaseState};
use kfs_layout::{LayoutManager, OpId};
use kfs_meta_tree::{AllocOutcome, FileAttr, TruncateOutcome};
use kfs_proto::response::{ChunkLayoutInfo, FattrSummary};
use kfs_types::{ChunkVersion, Errno, KfsCode, ROOT_FID};

use crate::checkpoint::{Checkpointer, SharedTree};
use crate::counters::OpCounters;
use crate::op::{AllocateOp, Event, Finish, MetaRequest, OpBody};
use crate::oplog::{LogItem, OpLog};
use crate::queue::MetaQueue;

pub struct Processor {
    tree: SharedTree,
    layout: LayoutManager,
    oplog: Arc<OpLog>,
    cp: Arc<Checkpointer>,
    queue: Arc<MetaQueue<Event>>,
    counters: OpCounters,
    pending: HashMap<OpId, Box<MetaRequest>>,
    deadlines: HashMap<OpId, i64>,
    next_op_id: Arc<AtomicU64>,
    op_timeout_secs: i64,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn summary(fa: &FileAttr) -> FattrSummary {
    FattrSummary {
        fid: fa.fid,
        kind: fa.kind,
        chunk_count: fa.chunk_count,
        mtime: fa.mtime,
        ctime: fa.ctime,
        crtime: fa.crtime,
    }
}

impl Processor {
    pub fn new(
        tree: SharedTree,
        layout: LayoutManager,
        oplog: Arc<OpLog>,
        cp: Arc<Checkpointer>,
        queue: Arc<MetaQueue<Event>>,
        next_op_id: Arc<AtomicU64>,
        op_timeout_secs: i64,
    ) -> Self {
        Self {
            tree,
            layout,
            oplog,
            cp,
            queue,
            counters: OpCounters::new(),
            pending: HashMap::new(),
            deadlines: HashMap::new(),
            next_op_id,
            op_timeout_secs,
        }
    }

    pub fn layout(&mut self) -> &mut LayoutManager {
        &mut self.layout
    }

    pub fn start(mut self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("request-processor".to_string())
            .spawn(move || self.run())
            .expect("spawn request processor")
    }

    pub fn run(&mut self) {
        loop {
            let event = self.queue.dequeue();
            if !self.handle_event(event) {
                return;
            }
        }
    }

    /// Process at most one event; used by tests to drive the loop inline.
    pub fn poll(&mut self, timeout: Duration) -> bool {
        if let Some(event) = self.queue.dequeue_timeout(timeout) {
            self.handle_event(event);
            true
        } else {
            false
        }
    }

    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Submit(req) => self.dispatch(req),
            Event::Resume { op_id, status } => self.resume(op_id, status),
            Event::RpcReply {
                server_id,
                seq,
                ok,
            } => {
                match self.layout.rpc_reply(&server_id, seq, ok, now()) {
                    ReplyOutcome::OpComplete { op_id, failed } => {
                        self.resume(op_id, if failed { -Errno::EIO } else { 0 });
                    }
                    ReplyOutcome::Unmatched => {
                        tracing::debug!(server = %server_id, seq, "unmatched rpc reply");
                    }
                    _ => {}
                }
                true
            }
            Event::Shutdown => false,
        }
    }

    fn next_id(&self) -> OpId {
        self.next_op_id.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(&mut self, mut req: Box<MetaRequest>) -> bool {
        self.handle(&mut req);
        if req.suspended {
            self.deadlines
                .insert(req.id, now() + self.op_timeout_secs);
            self.pending.insert(req.id, req);
        } else {
            self.finish(req);
        }
        true
    }

    /// Re-enter a suspended op with its resume context.
    fn resume(&mut self, op_id: OpId, status: i32) -> bool {
        let Some(mut req) = self.pending.remove(&op_id) else {
            tracing::debug!(op_id, "resume for unknown op");
            return true;
        };
        self.deadlines.remove(&op_id);
        req.suspended = false;
        match &mut req.body {
            OpBody::Allocate(a) => {
                if !a.awaiting_inc {
                    a.layout_done = true;
                    a.rpc_ok = status == 0;
                }
            }
            OpBody::Truncate { alloc_status, .. } => *alloc_status = Some(status),
            _ => {}
        }
        self.dispatch(req)
    }

    fn is_mutating(body: &OpBody) -> bool {
        matches!(
            body,
            OpBody::Create { .. }
                | OpBody::Mkdir { .. }
                | OpBody::Remove { .. }
                | OpBody::Rmdir { .. }
                | OpBody::Rename { .. }
                | OpBody::Allocate(_)
                | OpBody::Truncate { .. }
        )
    }

    fn handle(&mut self, req: &mut MetaRequest) {
        // A failed oplog halts new mutations; reads continue.
        if self.oplog.has_failed() && Self::is_mutating(&req.body) {
            req.status = -Errno::EIO;
            return;
        }
        // The multi-stage handlers need the whole request.
        if matches!(req.body, OpBody::Allocate(_)) {
            return self.handle_allocate(req);
        }
        if matches!(req.body, OpBody::Truncate { .. }) {
            return self.handle_truncate(req);
        }
        let now = now();
        match &mut req.body {
            OpBody::Lookup { dir, name, result } => {
                match self.tree.read().lookup(*dir, name) {
                    Ok(fa) => *result = Some(summary(&fa)),
                    Err(st) => req.status = st.wire_status(),
                }
            }
            OpBody::LookupPath { root, path, result } => {
                match self.tree.read().lookup_path(*root, path) {
                    Ok(fa) => *result = Some(summary(&fa)),
                    Err(st) => req.status = st.wire_status(),
                }
            }
            OpBody::Create {
                dir,
                name,
                num_replicas,
                fid,
            } => match self.tree.write().create(*dir, name, *num_replicas, now) {
                Ok(new_fid) => *fid = new_fid,
                Err(st) => req.status = st.wire_status(),
            },
            OpBody::Mkdir { dir, name, fid } => {
                match self.tree.write().mkdir(*dir, name, now) {
                    Ok(new_fid) => *fid = new_fid,
                    Err(st) => req.status = st.wire_status(),
                }
            }
            OpBody::Remove { dir, name } => {
                if let Err(st) = self.tree.write().remove(*dir, name, now) {
                    req.status = st.wire_status();
                }
            }
            OpBody::Rmdir { dir, name } => {
                if let Err(st) = self.tree.write().rmdir(*dir, name, now) {
                    req.status = st.wire_status();
                }
            }
            OpBody::Readdir { dir, names } => match self.tree.read().readdir(*dir) {
                Ok(entries) => {
                    // The root's self-entry is not reported.
                    *names = entries
                        .into_iter()
                        .filter(|de| !(*dir == ROOT_FID && de.name == "/"))
                        .map(|de| de.name)
                        .collect();
                }
                Err(st) => req.status = st.wire_status(),
            },
            OpBody::Getalloc {
                fid,
                offset,
                chunk_id,
                version,
                locations,
            } => match self.tree.read().getalloc(*fid, *offset) {
                Ok(ci) => {
                    let locs = self.layout.chunk_locations(ci.chunk_id);
                    if locs.is_empty() {
                        req.status = -Errno::ENOENT;
                    } else {
                        *chunk_id = ci.chunk_id;
                        *version = ci.version;
                        *locations = locs;
                    }
                }
                Err(st) => req.status = st.wire_status(),
            },
            OpBody::Getlayout { fid, chunks } => {
                match self.tree.read().getalloc_all(*fid) {
                    Ok(infos) => {
                        for ci in infos {
                            let locs = self.layout.chunk_locations(ci.chunk_id);
                            if locs.is_empty() {
                                req.status = -Errno::EHOSTUNREACH;
                                chunks.clear();
                                break;
                            }
                            chunks.push(ChunkLayoutInfo {
                                offset: ci.offset,
                                chunk_id: ci.chunk_id,
                                version: ci.version,
                                locations: locs,
                            });
                        }
                    }
                    Err(st) => req.status = st.wire_status(),
                }
            }
            // Handled above.
            OpBody::Allocate(_) | OpBody::Truncate { .. } => {}
            OpBody::Rename {
                dir,
                old_name,
                new_name,
                overwrite,
            } => {
                if let Err(st) =
                    self.tree
                        .write()
                        .rename(*dir, old_name, new_name, *overwrite, now)
                {
                    req.status = st.wire_status();
                }
            }
            OpBody::LeaseAcquire { chunk_id, lease_id } => {
                match self.layout.get_chunk_read_lease(*chunk_id, now) {
                    Ok(id) => *lease_id = Some(id),
                    Err(st) => req.status = st.wire_status(),
                }
            }
            OpBody::LeaseRenew {
                chunk_id,
                lease_id,
                lease_type,
            } => {
                if let Err(st) = self.layout.lease_renew(*chunk_id, *lease_id, *lease_type, now)
                {
                    req.status = st.wire_status();
                }
            }
            OpBody::Hello { hello, session } => {
                let cs = self.layout.add_new_server(hello, now);
                if let Some(tx) = session.take() {
                    let _ = tx.send(cs);
                }
            }
            OpBody::Bye { server_id } => {
                let (requeued, completions) = self.layout.server_down(server_id);
                if !requeued.is_empty() {
                    tracing::info!(
                        server = %server_id,
                        chunks = requeued.len(),
                        "chunks queued for re-replication"
                    );
                }
                for outcome in completions {
                    if let ReplyOutcome::OpComplete { op_id, .. } = outcome {
                        self.queue.enqueue(Event::Resume {
                            op_id,
                            status: -Errno::EIO,
                        });
                    }
                }
            }
            OpBody::Ping { servers } => {
                *servers = self.layout.ping_servers();
            }
            OpBody::Stats { table } => {
                *table = self.counters.render();
            }
            OpBody::LeaseCleanup => {
                let reclaimed = self.layout.lease_cleanup(now);
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, "expired leases reclaimed");
                }
                let doomed = self.tree.write().drain_dumpster();
                for ci in doomed {
                    self.layout.delete_chunk(ci.chunk_id);
                }
                self.expire_suspended(now);
            }
            OpBody::ReplicationCheck => {
                let (replicated, deleted) = self.layout.chunk_replication_check();
                if replicated > 0 || deleted > 0 {
                    tracing::info!(replicated, deleted, "replication sweep");
                }
            }
            OpBody::HeartbeatCheck => {
                for id in self.layout.heartbeat_tick(now) {
                    let (_, completions) = self.layout.server_down(&id);
                    for outcome in completions {
                        if let ReplyOutcome::OpComplete { op_id, .. } = outcome {
                            self.queue.enqueue(Event::Resume {
                                op_id,
                                status: -Errno::EIO,
                            });
                        }
                    }
                }
            }
            OpBody::Checkpoint => {}
            OpBody::ChunkVersionInc { .. } => {}
        }
    }

    fn handle_allocate(&mut self, req: &mut MetaRequest) {
        let now = now();
        let op_id = req.id;
        let OpBody::Allocate(a) = &mut req.body else {
            return;
        };

        if a.awaiting_inc {
            // The incarnation bump is durable; report the failure.
            req.status = -KfsCode::EALLOCFAILED;
            return;
        }

        if a.layout_done {
            if a.rpc_ok {
                match self
                    .tree
                    .write()
                    .assign_chunk_id(a.fid, a.offset, a.chunk_id, a.version, now)
                {
                    Ok(()) => {
                        self.layout.update_chunk_version(a.chunk_id, a.version);
                        req.status = 0;
                    }
                    Err(st) => {
                        tracing::warn!(fid = *a.fid, chunk = *a.chunk_id, "assign chunk id failed");
                        req.status = st.wire_status();
                    }
                }
            } else {
                // A replica died mid-allocation. Reset versions where the
                // chunk already existed, forget it where it did not, and
                // bump the incarnation before reporting EALLOCFAILED.
                match self.tree.read().get_chunk_version(a.fid, a.chunk_id) {
                    Some(version) => self.layout.reset_chunk_version(a.chunk_id, version),
                    None => self.layout.remove_chunk_to_server_mapping(a.chunk_id),
                }
                a.awaiting_inc = true;
                req.suspended = true;
                let value = self.tree.write().bump_chunk_version_inc();
                let cvi = Box::new(MetaRequest::new(
                    self.next_id(),
                    -1,
                    OpBody::ChunkVersionInc {
                        value,
                        dependent: Some(op_id),
                    },
                    None,
                ));
                self.dispatch(cvi);
            }
            return;
        }

        let outcome = self.tree.write().allocate_chunk_id(a.fid, a.offset);
        match outcome {
            Err(st) => req.status = st.wire_status(),
            Ok(AllocOutcome::New {
                chunk_id,
                version,
                num_replicas,
            }) => {
                a.chunk_id = chunk_id;
                a.version = version;
                match self
                    .layout
                    .allocate_chunk(op_id, a.fid, chunk_id, version, num_replicas, now)
                {
                    Ok(plan) => {
                        a.servers = plan.servers;
                        a.master = plan.master;
                        a.lease_id = Some(plan.lease_id);
                        req.suspended = true;
                    }
                    Err(_) => req.status = -Errno::ENOSPC,
                }
            }
            Ok(AllocOutcome::Exists {
                chunk_id, version, ..
            }) => {
                a.chunk_id = chunk_id;
                a.version = version;
                match self.layout.write_lease_state(chunk_id, now) {
                    WriteLeaseState::Valid {
                        lease_id,
                        master,
                        version,
                    } => {
                        a.lease_id = Some(lease_id);
                        a.master = master;
                        a.version = version;
                        a.servers = self
                            .layout
                            .live_replicas(chunk_id)
                            .iter()
                            .map(|cs| cs.id())
                            .collect();
                    }
                    WriteLeaseState::NeedsFresh => {
                        if let Err(st) = self.layout.can_issue_write(chunk_id, now) {
                            req.status = st.wire_status();
                            return;
                        }
                        // Bump the incarnation and persist it; the new
                        // version must outrun every previously granted one.
                        let inc = self.tree.write().bump_chunk_version_inc();
                        let cvi = Box::new(MetaRequest::new(
                            self.next_id(),
                            -1,
                            OpBody::ChunkVersionInc {
                                value: inc,
                                dependent: None,
                            },
                            None,
                        ));
                        self.dispatch(cvi);

                        let new_version = ChunkVersion(*version + inc);
                        match self
                            .layout
                            .begin_version_change(op_id, chunk_id, new_version, now)
                        {
                            Ok(plan) => {
                                a.version = new_version;
                                a.servers = plan.servers;
                                a.master = plan.master;
                                a.lease_id = Some(plan.lease_id);
                                req.suspended = true;
                            }
                            Err(st) => req.status = st.wire_status(),
                        }
                    }
                }
            }
        }
    }

    fn handle_truncate(&mut self, req: &mut MetaRequest) {
        let now = now();
        let op_id = req.id;
        let cseq = req.cseq;
        let OpBody::Truncate {
            fid,
            offset,
            alloc_status,
        } = &mut req.body
        else {
            return;
        };

        if let Some(status) = alloc_status.take() {
            if status != 0 {
                req.status = status;
                return;
            }
        }

        let truncate_result = self.tree.write().truncate(*fid, *offset, now);
        match truncate_result {
            Ok(TruncateOutcome::Done) => {}
            Ok(TruncateOutcome::NeedsAllocAt(alloc_offset)) => {
                // Extension: run an internal allocate and complete once it
                // does. Further missing chunks are picked up on re-entry.
                let mut alloc = AllocateOp::new(*fid, alloc_offset);
                alloc.for_truncate = Some(op_id);
                let sub = Box::new(MetaRequest::new(
                    self.next_id(),
                    cseq,
                    OpBody::Allocate(alloc),
                    None,
                ));
                req.suspended = true;
                self.dispatch(sub);
            }
            Err(st) => req.status = st.wire_status(),
        }
    }

    /// Fail suspended ops whose chunk-server RPCs have outlived the per-op
    /// timeout.
    fn expire_suspended(&mut self, now: i64) {
        let expired: Vec<OpId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for op_id in expired {
            tracing::warn!(op_id, "suspended op timed out waiting on chunk servers");
            self.layout.fail_op_acks(op_id);
            self.queue.enqueue(Event::Resume {
                op_id,
                status: -Errno::EIO,
            });
        }
    }

    /// Account the op and hand it to the oplog writer; the response leaves
    /// only after the log entry is durable.
    fn finish(&mut self, mut req: Box<MetaRequest>) {
        let line = req.log_line();
        if line.is_some() {
            self.cp.note_mutation();
        }
        self.counters.update(req.body.name());

        let mut finish = Finish::none();
        let response = req.response();
        if let Some(tx) = req.responder.take() {
            if let Some(text) = response {
                finish.respond = Some((tx, text, req.cseq));
            }
        }
        match &req.body {
            OpBody::Allocate(a) => {
                if let Some(parent) = a.for_truncate {
                    finish.resume = Some((parent, req.status));
                }
            }
            OpBody::ChunkVersionInc {
                dependent: Some(dep),
                ..
            } => {
                finish.resume = Some((*dep, 0));
            }
            OpBody::Checkpoint => finish.rotate = true,
            _ => {}
        }
        self.oplog.append(LogItem { line, finish });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetaServerConfig;
    use crate::recovery;
    use kfs_proto::request::{parse_command, ClientRequest, HelloRequest};
    use kfs_types::{ServerLocation, CHUNK_SIZE};
    use parking_lot::RwLock;
    use std::time::Instant;

    struct Rig {
        processor: Processor,
        queue: Arc<MetaQueue<Event>>,
        next_op_id: Arc<AtomicU64>,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let config = MetaServerConfig {
            cp_dir: dir.path().join("cp"),
            log_dir: dir.path().join("log"),
            ..MetaServerConfig::default()
        };
        let state = recovery::recover(&config.cp_dir, &config.log_dir, now()).unwrap();
        let tree: SharedTree = Arc::new(RwLock::new(state.tree));
        let oplog = OpLog::open(
            config.log_dir.clone(),
            state.checkpointed,
            state.next_seq,
            Duration::from_millis(1),
        )
        .unwrap();
        let queue = Arc::new(MetaQueue::new());
        oplog.start(Arc::clone(&queue), |_| {});
        let cp = Checkpointer::new(config.cp_dir.clone(), Arc::clone(&tree), Arc::clone(&oplog));
        let next_op_id = Arc::new(AtomicU64::new(1));
        let processor = Processor::new(
            tree,
            LayoutManager::new(config.layout_config()),
            oplog,
            cp,
            Arc::clone(&queue),
            Arc::clone(&next_op_id),
            config.op_timeout_secs,
        );
        Rig {
            processor,
            queue,
            next_op_id,
            _dir: dir,
        }
    }

    impl Rig {
        fn submit_text(&mut self, text: &str) -> tokio::sync::oneshot::Receiver<String> {
            let (cseq, parsed) = parse_command(text).unwrap();
            self.submit(cseq, parsed)
        }

        fn submit(
            &mut self,
            cseq: i64,
            parsed: ClientRequest,
        ) -> tokio::sync::oneshot::Receiver<String> {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
            let body = OpBody::from_client(parsed);
            self.queue.enqueue(Event::Submit(Box::new(MetaRequest::new(
                id,
                cseq,
                body,
                Some(tx),
            ))));
            rx
        }

        /// Drive the processor until the response arrives.
        fn drive(&mut self, mut rx: tokio::sync::oneshot::Receiver<String>) -> String {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if let Ok(text) = rx.try_recv() {
                    return text;
                }
                assert!(Instant::now() < deadline, "timed out waiting for response");
                self.processor.poll(Duration::from_millis(5));
            }
        }

        /// Drain pending events without expecting a response.
        fn settle(&mut self) {
            while self.processor.poll(Duration::from_millis(5)) {}
        }

        fn add_server(&mut self, name: &str) {
            let hello = HelloRequest {
                location: ServerLocation::new(name, 20000),
                total_space: 1 << 40,
                used_space: 0,
                num_chunks: 0,
                content_length: 0,
                chunks: Vec::new(),
            };
            let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
            self.queue.enqueue(Event::Submit(Box::new(MetaRequest::new(
                id,
                1,
                OpBody::Hello {
                    hello,
                    session: None,
                },
                None,
            ))));
            self.settle();
        }

        /// Ack every outstanding RPC of the given kind, waiting briefly for
        /// the op under test to queue them.
        fn ack_all(&mut self, kind: &str, ok: bool) -> usize {
            let deadline = Instant::now() + Duration::from_secs(2);
            let mut acked = 0;
            loop {
                for id in self.processor.layout().server_ids() {
                    let cs = self.processor.layout().server(&id).unwrap();
                    for (seq, rpc) in cs.take_outbound() {
                        if rpc.name() == kind {
                            self.queue.enqueue(Event::RpcReply {
                                server_id: id.clone(),
                                seq,
                                ok,
                            });
                            acked += 1;
                        }
                    }
                }
                if acked > 0 || Instant::now() >= deadline {
                    break;
                }
                self.processor.poll(Duration::from_millis(5));
            }
            self.settle();
            acked
        }

        fn status_of(text: &str) -> i32 {
            for line in text.lines() {
                if let Some(v) = line.trim_end().strip_prefix("Status: ") {
                    return v.parse().unwrap();
                }
            }
            panic!("no Status header in {:?}", text);
        }

        fn header_of(text: &str, name: &str) -> Option<String> {
            let prefix = format!("{}: ", name);
            text.lines()
                .find_map(|l| l.trim_end().strip_prefix(&prefix).map(|v| v.to_string()))
        }
    }

    #[test]
    fn test_create_lookup_remove_roundtrip() {
        let mut rig = rig();

        let rx = rig.submit_text(
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: a\r\nNum-replicas: 1\r\n",
        );
        let rsp = rig.drive(rx);
        assert_eq!(Rig::status_of(&rsp), 0);
        let handle = Rig::header_of(&rsp, "File-handle").unwrap();

        let rx =
            rig.submit_text("LOOKUP\r\nCseq: 2\r\nParent File-handle: 2\r\nFilename: a\r\n");
        let rsp = rig.drive(rx);
        assert_eq!(Rig::status_of(&rsp), 0);
        assert_eq!(Rig::header_of(&rsp, "Type").as_deref(), Some("file"));
        assert_eq!(Rig::header_of(&rsp, "File-handle").unwrap(), handle);

        let rx =
            rig.submit_text("REMOVE\r\nCseq: 3\r\nParent File-handle: 2\r\nFilename: a\r\n");
        assert_eq!(Rig::status_of(&rig.drive(rx)), 0);

        let rx =
            rig.submit_text("LOOKUP\r\nCseq: 4\r\nParent File-handle: 2\r\nFilename: a\r\n");
        assert_eq!(Rig::status_of(&rig.drive(rx)), -Errno::ENOENT);
    }

    #[test]
    fn test_allocate_then_getalloc() {
        let mut rig = rig();
        rig.add_server("cs1");
        rig.add_server("cs2");

        let rx = rig.submit_text(
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\nNum-replicas: 2\r\n",
        );
        let fid = Rig::header_of(&rig.drive(rx), "File-handle").unwrap();

        let rx = rig.submit_text(&format!(
            "ALLOCATE\r\nCseq: 2\r\nFile-handle: {}\r\nChunk-offset: 0\r\n",
            fid
        ));
        // Suspended until the chunk servers ack.
        rig.settle();
        assert_eq!(rig.ack_all("ALLOCATE", true), 2);
        let rsp = rig.drive(rx);
        assert_eq!(Rig::status_of(&rsp), 0);
        let chunk = Rig::header_of(&rsp, "Chunk-handle").unwrap();
        assert_eq!(Rig::header_of(&rsp, "Chunk-version").as_deref(), Some("1"));
        assert!(Rig::header_of(&rsp, "Master").is_some());

        let rx = rig.submit_text(&format!(
            "GETALLOC\r\nCseq: 3\r\nFile-handle: {}\r\nChunk-offset: 0\r\n",
            fid
        ));
        let rsp = rig.drive(rx);
        assert_eq!(Rig::status_of(&rsp), 0);
        assert_eq!(Rig::header_of(&rsp, "Chunk-handle").unwrap(), chunk);
        assert_eq!(Rig::header_of(&rsp, "Num-replicas").as_deref(), Some("2"));
        assert!(rsp.contains("Replicas: cs"));
    }

    #[test]
    fn test_reallocate_bumps_version_after_lease_expiry() {
        let mut rig = rig();
        rig.add_server("cs1");

        let rx = rig.submit_text(
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\nNum-replicas: 1\r\n",
        );
        let fid = Rig::header_of(&rig.drive(rx), "File-handle").unwrap();

        let rx = rig.submit_text(&format!(
            "ALLOCATE\r\nCseq: 2\r\nFile-handle: {}\r\nChunk-offset: 0\r\n",
            fid
        ));
        rig.settle();
        rig.ack_all("ALLOCATE", true);
        let rsp = rig.drive(rx);
        assert_eq!(Rig::header_of(&rsp, "Chunk-version").as_deref(), Some("1"));

        // Kill the write lease, then re-allocate at the same offset: the
        // version must be bumped and every replica notified.
        rig.processor.layout().lease_cleanup(i64::MAX);
        let rx = rig.submit_text(&format!(
            "ALLOCATE\r\nCseq: 3\r\nFile-handle: {}\r\nChunk-offset: 0\r\n",
            fid
        ));
        rig.settle();
        assert_eq!(rig.ack_all("CHUNK_VERS_CHANGE", true), 1);
        let rsp = rig.drive(rx);
        assert_eq!(Rig::status_of(&rsp), 0);
        let version: u64 = Rig::header_of(&rsp, "Chunk-version").unwrap().parse().unwrap();
        assert!(version > 1, "version {} not bumped", version);

        // The incarnation bump hit the log before the grant.
        let log = std::fs::read_to_string(rig._dir.path().join("log").join("log.0")).unwrap();
        assert!(log.contains("\nchunkVersionInc/2\n"), "log: {:?}", log);
    }

    #[test]
    fn test_allocate_without_servers_is_enospc() {
        let mut rig = rig();
        let rx = rig.submit_text(
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\nNum-replicas: 1\r\n",
        );
        let fid = Rig::header_of(&rig.drive(rx), "File-handle").unwrap();
        let rx = rig.submit_text(&format!(
            "ALLOCATE\r\nCseq: 2\r\nFile-handle: {}\r\nChunk-offset: 0\r\n",
            fid
        ));
        assert_eq!(Rig::status_of(&rig.drive(rx)), -Errno::ENOSPC);
    }

    #[test]
    fn test_allocate_unaligned_offset_rejected() {
        let mut rig = rig();
        rig.add_server("cs1");
        let rx = rig.submit_text(
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\nNum-replicas: 1\r\n",
        );
        let fid = Rig::header_of(&rig.drive(rx), "File-handle").unwrap();
        let rx = rig.submit_text(&format!(
            "ALLOCATE\r\nCseq: 2\r\nFile-handle: {}\r\nChunk-offset: 12345\r\n",
            fid
        ));
        assert_eq!(Rig::status_of(&rig.drive(rx)), -Errno::EINVAL);
    }

    #[test]
    fn test_failed_ack_reports_allocfailed() {
        let mut rig = rig();
        rig.add_server("cs1");
        let rx = rig.submit_text(
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\nNum-replicas: 1\r\n",
        );
        let fid = Rig::header_of(&rig.drive(rx), "File-handle").unwrap();

        let rx = rig.submit_text(&format!(
            "ALLOCATE\r\nCseq: 2\r\nFile-handle: {}\r\nChunk-offset: 0\r\n",
            fid
        ));
        rig.settle();
        rig.ack_all("ALLOCATE", false);
        let rsp = rig.drive(rx);
        assert_eq!(Rig::status_of(&rsp), -KfsCode::EALLOCFAILED);

        // The failed chunk never reached the tree.
        let rx = rig.submit_text(&format!(
            "GETALLOC\r\nCseq: 3\r\nFile-handle: {}\r\nChunk-offset: 0\r\n",
            fid
        ));
        assert_eq!(Rig::status_of(&rig.drive(rx)), -Errno::ENOENT);
    }

    #[test]
    fn test_truncate_extend_allocates_all_chunks() {
        let mut rig = rig();
        rig.add_server("cs1");

        let rx = rig.submit_text(
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\nNum-replicas: 1\r\n",
        );
        let fid = Rig::header_of(&rig.drive(rx), "File-handle").unwrap();

        let rx = rig.submit_text(&format!(
            "TRUNCATE\r\nCseq: 2\r\nFile-handle: {}\r\nOffset: {}\r\n",
            fid,
            2 * CHUNK_SIZE
        ));
        // Two internal allocations run back to back.
        rig.settle();
        assert_eq!(rig.ack_all("ALLOCATE", true), 1);
        assert_eq!(rig.ack_all("ALLOCATE", true), 1);
        let rsp = rig.drive(rx);
        assert_eq!(Rig::status_of(&rsp), 0);

        let rx = rig.submit_text(&format!("GETLAYOUT\r\nCseq: 3\r\nFile-handle: {}\r\n", fid));
        let rsp = rig.drive(rx);
        assert_eq!(Rig::status_of(&rsp), 0);
        assert_eq!(Rig::header_of(&rsp, "Num-chunks").as_deref(), Some("2"));
        let body: Vec<&str> = rsp.split("\r\n\r\n").nth(1).unwrap().lines().collect();
        assert!(body[0].starts_with("0 "));
        assert!(body[1].starts_with(&format!("{} ", CHUNK_SIZE)));
    }

    #[test]
    fn test_readdir_hides_root_self_entry() {
        let mut rig = rig();
        let rx = rig.submit_text("MKDIR\r\nCseq: 1\r\nParent File-handle: 2\r\nDirectory: d\r\n");
        rig.drive(rx);
        let rx = rig.submit_text("READDIR\r\nCseq: 2\r\nDirectory File-handle: 2\r\n");
        let rsp = rig.drive(rx);
        assert_eq!(Rig::header_of(&rsp, "Num-Entries").as_deref(), Some("1"));
        assert!(rsp.ends_with("d\n"));
    }

    #[test]
    fn test_lease_acquire_and_renew() {
        let mut rig = rig();
        rig.add_server("cs1");
        let rx = rig.submit_text(
            "CREATE\r\nCseq: 1\r\nParent File-handle: 2\r\nFilename: f\r\nNum-replicas: 1\r\n",
        );
        let fid = Rig::header_of(&rig.drive(rx), "File-handle").unwrap();
        let rx = rig.submit_text(&format!(
            "ALLOCATE\r\nCseq: 2\r\nFile-handle: {}\r\nChunk-offset: 0\r\n",
            fid
        ));
        rig.settle();
        rig.ack_all("ALLOCATE", true);
        let chunk = Rig::header_of(&rig.drive(rx), "Chunk-handle").unwrap();

        // A write lease is outstanding from the allocation; reads are
        // refused until it is reclaimed.
        let rx = rig.submit_text(&format!("LEASE_ACQUIRE\r\nCseq: 3\r\nChunk-handle: {}\r\n", chunk));
        assert_eq!(Rig::status_of(&rig.drive(rx)), -Errno::EBUSY);

        rig.processor.layout().lease_cleanup(i64::MAX);
        let rx = rig.submit_text(&format!("LEASE_ACQUIRE\r\nCseq: 4\r\nChunk-handle: {}\r\n", chunk));
        let rsp = rig.drive(rx);
        assert_eq!(Rig::status_of(&rsp), 0);
        let lease = Rig::header_of(&rsp, "Lease-id").unwrap();

        let rx = rig.submit_text(&format!(
            "LEASE_RENEW\r\nCseq: 5\r\nChunk-handle: {}\r\nLease-id: {}\r\nLease-type: READ_LEASE\r\n",
            chunk, lease
        ));
        assert_eq!(Rig::status_of(&rig.drive(rx)), 0);
    }

    #[test]
    fn test_ping_and_stats() {
        let mut rig = rig();
        rig.add_server("cs1");
        let rx = rig.submit_text("PING\r\nCseq: 1\r\n");
        let rsp = rig.drive(rx);
        assert!(Rig::header_of(&rsp, "Servers").unwrap().contains("n=cs1"));

        let rx = rig.submit_text("STATS\r\nCseq: 2\r\n");
        let rsp = rig.drive(rx);
        assert!(rsp.contains("ping: 1\n"));
        assert!(rsp.contains("hello: 1\n"));
    }

    #[test]
    fn test_mutations_write_log_lines() {
        let mut rig = rig();
        let rx = rig.submit_text("MKDIR\r\nCseq: 1\r\nParent File-handle: 2\r\nDirectory: d\r\n");
        rig.drive(rx);
        let rx =
            rig.submit_text("LOOKUP\r\nCseq: 2\r\nParent File-handle: 2\r\nFilename: d\r\n");
        rig.drive(rx);

        let log = std::fs::read_to_string(rig._dir.path().join("log").join("log.0")).unwrap();
        assert_eq!(log, "mkdir/dir/2/name/d/id/3\n");
    }
}
