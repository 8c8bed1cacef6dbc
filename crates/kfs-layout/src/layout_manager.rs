//! The layout manager: chunk-to-server mapping, placement, leases, and the
//! replication control loop.
//!
//! All state here is touched only from the request processor's context.
//! Sessions are the one shared piece: the registry owns the `Arc`s, the
//! chunk-to-server mapping keeps weak back-references so `server_down` can
//! sever reachability without waiting on RPC holders.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use kfs_proto::request::HelloRequest;
use kfs_proto::{ChunkRpc, LeaseType};
use kfs_types::{
    make_error, ChunkId, ChunkVersion, Errno, Fid, KfsCode, LeaseId, Result, Seq,
    ServerLocation,
};

use crate::chunk_server::ChunkServer;
use crate::lease::LeaseTable;
use crate::placement::{choose_replicas, pick_master};
use crate::OpId;

#[derive(Debug, Clone)]
pub struct LayoutConfig {
    pub lease_interval_secs: i64,
    /// Servers with a smaller free-space fraction are not placement
    /// candidates.
    pub min_free_ratio: f64,
    pub heartbeat_interval_secs: i64,
    /// Missed intervals after which a server is declared down.
    pub heartbeat_max_missed: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            lease_interval_secs: kfs_types::LEASE_INTERVAL_SECS,
            min_free_ratio: 0.01,
            heartbeat_interval_secs: 60,
            heartbeat_max_missed: 3,
        }
    }
}

/// What the layout manager knows about one chunk.
#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub fid: Fid,
    pub version: ChunkVersion,
    pub target_replicas: u32,
}

/// Placement decided for a new chunk or a fresh write lease.
#[derive(Debug, Clone)]
pub struct AllocatePlan {
    pub servers: Vec<String>,
    pub master: String,
    pub lease_id: LeaseId,
}

/// Whether an existing chunk still has a usable write lease.
#[derive(Debug, Clone)]
pub enum WriteLeaseState {
    Valid {
        lease_id: LeaseId,
        master: String,
        version: ChunkVersion,
    },
    NeedsFresh,
}

/// What an incoming RPC reply meant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Background RPC (heartbeat, delete, stale notify); nothing to resume.
    Background,
    /// The last outstanding ack for a suspended op arrived.
    OpComplete { op_id: OpId, failed: bool },
    /// A replication command finished.
    ReplicationDone { chunk_id: ChunkId, ok: bool },
    /// Reply did not match any outstanding RPC.
    Unmatched,
}

#[derive(Debug)]
struct AckWait {
    remaining: usize,
    failed: bool,
}

pub struct LayoutManager {
    config: LayoutConfig,
    servers: HashMap<String, Arc<ChunkServer>>,
    chunk_map: HashMap<ChunkId, Vec<Weak<ChunkServer>>>,
    chunk_table: HashMap<ChunkId, ChunkEntry>,
    /// Per-server hosted chunk set, kept in lockstep with `chunk_map`.
    hosted: HashMap<String, HashSet<ChunkId>>,
    leases: LeaseTable,
    replication_pending: BTreeSet<ChunkId>,
    over_replicated: BTreeSet<ChunkId>,
    /// (server id, rpc seq) -> suspended op awaiting this ack.
    ack_ops: HashMap<(String, Seq), OpId>,
    ack_waits: HashMap<OpId, AckWait>,
    /// (server id, rpc seq) -> chunk being replicated onto that server.
    repl_inflight: HashMap<(String, Seq), ChunkId>,
}

impl LayoutManager {
    pub fn new(config: LayoutConfig) -> Self {
        let leases = LeaseTable::new(config.lease_interval_secs);
        Self {
            config,
            servers: HashMap::new(),
            chunk_map: HashMap::new(),
            chunk_table: HashMap::new(),
            hosted: HashMap::new(),
            leases,
            replication_pending: BTreeSet::new(),
            over_replicated: BTreeSet::new(),
            ack_ops: HashMap::new(),
            ack_waits: HashMap::new(),
            repl_inflight: HashMap::new(),
        }
    }

    // ---- chunk table ----

    /// Record a chunk the tree knows about; recovery and assignment both
    /// land here.
    pub fn register_chunk(
        &mut self,
        chunk_id: ChunkId,
        fid: Fid,
        version: ChunkVersion,
        target_replicas: u32,
    ) {
        self.chunk_table.insert(
            chunk_id,
            ChunkEntry {
                fid,
                version,
                target_replicas,
            },
        );
    }

    pub fn update_chunk_version(&mut self, chunk_id: ChunkId, version: ChunkVersion) {
        if let Some(entry) = self.chunk_table.get_mut(&chunk_id) {
            entry.version = version;
        }
    }

    pub fn chunk_entry(&self, chunk_id: ChunkId) -> Option<&ChunkEntry> {
        self.chunk_table.get(&chunk_id)
    }

    /// Drop all knowledge of a chunk that never came to exist (failed first
    /// allocation).
    pub fn remove_chunk_to_server_mapping(&mut self, chunk_id: ChunkId) {
        for cs in self.live_replicas(chunk_id) {
            if let Some(set) = self.hosted.get_mut(&cs.id()) {
                set.remove(&chunk_id);
            }
        }
        self.chunk_map.remove(&chunk_id);
        self.chunk_table.remove(&chunk_id);
        self.replication_pending.remove(&chunk_id);
        self.over_replicated.remove(&chunk_id);
    }

    // ---- registry / sessions ----

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn server(&self, id: &str) -> Option<Arc<ChunkServer>> {
        self.servers.get(id).cloned()
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn add_replica(&mut self, chunk_id: ChunkId, cs: &Arc<ChunkServer>) {
        let entry = self.chunk_map.entry(chunk_id).or_default();
        let id = cs.id();
        let already = entry
            .iter()
            .filter_map(|w| w.upgrade())
            .any(|s| s.id() == id);
        if !already {
            entry.push(Arc::downgrade(cs));
        }
        self.hosted.entry(id).or_default().insert(chunk_id);
    }

    /// Live, active replicas of a chunk; dead weak references are pruned.
    pub fn live_replicas(&mut self, chunk_id: ChunkId) -> Vec<Arc<ChunkServer>> {
        let Some(entry) = self.chunk_map.get_mut(&chunk_id) else {
            return Vec::new();
        };
        entry.retain(|w| w.upgrade().is_some());
        entry
            .iter()
            .filter_map(|w| w.upgrade())
            .filter(|cs| cs.is_active())
            .collect()
    }

    /// Replica locations for client responses.
    pub fn chunk_locations(&mut self, chunk_id: ChunkId) -> Vec<ServerLocation> {
        self.live_replicas(chunk_id)
            .iter()
            .map(|cs| cs.location().clone())
            .collect()
    }

    /// Register a server from its HELLO. A prior session for the same
    /// location is torn down first; replicas are re-merged from the fresh
    /// chunk list rather than declared lost.
    pub fn add_new_server(&mut self, hello: &HelloRequest, now: i64) -> Arc<ChunkServer> {
        let id = hello.location.id();
        if let Some(old) = self.servers.remove(&id) {
            tracing::info!(server = %id, "replacing prior session on fresh hello");
            old.mark_stale();
            self.purge_server_replicas(&id);
        }

        let cs = Arc::new(ChunkServer::new(
            hello.location.clone(),
            hello.total_space,
            hello.used_space,
            now,
        ));
        cs.activate();
        self.servers.insert(id.clone(), cs.clone());

        let mut stale = Vec::new();
        for (chunk_id, reported_version) in &hello.chunks {
            match self.chunk_table.get(chunk_id) {
                None => stale.push(*chunk_id),
                Some(entry) => {
                    let outdated = reported_version
                        .map(|v| v < *entry.version)
                        .unwrap_or(false);
                    if outdated {
                        stale.push(*chunk_id);
                    } else {
                        self.add_replica(*chunk_id, &cs);
                        if (self.live_replicas(*chunk_id).len() as u32)
                            < self
                                .chunk_table
                                .get(chunk_id)
                                .map(|e| e.target_replicas)
                                .unwrap_or(0)
                        {
                            self.replication_pending.insert(*chunk_id);
                        } else {
                            self.replication_pending.remove(chunk_id);
                        }
                    }
                }
            }
        }
        if !stale.is_empty() {
            tracing::info!(server = %id, count = stale.len(), "scheduling stale chunk deletion");
            cs.enqueue(ChunkRpc::StaleChunks { chunk_ids: stale });
        }
        tracing::info!(
            server = %id,
            chunks = hello.chunks.len(),
            total = hello.total_space,
            used = hello.used_space,
            "chunk server registered"
        );
        cs
    }

    fn purge_server_replicas(&mut self, id: &str) {
        if let Some(chunks) = self.hosted.remove(id) {
            for chunk_id in chunks {
                if let Some(entry) = self.chunk_map.get_mut(&chunk_id) {
                    entry.retain(|w| {
                        w.upgrade().map(|cs| cs.id() != id).unwrap_or(false)
                    });
                }
            }
        }
    }

    /// Take a server out of service. Chunks dropping below their target
    /// replication join the replication queue; acks the server owed to
    /// suspended ops are failed so those ops can resume on the error path.
    pub fn server_down(&mut self, id: &str) -> (Vec<ChunkId>, Vec<ReplyOutcome>) {
        let mut requeued = Vec::new();
        let mut completions = Vec::new();

        let Some(cs) = self.servers.remove(id) else {
            return (requeued, completions);
        };
        tracing::warn!(server = %id, "chunk server down");
        cs.mark_down();

        let chunks: Vec<ChunkId> = self
            .hosted
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        self.purge_server_replicas(id);
        for chunk_id in chunks {
            let live = self.live_replicas(chunk_id).len() as u32;
            let target = self
                .chunk_table
                .get(&chunk_id)
                .map(|e| e.target_replicas)
                .unwrap_or(0);
            if live < target {
                self.replication_pending.insert(chunk_id);
                requeued.push(chunk_id);
            }
        }

        // Fail every ack a suspended op was expecting from this server.
        let owed: Vec<(String, Seq)> = self
            .ack_ops
            .keys()
            .filter(|(sid, _)| sid == id)
            .cloned()
            .collect();
        for key in owed {
            if let Some(op_id) = self.ack_ops.remove(&key) {
                if let Some(wait) = self.ack_waits.get_mut(&op_id) {
                    wait.failed = true;
                    wait.remaining -= 1;
                    if wait.remaining == 0 {
                        self.ack_waits.remove(&op_id);
                        completions.push(ReplyOutcome::OpComplete {
                            op_id,
                            failed: true,
                        });
                    }
                }
            }
        }
        // Replications targeting this server are re-queued.
        let lost: Vec<(String, Seq)> = self
            .repl_inflight
            .keys()
            .filter(|(sid, _)| sid == id)
            .cloned()
            .collect();
        for key in lost {
            if let Some(chunk_id) = self.repl_inflight.remove(&key) {
                self.replication_pending.insert(chunk_id);
            }
        }

        (requeued, completions)
    }

    // ---- allocation & leases ----

    /// Place a brand-new chunk: choose replicas, designate the master,
    /// register the mapping, issue the write lease, and queue an ALLOCATE to
    /// every replica. The caller suspends its op until all acks arrive.
    pub fn allocate_chunk(
        &mut self,
        op_id: OpId,
        fid: Fid,
        chunk_id: ChunkId,
        version: ChunkVersion,
        num_replicas: u32,
        now: i64,
    ) -> Result<AllocatePlan> {
        let candidates: Vec<Arc<ChunkServer>> = self.servers.values().cloned().collect();
        let replicas = choose_replicas(
            &candidates,
            &HashSet::new(),
            self.config.min_free_ratio,
            num_replicas as usize,
        );
        if replicas.is_empty() {
            return make_error(Errno::ENOSPC);
        }
        let master = pick_master(&replicas).expect("non-empty replica set has a master");

        self.register_chunk(chunk_id, fid, version, num_replicas);
        for cs in &replicas {
            self.add_replica(chunk_id, cs);
        }
        let lease_id = self.leases.issue_write(chunk_id, master.id(), now)?;

        let server_ids: Vec<String> = replicas.iter().map(|cs| cs.id()).collect();
        for cs in &replicas {
            let seq = cs.enqueue(ChunkRpc::Allocate {
                fid,
                chunk_id,
                version,
                lease_id: Some(lease_id),
                servers: server_ids.clone(),
            });
            self.ack_ops.insert((cs.id(), seq), op_id);
        }
        self.ack_waits.insert(
            op_id,
            AckWait {
                remaining: replicas.len(),
                failed: false,
            },
        );
        Ok(AllocatePlan {
            servers: server_ids,
            master: master.id(),
            lease_id,
        })
    }

    /// Whether an existing chunk's write lease can simply be extended.
    pub fn write_lease_state(&mut self, chunk_id: ChunkId, now: i64) -> WriteLeaseState {
        let version = self
            .chunk_table
            .get(&chunk_id)
            .map(|e| e.version)
            .unwrap_or_default();
        match self.leases.extend_write(chunk_id, now) {
            Some(lease) => WriteLeaseState::Valid {
                lease_id: lease.id,
                master: lease.master.clone().unwrap_or_default(),
                version,
            },
            None => WriteLeaseState::NeedsFresh,
        }
    }

    /// Whether a fresh write lease could be issued right now (no outstanding
    /// leases in the way). Checked before the incarnation bump so a refused
    /// lease does not burn an increment.
    pub fn can_issue_write(&mut self, chunk_id: ChunkId, now: i64) -> Result<()> {
        if self.leases.can_issue_write(chunk_id, now) {
            Ok(())
        } else {
            make_error(Errno::EBUSY)
        }
    }

    /// Begin a fresh write lease on an existing chunk: bump to `new_version`,
    /// notify every replica, and suspend the caller until all acks arrive.
    pub fn begin_version_change(
        &mut self,
        op_id: OpId,
        chunk_id: ChunkId,
        new_version: ChunkVersion,
        now: i64,
    ) -> Result<AllocatePlan> {
        let entry = self
            .chunk_table
            .get(&chunk_id)
            .cloned()
            .ok_or(Errno::ENOENT)?;
        let replicas = self.live_replicas(chunk_id);
        if replicas.is_empty() {
            return make_error(KfsCode::EDATAUNAVAIL);
        }
        let master = pick_master(&replicas).expect("non-empty replica set has a master");
        let lease_id = self.leases.issue_write(chunk_id, master.id(), now)?;
        self.update_chunk_version(chunk_id, new_version);

        let server_ids: Vec<String> = replicas.iter().map(|cs| cs.id()).collect();
        for cs in &replicas {
            let seq = cs.enqueue(ChunkRpc::VersChange {
                fid: entry.fid,
                chunk_id,
                version: new_version,
            });
            self.ack_ops.insert((cs.id(), seq), op_id);
        }
        self.ack_waits.insert(
            op_id,
            AckWait {
                remaining: replicas.len(),
                failed: false,
            },
        );
        Ok(AllocatePlan {
            servers: server_ids,
            master: master.id(),
            lease_id,
        })
    }

    /// Push the current version back to the replicas of a failed allocation.
    pub fn reset_chunk_version(&mut self, chunk_id: ChunkId, version: ChunkVersion) {
        let Some(entry) = self.chunk_table.get(&chunk_id).cloned() else {
            return;
        };
        self.update_chunk_version(chunk_id, version);
        for cs in self.live_replicas(chunk_id) {
            cs.enqueue(ChunkRpc::VersChange {
                fid: entry.fid,
                chunk_id,
                version,
            });
        }
    }

    /// Short read lease; concurrent reads allowed, incompatible with an
    /// outstanding write lease.
    pub fn get_chunk_read_lease(&mut self, chunk_id: ChunkId, now: i64) -> Result<LeaseId> {
        if !self.chunk_table.contains_key(&chunk_id) {
            return make_error(Errno::ENOENT);
        }
        self.leases.issue_read(chunk_id, now)
    }

    pub fn lease_renew(
        &mut self,
        chunk_id: ChunkId,
        lease_id: LeaseId,
        lease_type: LeaseType,
        now: i64,
    ) -> Result<()> {
        self.leases.renew(chunk_id, lease_id, lease_type, now)
    }

    pub fn lease_cleanup(&mut self, now: i64) -> usize {
        self.leases.cleanup(now)
    }

    /// Drop an op's ack bookkeeping (per-op timeout fired before the acks
    /// arrived).
    pub fn fail_op_acks(&mut self, op_id: OpId) {
        self.ack_waits.remove(&op_id);
        self.ack_ops.retain(|_, v| *v != op_id);
    }

    // ---- RPC replies ----

    /// Route a chunk-server reply: liveness, ack matching, replication
    /// completion.
    pub fn rpc_reply(&mut self, server_id: &str, seq: Seq, ok: bool, now: i64) -> ReplyOutcome {
        let Some(cs) = self.servers.get(server_id).cloned() else {
            return ReplyOutcome::Unmatched;
        };
        let Some(_rpc) = cs.match_reply(seq, now) else {
            return ReplyOutcome::Unmatched;
        };

        let key = (server_id.to_string(), seq);
        if let Some(op_id) = self.ack_ops.remove(&key) {
            if let Some(wait) = self.ack_waits.get_mut(&op_id) {
                if !ok {
                    wait.failed = true;
                }
                wait.remaining -= 1;
                if wait.remaining == 0 {
                    let failed = wait.failed;
                    self.ack_waits.remove(&op_id);
                    return ReplyOutcome::OpComplete { op_id, failed };
                }
            }
            return ReplyOutcome::Background;
        }
        if let Some(chunk_id) = self.repl_inflight.remove(&key) {
            if ok {
                self.add_replica(chunk_id, &cs);
                let target = self
                    .chunk_table
                    .get(&chunk_id)
                    .map(|e| e.target_replicas)
                    .unwrap_or(0);
                if (self.live_replicas(chunk_id).len() as u32) >= target {
                    self.replication_pending.remove(&chunk_id);
                }
                tracing::info!(chunk = *chunk_id, server = %server_id, "replication complete");
            } else {
                tracing::warn!(chunk = *chunk_id, server = %server_id, "replication failed, requeueing");
                self.replication_pending.insert(chunk_id);
            }
            return ReplyOutcome::ReplicationDone { chunk_id, ok };
        }
        ReplyOutcome::Background
    }

    // ---- periodic sweeps ----

    /// Heartbeat bookkeeping for every session; returns the servers that
    /// crossed the missed-reply threshold and must be taken down.
    pub fn heartbeat_tick(&mut self, now: i64) -> Vec<String> {
        let mut downed = Vec::new();
        for (id, cs) in &self.servers {
            if !cs.is_active() {
                continue;
            }
            if cs.heartbeat_due(now, self.config.heartbeat_interval_secs) {
                let missed = cs.note_missed_heartbeat();
                if missed > self.config.heartbeat_max_missed {
                    downed.push(id.clone());
                } else {
                    cs.enqueue(ChunkRpc::Heartbeat);
                }
            }
        }
        downed
    }

    /// The replication checker: one sweep over every known chunk, issuing
    /// REPLICATE for under-replication and DELETE for over-replication.
    pub fn chunk_replication_check(&mut self) -> (usize, usize) {
        let mut replicated = 0;
        let mut deleted = 0;
        let chunk_ids: Vec<ChunkId> = self.chunk_table.keys().copied().collect();
        for chunk_id in chunk_ids {
            let Some(entry) = self.chunk_table.get(&chunk_id).cloned() else {
                continue;
            };
            let live = self.live_replicas(chunk_id);
            let target = entry.target_replicas as usize;
            if live.len() < target {
                if live.is_empty() {
                    // No source to copy from; leave it queued.
                    self.replication_pending.insert(chunk_id);
                    continue;
                }
                // Already being handled?
                if self.repl_inflight.values().any(|c| *c == chunk_id) {
                    continue;
                }
                let exclude: HashSet<String> = live.iter().map(|cs| cs.id()).collect();
                let candidates: Vec<Arc<ChunkServer>> =
                    self.servers.values().cloned().collect();
                let dests = choose_replicas(
                    &candidates,
                    &exclude,
                    self.config.min_free_ratio,
                    target - live.len(),
                );
                if dests.is_empty() {
                    self.replication_pending.insert(chunk_id);
                    continue;
                }
                let src = live[0].clone();
                for dest in dests {
                    let seq = dest.enqueue(ChunkRpc::Replicate {
                        fid: entry.fid,
                        chunk_id,
                        version: entry.version,
                        src: src.location().clone(),
                    });
                    self.repl_inflight.insert((dest.id(), seq), chunk_id);
                    replicated += 1;
                }
            } else if live.len() > target {
                // Drop the most-utilized extras.
                let mut extras = live.clone();
                extras.sort_by(|a, b| {
                    b.used_ratio()
                        .partial_cmp(&a.used_ratio())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for cs in extras.into_iter().take(live.len() - target) {
                    cs.enqueue(ChunkRpc::Delete { chunk_id });
                    if let Some(set) = self.hosted.get_mut(&cs.id()) {
                        set.remove(&chunk_id);
                    }
                    if let Some(replicas) = self.chunk_map.get_mut(&chunk_id) {
                        let id = cs.id();
                        replicas.retain(|w| {
                            w.upgrade().map(|s| s.id() != id).unwrap_or(false)
                        });
                    }
                    deleted += 1;
                }
                self.over_replicated.remove(&chunk_id);
            } else {
                self.replication_pending.remove(&chunk_id);
            }
        }
        (replicated, deleted)
    }

    /// Queue a DELETE on every replica of a chunk and forget it; the
    /// dumpster drain path.
    pub fn delete_chunk(&mut self, chunk_id: ChunkId) {
        for cs in self.live_replicas(chunk_id) {
            cs.enqueue(ChunkRpc::Delete { chunk_id });
            if let Some(set) = self.hosted.get_mut(&cs.id()) {
                set.remove(&chunk_id);
            }
        }
        self.chunk_map.remove(&chunk_id);
        self.chunk_table.remove(&chunk_id);
        self.replication_pending.remove(&chunk_id);
        self.over_replicated.remove(&chunk_id);
    }

    pub fn replication_pending(&self) -> &BTreeSet<ChunkId> {
        &self.replication_pending
    }

    /// The server list for PING responses.
    pub fn ping_servers(&self) -> String {
        let mut out = String::new();
        let mut ids = self.server_ids();
        ids.retain(|id| {
            self.servers
                .get(id)
                .map(|cs| cs.is_active())
                .unwrap_or(false)
        });
        for (i, id) in ids.iter().enumerate() {
            let cs = &self.servers[id];
            if i > 0 {
                out.push_str("; ");
            }
            let _ = write!(
                out,
                "n={}, p={}, used={}, total={}",
                cs.location().hostname,
                cs.location().port,
                cs.used_space(),
                cs.total_space()
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_server::SessionState;

    fn hello(name: &str, chunks: Vec<(ChunkId, Option<u64>)>) -> HelloRequest {
        HelloRequest {
            location: ServerLocation::new(name, 20000),
            total_space: 1_000_000,
            used_space: 0,
            num_chunks: chunks.len(),
            content_length: 0,
            chunks,
        }
    }

    fn manager() -> LayoutManager {
        LayoutManager::new(LayoutConfig::default())
    }

    #[test]
    fn test_add_server_merges_known_chunks() {
        let mut lm = manager();
        lm.register_chunk(ChunkId(1), Fid(10), ChunkVersion(2), 3);
        let cs = lm.add_new_server(&hello("cs1", vec![(ChunkId(1), Some(2))]), 0);
        assert!(cs.is_active());
        assert_eq!(lm.live_replicas(ChunkId(1)).len(), 1);
        // Under-replicated (target 3) so queued for replication.
        assert!(lm.replication_pending().contains(&ChunkId(1)));
    }

    #[test]
    fn test_add_server_schedules_stale_for_unknown_chunk() {
        let mut lm = manager();
        let cs = lm.add_new_server(&hello("cs1", vec![(ChunkId(99), None)]), 0);
        let sent = cs.take_outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1,
            ChunkRpc::StaleChunks {
                chunk_ids: vec![ChunkId(99)]
            }
        );
        assert!(lm.live_replicas(ChunkId(99)).is_empty());
    }

    #[test]
    fn test_add_server_schedules_stale_for_old_version() {
        let mut lm = manager();
        lm.register_chunk(ChunkId(5), Fid(10), ChunkVersion(4), 1);
        let cs = lm.add_new_server(&hello("cs1", vec![(ChunkId(5), Some(2))]), 0);
        let sent = cs.take_outbound();
        assert_eq!(
            sent[0].1,
            ChunkRpc::StaleChunks {
                chunk_ids: vec![ChunkId(5)]
            }
        );
        assert!(lm.live_replicas(ChunkId(5)).is_empty());
    }

    #[test]
    fn test_reconnect_replaces_session_and_remerges() {
        let mut lm = manager();
        lm.register_chunk(ChunkId(1), Fid(10), ChunkVersion(1), 1);
        let old = lm.add_new_server(&hello("cs1", vec![(ChunkId(1), None)]), 0);
        let new = lm.add_new_server(&hello("cs1", vec![(ChunkId(1), None)]), 10);
        assert_eq!(old.state(), SessionState::Stale);
        assert!(new.is_active());
        assert_eq!(lm.server_count(), 1);
        let replicas = lm.live_replicas(ChunkId(1));
        assert_eq!(replicas.len(), 1);
        assert!(Arc::ptr_eq(&replicas[0], &new));
    }

    #[test]
    fn test_allocate_chunk_plan() {
        let mut lm = manager();
        lm.add_new_server(&hello("cs1", vec![]), 0);
        lm.add_new_server(&hello("cs2", vec![]), 0);
        lm.add_new_server(&hello("cs3", vec![]), 0);

        let plan = lm
            .allocate_chunk(1, Fid(10), ChunkId(1), ChunkVersion(1), 3, 0)
            .unwrap();
        assert_eq!(plan.servers.len(), 3);
        assert!(plan.servers.contains(&plan.master));
        assert_eq!(lm.live_replicas(ChunkId(1)).len(), 3);

        // Each replica got an ALLOCATE carrying the full server list.
        for id in &plan.servers {
            let cs = lm.server(id).unwrap();
            let sent = cs.take_outbound();
            assert_eq!(sent.len(), 1);
            match &sent[0].1 {
                ChunkRpc::Allocate { servers, lease_id, .. } => {
                    assert_eq!(servers, &plan.servers);
                    assert_eq!(*lease_id, Some(plan.lease_id));
                }
                other => panic!("unexpected rpc {:?}", other),
            }
        }
    }

    #[test]
    fn test_allocate_without_servers_is_enospc() {
        let mut lm = manager();
        let err = lm
            .allocate_chunk(1, Fid(10), ChunkId(1), ChunkVersion(1), 1, 0)
            .unwrap_err();
        assert_eq!(err.code(), Errno::ENOSPC);
    }

    #[test]
    fn test_acks_complete_op() {
        let mut lm = manager();
        lm.add_new_server(&hello("cs1", vec![]), 0);
        lm.add_new_server(&hello("cs2", vec![]), 0);
        let plan = lm
            .allocate_chunk(42, Fid(10), ChunkId(1), ChunkVersion(1), 2, 0)
            .unwrap();

        let mut seqs = Vec::new();
        for id in &plan.servers {
            let cs = lm.server(id).unwrap();
            for (seq, _) in cs.take_outbound() {
                seqs.push((id.clone(), seq));
            }
        }
        let (first, last) = (seqs[0].clone(), seqs[1].clone());
        assert_eq!(
            lm.rpc_reply(&first.0, first.1, true, 1),
            ReplyOutcome::Background
        );
        assert_eq!(
            lm.rpc_reply(&last.0, last.1, true, 1),
            ReplyOutcome::OpComplete {
                op_id: 42,
                failed: false
            }
        );
    }

    #[test]
    fn test_failed_ack_marks_op_failed() {
        let mut lm = manager();
        lm.add_new_server(&hello("cs1", vec![]), 0);
        let plan = lm
            .allocate_chunk(7, Fid(10), ChunkId(1), ChunkVersion(1), 1, 0)
            .unwrap();
        let cs = lm.server(&plan.servers[0]).unwrap();
        let (seq, _) = cs.take_outbound().pop().unwrap();
        assert_eq!(
            lm.rpc_reply(&plan.servers[0], seq, false, 1),
            ReplyOutcome::OpComplete {
                op_id: 7,
                failed: true
            }
        );
    }

    #[test]
    fn test_server_down_requeues_and_fails_acks() {
        let mut lm = manager();
        lm.register_chunk(ChunkId(1), Fid(10), ChunkVersion(1), 2);
        lm.add_new_server(&hello("cs1", vec![(ChunkId(1), None)]), 0);
        lm.add_new_server(&hello("cs2", vec![(ChunkId(1), None)]), 0);
        assert_eq!(lm.live_replicas(ChunkId(1)).len(), 2);

        // A suspended op waiting on cs1 only.
        let plan = lm
            .allocate_chunk(9, Fid(11), ChunkId(2), ChunkVersion(1), 1, 0)
            .unwrap();
        let victim = plan.servers[0].clone();

        let (requeued, completions) = lm.server_down(&victim);
        assert!(requeued.contains(&ChunkId(1)));
        assert!(completions.contains(&ReplyOutcome::OpComplete {
            op_id: 9,
            failed: true
        }));
        assert_eq!(lm.server_count(), 1);
        assert_eq!(lm.live_replicas(ChunkId(1)).len(), 1);
    }

    #[test]
    fn test_replication_check_picks_fresh_destination() {
        let mut lm = manager();
        lm.register_chunk(ChunkId(1), Fid(10), ChunkVersion(1), 3);
        lm.add_new_server(&hello("cs1", vec![(ChunkId(1), None)]), 0);
        lm.add_new_server(&hello("cs2", vec![(ChunkId(1), None)]), 0);
        lm.add_new_server(&hello("cs3", vec![(ChunkId(1), None)]), 0);
        // cs4 idle, hosting nothing.
        lm.add_new_server(&hello("cs4", vec![]), 0);
        for id in lm.server_ids() {
            lm.server(&id).unwrap().take_outbound();
        }

        let (_, completions) = lm.server_down("cs1:20000");
        assert!(completions.is_empty());
        let (issued, _) = lm.chunk_replication_check();
        assert_eq!(issued, 1);

        // The REPLICATE went to cs4, the only non-hosting server.
        let cs4 = lm.server("cs4:20000").unwrap();
        let sent = cs4.take_outbound();
        assert_eq!(sent.len(), 1);
        let seq = sent[0].0;
        match &sent[0].1 {
            ChunkRpc::Replicate { chunk_id, src, .. } => {
                assert_eq!(*chunk_id, ChunkId(1));
                assert_ne!(src.id(), "cs1:20000");
            }
            other => panic!("unexpected rpc {:?}", other),
        }

        // Success: the map shows three replicas again, none of them cs1.
        lm.rpc_reply("cs4:20000", seq, true, 5);
        let ids: Vec<String> = lm
            .live_replicas(ChunkId(1))
            .iter()
            .map(|cs| cs.id())
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&"cs1:20000".to_string()));
        assert!(!lm.replication_pending().contains(&ChunkId(1)));
    }

    #[test]
    fn test_over_replication_deletes_extra() {
        let mut lm = manager();
        lm.register_chunk(ChunkId(1), Fid(10), ChunkVersion(1), 1);
        lm.add_new_server(&hello("cs1", vec![(ChunkId(1), None)]), 0);
        lm.add_new_server(&hello("cs2", vec![(ChunkId(1), None)]), 0);
        for id in lm.server_ids() {
            lm.server(&id).unwrap().take_outbound();
        }

        let (_, deleted) = lm.chunk_replication_check();
        assert_eq!(deleted, 1);
        assert_eq!(lm.live_replicas(ChunkId(1)).len(), 1);
    }

    #[test]
    fn test_write_lease_extend_and_fresh() {
        let mut lm = manager();
        lm.register_chunk(ChunkId(1), Fid(10), ChunkVersion(1), 1);
        lm.add_new_server(&hello("cs1", vec![(ChunkId(1), None)]), 0);

        assert!(matches!(
            lm.write_lease_state(ChunkId(1), 0),
            WriteLeaseState::NeedsFresh
        ));

        let plan = lm
            .begin_version_change(3, ChunkId(1), ChunkVersion(3), 0)
            .unwrap();
        assert_eq!(plan.servers, vec!["cs1:20000".to_string()]);
        match lm.write_lease_state(ChunkId(1), 30) {
            WriteLeaseState::Valid { version, .. } => assert_eq!(version, ChunkVersion(3)),
            other => panic!("expected valid lease, got {:?}", other),
        }
        // Expired again after the interval.
        assert!(matches!(
            lm.write_lease_state(ChunkId(1), 200),
            WriteLeaseState::NeedsFresh
        ));
    }

    #[test]
    fn test_version_change_without_replicas_fails() {
        let mut lm = manager();
        lm.register_chunk(ChunkId(1), Fid(10), ChunkVersion(1), 1);
        let err = lm
            .begin_version_change(3, ChunkId(1), ChunkVersion(2), 0)
            .unwrap_err();
        assert_eq!(err.code(), KfsCode::EDATAUNAVAIL);
    }

    #[test]
    fn test_read_lease_requires_known_chunk() {
        let mut lm = manager();
        assert_eq!(
            lm.get_chunk_read_lease(ChunkId(1), 0).unwrap_err().code(),
            Errno::ENOENT
        );
        lm.register_chunk(ChunkId(1), Fid(10), ChunkVersion(1), 1);
        assert!(lm.get_chunk_read_lease(ChunkId(1), 0).is_ok());
    }

    #[test]
    fn test_heartbeat_tick_downs_after_missed() {
        let mut lm = LayoutManager::new(LayoutConfig {
            heartbeat_interval_secs: 60,
            heartbeat_max_missed: 3,
            ..LayoutConfig::default()
        });
        lm.add_new_server(&hello("cs1", vec![]), 0);

        for i in 1..=3 {
            assert!(lm.heartbeat_tick(i * 60).is_empty(), "tick {}", i);
        }
        let downed = lm.heartbeat_tick(4 * 60);
        assert_eq!(downed, vec!["cs1:20000".to_string()]);
    }

    #[test]
    fn test_delete_chunk_notifies_replicas() {
        let mut lm = manager();
        lm.register_chunk(ChunkId(1), Fid(10), ChunkVersion(1), 1);
        lm.add_new_server(&hello("cs1", vec![(ChunkId(1), None)]), 0);
        let cs = lm.server("cs1:20000").unwrap();
        cs.take_outbound();

        lm.delete_chunk(ChunkId(1));
        let sent = cs.take_outbound();
        assert!(sent
            .iter()
            .any(|(_, rpc)| *rpc == ChunkRpc::Delete { chunk_id: ChunkId(1) }));
        assert!(lm.chunk_entry(ChunkId(1)).is_none());
    }

    #[test]
    fn test_ping_servers_lists_active() {
        let mut lm = manager();
        lm.add_new_server(&hello("cs1", vec![]), 0);
        lm.add_new_server(&hello("cs2", vec![]), 0);
        let out = lm.ping_servers();
        assert!(out.contains("n=cs1, p=20000"));
        assert!(out.contains("; n=cs2, p=20000"));
    }
}
