//! Per-chunk-server session state.
//!
//! A session is created on HELLO, driven through
//! `Unknown -> HelloReceived -> Active -> (Down | Stale)`, and owns the
//! outbound RPC queue for its server. RPCs carry a per-session sequence
//! number; replies are matched back by that number.
//!
//! Sessions are shared: the registry owns the `Arc`, the chunk-to-server
//! mapping holds weak references, and suspended ops hold strong references
//! for the duration of their RPCs.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use kfs_proto::ChunkRpc;
use kfs_types::{Seq, ServerLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    HelloReceived,
    Active,
    Down,
    /// Replaced by a newer session for the same location.
    Stale,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    total_space: u64,
    used_space: u64,
    /// Round-trip latency observed on heartbeat replies, in milliseconds.
    rtt_ms: Option<u64>,
    last_heard: i64,
    missed_heartbeats: u32,
    next_seq: Seq,
    outbound: VecDeque<(Seq, ChunkRpc)>,
    inflight: HashMap<Seq, ChunkRpc>,
}

/// One chunk server's session.
#[derive(Debug)]
pub struct ChunkServer {
    location: ServerLocation,
    inner: Mutex<Inner>,
}

impl ChunkServer {
    pub fn new(location: ServerLocation, total_space: u64, used_space: u64, now: i64) -> Self {
        Self {
            location,
            inner: Mutex::new(Inner {
                state: SessionState::HelloReceived,
                total_space,
                used_space,
                rtt_ms: None,
                last_heard: now,
                missed_heartbeats: 0,
                next_seq: 1,
                outbound: VecDeque::new(),
                inflight: HashMap::new(),
            }),
        }
    }

    pub fn location(&self) -> &ServerLocation {
        &self.location
    }

    /// Registry key: `host:port`.
    pub fn id(&self) -> String {
        self.location.id()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn activate(&self) {
        self.inner.lock().state = SessionState::Active;
    }

    pub fn mark_down(&self) {
        self.inner.lock().state = SessionState::Down;
    }

    /// Called when a fresh HELLO replaces this session.
    pub fn mark_stale(&self) {
        self.inner.lock().state = SessionState::Stale;
    }

    pub fn total_space(&self) -> u64 {
        self.inner.lock().total_space
    }

    pub fn used_space(&self) -> u64 {
        self.inner.lock().used_space
    }

    pub fn update_space(&self, total: u64, used: u64) {
        let mut inner = self.inner.lock();
        inner.total_space = total;
        inner.used_space = used;
    }

    /// Used-to-total space ratio; full when the server advertises no space.
    pub fn used_ratio(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.total_space == 0 {
            1.0
        } else {
            inner.used_space as f64 / inner.total_space as f64
        }
    }

    /// Fraction of advertised space still free.
    pub fn free_ratio(&self) -> f64 {
        1.0 - self.used_ratio()
    }

    pub fn rtt_ms(&self) -> Option<u64> {
        self.inner.lock().rtt_ms
    }

    pub fn note_rtt(&self, rtt_ms: u64) {
        self.inner.lock().rtt_ms = Some(rtt_ms);
    }

    pub fn last_heard(&self) -> i64 {
        self.inner.lock().last_heard
    }

    /// Queue an RPC for delivery; returns its sequence number.
    pub fn enqueue(&self, rpc: ChunkRpc) -> Seq {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        tracing::debug!(server = %self.location.id(), seq, rpc = rpc.name(), "queued rpc");
        inner.outbound.push_back((seq, rpc));
        seq
    }

    /// Drain queued RPCs for transmission; they stay in flight until their
    /// replies arrive.
    pub fn take_outbound(&self) -> Vec<(Seq, ChunkRpc)> {
        let mut inner = self.inner.lock();
        let drained: Vec<(Seq, ChunkRpc)> = inner.outbound.drain(..).collect();
        for (seq, rpc) in &drained {
            inner.inflight.insert(*seq, rpc.clone());
        }
        drained
    }

    pub fn inflight_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.inflight.len() + inner.outbound.len()
    }

    /// Match a reply to its RPC. Any reply counts as liveness.
    pub fn match_reply(&self, seq: Seq, now: i64) -> Option<ChunkRpc> {
        let mut inner = self.inner.lock();
        inner.last_heard = now;
        inner.missed_heartbeats = 0;
        // A reply may race the drain; check both sides.
        if let Some(rpc) = inner.inflight.remove(&seq) {
            return Some(rpc);
        }
        if let Some(pos) = inner.outbound.iter().position(|(s, _)| *s == seq) {
            return inner.outbound.remove(pos).map(|(_, rpc)| rpc);
        }
        None
    }

    /// Whether the session has been idle for at least `interval` seconds.
    pub fn heartbeat_due(&self, now: i64, interval: i64) -> bool {
        now - self.last_heard() >= interval
    }

    /// Count one missed heartbeat interval; returns the new total.
    pub fn note_missed_heartbeat(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.missed_heartbeats += 1;
        inner.missed_heartbeats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_types::{ChunkId, ChunkVersion, Fid};

    fn session() -> ChunkServer {
        ChunkServer::new(ServerLocation::new("cs1", 20000), 1000, 100, 0)
    }

    #[test]
    fn test_lifecycle() {
        let cs = session();
        assert_eq!(cs.state(), SessionState::HelloReceived);
        cs.activate();
        assert!(cs.is_active());
        cs.mark_down();
        assert_eq!(cs.state(), SessionState::Down);
    }

    #[test]
    fn test_rpc_seq_and_reply_matching() {
        let cs = session();
        let s1 = cs.enqueue(ChunkRpc::Heartbeat);
        let s2 = cs.enqueue(ChunkRpc::Delete {
            chunk_id: ChunkId(9),
        });
        assert!(s2 > s1);

        let sent = cs.take_outbound();
        assert_eq!(sent.len(), 2);
        assert_eq!(cs.inflight_len(), 2);

        let rpc = cs.match_reply(s2, 5).unwrap();
        assert_eq!(rpc, ChunkRpc::Delete { chunk_id: ChunkId(9) });
        assert_eq!(cs.inflight_len(), 1);
        assert!(cs.match_reply(999, 5).is_none());
    }

    #[test]
    fn test_reply_before_drain_still_matches() {
        let cs = session();
        let seq = cs.enqueue(ChunkRpc::VersChange {
            fid: Fid(1),
            chunk_id: ChunkId(2),
            version: ChunkVersion(3),
        });
        assert!(cs.match_reply(seq, 1).is_some());
        assert!(cs.take_outbound().is_empty());
    }

    #[test]
    fn test_heartbeat_accounting() {
        let cs = session();
        assert!(!cs.heartbeat_due(30, 60));
        assert!(cs.heartbeat_due(60, 60));
        assert_eq!(cs.note_missed_heartbeat(), 1);
        assert_eq!(cs.note_missed_heartbeat(), 2);
        // Any reply resets the count.
        cs.enqueue(ChunkRpc::Heartbeat);
        let (seq, _) = cs.take_outbound().pop().unwrap();
        cs.match_reply(seq, 70).unwrap();
        assert_eq!(cs.note_missed_heartbeat(), 1);
        assert_eq!(cs.last_heard(), 70);
    }

    #[test]
    fn test_space_ratio() {
        let cs = session();
        assert!((cs.used_ratio() - 0.1).abs() < 1e-9);
        cs.update_space(1000, 900);
        assert!((cs.free_ratio() - 0.1).abs() < 1e-9);
        cs.update_space(0, 0);
        assert_eq!(cs.used_ratio(), 1.0);
    }
}
