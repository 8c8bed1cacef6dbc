//! Replica placement policy.
//!
//! Candidates exclude servers already hosting the chunk and servers below
//! the free-space threshold. Among candidates the least-utilized wins, with
//! ties broken at random. The write master is the replica with the lowest
//! observed heartbeat round-trip, else the first.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::chunk_server::ChunkServer;

/// Pick up to `count` distinct servers for new replicas.
pub fn choose_replicas(
    candidates: &[Arc<ChunkServer>],
    exclude: &HashSet<String>,
    min_free_ratio: f64,
    count: usize,
) -> Vec<Arc<ChunkServer>> {
    let mut eligible: Vec<Arc<ChunkServer>> = candidates
        .iter()
        .filter(|cs| cs.is_active())
        .filter(|cs| !exclude.contains(&cs.id()))
        .filter(|cs| cs.free_ratio() >= min_free_ratio)
        .cloned()
        .collect();

    // Shuffle first so equal-ratio servers come out in random order, then a
    // stable sort by utilization keeps the shuffle as the tie-break.
    eligible.shuffle(&mut rand::thread_rng());
    eligible.sort_by(|a, b| {
        a.used_ratio()
            .partial_cmp(&b.used_ratio())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    eligible.truncate(count);
    eligible
}

/// Designate the write master: lowest observed RTT, else arbitrary.
pub fn pick_master(replicas: &[Arc<ChunkServer>]) -> Option<Arc<ChunkServer>> {
    replicas
        .iter()
        .min_by_key(|cs| cs.rtt_ms().unwrap_or(u64::MAX))
        .or_else(|| replicas.first())
        .cloned()
}
