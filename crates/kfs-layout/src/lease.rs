//! Chunk leases.
//!
//! A write lease grants one holder exclusive write coordination through the
//! designated master replica; read leases can be held concurrently but never
//! alongside a write lease. Leases expire at a wall-clock deadline and are
//! reclaimed by the periodic cleanup sweep.

use std::collections::HashMap;

use kfs_proto::LeaseType;
use kfs_types::{make_error, ChunkId, Errno, KfsCode, LeaseId, Result};

#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    pub lease_type: LeaseType,
    pub expiry: i64,
    /// Master replica (`host:port`) for write leases.
    pub master: Option<String>,
}

impl Lease {
    pub fn valid_at(&self, now: i64) -> bool {
        now < self.expiry
    }
}

/// All outstanding leases, keyed by chunk.
pub struct LeaseTable {
    leases: HashMap<ChunkId, Vec<Lease>>,
    next_id: u64,
    interval: i64,
}

impl LeaseTable {
    pub fn new(interval: i64) -> Self {
        Self {
            leases: HashMap::new(),
            next_id: 0,
            interval,
        }
    }

    fn mint(&mut self) -> LeaseId {
        self.next_id += 1;
        LeaseId(self.next_id)
    }

    /// The valid write lease on a chunk, if any.
    pub fn valid_write(&self, chunk_id: ChunkId, now: i64) -> Option<&Lease> {
        self.leases.get(&chunk_id)?.iter().find(|l| {
            l.lease_type == LeaseType::Write && l.valid_at(now)
        })
    }

    /// Whether a fresh write lease could be issued right now.
    pub fn can_issue_write(&self, chunk_id: ChunkId, now: i64) -> bool {
        self.valid_write(chunk_id, now).is_none() && !self.has_valid_read(chunk_id, now)
    }

    fn has_valid_read(&self, chunk_id: ChunkId, now: i64) -> bool {
        self.leases
            .get(&chunk_id)
            .map(|ls| {
                ls.iter()
                    .any(|l| l.lease_type == LeaseType::Read && l.valid_at(now))
            })
            .unwrap_or(false)
    }

    /// Issue a read lease. Refused while a write lease is outstanding.
    pub fn issue_read(&mut self, chunk_id: ChunkId, now: i64) -> Result<LeaseId> {
        if self.valid_write(chunk_id, now).is_some() {
            return make_error(Errno::EBUSY);
        }
        let id = self.mint();
        let expiry = now + self.interval;
        self.leases.entry(chunk_id).or_default().push(Lease {
            id,
            lease_type: LeaseType::Read,
            expiry,
            master: None,
        });
        Ok(id)
    }

    /// Issue a fresh write lease. Refused while read leases are outstanding;
    /// any expired leases on the chunk are dropped first.
    pub fn issue_write(
        &mut self,
        chunk_id: ChunkId,
        master: String,
        now: i64,
    ) -> Result<LeaseId> {
        if self.has_valid_read(chunk_id, now) || self.valid_write(chunk_id, now).is_some() {
            return make_error(Errno::EBUSY);
        }
        if let Some(ls) = self.leases.get_mut(&chunk_id) {
            ls.retain(|l| l.valid_at(now));
        }
        let id = self.mint();
        let expiry = now + self.interval;
        self.leases.entry(chunk_id).or_default().push(Lease {
            id,
            lease_type: LeaseType::Write,
            expiry,
            master: Some(master),
        });
        Ok(id)
    }

    /// Extend the expiry of a still-valid write lease.
    pub fn extend_write(&mut self, chunk_id: ChunkId, now: i64) -> Option<&Lease> {
        let interval = self.interval;
        let ls = self.leases.get_mut(&chunk_id)?;
        let lease = ls
            .iter_mut()
            .find(|l| l.lease_type == LeaseType::Write && now < l.expiry)?;
        lease.expiry = now + interval;
        Some(lease)
    }

    /// Validate lease id and type, then extend if unexpired.
    pub fn renew(
        &mut self,
        chunk_id: ChunkId,
        lease_id: LeaseId,
        lease_type: LeaseType,
        now: i64,
    ) -> Result<()> {
        let interval = self.interval;
        let ls = match self.leases.get_mut(&chunk_id) {
            Some(ls) => ls,
            None => return make_error(KfsCode::ELEASEEXPIRED),
        };
        match ls.iter_mut().find(|l| l.id == lease_id) {
            Some(lease) => {
                if lease.lease_type != lease_type {
                    return make_error(Errno::EINVAL);
                }
                if !lease.valid_at(now) {
                    return make_error(KfsCode::ELEASEEXPIRED);
                }
                lease.expiry = now + interval;
                Ok(())
            }
            None => make_error(KfsCode::ELEASEEXPIRED),
        }
    }

    /// Drop expired leases; returns how many were reclaimed.
    pub fn cleanup(&mut self, now: i64) -> usize {
        let mut reclaimed = 0;
        self.leases.retain(|_, ls| {
            let before = ls.len();
            ls.retain(|l| l.valid_at(now));
            reclaimed += before - ls.len();
            !ls.is_empty()
        });
        reclaimed
    }

    pub fn lease_count(&self) -> usize {
        self.leases.values().map(|ls| ls.len()).sum()
    }
}
