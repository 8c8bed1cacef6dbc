//! The metadata tree proper: namespace operators over the ordered keyspace,
//! the global id counters, the dumpster, and the checkpoint leaf walk.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::ops::Bound;

use kfs_types::{
    make_error, ChunkId, ChunkOff, ChunkVersion, Errno, Fid, FileKind, Result, CHUNK_SIZE,
    ROOT_FID,
};

use crate::key::MetaKey;
use crate::record::{ChunkInfo, DirEntry, FileAttr, MetaRecord};

/// Result of `allocate_chunk_id`: either a freshly minted chunk id or the
/// values already assigned at this (file, offset), in which case the caller
/// takes the lease path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocOutcome {
    New {
        chunk_id: ChunkId,
        version: ChunkVersion,
        num_replicas: u32,
    },
    Exists {
        chunk_id: ChunkId,
        version: ChunkVersion,
        num_replicas: u32,
    },
}

/// Result of `truncate`: done, or an allocation is required at `offset`
/// before the truncate can complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateOutcome {
    Done,
    NeedsAllocAt(ChunkOff),
}

/// One leaf of the keyspace. The skip flag supports the checkpoint walk: a
/// leaf whose pre-checkpoint state was captured on the zombie list is marked
/// skip so the walk does not dump it a second time.
#[derive(Debug, Clone)]
struct Leaf {
    record: MetaRecord,
    skip: bool,
}

/// Checkpoint walk state. `cursor` is the key of the last leaf handed to the
/// checkpoint writer; everything at or before it is already dumped.
#[derive(Debug, Default)]
struct CpWalk {
    active: bool,
    cursor: Option<MetaKey>,
    zombies: Vec<String>,
}

/// The metadata tree. Owned by the request processor; the checkpoint writer
/// drives the leaf walk through the `cp_*` methods while mutations continue.
pub struct MetaTree {
    records: BTreeMap<MetaKey, Leaf>,
    fid_seed: u64,
    chunk_seed: u64,
    chunk_version_inc: u64,
    dumpster: VecDeque<ChunkInfo>,
    cp: CpWalk,
}

impl MetaTree {
    /// A tree holding only the root directory. The fid seed starts at the
    /// root's id; the first created file gets fid 3.
    pub fn new(now: i64) -> Self {
        let mut tree = Self {
            records: BTreeMap::new(),
            fid_seed: *ROOT_FID,
            chunk_seed: 0,
            chunk_version_inc: 1,
            dumpster: VecDeque::new(),
            cp: CpWalk::default(),
        };
        tree.insert_record(MetaRecord::Fattr(FileAttr::new(
            ROOT_FID,
            FileKind::Dir,
            1,
            now,
        )));
        tree.insert_record(MetaRecord::Dentry(DirEntry {
            dir: ROOT_FID,
            name: "/".to_string(),
            fid: ROOT_FID,
        }));
        tree
    }

    /// An empty shell for recovery; records and seeds are loaded from the
    /// checkpoint.
    pub fn empty() -> Self {
        Self {
            records: BTreeMap::new(),
            fid_seed: *ROOT_FID,
            chunk_seed: 0,
            chunk_version_inc: 1,
            dumpster: VecDeque::new(),
            cp: CpWalk::default(),
        }
    }

    // ---- counters ----

    pub fn fid_seed(&self) -> u64 {
        self.fid_seed
    }

    pub fn chunk_seed(&self) -> u64 {
        self.chunk_seed
    }

    pub fn chunk_version_inc(&self) -> u64 {
        self.chunk_version_inc
    }

    pub fn set_seeds(&mut self, fid_seed: u64, chunk_seed: u64, chunk_version_inc: u64) {
        self.fid_seed = fid_seed.max(*ROOT_FID);
        self.chunk_seed = chunk_seed;
        self.chunk_version_inc = chunk_version_inc.max(1);
    }

    /// Advance the fid seed past an id observed during log replay.
    pub fn note_fid(&mut self, fid: Fid) {
        self.fid_seed = self.fid_seed.max(*fid);
    }

    /// Advance the chunk id seed past an id observed during log replay.
    pub fn note_chunk_id(&mut self, chunk_id: ChunkId) {
        self.chunk_seed = self.chunk_seed.max(*chunk_id);
    }

    /// Bump the incarnation counter; the new value must hit the log before
    /// any response that depends on it.
    pub fn bump_chunk_version_inc(&mut self) -> u64 {
        self.chunk_version_inc += 1;
        self.chunk_version_inc
    }

    /// Replay of a `chunkVersionInc` log record.
    pub fn set_chunk_version_inc(&mut self, value: u64) {
        self.chunk_version_inc = self.chunk_version_inc.max(value);
    }

    fn next_fid(&mut self) -> Fid {
        self.fid_seed += 1;
        Fid(self.fid_seed)
    }

    fn next_chunk_id(&mut self) -> ChunkId {
        self.chunk_seed += 1;
        ChunkId(self.chunk_seed)
    }

    // ---- low-level record access ----

    fn cp_dumped(&self, key: &MetaKey) -> bool {
        match &self.cp.cursor {
            Some(cursor) => key <= cursor,
            None => false,
        }
    }

    fn insert_record(&mut self, record: MetaRecord) {
        let key = record.key();
        let mut skip = false;
        if self.cp.active && !self.cp_dumped(&key) {
            if let Some(old) = self.records.get(&key) {
                if !old.skip {
                    self.cp.zombies.push(old.record.checkpoint_line());
                }
                skip = true;
            }
        }
        self.records.insert(key, Leaf { record, skip });
    }

    fn remove_record(&mut self, key: &MetaKey) -> Option<MetaRecord> {
        let leaf = self.records.remove(key)?;
        if self.cp.active && !self.cp_dumped(key) && !leaf.skip {
            self.cp.zombies.push(leaf.record.checkpoint_line());
        }
        Some(leaf.record)
    }

    /// Load one record during recovery, bypassing mutation-time bookkeeping.
    pub fn insert_restored(&mut self, record: MetaRecord) {
        let key = record.key();
        self.records.insert(
            key,
            Leaf {
                record,
                skip: false,
            },
        );
    }

    pub fn get_fattr(&self, fid: Fid) -> Option<&FileAttr> {
        match self.records.get(&MetaKey::Fattr(fid)) {
            Some(Leaf {
                record: MetaRecord::Fattr(fa),
                ..
            }) => Some(fa),
            _ => None,
        }
    }

    fn update_fattr(&mut self, fid: Fid, f: impl FnOnce(&mut FileAttr)) {
        if let Some(mut fa) = self.get_fattr(fid).cloned() {
            f(&mut fa);
            self.insert_record(MetaRecord::Fattr(fa));
        }
    }

    pub fn lookup_dentry(&self, dir: Fid, name: &str) -> Option<&DirEntry> {
        let key = MetaKey::Dentry {
            dir,
            name: name.to_string(),
        };
        match self.records.get(&key) {
            Some(Leaf {
                record: MetaRecord::Dentry(de),
                ..
            }) => Some(de),
            _ => None,
        }
    }

    fn dentry_keys(&self, dir: Fid) -> Vec<MetaKey> {
        self.records
            .range((
                Bound::Included(MetaKey::dentry_range_start(dir)),
                Bound::Unbounded,
            ))
            .take_while(|(k, _)| k.in_dentry_range(dir))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn chunk_records(&self, fid: Fid) -> Vec<ChunkInfo> {
        self.records
            .range((
                Bound::Included(MetaKey::chunk_range_start(fid)),
                Bound::Unbounded,
            ))
            .take_while(|(k, _)| k.in_chunk_range(fid))
            .filter_map(|(_, leaf)| match &leaf.record {
                MetaRecord::Chunk(ci) => Some(ci.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Every chunk record in the tree, in key order. Used to rebuild the
    /// layout manager's chunk table after recovery.
    pub fn all_chunks(&self) -> Vec<ChunkInfo> {
        self.records
            .values()
            .filter_map(|leaf| match &leaf.record {
                MetaRecord::Chunk(ci) => Some(ci.clone()),
                _ => None,
            })
            .collect()
    }

    // ---- namespace operators ----

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return make_error(Errno::EINVAL);
        }
        Ok(())
    }

    fn lookup_dir(&self, dir: Fid) -> Result<&FileAttr> {
        let fa = self.get_fattr(dir).ok_or(Errno::ENOENT)?;
        if !fa.kind.is_dir() {
            return make_error(Errno::ENOTDIR);
        }
        Ok(fa)
    }

    /// One-step lookup of `name` inside `dir`.
    pub fn lookup(&self, dir: Fid, name: &str) -> Result<FileAttr> {
        let de = self.lookup_dentry(dir, name).ok_or(Errno::ENOENT)?;
        self.get_fattr(de.fid).cloned().ok_or_else(|| Errno::ENOENT.into())
    }

    /// Segmented path traversal. Absolute paths start at the root; `.` and
    /// `..` are resolved against the traversal stack.
    pub fn lookup_path(&self, start: Fid, path: &str) -> Result<FileAttr> {
        let start = if path.starts_with('/') { ROOT_FID } else { start };
        let mut stack = vec![start];
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            match seg {
                "." => continue,
                ".." => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                }
                _ => {
                    let cur = *stack.last().expect("traversal stack is never empty");
                    let de = self.lookup_dentry(cur, seg).ok_or(Errno::ENOENT)?;
                    stack.push(de.fid);
                }
            }
        }
        let fid = *stack.last().expect("traversal stack is never empty");
        self.get_fattr(fid).cloned().ok_or_else(|| Errno::ENOENT.into())
    }

    /// Create a file under `dir`. Returns the fresh fid.
    pub fn create(&mut self, dir: Fid, name: &str, num_replicas: u32, now: i64) -> Result<Fid> {
        Self::validate_name(name)?;
        self.lookup_dir(dir)?;
        if self.lookup_dentry(dir, name).is_some() {
            return make_error(Errno::EEXIST);
        }
        let fid = self.next_fid();
        self.link_new(dir, name, fid, FileKind::File, num_replicas, now);
        Ok(fid)
    }

    /// Create a file with a caller-supplied fid; the log replay path.
    pub fn create_with_fid(
        &mut self,
        dir: Fid,
        name: &str,
        fid: Fid,
        num_replicas: u32,
        now: i64,
    ) -> Result<()> {
        Self::validate_name(name)?;
        self.lookup_dir(dir)?;
        if self.lookup_dentry(dir, name).is_some() {
            return make_error(Errno::EEXIST);
        }
        self.note_fid(fid);
        self.link_new(dir, name, fid, FileKind::File, num_replicas, now);
        Ok(())
    }

    /// Create a directory under `dir`. Returns the fresh fid.
    pub fn mkdir(&mut self, dir: Fid, name: &str, now: i64) -> Result<Fid> {
        Self::validate_name(name)?;
        self.lookup_dir(dir)?;
        if self.lookup_dentry(dir, name).is_some() {
            return make_error(Errno::EEXIST);
        }
        let fid = self.next_fid();
        self.link_new(dir, name, fid, FileKind::Dir, 1, now);
        Ok(fid)
    }

    /// Directory creation with a caller-supplied fid; the log replay path.
    pub fn mkdir_with_fid(&mut self, dir: Fid, name: &str, fid: Fid, now: i64) -> Result<()> {
        Self::validate_name(name)?;
        self.lookup_dir(dir)?;
        if self.lookup_dentry(dir, name).is_some() {
            return make_error(Errno::EEXIST);
        }
        self.note_fid(fid);
        self.link_new(dir, name, fid, FileKind::Dir, 1, now);
        Ok(())
    }

    fn link_new(
        &mut self,
        dir: Fid,
        name: &str,
        fid: Fid,
        kind: FileKind,
        num_replicas: u32,
        now: i64,
    ) {
        self.insert_record(MetaRecord::Fattr(FileAttr::new(fid, kind, num_replicas, now)));
        self.insert_record(MetaRecord::Dentry(DirEntry {
            dir,
            name: name.to_string(),
            fid,
        }));
        self.update_fattr(dir, |fa| fa.mtime = now);
    }

    /// Remove a file. Its chunk records move to the dumpster; the attribute
    /// and directory entry are dropped in the same operation.
    pub fn remove(&mut self, dir: Fid, name: &str, now: i64) -> Result<()> {
        let de = self.lookup_dentry(dir, name).cloned().ok_or(Errno::ENOENT)?;
        let fa = self.get_fattr(de.fid).cloned().ok_or(Errno::ENOENT)?;
        if fa.kind.is_dir() {
            return make_error(Errno::EISDIR);
        }
        let chunks = self.chunk_records(de.fid);
        if !chunks.is_empty() {
            tracing::debug!(fid = *de.fid, chunks = chunks.len(), "moving chunks to dumpster");
        }
        for chunk in chunks {
            self.remove_record(&chunk.key_of());
            self.dumpster.push_back(chunk);
        }
        self.remove_record(&MetaKey::Fattr(de.fid));
        self.remove_record(&MetaKey::Dentry {
            dir,
            name: name.to_string(),
        });
        self.update_fattr(dir, |fa| fa.mtime = now);
        Ok(())
    }

    /// Remove an empty directory. Refuses files, non-empty directories, and
    /// the root.
    pub fn rmdir(&mut self, dir: Fid, name: &str, now: i64) -> Result<()> {
        let de = self.lookup_dentry(dir, name).cloned().ok_or(Errno::ENOENT)?;
        let fa = self.get_fattr(de.fid).cloned().ok_or(Errno::ENOENT)?;
        if !fa.kind.is_dir() {
            return make_error(Errno::ENOTDIR);
        }
        if de.fid == ROOT_FID {
            return make_error(Errno::EPERM);
        }
        if !self.dentry_keys(de.fid).is_empty() {
            return make_error(Errno::ENOTEMPTY);
        }
        self.remove_record(&MetaKey::Fattr(de.fid));
        self.remove_record(&MetaKey::Dentry {
            dir,
            name: name.to_string(),
        });
        self.update_fattr(dir, |fa| fa.mtime = now);
        Ok(())
    }

    /// Rename within one directory. When `overwrite` is set and both sides
    /// are files, the existing target is removed first.
    pub fn rename(
        &mut self,
        dir: Fid,
        old_name: &str,
        new_name: &str,
        overwrite: bool,
        now: i64,
    ) -> Result<()> {
        // Cross-directory rename is not supported; a path in the new name is
        // rejected outright.
        Self::validate_name(new_name)?;
        let de = self
            .lookup_dentry(dir, old_name)
            .cloned()
            .ok_or(Errno::ENOENT)?;
        if de.fid == ROOT_FID {
            return make_error(Errno::EPERM);
        }
        if old_name == new_name {
            return Ok(());
        }
        if let Some(target) = self.lookup_dentry(dir, new_name).cloned() {
            if !overwrite {
                return make_error(Errno::EEXIST);
            }
            let src_fa = self.get_fattr(de.fid).cloned().ok_or(Errno::ENOENT)?;
            let dst_fa = self.get_fattr(target.fid).cloned().ok_or(Errno::ENOENT)?;
            if src_fa.kind.is_dir() || dst_fa.kind.is_dir() {
                return make_error(Errno::EISDIR);
            }
            self.remove(dir, new_name, now)?;
        }
        self.remove_record(&MetaKey::Dentry {
            dir,
            name: old_name.to_string(),
        });
        self.insert_record(MetaRecord::Dentry(DirEntry {
            dir,
            name: new_name.to_string(),
            fid: de.fid,
        }));
        self.update_fattr(dir, |fa| fa.mtime = now);
        Ok(())
    }

    /// All entries of a directory, in name order. The root's self-entry is
    /// included; the responder filters it.
    pub fn readdir(&self, dir: Fid) -> Result<Vec<DirEntry>> {
        self.lookup_dir(dir)?;
        Ok(self
            .dentry_keys(dir)
            .iter()
            .filter_map(|k| match &self.records.get(k)?.record {
                MetaRecord::Dentry(de) => Some(de.clone()),
                _ => None,
            })
            .collect())
    }

    /// Chunk info at one (file, offset).
    pub fn getalloc(&self, fid: Fid, offset: ChunkOff) -> Result<ChunkInfo> {
        self.get_fattr(fid).ok_or(Errno::ENOENT)?;
        match self.records.get(&MetaKey::Chunk { fid, offset }) {
            Some(Leaf {
                record: MetaRecord::Chunk(ci),
                ..
            }) => Ok(ci.clone()),
            _ => make_error(Errno::ENOENT),
        }
    }

    /// All chunks of a file, in offset order.
    pub fn getalloc_all(&self, fid: Fid) -> Result<Vec<ChunkInfo>> {
        self.get_fattr(fid).ok_or(Errno::ENOENT)?;
        Ok(self.chunk_records(fid))
    }

    /// Version of a chunk of a file, if the file still references it.
    pub fn get_chunk_version(&self, fid: Fid, chunk_id: ChunkId) -> Option<ChunkVersion> {
        self.chunk_records(fid)
            .into_iter()
            .find(|ci| ci.chunk_id == chunk_id)
            .map(|ci| ci.version)
    }

    /// Reserve a chunk id for (file, offset), or report the values already
    /// assigned there.
    pub fn allocate_chunk_id(&mut self, fid: Fid, offset: ChunkOff) -> Result<AllocOutcome> {
        if offset % CHUNK_SIZE != 0 {
            return make_error(Errno::EINVAL);
        }
        let fa = self.get_fattr(fid).ok_or(Errno::ENOENT)?;
        if fa.kind.is_dir() {
            return make_error(Errno::EISDIR);
        }
        let num_replicas = fa.num_replicas;
        if let Some(Leaf {
            record: MetaRecord::Chunk(ci),
            ..
        }) = self.records.get(&MetaKey::Chunk { fid, offset })
        {
            return Ok(AllocOutcome::Exists {
                chunk_id: ci.chunk_id,
                version: ci.version,
                num_replicas,
            });
        }
        Ok(AllocOutcome::New {
            chunk_id: self.next_chunk_id(),
            version: ChunkVersion(1),
            num_replicas,
        })
    }

    /// Bind a chunk id (and version) to (file, offset). Called after the
    /// chunk servers have confirmed creation, and by log replay. Re-assigning
    /// an existing offset updates the version in place.
    pub fn assign_chunk_id(
        &mut self,
        fid: Fid,
        offset: ChunkOff,
        chunk_id: ChunkId,
        version: ChunkVersion,
        now: i64,
    ) -> Result<()> {
        if offset % CHUNK_SIZE != 0 {
            return make_error(Errno::EINVAL);
        }
        let fa = self.get_fattr(fid).ok_or(Errno::ENOENT)?;
        if fa.kind.is_dir() {
            return make_error(Errno::EISDIR);
        }
        self.note_chunk_id(chunk_id);
        let fresh = !self
            .records
            .contains_key(&MetaKey::Chunk { fid, offset });
        self.insert_record(MetaRecord::Chunk(ChunkInfo {
            fid,
            offset,
            chunk_id,
            version,
        }));
        self.update_fattr(fid, |fa| {
            if fresh {
                fa.chunk_count += 1;
            }
            fa.mtime = now;
        });
        Ok(())
    }

    /// Truncate a file to `new_len` bytes. Shrinking drops trailing chunks
    /// into the dumpster; extending asks the caller to allocate the first
    /// missing chunk and retry.
    pub fn truncate(&mut self, fid: Fid, new_len: u64, now: i64) -> Result<TruncateOutcome> {
        let fa = self.get_fattr(fid).ok_or(Errno::ENOENT)?;
        if fa.kind.is_dir() {
            return make_error(Errno::EISDIR);
        }
        let mut remaining = 0u64;
        for chunk in self.chunk_records(fid) {
            if chunk.offset >= new_len {
                self.remove_record(&chunk.key_of());
                self.dumpster.push_back(chunk);
            } else {
                remaining += 1;
            }
        }
        self.update_fattr(fid, |fa| {
            fa.chunk_count = remaining;
            fa.mtime = now;
        });
        let mut offset = 0;
        while offset < new_len {
            if !self
                .records
                .contains_key(&MetaKey::Chunk { fid, offset })
            {
                return Ok(TruncateOutcome::NeedsAllocAt(offset));
            }
            offset += CHUNK_SIZE;
        }
        Ok(TruncateOutcome::Done)
    }

    // ---- dumpster ----

    pub fn dumpster_len(&self) -> usize {
        self.dumpster.len()
    }

    /// Drain the dumpster; the caller issues the chunk-delete RPCs.
    pub fn drain_dumpster(&mut self) -> Vec<ChunkInfo> {
        self.dumpster.drain(..).collect()
    }

    // ---- checkpoint leaf walk ----

    pub fn cp_active(&self) -> bool {
        self.cp.active
    }

    /// Begin a leaf walk. Mutations from here on capture pre-checkpoint
    /// state on the zombie list when the walk has not yet passed them.
    pub fn cp_begin(&mut self) {
        self.cp.active = true;
        self.cp.cursor = None;
        self.cp.zombies.clear();
    }

    /// Hand the next batch of leaves to the checkpoint writer, in key order.
    /// Skip-flagged leaves are cleared and contribute no line. Returns the
    /// rendered lines; an empty batch means the walk is complete.
    pub fn cp_next_batch(&mut self, max: usize) -> Vec<String> {
        let start = match &self.cp.cursor {
            Some(cursor) => Bound::Excluded(cursor.clone()),
            None => Bound::Unbounded,
        };
        let visited: Vec<MetaKey> = self
            .records
            .range((start, Bound::Unbounded))
            .take(max)
            .map(|(k, _)| k.clone())
            .collect();
        let mut lines = Vec::with_capacity(visited.len());
        for key in &visited {
            let leaf = self
                .records
                .get_mut(key)
                .expect("visited key cannot vanish while the tree lock is held");
            if leaf.skip {
                leaf.skip = false;
            } else {
                lines.push(leaf.record.checkpoint_line());
            }
        }
        if let Some(last) = visited.last() {
            self.cp.cursor = Some(last.clone());
        }
        lines
    }

    /// Leaves retired since the walk began, rendered for the checkpoint.
    pub fn cp_drain_zombies(&mut self) -> Vec<String> {
        std::mem::take(&mut self.cp.zombies)
    }

    pub fn cp_end(&mut self) {
        self.cp.active = false;
        self.cp.cursor = None;
        self.cp.zombies.clear();
    }
}

impl ChunkInfo {
    fn key_of(&self) -> MetaKey {
        MetaKey::Chunk {
            fid: self.fid,
            offset: self.offset,
        }
    }
}
