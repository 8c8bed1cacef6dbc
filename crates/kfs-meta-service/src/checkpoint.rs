//! Periodic point-in-time snapshots of the metadata tree.
//!
//! Protocol: the checkpoint op travels through the processor and the oplog
//! writer, which rotates the log and captures the rotation sequence; the
//! checkpoint thread then dumps a header plus every leaf in key order while
//! the processor keeps running. Leaves mutated before the walk reaches them
//! are captured on the tree's zombie list and skip-flagged (see the tree
//! crate); the dump finishes with the zombies and links `latest`.
//!
//! The writer mutex guards `running`, `nostart`, `startblocked`, and the
//! mutation counter. The `nostart`/`startblocked` latches let an external
//! caller pin the checkpointer in a non-starting state.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use kfs_meta_tree::MetaTree;
use kfs_types::{Errno, Result};

use crate::oplog::OpLog;

pub type SharedTree = Arc<RwLock<MetaTree>>;

const LEAF_BATCH: usize = 256;
const CP_VERSION: u32 = 1;

#[derive(Debug, Default)]
struct CpState {
    running: bool,
    nostart: bool,
    startblocked: bool,
    mutations: u64,
    cpcount: u64,
    shutdown: bool,
}

pub struct Checkpointer {
    state: Mutex<CpState>,
    cond: Condvar,
    cp_dir: PathBuf,
    tree: SharedTree,
    oplog: Arc<OpLog>,
}

/// Checkpoint file name for a rotation sequence.
pub fn cp_file_name(seq: u64) -> String {
    format!("chkpt.{}", seq)
}

impl Checkpointer {
    pub fn new(cp_dir: PathBuf, tree: SharedTree, oplog: Arc<OpLog>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CpState::default()),
            cond: Condvar::new(),
            cp_dir,
            tree,
            oplog,
        })
    }

    pub fn cp_dir(&self) -> &PathBuf {
        &self.cp_dir
    }

    /// Count one applied mutation since the last checkpoint.
    pub fn note_mutation(&self) {
        self.state.lock().mutations += 1;
    }

    /// Rotate the log only when a checkpoint will actually be taken.
    pub fn is_cp_needed(&self) -> bool {
        let state = self.state.lock();
        !state.running && state.mutations != 0
    }

    /// Wake the checkpoint thread, unless pinned by `lock_running`.
    pub fn start_cp(&self) {
        let mut state = self.state.lock();
        if !state.running && state.mutations != 0 {
            if state.nostart {
                state.startblocked = true;
            } else {
                state.running = true;
                state.mutations = 0;
                self.cond.notify_all();
            }
        }
    }

    /// Pin the checkpointer in a non-starting state; returns whether a
    /// checkpoint is currently in progress.
    pub fn lock_running(&self) -> bool {
        let mut state = self.state.lock();
        state.nostart = true;
        state.running
    }

    /// Release the pin; a blocked start request fires now.
    pub fn unlock_running(&self) {
        let startit = {
            let mut state = self.state.lock();
            state.nostart = false;
            let startit = state.startblocked;
            state.startblocked = false;
            startit
        };
        if startit {
            self.start_cp();
        }
    }

    pub fn cpcount(&self) -> u64 {
        self.state.lock().cpcount
    }

    /// Force the mutation counter non-zero; used to take the initial
    /// checkpoint on an empty store.
    pub fn force_dirty(&self) {
        let mut state = self.state.lock();
        if state.mutations == 0 {
            state.mutations = 1;
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// Block until at least `count` checkpoints have completed.
    pub fn wait_cpcount(&self, count: u64, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while state.cpcount < count {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.cond.wait_for(&mut state, deadline - now);
        }
        true
    }

    /// Start the checkpoint thread.
    pub fn start(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let cp = Arc::clone(self);
        std::thread::Builder::new()
            .name("checkpointer".to_string())
            .spawn(move || cp.run())
            .expect("spawn checkpointer")
    }

    fn run(&self) {
        loop {
            {
                let mut state = self.state.lock();
                while !state.running && !state.shutdown {
                    self.cond.wait(&mut state);
                }
                if state.shutdown {
                    return;
                }
            }
            if let Err(e) = self.do_cp() {
                // The previous `latest` link is left untouched.
                tracing::error!(error = %e, "checkpoint failed");
                self.tree.write().cp_end();
            }
            let mut state = self.state.lock();
            state.running = false;
            state.cpcount += 1;
            self.cond.notify_all();
        }
    }

    /// Write one checkpoint: header, leaf walk, zombies, `latest` link.
    pub fn do_cp(&self) -> Result<()> {
        let seq = self.oplog.checkpointed();
        let log_name = self.oplog.log_name();
        std::fs::create_dir_all(&self.cp_dir).map_err(|e| io_status("create cp dir", &e))?;
        let name = cp_file_name(seq);
        let path = self.cp_dir.join(&name);
        let file = File::create(&path).map_err(|e| io_status("create cp file", &e))?;
        let mut out = BufWriter::new(file);

        {
            // Header and walk start are one atomic step against mutations so
            // the seeds match the walk's starting point.
            let mut tree = self.tree.write();
            writeln!(out, "checkpoint/{}", seq).map_err(|e| io_status("write header", &e))?;
            writeln!(out, "version/{}", CP_VERSION).map_err(|e| io_status("write header", &e))?;
            writeln!(out, "fid/{}", tree.fid_seed()).map_err(|e| io_status("write header", &e))?;
            writeln!(out, "chunkId/{}", tree.chunk_seed())
                .map_err(|e| io_status("write header", &e))?;
            writeln!(out, "chunkVersionInc/{}", tree.chunk_version_inc())
                .map_err(|e| io_status("write header", &e))?;
            writeln!(out, "time/{}", chrono::Utc::now().timestamp())
                .map_err(|e| io_status("write header", &e))?;
            writeln!(out, "log/{}", log_name).map_err(|e| io_status("write header", &e))?;
            writeln!(out).map_err(|e| io_status("write header", &e))?;
            tree.cp_begin();
        }

        loop {
            let batch = self.tree.write().cp_next_batch(LEAF_BATCH);
            if batch.is_empty() {
                break;
            }
            for line in batch {
                writeln!(out, "{}", line).map_err(|e| io_status("write leaf", &e))?;
            }
        }
        let zombies = self.tree.write().cp_drain_zombies();
        for line in zombies {
            writeln!(out, "{}", line).map_err(|e| io_status("write zombie", &e))?;
        }
        self.tree.write().cp_end();

        out.flush().map_err(|e| io_status("flush cp", &e))?;
        out.get_ref()
            .sync_all()
            .map_err(|e| io_status("sync cp", &e))?;

        let latest = self.cp_dir.join("latest");
        if latest.exists() {
            std::fs::remove_file(&latest).map_err(|e| io_status("unlink latest", &e))?;
        }
        std::fs::hard_link(&path, &latest).map_err(|e| io_status("link latest", &e))?;
        tracing::info!(file = %name, seq, "checkpoint complete");
        Ok(())
    }
}

fn io_status(what: &str, e: &std::io::Error) -> kfs_types::Status {
    kfs_types::Status::with_message(Errno::EIO, format!("{}: {}", what, e))
}
