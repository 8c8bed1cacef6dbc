//! The operation log: an append-only text log of namespace mutations.
//!
//! The processor appends completed ops to a pending list; a dedicated writer
//! thread drains it, writes one line per mutation, fsyncs, and only then
//! runs each op's finisher (sending the client response, resuming a
//! dependent op). Flushes may be deferred a few milliseconds to coalesce,
//! but an op's response is always strictly after its own flush.
//!
//! Rotation happens only at checkpoint time: the current file is closed, its
//! ending sequence number recorded, and a new file named by that sequence is
//! opened.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use kfs_types::{Errno, Result};

use crate::op::{Event, Finish};
use crate::queue::MetaQueue;

/// One entry handed to the writer: an optional log line (mutations only)
/// plus what to do once it is durable.
pub struct LogItem {
    pub line: Option<String>,
    pub finish: Finish,
}

struct LogState {
    pending: VecDeque<LogItem>,
    file: Option<File>,
    /// Sequence number the next logged mutation will get.
    next_seq: u64,
    /// Last sequence in the most recently rotated-away log file.
    checkpointed: u64,
    log_name: String,
    failed: bool,
    shutdown: bool,
}

pub struct OpLog {
    state: Mutex<LogState>,
    cond: Condvar,
    log_dir: PathBuf,
    flush_interval: Duration,
}

fn log_file_name(seq: u64) -> String {
    format!("log.{}", seq)
}

impl OpLog {
    /// Open (or create) the active log file. `checkpointed` is the ending
    /// sequence of everything already durable; the active file is named by
    /// it, and fresh mutations get sequences from `next_seq` up.
    pub fn open(
        log_dir: PathBuf,
        checkpointed: u64,
        next_seq: u64,
        flush_interval: Duration,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| io_status("create log dir", &e))?;
        let log_name = log_file_name(checkpointed);
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_dir.join(&log_name))
            .map_err(|e| io_status("open log file", &e))?;
        Ok(Arc::new(Self {
            state: Mutex::new(LogState {
                pending: VecDeque::new(),
                file: Some(file),
                next_seq,
                checkpointed,
                log_name,
                failed: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
            log_dir,
            flush_interval,
        }))
    }

    pub fn has_failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn checkpointed(&self) -> u64 {
        self.state.lock().checkpointed
    }

    pub fn log_name(&self) -> String {
        self.state.lock().log_name.clone()
    }

    pub fn next_seq(&self) -> u64 {
        self.state.lock().next_seq
    }

    /// Queue an entry for the writer.
    pub fn append(&self, item: LogItem) {
        let mut state = self.state.lock();
        state.pending.push_back(item);
        self.cond.notify_one();
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// Start the writer thread. `on_rotate` runs after each rotation with
    /// the recorded ending sequence (it starts the checkpoint).
    pub fn start(
        self: &Arc<Self>,
        queue: Arc<MetaQueue<Event>>,
        on_rotate: impl Fn(u64) + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        let log = Arc::clone(self);
        std::thread::Builder::new()
            .name("oplog-writer".to_string())
            .spawn(move || log.writer_loop(queue, on_rotate))
            .expect("spawn oplog writer")
    }

    fn writer_loop(&self, queue: Arc<MetaQueue<Event>>, on_rotate: impl Fn(u64)) {
        loop {
            let mut batch: Vec<LogItem> = Vec::new();
            {
                let mut state = self.state.lock();
                while state.pending.is_empty() && !state.shutdown {
                    self.cond.wait(&mut state);
                }
                if state.pending.is_empty() && state.shutdown {
                    return;
                }
                batch.extend(state.pending.drain(..));
            }
            // Coalesce closely spaced mutations into one fsync.
            if batch.iter().any(|i| i.line.is_some()) {
                std::thread::sleep(self.flush_interval);
                let mut state = self.state.lock();
                batch.extend(state.pending.drain(..));
            }
            self.write_batch(batch, &queue, &on_rotate);
        }
    }

    fn write_batch(
        &self,
        batch: Vec<LogItem>,
        queue: &Arc<MetaQueue<Event>>,
        on_rotate: &impl Fn(u64),
    ) {
        let mut wrote = false;
        let mut rotated_to = None;
        {
            let mut state = self.state.lock();
            for item in &batch {
                if item.finish.rotate {
                    if wrote {
                        let _ = Self::sync(&mut state);
                        wrote = false;
                    }
                    rotated_to = Some(Self::rotate(&self.log_dir, &mut state));
                }
                if let Some(line) = &item.line {
                    if !state.failed {
                        if let Err(e) = Self::write_line(&mut state, line) {
                            tracing::error!(error = %e, "oplog write failed; halting mutations");
                            state.failed = true;
                        } else {
                            wrote = true;
                        }
                    }
                }
            }
            if wrote {
                if let Err(e) = Self::sync(&mut state) {
                    tracing::error!(error = %e, "oplog fsync failed; halting mutations");
                    state.failed = true;
                }
            }
        }

        let failed = self.has_failed();
        for item in batch {
            let had_line = item.line.is_some();
            if let Some((tx, text, cseq)) = item.finish.respond {
                let text = if failed && had_line {
                    kfs_proto::response::status_only(cseq, -Errno::EIO)
                } else {
                    text
                };
                let _ = tx.send(text);
            }
            if let Some((op_id, status)) = item.finish.resume {
                let status = if failed && had_line { -Errno::EIO } else { status };
                queue.enqueue(Event::Resume { op_id, status });
            }
        }
        if let Some(seq) = rotated_to {
            on_rotate(seq);
        }
    }

    fn write_line(state: &mut LogState, line: &str) -> std::io::Result<()> {
        let file = state.file.as_mut().expect("log file is open");
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        state.next_seq += 1;
        Ok(())
    }

    fn sync(state: &mut LogState) -> std::io::Result<()> {
        let file = state.file.as_mut().expect("log file is open");
        file.flush()?;
        file.sync_data()
    }

    /// Close the current log, record its ending sequence, open the next.
    fn rotate(log_dir: &PathBuf, state: &mut LogState) -> u64 {
        let ending = state.next_seq.saturating_sub(1);
        state.checkpointed = ending;
        state.log_name = log_file_name(ending);
        match OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_dir.join(&state.log_name))
        {
            Ok(file) => {
                state.file = Some(file);
                tracing::info!(log = %state.log_name, seq = ending, "rotated operation log");
            }
            Err(e) => {
                tracing::error!(error = %e, "log rotation failed; halting mutations");
                state.failed = true;
            }
        }
        ending
    }
}

fn io_status(what: &str, e: &std::io::Error) -> kfs_types::Status {
    kfs_types::Status::with_message(Errno::EIO, format!("{}: {}", what, e))
}
