//! The metaserver core: request processor, operation log, checkpointer,
//! recovery, and the TCP front end, assembled over the metadata tree and
//! the layout manager.

pub mod checkpoint;
pub mod config;
pub mod counters;
pub mod op;
pub mod oplog;
pub mod processor;
pub mod queue;
pub mod recovery;
pub mod server;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use kfs_layout::LayoutManager;
use kfs_types::Result;

pub use checkpoint::{Checkpointer, SharedTree};
pub use config::MetaServerConfig;
pub use op::{Event, MetaRequest, OpBody};
pub use queue::MetaQueue;
pub use server::RequestSubmitter;

use oplog::OpLog;
use processor::Processor;

/// A running metaserver core: all background contexts plus the submitter
/// used by the network front end.
pub struct MetaServer {
    config: MetaServerConfig,
    queue: Arc<MetaQueue<Event>>,
    submitter: RequestSubmitter,
    oplog: Arc<OpLog>,
    cp: Arc<Checkpointer>,
    stop: Arc<AtomicBool>,
    processor_handle: Option<JoinHandle<()>>,
    oplog_handle: Option<JoinHandle<()>>,
    cp_handle: Option<JoinHandle<()>>,
    timer_handle: Option<JoinHandle<()>>,
}

impl MetaServer {
    /// Recover state and bring up the processor, oplog writer, checkpointer,
    /// and timers. On first boot (no checkpoint) an initial checkpoint is
    /// forced before returning.
    pub fn start(config: MetaServerConfig) -> Result<MetaServer> {
        let now = chrono::Utc::now().timestamp();
        let state = recovery::recover(&config.cp_dir, &config.log_dir, now)?;
        let had_checkpoint = state.had_checkpoint;

        // Rebuild the layout manager's chunk table from the tree.
        let mut layout = LayoutManager::new(config.layout_config());
        for ci in state.tree.all_chunks() {
            let target = state
                .tree
                .get_fattr(ci.fid)
                .map(|fa| fa.num_replicas)
                .unwrap_or(1);
            layout.register_chunk(ci.chunk_id, ci.fid, ci.version, target);
        }
        tracing::info!(
            records = state.tree.record_count(),
            fid_seed = state.tree.fid_seed(),
            chunk_seed = state.tree.chunk_seed(),
            "metadata tree recovered"
        );

        let tree: SharedTree = Arc::new(RwLock::new(state.tree));
        let queue: Arc<MetaQueue<Event>> = Arc::new(MetaQueue::new());
        let next_op_id = Arc::new(AtomicU64::new(1));

        let oplog = OpLog::open(
            config.log_dir.clone(),
            state.checkpointed,
            state.next_seq,
            Duration::from_millis(config.log_flush_interval_ms),
        )?;
        let cp = Checkpointer::new(config.cp_dir.clone(), Arc::clone(&tree), Arc::clone(&oplog));

        let rotate_cp = Arc::clone(&cp);
        let oplog_handle = oplog.start(Arc::clone(&queue), move |_seq| rotate_cp.start_cp());
        let cp_handle = cp.start();

        let processor = Processor::new(
            Arc::clone(&tree),
            layout,
            Arc::clone(&oplog),
            Arc::clone(&cp),
            Arc::clone(&queue),
            Arc::clone(&next_op_id),
            config.op_timeout_secs,
        );
        let processor_handle = processor.start();

        let submitter = RequestSubmitter::new(Arc::clone(&queue), next_op_id);
        let stop = Arc::new(AtomicBool::new(false));
        let timer_handle = start_timers(
            config.clone(),
            submitter.clone(),
            Arc::clone(&cp),
            Arc::clone(&stop),
        );

        let server = MetaServer {
            config,
            queue,
            submitter,
            oplog,
            cp,
            stop,
            processor_handle: Some(processor_handle),
            oplog_handle: Some(oplog_handle),
            cp_handle: Some(cp_handle),
            timer_handle: Some(timer_handle),
        };

        if !had_checkpoint {
            server.cp.force_dirty();
            server.submitter.submit_internal(OpBody::Checkpoint);
            if !server.cp.wait_cpcount(1, Duration::from_secs(30)) {
                tracing::warn!("initial checkpoint did not complete in time");
            }
        }
        Ok(server)
    }

    pub fn config(&self) -> &MetaServerConfig {
        &self.config
    }

    pub fn submitter(&self) -> RequestSubmitter {
        self.submitter.clone()
    }

    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.cp
    }

    /// Serve the listen address until the listener fails.
    pub async fn serve(&self) -> std::io::Result<()> {
        server::run_listener(&self.config.listen_addr, self.submitter()).await
    }

    /// Stop every background context and join them.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.queue.enqueue(Event::Shutdown);
        if let Some(h) = self.processor_handle.take() {
            let _ = h.join();
        }
        self.oplog.shutdown();
        if let Some(h) = self.oplog_handle.take() {
            let _ = h.join();
        }
        self.cp.shutdown();
        if let Some(h) = self.cp_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.timer_handle.take() {
            let _ = h.join();
        }
        tracing::info!("metaserver shut down");
    }
}

/// Periodic internal ops: lease cleanup (with dumpster drain and suspended
/// op timeouts), the replication checker, heartbeats, and the checkpoint
/// trigger.
fn start_timers(
    config: MetaServerConfig,
    submitter: RequestSubmitter,
    cp: Arc<Checkpointer>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("meta-timers".to_string())
        .spawn(move || {
            let mut last_lease = Instant::now();
            let mut last_repl = Instant::now();
            let mut last_hb = Instant::now();
            let mut last_cp = Instant::now();
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(250));
                if last_lease.elapsed().as_secs() >= config.lease_cleanup_interval_secs {
                    submitter.submit_internal(OpBody::LeaseCleanup);
                    last_lease = Instant::now();
                }
                if last_repl.elapsed().as_secs() >= config.replication_check_interval_secs {
                    submitter.submit_internal(OpBody::ReplicationCheck);
                    last_repl = Instant::now();
                }
                if last_hb.elapsed().as_secs() >= config.heartbeat_interval_secs as u64 {
                    submitter.submit_internal(OpBody::HeartbeatCheck);
                    last_hb = Instant::now();
                }
                if last_cp.elapsed().as_secs() >= config.checkpoint_interval_secs
                    && cp.is_cp_needed()
                {
                    submitter.submit_internal(OpBody::Checkpoint);
                    last_cp = Instant::now();
                }
            }
        })
        .expect("spawn timer thread")
}
