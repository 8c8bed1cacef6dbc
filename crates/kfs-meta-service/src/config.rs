//! Configuration for the metaserver.

use std::path::PathBuf;

use kfs_layout::LayoutConfig;

#[derive(Debug, Clone)]
pub struct MetaServerConfig {
    /// Client/chunk-server listen address.
    pub listen_addr: String,

    /// Directory of checkpoint files and the `latest` link.
    pub cp_dir: PathBuf,

    /// Directory of operation log files.
    pub log_dir: PathBuf,

    /// Checkpoint timer period.
    pub checkpoint_interval_secs: u64,

    /// How long the oplog writer may defer an fsync to coalesce batches.
    pub log_flush_interval_ms: u64,

    /// Write/read lease duration.
    pub lease_interval_secs: i64,

    /// Heartbeat period per chunk-server session.
    pub heartbeat_interval_secs: i64,

    /// Missed heartbeat intervals before a server is declared down.
    pub heartbeat_max_missed: u32,

    /// Placement: servers below this free-space fraction are skipped.
    pub min_free_ratio: f64,

    /// Lease cleanup / dumpster sweep period.
    pub lease_cleanup_interval_secs: u64,

    /// Replication checker period.
    pub replication_check_interval_secs: u64,

    /// Per-op timeout while suspended on chunk-server RPCs.
    pub op_timeout_secs: i64,
}

impl Default for MetaServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:20000".to_string(),
            cp_dir: PathBuf::from("./kfscp"),
            log_dir: PathBuf::from("./kfslog"),
            checkpoint_interval_secs: 600,
            log_flush_interval_ms: 10,
            lease_interval_secs: kfs_types::LEASE_INTERVAL_SECS,
            heartbeat_interval_secs: 60,
            heartbeat_max_missed: 3,
            min_free_ratio: 0.01,
            lease_cleanup_interval_secs: 60,
            replication_check_interval_secs: 60,
            op_timeout_secs: 120,
        }
    }
}

impl MetaServerConfig {
    pub fn layout_config(&self) -> LayoutConfig {
        LayoutConfig {
            lease_interval_secs: self.lease_interval_secs,
            min_free_ratio: self.min_free_ratio,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            heartbeat_max_missed: self.heartbeat_max_missed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MetaServerConfig::default();
        assert_eq!(cfg.cp_dir, PathBuf::from("./kfscp"));
        assert_eq!(cfg.checkpoint_interval_secs, 600);
        assert_eq!(cfg.log_flush_interval_ms, 10);
        assert_eq!(cfg.layout_config().lease_interval_secs, 60);
    }
}
