use std::path::PathBuf;

use clap::Parser;

use kfs_logging::LogConfig;
use kfs_meta_service::{MetaServer, MetaServerConfig};

/// KFS metadata server
#[derive(Parser, Debug)]
#[command(name = "kfs-metaserver", version, about)]
struct Args {
    /// Listen address for clients and chunk servers
    #[arg(short, long, default_value = "0.0.0.0:20000")]
    listen: String,

    /// Checkpoint directory
    #[arg(long, default_value = "./kfscp")]
    cp_dir: PathBuf,

    /// Operation log directory
    #[arg(long, default_value = "./kfslog")]
    log_dir: PathBuf,

    /// Checkpoint interval in seconds
    #[arg(long, default_value_t = 600)]
    checkpoint_interval: u64,

    /// Lease interval in seconds
    #[arg(long, default_value_t = 60)]
    lease_interval: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for server log files (console only when unset)
    #[arg(long)]
    server_log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = kfs_logging::init_logging(&LogConfig {
        level: args.log_level.clone(),
        log_dir: args.server_log_dir.clone(),
        ..LogConfig::default()
    });

    let config = MetaServerConfig {
        listen_addr: args.listen.clone(),
        cp_dir: args.cp_dir,
        log_dir: args.log_dir,
        checkpoint_interval_secs: args.checkpoint_interval,
        lease_interval_secs: args.lease_interval,
        ..MetaServerConfig::default()
    };

    tracing::info!(listen = %config.listen_addr, "starting metaserver");
    let server = MetaServer::start(config).map_err(|e| anyhow::anyhow!(e.describe()))?;

    tokio::select! {
        result = server.serve() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
    }
    server.shutdown();
    Ok(())
}
