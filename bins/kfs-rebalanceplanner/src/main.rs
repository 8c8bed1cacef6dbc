//! Offline rebalance planner.
//!
//! Reads a network definition (one `host:port used total` line per server)
//! and a chunk map (one `chunkId host:port...` line per chunk), computes the
//! moves that bring every server within the utilization band, and writes the
//! plan as `chunkId src dst` lines.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use kfs_layout::{plan_moves, ServerUsage};
use kfs_types::ChunkId;

/// Work out a plan for rebalancing chunks.
#[derive(Parser, Debug)]
#[command(name = "kfs-rebalanceplanner", version, about)]
struct Args {
    /// Network definition file: `host:port used total` per line
    #[arg(short = 'n', long)]
    network: PathBuf,

    /// Chunk map file: `chunkId host:port...` per line
    #[arg(short = 'b', long)]
    chunkmap: PathBuf,

    /// Rebalance plan output file (stdout when unset)
    #[arg(short = 'r', long)]
    plan: Option<PathBuf>,

    /// Percent variation from average utilization tolerated
    #[arg(short = 't', long, default_value_t = 10)]
    variation: u32,
}

fn load_network(path: &PathBuf) -> anyhow::Result<Vec<ServerUsage>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading network definition {}", path.display()))?;
    let mut servers = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(id), Some(used), Some(total)) = (parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("malformed server line {} in {}", lineno + 1, path.display());
        };
        servers.push(ServerUsage {
            id: id.to_string(),
            used: used.parse().context("used space")?,
            total: total.parse().context("total space")?,
        });
    }
    Ok(servers)
}

fn load_chunkmap(path: &PathBuf) -> anyhow::Result<HashMap<ChunkId, Vec<String>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading chunk map {}", path.display()))?;
    let mut placement = HashMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(chunk) = parts.next() else { continue };
        let chunk: u64 = chunk
            .parse()
            .with_context(|| format!("chunk id on line {} of {}", lineno + 1, path.display()))?;
        placement.insert(
            ChunkId(chunk),
            parts.map(|s| s.to_string()).collect::<Vec<_>>(),
        );
    }
    Ok(placement)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = kfs_logging::init_logging(&kfs_logging::LogConfig::default());

    let servers = load_network(&args.network)?;
    let placement = load_chunkmap(&args.chunkmap)?;
    let band = args.variation as f64 / 100.0;

    tracing::info!(
        servers = servers.len(),
        chunks = placement.len(),
        band,
        "planning rebalance"
    );
    let moves = plan_moves(&servers, &placement, band);

    let mut out: Box<dyn Write> = match &args.plan {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("creating plan file {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };
    for m in &moves {
        writeln!(out, "{} {} {}", m.chunk_id, m.src, m.dst)?;
    }
    out.flush()?;

    println!("# of blks rebalanced: {}", moves.len());
    Ok(())
}
