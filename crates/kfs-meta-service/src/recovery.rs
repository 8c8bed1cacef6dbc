//! Startup recovery: rebuild the tree from the latest checkpoint and replay
//! the log tail.
//!
//! Each replayed mutation calls the same tree operator the original op
//! called, carrying the logged ids so the fid/chunk-id seeds advance past
//! everything ever issued. Replay is idempotent: re-applying an
//! already-applied record is a tolerated no-op. Partial trailing log lines
//! are discarded.

use std::path::Path;

use kfs_meta_tree::{MetaRecord, MetaTree};
use kfs_types::{make_error_msg, ChunkId, ChunkVersion, Errno, Fid, Result};

/// Everything startup needs after recovery.
pub struct RecoveredState {
    pub tree: MetaTree,
    /// Ending sequence of the replayed logs; the fresh log file is named by
    /// it.
    pub checkpointed: u64,
    /// Sequence the next logged mutation will get.
    pub next_seq: u64,
    pub had_checkpoint: bool,
}

/// Rebuild state from `cp_dir/latest` plus the log tail under `log_dir`.
/// With no checkpoint present, recovery starts from an empty tree (root
/// only) and the caller forces an immediate initial checkpoint.
pub fn recover(cp_dir: &Path, log_dir: &Path, now: i64) -> Result<RecoveredState> {
    let latest = cp_dir.join("latest");
    let had_checkpoint = latest.exists();
    let (mut tree, cp_seq, start_log) = if had_checkpoint {
        let content = std::fs::read_to_string(&latest)
            .map_err(|e| kfs_types::Status::with_message(Errno::EIO, e.to_string()))?;
        let (tree, cp_seq, log_name) = restore_checkpoint(&content)?;
        (tree, cp_seq, log_seq_of(&log_name))
    } else {
        tracing::info!("no checkpoint found, starting from an empty tree");
        (MetaTree::new(now), 0, None)
    };

    let mut replayed = 0u64;
    let mut last_log_seq = cp_seq;
    let start = start_log.unwrap_or(0);
    let mut logs = list_logs(log_dir);
    logs.retain(|(seq, _)| *seq >= start);
    logs.sort_by_key(|(seq, _)| *seq);
    for (seq, path) in logs {
        last_log_seq = last_log_seq.max(seq);
        replayed += replay_log(&mut tree, &path, now)?;
        tracing::info!(log = %path.display(), "log replayed");
    }

    let checkpointed = last_log_seq;
    Ok(RecoveredState {
        tree,
        checkpointed,
        next_seq: checkpointed + replayed + 1,
        had_checkpoint,
    })
}

fn log_seq_of(name: &str) -> Option<u64> {
    name.strip_prefix("log.").and_then(|s| s.parse().ok())
}

/// Parse a checkpoint file: `key/value` header lines, a blank line, then
/// one record line per leaf.
fn restore_checkpoint(content: &str) -> Result<(MetaTree, u64, String)> {
    let mut tree = MetaTree::empty();
    let mut cp_seq = 0u64;
    let mut fid_seed = 0u64;
    let mut chunk_seed = 0u64;
    let mut version_inc = 1u64;
    let mut log_name = String::new();
    let mut in_header = true;

    for line in content.lines() {
        if in_header {
            if line.is_empty() {
                in_header = false;
                continue;
            }
            let (key, value) = line
                .split_once('/')
                .ok_or_else(|| bad_cp(line, "missing separator"))?;
            match key {
                "checkpoint" => cp_seq = parse_num(value, line)?,
                "version" => {
                    if parse_num(value, line)? != 1 {
                        return make_error_msg(
                            Errno::EINVAL,
                            format!("unsupported checkpoint version {:?}", value),
                        );
                    }
                }
                "fid" => fid_seed = parse_num(value, line)?,
                "chunkId" => chunk_seed = parse_num(value, line)?,
                "chunkVersionInc" => version_inc = parse_num(value, line)?,
                "time" => {}
                "log" => log_name = value.to_string(),
                _ => return Err(bad_cp(line, "unknown header key")),
            }
        } else {
            if line.is_empty() {
                continue;
            }
            tree.insert_restored(MetaRecord::parse_line(line)?);
        }
    }
    tree.set_seeds(fid_seed, chunk_seed, version_inc);
    Ok((tree, cp_seq, log_name))
}

/// Log files under `log_dir`, as `(starting seq, path)`.
fn list_logs(log_dir: &Path) -> Vec<(u64, std::path::PathBuf)> {
    let mut logs = Vec::new();
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return logs;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seq) = name.strip_prefix("log.") {
            if let Ok(seq) = seq.parse::<u64>() {
                logs.push((seq, entry.path()));
            }
        }
    }
    logs
}

fn replay_log(tree: &mut MetaTree, path: &Path, now: i64) -> Result<u64> {
    let content = std::fs::read(path)
        .map_err(|e| kfs_types::Status::with_message(Errno::EIO, e.to_string()))?;
    let content = String::from_utf8_lossy(&content);
    let complete = match content.rfind('\n') {
        Some(end) => &content[..end],
        // No complete line at all.
        None => {
            if !content.is_empty() {
                tracing::warn!(log = %path.display(), "discarding partial log line");
            }
            return Ok(0);
        }
    };
    if complete.len() + 1 != content.len() {
        tracing::warn!(log = %path.display(), "discarding partial trailing log line");
    }
    let mut replayed = 0;
    for line in complete.split('\n') {
        if line.is_empty() {
            continue;
        }
        replay_line(tree, line, now)?;
        replayed += 1;
    }
    Ok(replayed)
}

/// Apply one log line. Errors that indicate the mutation already applied
/// (EEXIST on create, ENOENT on remove) are tolerated so a replayed tail is
/// a no-op.
pub fn replay_line(tree: &mut MetaTree, line: &str, now: i64) -> Result<()> {
    let (verb, rest) = line.split_once('/').unwrap_or((line, ""));
    let fields = pairs(rest);
    match verb {
        "create" => {
            let fid = Fid(field(&fields, "id", line)?);
            let replicas = field(&fields, "numReplicas", line)? as u32;
            let dir = Fid(field(&fields, "dir", line)?);
            let name = field_str(&fields, "name", line)?;
            tolerate(tree.create_with_fid(dir, &name, fid, replicas, now), Errno::EEXIST)
        }
        "mkdir" => {
            let fid = Fid(field(&fields, "id", line)?);
            let dir = Fid(field(&fields, "dir", line)?);
            let name = field_str(&fields, "name", line)?;
            tolerate(tree.mkdir_with_fid(dir, &name, fid, now), Errno::EEXIST)
        }
        "remove" => {
            let dir = Fid(field(&fields, "dir", line)?);
            let name = field_str(&fields, "name", line)?;
            tolerate(tree.remove(dir, &name, now), Errno::ENOENT)
        }
        "rmdir" => {
            let dir = Fid(field(&fields, "dir", line)?);
            let name = field_str(&fields, "name", line)?;
            tolerate(tree.rmdir(dir, &name, now), Errno::ENOENT)
        }
        "rename" => {
            let dir = Fid(field(&fields, "dir", line)?);
            let old = field_str(&fields, "old", line)?;
            let new = field_str(&fields, "new", line)?;
            tolerate(tree.rename(dir, &old, &new, true, now), Errno::ENOENT)
        }
        "allocate" => {
            let fid = Fid(field(&fields, "file", line)?);
            let offset = field(&fields, "offset", line)?;
            let chunk_id = ChunkId(field(&fields, "chunkId", line)?);
            let version = ChunkVersion(field(&fields, "chunkVersion", line)?);
            tolerate(
                tree.assign_chunk_id(fid, offset, chunk_id, version, now),
                Errno::ENOENT,
            )
        }
        "truncate" => {
            let fid = Fid(field(&fields, "file", line)?);
            let offset = field(&fields, "offset", line)?;
            match tree.truncate(fid, offset, now) {
                // Any needed allocations have their own log records.
                Ok(_) => Ok(()),
                Err(e) if e.code() == Errno::ENOENT => Ok(()),
                Err(e) => Err(e),
            }
        }
        "chunkVersionInc" => {
            let value: u64 = rest
                .parse()
                .map_err(|_| bad_log(line, "bad chunkVersionInc value"))?;
            tree.set_chunk_version_inc(value);
            Ok(())
        }
        _ => Err(bad_log(line, "unknown verb")),
    }
}

fn tolerate(result: Result<impl Sized>, code: kfs_types::status_code_t) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.code() == code => Ok(()),
        Err(e) => Err(e),
    }
}

fn pairs(rest: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut pending: Option<String> = None;
    for tok in rest.split('/') {
        match pending.take() {
            None => pending = Some(tok.to_string()),
            Some(key) => out.push((key, tok.to_string())),
        }
    }
    out
}

fn field_str(fields: &[(String, String)], key: &str, line: &str) -> Result<String> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .ok_or_else(|| bad_log(line, "missing field"))
}

fn field(fields: &[(String, String)], key: &str, line: &str) -> Result<u64> {
    field_str(fields, key, line)?
        .parse()
        .map_err(|_| bad_log(line, "bad numeric field"))
}

fn parse_num(value: &str, line: &str) -> Result<u64> {
    value.parse().map_err(|_| bad_cp(line, "bad number"))
}

fn bad_cp(line: &str, what: &str) -> kfs_types::Status {
    kfs_types::Status::with_message(Errno::EINVAL, format!("{} in checkpoint line {:?}", what, line))
}

fn bad_log(line: &str, what: &str) -> kfs_types::Status {
    kfs_types::Status::with_message(Errno::EINVAL, format!("{} in log line {:?}", what, line))
}
