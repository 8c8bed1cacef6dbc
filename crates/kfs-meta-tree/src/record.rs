//! Leaf records of the metadata keyspace and their checkpoint text form.
//!
//! Each record serializes to one `key/value`-pair line in checkpoint files,
//! in the same style the operation log uses for mutations.

use kfs_types::{
    make_error_msg, ChunkId, ChunkOff, ChunkVersion, Errno, Fid, FileKind, Result,
};

use crate::key::MetaKey;

/// Per-file metadata. Directories always have `chunk_count` 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub fid: Fid,
    pub kind: FileKind,
    pub chunk_count: u64,
    pub num_replicas: u32,
    pub mtime: i64,
    pub ctime: i64,
    pub crtime: i64,
}

impl FileAttr {
    pub fn new(fid: Fid, kind: FileKind, num_replicas: u32, now: i64) -> Self {
        Self {
            fid,
            kind,
            chunk_count: 0,
            num_replicas,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }
}

/// One name in one directory, pointing at a child file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub dir: Fid,
    pub name: String,
    pub fid: Fid,
}

/// One chunk stripe of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub fid: Fid,
    pub offset: ChunkOff,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
}

/// Any leaf record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaRecord {
    Fattr(FileAttr),
    Dentry(DirEntry),
    Chunk(ChunkInfo),
}

impl MetaRecord {
    pub fn key(&self) -> MetaKey {
        match self {
            MetaRecord::Fattr(fa) => MetaKey::Fattr(fa.fid),
            MetaRecord::Dentry(de) => MetaKey::Dentry {
                dir: de.dir,
                name: de.name.clone(),
            },
            MetaRecord::Chunk(ci) => MetaKey::Chunk {
                fid: ci.fid,
                offset: ci.offset,
            },
        }
    }

    /// One checkpoint line, without the trailing newline.
    pub fn checkpoint_line(&self) -> String {
        match self {
            MetaRecord::Fattr(fa) => format!(
                "fattr/{}/id/{}/chunkcount/{}/numReplicas/{}/mtime/{}/ctime/{}/crtime/{}",
                fa.kind, fa.fid, fa.chunk_count, fa.num_replicas, fa.mtime, fa.ctime, fa.crtime
            ),
            // The name is the final field: it may contain any byte but '\n'
            // (the root's self-entry is named "/").
            MetaRecord::Dentry(de) => {
                format!("dentry/dir/{}/id/{}/name/{}", de.dir, de.fid, de.name)
            }
            MetaRecord::Chunk(ci) => format!(
                "chunkinfo/fid/{}/chunkid/{}/offset/{}/chunkVersion/{}",
                ci.fid, ci.chunk_id, ci.offset, ci.version
            ),
        }
    }

    /// Parse a checkpoint line back into a record.
    pub fn parse_line(line: &str) -> Result<MetaRecord> {
        let mut parts = line.split('/');
        let verb = parts.next().unwrap_or("");
        let fields = Fields::collect(parts);
        match verb {
            "fattr" => {
                let kind = match fields.tag.as_deref() {
                    Some("file") => FileKind::File,
                    Some("dir") => FileKind::Dir,
                    other => {
                        return make_error_msg(
                            Errno::EINVAL,
                            format!("bad fattr kind {:?} in {:?}", other, line),
                        )
                    }
                };
                Ok(MetaRecord::Fattr(FileAttr {
                    fid: Fid(fields.num("id", line)?),
                    kind,
                    chunk_count: fields.num("chunkcount", line)?,
                    num_replicas: fields.num("numReplicas", line)? as u32,
                    mtime: fields.num("mtime", line)? as i64,
                    ctime: fields.num("ctime", line)? as i64,
                    crtime: fields.num("crtime", line)? as i64,
                }))
            }
            "dentry" => parse_dentry(line),
            "chunkinfo" => Ok(MetaRecord::Chunk(ChunkInfo {
                fid: Fid(fields.num("fid", line)?),
                offset: fields.num("offset", line)?,
                chunk_id: ChunkId(fields.num("chunkid", line)?),
                version: ChunkVersion(fields.num("chunkVersion", line)?),
            })),
            _ => make_error_msg(Errno::EINVAL, format!("unknown record line {:?}", line)),
        }
    }
}

/// Dentry lines are parsed positionally so the trailing name may contain
/// arbitrary characters: `dentry/dir/<dir>/id/<fid>/name/<name>`.
fn parse_dentry(line: &str) -> Result<MetaRecord> {
    let fail = |what: &str| {
        kfs_types::Status::with_message(Errno::EINVAL, format!("{} in {:?}", what, line))
    };
    let rest = line
        .strip_prefix("dentry/dir/")
        .ok_or_else(|| fail("bad dentry prefix"))?;
    let (dir, rest) = rest.split_once('/').ok_or_else(|| fail("missing id"))?;
    let rest = rest.strip_prefix("id/").ok_or_else(|| fail("missing id"))?;
    let (id, rest) = rest.split_once('/').ok_or_else(|| fail("missing name"))?;
    let name = rest
        .strip_prefix("name/")
        .ok_or_else(|| fail("missing name"))?;
    let dir: u64 = dir.parse().map_err(|_| fail("bad dir"))?;
    let id: u64 = id.parse().map_err(|_| fail("bad id"))?;
    if name.is_empty() {
        return Err(fail("empty name"));
    }
    Ok(MetaRecord::Dentry(DirEntry {
        dir: Fid(dir),
        name: name.to_string(),
        fid: Fid(id),
    }))
}

/// Key/value pairs parsed from the `/`-separated tail of a record line. A
/// single leading tag (the fattr kind) is allowed before the pairs begin.
struct Fields {
    tag: Option<String>,
    pairs: Vec<(String, String)>,
}

impl Fields {
    fn collect<'a>(parts: impl Iterator<Item = &'a str>) -> Self {
        let mut tag = None;
        let mut pending: Option<String> = None;
        let mut pairs = Vec::new();
        for (i, tok) in parts.enumerate() {
            if i == 0 && (tok == "file" || tok == "dir") {
                tag = Some(tok.to_string());
                continue;
            }
            match pending.take() {
                None => pending = Some(tok.to_string()),
                Some(key) => pairs.push((key, tok.to_string())),
            }
        }
        Self { tag, pairs }
    }

    fn str(&self, key: &str, line: &str) -> Result<String> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                kfs_types::Status::with_message(
                    Errno::EINVAL,
                    format!("missing field {:?} in {:?}", key, line),
                )
            })
    }

    fn num(&self, key: &str, line: &str) -> Result<u64> {
        let raw = self.str(key, line)?;
        raw.parse().map_err(|_| {
            kfs_types::Status::with_message(
                Errno::EINVAL,
                format!("bad numeric field {:?}={:?} in {:?}", key, raw, line),
            )
        })
    }
}
