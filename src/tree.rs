//! The tree engine: walks a directory recursively and produces `tree`
//! objects, consulting (and updating) the file cache as it goes.
//!
//! A tree's wire format is a flat sequence of entries, each
//! `"<octal-mode> <name>\0"` followed by the raw 20-byte id of the entry's
//! object (another tree for a directory, a `chunks` object for a file).
//! Entries are sorted lexically by name before writing; the original
//! walks directories in whatever order `readdir` hands back, which differs
//! across filesystems and even runs; sorting makes two snapshots of an
//! unchanged directory hash identically.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use camino::Utf8Path;
use tracing::{debug, warn};

use crate::cache::{self, Cache, CacheEntry};
use crate::chunk;
use crate::hash::{HASH_LEN, ObjectId};
use crate::store::{ObjectStore, TREE};
use crate::worker::WorkerPool;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// Recursively backs up `dir`, skipping `store_dir` itself, symlinks, and
/// any other non-regular, non-directory entry. Returns the id of `dir`'s
/// tree object.
pub fn build_tree(
    store: &Arc<ObjectStore>,
    pool: &WorkerPool,
    dir: &Utf8Path,
    store_dir: &Utf8Path,
    cache: &mut Cache,
    chunk_size: usize,
) -> Result<ObjectId> {
    let mut entries = Vec::new();

    for dirent in fs::read_dir(dir).with_context(|| format!("Couldn't read directory {dir}"))? {
        let dirent = dirent?;
        let name = dirent
            .file_name()
            .into_string()
            .map_err(|_| anyhow!("{dir} contains a non-UTF-8 filename"))?;
        let full_path = dir.join(&name);

        if full_path == store_dir {
            continue;
        }

        let meta = fs::symlink_metadata(&full_path)
            .with_context(|| format!("Couldn't stat {full_path}"))?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            debug!(%full_path, "skipping symlink");
            continue;
        }
        if !file_type.is_dir() && !file_type.is_file() {
            warn!(%full_path, "skipping special file (not a regular file or directory)");
            continue;
        }

        let mode = meta.mode();
        let id = if file_type.is_dir() {
            build_tree(store, pool, &full_path, store_dir, cache, chunk_size)?
        } else {
            backup_file(store, pool, &full_path, &meta, cache, chunk_size)?
        };

        entries.push(TreeEntry { mode, name, id });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let payload = serialize(&entries);
    Ok(store.submit_write(pool, TREE, payload))
}

/// Backs up a single regular file, reusing the cached `chunks` id if its
/// size, mtime, and ctime all still match what's on disk.
fn backup_file(
    store: &Arc<ObjectStore>,
    pool: &WorkerPool,
    path: &Utf8Path,
    meta: &fs::Metadata,
    cache: &mut Cache,
    chunk_size: usize,
) -> Result<ObjectId> {
    match cache.lookup(path) {
        Some(idx) => {
            let delta = cache::changed(cache.entry(idx), meta);
            if delta.size {
                let id = chunk::chunk_file(store, pool, path, chunk_size)?;
                let entry = cache.entry_mut(idx);
                entry.sha1 = id;
                entry.size = meta.size();
                entry.mtime = (meta.mtime(), meta.mtime_nsec() as u32);
                entry.ctime = (meta.ctime(), meta.ctime_nsec() as u32);
                entry.mode = meta.mode();
                Ok(id)
            } else {
                let entry = cache.entry_mut(idx);
                if delta.mode {
                    entry.mode = meta.mode();
                }
                if delta.time {
                    entry.mtime = (meta.mtime(), meta.mtime_nsec() as u32);
                    entry.ctime = (meta.ctime(), meta.ctime_nsec() as u32);
                }
                Ok(cache.entry(idx).sha1)
            }
        }
        None => {
            let id = chunk::chunk_file(store, pool, path, chunk_size)?;
            cache.insert(CacheEntry::from_metadata(path.to_owned(), meta, id));
            Ok(id)
        }
    }
}

fn serialize(entries: &[TreeEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        buf.extend_from_slice(format!("{:o} {}", entry.mode, entry.name).as_bytes());
        buf.push(0);
        buf.extend_from_slice(entry.id.as_bytes());
    }
    buf
}

/// Parses a tree object's payload back into its entries.
pub fn parse(payload: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let nul = payload[offset..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| anyhow!("corrupt tree object: missing NUL terminator"))?;
        let header = std::str::from_utf8(&payload[offset..offset + nul])
            .context("corrupt tree object: entry header isn't UTF-8")?;

        let (mode_str, name) = header
            .split_once(' ')
            .ok_or_else(|| anyhow!("corrupt tree object: malformed entry {header:?}"))?;
        let mode = u32::from_str_radix(mode_str, 8)
            .with_context(|| format!("corrupt tree object: bad mode {mode_str:?}"))?;

        offset += nul + 1;
        if offset + HASH_LEN > payload.len() {
            anyhow::bail!("corrupt tree object: truncated id");
        }
        let mut id_bytes = [0u8; HASH_LEN];
        id_bytes.copy_from_slice(&payload[offset..offset + HASH_LEN]);
        offset += HASH_LEN;

        entries.push(TreeEntry {
            mode,
            name: name.to_owned(),
            id: ObjectId::from_bytes(id_bytes),
        });
    }

    Ok(entries)
}
