//! The file-metadata cache used to skip re-chunking unchanged files.
//!
//! A sorted (by path), persisted list of per-file records: the metadata a
//! change is expected to disturb (mode, size, mtime, ctime) alongside the
//! sha1 of that file's `chunks` object. The snapshot engine looks each file
//! up by path with a binary search and only re-chunks when size, mtime, or
//! ctime disagree with what's on disk.
//!
//! The cache is written to a temporary file and renamed into place, so a
//! reader never sees a half-written cache; a leftover temp file (from a
//! snapshot that was killed mid-persist) is treated as a lock and refused
//! rather than silently overwritten.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::StoreError;
use crate::hash::{HASH_LEN, ObjectId};
use crate::store::io_not_found;

const CACHE_FILE: &str = "filecache";
const CACHE_TMP_FILE: &str = "filecache.new";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub mode: u32,
    pub size: u64,
    pub mtime: (i64, u32),
    pub ctime: (i64, u32),
    pub sha1: ObjectId,
    pub path: Utf8PathBuf,
}

impl CacheEntry {
    pub fn from_metadata(path: Utf8PathBuf, meta: &fs::Metadata, sha1: ObjectId) -> CacheEntry {
        CacheEntry {
            mode: meta.mode(),
            size: meta.size(),
            mtime: (meta.mtime(), meta.mtime_nsec() as u32),
            ctime: (meta.ctime(), meta.ctime_nsec() as u32),
            sha1,
            path,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let path_bytes = self.path.as_str().as_bytes();
        let mut buf = Vec::with_capacity(60 + path_bytes.len() + 1);
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.mtime.0.to_le_bytes());
        buf.extend_from_slice(&self.mtime.1.to_le_bytes());
        buf.extend_from_slice(&self.ctime.0.to_le_bytes());
        buf.extend_from_slice(&self.ctime.1.to_le_bytes());
        buf.extend_from_slice(self.sha1.as_bytes());
        buf.extend_from_slice(&(path_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(path_bytes);
        buf.push(0);
        buf
    }

    /// Decodes one record from the front of `bytes`, returning it and the
    /// number of bytes consumed.
    fn decode(bytes: &[u8]) -> Result<(CacheEntry, usize)> {
        const HEADER_LEN: usize = 4 + 8 + 8 + 4 + 8 + 4 + HASH_LEN + 4;
        if bytes.len() < HEADER_LEN {
            bail!("truncated cache record");
        }

        let mode = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let size = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let mtime_sec = i64::from_le_bytes(bytes[12..20].try_into().unwrap());
        let mtime_nsec = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
        let ctime_sec = i64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let ctime_nsec = u32::from_le_bytes(bytes[32..36].try_into().unwrap());
        let mut sha1_bytes = [0u8; HASH_LEN];
        sha1_bytes.copy_from_slice(&bytes[36..36 + HASH_LEN]);
        let path_len_offset = 36 + HASH_LEN;
        let path_len =
            u32::from_le_bytes(bytes[path_len_offset..path_len_offset + 4].try_into().unwrap())
                as usize;

        let path_start = HEADER_LEN;
        let path_end = path_start + path_len;
        if bytes.len() < path_end + 1 {
            bail!("truncated cache record path");
        }
        let path = std::str::from_utf8(&bytes[path_start..path_end])
            .context("cache record path isn't UTF-8")?;

        Ok((
            CacheEntry {
                mode,
                size,
                mtime: (mtime_sec, mtime_nsec),
                ctime: (ctime_sec, ctime_nsec),
                sha1: ObjectId::from_bytes(sha1_bytes),
                path: Utf8PathBuf::from(path),
            },
            path_end + 1,
        ))
    }
}

/// What changed between a cache entry and the file's current metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct Changed {
    pub mode: bool,
    pub time: bool,
    pub size: bool,
}

impl Changed {
    pub fn any(&self) -> bool {
        self.mode || self.time || self.size
    }
}

pub fn changed(entry: &CacheEntry, meta: &fs::Metadata) -> Changed {
    Changed {
        mode: entry.mode != meta.mode(),
        time: entry.mtime != (meta.mtime(), meta.mtime_nsec() as u32)
            || entry.ctime != (meta.ctime(), meta.ctime_nsec() as u32),
        size: entry.size != meta.size(),
    }
}

pub struct Cache {
    entries: Vec<CacheEntry>,
}

impl Cache {
    /// Loads the cache from `store_dir`, or an empty one if none exists yet.
    pub fn load(store_dir: &Utf8Path) -> Result<Cache> {
        let path = store_dir.join(CACHE_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if io_not_found(&e) => return Ok(Cache { entries: Vec::new() }),
            Err(e) => return Err(e).with_context(|| format!("Couldn't read {path}")),
        };

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (entry, consumed) = CacheEntry::decode(&bytes[offset..])
                .with_context(|| format!("{path} is corrupt"))?;
            offset += consumed;
            entries.push(entry);
        }
        Ok(Cache { entries })
    }

    /// Binary-searches for `path`, returning its index if present.
    pub fn lookup(&self, path: &Utf8Path) -> Option<usize> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path.as_str()))
            .ok()
    }

    pub fn entry(&self, idx: usize) -> &CacheEntry {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut CacheEntry {
        &mut self.entries[idx]
    }

    /// Inserts `entry` in sorted order, returning its new index.
    pub fn insert(&mut self, entry: CacheEntry) -> usize {
        let idx = match self
            .entries
            .binary_search_by(|e| e.path.as_str().cmp(entry.path.as_str()))
        {
            Ok(idx) | Err(idx) => idx,
        };
        self.entries.insert(idx, entry);
        idx
    }

    /// Writes the cache to a temp file and renames it into place. Refuses
    /// to clobber a pre-existing temp file, which would mean another
    /// `bkp` process is mid-persist (or one died before cleaning up).
    pub fn persist(&self, store_dir: &Utf8Path) -> Result<()> {
        let tmp_path = store_dir.join(CACHE_TMP_FILE);
        let final_path = store_dir.join(CACHE_FILE);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    anyhow::Error::new(StoreError::CacheLocked(tmp_path.clone()))
                } else {
                    anyhow::Error::new(e).context(format!("Couldn't create {tmp_path}"))
                }
            })?;

        for entry in &self.entries {
            file.write_all(&entry.encode())?;
        }
        file.sync_all()
            .with_context(|| format!("Couldn't flush {tmp_path}"))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("Couldn't move {tmp_path} to {final_path}"))
    }
}
