//! The snapshot engine.
//!
//! A snapshot object chains to its parent (the all-zero id if it's the
//! first), points at a root tree, and carries a timestamp. HEAD is a
//! 20-byte file holding the most recent snapshot's id, updated by
//! writing a temp file and renaming it into place; the original updates
//! it with a bare `write()`, which a crash between the partial write and
//! the next read could leave torn; the rename makes the update atomic.
//!
//! Creating a snapshot drains the worker pool (so every blob, chunk list,
//! and subtree the new root tree references is durably on disk) before
//! the snapshot object itself is written and before HEAD is advanced.
//! That's the one ordering obligation this store makes: HEAD never points
//! at a snapshot whose tree isn't fully flushed.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use camino::Utf8Path;
use tracing::info;

use crate::cache::Cache;
use crate::hash::{HASH_LEN, ObjectId};
use crate::store::{ObjectStore, SNAPSHOT};
use crate::tree;
use crate::worker::WorkerPool;

const HEAD_FILE: &str = "last_snapshot";
const HEAD_TMP_FILE: &str = "last_snapshot.new";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub parent: ObjectId,
    pub tree: ObjectId,
    pub time: i64,
    pub date: String,
}

/// Reads HEAD, returning [`ObjectId::ZERO`] if no snapshot has been made yet.
pub fn read_head(store_dir: &Utf8Path) -> Result<ObjectId> {
    let path = store_dir.join(HEAD_FILE);
    match fs::read(&path) {
        Ok(bytes) => {
            ensure!(bytes.len() == HASH_LEN, "{path} is corrupt (wrong length)");
            let mut raw = [0u8; HASH_LEN];
            raw.copy_from_slice(&bytes);
            Ok(ObjectId::from_bytes(raw))
        }
        Err(e) if crate::store::io_not_found(&e) => Ok(ObjectId::ZERO),
        Err(e) => Err(e).with_context(|| format!("Couldn't read {path}")),
    }
}

fn write_head(store_dir: &Utf8Path, id: &ObjectId) -> Result<()> {
    let tmp_path = store_dir.join(HEAD_TMP_FILE);
    let final_path = store_dir.join(HEAD_FILE);
    fs::write(&tmp_path, id.as_bytes()).with_context(|| format!("Couldn't write {tmp_path}"))?;
    fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("Couldn't move {tmp_path} to {final_path}"))
}

/// Walks `root`, builds and writes a new tree, and chains a new snapshot
/// onto HEAD. Persists the file cache before the pool is drained, so a
/// cache entry for a file that was chunked is never lost even if the
/// snapshot object write that follows fails.
pub fn create_snapshot(
    store: &Arc<ObjectStore>,
    store_dir: &Utf8Path,
    root: &Utf8Path,
    chunk_size: usize,
) -> Result<ObjectId> {
    let mut cache = Cache::load(store_dir)?;
    let pool = WorkerPool::new();

    let tree_id = tree::build_tree(store, &pool, root, store_dir, &mut cache, chunk_size)?;
    cache.persist(store_dir)?;
    pool.wait_quiescent()
        .context("a worker failed to write an object for this snapshot")?;

    let parent = read_head(store_dir)?;
    let now = jiff::Zoned::now();
    let time = now.timestamp().as_second();
    let date = now.format("%Y-%m-%d %H:%M:%S").to_string();

    let payload = serialize(&parent, &tree_id, time, &date);
    let snapshot_id = store.write_object(SNAPSHOT, &payload)?;

    write_head(store_dir, &snapshot_id)?;
    info!(%snapshot_id, %tree_id, "created snapshot");
    Ok(snapshot_id)
}

/// Reads the chain of snapshots starting at HEAD, most recent first, up
/// to `limit` entries.
pub fn list_snapshots(
    store: &ObjectStore,
    store_dir: &Utf8Path,
    limit: usize,
) -> Result<Vec<(ObjectId, Snapshot)>> {
    let mut out = Vec::new();
    let mut current = read_head(store_dir)?;

    while !current.is_zero() && out.len() < limit {
        let payload = store.read_object(&current, SNAPSHOT)?;
        let snapshot = parse(&payload)?;
        let parent = snapshot.parent;
        out.push((current, snapshot));
        current = parent;
    }

    Ok(out)
}

/// Reads a single snapshot by id.
pub fn read_snapshot(store: &ObjectStore, id: &ObjectId) -> Result<Snapshot> {
    if !store.contains(id) {
        bail!(crate::error::StoreError::SnapshotNotFound(*id));
    }
    let payload = store.read_object(id, SNAPSHOT)?;
    parse(&payload)
}

fn serialize(parent: &ObjectId, tree: &ObjectId, time: i64, date: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"parent ");
    buf.push(0);
    buf.extend_from_slice(parent.as_bytes());
    buf.extend_from_slice(b"tree ");
    buf.push(0);
    buf.extend_from_slice(tree.as_bytes());
    buf.extend_from_slice(format!("time {time}").as_bytes());
    buf.push(0);
    buf.extend_from_slice(format!("date {date}").as_bytes());
    buf.push(0);
    buf
}

fn parse(payload: &[u8]) -> Result<Snapshot> {
    let mut offset = 0;

    offset = expect_literal(payload, offset, b"parent ")?;
    let parent = read_id(payload, &mut offset)?;

    offset = expect_literal(payload, offset, b"tree ")?;
    let tree = read_id(payload, &mut offset)?;

    let time_field = read_cstr(payload, &mut offset)?;
    let time: i64 = time_field
        .strip_prefix("time ")
        .ok_or_else(|| anyhow::anyhow!("corrupt snapshot: expected \"time \", got {time_field:?}"))?
        .parse()
        .context("corrupt snapshot: bad time field")?;

    let date_field = read_cstr(payload, &mut offset)?;
    let date = date_field
        .strip_prefix("date ")
        .ok_or_else(|| anyhow::anyhow!("corrupt snapshot: expected \"date \", got {date_field:?}"))?
        .to_owned();

    Ok(Snapshot { parent, tree, time, date })
}

fn expect_literal(payload: &[u8], offset: usize, literal: &[u8]) -> Result<usize> {
    let end = offset + literal.len();
    if payload.get(offset..end) != Some(literal) {
        bail!("corrupt snapshot: expected {:?} at offset {offset}", std::str::from_utf8(literal));
    }
    Ok(end)
}

fn read_id(payload: &[u8], offset: &mut usize) -> Result<ObjectId> {
    // one NUL separates the field label from the raw id bytes
    *offset += 1;
    let end = *offset + HASH_LEN;
    let bytes = payload
        .get(*offset..end)
        .ok_or_else(|| anyhow::anyhow!("corrupt snapshot: truncated id"))?;
    let mut raw = [0u8; HASH_LEN];
    raw.copy_from_slice(bytes);
    *offset = end;
    Ok(ObjectId::from_bytes(raw))
}

fn read_cstr<'a>(payload: &'a [u8], offset: &mut usize) -> Result<&'a str> {
    let nul = payload[*offset..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow::anyhow!("corrupt snapshot: missing NUL terminator"))?;
    let s = std::str::from_utf8(&payload[*offset..*offset + nul])
        .context("corrupt snapshot: field isn't UTF-8")?;
    *offset += nul + 1;
    Ok(s)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serialize_parse_round_trips() {
        let parent = ObjectId::hash(b"parent");
        let tree = ObjectId::hash(b"tree");
        let payload = serialize(&parent, &tree, 1_700_000_000, "2023-11-14 12:00:00");
        let snapshot = parse(&payload).unwrap();

        assert_eq!(snapshot.parent, parent);
        assert_eq!(snapshot.tree, tree);
        assert_eq!(snapshot.time, 1_700_000_000);
        assert_eq!(snapshot.date, "2023-11-14 12:00:00");
    }

    #[test]
    fn zero_parent_round_trips() {
        let payload = serialize(&ObjectId::ZERO, &ObjectId::hash(b"tree"), 0, "2023-01-01 00:00:00");
        let snapshot = parse(&payload).unwrap();
        assert!(snapshot.parent.is_zero());
    }

    #[test]
    fn head_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = Utf8Path::from_path(dir.path()).unwrap();

        assert!(read_head(store_dir).unwrap().is_zero());

        let id = ObjectId::hash(b"some snapshot");
        write_head(store_dir, &id).unwrap();
        assert_eq!(read_head(store_dir).unwrap(), id);
    }

    #[test]
    fn reading_an_unknown_snapshot_id_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = Utf8Path::from_path(dir.path()).unwrap();
        let store = ObjectStore::open(store_dir, true).unwrap();

        let bogus = ObjectId::hash(b"never written");
        let err = read_snapshot(&store, &bogus).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
