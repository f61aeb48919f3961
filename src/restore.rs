//! The restore engine.
//!
//! Reconstructs a snapshot's tree into an empty target directory,
//! optionally filtered down to a single sub-path. The filter is a plain
//! string-prefix test against the entry's path under the output
//! directory: an entry is kept if it's an ancestor *or* a descendant of
//! the requested sub-path, matching the original's `memcmp`-based check
//! rather than a path-component-aware one.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

use anyhow::{Context, Result, bail, ensure};
use camino::Utf8Path;

use crate::error::StoreError;
use crate::hash::{HASH_LEN, ObjectId};
use crate::store::{BLOB, CHUNKS, ObjectStore};
use crate::tree;

const MODE_MASK: u32 = 0o777;

/// Restores `snapshot_id` into `out_dir`, which must already exist and be
/// empty. If `sub_path` is given, only entries whose path under `out_dir`
/// is an ancestor or descendant of `out_dir.join(sub_path)` are written.
pub fn restore_snapshot(
    store: &ObjectStore,
    snapshot_id: &ObjectId,
    out_dir: &Utf8Path,
    sub_path: Option<&Utf8Path>,
) -> Result<()> {
    ensure_empty(out_dir)?;

    let snapshot = crate::snapshot::read_snapshot(store, snapshot_id)?;

    let sub_path_filter = sub_path.map(|p| out_dir.join(p));
    restore_tree(store, &snapshot.tree, out_dir, sub_path_filter.as_deref())
}

fn ensure_empty(out_dir: &Utf8Path) -> Result<()> {
    let mut entries =
        fs::read_dir(out_dir).with_context(|| format!("Couldn't open restore target {out_dir}"))?;
    if entries.next().is_some() {
        bail!(StoreError::NonEmptyTarget(out_dir.to_owned()));
    }
    Ok(())
}

fn restore_tree(
    store: &ObjectStore,
    tree_id: &ObjectId,
    out_path: &Utf8Path,
    sub_path: Option<&Utf8Path>,
) -> Result<()> {
    let payload = store.read_object(tree_id, crate::store::TREE)?;
    let entries = tree::parse(&payload)?;

    for entry in entries {
        let entry_out_path = out_path.join(&entry.name);

        if let Some(sub) = sub_path {
            let a = entry_out_path.as_str();
            let b = sub.as_str();
            if !(a.starts_with(b) || b.starts_with(a)) {
                continue;
            }
        }

        if entry.is_dir() {
            DirBuilder::new()
                .mode(entry.mode & MODE_MASK)
                .create(&entry_out_path)
                .with_context(|| format!("Couldn't create directory {entry_out_path}"))?;
            restore_tree(store, &entry.id, &entry_out_path, sub_path)?;
        } else {
            restore_file(store, &entry, &entry_out_path)?;
        }
    }

    Ok(())
}

fn restore_file(store: &ObjectStore, entry: &tree::TreeEntry, out_path: &Utf8Path) -> Result<()> {
    let chunk_list = store.read_object(&entry.id, CHUNKS)?;
    ensure!(
        chunk_list.len() % HASH_LEN == 0,
        "corrupt chunks object {}: length isn't a multiple of {HASH_LEN}",
        entry.id
    );

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(entry.mode & MODE_MASK)
        .open(out_path)
        .with_context(|| format!("Couldn't create {out_path}"))?;

    for raw_id in chunk_list.chunks_exact(HASH_LEN) {
        let mut id_bytes = [0u8; HASH_LEN];
        id_bytes.copy_from_slice(raw_id);
        let blob_id = ObjectId::from_bytes(id_bytes);
        let bytes = store.read_object(&blob_id, BLOB)?;
        file.write_all(&bytes)
            .with_context(|| format!("Couldn't write {out_path}"))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk;
    use crate::snapshot;
    use camino::Utf8PathBuf;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn make_backup_with_snapshot(backup_root: &Utf8Path, store_dir: &Utf8Path) -> (Arc<ObjectStore>, ObjectId) {
        fs::create_dir_all(backup_root.join("sub")).unwrap();
        fs::write(backup_root.join("top.txt"), b"top level file").unwrap();
        fs::write(backup_root.join("sub/nested.txt"), b"nested file").unwrap();

        let store = Arc::new(ObjectStore::open(store_dir, true).unwrap());
        let id =
            snapshot::create_snapshot(&store, store_dir, backup_root, chunk::CHUNK_SIZE).unwrap();
        (store, id)
    }

    #[test]
    fn restore_full_snapshot_reconstructs_files() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("backup")).unwrap();
        let store_dir = Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap();
        let out_dir = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
        fs::create_dir_all(&out_dir).unwrap();

        let (store, snap_id) = make_backup_with_snapshot(&root, &store_dir);
        restore_snapshot(&store, &snap_id, &out_dir, None).unwrap();

        assert_eq!(fs::read(out_dir.join("top.txt")).unwrap(), b"top level file");
        assert_eq!(
            fs::read(out_dir.join("sub/nested.txt")).unwrap(),
            b"nested file"
        );
    }

    #[test]
    fn restore_rejects_nonempty_target() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("backup")).unwrap();
        let store_dir = Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap();
        let out_dir = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
        fs::create_dir_all(&out_dir).unwrap();
        fs::write(out_dir.join("already-here.txt"), b"oops").unwrap();

        let (store, snap_id) = make_backup_with_snapshot(&root, &store_dir);
        let err = restore_snapshot(&store, &snap_id, &out_dir, None).unwrap_err();
        assert!(err.to_string().contains("not empty"));
    }

    #[test]
    fn restore_sub_path_filters_to_one_branch() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("backup")).unwrap();
        let store_dir = Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap();
        let out_dir = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
        fs::create_dir_all(&out_dir).unwrap();

        let (store, snap_id) = make_backup_with_snapshot(&root, &store_dir);
        restore_snapshot(&store, &snap_id, &out_dir, Some(Utf8Path::new("sub"))).unwrap();

        assert!(!out_dir.join("top.txt").exists());
        assert_eq!(
            fs::read(out_dir.join("sub/nested.txt")).unwrap(),
            b"nested file"
        );
    }
}
