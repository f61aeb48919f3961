//! The content-addressed object store.
//!
//! Every object (blob, chunk list, tree, or snapshot) is framed the same
//! way: `tag` + NUL + `payload`, deflated, and named by the SHA-1 of the
//! *compressed* bytes. Two objects with identical framed content always
//! land on the same filename, which is the store's whole deduplication
//! story: a second writer just finds the file already there.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::hash::ObjectId;
use crate::worker::WorkerPool;

pub const BLOB: &str = "blob";
pub const CHUNKS: &str = "chunks";
pub const TREE: &str = "tree";
pub const SNAPSHOT: &str = "snapshot";

/// Default name of the store directory, created in the current directory
/// on first use.
pub const DEFAULT_STORE_DIR: &str = ".bkp-data";

pub struct ObjectStore {
    dir: Utf8PathBuf,
    verify_on_read: bool,
}

impl ObjectStore {
    /// Opens (creating if necessary) the object store at `dir`.
    pub fn open(dir: &Utf8Path, verify_on_read: bool) -> Result<ObjectStore> {
        let dir = dir.to_owned();
        if !dir.exists() {
            debug!(%dir, "store directory doesn't exist, creating it");
            fs::create_dir_all(&dir).with_context(|| format!("Couldn't create {dir}"))?;
        }
        Ok(ObjectStore { dir, verify_on_read })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn object_path(&self, id: &ObjectId) -> Utf8PathBuf {
        self.dir.join(id.to_hex())
    }

    /// Frames and deflates `payload` under `tag`, returning the object's id
    /// and its compressed bytes without touching disk. Splitting this out
    /// from [`write_compressed`](Self::write_compressed) is what lets
    /// callers learn an object's id (e.g. to put it in a chunk list or tree
    /// entry) before the actual write, which can then be handed to a
    /// [`WorkerPool`] to overlap with the next chunk's compression.
    pub fn compress(tag: &str, payload: &[u8]) -> (ObjectId, Vec<u8>) {
        let mut framed = Vec::with_capacity(tag.len() + 1 + payload.len());
        framed.extend_from_slice(tag.as_bytes());
        framed.push(0);
        framed.extend_from_slice(payload);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&framed)
            .expect("compressing into a Vec can't fail");
        let compressed = encoder.finish().expect("zlib encoding can't fail");

        let id = ObjectId::hash(&compressed);
        (id, compressed)
    }

    /// Writes already-compressed bytes under `id`. A no-op if the object is
    /// already present: the filename *is* the content, so nothing is lost.
    pub fn write_compressed(&self, id: &ObjectId, compressed: &[u8]) -> Result<()> {
        let path = self.object_path(id);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o666)
            .open(&path)
        {
            Ok(mut file) => file
                .write_all(compressed)
                .with_context(|| format!("Couldn't write object {path}")),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                trace!(%id, "object already present, skipping write");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Couldn't create {path}")),
        }
    }

    /// Compresses and writes `payload` synchronously, returning its id.
    pub fn write_object(&self, tag: &str, payload: &[u8]) -> Result<ObjectId> {
        let (id, compressed) = Self::compress(tag, payload);
        self.write_compressed(&id, &compressed)?;
        Ok(id)
    }

    /// Compresses `payload` synchronously (so the id is known immediately)
    /// but hands the disk write to `pool`, overlapping it with whatever the
    /// caller does next.
    pub fn submit_write(
        self: &Arc<Self>,
        pool: &WorkerPool,
        tag: &'static str,
        payload: Vec<u8>,
    ) -> ObjectId {
        let (id, compressed) = Self::compress(tag, &payload);
        let store = Arc::clone(self);
        let write_id = id;
        pool.submit(Box::new(move || store.write_compressed(&write_id, &compressed)));
        id
    }

    /// Reads and inflates the object named `id`, checking that its tag
    /// matches `expected_type`. If `verify_on_read` is set, also checks
    /// that the compressed bytes still hash to `id` before trusting them.
    pub fn read_object(&self, id: &ObjectId, expected_type: &str) -> Result<Vec<u8>> {
        let (tag, payload) = self.read_tagged(id)?;
        if tag != expected_type {
            bail!(StoreError::TypeMismatch {
                id: *id,
                expected: expected_type,
                actual: tag,
            });
        }
        Ok(payload)
    }

    /// Reads just enough of an object to learn its tag, without asserting
    /// what that tag should be. Used by diagnostics (`show-file`) that
    /// don't know in advance what kind of object they were given.
    pub fn probe_type(&self, id: &ObjectId) -> Result<String> {
        Ok(self.read_tagged(id)?.0)
    }

    fn read_tagged(&self, id: &ObjectId) -> Result<(String, Vec<u8>)> {
        let path = self.object_path(id);
        let compressed = fs::read(&path).with_context(|| format!("Couldn't read object {path}"))?;

        if self.verify_on_read {
            let actual = ObjectId::hash(&compressed);
            if actual != *id {
                bail!(StoreError::Corrupt { id: *id });
            }
        }

        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut framed = Vec::new();
        decoder
            .read_to_end(&mut framed)
            .with_context(|| format!("Couldn't inflate object {path}"))?;

        let nul = framed
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| anyhow::anyhow!("object {path} has no tag terminator"))?;
        let tag = std::str::from_utf8(&framed[..nul])
            .with_context(|| format!("object {path} has a non-UTF-8 tag"))?
            .to_owned();
        let payload = framed[nul + 1..].to_vec();
        Ok((tag, payload))
    }

    /// True if an object with this id is already on disk, regardless of
    /// its tag.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.object_path(id).exists()
    }
}

pub(crate) fn io_not_found(e: &io::Error) -> bool {
    e.kind() == ErrorKind::NotFound
}
