//! `show-file`: a diagnostic that dumps any object by id, figuring out its
//! type from the object itself rather than requiring the caller to say
//! what they expect.

use std::io::{self, Write};

use anyhow::Result;

use crate::hash::{HASH_LEN, ObjectId};
use crate::snapshot;
use crate::store::{BLOB, CHUNKS, ObjectStore, SNAPSHOT, TREE};
use crate::tree;

pub fn show_file(store: &ObjectStore, id: &ObjectId) -> Result<()> {
    let tag = store.probe_type(id)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match tag.as_str() {
        BLOB => {
            let payload = store.read_object(id, BLOB)?;
            writeln!(out, "---- blob, {} bytes ----", payload.len())?;
            out.write_all(&payload)?;
        }
        CHUNKS => {
            let payload = store.read_object(id, CHUNKS)?;
            writeln!(out, "---- chunks, {} blobs ----", payload.len() / HASH_LEN)?;
            for raw in payload.chunks_exact(HASH_LEN) {
                let mut bytes = [0u8; HASH_LEN];
                bytes.copy_from_slice(raw);
                writeln!(out, "{}", ObjectId::from_bytes(bytes))?;
            }
        }
        TREE => {
            let payload = store.read_object(id, TREE)?;
            writeln!(out, "---- tree ----")?;
            for entry in tree::parse(&payload)? {
                writeln!(out, "{:o} {:<40} {}", entry.mode, entry.name, entry.id)?;
            }
        }
        SNAPSHOT => {
            let snapshot = snapshot::read_snapshot(store, id)?;
            writeln!(out, "---- snapshot ----")?;
            writeln!(out, "parent {}", snapshot.parent)?;
            writeln!(out, "tree   {}", snapshot.tree)?;
            writeln!(out, "time   {}", snapshot.time)?;
            writeln!(out, "date   {}", snapshot.date)?;
        }
        other => anyhow::bail!("object {id} has unrecognized type {other:?}"),
    }

    Ok(())
}
