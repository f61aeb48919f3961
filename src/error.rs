//! Typed leaf errors.
//!
//! These are the conditions a caller might want to match on; everything
//! else propagates as plain `anyhow::Error` with `.context()` breadcrumbs.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::hash::ObjectId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0:?} isn't a valid 40-character hex SHA-1")]
    InvalidHex(String),

    #[error("object {id} has type \"{actual}\", expected \"{expected}\"")]
    TypeMismatch {
        id: ObjectId,
        expected: &'static str,
        actual: String,
    },

    #[error("object {id} is corrupt: its bytes no longer hash to its own name")]
    Corrupt { id: ObjectId },

    #[error("restore target {0} is not empty")]
    NonEmptyTarget(Utf8PathBuf),

    #[error("a cache update is already in progress ({0} exists), remove it if no `bkp` is running")]
    CacheLocked(Utf8PathBuf),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(ObjectId),
}
