//! SHA-1 object identifiers.
//!
//! An [`ObjectId`] names an object by the SHA-1 digest of its on-disk
//! (compressed) bytes. The all-zero id is a sentinel meaning "no object",
//! used by the snapshot engine as the parent pointer of the first snapshot.

use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};

use crate::error::StoreError;

/// Length in bytes of a SHA-1 digest.
pub const HASH_LEN: usize = 20;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectId([u8; HASH_LEN]);

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId([0u8; HASH_LEN]);

    /// Hashes `bytes` and returns the resulting id.
    pub fn hash(bytes: &[u8]) -> ObjectId {
        let digest = Sha1::digest(bytes);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest);
        ObjectId(out)
    }

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> ObjectId {
        ObjectId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    pub fn to_hex(self) -> String {
        to_hex(&self.0)
    }
}

/// Lowercase 40-character hex encoding, matching the store's filenames.
pub fn to_hex(bytes: &[u8; HASH_LEN]) -> String {
    use fmt::Write;
    let mut s = String::with_capacity(HASH_LEN * 2);
    for b in bytes {
        write!(s, "{b:02x}").expect("writing to a String can't fail");
    }
    s
}

/// Parses a 40-character hex string into a raw digest.
pub fn from_hex(s: &str) -> Result<[u8; HASH_LEN], StoreError> {
    if s.len() != HASH_LEN * 2 {
        return Err(StoreError::InvalidHex(s.to_owned()));
    }
    let mut out = [0u8; HASH_LEN];
    for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
        let hi = hex_digit(chunk[0]).ok_or_else(|| StoreError::InvalidHex(s.to_owned()))?;
        let lo = hex_digit(chunk[1]).ok_or_else(|| StoreError::InvalidHex(s.to_owned()))?;
        out[i] = (hi << 4) | lo;
    }
    Ok(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ObjectId(from_hex(s)?))
    }
}
