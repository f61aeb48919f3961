use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

use crate::chunk;

#[inline]
fn default_verify_on_read() -> bool {
    true
}

#[inline]
fn default_chunk_size() -> u64 {
    chunk::CHUNK_SIZE as u64
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// Re-hash every object's compressed bytes on read and reject the
    /// object if they no longer match its name. Costs a pass over the
    /// object on every read; worth it unless the store lives on media
    /// you already trust.
    #[serde(default = "default_verify_on_read")]
    pub verify_on_read: bool,

    /// Size, in bytes, of the chunks files are split into before storage.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            verify_on_read: default_verify_on_read(),
            chunk_size: default_chunk_size(),
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "bkp.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}
