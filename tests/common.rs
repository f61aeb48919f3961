#![allow(dead_code)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;

/// Builds a `bkp` invocation rooted at `backup_dir` (both as the process's
/// working directory, since `create-snapshot`/`restore-snapshot` act on the
/// current directory, and as the directory the store lives under).
pub fn cli_run(backup_dir: &Path, store_dir: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME"))?;
    cmd.current_dir(backup_dir);
    cmd.arg("-C").arg(store_dir);
    cmd.arg("-vvv");
    Ok(cmd)
}

pub fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).expect("Couldn't read dir").count()
}
