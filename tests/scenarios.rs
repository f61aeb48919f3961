mod common;

use std::fs;

use predicates::prelude::*;
use tempfile::tempdir;

use common::{cli_run, count_entries};

#[test]
fn minimal_backup_and_restore_round_trips() {
    let backup_dir = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    let restore_dir = tempdir().unwrap();

    fs::write(backup_dir.path().join("hello.txt"), b"hello, world").unwrap();

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created snapshot"));

    let snapshot_id = latest_snapshot_id(backup_dir.path(), store_dir.path());

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .args(["restore-snapshot", &snapshot_id])
        .arg(restore_dir.path())
        .assert()
        .success();

    assert_eq!(
        fs::read(restore_dir.path().join("hello.txt")).unwrap(),
        b"hello, world"
    );
}

#[test]
fn identical_files_deduplicate_to_one_blob() {
    let backup_dir = tempdir().unwrap();
    let store_dir = tempdir().unwrap();

    fs::write(backup_dir.path().join("a.txt"), b"the exact same bytes").unwrap();
    fs::write(backup_dir.path().join("b.txt"), b"the exact same bytes").unwrap();

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success();

    // 1 blob + 2 chunk-lists (one per file, identical) + 1 tree + 1 snapshot
    // collapse to: 1 blob + 1 chunks object (both files share bytes and
    // therefore share a chunk list too) + 1 tree + 1 snapshot = 4 objects.
    let object_count = count_entries(store_dir.path())
        - ["filecache", "last_snapshot"]
            .iter()
            .filter(|f| store_dir.path().join(f).exists())
            .count();
    assert_eq!(object_count, 4);
}

#[test]
fn unchanged_file_is_not_rechunked_on_second_snapshot() {
    let backup_dir = tempdir().unwrap();
    let store_dir = tempdir().unwrap();

    fs::write(backup_dir.path().join("stable.txt"), b"never changes").unwrap();

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success();

    let after_first = count_entries(store_dir.path());

    fs::write(backup_dir.path().join("new.txt"), b"shows up in round two").unwrap();

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success();

    let after_second = count_entries(store_dir.path());

    // Exactly: one new blob, one new chunks object, one new tree, one new
    // snapshot for new.txt, nothing extra for stable.txt.
    assert_eq!(after_second - after_first, 4);
}

#[test]
fn snapshot_chain_grows_with_each_snapshot() {
    let backup_dir = tempdir().unwrap();
    let store_dir = tempdir().unwrap();

    fs::write(backup_dir.path().join("one.txt"), b"v1").unwrap();
    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success();

    fs::write(backup_dir.path().join("two.txt"), b"v2").unwrap();
    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success();

    fs::write(backup_dir.path().join("three.txt"), b"v3").unwrap();
    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success();

    let output = cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("snapshots")
        .output()
        .unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.lines().count(), 3);
}

#[test]
fn sub_path_restore_keeps_only_that_branch() {
    let backup_dir = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    let restore_dir = tempdir().unwrap();

    fs::create_dir(backup_dir.path().join("keep")).unwrap();
    fs::create_dir(backup_dir.path().join("skip")).unwrap();
    fs::write(backup_dir.path().join("keep/wanted.txt"), b"wanted").unwrap();
    fs::write(backup_dir.path().join("skip/unwanted.txt"), b"unwanted").unwrap();

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success();

    let snapshot_id = latest_snapshot_id(backup_dir.path(), store_dir.path());

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .args(["restore-snapshot", &snapshot_id])
        .arg(restore_dir.path())
        .arg("keep")
        .assert()
        .success();

    assert!(restore_dir.path().join("keep/wanted.txt").exists());
    assert!(!restore_dir.path().join("skip").exists());
}

#[test]
fn restore_into_nonempty_directory_fails() {
    let backup_dir = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    let restore_dir = tempdir().unwrap();

    fs::write(backup_dir.path().join("f.txt"), b"data").unwrap();
    fs::write(restore_dir.path().join("already-here.txt"), b"squatter").unwrap();

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success();

    let snapshot_id = latest_snapshot_id(backup_dir.path(), store_dir.path());

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .args(["restore-snapshot", &snapshot_id])
        .arg(restore_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("not empty"));
}

#[test]
fn corrupted_object_is_caught_on_restore() {
    let backup_dir = tempdir().unwrap();
    let store_dir = tempdir().unwrap();
    let restore_dir = tempdir().unwrap();

    fs::write(backup_dir.path().join("precious.txt"), b"don't tamper with me").unwrap();

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("create-snapshot")
        .assert()
        .success();

    // Fetch the snapshot id before tampering with anything in the store:
    // `snapshots` has to decode every object on the parent chain, so doing
    // this after corruption would make the helper fail instead of the
    // restore under test.
    let snapshot_id = latest_snapshot_id(backup_dir.path(), store_dir.path());

    let blob_path = find_blob_object(backup_dir.path(), store_dir.path());
    fs::write(&blob_path, b"not the original compressed bytes").unwrap();

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .args(["restore-snapshot", &snapshot_id])
        .arg(restore_dir.path())
        .assert()
        .failure();
}

/// Finds the one object file in `store_dir` that `show-file` reports as a
/// blob, so the corruption test tampers a specific, known-kind object
/// rather than whichever one `read_dir` happens to list first.
fn find_blob_object(backup_dir: &std::path::Path, store_dir: &std::path::Path) -> std::path::PathBuf {
    for entry in fs::read_dir(store_dir).unwrap().filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.len() != 40 {
            continue;
        }

        let output = cli_run(backup_dir, store_dir)
            .unwrap()
            .args(["show-file", name])
            .output()
            .unwrap();
        if String::from_utf8_lossy(&output.stdout).starts_with("---- blob,") {
            return path;
        }
    }
    panic!("no blob object found in {}", store_dir.display());
}

#[test]
fn cli_help_smoke_test() {
    let backup_dir = tempdir().unwrap();
    let store_dir = tempdir().unwrap();

    cli_run(backup_dir.path(), store_dir.path())
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create-snapshot"));
}

fn latest_snapshot_id(backup_dir: &std::path::Path, store_dir: &std::path::Path) -> String {
    let output = cli_run(backup_dir, store_dir)
        .unwrap()
        .arg("snapshots")
        .output()
        .unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    stdout
        .lines()
        .next()
        .expect("at least one snapshot")
        .split_whitespace()
        .next()
        .expect("snapshot line has an id")
        .to_owned()
}
