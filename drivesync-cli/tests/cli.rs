use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

use drivesync_core::{config, store, FileSystem, RemoteId, TrackedFile};

fn drivesync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("drivesync"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

#[test]
fn init_writes_config_with_intervals() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let root = workspace.path().join("Drive");
    let remote = workspace.path().join("share");

    drivesync_cmd(home.path())
        .arg("init")
        .arg(&root)
        .arg("--remote")
        .arg(&remote)
        .args(["--poll-interval", "7", "--merge-interval", "3"])
        .assert()
        .success()
        .stdout(contains("Syncing"));

    assert!(root.is_dir());
    let cfg = config::load_at(home.path()).expect("config written");
    assert_eq!(cfg.root, root.canonicalize().expect("canonical root"));
    assert_eq!(cfg.poll_interval_secs, 7);
    assert_eq!(cfg.merge_interval_secs, 3);
}

#[test]
fn init_rejects_nested_remote_and_zero_interval() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let root = workspace.path().join("Drive");

    drivesync_cmd(home.path())
        .arg("init")
        .arg(&root)
        .arg("--remote")
        .arg(root.join("remote"))
        .assert()
        .failure()
        .stderr(contains("must not contain each other"));

    drivesync_cmd(home.path())
        .arg("init")
        .arg(&root)
        .arg("--remote")
        .arg(workspace.path().join("share"))
        .args(["--merge-interval", "0"])
        .assert()
        .failure();
}

#[test]
fn status_without_config_points_at_init() {
    let home = TempDir::new().expect("home");
    drivesync_cmd(home.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(contains("drivesync init"));
}

#[test]
fn status_json_reports_persisted_state() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let root = workspace.path().join("Drive");
    fs::create_dir_all(&root).expect("root");
    config::init_at(home.path(), root.clone(), workspace.path().join("share")).expect("init");

    let mut model = FileSystem::new();
    model.update_revision(12);
    let dir = TrackedFile {
        id: RemoteId("d1".to_string()),
        name: "docs".to_string(),
        parent: Some(RemoteId::root()),
        is_dir: true,
        checksum: None,
    };
    let file = TrackedFile {
        id: RemoteId("f1".to_string()),
        name: "a.txt".to_string(),
        parent: Some(dir.id.clone()),
        is_dir: false,
        checksum: Some("abc".to_string()),
    };
    model.insert(dir).expect("insert dir");
    model.insert(file).expect("insert file");
    store::save_at(home.path(), &model).expect("save state");

    let assert = drivesync_cmd(home.path())
        .args(["status", "--json"])
        .assert()
        .success();
    let report: Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("status is JSON");
    assert_eq!(report["revision"], 12);
    assert_eq!(report["files"], 1);
    assert_eq!(report["directories"], 1);
    assert!(report["synced_at"].is_string());
}

#[test]
fn daemon_status_when_stopped() {
    let home = TempDir::new().expect("home");
    let assert = drivesync_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success();
    let payload: Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("status is JSON");
    assert_eq!(payload["running"], false);

    drivesync_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("not running"));

    drivesync_cmd(home.path())
        .args(["daemon", "sync"])
        .assert()
        .failure();
}
