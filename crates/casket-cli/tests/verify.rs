use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use casket::{Cache, PutOptions};
use serde_json::Value;

fn seeded_cache(root: &std::path::Path) -> Cache {
    let cache = Cache::new(Some(root.to_path_buf())).expect("cache");
    cache
        .put("cli-key", b"foobarbaz", PutOptions::default())
        .expect("put");
    cache
}

#[test]
fn verify_reports_stats_as_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("cache");
    seeded_cache(&root);

    let assert = cargo_bin_cmd!("casket")
        .arg("--cache")
        .arg(&root)
        .args(["--json", "verify"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout");
    let payload: Value = serde_json::from_str(&stdout).expect("json stats");
    assert_eq!(payload["totalEntries"], 1);
    assert_eq!(payload["verifiedContent"], 1);
    assert_eq!(payload["reclaimedCount"], 0);
    assert_eq!(payload["badContentCount"], 0);
}

#[test]
fn verify_reclaims_orphans_and_updates_the_marker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("cache");
    let cache = seeded_cache(&root);
    cache
        .write_content(casket::Algorithm::Sha512, b"orphan")
        .expect("orphan blob");

    let assert = cargo_bin_cmd!("casket")
        .arg("--cache")
        .arg(&root)
        .args(["--json", "verify"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout");
    let payload: Value = serde_json::from_str(&stdout).expect("json stats");
    assert_eq!(payload["reclaimedCount"], 1);
    assert_eq!(payload["reclaimedSize"], 6);

    let marker = fs::read_to_string(root.join("_lastverified")).expect("marker");
    let last_run = cargo_bin_cmd!("casket")
        .arg("--cache")
        .arg(&root)
        .arg("last-run")
        .assert()
        .success();
    let stdout = String::from_utf8(last_run.get_output().stdout.clone()).expect("utf8 stdout");
    assert_eq!(stdout.trim(), marker.trim());
}

#[test]
fn last_run_reports_unverified_caches() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("cache");

    let assert = cargo_bin_cmd!("casket")
        .arg("--cache")
        .arg(&root)
        .args(["--json", "last-run"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout");
    let payload: Value = serde_json::from_str(&stdout).expect("json payload");
    assert_eq!(payload["lastRun"], Value::Null);
}

#[test]
fn verify_fails_when_the_root_is_unusable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let blocker = temp.path().join("blocker");
    fs::write(&blocker, b"file in the way").expect("blocker file");

    cargo_bin_cmd!("casket")
        .arg("--cache")
        .arg(&blocker)
        .arg("verify")
        .assert()
        .failure();
}
