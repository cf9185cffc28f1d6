use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_status_on_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("timeline.db");

    Command::cargo_bin("crewtrace")
        .unwrap()
        .args(["--db", db.to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No active agents."));
}

#[test]
fn test_locks_on_fresh_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("timeline.db");

    Command::cargo_bin("crewtrace")
        .unwrap()
        .args(["--db", db.to_str().unwrap(), "locks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No advisory locks held."));
}

#[test]
fn test_simulate_emits_session_lifecycle() {
    Command::cargo_bin("crewtrace")
        .unwrap()
        .arg("simulate")
        .assert()
        .success()
        .stdout(predicate::str::contains("session_created"))
        .stdout(predicate::str::contains("turn_created"))
        .stdout(predicate::str::contains("session_ended"));
}
