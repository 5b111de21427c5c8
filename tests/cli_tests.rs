//! Command-line tests for the `onboarding` binary
//!
//! Every test runs the binary inside its own temporary directory so the
//! `.onboarding/` stores never leak between tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn onboarding(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("onboarding").unwrap();
    cmd.current_dir(dir.path()).env("RUST_LOG", "error");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();

    onboarding(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("approve"))
        .stdout(predicate::str::contains("resume"));
}

#[test]
fn test_run_small_request_completes() {
    let dir = TempDir::new().unwrap();

    onboarding(&dir)
        .args(["run", "--organization", "Acme", "--users", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scheduled onboarding instance"))
        .stdout(predicate::str::contains("Workflow completed - result: COMPLETED"));

    let store = std::fs::read_to_string(dir.path().join(".onboarding/statestore.json")).unwrap();
    assert!(store.contains("Acme"));
}

#[test]
fn test_seed_writes_record() {
    let dir = TempDir::new().unwrap();

    onboarding(&dir)
        .args(["seed", "--organization", "Acme", "--users", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Seeded Acme with 5 users"));

    let store = std::fs::read_to_string(dir.path().join(".onboarding/statestore.json")).unwrap();
    let document: serde_json::Value = serde_json::from_str(&store).unwrap();
    let record: serde_json::Value =
        serde_json::from_str(document["Acme"].as_str().unwrap()).unwrap();
    assert_eq!(record["numofusers"], 5);
}

#[test]
fn test_reset_removes_record() {
    let dir = TempDir::new().unwrap();

    onboarding(&dir)
        .args(["seed", "--organization", "Acme", "--users", "5"])
        .assert()
        .success();
    onboarding(&dir)
        .args(["seed", "--organization", "Globex", "--users", "9"])
        .assert()
        .success();

    onboarding(&dir)
        .args(["reset", "--organization", "Acme"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed record for Acme"));

    let store = std::fs::read_to_string(dir.path().join(".onboarding/statestore.json")).unwrap();
    let document: serde_json::Value = serde_json::from_str(&store).unwrap();
    assert!(document.get("Acme").is_none());
    assert!(document.get("Globex").is_some());
}

#[test]
fn test_status_of_unknown_instance_fails() {
    let dir = TempDir::new().unwrap();

    onboarding(&dir)
        .args(["status", "--instance", "does-not-exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Workflow instance not found: does-not-exist"));
}

#[test]
fn test_resume_with_nothing_pending() {
    let dir = TempDir::new().unwrap();

    onboarding(&dir)
        .arg("resume")
        .assert()
        .success()
        .stdout(predicate::str::contains("No incomplete instances to resume"));
}
