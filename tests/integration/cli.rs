//! Tests for the `reelforge` binary with the dry-run backend.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get a Command instance for the reelforge binary
#[allow(deprecated)]
fn reelforge_cmd() -> Command {
    let mut cmd = Command::cargo_bin("reelforge").expect("Failed to find reelforge binary");
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_run_completes_and_prints_outcome() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    reelforge_cmd()
        .current_dir(temp_dir.path())
        .args(["--checkpoint-dir", "checkpoints", "run", "a lighthouse keeper", "--session-id", "cli-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"completed_stages\""))
        .stdout(predicate::str::contains("\"status\": \"completed\""))
        .stdout(predicate::str::contains("integration"));

    // Completed runs leave no checkpoint behind.
    assert!(!temp_dir.path().join("checkpoints/cli-1.checkpoint.json").exists());
}

#[test]
fn test_over_budget_run_exits_with_failure() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("reelforge.toml");
    fs::write(
        &config_path,
        "[budget]\nlimit = 0.5\n\n[pipeline]\ncheckpoint_dir = \"checkpoints\"\n",
    )
    .expect("Failed to write config");

    reelforge_cmd()
        .current_dir(temp_dir.path())
        .args(["--config", "reelforge.toml", "run", "a storm", "--session-id", "cli-2"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"status\": \"failed\""))
        .stdout(predicate::str::contains("not approved"));

    // The failed run keeps its checkpoint for a later resume.
    assert!(temp_dir.path().join("checkpoints/cli-2.checkpoint.json").exists());

    // Approving the overrun lets the same session finish.
    reelforge_cmd()
        .current_dir(temp_dir.path())
        .args(["--config", "reelforge.toml", "--approval", "approve", "resume", "cli-2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"completed\""));
}

#[test]
fn test_resume_unknown_session_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    reelforge_cmd()
        .current_dir(temp_dir.path())
        .args(["--checkpoint-dir", "checkpoints", "resume", "nobody"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no checkpoint for session nobody"));
}

#[test]
fn test_config_command_applies_environment_overrides() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    reelforge_cmd()
        .current_dir(temp_dir.path())
        .env("REELFORGE__RATE_LIMIT__MAX_REQUESTS_PER_MINUTE", "30")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_requests_per_minute = 30"))
        .stdout(predicate::str::contains("max_concurrent_requests = 3"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(temp_dir.path().join("bad.toml"), "[budget]\nwarning_threshold = 1.5\n")
        .expect("Failed to write config");

    reelforge_cmd()
        .current_dir(temp_dir.path())
        .args(["--config", "bad.toml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("budget.warning_threshold"));
}

#[test]
fn test_ceiling_approval_requires_ceiling() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    reelforge_cmd()
        .current_dir(temp_dir.path())
        .args(["--checkpoint-dir", "checkpoints", "--approval", "ceiling", "run", "brief"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--ceiling"));
}
