//! Integration tests for the CLI interface

mod common;

use assert_cmd::Command;
use common::write_strategy;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

const STRATEGY: &str = r#"
name: cli_strategy
parameters:
  source: uniprot
steps:
  - name: describe
    action:
      type: echo
      params:
        source: "${parameters.source}"
        limit: "${parameters.limit:-5}"
"#;

fn mapflow() -> Command {
    let mut cmd = Command::cargo_bin("mapflow").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help_flag() {
    mapflow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_invalid_command() {
    mapflow()
        .arg("invalid-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_validate_accepts_valid_strategy() {
    let dir = TempDir::new().unwrap();
    let path = write_strategy(dir.path(), "strategy.yaml", STRATEGY);
    mapflow()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Strategy 'cli_strategy' v1.0 is valid"));
}

#[test]
fn test_validate_rejects_duplicate_steps() {
    let dir = TempDir::new().unwrap();
    let path = write_strategy(
        dir.path(),
        "broken.yaml",
        "name: dup\nsteps:\n  - {name: a, action: {type: noop}}\n  - {name: a, action: {type: noop}}\n",
    );
    mapflow()
        .arg("validate")
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("validation failed"));
}

#[test]
fn test_run_prints_context_with_params() {
    let dir = TempDir::new().unwrap();
    let path = write_strategy(dir.path(), "strategy.yaml", STRATEGY);
    let output = mapflow()
        .arg("run")
        .arg(&path)
        .args(["--param", "source=hmdb", "--param", "limit=20"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let context: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(context["steps"]["describe"]["output"]["source"], "hmdb");
    assert_eq!(context["steps"]["describe"]["output"]["limit"], 20);
    assert_eq!(context["execution"]["executed_steps"][0], "describe");
}

#[test]
fn test_run_dry_run() {
    let dir = TempDir::new().unwrap();
    let path = write_strategy(dir.path(), "strategy.yaml", STRATEGY);
    let output = mapflow()
        .arg("run")
        .arg(&path)
        .arg("--dry-run")
        .output()
        .unwrap();
    assert!(output.status.success());

    let context: Value = serde_json::from_slice(&output.stdout).unwrap();
    let result = &context["steps"]["describe"]["output"];
    assert_eq!(result["dry_run"], true);
    assert_eq!(result["params"]["limit"], 5);
    assert_eq!(context["execution"]["dry_run"], true);
}

#[test]
fn test_run_failure_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let path = write_strategy(
        dir.path(),
        "failing.yaml",
        "name: failing\nsteps:\n  - {name: missing, action: {type: not_registered}}\n",
    );
    mapflow()
        .arg("run")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not_registered"));
}

#[test]
fn test_run_writes_checkpoints_to_override_dir() {
    let dir = TempDir::new().unwrap();
    let checkpoints = dir.path().join("ckpt");
    let path = write_strategy(
        dir.path(),
        "checkpointed.yaml",
        "name: ck\ncheckpointing: {enabled: true, directory: unused}\nsteps:\n  - {name: a, action: {type: noop}, checkpoint: both}\n",
    );
    mapflow()
        .arg("run")
        .arg(&path)
        .arg("--checkpoint-dir")
        .arg(&checkpoints)
        .assert()
        .success();

    let written = std::fs::read_dir(&checkpoints).unwrap().count();
    assert_eq!(written, 2);
    assert!(!dir.path().join("unused").exists());
}

#[test]
fn test_missing_file_is_reported() {
    mapflow()
        .arg("validate")
        .arg("/nonexistent/strategy.yaml")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error:"));
}
