//! CLI integration tests for tollway
//!
//! Tests the tollway CLI commands end-to-end using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command isolated from the user's configuration
#[allow(deprecated)]
fn tollway_cmd(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tollway").unwrap();
    cmd.env("TOLLWAY_CONFIG_DIR", config_dir.path());
    cmd.env("RUST_LOG", "off");
    cmd
}

const PROVIDERS: &str = r#"
[[routes]]
id = "fast"
provider = "alpha"
lane = "balanced"
cost_per_million = 4.0
latency_p95_ms = 400.0
capacity_score = 500.0

[[routes]]
id = "cheap"
provider = "beta"
lane = "balanced"
cost_per_million = 1.0
latency_p95_ms = 1500.0
capacity_score = 500.0
"#;

#[test]
fn test_simulate_prints_fingerprint() {
    let dir = TempDir::new().unwrap();

    tollway_cmd(&dir)
        .args(["simulate", "--lane", "balanced", "--strategy", "cost_optimized"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fingerprint:"))
        .stdout(predicate::str::contains("balanced-claude-haiku"));
}

#[test]
fn test_simulate_is_reproducible_and_writes_fixture() {
    let dir = TempDir::new().unwrap();
    let providers = dir.path().join("providers.toml");
    std::fs::write(&providers, PROVIDERS).unwrap();
    let fixture = dir.path().join("fixture.json");

    let run = |output: &std::path::Path| {
        let assert = tollway_cmd(&dir)
            .args(["simulate", "--lane", "balanced", "--strategy", "latency_optimized"])
            .args(["--failover", "cheap", "--volume", "20"])
            .arg("--providers")
            .arg(&providers)
            .arg("--output")
            .arg(output)
            .assert()
            .success();
        String::from_utf8(assert.get_output().stdout.clone()).unwrap()
    };

    let first = run(&fixture);
    let second = run(&dir.path().join("fixture-2.json"));
    assert_eq!(first, second);

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&fixture).unwrap()).unwrap();
    assert_eq!(json["routes"][0]["route_id"], "fast");
    assert_eq!(json["failover"], "cheap");
}

#[test]
fn test_simulate_rejects_unknown_strategy() {
    let dir = TempDir::new().unwrap();

    tollway_cmd(&dir)
        .args(["simulate", "--lane", "economy", "--strategy", "round_robin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("round_robin"));
}

#[test]
fn test_admit_within_budget() {
    let dir = TempDir::new().unwrap();

    tollway_cmd(&dir)
        .args(["--format", "json", "admit", "--tier", "economy", "--cost", "1.5"])
        .args(["--session", "cli-test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tier\": \"economy\""))
        .stdout(predicate::str::contains("\"session_id\": \"cli-test\""));
}

#[test]
fn test_admit_over_budget_fails_with_code() {
    let dir = TempDir::new().unwrap();

    tollway_cmd(&dir)
        .args(["admit", "--tier", "economy", "--cost", "500"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E300"));
}

#[test]
fn test_admit_writes_event_log() {
    let dir = TempDir::new().unwrap();
    let events = dir.path().join("logs").join("events.jsonl");

    tollway_cmd(&dir)
        .args(["admit", "--tier", "economy", "--cost", "4.5", "--events"])
        .arg(&events)
        .assert()
        .success();

    tollway_cmd(&dir)
        .args(["admit", "--tier", "economy", "--cost", "500", "--events"])
        .arg(&events)
        .assert()
        .failure()
        .stderr(predicate::str::contains("E300"));

    let names: Vec<String> = std::fs::read_to_string(&events)
        .unwrap()
        .lines()
        .map(|line| {
            let event: serde_json::Value = serde_json::from_str(line).unwrap();
            event["name"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(names, vec!["finops.admitted", "finops.alert", "finops.rejected"]);
}

#[test]
fn test_budget_snapshot_json() {
    let dir = TempDir::new().unwrap();

    let assert = tollway_cmd(&dir)
        .args(["--format", "json", "budget", "snapshot"])
        .assert()
        .success();
    let snapshot: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(snapshot["cache_size"], 0);
    assert_eq!(snapshot["tiers"].as_array().unwrap().len(), 3);
}

#[test]
fn test_config_set_get_and_reset() {
    let dir = TempDir::new().unwrap();

    tollway_cmd(&dir)
        .args(["config", "set", "finops.budgets.economy.amount", "42"])
        .assert()
        .success();

    tollway_cmd(&dir)
        .args(["config", "get", "finops.budgets.economy.amount"])
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));

    assert!(dir.path().join("config.toml").exists());

    tollway_cmd(&dir).args(["config", "reset"]).assert().success();
    assert!(!dir.path().join("config.toml").exists());
}

#[test]
fn test_config_rejects_unknown_key() {
    let dir = TempDir::new().unwrap();

    tollway_cmd(&dir)
        .args(["config", "get", "routing.nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_config_path_uses_override_dir() {
    let dir = TempDir::new().unwrap();

    tollway_cmd(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}
