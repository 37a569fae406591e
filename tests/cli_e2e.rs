//! End-to-end CLI tests for the storydredge binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Command isolated from the user's config and working directory.
fn storydredge(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("storydredge").unwrap();
    cmd.current_dir(dir)
        .env("XDG_CONFIG_HOME", dir.join("xdg"))
        .env_remove("RUST_LOG");
    cmd
}

async fn mock_backends() -> MockServer {
    let body = "The new bridge over the river opened to traffic this morning. ".repeat(3);
    let page = format!("BRIDGE OPENS TO TRAFFIC\n{body}\n");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/download/gazette_1901-03-04/gazette_1901-03-04_djvu.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/download/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": r#"{"category": "local", "confidence": 0.7}"#
        })))
        .mount(&server)
        .await;
    server
}

fn batch_args<'a>(cmd: &'a mut Command, server: &MockServer) -> &'a mut Command {
    cmd.args([
        "--archive-url",
        &server.uri(),
        "--model-url",
        &server.uri(),
        "--rate-limit",
        "0",
        "--max-retries",
        "0",
        "-q",
    ])
}

/// Test that the binary with no issues exits with code 0.
#[test]
fn test_binary_without_issues_returns_zero() {
    let dir = TempDir::new().unwrap();
    storydredge(dir.path()).assert().success();
    assert!(!dir.path().join("output").exists());
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let dir = TempDir::new().unwrap();
    storydredge(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: storydredge"))
        .stdout(predicate::str::contains("--checkpoint-file"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let dir = TempDir::new().unwrap();
    storydredge(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("storydredge"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    let dir = TempDir::new().unwrap();
    storydredge(dir.path())
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_zero_workers_rejected() {
    let dir = TempDir::new().unwrap();
    storydredge(dir.path()).args(["-w", "0"]).assert().failure();
}

#[test]
fn test_binary_missing_config_file_is_fatal() {
    let dir = TempDir::new().unwrap();
    storydredge(dir.path())
        .args(["--config", "does-not-exist.toml"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_binary_unknown_config_key_is_fatal() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("bad.toml"), "wokers = 4\n").unwrap();
    storydredge(dir.path())
        .args(["--config", "bad.toml"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_binary_processes_issue_and_writes_report() {
    let server = mock_backends().await;
    let dir = TempDir::new().unwrap();

    let mut cmd = storydredge(dir.path());
    batch_args(&mut cmd, &server)
        .arg("gazette_1901-03-04")
        .assert()
        .success();

    let raw = std::fs::read_to_string(dir.path().join("output/processing_report.json")).unwrap();
    let report: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(report["successful"], 1);
    assert!(dir.path().join("checkpoint.json").exists());
    assert!(dir.path().join("output/hsa-ready/1901/03/04").is_dir());

    // Rerun resumes from the checkpoint and skips the finished issue.
    let mut cmd = storydredge(dir.path());
    batch_args(&mut cmd, &server)
        .arg("gazette_1901-03-04")
        .assert()
        .success();
    let raw = std::fs::read_to_string(dir.path().join("output/processing_report.json")).unwrap();
    let report: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(report["skipped"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_binary_partial_failure_exit_code() {
    let server = mock_backends().await;
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("issues.txt"),
        "gazette_1901-03-04\n# missing from the archive\ngazette_1901-03-05\n",
    )
    .unwrap();

    let mut cmd = storydredge(dir.path());
    batch_args(&mut cmd, &server)
        .args(["--issues-file", "issues.txt", "--workers", "2"])
        .assert()
        .code(1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_binary_all_failed_exit_code() {
    let server = mock_backends().await;
    let dir = TempDir::new().unwrap();

    let mut cmd = storydredge(dir.path());
    batch_args(&mut cmd, &server)
        .arg("gazette_1901-03-05")
        .assert()
        .code(2);
}
