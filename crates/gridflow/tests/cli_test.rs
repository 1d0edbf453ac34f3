#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;

mod common;
use common::TestProject;

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("grid").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("OpenStack"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("scale-up"))
        .stdout(predicate::str::contains("scale-down"))
        .stdout(predicate::str::contains("terminate"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("grid").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("grid"));
}

#[test]
fn test_terminate_help() {
    let mut cmd = Command::cargo_bin("grid").unwrap();
    cmd.args(["terminate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--force"));
}

#[test]
fn test_scale_down_requires_workers() {
    let project = TestProject::new();
    project
        .grid()
        .arg("scale-down")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<WORKERS>"));
}

#[test]
fn test_scale_up_rejects_bad_count() {
    let project = TestProject::new();
    project
        .grid()
        .args(["scale-up", "compute", "many"])
        .assert()
        .failure();
}

#[test]
fn test_list_without_clusters() {
    let project = TestProject::new();
    project
        .grid()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No clusters recorded."));

    project
        .grid()
        .args(["list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn test_status_without_clusters() {
    let project = TestProject::new();
    project
        .grid()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no cluster id given"));
}

#[test]
fn test_check_with_missing_config() {
    let project = TestProject::new();
    project
        .grid()
        .args(["check", "-i", "missing.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.yml"))
        .stderr(predicate::str::contains("check failed after"));
}

#[test]
fn test_create_without_config() {
    let project = TestProject::new();
    project
        .grid()
        .arg("create")
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration file not found"));
}

#[tokio::test]
async fn test_status_and_list_of_recorded_cluster() {
    let project = TestProject::new();
    project.record_cluster("abc123").await;

    project
        .grid()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("abc123"))
        .stdout(predicate::str::contains("grid-abc123"));

    project
        .grid()
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cluster_id\": \"abc123\""));

    project
        .grid()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("abc123"));
}

#[tokio::test]
async fn test_terminate_cluster_without_resources() {
    let project = TestProject::new();
    project.record_cluster("abc123").await;

    project
        .grid()
        .args(["terminate", "-c", "abc123"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cluster abc123 terminated"))
        .stderr(predicate::str::contains("terminate finished in"));

    project
        .grid()
        .args(["status", "-c", "abc123"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_debug_prints_error_chain() {
    let project = TestProject::new();
    project
        .grid()
        .args(["check", "-i", "missing.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Caused by:").not());

    project
        .grid()
        .args(["check", "-i", "missing.yml", "--debug"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"))
        .stderr(predicate::str::contains("Caused by:"));
}

#[tokio::test]
async fn test_cloud_commands_log_to_state_dir() {
    let project = TestProject::new();
    project.record_cluster("abc123").await;

    project
        .grid()
        .args(["terminate", "-c", "abc123"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Terminating cluster").not());

    let log = std::fs::read_to_string(project.state_dir().join("gridflow.log")).unwrap();
    assert!(log.contains("Terminating cluster"));
    assert!(log.contains("abc123"));
}

#[test]
fn test_read_only_commands_create_no_state_dir() {
    let project = TestProject::new();
    project.grid().arg("list").assert().success();
    assert!(!project.state_dir().exists());
}
