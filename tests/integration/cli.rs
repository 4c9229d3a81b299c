#[path = "common/mod.rs"]
mod common;

use std::path::Path;

use assert_cmd::Command;
use common::{Reaper, unique_sleep, write_config};
use devstack::process::Selector;
use predicates::prelude::*;
use tempfile::tempdir;

fn devstack(config: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("devstack"));
    cmd.arg("--config")
        .arg(config)
        .env_remove("DEVSTACK_BASE_DIR")
        .env_remove("DEVSTACK_LOG_DIR");
    cmd
}

fn stack_config(dir: &Path, db: &str, api: &str) -> std::path::PathBuf {
    write_config(
        dir,
        &format!(
            r#"
version: "1"
log_dir: logs
settings:
  spawn_settle: 200ms
  poll_interval: 100ms
  retry_attempts: 1
  retry_initial_delay: 50ms
  stop_grace: 1s
  restart_pause: 100ms
services:
  - name: db
    display_name: Database
    command: "{db}"
    working_directory: .
  - name: api
    command: "{api}"
    working_directory: .
    dependencies: [db]
composites:
  - name: web
    members: [db, api]
"#
        ),
    )
}

#[test]
fn list_shows_services_and_composites() {
    let temp = tempdir().unwrap();
    let config = stack_config(temp.path(), &unique_sleep(), &unique_sleep());

    devstack(&config)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Services:"))
        .stdout(predicate::str::contains("needs db"))
        .stdout(predicate::str::contains("Composites:"))
        .stdout(predicate::str::contains("db, api"));
}

#[test]
fn status_of_stopped_environment_exits_one() {
    let temp = tempdir().unwrap();
    let config = stack_config(temp.path(), &unique_sleep(), &unique_sleep());

    devstack(&config)
        .args(["status", "web", "--no-color"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("web: none running"))
        .stdout(predicate::str::contains("Database"));
}

#[test]
fn status_json_is_machine_readable() {
    let temp = tempdir().unwrap();
    let config = stack_config(temp.path(), &unique_sleep(), &unique_sleep());

    let output = devstack(&config)
        .args(["status", "web", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["target"], "web");
    assert_eq!(value["summary"]["state"], "none_running");
    assert_eq!(value["members"][0]["status"], "not_running");
}

#[test]
fn unknown_target_fails() {
    let temp = tempdir().unwrap();
    let config = stack_config(temp.path(), &unique_sleep(), &unique_sleep());

    devstack(&config)
        .args(["start", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown service or composite 'nope'"));
}

#[test]
fn missing_config_fails() {
    let temp = tempdir().unwrap();

    devstack(&temp.path().join("absent.yaml"))
        .args(["stop", "web"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn dependency_cycle_fails_start() {
    let temp = tempdir().unwrap();
    let config = write_config(
        temp.path(),
        r#"
services:
  - name: a
    command: "true"
    working_directory: .
    dependencies: [b]
  - name: b
    command: "true"
    working_directory: .
    dependencies: [a]
composites:
  - name: loop
    members: [a, b]
"#,
    );

    devstack(&config)
        .args(["start", "loop"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Detected dependency cycle among: a, b"));
}

#[test]
fn start_status_stop_round_trip() {
    let temp = tempdir().unwrap();
    let db = unique_sleep();
    let api = unique_sleep();
    let mut reaper = Reaper::pattern(&db);
    reaper.watch(Selector::Pattern(api.clone()));
    let config = stack_config(temp.path(), &db, &api);

    devstack(&config)
        .args(["start", "db"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Started db: db"));

    // Only db runs, so the environment is partially up.
    devstack(&config)
        .args(["status", "web", "--no-color"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("partial (1/2 healthy)"));

    devstack(&config)
        .args(["start", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Already running: db"));

    devstack(&config)
        .args(["status", "web"])
        .assert()
        .code(0);

    devstack(&config)
        .args(["logs", "api", "-n", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("starting"));

    devstack(&config)
        .args(["stop", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped web: api, db"));

    devstack(&config)
        .args(["status", "web"])
        .assert()
        .code(1);
}
