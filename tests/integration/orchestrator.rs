#[path = "common/mod.rs"]
mod common;

use std::path::Path;

use common::{Reaper, unique_sleep};
use devstack::{
    cancel::CancelToken,
    config::Context,
    error::{OrchestratorError, ProcessError},
    logs,
    orchestrator::{CompositeHealth, LocalControllers, Orchestrator},
    process::Selector,
};
use tempfile::tempdir;

const FAST_SETTINGS: &str = r#"
settings:
  spawn_settle: 200ms
  poll_interval: 100ms
  retry_attempts: 1
  retry_initial_delay: 50ms
  dependency_wait: 2s
  stop_grace: 1s
  restart_pause: 100ms
"#;

struct Stack {
    db: String,
    api: String,
    ui: String,
    _reaper: Reaper,
}

fn stack() -> Stack {
    let db = unique_sleep();
    let api = unique_sleep();
    let ui = unique_sleep();
    let mut reaper = Reaper::pattern(&db);
    reaper.watch(Selector::Pattern(api.clone()));
    reaper.watch(Selector::Pattern(ui.clone()));
    Stack {
        db,
        api,
        ui,
        _reaper: reaper,
    }
}

fn context(dir: &Path, stack: &Stack, api_command: &str) -> Context {
    let yaml = format!(
        r#"
log_dir: logs
{settings}
services:
  - name: db
    command: "{db}"
    working_directory: .
    start_timeout_seconds: 2
  - name: api
    command: "{api_command}"
    stop_pattern: "{api}"
    working_directory: .
    start_timeout_seconds: 2
    dependencies: [db]
  - name: ui
    command: "{ui}"
    working_directory: .
    start_timeout_seconds: 2
    dependencies: [api]
composites:
  - name: web
    members: [db, api, ui]
"#,
        settings = FAST_SETTINGS,
        db = stack.db,
        api = stack.api,
        ui = stack.ui,
    );
    Context::from_yaml_str(&yaml, dir).unwrap()
}

#[test]
fn web_environment_starts_reports_and_stops() {
    let temp = tempdir().unwrap();
    let stack = stack();
    let context = context(temp.path(), &stack, &stack.api);
    let cancel = CancelToken::new();
    let orchestrator = Orchestrator::new(
        &context,
        LocalControllers::new(&context, cancel.clone()),
        cancel,
    );

    let report = orchestrator.start("web").unwrap();
    assert_eq!(report.order, vec!["db", "api", "ui"]);
    assert_eq!(report.started, vec!["db", "api", "ui"]);

    let status = orchestrator.status("web").unwrap();
    assert_eq!(status.summary, CompositeHealth::AllHealthy);
    assert!(status.members.iter().all(|member| member.pid.is_some()));

    let again = orchestrator.start("web").unwrap();
    assert!(again.started.is_empty());
    assert_eq!(again.already_running, vec!["db", "api", "ui"]);

    let stopped = orchestrator.stop("web").unwrap();
    assert_eq!(stopped.stopped, vec!["ui", "api", "db"]);
    assert!(stopped.warnings.is_empty());

    let status = orchestrator.status("web").unwrap();
    assert_eq!(status.summary, CompositeHealth::NoneRunning);
}

#[test]
fn partial_environment_is_reported_as_partial() {
    let temp = tempdir().unwrap();
    let stack = stack();
    let context = context(temp.path(), &stack, &stack.api);
    let cancel = CancelToken::new();
    let orchestrator = Orchestrator::new(
        &context,
        LocalControllers::new(&context, cancel.clone()),
        cancel,
    );

    // Starting a single service brings up only its dependency chain.
    let report = orchestrator.start("api").unwrap();
    assert_eq!(report.order, vec!["db", "api"]);

    let status = orchestrator.status("web").unwrap();
    assert_eq!(
        status.summary,
        CompositeHealth::Partial {
            healthy: 2,
            total: 3
        }
    );
    assert_eq!(status.summary.exit_code(), 2);

    orchestrator.stop("web").unwrap();
}

#[test]
fn failing_service_rolls_back_what_the_run_started() {
    let temp = tempdir().unwrap();
    let stack = stack();
    let context = context(temp.path(), &stack, "echo api crashed; exit 1");
    let cancel = CancelToken::new();
    let factory = LocalControllers::new(&context, cancel.clone());
    let processes = std::sync::Arc::clone(factory.processes());
    let orchestrator = Orchestrator::new(&context, factory, cancel);

    let err = orchestrator.start("web").unwrap_err();

    let OrchestratorError::RolledBack { cause, rollback } = err else {
        panic!("expected a rolled back run");
    };
    assert!(matches!(
        *cause,
        OrchestratorError::ProcessStart(ProcessError::ExitedEarly { ref service, .. })
            if service == "api"
    ));
    assert_eq!(rollback.stopped, vec!["db"]);
    assert!(rollback.is_clean());

    assert!(!processes.is_active(&Selector::Pattern(stack.db.clone())));
    // ui never got as far as opening its log sink.
    assert!(!logs::log_path(context.log_dir(), "ui").exists());
    assert!(logs::log_path(context.log_dir(), "api").exists());
}

#[test]
fn restart_replaces_running_processes() {
    let temp = tempdir().unwrap();
    let stack = stack();
    let context = context(temp.path(), &stack, &stack.api);
    let cancel = CancelToken::new();
    let factory = LocalControllers::new(&context, cancel.clone());
    let processes = std::sync::Arc::clone(factory.processes());
    let orchestrator = Orchestrator::new(&context, factory, cancel);

    orchestrator.start("db").unwrap();
    let before = processes.matching_pids(&Selector::Pattern(stack.db.clone()));
    assert!(!before.is_empty());

    let report = orchestrator.restart("db").unwrap();
    assert_eq!(report.stop.stopped, vec!["db"]);
    assert_eq!(report.start.started, vec!["db"]);

    let after = processes.matching_pids(&Selector::Pattern(stack.db.clone()));
    assert!(!after.is_empty());
    assert!(before.iter().all(|pid| !after.contains(pid)));

    orchestrator.stop("db").unwrap();
}
