#[path = "common/mod.rs"]
mod common;

use std::{
    collections::BTreeMap,
    fs,
    net::TcpListener,
    time::{Duration, Instant},
};

use common::{Reaper, free_port, http_server_command, python_available, unique_sleep, wait_until};
use devstack::{
    error::ProcessError,
    logs,
    process::{ProcessManager, Selector},
};
use tempfile::tempdir;

fn manager(log_dir: &std::path::Path) -> ProcessManager {
    ProcessManager::new(log_dir).with_settle_delay(Duration::from_millis(200))
}

#[test]
fn started_process_is_stopped_by_pid() {
    let temp = tempdir().unwrap();
    let command = unique_sleep();
    let _reaper = Reaper::pattern(&command);
    let processes = manager(&temp.path().join("logs"));

    let handle = processes
        .start("sleeper", &command, temp.path(), &BTreeMap::new())
        .unwrap();

    assert_eq!(handle.name(), "sleeper");
    assert!(processes.is_active(&handle.selector()));
    assert!(processes.is_active(&Selector::Pattern(command.clone())));

    let summary = processes
        .stop(&handle.selector(), Duration::from_secs(2))
        .unwrap();
    assert_eq!(summary.signalled, vec![handle.pid()]);
    assert!(!summary.forced);
    assert!(!processes.is_active(&handle.selector()));
    assert!(!processes.is_active(&Selector::Pattern(command)));
}

#[test]
fn pattern_stop_finds_processes_started_elsewhere() {
    let temp = tempdir().unwrap();
    let command = unique_sleep();
    let _reaper = Reaper::pattern(&command);

    // Spawned by one manager, stopped by another that knows nothing about it.
    let spawner = manager(temp.path());
    spawner
        .start("sleeper", &command, temp.path(), &BTreeMap::new())
        .unwrap();

    let stopper = ProcessManager::new(temp.path());
    let selector = Selector::Pattern(command.clone());
    assert!(!stopper.matching_pids(&selector).is_empty());

    stopper.stop(&selector, Duration::from_secs(2)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !spawner.is_active(&selector)));
}

#[test]
fn pid_stop_reaches_children_left_behind_by_the_wrapper() {
    let temp = tempdir().unwrap();
    let command = unique_sleep();
    let _reaper = Reaper::pattern(&command);
    let processes = manager(temp.path());

    let handle = processes
        .start(
            "forker",
            &format!("{command} & sleep 1; exit 0"),
            temp.path(),
            &BTreeMap::new(),
        )
        .unwrap();

    // The `sh` leader exits, its background child stays in the group.
    std::thread::sleep(Duration::from_millis(1500));
    let child = Selector::Pattern(command.clone());
    assert!(processes.is_active(&child));
    assert!(processes.is_active(&handle.selector()));

    let summary = processes
        .stop(&handle.selector(), Duration::from_millis(300))
        .unwrap();
    assert_eq!(summary.signalled, vec![handle.pid()]);
    assert!(wait_until(Duration::from_secs(2), || !processes.is_active(&child)));
    assert!(!processes.is_active(&handle.selector()));
}

#[test]
fn port_listener_ignoring_sigterm_is_killed_by_port() {
    if !python_available() {
        eprintln!("Skipping port_listener_ignoring_sigterm_is_killed_by_port: python3 not available");
        return;
    }

    let temp = tempdir().unwrap();
    let port = free_port();
    let command = format!(
        "python3 -c \"import signal, socket, time; \
         signal.signal(signal.SIGTERM, signal.SIG_IGN); \
         s = socket.socket(); \
         s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1); \
         s.bind(('127.0.0.1', {port})); s.listen(); time.sleep(60)\""
    );
    let mut reaper = Reaper::pattern(format!("s.bind(('127.0.0.1', {port}))"));
    reaper.watch(Selector::Port(port));
    let processes = manager(temp.path());

    processes
        .start("deaf", &command, temp.path(), &BTreeMap::new())
        .unwrap();
    let selector = Selector::Port(port);
    assert!(wait_until(Duration::from_secs(5), || processes.is_active(&selector)));

    let summary = processes
        .stop(&selector, Duration::from_millis(500))
        .unwrap();
    assert!(summary.forced);
    assert!(!summary.signalled.is_empty());
    assert!(!processes.is_active(&selector));
}

#[test]
fn process_ignoring_sigterm_is_killed_after_grace_period() {
    let temp = tempdir().unwrap();
    let command = unique_sleep();
    let _reaper = Reaper::pattern(&command);
    let processes = manager(temp.path());

    processes
        .start(
            "stubborn",
            &format!("trap '' TERM; {command}"),
            temp.path(),
            &BTreeMap::new(),
        )
        .unwrap();

    let selector = Selector::Pattern(command);
    let grace = Duration::from_millis(400);
    let started = Instant::now();
    let summary = processes.stop(&selector, grace).unwrap();

    assert!(summary.forced, "SIGKILL escalation expected");
    assert!(started.elapsed() >= grace);
    assert!(!processes.is_active(&selector));
}

#[test]
fn output_is_appended_to_the_log_sink() {
    let temp = tempdir().unwrap();
    let log_dir = temp.path().join("logs");
    let command = unique_sleep();
    let _reaper = Reaper::pattern(&command);
    let processes = manager(&log_dir);

    let mut env = BTreeMap::new();
    env.insert("DEVSTACK_GREETING".to_string(), "hello-from-env".to_string());

    let handle = processes
        .start(
            "chatty",
            &format!("echo $DEVSTACK_GREETING; echo oops >&2; {command}"),
            temp.path(),
            &env,
        )
        .unwrap();

    let path = logs::log_path(&log_dir, "chatty");
    assert!(wait_until(Duration::from_secs(2), || {
        fs::read_to_string(&path)
            .map(|content| content.contains("hello-from-env") && content.contains("oops"))
            .unwrap_or(false)
    }));
    let content = fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("==> "));

    processes
        .stop(&handle.selector(), Duration::from_secs(2))
        .unwrap();
}

#[test]
fn process_exiting_during_settle_window_is_an_error() {
    let temp = tempdir().unwrap();
    let processes = manager(temp.path());

    let err = processes
        .start("crashy", "echo boom; exit 3", temp.path(), &BTreeMap::new())
        .unwrap_err();

    match err {
        ProcessError::ExitedEarly { service, status } => {
            assert_eq!(service, "crashy");
            assert_eq!(status, "exit code 3");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let content = fs::read_to_string(logs::log_path(temp.path(), "crashy")).unwrap();
    assert!(content.contains("boom"));
}

#[test]
fn missing_working_directory_is_reported() {
    let temp = tempdir().unwrap();
    let processes = manager(temp.path());
    let missing = temp.path().join("nope");

    let err = processes
        .start("lost", "true", &missing, &BTreeMap::new())
        .unwrap_err();

    assert!(matches!(
        err,
        ProcessError::MissingWorkingDirectory { ref path, .. } if *path == missing
    ));
}

#[test]
fn stopping_nothing_succeeds() {
    let temp = tempdir().unwrap();
    let processes = manager(temp.path());
    let selector = Selector::Pattern(unique_sleep());

    let summary = processes.stop(&selector, Duration::from_millis(200)).unwrap();
    assert!(summary.signalled.is_empty());
    assert!(!processes.is_active(&selector));
    assert!(!processes.is_active(&Selector::Port(free_port())));
}

#[test]
fn port_held_by_an_unmatchable_process_is_still_running() {
    let temp = tempdir().unwrap();
    let processes = manager(temp.path());

    // Our own process is never a stop target, but the port is still taken.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let selector = Selector::Port(listener.local_addr().unwrap().port());

    assert!(processes.is_active(&selector));
    assert!(processes.matching_pids(&selector).is_empty());
    assert!(matches!(
        processes.stop(&selector, Duration::from_millis(100)),
        Err(ProcessError::StillRunning { ref pids, .. }) if pids.is_empty()
    ));
}

#[test]
fn port_selector_stops_the_listening_process() {
    if !python_available() {
        eprintln!("Skipping port_selector_stops_the_listening_process: python3 not available");
        return;
    }

    let temp = tempdir().unwrap();
    let port = free_port();
    let mut reaper = Reaper::pattern(http_server_command(port));
    reaper.watch(Selector::Port(port));
    let processes = manager(temp.path());

    processes
        .start("web", &http_server_command(port), temp.path(), &BTreeMap::new())
        .unwrap();

    let selector = Selector::Port(port);
    assert!(wait_until(Duration::from_secs(5), || processes.is_active(&selector)));

    processes.stop(&selector, Duration::from_secs(2)).unwrap();
    assert!(!processes.is_active(&selector));
}
