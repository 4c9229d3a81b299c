//! Spawning, inspecting and terminating service processes.
//!
//! Services are launched through `sh -c` in their own process group so that
//! wrapper scripts (package-manager scripts, shell pipelines) can be torn down
//! together with everything they forked. Whether something is running is always
//! answered by asking the OS; the only state kept here is the table of children
//! this manager spawned, so they can be reaped instead of lingering as zombies.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt, io,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

#[cfg(target_os = "linux")]
use std::{collections::HashSet, fs};

use chrono::{DateTime, Local};
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{self, Pid},
};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

use crate::{
    constants::{DEFAULT_SPAWN_SETTLE, KILL_CONFIRM_WINDOW, PROBE_HOST, STOP_POLL_INTERVAL},
    error::ProcessError,
    health::port_accepts_connections,
    logs,
};

/// Connection timeout for the port liveness fallback.
const PORT_QUERY_TIMEOUT: Duration = Duration::from_millis(250);

/// Identifies the process(es) a stop or liveness query applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// A specific process, usually from a [`ProcessHandle`].
    Pid(u32),
    /// Whatever listens on the port.
    Port(u16),
    /// Processes whose command line contains the pattern.
    Pattern(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Pid(pid) => write!(f, "pid {pid}"),
            Selector::Port(port) => write!(f, "port {port}"),
            Selector::Pattern(pattern) => write!(f, "pattern `{pattern}`"),
        }
    }
}

/// A process launched by [`ProcessManager::start`].
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    started_at: DateTime<Local>,
}

impl ProcessHandle {
    /// Service the process belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PID of the `sh` wrapper, which is also the process group id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// When the process was spawned.
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Selector targeting exactly this process (and its group on stop).
    pub fn selector(&self) -> Selector {
        Selector::Pid(self.pid)
    }
}

/// What a successful stop did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopSummary {
    /// PIDs that received SIGTERM.
    pub signalled: Vec<u32>,
    /// Whether SIGKILL was needed.
    pub forced: bool,
}

/// Spawns and terminates service processes.
#[derive(Debug)]
pub struct ProcessManager {
    log_dir: PathBuf,
    settle_delay: Duration,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessManager {
    /// Creates a manager writing service output below `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            settle_delay: DEFAULT_SPAWN_SETTLE,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides how long a new process must survive to count as launched.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Directory holding the per-service log sinks.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Launches `command` for `name` in `working_directory`.
    ///
    /// stdout and stderr go to the service's log sink and stdin is closed. The
    /// call fails if the process exits before the settle delay passes.
    pub fn start(
        &self,
        name: &str,
        command: &str,
        working_directory: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, ProcessError> {
        if !working_directory.is_dir() {
            return Err(ProcessError::MissingWorkingDirectory {
                service: name.to_string(),
                path: working_directory.to_path_buf(),
            });
        }

        let sink_error = |source: io::Error| ProcessError::LogSink {
            service: name.to_string(),
            source,
        };
        let stdout = logs::open_sink(&self.log_dir, name, command).map_err(sink_error)?;
        let stderr = stdout.try_clone().map_err(sink_error)?;

        debug!("Launching service '{name}' with command: `{command}`");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .envs(env);

        unsafe {
            cmd.pre_exec(|| {
                // Own process group so the whole tree can be signalled without
                // touching ours, and so terminal signals to us do not reach it.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| {
            error!("Failed to spawn service '{name}': {source}");
            ProcessError::Spawn {
                service: name.to_string(),
                source,
            }
        })?;
        let pid = child.id();
        debug!("Service '{name}' spawned with PID {pid}");

        thread::sleep(self.settle_delay);

        match child.try_wait() {
            Ok(Some(status)) => {
                let log_path = logs::log_path(&self.log_dir, name);
                for line in logs::tail(&log_path, 5).unwrap_or_default() {
                    warn!("[{name}] {line}");
                }
                return Err(ProcessError::ExitedEarly {
                    service: name.to_string(),
                    status: describe_exit(status),
                });
            }
            Ok(None) => {}
            Err(source) => {
                return Err(ProcessError::Spawn {
                    service: name.to_string(),
                    source,
                });
            }
        }

        self.children.lock()?.insert(pid, child);
        info!("Service '{name}' launched (PID {pid})");

        Ok(ProcessHandle {
            name: name.to_string(),
            pid,
            started_at: Local::now(),
        })
    }

    /// Terminates whatever `selector` matches.
    ///
    /// Every match and its process group get SIGTERM; anything still matching
    /// after `grace_period` gets SIGKILL. Succeeds only when nothing matches
    /// afterwards.
    pub fn stop(
        &self,
        selector: &Selector,
        grace_period: Duration,
    ) -> Result<StopSummary, ProcessError> {
        let targets = self.matching_pids(selector);

        if targets.is_empty() {
            if self.is_active(selector) {
                return Err(ProcessError::StillRunning {
                    selector: selector.to_string(),
                    pids: Vec::new(),
                });
            }
            debug!("Nothing matches {selector}; already stopped");
            return Ok(StopSummary::default());
        }

        info!("Stopping {selector} (PIDs {targets:?})");
        self.signal_all(&targets, Signal::SIGTERM);

        let mut remaining = self.wait_for_exit(selector, &targets, grace_period);
        let mut forced = false;

        if !remaining.is_empty() {
            warn!(
                "{selector} did not exit within {grace_period:?} after SIGTERM; sending SIGKILL to {remaining:?}"
            );
            forced = true;
            self.signal_all(&remaining, Signal::SIGKILL);
            remaining = self.wait_for_exit(selector, &remaining, KILL_CONFIRM_WINDOW);
        }

        if !remaining.is_empty() || self.is_active(selector) {
            return Err(ProcessError::StillRunning {
                selector: selector.to_string(),
                pids: remaining,
            });
        }

        debug!("{selector} stopped");
        Ok(StopSummary {
            signalled: targets,
            forced,
        })
    }

    /// Point-in-time liveness query; never cached.
    pub fn is_active(&self, selector: &Selector) -> bool {
        match selector {
            Selector::Port(port) => {
                !self.matching_pids(selector).is_empty()
                    || port_accepts_connections(PROBE_HOST, *port, PORT_QUERY_TIMEOUT)
            }
            _ => !self.matching_pids(selector).is_empty(),
        }
    }

    /// Live PIDs matched by `selector`, excluding this process.
    pub fn matching_pids(&self, selector: &Selector) -> Vec<u32> {
        self.reap();
        let own = std::process::id();

        let candidates = match selector {
            // The group outlives its `sh` leader when forked children remain.
            Selector::Pid(pid) => {
                return if *pid != own && (pid_alive(*pid) || group_alive(*pid)) {
                    vec![*pid]
                } else {
                    Vec::new()
                };
            }
            Selector::Port(port) => port_owner_pids(*port),
            Selector::Pattern(pattern) => pattern_pids(pattern),
        };

        candidates
            .into_iter()
            .filter(|&pid| pid != own && pid_alive(pid))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Collects exit statuses of spawned children so they do not linger as zombies.
    fn reap(&self) {
        let Ok(mut children) = self.children.lock() else {
            return;
        };
        children.retain(|pid, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Reaped PID {pid} ({})", describe_exit(status));
                false
            }
            Ok(None) => true,
            Err(err) => {
                debug!("Failed to poll PID {pid}: {err}");
                false
            }
        });
    }

    /// Signals every pid in `pids`, logging failures instead of stopping at the first.
    ///
    /// Returns the PIDs that could not be signalled.
    fn signal_all(&self, pids: &[u32], signal: Signal) -> Vec<u32> {
        pids.iter()
            .copied()
            .filter(|&pid| match self.signal_tree(pid, signal) {
                Ok(()) => false,
                Err(err) => {
                    warn!("Failed to send {signal} to PID {pid}: {err}");
                    true
                }
            })
            .collect()
    }

    /// Sends `signal` to the process group of `pid` (when it is not ours) and to `pid`.
    ///
    /// A group whose leader already exited is still signalled by its id.
    fn signal_tree(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        let target = Pid::from_raw(pid as i32);
        let own_group = unistd::getpgrp();

        let group = match unistd::getpgid(Some(target)) {
            Ok(group) => Some(group),
            Err(_) if group_alive(pid) => Some(target),
            Err(_) => None,
        };

        match group {
            Some(group) if group != own_group && group.as_raw() > 1 => {
                match signal::killpg(group, signal) {
                    Ok(()) => debug!("Sent {signal} to process group {group}"),
                    Err(Errno::ESRCH) => {}
                    Err(Errno::EPERM) => warn!(
                        "Insufficient permissions to signal process group {group}; falling back to direct signal"
                    ),
                    Err(source) => return Err(ProcessError::Signal { pid, source }),
                }
            }
            Some(_) => debug!("PID {pid} shares our process group; signalling it directly"),
            None => {}
        }

        match signal::kill(target, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(ProcessError::Signal { pid, source }),
        }
    }

    /// Polls until neither `pids` nor any new selector match is alive, or `window` passes.
    fn wait_for_exit(&self, selector: &Selector, pids: &[u32], window: Duration) -> Vec<u32> {
        let deadline = Instant::now() + window;
        loop {
            self.reap();
            let mut alive: BTreeSet<u32> =
                pids.iter().copied().filter(|&pid| pid_alive(pid)).collect();
            alive.extend(self.matching_pids(selector));

            if alive.is_empty() || Instant::now() >= deadline {
                return alive.into_iter().collect();
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        _ => format!("{status}"),
    }
}

/// Whether `pid` exists and is not a zombie.
fn pid_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::ESRCH) => false,
        // EPERM: the process exists but belongs to someone else.
        Err(_) => true,
    }
}

/// Whether a process group with id `pgid` other than ours still has members.
fn group_alive(pgid: u32) -> bool {
    let group = Pid::from_raw(pgid as i32);
    if pgid <= 1 || group == unistd::getpgrp() {
        return false;
    }
    match signal::killpg(group, None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    matches!(read_proc_state(pid), Some('Z') | Some('X'))
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(pid: u32) -> bool {
    let mut system = System::new();
    let pid = sysinfo::Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| process.status() == ProcessStatus::Zombie)
}

#[cfg(target_os = "linux")]
fn read_proc_state(pid: u32) -> Option<char> {
    let contents = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name is wrapped in parentheses and may itself contain spaces.
    let (_, rest) = contents.rsplit_once(')')?;
    rest.split_whitespace().next()?.chars().next()
}

/// PIDs of non-zombie processes whose command line contains `pattern`.
fn pattern_pids(pattern: &str) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::everything(),
    );

    system
        .processes()
        .iter()
        .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
        .filter(|(_, process)| {
            let command_line = process
                .cmd()
                .iter()
                .map(|part| part.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            command_line.contains(pattern)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// PIDs owning a socket that listens on `port`.
#[cfg(target_os = "linux")]
fn port_owner_pids(port: u16) -> Vec<u32> {
    let inodes: HashSet<u64> = ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|table| fs::read_to_string(table).ok())
        .flat_map(|table| parse_listen_inodes(&table, port))
        .collect();
    if inodes.is_empty() {
        return Vec::new();
    }

    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut owners = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        // Unreadable fd tables (other users' processes) are skipped.
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let owns_socket = fds.flatten().any(|fd| {
            fs::read_link(fd.path())
                .ok()
                .and_then(|target| parse_socket_inode(&target.to_string_lossy()))
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if owns_socket {
            owners.push(pid);
        }
    }
    owners
}

/// PIDs owning a socket that listens on `port`.
#[cfg(not(target_os = "linux"))]
fn port_owner_pids(port: u16) -> Vec<u32> {
    match Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
    {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
        Err(err) => {
            debug!("lsof unavailable while inspecting port {port}: {err}");
            Vec::new()
        }
    }
}

/// Inodes of sockets in a `/proc/net/tcp` style table that listen on `port`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_listen_inodes(table: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            if local_port == port && *state == TCP_LISTEN {
                inode.parse().ok()
            } else {
                None
            }
        })
        .collect()
}

/// Extracts the inode from a `socket:[12345]` fd link target.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}
