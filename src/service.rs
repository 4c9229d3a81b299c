//! Lifecycle control of a single configured service.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::{
    cancel::CancelToken,
    config::{ServiceDefinition, Settings},
    constants::{PROBE_HOST, PROBE_TIMEOUT},
    error::{ConfigError, OrchestratorError},
    health::{HealthChecker, HealthClass, HealthResult, Probe, port_accepts_connections},
    process::{ProcessHandle, ProcessManager, Selector, StopSummary},
};

/// Lifecycle state of a service as seen by one run or one status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceStatus {
    NotRunning,
    Starting,
    Running,
    Healthy,
    Stopping,
    Failed,
}

/// What `start` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The selector was already active; nothing was spawned.
    AlreadyRunning,
    /// A new process was spawned.
    Started { pid: u32 },
}

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// The readiness probe passed.
    Ready(HealthResult),
    /// The deadline passed; carries the last observed result.
    TimedOut(Option<HealthResult>),
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub name: String,
    pub display_name: String,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub url: Option<String>,
    /// Result of the readiness probe, when the service is running.
    pub health: Option<HealthResult>,
    /// Result of the HTTP endpoint probe, when one is configured and the service is running.
    pub http: Option<HealthResult>,
}

/// Operations the orchestrator needs from a service.
pub trait ServiceControl {
    /// Service key.
    fn name(&self) -> &str;

    /// Address users open to reach the service.
    fn url(&self) -> Option<String>;

    /// Whether the service's processes are alive right now.
    fn is_running(&self) -> bool;

    /// Starts the service unless it is already running.
    fn start(&self) -> Result<StartOutcome, OrchestratorError>;

    /// Stops whatever the service's selector matches.
    fn stop(&self) -> Result<StopSummary, OrchestratorError>;

    /// Queries liveness and health.
    fn status(&self) -> ServiceReport;

    /// Polls readiness until it passes or `timeout` elapses.
    fn wait_healthy(&self, timeout: Duration) -> Result<Readiness, OrchestratorError>;
}

/// Controls one service described by a [`ServiceDefinition`].
#[derive(Debug, Clone)]
pub struct ServiceController {
    definition: ServiceDefinition,
    processes: Arc<ProcessManager>,
    health: HealthChecker,
    settings: Settings,
    cancel: CancelToken,
}

impl ServiceController {
    pub fn new(
        definition: ServiceDefinition,
        processes: Arc<ProcessManager>,
        settings: Settings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            definition,
            processes,
            health: HealthChecker::new(cancel.clone()),
            settings,
            cancel,
        }
    }

    /// The definition this controller was built from.
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// How the service's processes are identified: port, else stop pattern,
    /// else the command line.
    pub fn selector(&self) -> Option<Selector> {
        let definition = &self.definition;
        if let Some(port) = definition.port {
            return Some(Selector::Port(port));
        }
        definition
            .stop_pattern
            .as_ref()
            .or(definition.command.as_ref())
            .filter(|pattern| !pattern.trim().is_empty())
            .map(|pattern| Selector::Pattern(pattern.clone()))
    }

    /// Probe deciding readiness: port, else HTTP endpoint. `None` means liveness.
    pub fn readiness_probe(&self) -> Option<Probe> {
        self.definition
            .port
            .map(Probe::port)
            .or_else(|| self.http_probe())
    }

    fn http_probe(&self) -> Option<Probe> {
        self.definition
            .health_endpoint
            .as_ref()
            .map(|url| Probe::http(url.clone(), self.definition.expected_status))
    }

    /// Whether the service is running and its readiness probe passes once.
    pub fn is_healthy(&self) -> bool {
        self.is_running() && self.readiness_once().is_ok()
    }

    fn readiness_once(&self) -> HealthResult {
        match self.readiness_probe() {
            Some(probe) => self.health.check(&probe, PROBE_TIMEOUT),
            None => self.liveness(),
        }
    }

    fn readiness_with_retry(&self, deadline: Instant) -> HealthResult {
        match self.readiness_probe() {
            Some(probe) => self.health.check_with_retry_until(
                &probe,
                self.settings.retry_attempts,
                self.settings.retry_initial_delay,
                deadline,
            ),
            None => self.liveness(),
        }
    }

    fn liveness(&self) -> HealthResult {
        let started = Instant::now();
        match self.selector() {
            Some(selector) if self.processes.is_active(&selector) => HealthResult::new(
                HealthClass::Ok,
                started.elapsed(),
                format!("process matching {selector} is running"),
            ),
            Some(selector) => HealthResult::new(
                HealthClass::Critical,
                started.elapsed(),
                format!("no process matches {selector}"),
            ),
            None => HealthResult::new(
                HealthClass::Unknown,
                started.elapsed(),
                "service has neither a port nor a command to look for",
            ),
        }
    }

    /// Blocks until `port` accepts connections. `Ok(false)` on timeout.
    fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<bool, OrchestratorError> {
        let deadline = Instant::now() + timeout;
        loop {
            if port_accepts_connections(PROBE_HOST, port, PROBE_TIMEOUT) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.cancel
                .sleep(self.settings.poll_interval.min(deadline - now))?;
        }
    }

    /// Stops a process this controller just spawned after its startup failed.
    fn abandon(&self, handle: &ProcessHandle) {
        if let Err(err) = self
            .processes
            .stop(&handle.selector(), self.settings.stop_grace)
        {
            warn!(
                "Failed to stop '{}' (PID {}) after failed startup: {err}",
                handle.name(),
                handle.pid()
            );
        }
    }
}

impl ServiceControl for ServiceController {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn url(&self) -> Option<String> {
        self.definition.url()
    }

    fn is_running(&self) -> bool {
        self.selector()
            .is_some_and(|selector| self.processes.is_active(&selector))
    }

    fn start(&self) -> Result<StartOutcome, OrchestratorError> {
        let definition = &self.definition;
        let name = definition.name.as_str();

        let command = definition
            .command
            .as_deref()
            .filter(|command| !command.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField {
                service: name.to_string(),
                field: "command",
            })?;
        let working_directory =
            definition
                .working_directory
                .as_deref()
                .ok_or_else(|| ConfigError::MissingField {
                    service: name.to_string(),
                    field: "working_directory",
                })?;

        if self.is_running() {
            info!("Service '{name}' is already running; not starting another instance");
            return Ok(StartOutcome::AlreadyRunning);
        }

        self.cancel.check()?;
        info!("Starting service '{}'", definition.display_name());
        let handle = self
            .processes
            .start(name, command, working_directory, &definition.env)?;

        if let Some(port) = definition.port {
            debug!("Waiting up to {:?} for '{name}' to open port {port}", definition.start_timeout());
            match self.wait_for_port(port, definition.start_timeout()) {
                Ok(true) => debug!("Service '{name}' is accepting connections on port {port}"),
                Ok(false) => {
                    warn!(
                        "Service '{name}' did not open port {port} within {:?}",
                        definition.start_timeout()
                    );
                    self.abandon(&handle);
                    return Err(OrchestratorError::HealthCheckFailure {
                        service: name.to_string(),
                        classification: HealthClass::Critical,
                        attempts: 1,
                    });
                }
                Err(err) => {
                    self.abandon(&handle);
                    return Err(err);
                }
            }
        }

        if let Some(probe) = self.http_probe() {
            let result = self.health.check(&probe, PROBE_TIMEOUT);
            if !result.is_ok() {
                warn!(
                    "Service '{name}' health endpoint is {}: {}",
                    result.classification, result.detail
                );
            }
        }

        Ok(StartOutcome::Started {
            pid: handle.pid(),
        })
    }

    fn stop(&self) -> Result<StopSummary, OrchestratorError> {
        let name = self.definition.name.as_str();
        let Some(selector) = self.selector() else {
            debug!("Service '{name}' has nothing to identify its processes by; nothing to stop");
            return Ok(StopSummary::default());
        };

        info!("Stopping service '{}'", self.definition.display_name());
        self.processes
            .stop(&selector, self.settings.stop_grace)
            .map_err(|source| OrchestratorError::ProcessStillRunning {
                service: name.to_string(),
                source,
            })
    }

    fn status(&self) -> ServiceReport {
        let definition = &self.definition;
        let mut report = ServiceReport {
            name: definition.name.clone(),
            display_name: definition.display_name().to_string(),
            status: ServiceStatus::NotRunning,
            pid: None,
            url: definition.url(),
            health: None,
            http: None,
        };

        let Some(selector) = self.selector() else {
            return report;
        };
        if !self.processes.is_active(&selector) {
            return report;
        }

        report.pid = self.processes.matching_pids(&selector).first().copied();

        let readiness = self.readiness_once();
        report.status = if readiness.is_ok() {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Running
        };

        report.http = match (definition.port, self.http_probe()) {
            // Without a port the HTTP probe already is the readiness probe.
            (None, Some(_)) => Some(readiness.clone()),
            (Some(_), Some(probe)) => Some(self.health.check(&probe, PROBE_TIMEOUT)),
            (_, None) => None,
        };
        report.health = Some(readiness);
        report
    }

    fn wait_healthy(&self, timeout: Duration) -> Result<Readiness, OrchestratorError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.cancel.check()?;
            let result = self.readiness_with_retry(deadline);
            self.cancel.check()?;
            if result.is_ok() {
                return Ok(Readiness::Ready(result));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Readiness::TimedOut(Some(result)));
            }
            debug!(
                "Service '{}' not ready yet ({}): {}",
                self.definition.name, result.classification, result.detail
            );
            self.cancel
                .sleep(self.settings.poll_interval.min(deadline - now))?;
        }
    }
}
