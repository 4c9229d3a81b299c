//! Orchestration runs over composite environments.
//!
//! A run resolves the members of a target into a [`StartupPlan`], starts them
//! one at a time, and unwinds everything it spawned when a step fails. Stop and
//! status requests go straight to the member controllers.
use std::{fmt, sync::Arc};

use chrono::{DateTime, Local};
use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, error, info, warn};

use crate::{
    cancel::CancelToken,
    config::{Context, ServiceDefinition, Settings, Target},
    error::{OrchestratorError, RollbackError, RollbackOutcome},
    health::HealthClass,
    process::ProcessManager,
    resolver::{DependencyResolver, StartupPlan},
    service::{
        Readiness, ServiceControl, ServiceController, ServiceReport, ServiceStatus, StartOutcome,
    },
};

/// Builds the controller for a service definition.
pub trait ControllerFactory {
    type Controller: ServiceControl;

    fn controller(&self, definition: &ServiceDefinition) -> Self::Controller;
}

/// Factory producing controllers that drive real processes.
#[derive(Debug, Clone)]
pub struct LocalControllers {
    processes: Arc<ProcessManager>,
    settings: Settings,
    cancel: CancelToken,
}

impl LocalControllers {
    /// Creates a factory sharing one [`ProcessManager`] across all controllers.
    pub fn new(context: &Context, cancel: CancelToken) -> Self {
        let settings = context.settings().clone();
        let processes = ProcessManager::new(context.log_dir()).with_settle_delay(settings.spawn_settle);
        Self {
            processes: Arc::new(processes),
            settings,
            cancel,
        }
    }

    /// The shared process manager.
    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }
}

impl ControllerFactory for LocalControllers {
    type Controller = ServiceController;

    fn controller(&self, definition: &ServiceDefinition) -> ServiceController {
        ServiceController::new(
            definition.clone(),
            Arc::clone(&self.processes),
            self.settings.clone(),
            self.cancel.clone(),
        )
    }
}

/// Phases of a start run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RunPhase {
    Planning,
    Sequencing,
    Succeeded,
    RollingBack,
    Failed,
}

/// What one run knows about a service it touched.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeServiceState {
    pub name: String,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Local>>,
}

impl RuntimeServiceState {
    fn new(name: &str, status: ServiceStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            pid: None,
            started_at: None,
        }
    }
}

/// Result of a successful start run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    /// Plan order that was executed.
    pub order: Vec<String>,
    /// Services spawned by this run.
    pub started: Vec<String>,
    /// Services that were already running and were left alone.
    pub already_running: Vec<String>,
    /// `(service, url)` for every planned service that has one.
    pub urls: Vec<(String, String)>,
    /// Final per-service state of the run.
    pub services: Vec<RuntimeServiceState>,
}

/// Result of a stop request. Failures are warnings, never fatal.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Services that were stopped, in stop order.
    pub stopped: Vec<String>,
    /// Services that were not running.
    pub not_running: Vec<String>,
    /// Services that could not be stopped.
    pub warnings: Vec<OrchestratorError>,
}

/// Result of a restart request.
#[derive(Debug)]
pub struct RestartReport {
    pub stop: StopReport,
    pub start: StartReport,
}

/// Aggregated health of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CompositeHealth {
    AllHealthy,
    Partial { healthy: usize, total: usize },
    NoneRunning,
}

impl CompositeHealth {
    /// Aggregates member statuses. An empty target counts as not running.
    pub fn from_statuses(statuses: &[ServiceStatus]) -> Self {
        let total = statuses.len();
        let healthy = statuses
            .iter()
            .filter(|status| **status == ServiceStatus::Healthy)
            .count();

        if total == 0 || statuses.iter().all(|s| *s == ServiceStatus::NotRunning) {
            CompositeHealth::NoneRunning
        } else if healthy == total {
            CompositeHealth::AllHealthy
        } else {
            CompositeHealth::Partial { healthy, total }
        }
    }

    /// Process exit code of `status`: 0 all healthy, 2 partial, 1 none running.
    pub fn exit_code(&self) -> u8 {
        match self {
            CompositeHealth::AllHealthy => 0,
            CompositeHealth::Partial { .. } => 2,
            CompositeHealth::NoneRunning => 1,
        }
    }
}

impl fmt::Display for CompositeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositeHealth::AllHealthy => write!(f, "all healthy"),
            CompositeHealth::Partial { healthy, total } => {
                write!(f, "partial ({healthy}/{total} healthy)")
            }
            CompositeHealth::NoneRunning => write!(f, "none running"),
        }
    }
}

/// Status of every member of a target.
#[derive(Debug, Clone, Serialize)]
pub struct CompositeStatusReport {
    pub target: String,
    pub summary: CompositeHealth,
    pub members: Vec<ServiceReport>,
}

/// Mutable bookkeeping of one start run.
struct Run<C> {
    spawned: Vec<C>,
    report: StartReport,
}

impl<C> Run<C> {
    fn state_mut(&mut self, name: &str) -> Option<&mut RuntimeServiceState> {
        self.report.services.iter_mut().find(|state| state.name == name)
    }

    fn set_status(&mut self, name: &str, status: ServiceStatus) {
        if let Some(state) = self.state_mut(name) {
            state.status = status;
        }
    }
}

/// Drives start, stop, status and restart over targets of a [`Context`].
pub struct Orchestrator<'a, F: ControllerFactory> {
    context: &'a Context,
    factory: F,
    cancel: CancelToken,
}

impl<'a, F: ControllerFactory> Orchestrator<'a, F> {
    pub fn new(context: &'a Context, factory: F, cancel: CancelToken) -> Self {
        Self {
            context,
            factory,
            cancel,
        }
    }

    fn enter(&self, target: &str, phase: RunPhase) {
        info!("[{target}] {phase}");
    }

    fn controller(&self, name: &str) -> Result<F::Controller, OrchestratorError> {
        Ok(self.factory.controller(self.context.service(name)?))
    }

    /// Services a stop or status request covers: the members of a composite,
    /// or just the named service.
    fn scope(&self, target: &str) -> Result<Vec<String>, OrchestratorError> {
        Ok(match self.context.target(target)? {
            Target::Composite(_) => self.context.members(target)?,
            Target::Service(service) => vec![service.name.clone()],
        })
    }

    /// Starts every member of `target` in dependency order.
    ///
    /// On failure everything this run spawned is stopped in reverse start
    /// order and the error comes back as [`OrchestratorError::RolledBack`].
    /// Services that were already running are never touched.
    pub fn start(&self, target: &str) -> Result<StartReport, OrchestratorError> {
        self.enter(target, RunPhase::Planning);
        let members = self.context.members(target)?;
        let plan = DependencyResolver::resolve(&members, self.context)?;
        info!("[{target}] startup order: {}", plan.order().join(" -> "));

        self.enter(target, RunPhase::Sequencing);
        let mut run = Run {
            spawned: Vec::new(),
            report: StartReport {
                order: plan.order().to_vec(),
                ..StartReport::default()
            },
        };

        match self.sequence(&plan, &mut run) {
            Ok(()) => {
                self.enter(target, RunPhase::Succeeded);
                Ok(run.report)
            }
            Err(cause) => {
                error!("[{target}] {cause}");
                self.enter(target, RunPhase::RollingBack);
                let rollback = self.roll_back(&mut run);
                self.enter(target, RunPhase::Failed);
                for state in &run.report.services {
                    debug!("[{target}] {} ended as {}", state.name, state.status);
                }
                Err(OrchestratorError::RolledBack {
                    cause: Box::new(cause),
                    rollback,
                })
            }
        }
    }

    fn sequence(
        &self,
        plan: &StartupPlan,
        run: &mut Run<F::Controller>,
    ) -> Result<(), OrchestratorError> {
        let settings = self.context.settings();

        for name in plan.iter() {
            self.cancel.check()?;
            let definition = self.context.service(name)?;
            let controller = self.factory.controller(definition);

            if let Some(url) = controller.url() {
                run.report.urls.push((name.to_string(), url));
            }

            if controller.is_running() {
                info!("Service '{name}' is already running; skipping");
                run.report
                    .services
                    .push(RuntimeServiceState::new(name, ServiceStatus::Running));
                run.report.already_running.push(name.to_string());
                continue;
            }

            for dependency in &definition.dependencies {
                debug!("Service '{name}' waiting for dependency '{dependency}'");
                match self
                    .controller(dependency)?
                    .wait_healthy(settings.dependency_wait)?
                {
                    Readiness::Ready(_) => {}
                    Readiness::TimedOut(_) => {
                        return Err(OrchestratorError::DependencyUnhealthy {
                            service: name.to_string(),
                            dependency: dependency.clone(),
                        });
                    }
                }
            }

            run.report
                .services
                .push(RuntimeServiceState::new(name, ServiceStatus::Starting));

            let pid = match controller.start() {
                Ok(StartOutcome::Started { pid }) => pid,
                Ok(StartOutcome::AlreadyRunning) => {
                    run.set_status(name, ServiceStatus::Running);
                    run.report.already_running.push(name.to_string());
                    continue;
                }
                Err(err) => {
                    run.set_status(name, ServiceStatus::Failed);
                    // A process may have been spawned before the failure.
                    if controller.is_running() {
                        run.spawned.push(controller);
                    }
                    return Err(err);
                }
            };

            if let Some(state) = run.state_mut(name) {
                state.status = ServiceStatus::Running;
                state.pid = Some(pid);
                state.started_at = Some(Local::now());
            }

            let readiness = controller.wait_healthy(definition.start_timeout());
            run.spawned.push(controller);

            match readiness {
                Ok(Readiness::Ready(result)) => {
                    info!(
                        "Service '{name}' is healthy ({:?}, {} attempt(s))",
                        result.latency, result.attempts
                    );
                    run.set_status(name, ServiceStatus::Healthy);
                    run.report.started.push(name.to_string());
                }
                Ok(Readiness::TimedOut(last)) => {
                    run.set_status(name, ServiceStatus::Failed);
                    return Err(OrchestratorError::HealthCheckFailure {
                        service: name.to_string(),
                        classification: last
                            .as_ref()
                            .map_or(HealthClass::Unknown, |result| result.classification),
                        attempts: last.as_ref().map_or(0, |result| result.attempts),
                    });
                }
                Err(err) => {
                    run.set_status(name, ServiceStatus::Failed);
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Stops everything the run spawned, newest first, continuing past failures.
    fn roll_back(&self, run: &mut Run<F::Controller>) -> RollbackOutcome {
        let mut outcome = RollbackOutcome::default();

        while let Some(controller) = run.spawned.pop() {
            let name = controller.name().to_string();
            run.set_status(&name, ServiceStatus::Stopping);

            match controller.stop() {
                Ok(_) => {
                    info!("Rolled back '{name}'");
                    run.set_status(&name, ServiceStatus::NotRunning);
                    outcome.stopped.push(name);
                }
                Err(err) => {
                    error!("Rollback of '{name}' failed: {err}");
                    run.set_status(&name, ServiceStatus::Failed);
                    outcome.failures.push(RollbackError {
                        service: name,
                        reason: err.to_string(),
                    });
                }
            }
        }

        outcome
    }

    /// Stops the members of `target` in reverse declaration order.
    pub fn stop(&self, target: &str) -> Result<StopReport, OrchestratorError> {
        let names = self.scope(target)?;
        let mut report = StopReport::default();

        for name in names.iter().rev() {
            let controller = self.controller(name)?;
            if !controller.is_running() {
                debug!("Service '{name}' is not running");
                report.not_running.push(name.clone());
                continue;
            }

            match controller.stop() {
                Ok(summary) => {
                    if summary.forced {
                        warn!("Service '{name}' had to be killed");
                    }
                    report.stopped.push(name.clone());
                }
                Err(err) => {
                    warn!("{err}");
                    report.warnings.push(err);
                }
            }
        }

        Ok(report)
    }

    /// Queries every member of `target` and aggregates the result.
    pub fn status(&self, target: &str) -> Result<CompositeStatusReport, OrchestratorError> {
        let names = self.scope(target)?;
        let members = names
            .iter()
            .map(|name| self.controller(name).map(|controller| controller.status()))
            .collect::<Result<Vec<_>, _>>()?;

        let statuses: Vec<ServiceStatus> = members.iter().map(|report| report.status).collect();
        Ok(CompositeStatusReport {
            target: target.to_string(),
            summary: CompositeHealth::from_statuses(&statuses),
            members,
        })
    }

    /// Stops `target`, pauses, then starts it again.
    pub fn restart(&self, target: &str) -> Result<RestartReport, OrchestratorError> {
        let stop = self.stop(target)?;
        let pause = self.context.settings().restart_pause;
        debug!("[{target}] pausing {pause:?} before starting again");
        self.cancel.sleep(pause)?;
        let start = self.start(target)?;
        Ok(RestartReport { stop, start })
    }
}
