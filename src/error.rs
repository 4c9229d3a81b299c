//! Error handling for devstack.
use std::path::PathBuf;

use thiserror::Error;

use crate::health::HealthClass;

/// Errors raised while loading or querying the service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Referenced environment variable is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// Duration setting could not be parsed.
    #[error("Invalid duration value for '{field}': '{value}'")]
    InvalidDuration {
        /// Setting that carried the value.
        field: String,
        /// The raw value.
        value: String,
    },

    /// Two definitions share the same name.
    #[error("Duplicate definition name '{0}'")]
    DuplicateName(String),

    /// No service with this name is defined.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// No composite with this name is defined.
    #[error("Unknown composite '{0}'")]
    UnknownComposite(String),

    /// Name matches neither a service nor a composite.
    #[error("Unknown service or composite '{0}'")]
    UnknownTarget(String),

    /// A field required for the requested operation is absent.
    #[error("Service '{service}' is missing required field '{field}'")]
    MissingField {
        /// The service being operated on.
        service: String,
        /// The missing field.
        field: &'static str,
    },

    /// Error when a dependency reference is undefined in the configuration.
    #[error("Service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The service with an invalid dependency reference.
        service: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// A service lists itself as a dependency.
    #[error("Service '{0}' depends on itself")]
    SelfDependency(String),

    /// A composite references an undefined service.
    #[error("Composite '{composite}' references unknown service '{member}'")]
    UnknownMember {
        /// The composite declaring the member.
        composite: String,
        /// The missing service name.
        member: String,
    },
}

/// Errors raised by the process manager while spawning or terminating processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The configured working directory is absent.
    #[error("Working directory for '{service}' does not exist: {}", path.display())]
    MissingWorkingDirectory {
        /// The service being started.
        service: String,
        /// Directory that was expected.
        path: PathBuf,
    },

    /// The per-service log sink could not be opened.
    #[error("Failed to open log sink for '{service}': {source}")]
    LogSink {
        /// The service being started.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error spawning a service process.
    #[error("Failed to spawn '{service}': {source}")]
    Spawn {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The process died inside the settle window.
    #[error("Service '{service}' exited right after launch ({status})")]
    ExitedEarly {
        /// The service name.
        service: String,
        /// Rendered exit status.
        status: String,
    },

    /// Delivering a signal failed for a reason other than the process being gone.
    #[error("Failed to signal PID {pid}: {source}")]
    Signal {
        /// Target PID.
        pid: u32,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// Processes still match the selector after SIGKILL.
    #[error("Processes matching {selector} are still running (pids: {pids:?})")]
    StillRunning {
        /// Rendered selector.
        selector: String,
        /// Live PIDs that could be identified.
        pids: Vec<u32>,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for ProcessError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ProcessError::MutexPoisonError(err.to_string())
    }
}

/// Returned by cancellable sleeps once the run has been interrupted.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// A single rollback step that could not be completed.
#[derive(Debug, Clone, Error)]
#[error("failed to stop '{service}' during rollback: {reason}")]
pub struct RollbackError {
    /// The service that could not be stopped.
    pub service: String,
    /// Rendered underlying error.
    pub reason: String,
}

/// Result of unwinding a failed start.
#[derive(Debug, Clone, Default)]
pub struct RollbackOutcome {
    /// Services stopped, in the order they were stopped.
    pub stopped: Vec<String>,
    /// Steps that failed; the rollback continued past each of them.
    pub failures: Vec<RollbackError>,
}

impl RollbackOutcome {
    /// True when every spawned service was stopped.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.stopped.is_empty() && self.failures.is_empty() {
            return write!(f, "nothing to roll back");
        }
        write!(f, "stopped [{}]", self.stopped.join(", "))?;
        if !self.failures.is_empty() {
            let failed: Vec<&str> =
                self.failures.iter().map(|f| f.service.as_str()).collect();
            write!(f, ", failed to stop [{}]", failed.join(", "))?;
        }
        Ok(())
    }
}

/// Defines all errors surfaced by orchestration runs.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Configuration problem; never retried.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The dependency graph of the requested members contains a cycle.
    #[error("Detected dependency cycle among: {}", services.join(", "))]
    DependencyCycle {
        /// Every service left unresolved, in declaration order.
        services: Vec<String>,
    },

    /// A direct dependency did not become healthy within the bounded wait.
    #[error("Service '{service}' cannot start: dependency '{dependency}' is not healthy")]
    DependencyUnhealthy {
        /// The service waiting to start.
        service: String,
        /// The dependency that never became healthy.
        dependency: String,
    },

    /// Spawning a service failed.
    #[error("Failed to start service: {0}")]
    ProcessStart(#[source] ProcessError),

    /// Health probing stayed non-OK after retries were exhausted.
    #[error("Service '{service}' failed health checks ({classification} after {attempts} attempts)")]
    HealthCheckFailure {
        /// The service that stayed unhealthy.
        service: String,
        /// Last observed classification.
        classification: HealthClass,
        /// Number of probe attempts made.
        attempts: u32,
    },

    /// A stop left processes behind.
    #[error("Service '{service}' is still running: {source}")]
    ProcessStillRunning {
        /// The service that could not be stopped.
        service: String,
        /// The underlying process error.
        #[source]
        source: ProcessError,
    },

    /// The run was interrupted.
    #[error("Orchestration cancelled")]
    Cancelled(#[from] Cancelled),

    /// A failed start that has been unwound.
    #[error("{cause} (rollback: {rollback})")]
    RolledBack {
        /// The first fatal error.
        cause: Box<OrchestratorError>,
        /// What the rollback achieved.
        rollback: RollbackOutcome,
    },
}

impl OrchestratorError {
    /// Returns the error that triggered a rollback, or `self` when no rollback happened.
    pub fn root_cause(&self) -> &OrchestratorError {
        match self {
            OrchestratorError::RolledBack { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<ProcessError> for OrchestratorError {
    fn from(err: ProcessError) -> Self {
        OrchestratorError::ProcessStart(err)
    }
}
