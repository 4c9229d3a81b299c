//! Configuration management for devstack.
//!
//! The configuration is loaded once per invocation into a [`Context`], which is
//! the only place service and composite definitions live. Everything downstream
//! receives the context (or a single definition) by reference.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use crate::constants::{
    BASE_DIR_ENV, DEFAULT_DEPENDENCY_WAIT, DEFAULT_POLL_INTERVAL, DEFAULT_RESTART_PAUSE,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_INITIAL_DELAY, DEFAULT_SPAWN_SETTLE,
    DEFAULT_START_TIMEOUT_SECS, DEFAULT_STOP_GRACE, LOG_DIR_ENV,
};
use crate::error::ConfigError;
use crate::logs;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

fn default_start_timeout() -> u64 {
    DEFAULT_START_TIMEOUT_SECS
}

/// A single long-running process definition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Unique service key.
    pub name: String,
    /// Human label; defaults to `name`.
    pub display_name: Option<String>,
    /// Shell command used to start the service.
    pub command: Option<String>,
    /// Directory the command runs in. Relative paths resolve against the base dir.
    pub working_directory: Option<PathBuf>,
    /// Port the service listens on; enables port readiness and port-based stop.
    pub port: Option<u16>,
    /// URL probed over HTTP once the service is up.
    pub health_endpoint: Option<String>,
    /// HTTP status that counts as healthy. Any 2xx when unset.
    pub expected_status: Option<u16>,
    /// Bound on port and health waits after launch.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_seconds: u64,
    /// Services that must be healthy before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Extra environment passed to the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Pattern identifying the running process when no port is configured.
    pub stop_pattern: Option<String>,
}

impl ServiceDefinition {
    /// Creates a definition with every optional field unset.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            command: None,
            working_directory: None,
            port: None,
            health_endpoint: None,
            expected_status: None,
            start_timeout_seconds: DEFAULT_START_TIMEOUT_SECS,
            dependencies: Vec::new(),
            env: BTreeMap::new(),
            stop_pattern: None,
        }
    }

    /// Label shown to users.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Start timeout as a [`Duration`].
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }

    /// Address users open to reach the service, if it has one.
    pub fn url(&self) -> Option<String> {
        self.health_endpoint
            .clone()
            .or_else(|| self.port.map(|port| format!("http://localhost:{port}")))
    }
}

/// A named set of services handled together.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CompositeDefinition {
    /// Unique composite key.
    pub name: String,
    /// Human label; defaults to `name`.
    pub display_name: Option<String>,
    /// Member services, in declaration order.
    #[serde(default)]
    pub members: Vec<String>,
}

impl CompositeDefinition {
    /// Label shown to users.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Resolved tuning values for orchestration runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Bound on waiting for a direct dependency to be healthy.
    pub dependency_wait: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Liveness window after spawn.
    pub spawn_settle: Duration,
    /// Sampling interval of readiness polls.
    pub poll_interval: Duration,
    /// Attempts per `check_with_retry` call.
    pub retry_attempts: u32,
    /// First backoff delay; doubled after each failed attempt.
    pub retry_initial_delay: Duration,
    /// Pause between stop and start on restart.
    pub restart_pause: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dependency_wait: DEFAULT_DEPENDENCY_WAIT,
            stop_grace: DEFAULT_STOP_GRACE,
            spawn_settle: DEFAULT_SPAWN_SETTLE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_initial_delay: DEFAULT_RETRY_INITIAL_DELAY,
            restart_pause: DEFAULT_RESTART_PAUSE,
        }
    }
}

/// `settings` section as written in the file.
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    dependency_wait: Option<String>,
    stop_grace: Option<String>,
    spawn_settle: Option<String>,
    poll_interval: Option<String>,
    retry_attempts: Option<u32>,
    retry_initial_delay: Option<String>,
    restart_pause: Option<String>,
}

impl RawSettings {
    fn resolve(self) -> Result<Settings, ConfigError> {
        let defaults = Settings::default();
        let pick = |field: &str, raw: Option<String>, fallback: Duration| match raw {
            Some(value) => parse_duration(field, &value),
            None => Ok(fallback),
        };

        Ok(Settings {
            dependency_wait: pick(
                "dependency_wait",
                self.dependency_wait,
                defaults.dependency_wait,
            )?,
            stop_grace: pick("stop_grace", self.stop_grace, defaults.stop_grace)?,
            spawn_settle: pick("spawn_settle", self.spawn_settle, defaults.spawn_settle)?,
            poll_interval: pick(
                "poll_interval",
                self.poll_interval,
                defaults.poll_interval,
            )?,
            retry_attempts: self.retry_attempts.unwrap_or(defaults.retry_attempts).max(1),
            retry_initial_delay: pick(
                "retry_initial_delay",
                self.retry_initial_delay,
                defaults.retry_initial_delay,
            )?,
            restart_pause: pick(
                "restart_pause",
                self.restart_pause,
                defaults.restart_pause,
            )?,
        })
    }
}

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[allow(dead_code)]
    version: Option<String>,
    base_dir: Option<String>,
    log_dir: Option<String>,
    settings: Option<RawSettings>,
    #[serde(default)]
    services: Vec<ServiceDefinition>,
    #[serde(default)]
    composites: Vec<CompositeDefinition>,
}

/// What a user-supplied name refers to.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// A single service (started together with its dependencies).
    Service(&'a ServiceDefinition),
    /// A composite environment.
    Composite(&'a CompositeDefinition),
}

/// Every definition and setting for one invocation.
#[derive(Debug, Clone)]
pub struct Context {
    services: Vec<ServiceDefinition>,
    composites: Vec<CompositeDefinition>,
    index: HashMap<String, usize>,
    settings: Settings,
    base_dir: PathBuf,
    log_dir: PathBuf,
}

impl Context {
    /// Builds and validates a context from already-parsed definitions.
    ///
    /// Relative working directories are resolved against `base_dir`.
    pub fn new(
        services: Vec<ServiceDefinition>,
        composites: Vec<CompositeDefinition>,
        settings: Settings,
        base_dir: PathBuf,
        log_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        let mut index = HashMap::new();
        let mut services = services;

        for (position, service) in services.iter_mut().enumerate() {
            if index.insert(service.name.clone(), position).is_some() {
                return Err(ConfigError::DuplicateName(service.name.clone()));
            }
            if let Some(dir) = &service.working_directory {
                let expanded = expand_home(&dir.to_string_lossy());
                service.working_directory = Some(if expanded.is_absolute() {
                    expanded
                } else {
                    base_dir.join(expanded)
                });
            }
        }

        let context = Self {
            services,
            composites,
            index,
            settings,
            base_dir,
            log_dir,
        };
        context.validate()?;
        Ok(context)
    }

    /// Loads and parses the configuration file, expanding environment variables.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(config_path).map_err(|e| {
            ConfigError::ReadError(std::io::Error::new(
                e.kind(),
                format!("{} ({})", e, config_path.display()),
            ))
        })?;

        let config_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        Self::from_yaml_str(&content, config_dir)
    }

    /// Parses configuration text whose relative paths are anchored at `config_dir`.
    pub fn from_yaml_str(content: &str, config_dir: &Path) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content)?;
        let file: ConfigFile = serde_yaml::from_str(&expanded)?;

        let base_dir = match env::var(BASE_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => expand_home(dir.trim()),
            _ => match &file.base_dir {
                Some(dir) => anchor(config_dir, expand_home(dir)),
                None => config_dir.to_path_buf(),
            },
        };

        let log_dir = match env::var(LOG_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => expand_home(dir.trim()),
            _ => match &file.log_dir {
                Some(dir) => anchor(config_dir, expand_home(dir)),
                None => logs::default_log_dir(),
            },
        };

        let settings = file.settings.unwrap_or_default().resolve()?;

        Self::new(file.services, file.composites, settings, base_dir, log_dir)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for service in &self.services {
            for dependency in &service.dependencies {
                if dependency == &service.name {
                    return Err(ConfigError::SelfDependency(service.name.clone()));
                }
                if !self.index.contains_key(dependency) {
                    return Err(ConfigError::UnknownDependency {
                        service: service.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let mut composite_names = HashSet::new();
        for composite in &self.composites {
            if self.index.contains_key(&composite.name)
                || !composite_names.insert(composite.name.as_str())
            {
                return Err(ConfigError::DuplicateName(composite.name.clone()));
            }
            for member in &composite.members {
                if !self.index.contains_key(member) {
                    return Err(ConfigError::UnknownMember {
                        composite: composite.name.clone(),
                        member: member.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// All service definitions in declaration order.
    pub fn services(&self) -> &[ServiceDefinition] {
        &self.services
    }

    /// All composite definitions in declaration order.
    pub fn composites(&self) -> &[CompositeDefinition] {
        &self.composites
    }

    /// Tuning values.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Directory relative working directories were resolved against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding per-service log sinks.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Looks up a service by name.
    pub fn service(&self, name: &str) -> Result<&ServiceDefinition, ConfigError> {
        self.index
            .get(name)
            .map(|&position| &self.services[position])
            .ok_or_else(|| ConfigError::UnknownService(name.to_string()))
    }

    /// Looks up a composite by name.
    pub fn composite(&self, name: &str) -> Result<&CompositeDefinition, ConfigError> {
        self.composites
            .iter()
            .find(|composite| composite.name == name)
            .ok_or_else(|| ConfigError::UnknownComposite(name.to_string()))
    }

    /// Resolves a user-supplied name to a composite or a service.
    pub fn target(&self, name: &str) -> Result<Target<'_>, ConfigError> {
        if let Ok(composite) = self.composite(name) {
            return Ok(Target::Composite(composite));
        }
        self.service(name)
            .map(Target::Service)
            .map_err(|_| ConfigError::UnknownTarget(name.to_string()))
    }

    /// Member services of a target, in declaration order, without duplicates.
    ///
    /// A service target expands to the service plus its transitive dependencies,
    /// ordered as the services are declared in the file.
    pub fn members(&self, name: &str) -> Result<Vec<String>, ConfigError> {
        match self.target(name)? {
            Target::Composite(composite) => {
                let mut seen = HashSet::new();
                Ok(composite
                    .members
                    .iter()
                    .filter(|member| seen.insert(member.as_str()))
                    .cloned()
                    .collect())
            }
            Target::Service(service) => {
                let mut needed = HashSet::new();
                let mut stack = vec![service.name.as_str()];
                while let Some(current) = stack.pop() {
                    if !needed.insert(current) {
                        continue;
                    }
                    for dependency in &self.service(current)?.dependencies {
                        stack.push(dependency.as_str());
                    }
                }

                Ok(self
                    .services
                    .iter()
                    .filter(|service| needed.contains(service.name.as_str()))
                    .map(|service| service.name.clone())
                    .collect())
            }
        }
    }
}

fn anchor(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Expands a leading `~` to `$HOME`.
fn expand_home(raw: &str) -> PathBuf {
    let home = env::var_os("HOME").map(PathBuf::from);
    match (raw, home) {
        ("~", Some(home)) => home,
        (path, Some(home)) if path.starts_with("~/") => home.join(&path[2..]),
        (path, _) => PathBuf::from(path),
    }
}

/// Expands `${VAR}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(input) {
        let (Some(whole), Some(var)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = env::var(var.as_str())
            .map_err(|_| ConfigError::MissingEnvVar(var.as_str().to_string()))?;
        output.push_str(&input[last..whole.start()]);
        output.push_str(&value);
        last = whole.end();
    }

    output.push_str(&input[last..]);
    Ok(output)
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(field: &str, raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        field: field.to_string(),
        value: raw.to_string(),
    };

    let value = raw.trim();
    if value.is_empty() {
        return Err(invalid());
    }

    if let Some(millis) = value.strip_suffix("ms") {
        let amount: u64 = millis.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}
