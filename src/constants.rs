//! Constants and default tuning values for devstack.
//!
//! Every value here can be overridden from the `settings` section of the
//! configuration file unless noted otherwise.

use std::time::Duration;

// ============================================================================
// Startup
// ============================================================================

/// Default bound on port and health waits for a service.
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 30;

/// How long a freshly spawned process must survive before it counts as launched.
pub const DEFAULT_SPAWN_SETTLE: Duration = Duration::from_secs(1);

/// Upper bound on waiting for a direct dependency to report healthy.
pub const DEFAULT_DEPENDENCY_WAIT: Duration = Duration::from_secs(30);

/// Sampling interval of readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Health probing
// ============================================================================

/// Attempts made by a single `check_with_retry` call.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Delay before the second attempt; doubled after every failure.
pub const DEFAULT_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Timeout of a single port or HTTP probe. Not configurable.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Floor for a probe timeout clamped to a nearly expired deadline.
pub const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// Host probed for port readiness. Not configurable.
pub const PROBE_HOST: &str = "localhost";

// ============================================================================
// Shutdown
// ============================================================================

/// Time between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// How long to confirm that SIGKILL took effect. Not configurable.
pub const KILL_CONFIRM_WINDOW: Duration = Duration::from_secs(2);

/// Polling interval while waiting for processes to exit. Not configurable.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause between the stop and start halves of a restart.
pub const DEFAULT_RESTART_PAUSE: Duration = Duration::from_secs(2);

// ============================================================================
// Cancellation
// ============================================================================

/// Granularity of cancellable sleeps. Not configurable.
pub const CANCEL_SLICE: Duration = Duration::from_millis(50);

// ============================================================================
// Files
// ============================================================================

/// Configuration file used when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "devstack.yaml";

/// Overrides the base directory for relative working directories.
pub const BASE_DIR_ENV: &str = "DEVSTACK_BASE_DIR";

/// Overrides the directory holding per-service log sinks.
pub const LOG_DIR_ENV: &str = "DEVSTACK_LOG_DIR";
