//! Readiness probes for services: TCP port reachability and HTTP endpoints.
use std::{
    fmt, io,
    net::{TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use reqwest::blocking::Client;
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::{
    cancel::CancelToken,
    constants::{MIN_PROBE_TIMEOUT, PROBE_HOST, PROBE_TIMEOUT},
};

/// Outcome class of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthClass {
    Ok,
    Warning,
    Critical,
    Unknown,
}

/// What to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Healthy when the port accepts TCP connections.
    Port { host: String, port: u16 },
    /// Healthy when a GET returns the expected status (any 2xx when unset).
    Http {
        url: String,
        expected_status: Option<u16>,
    },
}

impl Probe {
    /// Port probe against localhost (IPv4 and IPv6).
    pub fn port(port: u16) -> Self {
        Probe::Port {
            host: PROBE_HOST.to_string(),
            port,
        }
    }

    /// HTTP probe.
    pub fn http(url: impl Into<String>, expected_status: Option<u16>) -> Self {
        Probe::Http {
            url: url.into(),
            expected_status,
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Port { host, port } => write!(f, "tcp://{host}:{port}"),
            Probe::Http { url, .. } => write!(f, "{url}"),
        }
    }
}

/// Classified result of one check or one retry sequence. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub classification: HealthClass,
    pub attempts: u32,
    pub latency: Duration,
    pub detail: String,
}

impl HealthResult {
    /// Builds a single-attempt result.
    pub fn new(classification: HealthClass, latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            classification,
            attempts: 1,
            latency,
            detail: detail.into(),
        }
    }

    /// Whether the probe passed.
    pub fn is_ok(&self) -> bool {
        self.classification == HealthClass::Ok
    }
}

/// Maps an HTTP status code onto a health class.
pub fn classify_status(status: u16, expected: Option<u16>) -> HealthClass {
    let matches = match expected {
        Some(expected) => status == expected,
        None => (200..300).contains(&status),
    };

    if matches {
        HealthClass::Ok
    } else if (400..500).contains(&status) {
        HealthClass::Warning
    } else if (500..600).contains(&status) {
        HealthClass::Critical
    } else {
        HealthClass::Warning
    }
}

/// Whether `host:port` accepts a TCP connection within `timeout`.
pub fn port_accepts_connections(host: &str, port: u16, timeout: Duration) -> bool {
    connect_port(host, port, timeout).is_ok()
}

/// Why a port probe failed.
enum PortFailure {
    Resolve(io::Error),
    Refused(String),
}

/// Tries every resolved address of `host:port` in turn.
fn connect_port(host: &str, port: u16, timeout: Duration) -> Result<(), PortFailure> {
    let addrs = (host, port).to_socket_addrs().map_err(PortFailure::Resolve)?;

    let mut last_error = String::from("no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(err) => last_error = err.to_string(),
        }
    }
    Err(PortFailure::Refused(last_error))
}

/// Runs probes and retries them with exponential backoff.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    cancel: CancelToken,
    client: Option<Client>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(CancelToken::default())
    }
}

impl HealthChecker {
    /// Creates a checker whose backoff sleeps end early once `cancel` fires.
    pub fn new(cancel: CancelToken) -> Self {
        let client = match Client::builder().build() {
            Ok(client) => Some(client),
            Err(err) => {
                warn!("Failed to build HTTP client, HTTP probes will report UNKNOWN: {err}");
                None
            }
        };
        Self { cancel, client }
    }

    /// Runs one probe bounded by `timeout`.
    pub fn check(&self, probe: &Probe, timeout: Duration) -> HealthResult {
        let started = Instant::now();
        match probe {
            Probe::Port { host, port } => match connect_port(host, *port, timeout) {
                Ok(()) => HealthResult::new(
                    HealthClass::Ok,
                    started.elapsed(),
                    format!("{probe} accepting connections"),
                ),
                Err(PortFailure::Resolve(err)) => HealthResult::new(
                    HealthClass::Unknown,
                    started.elapsed(),
                    format!("cannot resolve {host}: {err}"),
                ),
                Err(PortFailure::Refused(reason)) => HealthResult::new(
                    HealthClass::Critical,
                    started.elapsed(),
                    format!("{probe} not reachable: {reason}"),
                ),
            },
            Probe::Http {
                url,
                expected_status,
            } => {
                let Some(client) = &self.client else {
                    return HealthResult::new(
                        HealthClass::Unknown,
                        started.elapsed(),
                        "HTTP client unavailable",
                    );
                };

                match client.get(url).timeout(timeout).send() {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        let classification = classify_status(status, *expected_status);
                        HealthResult::new(
                            classification,
                            started.elapsed(),
                            format!("{url} returned {status}"),
                        )
                    }
                    Err(err) if err.is_builder() => HealthResult::new(
                        HealthClass::Unknown,
                        started.elapsed(),
                        format!("invalid health endpoint {url}: {err}"),
                    ),
                    Err(err) => HealthResult::new(
                        HealthClass::Critical,
                        started.elapsed(),
                        format!("{url} unreachable: {err}"),
                    ),
                }
            }
        }
    }

    /// Retries non-OK checks, doubling the delay after every failed attempt.
    ///
    /// Returns the first OK result, or the last non-OK one once `attempts` are
    /// exhausted. A cancelled backoff sleep ends the sequence early with the
    /// last result.
    pub fn check_with_retry(
        &self,
        probe: &Probe,
        attempts: u32,
        initial_delay: Duration,
    ) -> HealthResult {
        self.retry(probe, attempts, initial_delay, None)
    }

    /// Like [`check_with_retry`](Self::check_with_retry), but never runs past
    /// `deadline`: probe timeouts and backoff sleeps are clamped to the time
    /// left, and no attempt starts once it has passed.
    pub fn check_with_retry_until(
        &self,
        probe: &Probe,
        attempts: u32,
        initial_delay: Duration,
        deadline: Instant,
    ) -> HealthResult {
        self.retry(probe, attempts, initial_delay, Some(deadline))
    }

    fn retry(
        &self,
        probe: &Probe,
        attempts: u32,
        initial_delay: Duration,
        deadline: Option<Instant>,
    ) -> HealthResult {
        let attempts = attempts.max(1);
        let remaining = |deadline: Option<Instant>| {
            deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
        };
        let mut delay = initial_delay;
        let mut attempt = 1;

        loop {
            let timeout = match remaining(deadline) {
                Some(left) => PROBE_TIMEOUT.min(left).max(MIN_PROBE_TIMEOUT),
                None => PROBE_TIMEOUT,
            };
            let mut result = self.check(probe, timeout);
            result.attempts = attempt;

            if result.is_ok() || attempt >= attempts {
                return result;
            }

            let pause = match remaining(deadline) {
                Some(left) if left.is_zero() => return result,
                Some(left) => delay.min(left),
                None => delay,
            };

            debug!(
                "Probe {probe} attempt {attempt}/{attempts} was {}: {}; retrying in {:?}",
                result.classification, result.detail, pause
            );

            if self.cancel.sleep(pause).is_err() {
                return result;
            }
            if remaining(deadline).is_some_and(|left| left.is_zero()) {
                return result;
            }
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }
}
