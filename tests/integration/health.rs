#[path = "common/mod.rs"]
mod common;

use std::{
    io::{Read, Write},
    net::TcpListener,
    thread,
    time::{Duration, Instant},
};

use common::free_port;
use devstack::health::{HealthChecker, HealthClass, Probe};

/// Serves `status` to every connection from a background thread.
fn http_stub(status: u16) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let mut buffer = [0u8; 1024];
            let _ = stream.read(&mut buffer);
            let response = format!(
                "HTTP/1.1 {status} Stub\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    port
}

#[test]
fn retries_back_off_exponentially_until_attempts_run_out() {
    let checker = HealthChecker::default();
    let probe = Probe::port(free_port());

    let started = Instant::now();
    let result = checker.check_with_retry(&probe, 4, Duration::from_millis(100));
    let elapsed = started.elapsed();

    assert_eq!(result.classification, HealthClass::Critical);
    assert_eq!(result.attempts, 4);
    // 100ms + 200ms + 400ms between the four attempts; a fixed delay totals 300ms.
    assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3000), "elapsed {elapsed:?}");
}

#[test]
fn retry_stops_at_first_success() {
    let port = free_port();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(250));
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        thread::sleep(Duration::from_secs(3));
        drop(listener);
    });

    let result =
        HealthChecker::default().check_with_retry(&Probe::port(port), 6, Duration::from_millis(100));

    assert_eq!(result.classification, HealthClass::Ok);
    assert!(result.attempts >= 2 && result.attempts <= 4, "attempts {}", result.attempts);
    opener.join().unwrap();
}

#[test]
fn http_status_codes_are_classified() {
    let checker = HealthChecker::default();
    let timeout = Duration::from_secs(2);
    let url = |port: u16| format!("http://127.0.0.1:{port}/health");

    let ok = checker.check(&Probe::http(url(http_stub(200)), None), timeout);
    assert_eq!(ok.classification, HealthClass::Ok);
    assert!(ok.detail.contains("200"));

    let missing = checker.check(&Probe::http(url(http_stub(404)), None), timeout);
    assert_eq!(missing.classification, HealthClass::Warning);

    let broken = checker.check(&Probe::http(url(http_stub(503)), None), timeout);
    assert_eq!(broken.classification, HealthClass::Critical);

    let expected = checker.check(&Probe::http(url(http_stub(401)), Some(401)), timeout);
    assert_eq!(expected.classification, HealthClass::Ok);
}

#[test]
fn unreachable_http_endpoint_is_critical() {
    let url = format!("http://127.0.0.1:{}/health", free_port());
    let result = HealthChecker::default().check(&Probe::http(url, None), Duration::from_secs(1));
    assert_eq!(result.classification, HealthClass::Critical);
}
