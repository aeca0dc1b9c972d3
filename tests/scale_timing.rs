//! Pauses inside a connect cycle: rescan backoff and teardown.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{fast_policy, not_found, MockBackend, STM32_VCP};
use scalebridge::scale::{ConnectFailure, ReconnectPolicy, ScaleManager};

const BACKOFF: Duration = Duration::from_millis(100);

#[test]
fn backoff_runs_between_rounds_only() {
    let backend = Arc::new(MockBackend::refusing_all());
    let policy = ReconnectPolicy {
        hardware_id_rounds: 3,
        rescan_backoff: BACKOFF,
        ..fast_policy(Some(STM32_VCP))
    };
    let m = ScaleManager::new(backend.clone(), Some("COM3".into()), policy);

    let start = Instant::now();
    assert_eq!(m.connect(true).failure(), Some(ConnectFailure::DeviceNotFound));
    let elapsed = start.elapsed();

    assert_eq!(backend.enumerate_count(), 3);
    // Three rounds, two pauses; none after the last round
    assert!(elapsed >= BACKOFF * 2, "cycle took {:?}", elapsed);
    assert!(elapsed < BACKOFF * 3, "cycle took {:?}", elapsed);
}

#[test]
fn no_backoff_without_device_identity() {
    let backend = Arc::new(MockBackend::refusing_all());
    let policy = ReconnectPolicy {
        rescan_backoff: Duration::from_secs(5),
        ..fast_policy(None)
    };
    let m = ScaleManager::new(backend.clone(), Some("COM3".into()), policy);

    let start = Instant::now();
    assert!(m.connect(true).failure().is_some());
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(backend.enumerate_count(), 0);
}

#[test]
fn teardown_pause_precedes_first_open() {
    let pause = Duration::from_millis(40);
    let first_open: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let seen = first_open.clone();
    let backend = Arc::new(MockBackend::new(move |p| {
        seen.lock().unwrap().get_or_insert_with(Instant::now);
        if p.path == "COM3" {
            Ok(())
        } else {
            Err(not_found(&p.path))
        }
    }));
    let policy = ReconnectPolicy {
        teardown_pause: pause,
        ..fast_policy(None)
    };
    let m = ScaleManager::new(backend.clone(), Some("COM3".into()), policy);

    let start = Instant::now();
    assert!(m.connect(true).is_connected());
    let opened_at = first_open.lock().unwrap().expect("open recorded");
    assert!(opened_at.duration_since(start) >= pause);

    // A forced reconnect tears down and waits again
    *first_open.lock().unwrap() = None;
    let again = Instant::now();
    assert!(m.connect(true).is_connected());
    let reopened_at = first_open.lock().unwrap().expect("reopen recorded");
    assert!(reopened_at.duration_since(again) >= pause);
}
