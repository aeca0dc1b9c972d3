//! Process-wide connection counters.
//! Cheap atomics bumped by the scale manager; read via [`snapshot`] for status output.
use std::sync::atomic::{AtomicU64, Ordering};

static CONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static CONNECT_SUCCESSES: AtomicU64 = AtomicU64::new(0);
static CONNECT_FAILURES: AtomicU64 = AtomicU64::new(0);
static CONNECT_THROTTLED: AtomicU64 = AtomicU64::new(0);
static CONNECT_BUSY: AtomicU64 = AtomicU64::new(0);
static OPEN_CALLS: AtomicU64 = AtomicU64::new(0);
static READ_ERRORS: AtomicU64 = AtomicU64::new(0);
static READINGS: AtomicU64 = AtomicU64::new(0);

pub fn inc_connect_attempts() {
    CONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connect_successes() {
    CONNECT_SUCCESSES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connect_failures() {
    CONNECT_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connect_throttled() {
    CONNECT_THROTTLED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connect_busy() {
    CONNECT_BUSY.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_open_calls() {
    OPEN_CALLS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_read_errors() {
    READ_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_readings() {
    READINGS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub connect_failures: u64,
    pub connect_throttled: u64,
    pub connect_busy: u64,
    pub open_calls: u64,
    pub read_errors: u64,
    pub readings: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        connect_attempts: CONNECT_ATTEMPTS.load(Ordering::Relaxed),
        connect_successes: CONNECT_SUCCESSES.load(Ordering::Relaxed),
        connect_failures: CONNECT_FAILURES.load(Ordering::Relaxed),
        connect_throttled: CONNECT_THROTTLED.load(Ordering::Relaxed),
        connect_busy: CONNECT_BUSY.load(Ordering::Relaxed),
        open_calls: OPEN_CALLS.load(Ordering::Relaxed),
        read_errors: READ_ERRORS.load(Ordering::Relaxed),
        readings: READINGS.load(Ordering::Relaxed),
    }
}
