//! # Scale Connection Manager
//!
//! [`ScaleManager`] owns the serial handle to the weighing scale and the
//! recovery heuristic that gets it back after Windows renames or wedges a
//! USB-serial port.
//!
//! ## Connect cycle
//!
//! A call to [`ScaleManager::connect`] passes these gates in order:
//!
//! 1. another connect already running on this manager → [`ConnectOutcome::Busy`]
//! 2. no port configured → `Failed { NoPortConfigured }`, no I/O
//! 3. already connected and not forced → `Connected`, no I/O
//! 4. not forced and the last attempt is inside the throttle window →
//!    [`ConnectOutcome::Throttled`], no I/O
//!
//! and then runs up to three strategies, stopping at the first open that
//! succeeds:
//!
//! - **simple**: the configured path at the default baud, lines untouched
//! - **hardware ID**: re-enumerate, resolve the VID/PID to a path, try
//!   [`HARDWARE_ID_COMBOS`]; repeat for a bounded number of rounds with a
//!   pause in between
//! - **matrix**: every baud × signal mode from [`matrix_plan`] on the
//!   configured path
//!
//! ## Locking
//!
//! One mutex guards all mutable state, handle included. Public methods take
//! it once and pass `&mut ScaleInner` down, so `read_weight` can trigger a
//! connect without re-locking. Open and read calls block while the lock is
//! held; async callers should go through `spawn_blocking`.
//!
//! The connect flag is always taken before the mutex. A caller that finds it
//! set returns at once (`Busy` from `connect`, `None` from `read_weight`)
//! instead of queueing behind a running cycle.

mod outcome;
mod policy;

pub use outcome::{ConnectFailure, ConnectOutcome, ConnectionState, WeightReading};
pub use policy::{
    matrix_plan, ReconnectPolicy, HARDWARE_ID_COMBOS, MATRIX_BAUDS, MATRIX_SIGNALS,
};

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::logutil::{escape_bytes, escape_line};
use crate::metrics;
use crate::serial::{
    resolve_port, DeviceIdentity, OpenError, OpenParams, ScaleHandle, SerialBackend, SignalLines,
};

/// Bytes buffered without a newline before the buffer is treated as noise.
const MAX_PENDING_LINE: usize = 4096;

struct ScaleInner {
    port: Option<String>,
    baud_rate: u32,
    state: ConnectionState,
    handle: Option<Box<dyn ScaleHandle>>,
    manual_override: bool,
    last_attempt: Option<Instant>,
    rx_buf: Vec<u8>,
}

/// Point-in-time view of the manager for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleStatus {
    pub state: ConnectionState,
    pub port: Option<String>,
    pub manual_override: bool,
}

/// Holds the re-entrancy flag for the duration of one connect cycle.
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ConnectGuard(flag))
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Tracks which kinds of open failure a cycle ran into.
#[derive(Debug, Default)]
struct FailureTally {
    not_found: u32,
    denied: u32,
    transient: u32,
}

impl FailureTally {
    fn record(&mut self, err: &OpenError) {
        match err {
            OpenError::NotFound { .. } => self.not_found += 1,
            OpenError::BusyOrDenied { .. } => self.denied += 1,
            OpenError::Transient { .. } => self.transient += 1,
        }
    }

    fn verdict(&self) -> ConnectFailure {
        if self.denied > 0 {
            ConnectFailure::PortBusyOrDenied
        } else if self.transient > 0 {
            ConnectFailure::TransientOpenFailure
        } else {
            ConnectFailure::DeviceNotFound
        }
    }
}

/// Blank paths mean "no port", wherever they come from.
fn normalize_port(path: &str) -> Option<String> {
    let p = path.trim();
    (!p.is_empty()).then(|| p.to_string())
}

fn pause(d: Duration) {
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}

/// Pull the next newline-terminated line out of `buf`, trimmed.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

pub struct ScaleManager {
    backend: Arc<dyn SerialBackend>,
    policy: ReconnectPolicy,
    inner: Mutex<ScaleInner>,
    connecting: AtomicBool,
}

impl ScaleManager {
    pub fn new(
        backend: Arc<dyn SerialBackend>,
        port: Option<String>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            backend,
            inner: Mutex::new(ScaleInner {
                port: port.as_deref().and_then(normalize_port),
                baud_rate: policy.default_baud,
                state: ConnectionState::Disconnected,
                handle: None,
                manual_override: false,
                last_attempt: None,
                rx_buf: Vec::new(),
            }),
            policy,
            connecting: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScaleInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, ScaleInner>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.policy.identity
    }

    pub fn state(&self) -> ConnectionState {
        if self.connecting.load(Ordering::Acquire) {
            return ConnectionState::Connecting;
        }
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Currently recorded port path (possibly updated by a hardware-ID rescan).
    pub fn port(&self) -> Option<String> {
        self.lock().port.clone()
    }

    /// Baud rate used by the simple open.
    pub fn baud_rate(&self) -> u32 {
        self.lock().baud_rate
    }

    /// Change the baud rate of the simple open; takes effect on the next cycle.
    pub fn set_baud_rate(&self, baud_rate: u32) {
        if baud_rate == 0 {
            warn!("Ignoring scale baud rate 0");
            return;
        }
        self.lock().baud_rate = baud_rate;
    }

    pub fn manual_override(&self) -> bool {
        self.lock().manual_override
    }

    pub fn status(&self) -> ScaleStatus {
        let connecting = self.connecting.load(Ordering::Acquire);
        let inner = self.lock();
        ScaleStatus {
            state: if connecting {
                ConnectionState::Connecting
            } else {
                inner.state
            },
            port: inner.port.clone(),
            manual_override: inner.manual_override,
        }
    }

    /// Like [`status`](Self::status), but `None` while a connect cycle or a
    /// read holds the manager.
    pub fn try_status(&self) -> Option<ScaleStatus> {
        if self.connecting.load(Ordering::Acquire) {
            return None;
        }
        let inner = self.try_lock()?;
        Some(ScaleStatus {
            state: inner.state,
            port: inner.port.clone(),
            manual_override: inner.manual_override,
        })
    }

    /// Try to get a live handle on the scale.
    ///
    /// `force` skips the throttle window and reopens even when already
    /// connected; use it for operator-initiated requests.
    pub fn connect(&self, force: bool) -> ConnectOutcome {
        let Some(_gate) = ConnectGuard::enter(&self.connecting) else {
            metrics::inc_connect_busy();
            debug!("Scale connect already in progress; returning busy");
            return ConnectOutcome::Busy;
        };
        let mut guard = self.lock();
        self.connect_locked(&mut guard, force)
    }

    /// Gates and cycle. The caller holds both the connect flag and the lock.
    fn connect_locked(&self, inner: &mut ScaleInner, force: bool) -> ConnectOutcome {
        let Some(configured) = inner.port.clone() else {
            warn!("Scale connect requested but no port is configured");
            return ConnectOutcome::Failed {
                reason: ConnectFailure::NoPortConfigured,
            };
        };

        if !force && inner.state == ConnectionState::Connected && inner.handle.is_some() {
            return ConnectOutcome::Connected { port: configured };
        }

        if !force {
            if let Some(last) = inner.last_attempt {
                if last.elapsed() < self.policy.throttle {
                    metrics::inc_connect_throttled();
                    debug!(
                        "Scale connect throttled ({:?} since last attempt)",
                        last.elapsed()
                    );
                    return ConnectOutcome::Throttled;
                }
            }
        }

        self.run_cycle(inner, &configured)
    }

    fn run_cycle(&self, inner: &mut ScaleInner, configured: &str) -> ConnectOutcome {
        metrics::inc_connect_attempts();
        inner.last_attempt = Some(Instant::now());
        self.disconnect_locked(inner);
        inner.state = ConnectionState::Connecting;
        pause(self.policy.teardown_pause);

        let mut tally = FailureTally::default();

        let baud_rate = inner.baud_rate;
        info!(
            "Connecting scale on {} ({} baud, simple mode)",
            configured, baud_rate
        );
        if let Some(handle) =
            self.try_open(configured, baud_rate, SignalLines::Untouched, &mut tally)
        {
            return self.finish_connected(inner, configured, configured.to_string(), handle);
        }

        if let Some(identity) = self.policy.identity {
            if let Some((path, handle)) = self.hardware_id_stage(identity, &mut tally) {
                return self.finish_connected(inner, configured, path, handle);
            }
        }

        info!("Scale: trying baud/signal matrix on {}", configured);
        for (baud, signals) in matrix_plan() {
            if let Some(handle) = self.try_open(configured, baud, signals, &mut tally) {
                return self.finish_connected(inner, configured, configured.to_string(), handle);
            }
        }

        inner.state = ConnectionState::Disconnected;
        let reason = tally.verdict();
        metrics::inc_connect_failures();
        warn!(
            "Scale connection failed on {}: {} ({} not found, {} denied, {} other); {}",
            configured,
            reason,
            tally.not_found,
            tally.denied,
            tally.transient,
            reason.remedy()
        );
        ConnectOutcome::Failed { reason }
    }

    fn hardware_id_stage(
        &self,
        identity: DeviceIdentity,
        tally: &mut FailureTally,
    ) -> Option<(String, Box<dyn ScaleHandle>)> {
        let rounds = self.policy.hardware_id_rounds;
        for round in 1..=rounds {
            match self.backend.enumerate() {
                Ok(candidates) => match resolve_port(identity, &candidates) {
                    Some(path) => {
                        info!(
                            "Scale {} found on {} (round {}/{})",
                            identity, path, round, rounds
                        );
                        for (baud, signals) in HARDWARE_ID_COMBOS {
                            if let Some(handle) = self.try_open(&path, baud, signals, tally) {
                                return Some((path, handle));
                            }
                        }
                    }
                    None => {
                        tally.not_found += 1;
                        debug!(
                            "Scale {} not enumerated (round {}/{}, {} ports seen)",
                            identity,
                            round,
                            rounds,
                            candidates.len()
                        );
                    }
                },
                Err(e) => {
                    tally.transient += 1;
                    warn!("Port enumeration failed (round {}/{}): {}", round, rounds, e);
                }
            }
            if round < rounds {
                pause(self.policy.rescan_backoff);
            }
        }
        None
    }

    fn try_open(
        &self,
        path: &str,
        baud_rate: u32,
        signals: SignalLines,
        tally: &mut FailureTally,
    ) -> Option<Box<dyn ScaleHandle>> {
        let params = OpenParams {
            path: path.to_string(),
            baud_rate,
            signals,
            timeout: self.policy.read_timeout,
        };
        metrics::inc_open_calls();
        match self.backend.open(&params) {
            Ok(handle) => Some(handle),
            Err(e) => {
                debug!("Open failed at {} baud ({}): {}", baud_rate, signals.label(), e);
                tally.record(&e);
                None
            }
        }
    }

    fn finish_connected(
        &self,
        inner: &mut ScaleInner,
        configured: &str,
        path: String,
        handle: Box<dyn ScaleHandle>,
    ) -> ConnectOutcome {
        if path != configured {
            info!("Scale port re-resolved: {} -> {}", configured, path);
        }
        inner.handle = Some(handle);
        inner.rx_buf.clear();
        inner.port = Some(path.clone());
        inner.state = ConnectionState::Connected;
        metrics::inc_connect_successes();
        info!("Scale connected on {}", path);
        ConnectOutcome::Connected { port: path }
    }

    /// Close the handle if one is open. Safe to call any number of times.
    pub fn disconnect(&self) {
        let mut guard = self.lock();
        self.disconnect_locked(&mut guard);
    }

    fn disconnect_locked(&self, inner: &mut ScaleInner) {
        if inner.handle.take().is_some() {
            info!(
                "Scale disconnected from {}",
                inner.port.as_deref().unwrap_or("?")
            );
        }
        inner.rx_buf.clear();
        inner.state = ConnectionState::Disconnected;
    }

    /// Operator-initiated port change.
    ///
    /// Always marks the override and drops the connection, even if `path` is
    /// the port already in use.
    /// A blank `path` clears the port.
    pub fn set_port(&self, path: &str) {
        let mut guard = self.lock();
        info!("Scale port set by operator: {:?}", path);
        guard.port = normalize_port(path);
        guard.manual_override = true;
        self.disconnect_locked(&mut guard);
    }

    /// Port pushed from the backend's stored configuration.
    ///
    /// Ignored while an operator override is in effect and the scale is
    /// connected. Returns whether the update was applied.
    pub fn apply_server_port(&self, path: &str) -> bool {
        let mut guard = self.lock();
        if guard.manual_override && guard.state == ConnectionState::Connected {
            info!(
                "Ignoring server scale port {} (operator override on {})",
                path,
                guard.port.as_deref().unwrap_or("?")
            );
            return false;
        }
        let port = normalize_port(path);
        let changed = guard.port != port;
        guard.port = port;
        guard.manual_override = false;
        if changed {
            info!("Scale port updated from server: {:?}", path);
            self.disconnect_locked(&mut guard);
        }
        true
    }

    /// Read one line from the scale, connecting first if needed.
    ///
    /// The implicit connect is non-forced, so a disconnected scale is retried at
    /// most once per throttle window. A read error drops the connection.
    ///
    /// Returns `None` straight away while a connect cycle or another read
    /// holds the manager.
    pub fn read_weight(&self, timeout: Duration) -> Option<WeightReading> {
        if self.connecting.load(Ordering::Acquire) {
            debug!("Scale connect in progress; skipping read");
            return None;
        }
        let mut guard = self.try_lock()?;
        let inner: &mut ScaleInner = &mut guard;
        if inner.state != ConnectionState::Connected || inner.handle.is_none() {
            let _gate = ConnectGuard::enter(&self.connecting)?;
            if !self.connect_locked(inner, false).is_connected() {
                return None;
            }
        }
        self.read_line_locked(inner, timeout)
    }

    fn read_line_locked(
        &self,
        inner: &mut ScaleInner,
        timeout: Duration,
    ) -> Option<WeightReading> {
        let now = Instant::now();
        // Absurd timeouts (e.g. u64::MAX seconds from the CLI) wait a day
        let deadline = now
            .checked_add(timeout)
            .unwrap_or(now + Duration::from_secs(24 * 60 * 60));
        let mut chunk = [0u8; 256];
        loop {
            while let Some(line) = take_line(&mut inner.rx_buf) {
                if !line.is_empty() {
                    debug!("Scale line: {}", escape_line(&line));
                    metrics::inc_readings();
                    return Some(WeightReading::new(line));
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            let handle = inner.handle.as_mut()?;
            match handle.read_chunk(&mut chunk) {
                Ok(0) => pause(Duration::from_millis(10)),
                Ok(n) => {
                    inner.rx_buf.extend_from_slice(&chunk[..n]);
                    if inner.rx_buf.len() > MAX_PENDING_LINE {
                        warn!(
                            "Discarding {} bytes of unterminated scale data (baud mismatch?): {}",
                            inner.rx_buf.len(),
                            escape_bytes(&inner.rx_buf, 32)
                        );
                        inner.rx_buf.clear();
                    }
                }
                Err(e) => {
                    metrics::inc_read_errors();
                    warn!("Error reading scale, disconnecting: {}", e);
                    self.disconnect_locked(inner);
                    return None;
                }
            }
        }
    }
}
