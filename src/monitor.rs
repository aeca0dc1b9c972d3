//! Background scale monitor.
//!
//! The monitor owns the polling cadence around a shared [`ScaleManager`]:
//! while connected it reads a line every tick and forwards changed readings;
//! while disconnected it asks for a reconnect at most once per reconnect
//! interval. All manager calls block, so they run on Tokio's blocking pool.
//!
//! The decision of *what* to do on a tick is [`ScaleMonitor::next_action`], a
//! plain function of time and connection state, so the policy can be tested
//! without a runtime.
//!
//! With [`ScaleMonitor::with_port_reports`] the monitor also rescans the
//! serial ports every `port_scan_ms` and emits a [`PortsReport`] whenever the
//! port list or the scale's connection state changed since the last one.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::config::MonitorConfig;
use crate::relay::{PortWatch, PortsReport, Relay};
use crate::scale::{ConnectOutcome, ScaleManager, WeightReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Connected: read one line.
    Read,
    /// Disconnected and the reconnect interval has elapsed.
    Reconnect,
    /// Disconnected, still waiting out the reconnect interval.
    Idle,
}

/// Counters returned when the monitor stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSummary {
    pub ticks: u64,
    pub reads: u64,
    pub forwarded: u64,
    pub reconnects: u64,
    pub port_reports: u64,
}

pub struct ScaleMonitor {
    poll_interval: Duration,
    read_timeout: Duration,
    reconnect_interval: Duration,
    heartbeat: Duration,
    last_reconnect: Option<Instant>,
    last_sent: Option<(String, Instant)>,
    port_scan_interval: Option<Duration>,
    last_scan: Option<Instant>,
    port_watch: PortWatch,
    reports: Option<(Arc<Relay>, mpsc::Sender<PortsReport>)>,
}

impl ScaleMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs),
            heartbeat: Duration::from_secs(config.heartbeat_secs),
            last_reconnect: None,
            last_sent: None,
            port_scan_interval: (config.port_scan_ms > 0)
                .then(|| Duration::from_millis(config.port_scan_ms)),
            last_scan: None,
            port_watch: PortWatch::default(),
            reports: None,
        }
    }

    /// Scan ports through `relay` and send changed reports to `sink`.
    pub fn with_port_reports(mut self, relay: Arc<Relay>, sink: mpsc::Sender<PortsReport>) -> Self {
        self.reports = Some((relay, sink));
        self
    }

    /// Decide what this tick should do. Records the reconnect time when it
    /// returns [`MonitorAction::Reconnect`].
    pub fn next_action(&mut self, now: Instant, connected: bool) -> MonitorAction {
        if connected {
            return MonitorAction::Read;
        }
        let due = match self.last_reconnect {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.reconnect_interval,
        };
        if due {
            self.last_reconnect = Some(now);
            MonitorAction::Reconnect
        } else {
            MonitorAction::Idle
        }
    }

    /// Whether `reading` should go downstream: a changed value always does, an
    /// unchanged one only once the heartbeat interval has passed.
    pub fn should_forward(&mut self, reading: &WeightReading, now: Instant) -> bool {
        let send = match &self.last_sent {
            None => true,
            Some((raw, at)) => {
                raw != &reading.raw || now.saturating_duration_since(*at) >= self.heartbeat
            }
        };
        if send {
            self.last_sent = Some((reading.raw.clone(), now));
        }
        send
    }

    /// Whether a port scan is due. Records the scan time when it is.
    pub fn scan_due(&mut self, now: Instant) -> bool {
        let Some(interval) = self.port_scan_interval else {
            return false;
        };
        let due = match self.last_scan {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= interval,
        };
        if due {
            self.last_scan = Some(now);
        }
        due
    }

    async fn scan_ports(&mut self, summary: &mut MonitorSummary) -> anyhow::Result<()> {
        let Some((relay, sink)) = self.reports.clone() else {
            return Ok(());
        };
        let report = tokio::task::spawn_blocking(move || relay.try_ports_report()).await?;
        let Some(report) = report else {
            debug!("Scale busy; port scan skipped");
            return Ok(());
        };
        if self.port_watch.observe(&report) {
            debug!("Port list changed ({} ports)", report.ports.len());
            if sink.send(report).await.is_err() {
                debug!("Port report sink closed; scans stopped");
                self.reports = None;
            } else {
                summary.port_reports += 1;
            }
        }
        Ok(())
    }

    /// Drive the manager until `shutdown` turns true or `sink` is closed.
    pub async fn run(
        mut self,
        manager: Arc<ScaleManager>,
        sink: mpsc::Sender<WeightReading>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<MonitorSummary> {
        let mut summary = MonitorSummary::default();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Scale monitor started (poll {:?}, reconnect every {:?})",
            self.poll_interval, self.reconnect_interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            summary.ticks += 1;

            let connected = manager.is_connected();
            match self.next_action(Instant::now(), connected) {
                MonitorAction::Read => {
                    let m = manager.clone();
                    let timeout = self.read_timeout;
                    let reading =
                        tokio::task::spawn_blocking(move || m.read_weight(timeout)).await?;
                    summary.reads += 1;
                    if let Some(reading) = reading {
                        if self.should_forward(&reading, Instant::now()) {
                            if sink.send(reading).await.is_err() {
                                debug!("Reading sink closed; stopping monitor");
                                break;
                            }
                            summary.forwarded += 1;
                        }
                    }
                }
                MonitorAction::Reconnect => {
                    let m = manager.clone();
                    let outcome = tokio::task::spawn_blocking(move || m.connect(false)).await?;
                    summary.reconnects += 1;
                    match outcome {
                        ConnectOutcome::Connected { port } => {
                            info!("Monitor: scale online on {}", port)
                        }
                        ConnectOutcome::Failed { reason } => {
                            warn!("Monitor: scale offline ({}; {})", reason, reason.remedy())
                        }
                        other => debug!("Monitor: reconnect skipped ({:?})", other),
                    }
                }
                MonitorAction::Idle => {}
            }

            if self.reports.is_some() && self.scan_due(Instant::now()) {
                self.scan_ports(&mut summary).await?;
            }
        }

        info!(
            "Scale monitor stopped after {} ticks ({} readings forwarded)",
            summary.ticks, summary.forwarded
        );
        Ok(summary)
    }
}
