//! # Backend Command Relay
//!
//! The warehouse backend drives the agent over an ActionCable channel. This
//! module is the transport-independent half of that link: it decodes channel
//! frames into [`ServerMessage`]s, applies them to the shared
//! [`ScaleManager`], and builds the [`ClientMessage`]s that go back.
//! `scalebridge start` feeds it frames read from stdin and prints replies to
//! stdout, one JSON object per line.
//!
//! ## Frames
//!
//! A command arrives either inside the broadcast envelope or at the root:
//!
//! ```json
//! {"identifier": "...", "message": {"action": "connect_scale", "port": "COM4", "baudrate": 9600}}
//! {"action": "request_ports"}
//! ```
//!
//! `welcome` and `ping` frames carry no command and are dropped. A
//! `confirm_subscription` frame is answered like `request_ports`, so the
//! backend gets a port list as soon as the channel is up.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device_cache::DeviceCache;
use crate::logutil::escape_line;
use crate::scale::{ConnectionState, ScaleManager, ScaleStatus, WeightReading};
use crate::serial::{resolve_by_name, PortCandidate, SerialBackend};

/// Commands the backend can send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Stored workstation configuration.
    SetConfig {
        #[serde(default)]
        scale_port: Option<String>,
        #[serde(default)]
        printer_port: Option<String>,
    },
    /// Operator picked a scale port in the web UI.
    ConnectScale {
        #[serde(default)]
        port: Option<String>,
        #[serde(default)]
        baudrate: Option<u32>,
    },
    DisconnectScale,
    RequestPorts,
    StartScaleReading,
    StopScaleReading,
    /// Our own ports report, echoed back by the channel.
    PortsUpdate,
    /// Printer jobs and anything newer than this agent.
    #[serde(other)]
    Unsupported,
}

/// Messages the agent sends to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    PortsUpdate(PortsReport),
    WeightUpdate {
        weight: String,
        value: Option<f64>,
        timestamp: String,
    },
}

impl ClientMessage {
    pub fn weight(reading: &WeightReading) -> Self {
        ClientMessage::WeightUpdate {
            weight: reading.raw.clone(),
            value: reading.value(),
            timestamp: reading.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortEntry {
    pub device: String,
    pub description: String,
}

impl From<&PortCandidate> for PortEntry {
    fn from(c: &PortCandidate) -> Self {
        let description = match (&c.description, c.identity()) {
            (Some(d), _) => d.clone(),
            (None, Some(id)) => format!("USB serial {}", id),
            (None, None) => "n/a".to_string(),
        };
        Self {
            device: c.path.clone(),
            description,
        }
    }
}

/// Serial ports visible on the workstation plus the agent's device selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortsReport {
    pub ports: Vec<PortEntry>,
    pub scale_port: Option<String>,
    pub scale_connected: bool,
    pub printer_port: Option<String>,
}

/// Remembers the last report sent so unchanged scans stay quiet.
#[derive(Debug, Default)]
pub struct PortWatch {
    last: Option<PortsReport>,
}

impl PortWatch {
    /// True for the first report and for any report that differs from the
    /// previous one (ports, selection or connection state).
    pub fn observe(&mut self, report: &PortsReport) -> bool {
        if self.last.as_ref() == Some(report) {
            return false;
        }
        self.last = Some(report.clone());
        true
    }
}

/// Decode one channel frame. `Ok(None)` means the frame carries no command.
pub fn parse_frame(text: &str) -> Result<Option<ServerMessage>, serde_json::Error> {
    let mut frame: Value = serde_json::from_str(text)?;
    match frame.get("type").and_then(Value::as_str) {
        Some("confirm_subscription") => return Ok(Some(ServerMessage::RequestPorts)),
        Some("welcome") | Some("ping") => return Ok(None),
        _ => {}
    }

    // Pings carry a number in `message`, so only an object with an action counts
    let nested = frame
        .get("message")
        .map_or(false, |m| m.get("action").is_some());
    let command = if nested {
        frame["message"].take()
    } else if frame.get("action").is_some() {
        frame
    } else {
        return Ok(None);
    };

    if command.get("action").and_then(Value::as_str) == Some("ping") {
        return Ok(None);
    }
    serde_json::from_value(command).map(Some)
}

/// Applies backend commands to a shared scale manager.
///
/// All methods block (port enumeration, connect cycles); async callers go
/// through `spawn_blocking`.
pub struct Relay {
    manager: Arc<ScaleManager>,
    backend: Arc<dyn SerialBackend>,
    cache_file: Option<PathBuf>,
    printer_port: Mutex<Option<String>>,
}

impl Relay {
    pub fn new(manager: Arc<ScaleManager>, backend: Arc<dyn SerialBackend>) -> Self {
        Self {
            manager,
            backend,
            cache_file: None,
            printer_port: Mutex::new(None),
        }
    }

    /// Persist device selections from `set_config` to this cache file.
    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    pub fn with_printer_port(self, printer: Option<String>) -> Self {
        *self.lock_printer() = printer;
        self
    }

    pub fn manager(&self) -> &Arc<ScaleManager> {
        &self.manager
    }

    pub fn printer_port(&self) -> Option<String> {
        self.lock_printer().clone()
    }

    fn lock_printer(&self) -> MutexGuard<'_, Option<String>> {
        self.printer_port.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn list_ports(&self) -> Vec<PortCandidate> {
        match self.backend.enumerate() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Port enumeration failed; reporting no ports: {}", e);
                Vec::new()
            }
        }
    }

    /// Current report; waits for a running connect cycle to finish.
    pub fn ports_report(&self) -> PortsReport {
        self.build_report(self.manager.status())
    }

    /// Current report, or `None` while the manager is busy.
    pub fn try_ports_report(&self) -> Option<PortsReport> {
        let status = self.manager.try_status()?;
        Some(self.build_report(status))
    }

    fn build_report(&self, status: ScaleStatus) -> PortsReport {
        let ports = self.list_ports().iter().map(PortEntry::from).collect();
        PortsReport {
            ports,
            scale_port: status.port,
            scale_connected: status.state == ConnectionState::Connected,
            printer_port: self.printer_port(),
        }
    }

    /// Decode and apply one frame, returning the replies to send.
    pub fn handle_frame(&self, text: &str) -> Vec<ClientMessage> {
        match parse_frame(text) {
            Ok(Some(msg)) => {
                debug!("Backend frame: {}", escape_line(text));
                self.handle(msg)
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Unreadable backend frame ({}): {}", e, escape_line(text));
                Vec::new()
            }
        }
    }

    pub fn handle(&self, msg: ServerMessage) -> Vec<ClientMessage> {
        match msg {
            ServerMessage::SetConfig {
                scale_port,
                printer_port,
            } => {
                info!("Configuration received from backend");
                if let Some(requested) = scale_port.as_deref().filter(|p| !p.trim().is_empty()) {
                    match resolve_by_name(requested, &self.list_ports()) {
                        Some(path) => {
                            self.manager.apply_server_port(&path);
                        }
                        None => warn!("Scale port {} from backend is not available", requested),
                    }
                }
                if let Some(printer) = printer_port.filter(|p| !p.trim().is_empty()) {
                    info!("Printer set to {}", printer);
                    *self.lock_printer() = Some(printer);
                }
                self.save_cache();
                vec![self.ports_update()]
            }
            ServerMessage::ConnectScale { port, baudrate } => {
                let Some(requested) = port.as_deref().map(str::trim).filter(|p| !p.is_empty())
                else {
                    warn!("connect_scale without a port; ignoring");
                    return Vec::new();
                };
                let path = match resolve_by_name(requested, &self.list_ports()) {
                    Some(found) => {
                        if found != requested {
                            info!("Scale port {} resolved to {}", requested, found);
                        }
                        found
                    }
                    None => {
                        warn!("Port {} is not listed; trying it directly", requested);
                        requested.to_string()
                    }
                };
                info!(
                    "Backend requested scale on {} ({} baud)",
                    path,
                    baudrate.map_or_else(|| "configured".to_string(), |b| b.to_string())
                );
                self.manager.set_port(&path);
                if let Some(baud) = baudrate {
                    self.manager.set_baud_rate(baud);
                }
                let outcome = self.manager.connect(true);
                match outcome.failure() {
                    Some(reason) => {
                        warn!("Scale connect on {} failed: {}; {}", path, reason, reason.remedy())
                    }
                    None => info!("Scale connect on {}: {:?}", path, outcome),
                }
                vec![self.ports_update()]
            }
            ServerMessage::DisconnectScale => {
                info!("Backend requested scale disconnect");
                self.manager.disconnect();
                vec![self.ports_update()]
            }
            ServerMessage::RequestPorts => vec![self.ports_update()],
            ServerMessage::StartScaleReading | ServerMessage::StopScaleReading => {
                // The monitor reads whenever the scale is connected
                info!("Backend toggled scale reading ({:?})", msg);
                Vec::new()
            }
            ServerMessage::PortsUpdate => Vec::new(),
            ServerMessage::Unsupported => {
                warn!("Unsupported backend action; ignoring");
                Vec::new()
            }
        }
    }

    fn ports_update(&self) -> ClientMessage {
        ClientMessage::PortsUpdate(self.ports_report())
    }

    fn save_cache(&self) {
        let Some(path) = &self.cache_file else {
            return;
        };
        let mut cache = DeviceCache::load_or_default(path);
        if let Some(port) = self.manager.port() {
            cache.scale_port = Some(port);
        }
        if let Some(printer) = self.printer_port() {
            cache.printer_port = Some(printer);
        }
        if let Err(e) = cache.save_to_file(path) {
            warn!("Could not save device cache: {}", e);
        }
    }
}
