use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Lifecycle of the scale connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Why a connect call ended without a connection.
///
/// None of these are fatal to the process; the worst case is staying
/// disconnected until the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailure {
    /// No port has been configured yet.
    #[error("no scale port configured")]
    NoPortConfigured,

    /// Neither the configured path nor the hardware identity turned up.
    #[error("scale device not found")]
    DeviceNotFound,

    /// The OS refused access to the port.
    #[error("scale port busy or access denied")]
    PortBusyOrDenied,

    /// Every strategy failed for other driver-level reasons.
    #[error("scale port could not be opened")]
    TransientOpenFailure,
}

impl ConnectFailure {
    /// Operator-facing hint for the failure.
    pub fn remedy(&self) -> &'static str {
        match self {
            ConnectFailure::NoPortConfigured => "select a scale port",
            ConnectFailure::DeviceNotFound => "check the scale cable and power",
            ConnectFailure::PortBusyOrDenied => {
                "close other software using the scale port (terminal, vendor tool, second agent)"
            }
            ConnectFailure::TransientOpenFailure => "replug the scale or restart the workstation",
        }
    }
}

/// Result of [`ScaleManager::connect`](super::ScaleManager::connect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// A live handle is held on `port`.
    Connected { port: String },
    /// Another connect call is running on this manager.
    Busy,
    /// A non-forced call arrived inside the throttle window.
    Throttled,
    /// The attempt cycle ran (or was refused up front) without success.
    Failed { reason: ConnectFailure },
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::Connected { .. })
    }

    pub fn failure(&self) -> Option<ConnectFailure> {
        match self {
            ConnectOutcome::Failed { reason } => Some(*reason),
            _ => None,
        }
    }
}

/// One line received from the scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightReading {
    pub raw: String,
    pub timestamp: DateTime<Utc>,
}

impl WeightReading {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            timestamp: Utc::now(),
        }
    }

    /// First decimal number in the line, e.g. `1.250` from `ST,GS,+  1.250kg`.
    pub fn value(&self) -> Option<f64> {
        let bytes = self.raw.as_bytes();
        let start = bytes
            .iter()
            .position(|b| b.is_ascii_digit() || *b == b'-')?;
        let mut end = start + 1;
        while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
            end += 1;
        }
        self.raw[start..end].parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_numeric_weight() {
        assert_eq!(WeightReading::new("ST,GS,+  1.250kg").value(), Some(1.25));
        assert_eq!(WeightReading::new("-0.40 kg").value(), Some(-0.4));
        assert_eq!(WeightReading::new("12").value(), Some(12.0));
        assert_eq!(WeightReading::new("OL").value(), None);
        assert_eq!(WeightReading::new("--").value(), None);
    }

    #[test]
    fn outcome_helpers() {
        let ok = ConnectOutcome::Connected { port: "COM4".into() };
        assert!(ok.is_connected());
        assert_eq!(ok.failure(), None);
        let failed = ConnectOutcome::Failed {
            reason: ConnectFailure::PortBusyOrDenied,
        };
        assert!(!failed.is_connected());
        assert_eq!(failed.failure(), Some(ConnectFailure::PortBusyOrDenied));
        assert!(!ConnectOutcome::Throttled.is_connected());
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_string(&ConnectOutcome::Failed {
            reason: ConnectFailure::DeviceNotFound,
        })
        .unwrap();
        assert_eq!(json, r#"{"outcome":"failed","reason":"device_not_found"}"#);
    }
}
