//! USB hardware identity and port resolution.
//!
//! A COM path (`COM4`, `/dev/ttyACM0`) is whatever the OS handed out last time
//! the device enumerated. The (VID, PID) pair survives replugs, so it is the
//! fallback key when the configured path has gone stale.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// USB vendor/product pair identifying a chip class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vid: u16,
    pub pid: u16,
}

impl DeviceIdentity {
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }

    /// True when the candidate reports both IDs and they match.
    pub fn matches(&self, candidate: &PortCandidate) -> bool {
        candidate.vid == Some(self.vid) && candidate.pid == Some(self.pid)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Error returned when a `vid:pid` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device identity '{0}' (expected VID:PID in hex, e.g. 0483:5740)")]
pub struct ParseIdentityError(String);

fn parse_hex_u16(s: &str) -> Option<u16> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() || digits.len() > 4 {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

impl FromStr for DeviceIdentity {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| ParseIdentityError(s.to_string()))?;
        match (parse_hex_u16(vid), parse_hex_u16(pid)) {
            (Some(vid), Some(pid)) => Ok(Self { vid, pid }),
            _ => Err(ParseIdentityError(s.to_string())),
        }
    }
}

/// One serial endpoint as reported by a single enumeration pass.
///
/// Candidates are only meaningful for the pass that produced them; the OS is
/// free to reassign paths between passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortCandidate {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PortCandidate {
    /// A port with no USB identity (built-in UART, Bluetooth, virtual COM).
    pub fn plain(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            vid: None,
            pid: None,
            description: None,
        }
    }

    pub fn usb(path: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            path: path.into(),
            vid: Some(vid),
            pid: Some(pid),
            description: None,
        }
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => Some(DeviceIdentity { vid, pid }),
            _ => None,
        }
    }
}

/// Find the path currently bound to `identity`.
///
/// First match in enumeration order wins; there is no further tie-break when
/// several identical adapters are plugged in.
pub fn resolve_port(identity: DeviceIdentity, candidates: &[PortCandidate]) -> Option<String> {
    candidates
        .iter()
        .find(|c| identity.matches(c))
        .map(|c| c.path.clone())
}

/// Find the enumerated path an operator-typed port name refers to.
///
/// Matches case-insensitively, and also accepts the Windows device-namespace
/// spelling (`\\.\COM10` for `COM10`).
pub fn resolve_by_name(requested: &str, candidates: &[PortCandidate]) -> Option<String> {
    let want = requested.trim().to_ascii_uppercase();
    if want.is_empty() {
        return None;
    }
    let namespaced = format!(r"\\.\{}", want);
    candidates
        .iter()
        .find(|c| {
            let have = c.path.to_ascii_uppercase();
            have == want || have == namespaced
        })
        .map(|c| c.path.clone())
}
