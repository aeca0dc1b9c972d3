//! # Configuration Management Module
//!
//! Agent configuration lives in a TOML file next to the binary (default
//! `scalebridge.toml`). It is read once at startup; the runtime port choice
//! that changes during operation is kept separately in the JSON
//! [`DeviceCache`](crate::device_cache::DeviceCache).
//!
//! ## Configuration Structure
//!
//! - [`AgentConfig`] - station identity and file locations
//! - [`ScaleConfig`] - scale port and reconnection tuning
//! - [`MonitorConfig`] - polling cadence of the background monitor
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [agent]
//! station_id = "packing-01"
//! cache_file = "scalebridge_config.json"
//! lock_file = "scalebridge.lock"
//!
//! [scale]
//! port = "COM3"
//! baud_rate = 9600
//! device_id = "0483:5740"
//! hardware_id_rounds = 5
//! rescan_backoff_ms = 2000
//! throttle_secs = 10
//!
//! [monitor]
//! poll_interval_ms = 500
//! reconnect_interval_secs = 15
//! port_scan_ms = 5000
//!
//! [logging]
//! level = "info"
//! file = "scalebridge.log"
//! ```
//!
//! CLI flags take precedence over the file; the file over built-in defaults.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::scale::ReconnectPolicy;
use crate::serial::DeviceIdentity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub scale: ScaleConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name this workstation reports itself as in logs and status output.
    pub station_id: String,
    /// JSON file holding the last-known-good scale/printer ports.
    pub cache_file: String,
    /// Lock file that keeps a second agent off the same ports.
    pub lock_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleConfig {
    /// Serial path of the scale (`COM3`, `/dev/ttyACM0`). Empty means unset.
    pub port: String,
    /// Baud rate for the plain open of `port`.
    pub baud_rate: u32,
    /// USB identity (`VID:PID`, hex) used to find the scale after a rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default = "default_hardware_id_rounds")]
    pub hardware_id_rounds: u32,
    #[serde(default = "default_rescan_backoff_ms")]
    pub rescan_backoff_ms: u64,
    /// Minimum seconds between automatic (non-forced) connect attempts.
    #[serde(default = "default_throttle_secs")]
    pub throttle_secs: u64,
    /// Pause after closing a handle before reopening (ms).
    #[serde(default = "default_teardown_pause_ms")]
    pub teardown_pause_ms: u64,
    /// Read timeout applied to the opened port (ms).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_hardware_id_rounds() -> u32 {
    5
}
fn default_rescan_backoff_ms() -> u64 {
    2000
}
fn default_throttle_secs() -> u64 {
    10
}
fn default_teardown_pause_ms() -> u64 {
    500
}
fn default_read_timeout_ms() -> u64 {
    100
}

impl ScaleConfig {
    /// The configured port, or `None` when left blank.
    pub fn port(&self) -> Option<String> {
        let p = self.port.trim();
        if p.is_empty() {
            None
        } else {
            Some(p.to_string())
        }
    }

    pub fn identity(&self) -> Result<Option<DeviceIdentity>> {
        match self.device_id.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => Ok(Some(s.parse()?)),
        }
    }

    /// Build the reconnection policy from these settings.
    pub fn policy(&self) -> Result<ReconnectPolicy> {
        if self.baud_rate == 0 {
            return Err(anyhow!("scale.baud_rate must be greater than zero"));
        }
        if self.hardware_id_rounds == 0 {
            return Err(anyhow!("scale.hardware_id_rounds must be at least 1"));
        }
        Ok(ReconnectPolicy {
            default_baud: self.baud_rate,
            identity: self.identity()?,
            hardware_id_rounds: self.hardware_id_rounds,
            rescan_backoff: Duration::from_millis(self.rescan_backoff_ms),
            throttle: Duration::from_secs(self.throttle_secs),
            teardown_pause: Duration::from_millis(self.teardown_pause_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Tick of the monitor loop (ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long one read waits for a line (ms).
    #[serde(default = "default_monitor_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Minimum seconds between automatic reconnect attempts.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Re-send an unchanged reading after this many seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Interval between port-list scans for change reports (ms); 0 disables them.
    #[serde(default = "default_port_scan_ms")]
    pub port_scan_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_monitor_read_timeout_ms() -> u64 {
    1000
}
fn default_reconnect_interval_secs() -> u64 {
    15
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_port_scan_ms() -> u64 {
    5000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_monitor_read_timeout_ms(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            port_scan_ms: default_port_scan_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.scale.policy().map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            agent: AgentConfig {
                station_id: "station-01".to_string(),
                cache_file: "scalebridge_config.json".to_string(),
                lock_file: "scalebridge.lock".to_string(),
            },
            scale: ScaleConfig {
                port: String::new(),
                baud_rate: 9600,
                device_id: Some("0483:5740".to_string()),
                hardware_id_rounds: default_hardware_id_rounds(),
                rescan_backoff_ms: default_rescan_backoff_ms(),
                throttle_secs: default_throttle_secs(),
                teardown_pause_ms: default_teardown_pause_ms(),
                read_timeout_ms: default_read_timeout_ms(),
            },
            monitor: MonitorConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("scalebridge.log".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.scale.baud_rate, 9600);
        assert_eq!(back.scale.device_id.as_deref(), Some("0483:5740"));
        assert_eq!(back.monitor.reconnect_interval_secs, 15);
        assert_eq!(back.agent.cache_file, "scalebridge_config.json");
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = Config::default().scale.policy().unwrap();
        assert_eq!(policy.default_baud, 9600);
        assert_eq!(policy.identity, Some(DeviceIdentity::new(0x0483, 0x5740)));
        assert_eq!(policy.hardware_id_rounds, 5);
        assert_eq!(policy.throttle, Duration::from_secs(10));
        assert_eq!(policy.rescan_backoff, Duration::from_secs(2));
    }

    #[test]
    fn minimal_scale_section_uses_defaults() {
        let text = r#"
            [agent]
            station_id = "dock"
            cache_file = "c.json"
            lock_file = "l.lock"

            [scale]
            port = " COM7 "
            baud_rate = 115200

            [logging]
            level = "debug"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.scale.port(), Some("COM7".to_string()));
        assert_eq!(cfg.scale.identity().unwrap(), None);
        assert_eq!(cfg.scale.throttle_secs, 10);
        assert_eq!(cfg.monitor.poll_interval_ms, 500);
        assert_eq!(cfg.logging.level_filter(), log::LevelFilter::Debug);
        assert!(cfg.logging.file.is_none());
    }

    #[test]
    fn partial_monitor_section_fills_missing_fields() {
        let text = r#"
            [agent]
            station_id = "dock"
            cache_file = "c.json"
            lock_file = "l.lock"

            [scale]
            port = "COM7"
            baud_rate = 9600

            [monitor]
            poll_interval_ms = 250

            [logging]
            level = "info"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.monitor.poll_interval_ms, 250);
        assert_eq!(cfg.monitor.read_timeout_ms, 1000);
        assert_eq!(cfg.monitor.reconnect_interval_secs, 15);
        assert_eq!(cfg.monitor.heartbeat_secs, 30);
        assert_eq!(cfg.monitor.port_scan_ms, 5000);
    }

    #[test]
    fn blank_port_is_unset() {
        let mut cfg = Config::default();
        cfg.scale.port = "   ".into();
        assert_eq!(cfg.scale.port(), None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = Config::default();
        cfg.scale.device_id = Some("not-an-id".into());
        assert!(cfg.scale.policy().is_err());

        let mut cfg = Config::default();
        cfg.scale.hardware_id_rounds = 0;
        assert!(cfg.scale.policy().is_err());

        let mut cfg = Config::default();
        cfg.scale.baud_rate = 0;
        assert!(cfg.scale.policy().is_err());
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let logging = LoggingConfig {
            level: "loud".into(),
            file: None,
        };
        assert_eq!(logging.level_filter(), log::LevelFilter::Info);
    }
}
