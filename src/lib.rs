//! # Scalebridge - serial scale agent for warehouse workstations
//!
//! Scalebridge keeps a USB/serial weighing scale attached and readable on a
//! packing or receiving workstation, so weights can be relayed to the
//! warehouse-management backend. Most of the work is keeping the connection
//! alive: Windows renames COM ports across replugs, cheap USB-serial chips
//! wedge, and vendor tools grab the port.
//!
//! ## Features
//!
//! - **Multi-strategy reconnect**: plain open, then VID/PID rescan, then a
//!   baud × DTR/RTS matrix, with throttling and a re-entrancy guard.
//! - **Operator override**: ports chosen at the workstation win over
//!   server-pushed configuration while connected.
//! - **Background monitor**: Tokio-driven polling that reads weights and
//!   schedules reconnects.
//! - **Backend relay**: channel commands (`set_config`, `connect_scale`,
//!   `request_ports`) applied to the manager; port lists and weights sent back.
//! - **Persistence**: last-known-good ports in a small JSON cache.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scalebridge::config::Config;
//! use scalebridge::scale::ScaleManager;
//! use scalebridge::serial::SystemSerial;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("scalebridge.toml").await?;
//!     let manager = ScaleManager::new(
//!         Arc::new(SystemSerial::new()),
//!         config.scale.port(),
//!         config.scale.policy()?,
//!     );
//!     let outcome = manager.connect(true);
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`scale`] - connection manager, reconnect strategy, weight reads
//! - [`serial`] - platform seam (enumerate/open) and VID/PID port resolver
//! - [`monitor`] - polling scheduler around a shared manager
//! - [`relay`] - backend channel frames and command handling
//! - [`config`] - TOML agent configuration
//! - [`device_cache`] - JSON cache of last-known-good ports
//! - [`instance`] - single-instance lock
//! - [`metrics`] - connection counters

pub mod config;
pub mod device_cache;
pub mod instance;
pub mod logutil;
pub mod metrics;
pub mod monitor;
pub mod relay;
pub mod scale;
pub mod serial;
