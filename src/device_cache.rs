//! Last-known-good device selection, persisted as flat JSON.
//!
//! ```json
//! { "scale_port": "COM4", "printer_port": "Zebra ZD220" }
//! ```
//!
//! The file is best effort: a missing or corrupt file means "nothing cached",
//! and the whole file is rewritten on every save.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCache {
    #[serde(default)]
    pub scale_port: Option<String>,
    #[serde(default)]
    pub printer_port: Option<String>,
}

impl DeviceCache {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Guard against accidental leading NULs from previous partial writes
        let cleaned = content.trim_start_matches('\0');
        let cache: DeviceCache = serde_json::from_str(cleaned)?;
        Ok(cache)
    }

    /// Load the cache, treating any problem as an empty cache.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            debug!("No device cache at {}, starting fresh", path_ref.display());
            return Self::default();
        }
        match Self::load_from_file(path_ref) {
            Ok(cache) => {
                debug!("Loaded device cache from {}", path_ref.display());
                cache
            }
            Err(e) => {
                warn!("Ignoring unreadable device cache {}: {}", path_ref.display(), e);
                Self::default()
            }
        }
    }

    /// Write the cache via a temp file and rename so readers never see a torn file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        use std::fs::{self as sfs, File, OpenOptions};
        use std::io::Write;
        let path_ref = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;

        let dir = match path_ref.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        sfs::create_dir_all(dir)?;

        let base = path_ref
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("scalebridge_config.json");
        let mut counter = 0u32;
        let tmp_path = loop {
            let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(mut tmp) => {
                    let written = tmp.write_all(content.as_bytes()).and_then(|_| tmp.flush());
                    if let Err(e) = written {
                        drop(tmp);
                        let _ = sfs::remove_file(&candidate);
                        return Err(anyhow::anyhow!(
                            "Failed to write device cache temp file: {}",
                            e
                        ));
                    }
                    let _ = tmp.sync_all();
                    break candidate;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter = counter.saturating_add(1);
                    continue;
                }
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Failed to create temp file for device cache: {}",
                        e
                    ))
                }
            }
        };

        if let Err(e) = sfs::rename(&tmp_path, path_ref) {
            let _ = sfs::remove_file(&tmp_path);
            return Err(anyhow::anyhow!(
                "Failed to replace device cache {}: {}",
                path_ref.display(),
                e
            ));
        }
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }
        info!("Device cache saved to {}", path_ref.display());
        Ok(())
    }
}

/// Where the startup port came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    CommandLine,
    Cache,
    ConfigFile,
}

/// Pick the scale port at startup: command line, then cache, then config file.
pub fn startup_port(
    cli: Option<&str>,
    cache: &DeviceCache,
    configured: Option<String>,
) -> Option<(String, PortSource)> {
    let non_empty = |s: &str| {
        let t = s.trim();
        (!t.is_empty()).then(|| t.to_string())
    };
    cli.and_then(non_empty)
        .map(|p| (p, PortSource::CommandLine))
        .or_else(|| {
            cache
                .scale_port
                .as_deref()
                .and_then(non_empty)
                .map(|p| (p, PortSource::Cache))
        })
        .or_else(|| configured.map(|p| (p, PortSource::ConfigFile)))
}
