//! Single-instance guard.
//!
//! Two agents on one workstation fight over the COM port and each sees the
//! other as "access denied". An exclusive lock on a well-known file makes the
//! second agent fail at startup instead.

use anyhow::{anyhow, Result};
use fs2::FileExt;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Held for the lifetime of the agent; the lock is released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock at `path` or fail immediately if another process holds it.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| anyhow!("Failed to open lock file {}: {}", path.display(), e))?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.trim();
            return Err(anyhow!(
                "Another scalebridge instance is running (lock {}, pid {})",
                path.display(),
                if holder.is_empty() { "unknown" } else { holder }
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        info!("Instance lock acquired at {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Instance lock released at {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_rejected_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");

        let first = InstanceLock::acquire(&path).expect("first lock");
        let pid = std::fs::read_to_string(first.path()).unwrap();
        assert_eq!(pid, std::process::id().to_string());

        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("Another scalebridge instance"));

        drop(first);
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
