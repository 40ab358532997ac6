/// Per-deployment run lock
///
/// Backup and restore both hold an exclusive advisory lock on
/// `<backup_dir>/.odoo-ops.lock` for their whole run, so a cron backup cannot
/// start while an operator is restoring (or while the previous backup still
/// runs). The lock dies with the process.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::{OpsError, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub command: String,
    pub acquired_at: String,
}

#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock or fail with `Busy` if another run holds it
    pub fn acquire(path: &Path, command: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(holder) = Self::holder(path) {
                    debug!(pid = holder.pid, command = %holder.command, "Lock held");
                }
                return Err(OpsError::Busy(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        let holder = LockHolder {
            pid: std::process::id(),
            command: command.to_string(),
            acquired_at: Utc::now().to_rfc3339(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string(&holder).unwrap_or_default().as_bytes())?;

        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Who holds (or last held) the lock, if recorded
    pub fn holder(path: &Path) -> Option<LockHolder> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "Released run lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_busy() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".odoo-ops.lock");

        let first = RunLock::acquire(&path, "backup").unwrap();
        assert!(matches!(
            RunLock::acquire(&path, "restore"),
            Err(OpsError::Busy(_))
        ));

        let holder = RunLock::holder(&path).unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.command, "backup");

        drop(first);
        assert!(RunLock::acquire(&path, "restore").is_ok());
    }

    #[test]
    fn test_creates_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("backups/.odoo-ops.lock");
        assert!(RunLock::acquire(&path, "backup").is_ok());
        assert!(path.exists());
    }
}
