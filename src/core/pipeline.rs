/// Scheduled backup run: build, ship, then sweep, all under the run lock
///
/// A transfer failure does not stop the sweep. The new bundle is always
/// younger than the retention limit, so pruning after a failed ship never
/// removes the only local copy of this run.

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing::{info, warn};

use crate::core::backup::{BackupManager, Bundle};
use crate::core::config::OpsConfig;
use crate::core::error::{OpsError, Result};
use crate::core::lock::RunLock;
use crate::core::postgres::Database;
use crate::core::retention::sweep;
use crate::core::shipper::{ship, Transport};

#[derive(Debug, Clone, Copy)]
pub struct BackupOptions {
    pub ship: bool,
    pub prune: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            ship: true,
            prune: true,
        }
    }
}

/// What one run produced
#[derive(Debug)]
pub struct BackupRun {
    pub bundle: Bundle,
    pub shipped: Vec<String>,
    pub removed: Vec<PathBuf>,
    /// Set when an endpoint failed; retention still ran
    pub transfer_error: Option<OpsError>,
}

impl BackupRun {
    /// The run's overall result: a transfer failure fails it
    pub fn finish(self) -> Result<()> {
        match self.transfer_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub async fn run_backup(
    config: &OpsConfig,
    db: &dyn Database,
    transport: &dyn Transport,
    options: BackupOptions,
    now: DateTime<Local>,
) -> Result<BackupRun> {
    let _lock = RunLock::acquire(&config.lock_path(), "backup")?;

    let bundle = BackupManager::new(config, db).create_backup(now).await?;

    let mut shipped = Vec::new();
    let mut transfer_error = None;
    if options.ship {
        match ship(&bundle.path, &config.remotes, transport).await {
            Ok(report) => shipped = report.shipped,
            Err(e) => {
                warn!(error = %e, "Shipping failed; local retention still runs");
                transfer_error = Some(e);
            }
        }
    } else {
        info!("Shipping skipped");
    }

    let removed = if options.prune {
        sweep(
            &config.backup_dir,
            &config.backup_prefix,
            config.retention_days,
            SystemTime::from(now),
        )?
    } else {
        info!("Retention sweep skipped");
        Vec::new()
    };

    Ok(BackupRun {
        bundle,
        shipped,
        removed,
        transfer_error,
    })
}
