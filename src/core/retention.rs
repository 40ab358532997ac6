/// Retention Sweeper: prune local bundles past their age limit
///
/// Local only. Remote retention belongs to whoever runs the remote.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info};

use crate::core::error::Result;
use crate::utils::{BUNDLE_EXTENSION, PARTIAL_SUFFIX};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A local bundle file and its age
#[derive(Debug, Clone)]
pub struct LocalBundle {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub partial: bool,
}

impl LocalBundle {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.modified).unwrap_or_default()
    }
}

fn is_bundle_name(name: &str, prefix: &str) -> Option<bool> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    if rest.ends_with(BUNDLE_EXTENSION) {
        Some(false)
    } else if rest.ends_with(&format!("{}{}", BUNDLE_EXTENSION, PARTIAL_SUFFIX)) {
        Some(true)
    } else {
        None
    }
}

/// Bundles (complete and leftover partial) directly under `dir`, oldest first
pub fn list_bundles(dir: &Path, prefix: &str) -> Result<Vec<LocalBundle>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut bundles = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(partial) = is_bundle_name(&name, prefix) else {
            continue;
        };
        let metadata = entry.metadata()?;
        bundles.push(LocalBundle {
            path: entry.path(),
            size: metadata.len(),
            modified: metadata.modified()?,
            partial,
        });
    }

    bundles.sort_by_key(|b| b.modified);
    Ok(bundles)
}

/// Delete bundles whose modification time is more than `max_age_days` before `now`.
/// A limit of zero keeps everything.
pub fn sweep(dir: &Path, prefix: &str, max_age_days: u32, now: SystemTime) -> Result<Vec<PathBuf>> {
    if max_age_days == 0 {
        debug!("Retention disabled; nothing swept");
        return Ok(Vec::new());
    }

    let limit = DAY * max_age_days;
    let mut deleted = Vec::new();

    for bundle in list_bundles(dir, prefix)? {
        if bundle.age(now) > limit {
            match fs::remove_file(&bundle.path) {
                Ok(()) => {}
                // Someone else got there first; still gone
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            info!(bundle = %bundle.path.display(), "Removed expired bundle");
            deleted.push(bundle.path);
        }
    }

    Ok(deleted)
}
