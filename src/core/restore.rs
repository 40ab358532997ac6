/// Restore Orchestrator
///
/// Replays a bundle onto the live deployment as a linear state machine:
///
/// ```text
/// START → EXTRACTED → VALIDATED → DB_RESTORING → DB_RESTORED
///       → FILESTORE_RESTORING → FILESTORE_RESTORED → ADDONS_RESTORED
///       → SERVICE_RESTARTED → DONE
/// ```
///
/// Any failure moves to ABORTED and leaves the deployment in whatever state
/// was reached. There is no rollback: the data being replaced is assumed to
/// be worse than the bundle replacing it. Nothing destructive happens before
/// VALIDATED and the confirmation gate.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::core::archive;
use crate::core::config::OpsConfig;
use crate::core::docker::ServiceControl;
use crate::core::dump_header::DumpHeader;
use crate::core::error::{OpsError, Result};
use crate::core::metadata::BackupInfo;
use crate::core::postgres::{classify_replay, Database, ReplayOutcome};
use crate::utils::{
    is_valid_db_name, BUNDLE_ADDONS_DIR, DUMP_FILE, FILESTORE_ARCHIVE, METADATA_FILE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestoreState {
    Start,
    Extracted,
    Validated,
    DbRestoring,
    DbRestored,
    FilestoreRestoring,
    FilestoreRestored,
    AddonsRestored,
    ServiceRestarted,
    Done,
    Aborted,
}

impl RestoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreState::Start => "START",
            RestoreState::Extracted => "EXTRACTED",
            RestoreState::Validated => "VALIDATED",
            RestoreState::DbRestoring => "DB_RESTORING",
            RestoreState::DbRestored => "DB_RESTORED",
            RestoreState::FilestoreRestoring => "FILESTORE_RESTORING",
            RestoreState::FilestoreRestored => "FILESTORE_RESTORED",
            RestoreState::AddonsRestored => "ADDONS_RESTORED",
            RestoreState::ServiceRestarted => "SERVICE_RESTARTED",
            RestoreState::Done => "DONE",
            RestoreState::Aborted => "ABORTED",
        }
    }

    /// States after which the live database or filestore may have been touched
    pub fn is_destructive(&self) -> bool {
        *self >= RestoreState::DbRestoring && *self != RestoreState::Aborted
    }
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed operator confirmation; returns true only for the expected answer
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str, expected: &str) -> bool;
}

/// Prompts on stderr and reads one line from stdin
pub struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&self, prompt: &str, expected: &str) -> bool {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "{}\nType '{}' to continue: ", prompt, expected);
        let _ = stderr.flush();

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => answer.trim() == expected,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Ask before destructive steps; false means the caller already agreed (`--yes`)
    pub interactive: bool,
    /// Non-interactive runs may restore a dump whose header names no database
    pub allow_unverified: bool,
    pub restore_addons: bool,
    pub restart_service: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            interactive: true,
            allow_unverified: false,
            restore_addons: true,
            restart_service: true,
        }
    }
}

/// An extracted bundle in a scratch directory that is removed on drop
pub struct OpenedBundle {
    _scratch: TempDir,
    root: PathBuf,
    pub info: Option<BackupInfo>,
    pub header: Option<DumpHeader>,
    /// Why the dump header could not be read, when it could not
    pub header_error: Option<String>,
}

impl OpenedBundle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dump_path(&self) -> PathBuf {
        self.root.join(DUMP_FILE)
    }

    pub fn filestore_archive(&self) -> PathBuf {
        self.root.join(FILESTORE_ARCHIVE)
    }

    pub fn addons_dir(&self) -> Option<PathBuf> {
        let dir = self.root.join(BUNDLE_ADDONS_DIR);
        dir.is_dir().then_some(dir)
    }
}

/// Unpack `bundle` and check that the expected contents are present
pub fn open_bundle(bundle: &Path) -> Result<OpenedBundle> {
    if !bundle.is_file() {
        return Err(OpsError::ArchiveCorrupt(format!(
            "{} does not exist or is not a file",
            bundle.display()
        )));
    }

    let beside = bundle
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let scratch = scratch_dir(&[beside.to_path_buf(), std::env::temp_dir()])?;

    archive::unpack(bundle, scratch.path()).map_err(|e| {
        OpsError::ArchiveCorrupt(format!("cannot extract {}: {}", bundle.display(), e))
    })?;

    let root = locate_root(scratch.path())?;
    for required in [DUMP_FILE, FILESTORE_ARCHIVE] {
        if !root.join(required).is_file() {
            return Err(OpsError::ArchiveCorrupt(format!(
                "{} is missing from {}",
                required,
                bundle.display()
            )));
        }
    }

    let info = {
        let path = root.join(METADATA_FILE);
        if path.is_file() {
            Some(BackupInfo::read(&path)?)
        } else {
            warn!("Bundle has no {}", METADATA_FILE);
            None
        }
    };

    let dump = root.join(DUMP_FILE);
    if let Some(expected) = info.as_ref().and_then(|i| i.dump_sha256()) {
        let actual = archive::sha256_file(&dump)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(OpsError::ArchiveCorrupt(format!(
                "{} checksum mismatch: metadata {}, actual {}",
                DUMP_FILE, expected, actual
            )));
        }
    }

    let (header, header_error) = match DumpHeader::read_file(&dump) {
        Ok(header) => (Some(header), None),
        Err(e) => (None, Some(e.to_string())),
    };

    Ok(OpenedBundle {
        _scratch: scratch,
        root,
        info,
        header,
        header_error,
    })
}

/// Scratch space in the first candidate that accepts it (bundles may sit on read-only media)
fn scratch_dir(candidates: &[PathBuf]) -> Result<TempDir> {
    let mut last_error = None;
    for dir in candidates {
        match tempfile::Builder::new()
            .prefix(".odoo-ops-restore-")
            .tempdir_in(dir)
        {
            Ok(scratch) => return Ok(scratch),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Cannot create scratch directory here");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .map(OpsError::from)
        .unwrap_or_else(|| OpsError::Config("no scratch directory candidates".to_string())))
}

/// Bundles hold one top-level directory; older ones were packed flat
fn locate_root(scratch: &Path) -> Result<PathBuf> {
    if scratch.join(DUMP_FILE).exists() {
        return Ok(scratch.to_path_buf());
    }

    let dirs: Vec<PathBuf> = std::fs::read_dir(scratch)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();

    match dirs.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(OpsError::ArchiveCorrupt("bundle is empty".to_string())),
        _ => Err(OpsError::ArchiveCorrupt(
            "bundle has several top-level directories".to_string(),
        )),
    }
}

/// Outcome of cross-checking metadata against the dump header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub metadata_name: Option<String>,
    pub dump_name: Option<String>,
    /// The target name was read from the dump itself
    pub verified: bool,
    pub target: String,
}

/// Metadata and dump must agree on the database name when both carry one
pub fn cross_check(bundle: &OpenedBundle, configured: &str) -> Result<Validation> {
    let metadata_name = bundle
        .info
        .as_ref()
        .and_then(|i| i.database())
        .map(str::to_string);
    let dump_name = bundle
        .header
        .as_ref()
        .and_then(|h| h.catalog_name())
        .map(str::to_string);

    if let (Some(metadata), Some(dump)) = (&metadata_name, &dump_name) {
        if metadata != dump {
            return Err(OpsError::BackupIntegrityMismatch {
                metadata: metadata.clone(),
                dump: dump.clone(),
            });
        }
    }

    let target = dump_name
        .clone()
        .or_else(|| metadata_name.clone())
        .unwrap_or_else(|| configured.to_string());

    if !is_valid_db_name(&target) {
        return Err(OpsError::ArchiveCorrupt(format!(
            "bundle names an unusable database '{}'",
            target
        )));
    }

    Ok(Validation {
        verified: dump_name.is_some(),
        metadata_name,
        dump_name,
        target,
    })
}

/// Run START→VALIDATED only; never touches the deployment
pub fn verify_bundle(bundle: &Path, configured: &str) -> Result<(OpenedBundle, Validation)> {
    let opened = open_bundle(bundle)?;
    let validation = cross_check(&opened, configured)?;
    Ok((opened, validation))
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub database: String,
    pub verified: bool,
    pub terminated_connections: u64,
    pub replay: ReplayOutcome,
    pub filestore_dir: PathBuf,
    pub addons_mirrored: bool,
    pub service_restarted: bool,
    pub final_state: RestoreState,
}

pub struct RestoreOrchestrator<'a> {
    config: &'a OpsConfig,
    db: &'a dyn Database,
    services: &'a dyn ServiceControl,
    confirm: &'a dyn Confirm,
    options: RestoreOptions,
    state: RestoreState,
    service_stopped: bool,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(
        config: &'a OpsConfig,
        db: &'a dyn Database,
        services: &'a dyn ServiceControl,
        confirm: &'a dyn Confirm,
        options: RestoreOptions,
    ) -> Self {
        Self {
            config,
            db,
            services,
            confirm,
            options,
            state: RestoreState::Start,
            service_stopped: false,
        }
    }

    /// Current state; ABORTED after a failed run
    pub fn state(&self) -> RestoreState {
        self.state
    }

    fn advance(&mut self, next: RestoreState) {
        info!(from = %self.state, to = %next, "Restore state");
        self.state = next;
    }

    pub async fn run(&mut self, bundle: &Path) -> Result<RestoreReport> {
        match self.run_steps(bundle).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let reached = self.state;
                self.state = RestoreState::Aborted;

                if !reached.is_destructive() {
                    error!(state = %reached, error = %e, "Restore aborted before touching the deployment");
                    if self.service_stopped {
                        warn!(service = %self.config.app_service, "Application service is stopped");
                    }
                    return Err(e);
                }

                error!(
                    state = %reached,
                    error = %e,
                    "Restore halted; the deployment is partially restored and was not rolled back"
                );
                if self.service_stopped {
                    warn!(service = %self.config.app_service, "Application service is still stopped");
                }
                Err(OpsError::RestoreHalted {
                    state: reached,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn run_steps(&mut self, bundle: &Path) -> Result<RestoreReport> {
        info!(bundle = %bundle.display(), "Starting restore");

        let opened = open_bundle(bundle)?;
        self.advance(RestoreState::Extracted);

        let validation = cross_check(&opened, &self.config.db_name)?;
        self.gate_unverified(&opened, &validation)?;
        if validation.target != self.config.db_name {
            warn!(
                bundle_db = %validation.target,
                configured_db = %self.config.db_name,
                "Bundle restores a database other than POSTGRES_DB"
            );
        }
        self.advance(RestoreState::Validated);

        let target = validation.target.clone();
        self.gate_destructive(&target)?;

        self.services.stop(&self.config.app_service).await?;
        self.service_stopped = true;

        self.advance(RestoreState::DbRestoring);
        let terminated = self
            .db
            .terminate_connections(&target)
            .await
            .map_err(db_failure)?;
        self.db.drop_database(&target).await.map_err(db_failure)?;
        self.db.create_database(&target).await.map_err(db_failure)?;

        let output = self
            .db
            .restore(&target, &opened.dump_path())
            .await
            .map_err(db_failure)?;
        let replay = classify_replay(&output);
        match &replay {
            ReplayOutcome::Clean => info!(db = %target, "Dump replayed cleanly"),
            ReplayOutcome::Tolerated { errors, sample } => warn!(
                db = %target,
                errors,
                sample = ?sample,
                "Dump replayed with per-object errors; continuing"
            ),
            ReplayOutcome::Fatal(reason) => {
                return Err(OpsError::DatabaseRestoreFailed(reason.clone()));
            }
        }
        self.advance(RestoreState::DbRestored);

        self.advance(RestoreState::FilestoreRestoring);
        let filestore_dir = self.config.filestore_dir(&target);
        archive::clear_dir(&filestore_dir).map_err(|e| {
            OpsError::FilestoreRestoreFailed(format!(
                "cannot clear {}: {}",
                filestore_dir.display(),
                e
            ))
        })?;
        archive::unpack(&opened.filestore_archive(), &filestore_dir).map_err(|e| {
            OpsError::FilestoreRestoreFailed(format!(
                "cannot extract into {}: {}",
                filestore_dir.display(),
                e
            ))
        })?;
        info!(dir = %filestore_dir.display(), "Filestore restored");
        self.advance(RestoreState::FilestoreRestored);

        let addons_mirrored = match opened.addons_dir() {
            Some(src) if self.options.restore_addons => {
                let copied = archive::mirror_tree(&src, &self.config.addons_dir)?;
                info!(dest = %self.config.addons_dir.display(), files = copied, "Custom addons mirrored");
                true
            }
            Some(_) => {
                info!("Skipping custom addons");
                false
            }
            None => false,
        };
        self.advance(RestoreState::AddonsRestored);

        let service_restarted = if self.options.restart_service {
            self.services.start(&self.config.app_service).await?;
            self.service_stopped = false;
            self.advance(RestoreState::ServiceRestarted);
            true
        } else {
            warn!(service = %self.config.app_service, "Leaving application service stopped");
            false
        };
        self.advance(RestoreState::Done);

        Ok(RestoreReport {
            database: target,
            verified: validation.verified,
            terminated_connections: terminated,
            replay,
            filestore_dir,
            addons_mirrored,
            service_restarted,
            final_state: self.state,
        })
    }

    /// A dump that does not name its database needs an explicit yes
    fn gate_unverified(&self, opened: &OpenedBundle, validation: &Validation) -> Result<()> {
        if validation.verified {
            return Ok(());
        }

        let reason = opened
            .header_error
            .clone()
            .unwrap_or_else(|| "the dump header does not name a database".to_string());
        warn!(%reason, target = %validation.target, "Cannot cross-check the bundle's database name");

        if self.options.interactive {
            let prompt = format!(
                "Cannot verify which database this dump was taken from ({}).\n\
                 It would be restored as '{}'.",
                reason, validation.target
            );
            if self.confirm.confirm(&prompt, "restore unverified") {
                return Ok(());
            }
            return Err(OpsError::ConfirmationDeclined(
                "unverified bundle not confirmed".to_string(),
            ));
        }

        if self.options.allow_unverified {
            warn!("Restoring unverified bundle (--allow-unverified)");
            Ok(())
        } else {
            Err(OpsError::ConfirmationDeclined(format!(
                "cannot verify the dump's database name ({}); rerun with --allow-unverified to restore anyway",
                reason
            )))
        }
    }

    fn gate_destructive(&self, target: &str) -> Result<()> {
        if !self.options.interactive {
            return Ok(());
        }

        let prompt = format!(
            "This will stop '{}', DROP database '{}' and replace {}.",
            self.config.app_service,
            target,
            self.config.filestore_dir(target).display()
        );
        if self.confirm.confirm(&prompt, target) {
            Ok(())
        } else {
            Err(OpsError::ConfirmationDeclined(format!(
                "restore of '{}' not confirmed",
                target
            )))
        }
    }
}

fn db_failure(e: OpsError) -> OpsError {
    match e {
        OpsError::DatabaseRestoreFailed(_) => e,
        other => OpsError::DatabaseRestoreFailed(other.to_string()),
    }
}
