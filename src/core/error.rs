/// Error taxonomy for backup, transfer, restore and scheduling
///
/// Each variant maps to a distinct process exit code so cron wrappers and
/// operators can tell failure classes apart.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::restore::RestoreState;

pub type Result<T> = std::result::Result<T, OpsError>;

/// One endpoint that failed during shipping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub endpoint: String,
    pub reason: String,
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("Bundle is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error(
        "Backup integrity mismatch: metadata names database '{metadata}' but the dump was taken from '{dump}'"
    )]
    BackupIntegrityMismatch { metadata: String, dump: String },

    #[error("Transfer failed for {} endpoint(s): {}", .failures.len(), join_failures(.failures))]
    TransferFailed { failures: Vec<TransferFailure> },

    #[error("Database restore failed: {0}")]
    DatabaseRestoreFailed(String),

    #[error("Filestore restore failed: {0}")]
    FilestoreRestoreFailed(String),

    #[error("A backup schedule is already installed: {0}")]
    ScheduleAlreadyExists(String),

    #[error("Operation declined: {0}")]
    ConfirmationDeclined(String),

    #[error("Another backup or restore is running (lock held on {})", .0.display())]
    Busy(PathBuf),

    #[error("Backup failed while {step}: {reason}")]
    BackupFailed { step: &'static str, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Restore halted after {state}: {source}")]
    RestoreHalted {
        state: RestoreState,
        #[source]
        source: Box<OpsError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn join_failures(failures: &[TransferFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl OpsError {
    pub fn backup_failed(step: &'static str, reason: impl fmt::Display) -> Self {
        OpsError::BackupFailed {
            step,
            reason: reason.to_string(),
        }
    }

    /// Process exit code for this failure class
    pub fn exit_code(&self) -> u8 {
        match self {
            OpsError::ScheduleAlreadyExists(_) => 0,
            OpsError::Config(_) | OpsError::Command { .. } | OpsError::Io(_) => 1,
            OpsError::ArchiveCorrupt(_) => 2,
            OpsError::BackupIntegrityMismatch { .. } => 3,
            OpsError::TransferFailed { .. } => 4,
            OpsError::DatabaseRestoreFailed(_) => 5,
            OpsError::FilestoreRestoreFailed(_) => 6,
            OpsError::ConfirmationDeclined(_) => 7,
            OpsError::Busy(_) => 8,
            OpsError::BackupFailed { .. } => 9,
            OpsError::RestoreHalted { source, .. } => source.exit_code(),
        }
    }

    /// Innermost error, looking through `RestoreHalted`
    pub fn root(&self) -> &OpsError {
        match self {
            OpsError::RestoreHalted { source, .. } => source.root(),
            other => other,
        }
    }
}
