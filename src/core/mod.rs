pub mod archive;
pub mod backup;
pub mod config;
pub mod docker;
pub mod dump_header;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod pipeline;
pub mod postgres;
pub mod restore;
pub mod retention;
pub mod schedule;
pub mod shipper;

#[cfg(test)]
pub(crate) mod testing;

pub use backup::BackupManager;
pub use config::{ConfigManager, OpsConfig};
pub use docker::DockerManager;
pub use error::{OpsError, Result};
pub use restore::RestoreOrchestrator;
