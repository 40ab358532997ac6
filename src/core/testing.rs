/// Recording fakes and fixtures shared by the builder and orchestrator tests

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Local, TimeZone};

use crate::core::archive;
use crate::core::config::OpsConfig;
use crate::core::docker::ServiceControl;
use crate::core::dump_header::fixture;
use crate::core::error::{OpsError, Result};
use crate::core::metadata::{BackupInfo, BackupKind, KEY_DATABASE};
use crate::core::postgres::{Database, ReplayOutput};
use crate::core::restore::Confirm;
use crate::utils::{
    BUNDLE_ADDONS_DIR, DEFAULT_BACKUP_CRON, DUMP_FILE, FILESTORE_ARCHIVE, METADATA_FILE,
};

pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

/// An OpsConfig rooted in a scratch directory with stock defaults
pub(crate) fn ops_config(root: &Path) -> OpsConfig {
    OpsConfig {
        project_root: root.to_path_buf(),
        env_file: root.join(".env"),
        db_name: "odoo".to_string(),
        db_user: "odoo".to_string(),
        db_password: None,
        remotes: Vec::new(),
        retention_days: 7,
        backup_dir: root.join("backups"),
        backup_prefix: "odoo_backup".to_string(),
        odoo_version: "18.0".to_string(),
        data_dir: root.join("odoo-data"),
        addons_dir: root.join("custom-addons"),
        config_dir: root.join("config"),
        db_service: "db".to_string(),
        app_service: "odoo".to_string(),
        backup_cron: DEFAULT_BACKUP_CRON.to_string(),
    }
}

/// What database name the fake writes into dump headers
#[derive(Debug, Clone)]
pub(crate) enum Catalog {
    AsRequested,
    Named(String),
    Missing,
}

pub(crate) struct FakeDatabase {
    log: CallLog,
    catalog: Catalog,
    replay: ReplayOutput,
    fail_on: Option<&'static str>,
}

impl FakeDatabase {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            log: Arc::default(),
            catalog,
            replay: ReplayOutput {
                success: true,
                stderr: String::new(),
            },
            fail_on: None,
        }
    }

    pub fn with_replay(mut self, replay: ReplayOutput) -> Self {
        self.replay = replay;
        self
    }

    pub fn failing_on(mut self, op: &'static str) -> Self {
        self.fail_on = Some(op);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str, db: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("{}:{}", op, db));
        if self.fail_on == Some(op) {
            return Err(OpsError::Command {
                program: op.to_string(),
                status: "exit status: 1".to_string(),
                stderr: format!("{} failed", op),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn dump(&self, db: &str, dest: &Path) -> Result<()> {
        self.record("dump", db)?;
        let bytes = match &self.catalog {
            Catalog::AsRequested => fixture::header(Some(db)),
            Catalog::Named(name) => fixture::header(Some(name)),
            Catalog::Missing => fixture::header(None),
        };
        fs::write(dest, bytes)?;
        Ok(())
    }

    async fn terminate_connections(&self, db: &str) -> Result<u64> {
        self.record("terminate", db)?;
        Ok(2)
    }

    async fn drop_database(&self, db: &str) -> Result<()> {
        self.record("drop", db)
    }

    async fn create_database(&self, db: &str) -> Result<()> {
        self.record("create", db)
    }

    async fn restore(&self, db: &str, _dump: &Path) -> Result<ReplayOutput> {
        self.record("restore", db)?;
        Ok(self.replay.clone())
    }
}

/// Service control writing into the same log as a FakeDatabase
pub(crate) struct FakeServices {
    log: CallLog,
}

impl FakeServices {
    pub fn sharing(db: &FakeDatabase) -> Self {
        Self {
            log: Arc::clone(&db.log),
        }
    }
}

#[async_trait]
impl ServiceControl for FakeServices {
    async fn stop(&self, service: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("stop:{}", service));
        Ok(())
    }

    async fn start(&self, service: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("start:{}", service));
        Ok(())
    }
}

/// Answers confirmations from a script and records (prompt, expected) pairs
pub(crate) struct Scripted {
    answers: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl Scripted {
    pub fn answers(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Confirm for Scripted {
    fn confirm(&self, prompt: &str, expected: &str) -> bool {
        self.prompts
            .lock()
            .unwrap()
            .push((prompt.to_string(), expected.to_string()));
        self.answers.lock().unwrap().pop_front().unwrap_or(false)
    }
}

/// Contents of a hand-assembled bundle
pub(crate) struct BundleFixture {
    pub metadata_db: Option<&'static str>,
    pub dump_db: Option<&'static str>,
    pub filestore: Vec<(&'static str, &'static str)>,
    pub addons: Option<Vec<(&'static str, &'static str)>>,
    /// Record this checksum instead of the real one
    pub sha_override: Option<String>,
    /// Write bytes that are not gzip in place of the filestore archive
    pub corrupt_filestore: bool,
}

impl Default for BundleFixture {
    fn default() -> Self {
        Self {
            metadata_db: Some("odoo"),
            dump_db: Some("odoo"),
            filestore: Vec::new(),
            addons: None,
            sha_override: None,
            corrupt_filestore: false,
        }
    }
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    fs::create_dir_all(dir).unwrap();
    for (rel, content) in files {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

/// Assemble a bundle under `dir` without going through the builder
pub(crate) fn write_bundle(dir: &Path, contents: &BundleFixture) -> PathBuf {
    let name = "odoo_backup_20261014_020000";
    let work = tempfile::TempDir::new().unwrap();
    let staging = work.path().join(name);
    fs::create_dir_all(&staging).unwrap();

    let dump = staging.join(DUMP_FILE);
    fs::write(&dump, fixture::header(contents.dump_db)).unwrap();

    let filestore_src = work.path().join("filestore");
    write_files(&filestore_src, &contents.filestore);
    if contents.corrupt_filestore {
        fs::write(staging.join(FILESTORE_ARCHIVE), b"not a gzip stream").unwrap();
    } else {
        archive::pack_dir(&filestore_src, &staging.join(FILESTORE_ARCHIVE), None).unwrap();
    }

    if let Some(addons) = &contents.addons {
        write_files(&staging.join(BUNDLE_ADDONS_DIR), addons);
    }

    let sha = contents
        .sha_override
        .clone()
        .unwrap_or_else(|| archive::sha256_file(&dump).unwrap());
    let created = Local.with_ymd_and_hms(2026, 10, 14, 2, 0, 0).unwrap();
    let mut info = BackupInfo::new(created, "", "18.0", BackupKind::Full, &sha);
    if let Some(db) = contents.metadata_db {
        info.set(KEY_DATABASE, db);
    }
    info.write(staging.join(METADATA_FILE)).unwrap();
    fs::write(staging.join(".env"), "POSTGRES_DB=odoo\n").unwrap();

    fs::create_dir_all(dir).unwrap();
    let bundle = dir.join(format!("{}.tar.gz", name));
    archive::pack_dir(&staging, &bundle, Some(name)).unwrap();
    bundle
}
