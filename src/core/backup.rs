/// Archive Builder: produce one self-contained bundle per run
///
/// Layout of `<prefix>_<YYYYMMDD_HHMMSS>.tar.gz`:
///
/// ```text
/// <prefix>_<ts>/
///   database.dump        pg_dump custom format
///   filestore.tar.gz     attachments of the dumped database
///   backup_info.txt      metadata record
///   .env                 deployment environment
///   config/              optional
///   custom-addons/       optional
/// ```
///
/// Parts are assembled in a staging directory, packed to `<name>.partial` and
/// renamed into place, so a bundle with the final name is always complete.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::core::archive;
use crate::core::config::OpsConfig;
use crate::core::dump_header::DumpHeader;
use crate::core::error::{OpsError, Result};
use crate::core::metadata::{BackupInfo, BackupKind};
use crate::core::postgres::Database;
use crate::utils::{
    BUNDLE_ADDONS_DIR, BUNDLE_CONFIG_DIR, BUNDLE_ENV_FILE, BUNDLE_EXTENSION,
    BUNDLE_TIMESTAMP_FORMAT, DUMP_FILE, FILESTORE_ARCHIVE, METADATA_FILE, PARTIAL_SUFFIX,
};

/// A finished bundle on local disk
#[derive(Debug, Clone)]
pub struct Bundle {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub info: BackupInfo,
}

/// Staging directory removed on drop, success or not
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(path: PathBuf) -> Result<Self> {
        fs::create_dir(&path).map_err(|e| {
            OpsError::backup_failed("creating staging directory", format!("{}: {}", path.display(), e))
        })?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Could not remove staging directory");
        }
    }
}

/// Half-written archive, deleted unless committed
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn commit(mut self, dest: &Path) -> Result<()> {
        fs::rename(&self.path, dest)
            .map_err(|e| OpsError::backup_failed("finalizing bundle", e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub fn bundle_name(prefix: &str, created: DateTime<Local>) -> String {
    format!("{}_{}", prefix, created.format(BUNDLE_TIMESTAMP_FORMAT))
}

pub struct BackupManager<'a> {
    config: &'a OpsConfig,
    db: &'a dyn Database,
}

impl<'a> BackupManager<'a> {
    pub fn new(config: &'a OpsConfig, db: &'a dyn Database) -> Self {
        Self { config, db }
    }

    /// Build a bundle stamped with `created`
    pub async fn create_backup(&self, created: DateTime<Local>) -> Result<Bundle> {
        let config = self.config;
        let db_name = config.db_name.as_str();
        let name = bundle_name(&config.backup_prefix, created);

        fs::create_dir_all(&config.backup_dir)
            .map_err(|e| OpsError::backup_failed("creating backup directory", e))?;

        let dest = config.backup_dir.join(format!("{}{}", name, BUNDLE_EXTENSION));
        if dest.exists() {
            return Err(OpsError::backup_failed(
                "naming bundle",
                format!("{} already exists", dest.display()),
            ));
        }

        info!(db = db_name, bundle = %dest.display(), "Creating backup");
        let staging = StagingDir::create(config.backup_dir.join(format!(".{}", name)))?;

        // 1. database
        let dump = staging.path().join(DUMP_FILE);
        self.db
            .dump(db_name, &dump)
            .await
            .map_err(|e| OpsError::backup_failed("dumping database", e))?;
        check_dump(&dump, db_name)?;
        let dump_sha256 = archive::sha256_file(&dump)
            .map_err(|e| OpsError::backup_failed("hashing dump", e))?;
        debug!(sha256 = %dump_sha256, "Dump hashed");

        // 2. filestore
        let filestore_src = config.filestore_dir(db_name);
        let filestore_dest = staging.path().join(FILESTORE_ARCHIVE);
        let packed = if filestore_src.is_dir() {
            debug!(dir = %filestore_src.display(), bytes = archive::tree_size(&filestore_src), "Archiving filestore");
            archive::pack_dir(&filestore_src, &filestore_dest, None)
        } else {
            warn!(dir = %filestore_src.display(), "No filestore found; bundling an empty one");
            archive::pack_empty(&filestore_dest)
        };
        packed.map_err(|e| OpsError::backup_failed("archiving filestore", e))?;

        // 3. deployment files
        fs::copy(&config.env_file, staging.path().join(BUNDLE_ENV_FILE)).map_err(|e| {
            OpsError::backup_failed(
                "copying environment file",
                format!("{}: {}", config.env_file.display(), e),
            )
        })?;
        copy_optional(&config.config_dir, &staging.path().join(BUNDLE_CONFIG_DIR), "configuration")?;
        copy_optional(&config.addons_dir, &staging.path().join(BUNDLE_ADDONS_DIR), "custom addons")?;

        // 4. metadata
        let info = BackupInfo::new(
            created,
            db_name,
            &config.odoo_version,
            BackupKind::Full,
            &dump_sha256,
        );
        info.write(staging.path().join(METADATA_FILE))
            .map_err(|e| OpsError::backup_failed("writing metadata", e))?;

        // 5. pack and publish
        let partial = PartialFile {
            path: config
                .backup_dir
                .join(format!("{}{}{}", name, BUNDLE_EXTENSION, PARTIAL_SUFFIX)),
            committed: false,
        };
        archive::pack_dir(staging.path(), &partial.path, Some(&name))
            .map_err(|e| OpsError::backup_failed("packing bundle", e))?;
        partial.commit(&dest)?;

        let size = fs::metadata(&dest)?.len();
        info!(bundle = %dest.display(), size, "Backup created");

        Ok(Bundle {
            path: dest,
            name,
            size,
            info,
        })
    }
}

/// The dump must be a custom-format archive of the database we asked for
fn check_dump(dump: &Path, db_name: &str) -> Result<()> {
    let header = DumpHeader::read_file(dump)
        .map_err(|e| OpsError::backup_failed("verifying dump", e))?;

    match header.catalog_name() {
        Some(name) if name != db_name => Err(OpsError::backup_failed(
            "verifying dump",
            format!("dump names database '{}', expected '{}'", name, db_name),
        )),
        Some(_) => Ok(()),
        None => {
            warn!("Dump header does not name its database");
            Ok(())
        }
    }
}

fn copy_optional(src: &Path, dest: &Path, what: &'static str) -> Result<()> {
    if !src.is_dir() {
        warn!(dir = %src.display(), "No {} directory; leaving it out of the bundle", what);
        return Ok(());
    }
    let copied = archive::copy_tree(src, dest)
        .map_err(|e| OpsError::backup_failed("copying deployment files", format!("{}: {}", what, e)))?;
    debug!(what, files = copied, "Copied into bundle");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::restore::verify_bundle;
    use crate::core::testing::{ops_config, Catalog, FakeDatabase};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn deployment(root: &Path) -> OpsConfig {
        let config = ops_config(root);
        fs::write(&config.env_file, "POSTGRES_DB=odoo\nPOSTGRES_PASSWORD=s3cret\n").unwrap();
        let filestore = config.filestore_dir("odoo");
        fs::create_dir_all(filestore.join("3f")).unwrap();
        fs::write(filestore.join("3f/3fa2c1"), b"attachment").unwrap();
        fs::create_dir_all(&config.config_dir).unwrap();
        fs::write(config.config_dir.join("odoo.conf"), "[options]\n").unwrap();
        config
    }

    fn created() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 14, 2, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_bundle_verifies_after_build() {
        let tmp = TempDir::new().unwrap();
        let config = deployment(tmp.path());
        let db = FakeDatabase::new(Catalog::AsRequested);

        let bundle = BackupManager::new(&config, &db)
            .create_backup(created())
            .await
            .unwrap();

        assert_eq!(bundle.name, "odoo_backup_20261014_020000");
        assert_eq!(
            bundle.path,
            config.backup_dir.join("odoo_backup_20261014_020000.tar.gz")
        );
        assert_eq!(db.calls(), vec!["dump:odoo"]);

        let (opened, validation) = verify_bundle(&bundle.path, "odoo").unwrap();
        assert!(validation.verified);
        assert_eq!(validation.metadata_name.as_deref(), Some("odoo"));
        assert_eq!(validation.dump_name.as_deref(), Some("odoo"));
        assert_eq!(opened.root().file_name().unwrap(), "odoo_backup_20261014_020000");
        assert!(opened.root().join(".env").is_file());
        assert!(opened.root().join("config/odoo.conf").is_file());
        // optional and absent
        assert!(opened.addons_dir().is_none());

        let restored = tmp.path().join("restored");
        archive::unpack(&opened.filestore_archive(), &restored).unwrap();
        assert_eq!(fs::read(restored.join("3f/3fa2c1")).unwrap(), b"attachment");
    }

    #[tokio::test]
    async fn test_no_leftovers_after_success() {
        let tmp = TempDir::new().unwrap();
        let config = deployment(tmp.path());
        let db = FakeDatabase::new(Catalog::AsRequested);

        BackupManager::new(&config, &db)
            .create_backup(created())
            .await
            .unwrap();

        let names: Vec<String> = fs::read_dir(&config.backup_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["odoo_backup_20261014_020000.tar.gz"]);
    }

    #[tokio::test]
    async fn test_missing_filestore_bundles_empty_archive() {
        let tmp = TempDir::new().unwrap();
        let config = deployment(tmp.path());
        fs::remove_dir_all(config.filestore_dir("odoo")).unwrap();
        let db = FakeDatabase::new(Catalog::AsRequested);

        let bundle = BackupManager::new(&config, &db)
            .create_backup(created())
            .await
            .unwrap();

        let (opened, _) = verify_bundle(&bundle.path, "odoo").unwrap();
        let restored = tmp.path().join("restored");
        archive::unpack(&opened.filestore_archive(), &restored).unwrap();
        assert_eq!(fs::read_dir(&restored).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_database_in_dump_fails_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let config = deployment(tmp.path());
        let db = FakeDatabase::new(Catalog::Named("odoo_staging".into()));

        let err = BackupManager::new(&config, &db)
            .create_backup(created())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::BackupFailed { step: "verifying dump", .. }));
        assert_eq!(fs::read_dir(&config.backup_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unnamed_dump_is_bundled_unverified() {
        let tmp = TempDir::new().unwrap();
        let config = deployment(tmp.path());
        let db = FakeDatabase::new(Catalog::Missing);

        let bundle = BackupManager::new(&config, &db)
            .create_backup(created())
            .await
            .unwrap();

        let (_, validation) = verify_bundle(&bundle.path, "odoo").unwrap();
        assert!(!validation.verified);
        assert_eq!(validation.metadata_name.as_deref(), Some("odoo"));
        assert_eq!(validation.target, "odoo");
    }

    #[tokio::test]
    async fn test_dump_failure_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let config = deployment(tmp.path());
        let db = FakeDatabase::new(Catalog::AsRequested).failing_on("dump");

        let err = BackupManager::new(&config, &db)
            .create_backup(created())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 9);
        assert_eq!(fs::read_dir(&config.backup_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_env_file_fails() {
        let tmp = TempDir::new().unwrap();
        let config = deployment(tmp.path());
        fs::remove_file(&config.env_file).unwrap();
        let db = FakeDatabase::new(Catalog::AsRequested);

        let err = BackupManager::new(&config, &db)
            .create_backup(created())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OpsError::BackupFailed { step: "copying environment file", .. }
        ));
    }

    #[tokio::test]
    async fn test_name_collision_is_refused() {
        let tmp = TempDir::new().unwrap();
        let config = deployment(tmp.path());
        let db = FakeDatabase::new(Catalog::AsRequested);
        let manager = BackupManager::new(&config, &db);

        manager.create_backup(created()).await.unwrap();
        let err = manager.create_backup(created()).await.unwrap_err();
        assert!(matches!(err, OpsError::BackupFailed { step: "naming bundle", .. }));
    }
}
