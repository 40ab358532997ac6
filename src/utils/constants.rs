/// Deployment defaults and file names
///
/// Defaults match the stock Odoo docker-compose layout: a `db` service running
/// PostgreSQL, an `odoo` service, and bind mounts under the project root.

/// Default .env keys
pub const DEFAULT_DB_USER: &str = "odoo";
pub const DEFAULT_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_BACKUP_DIR: &str = "./backups";
pub const DEFAULT_BACKUP_PREFIX: &str = "odoo_backup";
pub const DEFAULT_ODOO_VERSION: &str = "18.0";
pub const DEFAULT_DATA_DIR: &str = "./odoo-data";
pub const DEFAULT_ADDONS_DIR: &str = "./custom-addons";
pub const DEFAULT_CONFIG_DIR: &str = "./config";
pub const DEFAULT_DB_SERVICE: &str = "db";
pub const DEFAULT_APP_SERVICE: &str = "odoo";
pub const DEFAULT_BACKUP_CRON: &str = "0 2 * * *";

/// Default paths
pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Bundle layout
pub const BUNDLE_EXTENSION: &str = ".tar.gz";
pub const PARTIAL_SUFFIX: &str = ".partial";
pub const BUNDLE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const DUMP_FILE: &str = "database.dump";
pub const FILESTORE_ARCHIVE: &str = "filestore.tar.gz";
pub const METADATA_FILE: &str = "backup_info.txt";
pub const BUNDLE_ENV_FILE: &str = ".env";
pub const BUNDLE_CONFIG_DIR: &str = "config";
pub const BUNDLE_ADDONS_DIR: &str = "custom-addons";

/// Crontab line marker for the installed schedule
pub const CRON_MARKER: &str = "# odoo-ops:backup";

/// Environment variable pointing at the project root
pub const PROJECT_ROOT_ENV: &str = "ODOO_OPS_PROJECT_ROOT";

/// Keys masked in `config view`
pub const SENSITIVE_KEY_PARTS: &[&str] = &["PASSWORD", "SECRET", "KEY", "TOKEN"];
