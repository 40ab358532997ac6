/// Configuration management for the deployment .env file
///
/// The same file drives docker compose, so only keys this tool understands
/// are interpreted; everything else is kept for `config view`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::error::{OpsError, Result};
use crate::core::shipper::RemoteEndpoint;
use crate::core::schedule::validate_cron_expr;
use crate::utils::{
    is_valid_db_name, DEFAULT_ADDONS_DIR, DEFAULT_APP_SERVICE, DEFAULT_BACKUP_CRON,
    DEFAULT_BACKUP_DIR, DEFAULT_BACKUP_PREFIX, DEFAULT_CONFIG_DIR, DEFAULT_DATA_DIR,
    DEFAULT_DB_SERVICE, DEFAULT_DB_USER, DEFAULT_ODOO_VERSION, DEFAULT_RETENTION_DAYS,
};

pub struct ConfigManager {
    env_file: PathBuf,
    config: HashMap<String, String>,
}

impl ConfigManager {
    /// Load configuration from .env file
    pub fn load<P: AsRef<Path>>(env_file: P) -> Result<Self> {
        let env_file = env_file.as_ref().to_path_buf();

        if !env_file.exists() {
            return Err(OpsError::Config(format!(
                ".env file not found at {}",
                env_file.display()
            )));
        }

        let iter = dotenv::from_path_iter(&env_file).map_err(|e| {
            OpsError::Config(format!("failed to read {}: {}", env_file.display(), e))
        })?;

        let mut config = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                OpsError::Config(format!("failed to parse {}: {}", env_file.display(), e))
            })?;
            config.insert(key, value);
        }

        Ok(Self { env_file, config })
    }

    pub fn from_map(env_file: impl Into<PathBuf>, config: HashMap<String, String>) -> Self {
        Self {
            env_file: env_file.into(),
            config,
        }
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Get a configuration value; empty values count as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    /// Get all configuration keys
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.config.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Validate configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.get("POSTGRES_DB") {
            None => errors.push("POSTGRES_DB is not set".to_string()),
            Some(db) if !is_valid_db_name(db) => {
                errors.push(format!("POSTGRES_DB is not a valid database name: {}", db))
            }
            _ => {}
        }

        if let Some(user) = self.get("POSTGRES_USER") {
            if !is_valid_db_name(user) {
                errors.push(format!("POSTGRES_USER is not a valid role name: {}", user));
            }
        }

        if let Some(days) = self.get("BACKUP_RETENTION_DAYS") {
            if days.trim().parse::<u32>().is_err() {
                errors.push(format!(
                    "BACKUP_RETENTION_DAYS must be a whole number of days: {}",
                    days
                ));
            }
        }

        if let Some(remotes) = self.get("BACKUP_REMOTE") {
            for remote in split_list(remotes) {
                if let Err(e) = remote.parse::<RemoteEndpoint>() {
                    errors.push(format!("BACKUP_REMOTE entry '{}': {}", remote, e));
                }
            }
        }

        if let Some(cron) = self.get("BACKUP_CRON") {
            if let Err(e) = validate_cron_expr(cron) {
                errors.push(format!("BACKUP_CRON: {}", e));
            }
        }

        if let Some(prefix) = self.get("BACKUP_PREFIX") {
            if prefix.contains('/') || prefix.contains(char::is_whitespace) {
                errors.push(format!("BACKUP_PREFIX must be a plain file name: {}", prefix));
            }
        }

        errors
    }

    /// Resolve the typed settings, with relative paths anchored at `project_root`
    pub fn resolve(&self, project_root: &Path) -> Result<OpsConfig> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(OpsError::Config(errors.join("; ")));
        }

        let path = |key: &str, default: &str| -> PathBuf {
            let raw = PathBuf::from(self.get(key).unwrap_or(default));
            if raw.is_absolute() {
                raw
            } else {
                project_root.join(raw)
            }
        };

        let remotes = self
            .get("BACKUP_REMOTE")
            .map(|v| {
                split_list(v)
                    .map(|r| r.parse::<RemoteEndpoint>())
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .transpose()
            .map_err(OpsError::Config)?
            .unwrap_or_default();

        Ok(OpsConfig {
            project_root: project_root.to_path_buf(),
            env_file: self.env_file.clone(),
            db_name: self.get("POSTGRES_DB").unwrap_or_default().to_string(),
            db_user: self.get("POSTGRES_USER").unwrap_or(DEFAULT_DB_USER).to_string(),
            db_password: self.get("POSTGRES_PASSWORD").map(|s| s.to_string()),
            remotes,
            retention_days: self
                .get("BACKUP_RETENTION_DAYS")
                .and_then(|d| d.trim().parse().ok())
                .unwrap_or(DEFAULT_RETENTION_DAYS),
            backup_dir: path("BACKUP_DIR", DEFAULT_BACKUP_DIR),
            backup_prefix: self
                .get("BACKUP_PREFIX")
                .unwrap_or(DEFAULT_BACKUP_PREFIX)
                .to_string(),
            odoo_version: self
                .get("ODOO_VERSION")
                .unwrap_or(DEFAULT_ODOO_VERSION)
                .to_string(),
            data_dir: path("ODOO_DATA_DIR", DEFAULT_DATA_DIR),
            addons_dir: path("ODOO_ADDONS_DIR", DEFAULT_ADDONS_DIR),
            config_dir: path("ODOO_CONFIG_DIR", DEFAULT_CONFIG_DIR),
            db_service: self.get("DB_SERVICE").unwrap_or(DEFAULT_DB_SERVICE).to_string(),
            app_service: self
                .get("ODOO_SERVICE")
                .unwrap_or(DEFAULT_APP_SERVICE)
                .to_string(),
            backup_cron: self
                .get("BACKUP_CRON")
                .unwrap_or(DEFAULT_BACKUP_CRON)
                .to_string(),
        })
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Settings for one deployment, passed explicitly into every component
#[derive(Debug, Clone)]
pub struct OpsConfig {
    pub project_root: PathBuf,
    pub env_file: PathBuf,
    pub db_name: String,
    pub db_user: String,
    pub db_password: Option<String>,
    pub remotes: Vec<RemoteEndpoint>,
    pub retention_days: u32,
    pub backup_dir: PathBuf,
    pub backup_prefix: String,
    pub odoo_version: String,
    pub data_dir: PathBuf,
    pub addons_dir: PathBuf,
    pub config_dir: PathBuf,
    pub db_service: String,
    pub app_service: String,
    pub backup_cron: String,
}

impl OpsConfig {
    /// Attachment directory Odoo keeps for one database
    pub fn filestore_dir(&self, db_name: &str) -> PathBuf {
        self.data_dir.join("filestore").join(db_name)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.backup_dir.join(".odoo-ops.lock")
    }
}
