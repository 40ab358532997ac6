/// Helper utilities for odoo-ops

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::utils::{AppConfig, DEFAULT_COMPOSE_FILE, PROJECT_ROOT_ENV, SENSITIVE_KEY_PARTS};

fn is_project_root(path: &Path) -> bool {
    path.join(DEFAULT_COMPOSE_FILE).exists()
}

/// Get the project root directory (where docker-compose.yml is located)
pub fn get_project_root(explicit: Option<&Path>) -> Result<PathBuf> {
    // 1. Command line
    if let Some(path) = explicit {
        if is_project_root(path) {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!(
            "{} not found in {}",
            DEFAULT_COMPOSE_FILE,
            path.display()
        );
    }

    // 2. Check environment variable
    if let Ok(project_root) = std::env::var(PROJECT_ROOT_ENV) {
        let path = PathBuf::from(project_root);
        if is_project_root(&path) {
            return Ok(path);
        }
    }

    // 3. Check saved configuration
    if let Ok(config) = AppConfig::load() {
        if let Some(root) = config.project_root {
            let path = PathBuf::from(&root);
            if is_project_root(&path) {
                return Ok(path);
            }
        }
    }

    // 4. Search for docker-compose.yml in current and parent directories
    let current_dir = std::env::current_dir()
        .context("Failed to get current directory")?;

    if let Some(found) = find_project_root_from(&current_dir) {
        // Save to config
        if let Ok(mut config) = AppConfig::load() {
            let _ = config.set_project_root(found.clone());
        }
        return Ok(found);
    }

    // 5. Not found - show helpful error
    anyhow::bail!(
        "Could not find the Odoo deployment\n\n\
        Please specify the location:\n\n\
        Option 1 - Pass it explicitly:\n\
          odoo-ops --project-dir /path/to/odoo-docker backup\n\n\
        Option 2 - Set environment variable:\n\
          export {}=/path/to/odoo-docker\n\n\
        Option 3 - Run from the project directory:\n\
          cd /path/to/odoo-docker && odoo-ops backup",
        PROJECT_ROOT_ENV
    )
}

/// Walk up from `start` looking for docker-compose.yml
pub fn find_project_root_from(start: &Path) -> Option<PathBuf> {
    start.ancestors().find(|dir| is_project_root(dir)).map(Path::to_path_buf)
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format an age, rounded down to whole minutes
pub fn format_age(age: Duration) -> String {
    let minutes = age.as_secs() / 60;
    if minutes == 0 {
        return "just now".to_string();
    }
    humantime::format_duration(Duration::from_secs(minutes * 60)).to_string()
}

/// Mask sensitive data (show only first and last N characters of long values)
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if visible_chars == 0 || chars.len() < visible_chars * 4 {
        "*".repeat(chars.len().max(4))
    } else {
        let start: String = chars[..visible_chars].iter().collect();
        let end: String = chars[chars.len() - visible_chars..].iter().collect();
        format!("{}...{}", start, end)
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_uppercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| upper.contains(part))
}

/// PostgreSQL identifiers this tool is willing to interpolate into commands
pub fn is_valid_db_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]{0,62}$").expect("static regex")
    });
    re.is_match(name)
}

/// Parse Docker container state to simplified state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Paused,
    Restarting,
    Dead,
    Missing,
    Unknown,
}

impl From<&str> for ContainerState {
    fn from(status: &str) -> Self {
        let status_lower = status.to_lowercase();
        if status_lower.contains("up") || status_lower.contains("running") {
            ContainerState::Running
        } else if status_lower.contains("paused") {
            ContainerState::Paused
        } else if status_lower.contains("restarting") {
            ContainerState::Restarting
        } else if status_lower.contains("dead") || status_lower.contains("removing") {
            ContainerState::Dead
        } else if status_lower.contains("exited")
            || status_lower.contains("stopped")
            || status_lower.contains("created")
        {
            ContainerState::Stopped
        } else {
            ContainerState::Unknown
        }
    }
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "Running",
            ContainerState::Stopped => "Stopped",
            ContainerState::Paused => "Paused",
            ContainerState::Restarting => "Restarting",
            ContainerState::Dead => "Dead",
            ContainerState::Missing => "Not created",
            ContainerState::Unknown => "Unknown",
        }
    }
}
