/// Scheduler Installer: one marked crontab line per deployment
///
/// The line runs `odoo-ops backup` for this project. Installation is
/// idempotent: a crontab already carrying this deployment's marker is left
/// alone. The marker embeds a digest of the project root, so several
/// deployments can share one crontab.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::core::error::{OpsError, Result};
use crate::utils::CRON_MARKER;

/// Where crontab content is read from and written to
pub trait CrontabStore {
    fn read(&self) -> Result<String>;
    fn write(&self, content: &str) -> Result<()>;
}

/// The invoking user's crontab via the `crontab` binary
#[derive(Debug, Default)]
pub struct SystemCrontab;

impl CrontabStore for SystemCrontab {
    fn read(&self) -> Result<String> {
        let output = Command::new("crontab")
            .arg("-l")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| OpsError::Command {
                program: "crontab".to_string(),
                status: "spawn error".to_string(),
                stderr: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.to_lowercase().contains("no crontab") {
            debug!("User has no crontab yet");
            return Ok(String::new());
        }
        Err(OpsError::Command {
            program: "crontab -l".to_string(),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }

    fn write(&self, content: &str) -> Result<()> {
        let mut child = Command::new("crontab")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OpsError::Command {
                program: "crontab".to_string(),
                status: "spawn error".to_string(),
                stderr: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(OpsError::Command {
                program: "crontab -".to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// What the scheduled line runs
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub cron: String,
    pub executable: PathBuf,
    pub project_root: PathBuf,
    pub log_file: PathBuf,
}

impl ScheduleEntry {
    /// Shell command cron runs, without the schedule fields
    pub fn command(&self) -> String {
        format!(
            "cd {} && {} --project-dir {} backup >> {} 2>&1",
            shell_quote(&self.project_root),
            shell_quote(&self.executable),
            shell_quote(&self.project_root),
            shell_quote(&self.log_file),
        )
    }

    pub fn line(&self) -> String {
        format!(
            "{} {} {}",
            self.cron,
            self.command(),
            marker_for(&self.project_root)
        )
    }
}

/// `# odoo-ops:backup:<digest>` for the deployment at `project_root`
pub fn marker_for(project_root: &Path) -> String {
    let digest = Sha256::digest(project_root.to_string_lossy().as_bytes());
    format!("{}:{}", CRON_MARKER, &hex::encode(digest)[..12])
}

/// Quote for sh and escape `%`, which cron turns into newlines
fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let safe = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-+=:@".contains(c));
    let quoted = if safe {
        raw.to_string()
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    };
    quoted.replace('%', r"\%")
}

fn cron_field() -> &'static Regex {
    static FIELD: OnceLock<Regex> = OnceLock::new();
    FIELD.get_or_init(|| {
        Regex::new(r"^(\*|[0-9A-Za-z]+(-[0-9A-Za-z]+)?)(/[0-9]+)?(,(\*|[0-9A-Za-z]+(-[0-9A-Za-z]+)?)(/[0-9]+)?)*$")
            .expect("static regex")
    })
}

const CRON_NICKNAMES: &[&str] = &[
    "@hourly", "@daily", "@midnight", "@weekly", "@monthly", "@yearly", "@annually",
];

/// Five standard fields or one of the `@` nicknames
pub fn validate_cron_expr(expr: &str) -> std::result::Result<(), String> {
    let expr = expr.trim();
    if expr.starts_with('@') {
        return if CRON_NICKNAMES.contains(&expr) {
            Ok(())
        } else {
            Err(format!("unknown cron nickname '{}'", expr))
        };
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "cron expression '{}' must have 5 fields, found {}",
            expr,
            fields.len()
        ));
    }
    if let Some(bad) = fields.iter().find(|f| !cron_field().is_match(f)) {
        return Err(format!("invalid cron field '{}' in '{}'", bad, expr));
    }
    Ok(())
}

/// The line installed for `project_root`, if any
pub fn installed(store: &dyn CrontabStore, project_root: &Path) -> Result<Option<String>> {
    let marker = marker_for(project_root);
    Ok(store
        .read()?
        .lines()
        .find(|l| l.contains(&marker))
        .map(str::to_string))
}

/// Append the entry unless this deployment's line already exists
pub fn install(store: &dyn CrontabStore, entry: &ScheduleEntry) -> Result<String> {
    validate_cron_expr(&entry.cron).map_err(OpsError::Config)?;

    let marker = marker_for(&entry.project_root);
    let current = store.read()?;
    if let Some(existing) = current.lines().find(|l| l.contains(&marker)) {
        info!(line = existing, "Backup schedule already installed");
        return Err(OpsError::ScheduleAlreadyExists(existing.to_string()));
    }

    // the shell opens the log before running anything; a missing dir means no run
    if let Some(log_dir) = entry.log_file.parent() {
        fs::create_dir_all(log_dir)?;
    }

    let line = entry.line();
    let mut content = current;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&line);
    content.push('\n');

    store.write(&content)?;
    info!(line = %line, "Installed backup schedule");
    Ok(line)
}

/// Remove this deployment's marked lines; returns how many were removed
pub fn remove(store: &dyn CrontabStore, project_root: &Path) -> Result<usize> {
    let marker = marker_for(project_root);
    let current = store.read()?;
    let kept: Vec<&str> = current.lines().filter(|l| !l.contains(&marker)).collect();
    let removed = current.lines().count() - kept.len();
    if removed == 0 {
        return Ok(0);
    }

    let mut content = kept.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    store.write(&content)?;
    info!(removed, "Removed backup schedule");
    Ok(removed)
}
