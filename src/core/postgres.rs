/// PostgreSQL access through the database container
///
/// All client tools run inside the compose `db` service with `docker compose
/// exec -T`, so the host needs no PostgreSQL client and versions always match
/// the server. Dumps stream through our stdout/stdin, never through a file
/// inside the container.

use std::fs::File;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::docker::{run_captured, run_redirected, DockerManager};
use crate::core::error::{OpsError, Result};
use crate::utils::is_valid_db_name;

/// Raw result of replaying a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutput {
    pub success: bool,
    pub stderr: String,
}

/// Database seam: every operation the builder and orchestrator need
#[async_trait]
pub trait Database: Send + Sync {
    /// Write a custom-format dump of `db` to `dest`
    async fn dump(&self, db: &str, dest: &Path) -> Result<()>;

    /// Terminate other sessions on `db`; returns how many were terminated
    async fn terminate_connections(&self, db: &str) -> Result<u64>;

    async fn drop_database(&self, db: &str) -> Result<()>;

    async fn create_database(&self, db: &str) -> Result<()>;

    /// Replay `dump` into the existing database `db`
    async fn restore(&self, db: &str, dump: &Path) -> Result<ReplayOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Clean,
    /// Per-object errors pg_restore skipped over
    Tolerated { errors: usize, sample: Vec<String> },
    Fatal(String),
}

/// Substrings in pg_restore output that mean the replay did not really happen
const FATAL_MARKERS: &[&str] = &[
    "could not connect",
    "connection to server",
    "permission denied",
    "fatal:",
    "input file does not appear to be a valid archive",
    "could not open input file",
    "unsupported version",
    "out of memory",
    "no space left on device",
];

/// Sort a finished replay into clean, tolerable or fatal
pub fn classify_replay(output: &ReplayOutput) -> ReplayOutcome {
    if output.success {
        return ReplayOutcome::Clean;
    }

    for line in output.stderr.lines() {
        let lower = line.to_lowercase();
        let missing_database = lower.contains("database \"") && lower.contains("does not exist");
        if missing_database || FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
            return ReplayOutcome::Fatal(line.trim().to_string());
        }
    }

    let error_lines: Vec<String> = output
        .stderr
        .lines()
        .filter(|l| l.to_lowercase().contains("error:"))
        .map(|l| l.trim().to_string())
        .collect();

    if error_lines.is_empty() {
        return ReplayOutcome::Fatal(
            "pg_restore failed without reporting any object errors".to_string(),
        );
    }

    ReplayOutcome::Tolerated {
        errors: error_lines.len(),
        sample: error_lines.into_iter().take(3).collect(),
    }
}

/// PostgreSQL running as a compose service
pub struct ComposePostgres {
    docker: DockerManager,
    service: String,
    user: String,
    password: Option<String>,
}

impl ComposePostgres {
    pub fn new(docker: DockerManager, service: &str, user: &str, password: Option<String>) -> Self {
        Self {
            docker,
            service: service.to_string(),
            user: user.to_string(),
            password,
        }
    }

    /// `docker compose exec -T db <program> -U <user>`
    fn exec(&self, program: &str) -> tokio::process::Command {
        let mut args = vec!["exec", "-T"];
        if self.password.is_some() {
            // value is taken from our environment, never from argv
            args.extend(["-e", "PGPASSWORD"]);
        }
        args.extend([self.service.as_str(), program, "-U", self.user.as_str()]);

        let mut cmd = self.docker.compose(&args);
        if let Some(password) = &self.password {
            cmd.env("PGPASSWORD", password);
        }
        cmd
    }

    fn check_name(db: &str) -> Result<()> {
        if is_valid_db_name(db) {
            Ok(())
        } else {
            Err(OpsError::Config(format!("refusing unsafe database name '{}'", db)))
        }
    }
}

#[async_trait]
impl Database for ComposePostgres {
    async fn dump(&self, db: &str, dest: &Path) -> Result<()> {
        Self::check_name(db)?;
        info!(db, dest = %dest.display(), "Dumping database");

        let mut cmd = self.exec("pg_dump");
        cmd.args(["--no-password", "-Fc", db]);
        let size = write_dump(cmd, dest).await?;
        debug!(db, size, "Dump written");
        Ok(())
    }

    async fn terminate_connections(&self, db: &str) -> Result<u64> {
        Self::check_name(db)?;
        let query = format!(
            "SELECT count(pg_terminate_backend(pid)) FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid();",
            db
        );
        let mut cmd = self.exec("psql");
        cmd.args(["--no-password", "-d", "postgres", "-v", "ON_ERROR_STOP=1", "-tAc", query.as_str()]);
        let output = run_captured(cmd, "psql").await?;

        let terminated = parse_terminated(db, &String::from_utf8_lossy(&output.stdout));
        info!(db, terminated, "Terminated active connections");
        Ok(terminated)
    }

    async fn drop_database(&self, db: &str) -> Result<()> {
        Self::check_name(db)?;
        info!(db, "Dropping database");
        let mut cmd = self.exec("dropdb");
        cmd.args(["--no-password", "--if-exists", db]);
        run_captured(cmd, "dropdb").await?;
        Ok(())
    }

    async fn create_database(&self, db: &str) -> Result<()> {
        Self::check_name(db)?;
        info!(db, owner = %self.user, "Creating database");
        let mut cmd = self.exec("createdb");
        cmd.args(["--no-password", "-O", self.user.as_str(), db]);
        run_captured(cmd, "createdb").await?;
        Ok(())
    }

    async fn restore(&self, db: &str, dump: &Path) -> Result<ReplayOutput> {
        Self::check_name(db)?;
        info!(db, dump = %dump.display(), "Replaying dump");

        let role = format!("--role={}", self.user);
        let mut cmd = self.exec("pg_restore");
        cmd.args(["--no-password", "--no-owner", role.as_str(), "-d", db])
            .stdin(Stdio::from(File::open(dump)?));

        let output = cmd.output().await.map_err(|e| OpsError::Command {
            program: "pg_restore".to_string(),
            status: "spawn error".to_string(),
            stderr: e.to_string(),
        })?;

        Ok(ReplayOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Count printed by the terminate query; unparsable output counts as zero
fn parse_terminated(db: &str, stdout: &str) -> u64 {
    let reported = stdout.trim();
    match reported.parse() {
        Ok(n) => n,
        Err(_) => {
            warn!(db, output = %reported, "Unexpected psql output; terminated count unknown");
            0
        }
    }
}

/// Run a dump command with its stdout going to `dest`; returns the dump size
async fn write_dump(mut cmd: tokio::process::Command, dest: &Path) -> Result<u64> {
    cmd.stdout(Stdio::from(File::create(dest)?));
    run_redirected(cmd, "pg_dump").await?;

    let size = std::fs::metadata(dest)?.len();
    if size == 0 {
        return Err(OpsError::Command {
            program: "pg_dump".to_string(),
            status: "exit status: 0".to_string(),
            stderr: "produced an empty dump".to_string(),
        });
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[tokio::test]
    async fn test_dump_output_lands_in_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("database.dump");

        let size = write_dump(sh("printf 'PGDMP'; printf ' rest of archive'"), &dest)
            .await
            .unwrap();

        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written, b"PGDMP rest of archive");
        assert_eq!(size, written.len() as u64);
    }

    #[tokio::test]
    async fn test_empty_dump_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("database.dump");
        let err = write_dump(sh("true"), &dest).await.unwrap_err();
        assert!(err.to_string().contains("empty dump"));
    }

    #[tokio::test]
    async fn test_failed_dump_reports_stderr() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("database.dump");
        let err = write_dump(
            sh("echo 'pg_dump: error: database odoo does not exist' >&2; exit 1"),
            &dest,
        )
        .await
        .unwrap_err();
        match err {
            OpsError::Command { program, stderr, .. } => {
                assert_eq!(program, "pg_dump");
                assert!(stderr.contains("does not exist"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    fn failed(stderr: &str) -> ReplayOutput {
        ReplayOutput {
            success: false,
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_clean_replay() {
        let output = ReplayOutput {
            success: true,
            stderr: String::new(),
        };
        assert_eq!(classify_replay(&output), ReplayOutcome::Clean);
    }

    #[test]
    fn test_already_exists_is_tolerated() {
        let stderr = "\
pg_restore: while PROCESSING TOC:
pg_restore: from TOC entry 2; 3079 16385 EXTENSION unaccent (no owner)
pg_restore: error: could not execute query: ERROR:  extension \"unaccent\" already exists
Command was: CREATE EXTENSION IF NOT EXISTS unaccent WITH SCHEMA public;
pg_restore: error: could not execute query: ERROR:  must be owner of extension plpgsql
pg_restore: warning: errors ignored on restore: 2
";
        match classify_replay(&failed(stderr)) {
            ReplayOutcome::Tolerated { errors, sample } => {
                assert_eq!(errors, 2);
                assert!(sample[0].contains("already exists"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_connection_failure_is_fatal() {
        let stderr = "pg_restore: error: connection to server on socket \"/var/run/postgresql/.s.PGSQL.5432\" failed: FATAL:  role \"odoo\" does not exist\n";
        assert!(matches!(classify_replay(&failed(stderr)), ReplayOutcome::Fatal(_)));
    }

    #[test]
    fn test_permission_denied_is_fatal() {
        let stderr = "pg_restore: error: could not execute query: ERROR:  permission denied for schema public\n";
        assert!(matches!(classify_replay(&failed(stderr)), ReplayOutcome::Fatal(_)));
    }

    #[test]
    fn test_missing_target_database_is_fatal() {
        let stderr = "pg_restore: error: database \"odoo\" does not exist\n";
        assert!(matches!(classify_replay(&failed(stderr)), ReplayOutcome::Fatal(_)));
    }

    #[test]
    fn test_silent_failure_is_fatal() {
        assert!(matches!(classify_replay(&failed("")), ReplayOutcome::Fatal(_)));
    }

    #[test]
    fn test_parse_terminated() {
        assert_eq!(parse_terminated("odoo", "3\n"), 3);
        assert_eq!(parse_terminated("odoo", "psql: warning: extra command-line argument"), 0);
        assert_eq!(parse_terminated("odoo", ""), 0);
    }

    #[test]
    fn test_unsafe_names_are_refused() {
        assert!(ComposePostgres::check_name("odoo").is_ok());
        assert!(ComposePostgres::check_name("x'; DROP DATABASE odoo; --").is_err());
    }
}
