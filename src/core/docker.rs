/// Docker and Docker Compose integration
///
/// Service state comes from the Docker API; lifecycle and exec go through the
/// `docker compose` CLI so the project's compose file stays authoritative.

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use bollard::Docker;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::error::{OpsError, Result};
use crate::utils::ContainerState;

/// Application lifecycle seam used by the restore orchestrator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn stop(&self, service: &str) -> Result<()>;
    async fn start(&self, service: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
    project_root: PathBuf,
}

impl DockerManager {
    pub fn new(project_root: &Path) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            OpsError::Config(format!(
                "Failed to connect to Docker daemon. Is Docker running? ({})",
                e
            ))
        })?;

        Ok(Self {
            docker,
            project_root: project_root.to_path_buf(),
        })
    }

    /// Get project root directory
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// `docker compose <args>` rooted at the project, not yet spawned
    pub fn compose(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .args(args)
            .current_dir(&self.project_root)
            .stdin(Stdio::null());
        cmd
    }

    /// Execute docker compose command
    pub async fn compose_command(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "docker compose");
        let output = run_captured(self.compose(args), "docker compose").await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Stop specific service
    pub async fn stop_service(&self, service: &str) -> Result<()> {
        self.compose_command(&["stop", service]).await?;
        Ok(())
    }

    /// Start specific service
    pub async fn start_service(&self, service: &str) -> Result<()> {
        self.compose_command(&["start", service]).await?;
        Ok(())
    }

    /// State of a compose service's container(s) in this project
    pub async fn service_state(&self, service: &str) -> Result<ContainerState> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("com.docker.compose.service={}", service),
                format!(
                    "com.docker.compose.project.working_dir={}",
                    self.project_root.display()
                ),
            ],
        );

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        let containers = self
            .docker
            .list_containers(options)
            .await
            .map_err(|e| OpsError::Config(format!("Docker API error: {}", e)))?;

        Ok(summarize_state(&containers))
    }

    /// Check if Docker daemon is accessible
    pub async fn check_docker(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

#[async_trait]
impl ServiceControl for DockerManager {
    async fn stop(&self, service: &str) -> Result<()> {
        info!(service, "Stopping service");
        self.stop_service(service).await
    }

    async fn start(&self, service: &str) -> Result<()> {
        info!(service, "Starting service");
        self.start_service(service).await
    }
}

/// One running replica is enough to call the service running
fn summarize_state(containers: &[ContainerSummary]) -> ContainerState {
    if containers.is_empty() {
        return ContainerState::Missing;
    }

    let states: Vec<ContainerState> = containers
        .iter()
        .map(|c| c.state.as_deref().unwrap_or("unknown").into())
        .collect();

    if states.iter().any(|s| s.is_running()) {
        ContainerState::Running
    } else {
        states[0]
    }
}

/// Run to completion, turning spawn failures and nonzero exits into errors
pub(crate) async fn run_captured(mut cmd: Command, program: &str) -> Result<std::process::Output> {
    let output = cmd.output().await.map_err(|e| spawn_error(program, e))?;
    check_status(output, program)
}

/// Like `run_captured` but keeps the stdout the caller configured.
/// `Command::output` always pipes stdout, which would swallow a redirect.
pub(crate) async fn run_redirected(mut cmd: Command, program: &str) -> Result<std::process::Output> {
    let child = cmd
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(program, e))?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| spawn_error(program, e))?;
    check_status(output, program)
}

fn spawn_error(program: &str, e: std::io::Error) -> OpsError {
    OpsError::Command {
        program: program.to_string(),
        status: "spawn error".to_string(),
        stderr: e.to_string(),
    }
}

fn check_status(output: std::process::Output, program: &str) -> Result<std::process::Output> {
    if !output.status.success() {
        return Err(OpsError::Command {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(state: &str) -> ContainerSummary {
        ContainerSummary {
            state: Some(state.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_summarize_state() {
        assert_eq!(summarize_state(&[]), ContainerState::Missing);
        assert_eq!(summarize_state(&[summary("exited")]), ContainerState::Stopped);
        assert_eq!(
            summarize_state(&[summary("exited"), summary("running")]),
            ContainerState::Running
        );
        assert_eq!(summarize_state(&[summary("paused")]), ContainerState::Paused);
    }

    #[tokio::test]
    async fn test_run_captured_reports_failure() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let err = run_captured(cmd, "sh").await.unwrap_err();
        match err {
            OpsError::Command { program, stderr, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_redirected_keeps_stdout_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("out.bin");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf PGDMP-payload; echo note >&2"])
            .stdout(Stdio::from(std::fs::File::create(&dest).unwrap()));
        let output = run_redirected(cmd, "sh").await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"PGDMP-payload");
        assert!(output.stdout.is_empty());
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "note");
    }

    #[tokio::test]
    async fn test_run_captured_missing_program() {
        let cmd = Command::new("definitely-not-a-real-binary-odoo-ops");
        assert!(matches!(
            run_captured(cmd, "missing").await,
            Err(OpsError::Command { .. })
        ));
    }
}
