/// Transport Shipper: push finished bundles to remote rsync endpoints
///
/// Shipping is not transactional across endpoints. Every endpoint is tried;
/// endpoints that already received the bundle keep it when a later one fails.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::core::error::{OpsError, Result, TransferFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// `rsync://host/module/path`
    RsyncDaemon,
    /// `[user@]host:/path`
    Ssh,
    /// An absolute local path (mounted NAS, second disk)
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    raw: String,
    pub protocol: Protocol,
    pub host: Option<String>,
    pub path: String,
}

impl RemoteEndpoint {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// rsync destination argument; directory destinations keep a trailing slash
    fn destination(&self) -> String {
        let base = match (self.protocol, &self.host) {
            (Protocol::Ssh, Some(host)) => format!("{}:{}", host, self.path),
            _ => self.raw.clone(),
        };
        if base.ends_with('/') {
            base
        } else {
            format!("{}/", base)
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for RemoteEndpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err("empty endpoint".to_string());
        }

        if let Some(rest) = raw.strip_prefix("rsync://") {
            let (host, path) = rest
                .split_once('/')
                .ok_or_else(|| "rsync:// endpoint needs a module path".to_string())?;
            if host.is_empty() || path.is_empty() {
                return Err("rsync:// endpoint needs a host and a module".to_string());
            }
            return Ok(Self {
                raw: raw.to_string(),
                protocol: Protocol::RsyncDaemon,
                host: Some(host.to_string()),
                path: format!("/{}", path),
            });
        }

        if raw.starts_with('/') {
            return Ok(Self {
                raw: raw.to_string(),
                protocol: Protocol::Local,
                host: None,
                path: raw.to_string(),
            });
        }

        match raw.split_once(':') {
            Some((host, path)) if !host.is_empty() && !host.contains('/') => Ok(Self {
                raw: raw.to_string(),
                protocol: Protocol::Ssh,
                host: Some(host.to_string()),
                path: if path.is_empty() { ".".to_string() } else { path.to_string() },
            }),
            _ => Err(format!(
                "expected host:/path, rsync://host/module or an absolute path, got '{}'",
                raw
            )),
        }
    }
}

/// File transfer seam; the real implementation shells out to rsync
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn push(&self, bundle: &Path, endpoint: &RemoteEndpoint) -> Result<()>;
}

/// Incremental, checksum-verified copy with `rsync`
#[derive(Debug, Default)]
pub struct Rsync;

#[async_trait]
impl Transport for Rsync {
    async fn push(&self, bundle: &Path, endpoint: &RemoteEndpoint) -> Result<()> {
        let output = tokio::process::Command::new("rsync")
            .args(["-az", "--checksum", "--partial"])
            .arg(bundle)
            .arg(endpoint.destination())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| OpsError::Command {
                program: "rsync".to_string(),
                status: "spawn error".to_string(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(OpsError::Command {
                program: "rsync".to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Result of a shipping run where every endpoint succeeded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipReport {
    pub shipped: Vec<String>,
}

/// Push `bundle` to every endpoint; any failure makes the whole run fail
pub async fn ship(
    bundle: &Path,
    endpoints: &[RemoteEndpoint],
    transport: &dyn Transport,
) -> Result<ShipReport> {
    if endpoints.is_empty() {
        warn!("No BACKUP_REMOTE configured; bundle stays local only");
        return Ok(ShipReport::default());
    }

    let mut report = ShipReport::default();
    let mut failures = Vec::new();

    for endpoint in endpoints {
        info!(endpoint = %endpoint, bundle = %bundle.display(), "Shipping bundle");
        match transport.push(bundle, endpoint).await {
            Ok(()) => {
                info!(endpoint = %endpoint, "Bundle shipped");
                report.shipped.push(endpoint.to_string());
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Shipping failed");
                failures.push(TransferFailure {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(report)
    } else {
        if !report.shipped.is_empty() {
            warn!(
                shipped = ?report.shipped,
                "Bundle remains on endpoints that succeeded; shipping is not rolled back"
            );
        }
        Err(OpsError::TransferFailed { failures })
    }
}
