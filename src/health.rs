//! External health check collaborator.
//!
//! The probe runs the configured command under a timeout and reports a
//! verdict. Any non-success outcome, including timeout, is `Broken`
//! (fail-closed). The probe itself holds no state; the session record is the
//! only place a verdict is remembered.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ProjectConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Broken,
}

impl HealthStatus {
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Broken)
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Healthy => "HEALTHY",
            Self::Broken => "BROKEN",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one probe run, with enough detail for the FIX_BROKEN report.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub status: HealthStatus,
    pub detail: String,
}

/// Seam for the external health collaborator. The production implementation
/// shells out; tests substitute scripted verdicts.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn probe(&self) -> Result<ProbeReport>;
}

/// Runs the project's configured health command.
pub struct HealthProbe {
    command: String,
    timeout: Duration,
    working_dir: PathBuf,
}

impl HealthProbe {
    pub fn new(command: impl Into<String>, timeout: Duration, working_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            timeout,
            working_dir,
        }
    }

    pub fn from_config(config: &ProjectConfig, working_dir: PathBuf) -> Self {
        Self::new(
            &config.health_check,
            Duration::from_secs(config.timeout_seconds.health_check),
            working_dir,
        )
    }
}

#[async_trait]
impl HealthCheck for HealthProbe {
    async fn probe(&self) -> Result<ProbeReport> {
        debug!(command = %self.command, timeout_secs = self.timeout.as_secs(), "Running health check");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    Ok(ProbeReport {
                        status: HealthStatus::Healthy,
                        detail: "health check passed".into(),
                    })
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let tail: String = stderr.lines().rev().take(10).collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect::<Vec<_>>()
                        .join("\n");
                    warn!(exit = ?output.status.code(), "Health check failed");
                    Ok(ProbeReport {
                        status: HealthStatus::Broken,
                        detail: format!(
                            "health check exited with {:?}:\n{}",
                            output.status.code(),
                            tail
                        ),
                    })
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Health check could not be spawned");
                Ok(ProbeReport {
                    status: HealthStatus::Broken,
                    detail: format!("health check could not run: {}", e),
                })
            }
            // Fail closed: an unresponsive check is indistinguishable from a
            // broken project.
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Health check timed out");
                Ok(ProbeReport {
                    status: HealthStatus::Broken,
                    detail: format!("health check timed out after {}s", self.timeout.as_secs()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(cmd: &str, timeout_ms: u64) -> HealthProbe {
        HealthProbe::new(
            cmd,
            Duration::from_millis(timeout_ms),
            std::env::temp_dir(),
        )
    }

    #[tokio::test]
    async fn test_passing_command_is_healthy() {
        let report = probe("true", 5_000).probe().await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failing_command_is_broken() {
        let report = probe("exit 3", 5_000).probe().await.unwrap();
        assert_eq!(report.status, HealthStatus::Broken);
    }

    #[tokio::test]
    async fn test_timeout_is_broken_not_unknown() {
        let report = probe("sleep 5", 50).probe().await.unwrap();
        assert_eq!(report.status, HealthStatus::Broken);
        assert!(report.detail.contains("timed out"));
    }
}
