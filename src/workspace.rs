//! Workspace hygiene checks consulted by the mutation guard.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::Result;

/// Cleanliness seam for the commit-before-tested gate.
#[async_trait]
pub trait WorkspaceCheck: Send + Sync {
    /// Returns the uncommitted entries, empty when the workspace is clean.
    async fn uncommitted(&self) -> Result<Vec<String>>;
}

/// Shells out to `git status --porcelain`. A missing git binary or a
/// directory outside any repository counts as clean; the gate only applies
/// where version control is actually in use.
pub struct GitWorkspaceCheck {
    working_dir: PathBuf,
}

impl GitWorkspaceCheck {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl WorkspaceCheck for GitWorkspaceCheck {
    async fn uncommitted(&self) -> Result<Vec<String>> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let entries: Vec<String> = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(|l| l.to_string())
                    .collect();
                Ok(entries)
            }
            Ok(_) | Err(_) => {
                debug!("git unavailable, skipping workspace check");
                Ok(Vec::new())
            }
        }
    }
}

/// Always-clean check for callers that opt out of git hygiene.
pub struct NoWorkspaceCheck;

#[async_trait]
impl WorkspaceCheck for NoWorkspaceCheck {
    async fn uncommitted(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
