//! Mutation guard checked before every feature-mutating call.
//!
//! A denial is a distinguished error that blocks the call entirely; it is
//! never downgraded to a log line. The guard is what makes health gating a
//! system-wide invariant rather than a naming convention on states.

use std::sync::Arc;

use tracing::warn;

use super::ledger::FeatureStatus;
use super::state::{SessionState, StateRecord};
use crate::error::{Result, StewardError};
use crate::workspace::WorkspaceCheck;

pub struct MutationGuard {
    workspace: Option<Arc<dyn WorkspaceCheck>>,
}

impl MutationGuard {
    pub fn new() -> Self {
        Self { workspace: None }
    }

    /// Enable the commit-hygiene gate: marking a feature tested requires a
    /// clean workspace.
    pub fn with_workspace_check(mut self, check: Arc<dyn WorkspaceCheck>) -> Self {
        self.workspace = Some(check);
        self
    }

    /// Allow or deny any feature mutation under the current record.
    pub fn check(&self, record: &StateRecord) -> Result<()> {
        if record.health_status.is_broken() || record.state == SessionState::FixBroken {
            warn!(
                session_id = %record.session_id,
                state = %record.state,
                "Feature mutation denied while BROKEN"
            );
            return Err(StewardError::HealthGated(format!(
                "session in {}",
                record.state
            )));
        }
        Ok(())
    }

    /// Status-specific gate applied on top of `check`.
    pub async fn check_mark(&self, record: &StateRecord, target: FeatureStatus) -> Result<()> {
        self.check(record)?;

        if target == FeatureStatus::Tested
            && let Some(workspace) = &self.workspace
        {
            let uncommitted = workspace.uncommitted().await?;
            if !uncommitted.is_empty() {
                let shown: Vec<&str> =
                    uncommitted.iter().take(5).map(|s| s.as_str()).collect();
                return Err(StewardError::Workspace(format!(
                    "uncommitted changes; commit before marking tested:\n  {}",
                    shown.join("\n  ")
                )));
            }
        }
        Ok(())
    }
}

impl Default for MutationGuard {
    fn default() -> Self {
        Self::new()
    }
}
