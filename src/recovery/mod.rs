//! Crash recovery protocol.
//!
//! A dirty state record means a procedure died mid-flight. Recovery never
//! resumes the interrupted state directly: it rolls back to the most recent
//! checkpoint and re-runs that state's procedure, relying on the procedure's
//! own idempotence. A dirty record with no checkpoint at all is an integrity
//! error and restarts the current state's procedure from scratch.

mod checkpoint;

pub use checkpoint::{Checkpoint, CheckpointManager};

use tracing::{info, warn};

use crate::error::Result;
use crate::session::StateRecord;

/// What the controller must do before its first forward transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// Clean record, no recovery needed.
    Clean,
    /// Re-run the checkpointed state's procedure idempotently.
    Rerun {
        checkpoint_id: String,
        pending_actions: Vec<String>,
    },
    /// Dirty with no checkpoint: restart the interrupted state's procedure
    /// from scratch.
    RestartCurrent,
}

/// Decide the recovery plan and apply any rollback to `record`. Called once,
/// at process start, before the session's first transition.
pub async fn recover(
    record: &mut StateRecord,
    checkpoints: &CheckpointManager,
) -> Result<RecoveryPlan> {
    if !record.needs_recovery() {
        return Ok(RecoveryPlan::Clean);
    }

    match checkpoints.latest().await? {
        Some(checkpoint) => {
            info!(
                session_id = %record.session_id,
                checkpoint_id = %checkpoint.id,
                interrupted = %record.state,
                resume_at = %checkpoint.state,
                "Dirty record, rolling back to checkpoint"
            );
            record.recover_to(checkpoint.state, &checkpoint.id)?;
            Ok(RecoveryPlan::Rerun {
                checkpoint_id: checkpoint.id,
                pending_actions: checkpoint.pending_actions,
            })
        }
        None => {
            warn!(
                session_id = %record.session_id,
                state = %record.state,
                "Dirty record with no checkpoint, restarting current state"
            );
            Ok(RecoveryPlan::RestartCurrent)
        }
    }
}
