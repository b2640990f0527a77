//! Durable per-session state record.
//!
//! One JSON file per session, written atomically (serialize → temp file →
//! rename). The store also enforces the transition table and the append-only
//! history invariant at the write boundary, so no caller can persist a record
//! that skips a state or rewrites the past.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use super::state::{SessionState, StateRecord, TransitionEntry, TransitionKind};
use crate::error::{Result, StewardError};

pub struct StateStore {
    path: PathBuf,
    session_id: String,
}

impl StateStore {
    pub fn new(path: impl AsRef<Path>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            session_id: session_id.into(),
        }
    }

    /// Load the current record, or bootstrap a fresh START record if none
    /// exists. Idempotent: calling twice without a save returns equal records.
    pub async fn load(&self) -> Result<StateRecord> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                let record: StateRecord = serde_json::from_str(&content)
                    .map_err(|e| StewardError::StatePersistence(format!(
                        "corrupt state record {}: {}",
                        self.path.display(),
                        e
                    )))?;
                Ok(record)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(session_id = %self.session_id, "No state record, bootstrapping START");
                Ok(StateRecord::new(&self.session_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `record` atomically. Rejects writes whose history does not
    /// extend the persisted history, or whose appended transitions fall
    /// outside the table.
    pub async fn save(&self, record: &StateRecord) -> Result<()> {
        if let Ok(content) = fs::read_to_string(&self.path).await {
            let previous: StateRecord = serde_json::from_str(&content)
                .map_err(|e| StewardError::StatePersistence(format!(
                    "corrupt state record {}: {}",
                    self.path.display(),
                    e
                )))?;
            Self::validate_against(&previous, record)?;
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&temp, &json).await?;
        fs::rename(&temp, &self.path).await.inspect_err(|_| {
            let _ = std::fs::remove_file(&temp);
        })?;

        info!(
            session_id = %record.session_id,
            state = %record.state,
            dirty = record.dirty,
            "State record saved"
        );
        Ok(())
    }

    fn validate_against(previous: &StateRecord, next: &StateRecord) -> Result<()> {
        if next.history.len() < previous.history.len() {
            return Err(StewardError::Integrity(
                "state record write would truncate history".into(),
            ));
        }
        for (old, new) in previous.history.iter().zip(next.history.iter()) {
            if old.from != new.from || old.to != new.to || old.at != new.at {
                return Err(StewardError::Integrity(
                    "state record write would rewrite history".into(),
                ));
            }
        }
        for entry in &next.history[previous.history.len()..] {
            if !Self::transition_permitted(entry) {
                return Err(StewardError::InvalidStateTransition {
                    from: entry.from.to_string(),
                    to: entry.to.to_string(),
                    allowed: entry
                        .from
                        .allowed_transitions()
                        .iter()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
        Ok(())
    }

    fn transition_permitted(entry: &TransitionEntry) -> bool {
        match entry.kind {
            TransitionKind::Forward => entry.from.can_transition_to(entry.to),
            // Rollback target is wherever the checkpoint was taken.
            TransitionKind::Recovery => true,
            // Reopen is the one sanctioned exit from COMPLETE.
            TransitionKind::Reopen => {
                entry.from == SessionState::Complete && entry.to == SessionState::Implement
            }
        }
    }
}
