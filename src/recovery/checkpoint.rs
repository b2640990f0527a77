use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::error::Result;
use crate::session::{SessionState, StateRecord};

/// Upper bound on the stored context summary. Checkpoints record resumption
/// points, not transcripts.
const MAX_CONTEXT_SNAPSHOT: usize = 4_096;

/// Immutable recovery snapshot, owned by exactly one session. Only the
/// newest snapshot per session is consulted on recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub checkpoint_at: DateTime<Utc>,
    /// State whose procedure gets re-run idempotently on recovery.
    pub state: SessionState,
    pub context_snapshot: String,
    pub pending_actions: Vec<String>,
}

impl Checkpoint {
    pub fn from_record(
        record: &StateRecord,
        id: impl Into<String>,
        context_snapshot: impl Into<String>,
        pending_actions: Vec<String>,
    ) -> Self {
        let mut snapshot: String = context_snapshot.into();
        if snapshot.len() > MAX_CONTEXT_SNAPSHOT {
            snapshot.truncate(
                snapshot
                    .char_indices()
                    .take_while(|(i, _)| *i < MAX_CONTEXT_SNAPSHOT)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0),
            );
        }
        Self {
            id: id.into(),
            session_id: record.session_id.clone(),
            checkpoint_at: Utc::now(),
            state: record.state,
            context_snapshot: snapshot,
            pending_actions,
        }
    }
}

pub struct CheckpointManager {
    checkpoints_dir: PathBuf,
    counter: std::sync::atomic::AtomicU32,
    last_created: Mutex<Option<Instant>>,
}

impl CheckpointManager {
    pub fn new(checkpoints_dir: impl AsRef<Path>) -> Self {
        Self {
            checkpoints_dir: checkpoints_dir.as_ref().to_path_buf(),
            counter: std::sync::atomic::AtomicU32::new(0),
            last_created: Mutex::new(None),
        }
    }

    /// True when `interval` has elapsed since this manager last wrote a
    /// checkpoint. A manager that has written nothing yet is always due.
    pub fn due(&self, interval: Duration) -> bool {
        match *self.last_created.lock() {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    fn checkpoint_file(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir.join(format!("{}.json", checkpoint_id))
    }

    /// Snapshot the current procedure. Best-effort at call sites on the
    /// interval timer; errors here are surfaced but a missed checkpoint is
    /// not itself a session failure.
    pub async fn create(
        &self,
        record: &StateRecord,
        context_snapshot: impl Into<String>,
        pending_actions: Vec<String>,
    ) -> Result<Checkpoint> {
        let seq = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let id = format!("{}_checkpoint-{:03}", timestamp, seq);

        let checkpoint = Checkpoint::from_record(record, id, context_snapshot, pending_actions);
        self.save(&checkpoint).await?;
        *self.last_created.lock() = Some(Instant::now());
        Ok(checkpoint)
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.checkpoints_dir).await?;

        let file = self.checkpoint_file(&checkpoint.id);
        let temp = file.with_extension("json.tmp");

        // Atomic write: serialize, temp file, rename.
        let json = serde_json::to_string_pretty(checkpoint)?;
        fs::write(&temp, &json).await?;
        fs::rename(&temp, &file).await.inspect_err(|_| {
            let _ = std::fs::remove_file(&temp);
        })?;

        info!(
            checkpoint_id = %checkpoint.id,
            session_id = %checkpoint.session_id,
            state = %checkpoint.state,
            "Checkpoint saved"
        );
        Ok(())
    }

    pub async fn load(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let content = fs::read_to_string(self.checkpoint_file(checkpoint_id)).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn checkpoint_ids(&self) -> Result<Vec<String>> {
        if !self.checkpoints_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.checkpoints_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(name) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(name.to_string());
            }
        }
        // Timestamp-prefixed names sort chronologically.
        ids.sort();
        Ok(ids)
    }

    /// The most recent checkpoint, if any. An unreadable latest file is
    /// treated as absent rather than fatal.
    pub async fn latest(&self) -> Result<Option<Checkpoint>> {
        let ids = self.checkpoint_ids().await?;
        let Some(latest_id) = ids.last() else {
            return Ok(None);
        };

        match self.load(latest_id).await {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!(checkpoint_id = %latest_id, error = %e, "Failed to load latest checkpoint");
                Ok(None)
            }
        }
    }

    /// Prune old checkpoints, keeping the newest `keep_count`.
    pub async fn cleanup_old(&self, keep_count: usize) -> Result<usize> {
        let ids = self.checkpoint_ids().await?;
        if ids.len() <= keep_count {
            return Ok(0);
        }

        let mut deleted = 0;
        for id in &ids[..ids.len() - keep_count] {
            if fs::remove_file(self.checkpoint_file(id)).await.is_ok() {
                deleted += 1;
            }
        }
        info!(deleted, "Cleaned up old checkpoints");
        Ok(deleted)
    }
}
