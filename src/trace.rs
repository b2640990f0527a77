//! Advisory decision traces.
//!
//! Every appended feature gets a bookkeeping trace, and outcomes can be
//! updated as work lands. The store is deliberately non-blocking: trace
//! failures are logged and swallowed, and `mark` never waits on an outcome
//! update.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub decision: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    #[serde(default)]
    pub auto: bool,
}

pub struct TraceStore {
    path: PathBuf,
}

impl TraceStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn read_all(&self) -> Result<Vec<DecisionTrace>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, traces: &[DecisionTrace]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, serde_json::to_string_pretty(traces)?).await?;
        fs::rename(&temp, &self.path).await.inspect_err(|_| {
            let _ = std::fs::remove_file(&temp);
        })?;
        Ok(())
    }

    /// Append a "feature created" trace. Best-effort.
    pub async fn record_feature_created(&self, feature_id: &str, title: &str) {
        let trace = DecisionTrace {
            id: format!(
                "trace-{}-{}",
                feature_id,
                &uuid::Uuid::new_v4().to_string()[..8]
            ),
            timestamp: Utc::now(),
            category: "feature".into(),
            decision: format!("Feature created: {}", title),
            outcome: "pending".into(),
            feature_id: Some(feature_id.to_string()),
            auto: true,
        };

        if let Err(e) = self.append(trace).await {
            warn!(feature_id, error = %e, "Failed to store decision trace");
        }
    }

    /// Set the outcome of the newest trace for `feature_id`. Advisory: the
    /// caller's mutation has already happened and is not rolled back.
    pub async fn update_outcome(&self, feature_id: &str, outcome: &str) {
        let result = async {
            let mut traces = self.read_all().await?;
            if let Some(trace) = traces
                .iter_mut()
                .rev()
                .find(|t| t.feature_id.as_deref() == Some(feature_id))
            {
                trace.outcome = outcome.to_string();
                self.write_all(&traces).await?;
            }
            Ok::<_, crate::error::StewardError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(feature_id, error = %e, "Failed to update trace outcome");
        }
    }

    async fn append(&self, trace: DecisionTrace) -> Result<()> {
        let mut traces = self.read_all().await?;
        debug!(trace_id = %trace.id, "Trace appended");
        traces.push(trace);
        self.write_all(&traces).await
    }

    pub async fn all(&self) -> Result<Vec<DecisionTrace>> {
        self.read_all().await
    }
}
