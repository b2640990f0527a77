//! Durable, ordered collection of schedulable work items.
//!
//! Features are append-only at the collection level: tier expansion adds,
//! nothing deletes. Retirement is archival, which keeps the audit trail while
//! removing the feature from aggregates and scheduling.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, StewardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Pending,
    Implemented,
    Tested,
    Completed,
}

impl FeatureStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Implemented => 1,
            Self::Tested => 2,
            Self::Completed => 3,
        }
    }

    /// Forward-only, per the monotonic lifecycle. Equal status is a no-op
    /// elsewhere, not a transition.
    pub fn can_advance_to(self, target: FeatureStatus) -> bool {
        target.rank() > self.rank()
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Implemented => "implemented",
            Self::Tested => "tested",
            Self::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Scope tier. A feature is visible to the controller only while its tier is
/// at or below the ledger's active tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Mvp,
    Expansion,
    Polish,
}

impl Tier {
    pub fn next(self) -> Option<Tier> {
        match self {
            Self::Mvp => Some(Self::Expansion),
            Self::Expansion => Some(Self::Polish),
            Self::Polish => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mvp => "mvp",
            Self::Expansion => "expansion",
            Self::Polish => "polish",
        };
        write!(f, "{}", s)
    }
}

/// Reporting/ordering priority. Not a concurrency-control input.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Priority {
    P0,
    #[default]
    P1,
    P2,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P0 => write!(f, "P0"),
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: FeatureStatus,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Set when transient-retry exhaustion leaves the feature stuck; cleared
    /// on the next successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Feature {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: FeatureStatus::Pending,
            tier: Tier::Mvp,
            priority: Priority::P1,
            dependencies: Vec::new(),
            blocked_reason: None,
            archived: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_reason.is_some()
    }
}

/// Counts consumed by the session controller's decision function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureAggregate {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub blocked: usize,
}

impl FeatureAggregate {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerMetadata {
    total: usize,
    completed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerDocument {
    features: Vec<Feature>,
    metadata: LedgerMetadata,
}

pub struct FeatureLedger {
    path: PathBuf,
    features: Vec<Feature>,
}

impl FeatureLedger {
    /// Load the ledger, or start empty if no file exists yet.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let features = match fs::read_to_string(&path).await {
            Ok(content) => {
                let doc: LedgerDocument = serde_json::from_str(&content)
                    .map_err(|e| StewardError::StatePersistence(format!(
                        "corrupt feature ledger {}: {}",
                        path.display(),
                        e
                    )))?;
                doc.features
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, features })
    }

    pub fn in_memory(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            features: Vec::new(),
        }
    }

    pub async fn save(&self) -> Result<()> {
        let doc = LedgerDocument {
            metadata: LedgerMetadata {
                total: self.features.iter().filter(|f| !f.archived).count(),
                completed: self
                    .features
                    .iter()
                    .filter(|f| !f.archived && f.status == FeatureStatus::Completed)
                    .count(),
            },
            features: self.features.clone(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&doc)?;
        fs::write(&temp, &json).await?;
        fs::rename(&temp, &self.path).await.inspect_err(|_| {
            let _ = std::fs::remove_file(&temp);
        })?;
        debug!(total = doc.metadata.total, completed = doc.metadata.completed, "Ledger saved");
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.features.iter().all(|f| f.archived)
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    /// Append a new feature. Appending an id that already exists is rejected;
    /// ids are stable for the ledger's lifetime.
    pub fn append(&mut self, feature: Feature) -> Result<()> {
        if self.features.iter().any(|f| f.id == feature.id) {
            return Err(StewardError::Config(format!(
                "duplicate feature id: {}",
                feature.id
            )));
        }
        info!(feature_id = %feature.id, tier = %feature.tier, "Feature appended");
        self.features.push(feature);
        Ok(())
    }

    /// Counts over unarchived features with tier <= `tier_ceiling`.
    pub fn aggregate(&self, tier_ceiling: Tier) -> FeatureAggregate {
        let mut agg = FeatureAggregate::default();
        for f in self.visible(tier_ceiling) {
            agg.total += 1;
            match f.status {
                FeatureStatus::Completed => agg.completed += 1,
                FeatureStatus::Pending if f.is_blocked() => {
                    agg.pending += 1;
                    agg.blocked += 1;
                }
                FeatureStatus::Pending => agg.pending += 1,
                _ => {}
            }
        }
        agg
    }

    fn visible(&self, tier_ceiling: Tier) -> impl Iterator<Item = &Feature> {
        self.features
            .iter()
            .filter(move |f| !f.archived && f.tier <= tier_ceiling)
    }

    /// The lowest-id pending feature whose dependencies are all completed.
    /// Blocked features are reported, not scheduled.
    ///
    /// `Ok(None)` means nothing schedulable right now (no pending work, or
    /// everything pending is stalled behind a blocked feature). Pending work
    /// with no eligible node and no blockage to explain it means the
    /// dependency graph can never make progress (cycle or unknown id) and is
    /// surfaced as a fatal configuration error rather than retried.
    pub fn next_pending(&self, tier_ceiling: Tier) -> Result<Option<&Feature>> {
        let by_id: HashMap<&str, &Feature> = self
            .features
            .iter()
            .map(|f| (f.id.as_str(), f))
            .collect();

        let pending: Vec<&Feature> = self
            .visible(tier_ceiling)
            .filter(|f| f.status == FeatureStatus::Pending && !f.is_blocked())
            .collect();

        if pending.is_empty() {
            return Ok(None);
        }

        let eligible = pending
            .iter()
            .filter(|f| {
                f.dependencies.iter().all(|dep| {
                    by_id
                        .get(dep.as_str())
                        .is_some_and(|d| d.status == FeatureStatus::Completed)
                })
            })
            .min_by(|a, b| a.id.cmp(&b.id));

        match eligible {
            Some(f) => Ok(Some(*f)),
            None => {
                let any_blocked = self.visible(tier_ceiling).any(|f| f.is_blocked());
                if any_blocked {
                    // Stalled behind blocked features: transient, not a
                    // configuration fault.
                    Ok(None)
                } else {
                    Err(StewardError::DependencyGraph(format!(
                        "{} pending feature(s) but none eligible: {}",
                        pending.len(),
                        Self::describe_stuck(&pending, &by_id)
                    )))
                }
            }
        }
    }

    fn describe_stuck(pending: &[&Feature], by_id: &HashMap<&str, &Feature>) -> String {
        pending
            .iter()
            .map(|f| {
                let unmet: Vec<&str> = f
                    .dependencies
                    .iter()
                    .filter(|dep| {
                        !by_id
                            .get(dep.as_str())
                            .is_some_and(|d| d.status == FeatureStatus::Completed)
                    })
                    .map(|s| s.as_str())
                    .collect();
                format!("{} waits on [{}]", f.id, unmet.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Apply one monotonic status transition. Marking a status the feature
    /// already reached is a no-op, which is what makes recovery replays safe.
    pub fn mark(&mut self, id: &str, status: FeatureStatus) -> Result<()> {
        let dep_check = self.dependencies_completed(id)?;
        let feature = self
            .features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| StewardError::FeatureNotFound(id.to_string()))?;

        if feature.status == status {
            debug!(feature_id = id, status = %status, "Mark is a no-op");
            return Ok(());
        }
        if !feature.status.can_advance_to(status) {
            return Err(StewardError::InvalidFeatureTransition {
                id: id.to_string(),
                from: feature.status.to_string(),
                to: status.to_string(),
            });
        }
        // A feature may not leave pending while a declared dependency is
        // incomplete.
        if feature.status == FeatureStatus::Pending && !dep_check {
            return Err(StewardError::DependencyGraph(format!(
                "feature {} has incomplete dependencies",
                id
            )));
        }

        info!(feature_id = id, from = %feature.status, to = %status, "Feature marked");
        feature.status = status;
        feature.blocked_reason = None;
        Ok(())
    }

    fn dependencies_completed(&self, id: &str) -> Result<bool> {
        let feature = self
            .get(id)
            .ok_or_else(|| StewardError::FeatureNotFound(id.to_string()))?;
        Ok(feature.dependencies.iter().all(|dep| {
            self.get(dep)
                .is_some_and(|d| d.status == FeatureStatus::Completed)
        }))
    }

    /// Explicit backward reset, the only sanctioned non-monotonic move.
    pub fn reset(&mut self, id: &str) -> Result<()> {
        let feature = self
            .features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| StewardError::FeatureNotFound(id.to_string()))?;
        info!(feature_id = id, from = %feature.status, "Feature reset to pending");
        feature.status = FeatureStatus::Pending;
        feature.blocked_reason = None;
        Ok(())
    }

    /// Record transient-retry exhaustion. The feature stays pending and is
    /// reported with its reason rather than dropped.
    pub fn block(&mut self, id: &str, reason: impl Into<String>) -> Result<()> {
        let feature = self
            .features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| StewardError::FeatureNotFound(id.to_string()))?;
        feature.blocked_reason = Some(reason.into());
        Ok(())
    }

    /// Features never leave the ledger; archival removes them from
    /// aggregates and scheduling while preserving auditability.
    pub fn archive(&mut self, id: &str) -> Result<()> {
        let feature = self
            .features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| StewardError::FeatureNotFound(id.to_string()))?;
        feature.archived = true;
        Ok(())
    }

    pub fn blocked_features(&self, tier_ceiling: Tier) -> Vec<&Feature> {
        self.visible(tier_ceiling).filter(|f| f.is_blocked()).collect()
    }

    /// Tier ids referenced by any current feature, used to infer the active
    /// tier after a restart.
    pub fn highest_tier(&self) -> Tier {
        self.features
            .iter()
            .filter(|f| !f.archived)
            .map(|f| f.tier)
            .max()
            .unwrap_or_default()
    }

    /// Detect cycles in the declared dependency graph. Run at load time so a
    /// bad configuration fails before any work is attempted.
    pub fn check_dependency_graph(&self) -> Result<()> {
        let by_id: HashMap<&str, &Feature> = self
            .features
            .iter()
            .map(|f| (f.id.as_str(), f))
            .collect();

        for feature in &self.features {
            for dep in &feature.dependencies {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(StewardError::DependencyGraph(format!(
                        "feature {} depends on unknown id {}",
                        feature.id, dep
                    )));
                }
            }
        }

        // Iterative DFS with a visiting set catches cycles.
        let mut done: HashSet<&str> = HashSet::new();
        for feature in &self.features {
            if done.contains(feature.id.as_str()) {
                continue;
            }
            let mut visiting: HashSet<&str> = HashSet::new();
            let mut stack: Vec<(&str, usize)> = vec![(feature.id.as_str(), 0)];
            visiting.insert(feature.id.as_str());

            while let Some((id, dep_idx)) = stack.pop() {
                let deps = &by_id[id].dependencies;
                if dep_idx >= deps.len() {
                    visiting.remove(id);
                    done.insert(id);
                    continue;
                }
                stack.push((id, dep_idx + 1));
                let dep = deps[dep_idx].as_str();
                if done.contains(dep) {
                    continue;
                }
                if !visiting.insert(dep) {
                    return Err(StewardError::DependencyGraph(format!(
                        "dependency cycle involving {}",
                        dep
                    )));
                }
                stack.push((dep, 0));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(features: Vec<Feature>) -> FeatureLedger {
        let mut ledger = FeatureLedger::in_memory("/tmp/unused.json");
        for f in features {
            ledger.append(f).unwrap();
        }
        ledger
    }

    #[test]
    fn test_aggregate_respects_tier_ceiling() {
        let ledger = ledger_with(vec![
            Feature::new("F001", "login"),
            Feature::new("F002", "search").with_tier(Tier::Expansion),
            Feature::new("F003", "themes").with_tier(Tier::Polish),
        ]);

        assert_eq!(ledger.aggregate(Tier::Mvp).total, 1);
        assert_eq!(ledger.aggregate(Tier::Expansion).total, 2);
        assert_eq!(ledger.aggregate(Tier::Polish).total, 3);
    }

    #[test]
    fn test_next_pending_lowest_id_with_deps_met() {
        let mut ledger = ledger_with(vec![
            Feature::new("F001", "schema"),
            Feature::new("F002", "api").with_dependencies(vec!["F001".into()]),
        ]);

        assert_eq!(ledger.next_pending(Tier::Mvp).unwrap().unwrap().id, "F001");

        ledger.mark("F001", FeatureStatus::Completed).unwrap();
        assert_eq!(ledger.next_pending(Tier::Mvp).unwrap().unwrap().id, "F002");
    }

    #[test]
    fn test_next_pending_unsatisfiable_is_fatal() {
        let ledger = ledger_with(vec![
            Feature::new("F001", "a").with_dependencies(vec!["F002".into()]),
            Feature::new("F002", "b").with_dependencies(vec!["F001".into()]),
        ]);

        let err = ledger.next_pending(Tier::Mvp).unwrap_err();
        assert!(matches!(err, StewardError::DependencyGraph(_)));
    }

    #[test]
    fn test_mark_is_monotonic() {
        let mut ledger = ledger_with(vec![Feature::new("F001", "login")]);

        ledger.mark("F001", FeatureStatus::Implemented).unwrap();
        ledger.mark("F001", FeatureStatus::Tested).unwrap();

        let err = ledger.mark("F001", FeatureStatus::Pending).unwrap_err();
        assert!(matches!(err, StewardError::InvalidFeatureTransition { .. }));

        ledger.reset("F001").unwrap();
        assert_eq!(ledger.get("F001").unwrap().status, FeatureStatus::Pending);
    }

    #[test]
    fn test_mark_same_status_is_noop() {
        let mut ledger = ledger_with(vec![Feature::new("F001", "login")]);
        ledger.mark("F001", FeatureStatus::Implemented).unwrap();
        // Recovery replays mark the same status again; must not error.
        ledger.mark("F001", FeatureStatus::Implemented).unwrap();
        assert_eq!(
            ledger.get("F001").unwrap().status,
            FeatureStatus::Implemented
        );
    }

    #[test]
    fn test_mark_blocked_on_incomplete_dependency() {
        let mut ledger = ledger_with(vec![
            Feature::new("F001", "schema"),
            Feature::new("F002", "api").with_dependencies(vec!["F001".into()]),
        ]);

        let err = ledger.mark("F002", FeatureStatus::Implemented).unwrap_err();
        assert!(matches!(err, StewardError::DependencyGraph(_)));
    }

    #[test]
    fn test_archive_keeps_feature_out_of_aggregate() {
        let mut ledger = ledger_with(vec![
            Feature::new("F001", "login"),
            Feature::new("F002", "search"),
        ]);

        ledger.archive("F002").unwrap();
        assert_eq!(ledger.aggregate(Tier::Mvp).total, 1);
        // Still present for audit.
        assert!(ledger.get("F002").is_some());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut ledger = ledger_with(vec![Feature::new("F001", "login")]);
        let err = ledger.append(Feature::new("F001", "again")).unwrap_err();
        assert!(matches!(err, StewardError::Config(_)));
    }

    #[test]
    fn test_cycle_detection() {
        let ledger = ledger_with(vec![
            Feature::new("F001", "a").with_dependencies(vec!["F003".into()]),
            Feature::new("F002", "b").with_dependencies(vec!["F001".into()]),
            Feature::new("F003", "c").with_dependencies(vec!["F002".into()]),
        ]);
        assert!(matches!(
            ledger.check_dependency_graph(),
            Err(StewardError::DependencyGraph(_))
        ));

        let ok = ledger_with(vec![
            Feature::new("F001", "a"),
            Feature::new("F002", "b").with_dependencies(vec!["F001".into()]),
        ]);
        assert!(ok.check_dependency_graph().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_reload_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("feature-list.json");

        let mut ledger = FeatureLedger::load(&path).await.unwrap();
        ledger.append(Feature::new("F001", "login")).unwrap();
        ledger.mark("F001", FeatureStatus::Implemented).unwrap();
        ledger.save().await.unwrap();

        let reloaded = FeatureLedger::load(&path).await.unwrap();
        assert_eq!(
            reloaded.get("F001").unwrap().status,
            FeatureStatus::Implemented
        );
        assert_eq!(reloaded.aggregate(Tier::Mvp).total, 1);
    }
}
