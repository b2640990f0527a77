//! Tier expansion gate.
//!
//! Tiering turns unbounded work generation into validated increments: a new
//! tier's features only enter the ledger once the previous tier has earned
//! it. Expansion is append-only; existing features are never replaced.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::ledger::{Feature, FeatureLedger, FeatureStatus, Priority, Tier};
use crate::error::{Result, StewardError};
use crate::health::HealthStatus;

/// Generates the feature set for a tier. The production implementation sits
/// behind this seam (planner, template, operator input); tests script it.
#[async_trait]
pub trait FeatureSource: Send + Sync {
    async fn generate(&self, tier: Tier) -> Result<Vec<Feature>>;
}

/// Operator-authored backlog file: a JSON array of features, each tagged with
/// the tier it belongs to. `generate` returns the entries for one tier.
pub struct BacklogSource {
    path: PathBuf,
}

impl BacklogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeatureSource for BacklogSource {
    async fn generate(&self, tier: Tier) -> Result<Vec<Feature>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "No backlog file, nothing to generate");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let features: Vec<Feature> = serde_json::from_str(&content)?;
        Ok(features.into_iter().filter(|f| f.tier == tier).collect())
    }
}

pub struct TierGate {
    source: Arc<dyn FeatureSource>,
}

/// Why an expansion request was refused, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandDenial {
    IncompleteP0 { remaining: usize },
    Unhealthy(HealthStatus),
    BlockedFeatures { count: usize },
    NoNextTier,
}

impl std::fmt::Display for ExpandDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncompleteP0 { remaining } => {
                write!(f, "{} P0 feature(s) not completed", remaining)
            }
            Self::Unhealthy(status) => write!(f, "health is {}", status),
            Self::BlockedFeatures { count } => write!(f, "{} blocked feature(s)", count),
            Self::NoNextTier => write!(f, "polish is the final tier"),
        }
    }
}

impl TierGate {
    pub fn new(source: Arc<dyn FeatureSource>) -> Self {
        Self { source }
    }

    /// Expansion requires: every P0 in the current tier completed, a healthy
    /// latest probe, and no blocked feature in the current tier.
    pub fn can_expand(
        ledger: &FeatureLedger,
        current: Tier,
        health: HealthStatus,
    ) -> std::result::Result<(), ExpandDenial> {
        if current.next().is_none() {
            return Err(ExpandDenial::NoNextTier);
        }
        if !health.is_healthy() {
            return Err(ExpandDenial::Unhealthy(health));
        }

        let in_tier = || {
            ledger
                .features()
                .iter()
                .filter(move |f| !f.archived && f.tier == current)
        };

        let incomplete_p0 = in_tier()
            .filter(|f| f.priority == Priority::P0 && f.status != FeatureStatus::Completed)
            .count();
        if incomplete_p0 > 0 {
            return Err(ExpandDenial::IncompleteP0 {
                remaining: incomplete_p0,
            });
        }

        let blocked = in_tier().filter(|f| f.is_blocked()).count();
        if blocked > 0 {
            return Err(ExpandDenial::BlockedFeatures { count: blocked });
        }

        Ok(())
    }

    /// Generate the next tier's features and append them. Returns the new
    /// active tier and how many features arrived.
    pub async fn expand(
        &self,
        ledger: &mut FeatureLedger,
        current: Tier,
        health: HealthStatus,
    ) -> Result<(Tier, Vec<Feature>)> {
        if let Err(denial) = Self::can_expand(ledger, current, health) {
            return Err(StewardError::Other(format!(
                "cannot expand beyond {}: {}",
                current, denial
            )));
        }

        // can_expand already established a next tier exists.
        let next = current
            .next()
            .ok_or_else(|| StewardError::Other("no tier beyond polish".into()))?;

        let mut generated = self.source.generate(next).await?;
        for feature in &mut generated {
            feature.tier = next;
        }
        for feature in &generated {
            ledger.append(feature.clone())?;
        }
        ledger.check_dependency_graph()?;

        info!(tier = %next, count = generated.len(), "Tier expanded");
        Ok((next, generated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<Feature>);

    #[async_trait]
    impl FeatureSource for FixedSource {
        async fn generate(&self, _tier: Tier) -> Result<Vec<Feature>> {
            Ok(self.0.clone())
        }
    }

    fn completed_mvp_ledger() -> FeatureLedger {
        let mut ledger = FeatureLedger::in_memory("/tmp/unused.json");
        let mut f = Feature::new("F001", "core").with_priority(Priority::P0);
        f.status = FeatureStatus::Completed;
        ledger.append(f).unwrap();
        ledger
    }

    #[test]
    fn test_denied_while_p0_incomplete() {
        let mut ledger = FeatureLedger::in_memory("/tmp/unused.json");
        ledger
            .append(Feature::new("F001", "core").with_priority(Priority::P0))
            .unwrap();

        let denial =
            TierGate::can_expand(&ledger, Tier::Mvp, HealthStatus::Healthy).unwrap_err();
        assert_eq!(denial, ExpandDenial::IncompleteP0 { remaining: 1 });
    }

    #[test]
    fn test_denied_while_unhealthy() {
        let ledger = completed_mvp_ledger();
        let denial =
            TierGate::can_expand(&ledger, Tier::Mvp, HealthStatus::Broken).unwrap_err();
        assert_eq!(denial, ExpandDenial::Unhealthy(HealthStatus::Broken));
        // UNKNOWN is not HEALTHY either.
        assert!(TierGate::can_expand(&ledger, Tier::Mvp, HealthStatus::Unknown).is_err());
    }

    #[test]
    fn test_denied_with_blocked_feature() {
        let mut ledger = completed_mvp_ledger();
        ledger.append(Feature::new("F002", "flaky")).unwrap();
        ledger.block("F002", "tool failure").unwrap();
        // F002 is P1, so P0 completion holds; blockage alone denies.
        let denial =
            TierGate::can_expand(&ledger, Tier::Mvp, HealthStatus::Healthy).unwrap_err();
        assert_eq!(denial, ExpandDenial::BlockedFeatures { count: 1 });
    }

    #[test]
    fn test_polish_has_no_successor() {
        let ledger = completed_mvp_ledger();
        let denial =
            TierGate::can_expand(&ledger, Tier::Polish, HealthStatus::Healthy).unwrap_err();
        assert_eq!(denial, ExpandDenial::NoNextTier);
    }

    #[tokio::test]
    async fn test_backlog_source_filters_by_tier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backlog.json");
        let backlog = vec![
            Feature::new("F001", "login"),
            Feature::new("F100", "search").with_tier(Tier::Expansion),
        ];
        std::fs::write(&path, serde_json::to_string(&backlog).unwrap()).unwrap();

        let source = BacklogSource::new(&path);
        let mvp = source.generate(Tier::Mvp).await.unwrap();
        assert_eq!(mvp.len(), 1);
        assert_eq!(mvp[0].id, "F001");

        let expansion = source.generate(Tier::Expansion).await.unwrap();
        assert_eq!(expansion.len(), 1);
        assert_eq!(expansion[0].id, "F100");
    }

    #[tokio::test]
    async fn test_backlog_source_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = BacklogSource::new(dir.path().join("absent.json"));
        assert!(source.generate(Tier::Mvp).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expand_appends_and_retags_tier() {
        let mut ledger = completed_mvp_ledger();
        let gate = TierGate::new(Arc::new(FixedSource(vec![
            Feature::new("F100", "search"),
            Feature::new("F101", "filters").with_dependencies(vec!["F100".into()]),
        ])));

        let (next, added) = gate
            .expand(&mut ledger, Tier::Mvp, HealthStatus::Healthy)
            .await
            .unwrap();

        assert_eq!(next, Tier::Expansion);
        assert_eq!(added.len(), 2);
        assert!(ledger
            .features()
            .iter()
            .filter(|f| f.tier == Tier::Expansion)
            .count()
            == 2);
        // Existing features untouched.
        assert_eq!(ledger.get("F001").unwrap().status, FeatureStatus::Completed);
    }
}
