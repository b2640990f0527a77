//! The per-session state machine.
//!
//! The decision function is pure and separated from its side-effecting I/O:
//! `decide` looks only at (health, aggregate, dirty). Everything durable goes
//! through `StateStore`/`FeatureLedger`; recovery runs once, before the first
//! forward transition.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::guard::MutationGuard;
use super::ledger::{Feature, FeatureAggregate, FeatureLedger, FeatureStatus, Tier};
use super::state::{SessionState, StateRecord};
use super::store::StateStore;
use super::tier::{FeatureSource, TierGate};
use crate::config::SessionPaths;
use crate::error::{Result, StewardError};
use crate::health::{HealthCheck, HealthStatus, ProbeReport};
use crate::recovery::{CheckpointManager, RecoveryPlan, recover};
use crate::retry::RetryPolicy;
use crate::trace::TraceStore;

/// Default cadence for interval checkpoints during active work.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(300);

/// Executes the actual code change and verification for one feature. Sits
/// behind a seam so the controller stays testable without a real toolchain.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn implement(&self, feature: &Feature) -> Result<()>;

    /// Local verification of the feature's changes. `Ok(false)` means the
    /// change needs rework, not that the invocation failed.
    async fn verify(&self, feature: &Feature) -> Result<bool>;
}

/// What one entry protocol run decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryReport {
    pub directory: PathBuf,
    pub health_status: HealthStatus,
    pub feature_status: FeatureAggregate,
    pub current_state: SessionState,
    pub next_state: SessionState,
    pub latest_summary: Option<String>,
}

/// Pure transition decision. A dirty record must finish recovery before any
/// forward decision is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Recover,
    Next(SessionState),
}

pub fn decide(health: HealthStatus, aggregate: &FeatureAggregate, dirty: bool) -> Decision {
    if dirty {
        return Decision::Recover;
    }
    // BROKEN pre-empts everything else.
    if health.is_broken() {
        return Decision::Next(SessionState::FixBroken);
    }
    if aggregate.is_empty() {
        return Decision::Next(SessionState::Init);
    }
    if aggregate.pending > 0 {
        return Decision::Next(SessionState::Implement);
    }
    Decision::Next(SessionState::Complete)
}

/// Result of one implement pass.
#[derive(Debug, Clone, Default)]
pub struct ImplementOutcome {
    pub completed: Vec<String>,
    pub reworked: Vec<String>,
    pub blocked: Vec<(String, String)>,
}

impl ImplementOutcome {
    pub fn made_progress(&self) -> bool {
        !self.completed.is_empty()
    }
}

pub struct SessionController {
    paths: SessionPaths,
    store: StateStore,
    record: StateRecord,
    ledger: FeatureLedger,
    probe: Arc<dyn HealthCheck>,
    guard: MutationGuard,
    checkpoints: CheckpointManager,
    traces: TraceStore,
    retry: RetryPolicy,
    active_tier: Tier,
    cancelled: Arc<AtomicBool>,
}

impl SessionController {
    /// Open (or bootstrap) the session rooted at `paths`. Fails fast on a
    /// corrupt ledger or an unsatisfiable dependency graph.
    pub async fn open(paths: SessionPaths, probe: Arc<dyn HealthCheck>) -> Result<Self> {
        let session_id = paths
            .root()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("session")
            .to_string();

        let store = StateStore::new(paths.state_file(), &session_id);
        let record = store.load().await?;
        let ledger = FeatureLedger::load(paths.feature_list_file()).await?;
        ledger.check_dependency_graph()?;

        let active_tier = ledger.highest_tier();
        let checkpoints = CheckpointManager::new(paths.checkpoints_dir());
        let traces = TraceStore::new(paths.traces_file());

        Ok(Self {
            paths,
            store,
            record,
            ledger,
            probe,
            guard: MutationGuard::new(),
            checkpoints,
            traces,
            retry: RetryPolicy::default(),
            active_tier,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_guard(mut self, guard: MutationGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn record(&self) -> &StateRecord {
        &self.record
    }

    pub fn ledger(&self) -> &FeatureLedger {
        &self.ledger
    }

    pub fn active_tier(&self) -> Tier {
        self.active_tier
    }

    /// Flag checked at idempotent boundaries. Setting it never leaves a
    /// feature mutation half-applied.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Run the full entry protocol: recover if dirty, probe health, read the
    /// aggregate, decide the next state. Read-mostly: the only writes are the
    /// recovery rollback, the health observation, and a pre-emptive
    /// FIX_BROKEN transition.
    pub async fn entry(&mut self) -> Result<EntryReport> {
        let plan = recover(&mut self.record, &self.checkpoints).await?;
        if plan != RecoveryPlan::Clean {
            // The rollback restored the last durable state; interrupted work
            // is still encoded as pending features and re-runs through the
            // normal procedure for whatever state is decided below.
            self.record.finish_procedure();
            self.store.save(&self.record).await?;
        }

        let report = self.probe_health().await?;
        self.record.observe_health(report.status);

        // Pre-emptive: BROKEN forces FIX_BROKEN from any state, before any
        // feature work is considered.
        if report.status.is_broken() && self.record.state != SessionState::FixBroken {
            self.record
                .transition(SessionState::FixBroken, report.detail.clone())?;
            // The fix procedure itself has not started yet.
            self.record.finish_procedure();
        } else if report.status.is_healthy() && self.record.state == SessionState::FixBroken {
            // The gate holds exactly as long as the last probe was not
            // HEALTHY; a passing probe releases it on the spot.
            self.record
                .transition(SessionState::Init, "health restored")?;
            self.record.finish_procedure();
            info!("Health restored, leaving FIX_BROKEN");
        }
        self.store.save(&self.record).await?;

        let aggregate = self.ledger.aggregate(self.active_tier);
        let next_state = match decide(report.status, &aggregate, self.record.needs_recovery()) {
            Decision::Recover => {
                // recover() above either cleaned the plan or left a rerun
                // pending; a still-dirty record here is an integrity fault.
                return Err(StewardError::Integrity(
                    "record still dirty after recovery".into(),
                ));
            }
            Decision::Next(state) => state,
        };

        let latest_summary = self
            .checkpoints
            .latest()
            .await?
            .map(|c| c.context_snapshot);

        info!(
            session_id = %self.record.session_id,
            health = %report.status,
            current = %self.record.state,
            next = %next_state,
            pending = aggregate.pending,
            "Entry protocol complete"
        );

        Ok(EntryReport {
            directory: self.paths.root().to_path_buf(),
            health_status: report.status,
            feature_status: aggregate,
            current_state: self.record.state,
            next_state,
            latest_summary,
        })
    }

    async fn probe_health(&self) -> Result<ProbeReport> {
        let probe = self.probe.clone();
        // Transient probe errors retry; a completed probe that reports
        // BROKEN is a verdict, not an error.
        self.retry
            .run("health probe", move || {
                let probe = probe.clone();
                async move { probe.probe().await }
            })
            .await
    }

    /// INIT procedure: generate the MVP feature set and persist it. Appends
    /// are feature mutations, so the guard runs before anything else.
    pub async fn run_init(&mut self, source: &dyn FeatureSource) -> Result<usize> {
        self.guard.check(&self.record)?;
        if self.record.state != SessionState::Init {
            self.record.transition(SessionState::Init, "bootstrap")?;
        } else {
            // Already in INIT after a health-gate release; the procedure
            // still runs under the dirty flag.
            self.record.dirty = true;
        }
        self.store.save(&self.record).await?;

        let mut features = source.generate(Tier::Mvp).await?;
        for feature in &mut features {
            feature.tier = Tier::Mvp;
        }
        let count = features.len();
        for feature in features {
            self.traces
                .record_feature_created(&feature.id, &feature.title)
                .await;
            self.ledger.append(feature)?;
        }
        self.ledger.check_dependency_graph()?;
        self.ledger.save().await?;
        self.active_tier = Tier::Mvp;

        self.record.finish_procedure();
        self.store.save(&self.record).await?;
        info!(count, "Session initialized with MVP features");
        Ok(count)
    }

    /// IMPLEMENT procedure: drain eligible pending features one at a time,
    /// entering TEST per feature. Transient tool failures retry with backoff
    /// and then block the feature instead of halting the session.
    pub async fn run_implement(&mut self, invoker: &dyn ToolInvoker) -> Result<ImplementOutcome> {
        if self.record.state != SessionState::Implement {
            self.record
                .transition(SessionState::Implement, "pending features")?;
            self.store.save(&self.record).await?;
        }

        let mut outcome = ImplementOutcome::default();

        loop {
            // Idempotent boundary: nothing is half-applied between loop
            // iterations.
            if self.cancelled.load(Ordering::SeqCst) {
                self.ledger.save().await?;
                self.record.finish_procedure();
                self.store.save(&self.record).await?;
                return Err(StewardError::Cancelled);
            }

            self.guard.check(&self.record)?;

            let Some(feature) = self.ledger.next_pending(self.active_tier)?.cloned() else {
                break;
            };

            // Resumption point: the checkpoint records the feature as still
            // pending, so a crash anywhere below re-runs it as a no-op past
            // whatever already landed.
            if let Err(e) = self
                .checkpoints
                .create(
                    &self.record,
                    format!("implementing {}: {}", feature.id, feature.title),
                    vec![format!("complete {}", feature.id)],
                )
                .await
            {
                warn!(error = %e, "Checkpoint failed, continuing");
            }

            match self.implement_one(invoker, &feature).await {
                Ok(FeatureResult::Completed) => outcome.completed.push(feature.id.clone()),
                Ok(FeatureResult::Reworked) => outcome.reworked.push(feature.id.clone()),
                Ok(FeatureResult::Blocked(reason)) => {
                    outcome.blocked.push((feature.id.clone(), reason));
                }
                Err(e) => {
                    // Fatal or invariant errors halt the procedure cleanly.
                    self.ledger.save().await?;
                    self.store.save(&self.record).await?;
                    return Err(e);
                }
            }
            self.ledger.save().await?;
        }

        // No more eligible work: leave TEST toward COMPLETE or IMPLEMENT per
        // the table, then exit clean.
        let aggregate = self.ledger.aggregate(self.active_tier);
        if self.record.state == SessionState::Implement && aggregate.pending == 0 {
            self.record
                .transition(SessionState::Test, "final verification")?;
            self.record
                .transition(SessionState::Complete, "all features completed")?;
        }
        self.record.finish_procedure();
        self.store.save(&self.record).await?;
        self.ledger.save().await?;

        info!(
            completed = outcome.completed.len(),
            blocked = outcome.blocked.len(),
            "Implement pass finished"
        );
        Ok(outcome)
    }

    async fn implement_one(
        &mut self,
        invoker: &dyn ToolInvoker,
        feature: &Feature,
    ) -> Result<FeatureResult> {
        let invoked = self
            .retry
            .run("tool invocation", || invoker.implement(feature))
            .await;

        if let Err(e) = invoked {
            if e.is_fatal() || e.is_invariant_violation() {
                return Err(e);
            }
            let reason = e.to_string();
            warn!(feature_id = %feature.id, reason = %reason, "Feature blocked");
            self.ledger.block(&feature.id, &reason)?;
            return Ok(FeatureResult::Blocked(reason));
        }

        self.guard
            .check_mark(&self.record, FeatureStatus::Implemented)
            .await?;
        self.ledger.mark(&feature.id, FeatureStatus::Implemented)?;
        self.ledger.save().await?;

        // TEST sub-state for this feature.
        self.record
            .transition(SessionState::Test, format!("verify {}", feature.id))?;
        self.store.save(&self.record).await?;

        let passed = self
            .retry
            .run("verification", || invoker.verify(feature))
            .await?;

        if !passed {
            self.ledger.reset(&feature.id)?;
            self.ledger
                .block(&feature.id, "verification failed, needs rework")?;
            self.record
                .transition(SessionState::Implement, "verification failed")?;
            self.store.save(&self.record).await?;
            return Ok(FeatureResult::Reworked);
        }

        self.guard
            .check_mark(&self.record, FeatureStatus::Tested)
            .await?;
        self.ledger.mark(&feature.id, FeatureStatus::Tested)?;
        self.ledger.mark(&feature.id, FeatureStatus::Completed)?;
        self.traces.update_outcome(&feature.id, "completed").await;

        self.record
            .transition(SessionState::Implement, "feature verified")?;
        self.store.save(&self.record).await?;
        Ok(FeatureResult::Completed)
    }

    /// FIX_BROKEN procedure: re-probe and report. Feature mutations stay
    /// gated until a probe comes back HEALTHY.
    pub async fn run_fix_broken(&mut self) -> Result<ProbeReport> {
        if self.record.state != SessionState::FixBroken {
            self.record
                .transition(SessionState::FixBroken, "health gate")?;
        }
        self.store.save(&self.record).await?;

        let report = self.probe_health().await?;
        self.record.observe_health(report.status);

        if report.status.is_healthy() {
            self.record
                .transition(SessionState::Init, "health restored")?;
            self.record.finish_procedure();
            info!("Health restored, leaving FIX_BROKEN");
        }
        self.store.save(&self.record).await?;
        Ok(report)
    }

    /// Apply one monotonic status transition, guard first. Trace outcome
    /// updates are advisory and never block the mark.
    pub async fn mark_feature(&mut self, id: &str, status: FeatureStatus) -> Result<()> {
        self.guard.check_mark(&self.record, status).await?;
        self.ledger.mark(id, status)?;
        self.ledger.save().await?;
        if status == FeatureStatus::Completed {
            self.traces.update_outcome(id, "completed").await;
        }
        Ok(())
    }

    /// Unconditional checkpoint trigger; a missed checkpoint is never a
    /// session failure.
    pub async fn checkpoint(&self, summary: impl Into<String>) -> Result<()> {
        self.checkpoints
            .create(&self.record, summary, Vec::new())
            .await?;
        Ok(())
    }

    /// Interval trigger for long-running drivers: writes only when
    /// [`CHECKPOINT_INTERVAL`] has elapsed since the last checkpoint, so
    /// callers can poll it every loop iteration. The per-feature checkpoints
    /// in the implement pass refresh the same timer.
    pub async fn checkpoint_if_due(&self, summary: impl Into<String>) -> Result<bool> {
        if !self.checkpoints.due(CHECKPOINT_INTERVAL) {
            return Ok(false);
        }
        self.checkpoints
            .create(&self.record, summary, Vec::new())
            .await?;
        Ok(true)
    }

    /// Manual recovery trigger; also runs implicitly at the top of `entry`.
    pub async fn recover_now(&mut self) -> Result<RecoveryPlan> {
        let plan = recover(&mut self.record, &self.checkpoints).await?;
        if plan != RecoveryPlan::Clean {
            self.record.finish_procedure();
            self.store.save(&self.record).await?;
        }
        Ok(plan)
    }

    /// Ask the tier gate to widen scope. New features are traced and the
    /// active tier advances on success.
    pub async fn expand_tier(&mut self, gate: &TierGate) -> Result<(Tier, usize)> {
        self.guard.check(&self.record)?;
        let (next, added) = gate
            .expand(
                &mut self.ledger,
                self.active_tier,
                self.record.health_status,
            )
            .await?;
        for feature in &added {
            self.traces
                .record_feature_created(&feature.id, &feature.title)
                .await;
        }
        self.ledger.save().await?;
        self.active_tier = next;

        // A completed session reopens when expansion brings new work.
        if self.record.state == SessionState::Complete && !added.is_empty() {
            self.record
                .reopen(format!("tier expanded to {}", next))?;
            self.record.finish_procedure();
            self.store.save(&self.record).await?;
        }
        Ok((next, added.len()))
    }
}

enum FeatureResult {
    Completed,
    Reworked,
    Blocked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate(total: usize, pending: usize) -> FeatureAggregate {
        FeatureAggregate {
            total,
            pending,
            completed: total - pending,
            blocked: 0,
        }
    }

    #[test]
    fn test_decide_broken_preempts() {
        let d = decide(HealthStatus::Broken, &aggregate(3, 3), false);
        assert_eq!(d, Decision::Next(SessionState::FixBroken));
        // Even with an empty ledger.
        let d = decide(HealthStatus::Broken, &aggregate(0, 0), false);
        assert_eq!(d, Decision::Next(SessionState::FixBroken));
    }

    #[test]
    fn test_decide_empty_ledger_is_init() {
        let d = decide(HealthStatus::Healthy, &aggregate(0, 0), false);
        assert_eq!(d, Decision::Next(SessionState::Init));
    }

    #[test]
    fn test_decide_pending_is_implement() {
        let d = decide(HealthStatus::Healthy, &aggregate(3, 2), false);
        assert_eq!(d, Decision::Next(SessionState::Implement));
    }

    #[test]
    fn test_decide_drained_ledger_is_complete() {
        let d = decide(HealthStatus::Healthy, &aggregate(3, 0), false);
        assert_eq!(d, Decision::Next(SessionState::Complete));
    }

    #[test]
    fn test_decide_dirty_forces_recovery() {
        let d = decide(HealthStatus::Healthy, &aggregate(3, 2), true);
        assert_eq!(d, Decision::Recover);
    }

    #[test]
    fn test_decide_unknown_health_is_not_broken() {
        // UNKNOWN must not be inferred as BROKEN; it only gates expansion.
        let d = decide(HealthStatus::Unknown, &aggregate(1, 1), false);
        assert_eq!(d, Decision::Next(SessionState::Implement));
    }
}
