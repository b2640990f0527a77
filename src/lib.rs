pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod trace;
pub mod workspace;

pub use config::{ProjectConfig, SessionPaths};
pub use coordinator::{
    Allocation, Claim, ConflictResolver, CoordinatorLevel, Demand, ElectionGroup, Grant,
    NodeHandle, Resolution,
};
pub use error::{Result, StewardError};
pub use health::{HealthCheck, HealthProbe, HealthStatus, ProbeReport};
pub use recovery::{Checkpoint, CheckpointManager, RecoveryPlan, recover};
pub use retry::RetryPolicy;
pub use session::{
    BacklogSource, Decision, EntryReport, Feature, FeatureAggregate, FeatureLedger, FeatureSource,
    FeatureStatus,
    MutationGuard, Priority, SessionController, SessionState, StateRecord, StateStore, Tier,
    TierGate, ToolInvoker,
};
pub use trace::{DecisionTrace, TraceStore};
pub use workspace::{GitWorkspaceCheck, NoWorkspaceCheck, WorkspaceCheck};
