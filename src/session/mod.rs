//! One session: durable record, feature ledger, guard, tier gate, and the
//! controller that drives them.

mod controller;
mod guard;
mod ledger;
mod state;
mod store;
mod tier;

pub use controller::{
    CHECKPOINT_INTERVAL, Decision, EntryReport, ImplementOutcome, SessionController, ToolInvoker,
    decide,
};
pub use guard::MutationGuard;
pub use ledger::{Feature, FeatureAggregate, FeatureLedger, FeatureStatus, Priority, Tier};
pub use state::{SessionState, StateRecord, TransitionEntry, TransitionKind};
pub use store::StateStore;
pub use tier::{BacklogSource, ExpandDenial, FeatureSource, TierGate};
