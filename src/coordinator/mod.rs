//! Hierarchical coordination: quota allocation, conflict resolution, and
//! leader election for groups of concurrent sessions.

mod allocation;
mod conflict;
mod election;
mod node;

pub use allocation::{Allocation, Demand, Grant, allocate};
pub use conflict::{Claim, ConflictResolver, Resolution};
pub use election::ElectionGroup;
pub use node::{CoordinatorLevel, NodeHandle};
