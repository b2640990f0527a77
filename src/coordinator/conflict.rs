//! Contention over a shared external resource.
//!
//! Resolution is priority-based first, round-robin among equals, and
//! escalates one level up the hierarchy when it cannot be decided locally.
//! Contention that reaches the Executive unresolved is surfaced to a human
//! operator instead of being retried forever.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::node::CoordinatorLevel;
use crate::error::{Result, StewardError};
use crate::session::Priority;

/// One session's claim on a contended resource.
#[derive(Debug, Clone)]
pub struct Claim {
    pub session_id: String,
    /// Priority of the feature being serviced.
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Winner(String),
    /// Ambiguous at this level; the parent decides.
    Escalate,
}

/// Per-level resolver with a fairness cursor per resource.
pub struct ConflictResolver {
    level: CoordinatorLevel,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl ConflictResolver {
    pub fn new(level: CoordinatorLevel) -> Self {
        Self {
            level,
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    /// Pick a winner among `claims` for `resource`. Highest priority wins
    /// outright; ties rotate through the contenders across calls.
    pub fn resolve(&self, resource: &str, claims: &[Claim]) -> Result<Resolution> {
        match claims {
            [] => Err(StewardError::Coordination(format!(
                "conflict resolution over {} with no claims",
                resource
            ))),
            [only] => Ok(Resolution::Winner(only.session_id.clone())),
            _ => {
                let best = claims.iter().map(|c| c.priority).min().unwrap_or_default();
                let mut top: Vec<&Claim> =
                    claims.iter().filter(|c| c.priority == best).collect();

                if top.len() == 1 {
                    let winner = top[0].session_id.clone();
                    info!(resource, winner = %winner, priority = %best, "Conflict resolved by priority");
                    return Ok(Resolution::Winner(winner));
                }

                // Deterministic order so the cursor rotates fairly no matter
                // how callers ordered the claims.
                top.sort_by(|a, b| a.session_id.cmp(&b.session_id));
                let mut cursors = self.round_robin.lock();
                let cursor = cursors.entry(resource.to_string()).or_insert(0);
                let winner = top[*cursor % top.len()].session_id.clone();
                *cursor = cursor.wrapping_add(1);
                info!(resource, winner = %winner, "Conflict resolved round-robin");
                Ok(Resolution::Winner(winner))
            }
        }
    }

    /// Handle a resolution the level could not make. Every level except the
    /// Executive passes the problem up; the Executive hands it to a human.
    pub fn escalate(&self, resource: &str) -> Result<Resolution> {
        if self.level == CoordinatorLevel::Executive {
            warn!(resource, "Contention unresolved at executive level");
            return Err(StewardError::EscalationRequired(format!(
                "contention over {} unresolved at executive level",
                resource
            )));
        }
        Ok(Resolution::Escalate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(id: &str, priority: Priority) -> Claim {
        Claim {
            session_id: id.into(),
            priority,
        }
    }

    #[test]
    fn test_priority_wins() {
        let resolver = ConflictResolver::new(CoordinatorLevel::Tactical);
        let result = resolver
            .resolve(
                "deploy-lock",
                &[claim("s-1", Priority::P2), claim("s-2", Priority::P0)],
            )
            .unwrap();
        assert_eq!(result, Resolution::Winner("s-2".into()));
    }

    #[test]
    fn test_equal_priority_rotates() {
        let resolver = ConflictResolver::new(CoordinatorLevel::Tactical);
        let claims = [claim("s-1", Priority::P1), claim("s-2", Priority::P1)];

        let first = resolver.resolve("db", &claims).unwrap();
        let second = resolver.resolve("db", &claims).unwrap();
        assert_ne!(first, second);

        let third = resolver.resolve("db", &claims).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_cursors_are_per_resource() {
        let resolver = ConflictResolver::new(CoordinatorLevel::Tactical);
        let claims = [claim("s-1", Priority::P1), claim("s-2", Priority::P1)];

        let db = resolver.resolve("db", &claims).unwrap();
        let lock = resolver.resolve("deploy-lock", &claims).unwrap();
        // Fresh cursor for the second resource.
        assert_eq!(db, lock);
    }

    #[test]
    fn test_executive_escalation_surfaces_operator() {
        let tactical = ConflictResolver::new(CoordinatorLevel::Tactical);
        assert_eq!(tactical.escalate("db").unwrap(), Resolution::Escalate);

        let executive = ConflictResolver::new(CoordinatorLevel::Executive);
        assert!(matches!(
            executive.escalate("db"),
            Err(StewardError::EscalationRequired(_))
        ));
    }

    #[test]
    fn test_no_claims_is_invariant_violation() {
        let resolver = ConflictResolver::new(CoordinatorLevel::Tactical);
        assert!(matches!(
            resolver.resolve("db", &[]),
            Err(StewardError::Coordination(_))
        ));
    }
}
