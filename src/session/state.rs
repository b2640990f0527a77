//! Session state machine types.
//!
//! The transition table is closed: writes encoding a transition outside it
//! are rejected at the store boundary. FIX_BROKEN is the one pre-emptive
//! state, enterable from anywhere the moment a probe reports BROKEN.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StewardError};
use crate::health::HealthStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Start,
    Init,
    Implement,
    Test,
    FixBroken,
    Complete,
}

impl SessionState {
    pub fn allowed_transitions(&self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Start => &[Init, Implement],
            Init => &[Implement],
            Implement => &[Test],
            Test => &[Implement, Complete],
            FixBroken => &[Init],
            Complete => &[],
        }
    }

    /// FIX_BROKEN pre-empts every state; everything else follows the table.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        target == SessionState::FixBroken || self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete)
    }

    /// States whose procedure mutates the feature ledger.
    pub fn mutates_features(&self) -> bool {
        matches!(self, SessionState::Init | SessionState::Implement | SessionState::Test)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "START",
            Self::Init => "INIT",
            Self::Implement => "IMPLEMENT",
            Self::Test => "TEST",
            Self::FixBroken => "FIX_BROKEN",
            Self::Complete => "COMPLETE",
        };
        write!(f, "{}", s)
    }
}

/// How a transition entered the history. Forward transitions follow the
/// table; recovery rollbacks and reopens have their own validation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    #[default]
    Forward,
    Recovery,
    Reopen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: String,
    #[serde(default)]
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
}

impl TransitionEntry {
    pub fn new(from: SessionState, to: SessionState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            kind: TransitionKind::Forward,
            at: Utc::now(),
        }
    }

    pub fn with_kind(mut self, kind: TransitionKind) -> Self {
        self.kind = kind;
        self
    }
}

/// The durable record for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub session_id: String,
    pub state: SessionState,
    pub entered_at: DateTime<Utc>,
    pub health_status: HealthStatus,
    /// True while a state procedure is mid-execution. Survives process death
    /// and forces recovery on the next load.
    pub dirty: bool,
    /// Append-only. Earlier reads are always a prefix of later reads.
    pub history: Vec<TransitionEntry>,
}

impl StateRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: SessionState::Start,
            entered_at: Utc::now(),
            health_status: HealthStatus::Unknown,
            dirty: false,
            history: Vec::new(),
        }
    }

    /// Enter `target`: validates the transition, marks the record dirty, and
    /// appends to history. The caller persists before running the state's
    /// procedure.
    pub fn transition(&mut self, target: SessionState, reason: impl Into<String>) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(StewardError::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                allowed: self
                    .state
                    .allowed_transitions()
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        self.history
            .push(TransitionEntry::new(self.state, target, reason));
        self.state = target;
        self.entered_at = Utc::now();
        self.dirty = true;
        Ok(())
    }

    /// Re-enter a completed session because new work arrived. The only way
    /// out of COMPLETE.
    pub fn reopen(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.state != SessionState::Complete {
            return Err(StewardError::InvalidStateTransition {
                from: self.state.to_string(),
                to: SessionState::Implement.to_string(),
                allowed: "reopen is only valid from COMPLETE".into(),
            });
        }
        self.history.push(
            TransitionEntry::new(self.state, SessionState::Implement, reason)
                .with_kind(TransitionKind::Reopen),
        );
        self.state = SessionState::Implement;
        self.entered_at = Utc::now();
        self.dirty = true;
        Ok(())
    }

    /// Roll back to the state recorded in a checkpoint. Only legal while the
    /// record is dirty; `dirty` stays set until the caller declares the
    /// recovery applied.
    pub fn recover_to(&mut self, target: SessionState, checkpoint_id: &str) -> Result<()> {
        if !self.dirty {
            return Err(StewardError::Recovery(
                "recover_to called on a clean record".into(),
            ));
        }
        if self.state != target {
            self.history.push(
                TransitionEntry::new(
                    self.state,
                    target,
                    format!("recovered from checkpoint {}", checkpoint_id),
                )
                .with_kind(TransitionKind::Recovery),
            );
            self.state = target;
            self.entered_at = Utc::now();
        }
        Ok(())
    }

    /// Clean exit from the current state's procedure.
    pub fn finish_procedure(&mut self) {
        self.dirty = false;
    }

    pub fn observe_health(&mut self, status: HealthStatus) {
        self.health_status = status;
    }

    /// A record with the dirty flag set died mid-procedure and must go
    /// through recovery before its session makes any forward decision.
    pub fn needs_recovery(&self) -> bool {
        self.dirty
    }
}
