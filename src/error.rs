use thiserror::Error;

#[derive(Error, Debug)]
pub enum StewardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsatisfiable dependency graph: {0}")]
    DependencyGraph(String),

    #[error("Health gate denied mutation: project is BROKEN ({0}). Fix before new work.")]
    HealthGated(String),

    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    #[error("Invalid feature status transition: {id} {from} → {to}")]
    InvalidFeatureTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Invalid state transition: {from} → {to} (allowed: {allowed})")]
    InvalidStateTransition {
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Coordination invariant violated: {0}")]
    Coordination(String),

    #[error("Operator escalation required: {0}")]
    EscalationRequired(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("State persistence failed: {0}")]
    StatePersistence(String),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Workspace check failed: {0}")]
    Workspace(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StewardError {
    /// Fatal errors are reported immediately and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::DependencyGraph(_))
    }

    /// Transient errors are eligible for bounded-backoff retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_))
    }

    /// Invariant violations indicate the hierarchy model itself is
    /// inconsistent; they raise, never clamp.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Coordination(_))
    }
}

pub type Result<T> = std::result::Result<T, StewardError>;
