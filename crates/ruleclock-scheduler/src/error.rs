use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored condition list could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The rule definition is out of range or structurally invalid.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// No rule with the given ID exists in the store.
    #[error("Rule not found: {id}")]
    RuleNotFound { id: String },

    /// The rule store could not serve a read.
    #[error("Store error: {0}")]
    Store(String),

    /// The fire-event sink is full or disconnected.
    #[error("Fire sink unavailable: {0}")]
    SinkClosed(String),

    /// The engine task has exited; the handle can no longer drive it.
    #[error("Scheduler engine is not running")]
    EngineClosed,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
