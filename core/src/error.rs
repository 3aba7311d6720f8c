use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed condition tree, unparseable catalog entry, missing
    /// escalation rule. Fails closed or falls back to a default; callers
    /// log it rather than abort.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Optimistic-concurrency version mismatch that survived the one retry.
    #[error("concurrent escalation on case '{case_id}': escalation already updated, refresh and retry")]
    ConcurrencyConflict { case_id: String },

    /// Escalation attempted on a closed case, or to a level not greater
    /// than the current one. Rejected, never retried.
    #[error("invalid state transition on case '{case_id}': {reason}")]
    InvalidStateTransition { case_id: String, reason: String },

    /// Notification dispatch exhausted its retry budget. The escalation
    /// transition itself is already durable when this surfaces.
    #[error("delivery to '{recipient}' failed after {attempts} attempts")]
    DeliveryFailure { recipient: String, attempts: u32 },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
