//! Error types for the entity store.
//!
//! Errors are classified by recoverability: transient SQLite contention
//! (busy/locked) is retryable, everything else is permanent. Background
//! job failures never surface to the original caller; they are absorbed
//! into the queue's retry state and observable via `JobQueue::get_status`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrainError>;

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("entity not found: {entity_type}/{id}")]
    NotFound { entity_type: String, id: String },

    #[error("entity already exists: {entity_type}/{id}")]
    Duplicate { entity_type: String, id: String },

    #[error("unknown entity type: {0}")]
    UnknownType(String),

    #[error("entity type already registered: {0}")]
    AlreadyRegistered(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("embedding index error: {0}")]
    Index(String),

    #[error("invalid job payload: {0}")]
    InvalidJobData(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl BrainError {
    /// Whether retrying the operation can succeed without intervention.
    ///
    /// Only transient SQLite contention qualifies; schema violations,
    /// missing rows, and bad payloads are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrainError::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the underlying SQLite error is a primary-key collision.
    pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

impl From<serde_json::Error> for BrainError {
    fn from(err: serde_json::Error) -> Self {
        BrainError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BrainError {
    fn from(err: serde_yaml::Error) -> Self {
        BrainError::Serialization(err.to_string())
    }
}
