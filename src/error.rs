use thiserror::Error;

use crate::model::EntityTypeId;

/// Failures reported by an entity store.
///
/// Cloneable so a single coalesced fetch can hand the same failure to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The call never produced a usable answer (connectivity, timeout, 5xx).
    #[error("transport failure: {0}")]
    Transport(String),
    /// The store answered and refused the write or read.
    #[error("rejected by entity store ({status}): {message}")]
    Conflict { status: u16, message: String },
    /// The store answered with a body we could not interpret.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn not_found(collection: &str, id: i64) -> Self {
        StoreError::Conflict {
            status: 404,
            message: format!("{}/{} not found", collection, id),
        }
    }

    /// Whether a bounded-retry transport may try the call again.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Conflict { status, .. } => *status == 429 || *status >= 500,
            StoreError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum LogError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Identifier substitution could not find what it had to rewrite. Only the
    /// current undo/redo is abandoned; the rest of the history stays usable.
    #[error("identifier reconciliation failed: {0}")]
    Reconciliation(String),
    /// The task running the command panicked or was torn down by the runtime.
    #[error("command execution interrupted: {0}")]
    Interrupted(String),
}

pub type LogResult<T> = std::result::Result<T, LogError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("entity type {0} is not registered")]
    UnknownType(EntityTypeId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
