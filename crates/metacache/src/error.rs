//! Error types for the metadata cache.

use thiserror::Error;

use metacache_state::StateError;

use crate::kind::EntityKind;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by cache lookups, reloads and watch handlers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The record is absent after reload and bounded retries.
    #[error("{kind} not found: {key}")]
    NotFound { kind: EntityKind, key: String },

    /// A gateway call failed while reloading.
    #[error("failed to fetch {kind} {key}: {source}")]
    Fetch {
        kind: EntityKind,
        key: String,
        source: StateError,
    },

    #[error("reload of {kind} {key} timed out")]
    Timeout { kind: EntityKind, key: String },

    #[error("malformed {kind} payload: {source}")]
    Decode {
        kind: EntityKind,
        source: serde_json::Error,
    },

    /// A cross reference (db id → name, space id → name) could not be
    /// resolved.
    #[error("cannot resolve {what} for {kind}: {reason}")]
    Unresolved {
        kind: EntityKind,
        what: String,
        reason: String,
    },

    /// Bulk load found the same key twice.
    #[error("duplicate {kind} key during load: {key}")]
    Duplicate { kind: EntityKind, key: String },

    #[error("invalid {kind} key: {key}")]
    InvalidKey { kind: EntityKind, key: String },

    #[error("gateway error: {0}")]
    Source(#[from] StateError),

    /// A watch handler failed unexpectedly (panic caught at the boundary).
    #[error("{kind} handler failed: {message}")]
    Handler { kind: EntityKind, message: String },
}

impl CacheError {
    pub fn not_found(kind: EntityKind, key: impl Into<String>) -> Self {
        CacheError::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Whether the record does not exist (in the cache or the source).
    pub fn is_not_found(&self) -> bool {
        match self {
            CacheError::NotFound { .. } => true,
            CacheError::Fetch { source, .. } | CacheError::Source(source) => {
                source.is_not_found()
            }
            _ => false,
        }
    }
}
