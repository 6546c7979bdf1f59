//! Error types for the coordination-store gateway.

use thiserror::Error;

/// Result type alias for gateway and store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur talking to the coordination store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("revision {requested} has been compacted (oldest retained is {compacted} + 1)")]
    Compacted { requested: u64, compacted: u64 },

    /// The gateway could not reach the store. Returned by remote
    /// `MetaSource` implementations; the embedded store never fails this way.
    #[error("transport error: {0}")]
    Transport(String),
}

impl StateError {
    /// Whether this error means the key does not exist in the store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}
