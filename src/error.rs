//! Error types for the schema group store

use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Schema group store errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Optimistic concurrency loss on a table key or log position
    #[error("Write conflict on {key}")]
    WriteConflict { key: String },

    #[error("{kind} not found: {id}")]
    DataNotFound { kind: &'static str, id: String },

    #[error("Incompatible schema: {0}")]
    IncompatibleSchema(String),

    #[error("Codec mismatch: {0}")]
    CodecMismatch(String),

    #[error("Codec not registered with group: {0}")]
    CodecNotFound(String),

    #[error("Unknown compatibility policy: {0}")]
    UnknownPolicy(String),

    #[error("Group already exists: {0}")]
    GroupAlreadyExists(String),

    #[error("Schema format mismatch: group expects {expected}, got {actual}")]
    SchemaTypeMismatch { expected: String, actual: String },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub(crate) fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::DataNotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(key: impl std::fmt::Display) -> Self {
        Self::WriteConflict {
            key: key.to_string(),
        }
    }

    /// True for optimistic concurrency losses
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }
}
