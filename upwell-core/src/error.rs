//! Error taxonomy for the versioning engine.

use thiserror::Error;

/// Failures reported by a replicated document backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicaError {
    #[error("failed to decode replicated state: {0}")]
    Decode(String),
    #[error("failed to apply changes: {0}")]
    Apply(String),
    #[error("failed to encode replicated state: {0}")]
    Encode(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum UpwellError {
    /// The addressed field was never created as a text field.
    #[error("field '{0}' is not an initialized text field")]
    UninitializedField(String),

    #[error("no draft with id {0}")]
    NotFound(String),

    #[error("queue '{0}' only allows one subscriber at a time")]
    MultipleSubscribers(String),

    #[error("range {start}..{end} is out of bounds for text of length {len}")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("draft {0} is the root and cannot be archived")]
    ArchiveRoot(String),

    #[error("draft {0} is archived and cannot become the root")]
    ArchivedRoot(String),

    #[error("container has no metadata entry")]
    MissingMetadata,

    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = UpwellError> = std::result::Result<T, E>;
