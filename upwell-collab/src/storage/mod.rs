//! Blob storage for serialized document families.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   get_item / set_item   ┌──────────────────────────────┐
//! │ Documents   │ ──────────────────────► │ Storage                      │
//! │ (manager)   │                         │  MemoryStore  (HashMap)      │
//! └─────────────┘                         │  RocksStore   (RocksDB, LZ4) │
//!                                         └──────────────────────────────┘
//! ```
//!
//! The same trait serves the local store and the remote one.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{ItemMetadata, RocksStore, StoreConfig};

/// Key/value store of opaque blobs.
pub trait Storage: Send + Sync {
    fn get_item(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set_item(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Every stored id, sorted.
    fn ids(&self) -> Result<Vec<String>, StoreError>;
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    fn get_item(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get_item(id)
    }

    fn set_item(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).set_item(id, bytes)
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        (**self).ids()
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// I/O error
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}
