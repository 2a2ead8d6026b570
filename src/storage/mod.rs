//! Storage Backends
//!
//! The abstract key/value contract the journal is built on, plus the
//! backends shipped with the crate.

use async_trait::async_trait;

pub mod file;
pub mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Error type for storage backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A single mutation within a [`StorageBackend::batch`] call.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Durable key/value map underpinning the journal.
///
/// Implementations are expected to be durable on return from `set`,
/// `delete`, and `batch` (fsync or remote acknowledgment). Backends that
/// are not must say so in their docs; [`MemoryBackend`] is the shipped
/// example.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Fetch the value stored under `key`.
    ///
    /// Returns [`StorageError::NotFound`] for absent keys.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `value` under `key`, replacing any existing value.
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Deleting an absent key is success.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Apply a mixed set of mutations, atomically where the backend
    /// supports it and sequentially otherwise.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError>;

    /// Release resources held by the backend.
    async fn close(&self) -> Result<(), StorageError>;
}
