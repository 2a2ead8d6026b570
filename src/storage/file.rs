//! File-backed storage backend.

use super::{BatchOp, StorageBackend, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Single-file key/value storage.
///
/// The full map is held in memory and rewritten as one JSON document on
/// every mutation, via a temp file in the same directory followed by an
/// atomic rename. Mutations are durable on return. Suited to the modest
/// volumes an audit journal holds between exports; not a general store.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl FileBackend {
    /// Open the backend at `path`, loading any existing state.
    ///
    /// Parent directories are created as needed. A missing file starts
    /// the backend empty; it is written on the first mutation.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => HashMap::new(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        debug!(path = %path.display(), keys = entries.len(), "opened file storage");

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<String, Vec<u8>>) -> Result<(), StorageError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let bytes = serde_json::to_vec(entries)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|err| StorageError::Io(err.error))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_vec());
        self.persist(&entries)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        for op in ops {
            match op {
                BatchOp::Set { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        // One rewrite covers the whole batch, so it lands atomically.
        self.persist(&entries)
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
