//! Durable Record Journal
//!
//! Content-addressed storage of audit records over a key/value backend,
//! plus a single index key enumerating the currently-persisted ids.
//! Every record accepted by the processor lives here until its export
//! succeeds, which is what makes delivery survive restarts.

use crate::record::{AuditRecord, RecordId};
use crate::storage::{BatchOp, StorageBackend, StorageError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Well-known key holding the JSON array of live record ids.
pub const INDEX_KEY: &str = "audit_log_index";

fn record_key(id: RecordId) -> String {
    format!("audit_record_{}", id)
}

/// Durable journal of un-exported audit records.
///
/// All operations are serialized by a single internal lock; the journal
/// owns no background tasks. The backend's lifetime is owned by whoever
/// constructed it; the journal never calls `close`.
#[derive(Debug)]
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    lock: Mutex<()>,
    skipped: AtomicU64,
}

impl Journal {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            lock: Mutex::new(()),
            skipped: AtomicU64::new(0),
        }
    }

    /// Persist a record under its content-derived id.
    ///
    /// Returns `true` when the record was newly persisted and `false`
    /// when its id was already indexed; duplicates collapse to one
    /// entry without a rewrite, and the caller should not queue them
    /// again. On error the record was not persisted and must not be
    /// treated as accepted.
    pub async fn append(&self, record: &AuditRecord) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;

        let id = record.record_id();
        let mut index = self.read_index().await?;
        let id_str = id.to_string();
        if index.iter().any(|existing| *existing == id_str) {
            return Ok(false);
        }

        let data = serde_json::to_vec(record)?;
        self.backend.set(&record_key(id), &data).await?;

        index.push(id_str);
        self.write_index(&index).await?;
        Ok(true)
    }

    /// Remove a set of exported records and their index entries.
    ///
    /// The deletes and the index rewrite are coalesced into a single
    /// backend batch. On error none of the records should be assumed
    /// removed; they will be dropped from the index when a later
    /// `load_all` finds their keys missing, or re-removed after the
    /// next export.
    pub async fn remove_all(&self, records: &[AuditRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;

        let removed: HashSet<String> = records
            .iter()
            .map(|record| record.record_id().to_string())
            .collect();

        let index = self.read_index().await?;
        let retained: Vec<String> = index
            .into_iter()
            .filter(|id| !removed.contains(id))
            .collect();

        let mut ops: Vec<BatchOp> = records
            .iter()
            .map(|record| BatchOp::Delete {
                key: record_key(record.record_id()),
            })
            .collect();
        ops.push(BatchOp::Set {
            key: INDEX_KEY.to_string(),
            value: serde_json::to_vec(&retained)?,
        });

        self.backend.batch(ops).await?;
        debug!(removed = removed.len(), remaining = retained.len(), "journal removal");
        Ok(())
    }

    /// Read back every persisted record.
    ///
    /// Index entries whose record key is missing or undecodable are
    /// skipped, logged, and counted; the index is rewritten to the
    /// surviving ids so stale entries do not accumulate.
    pub async fn load_all(&self) -> Result<Vec<AuditRecord>, StorageError> {
        let _guard = self.lock.lock().await;

        let index = self.read_index().await?;
        let mut records = Vec::with_capacity(index.len());
        let mut surviving = Vec::with_capacity(index.len());

        for id in &index {
            let key = format!("audit_record_{}", id);
            let data = match self.backend.get(&key).await {
                Ok(data) => data,
                Err(StorageError::NotFound(_)) => {
                    warn!(record_id = %id, "journal index entry has no record, dropping");
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(err) => return Err(err),
            };

            match serde_json::from_slice::<AuditRecord>(&data) {
                Ok(record) => {
                    records.push(record);
                    surviving.push(id.clone());
                }
                Err(err) => {
                    warn!(record_id = %id, error = %err, "journal record undecodable, dropping");
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if surviving.len() != index.len() {
            if let Err(err) = self.write_index(&surviving).await {
                warn!(error = %err, "failed to prune journal index");
            }
        }

        Ok(records)
    }

    /// Records dropped during replay because their entry was missing or
    /// undecodable.
    pub fn skipped_records(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    async fn read_index(&self) -> Result<Vec<String>, StorageError> {
        let data = match self.backend.get(INDEX_KEY).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        match serde_json::from_slice(&data) {
            Ok(index) => Ok(index),
            Err(err) => {
                // Decode failures are not transient; retrying would
                // wedge every journal operation on the same bytes.
                warn!(error = %err, "journal index undecodable, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    async fn write_index(&self, index: &[String]) -> Result<(), StorageError> {
        let data = serde_json::to_vec(index)?;
        self.backend.set(INDEX_KEY, &data).await
    }
}
