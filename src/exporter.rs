//! Export Contract
//!
//! The transport seam toward the remote ingestion endpoint. The core
//! only calls `export`; flush and shutdown are advisory hooks whose
//! lifecycle belongs to whoever constructed the exporter.

use crate::record::AuditRecord;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info, warn};

/// Error type for export attempts.
///
/// The processor retries transient and permanent failures identically
/// (up to the retry budget); the distinction is carried so fault
/// handlers can observe the cause. Implementations that cannot tell the
/// two apart should return `Transient`.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("transient export failure: {0}")]
    Transient(String),

    #[error("permanent export failure: {0}")]
    Permanent(String),

    #[error("export timed out after {0:?}")]
    TimedOut(Duration),
}

/// Transport that ships batches of records to a remote endpoint.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Deliver one batch. The processor bounds the call with its
    /// configured exporter timeout.
    async fn export(&self, batch: &[AuditRecord]) -> Result<(), ExportError>;

    /// Advisory; never called by the processor.
    async fn force_flush(&self) -> Result<(), ExportError> {
        Ok(())
    }

    /// Advisory; never called by the processor.
    async fn shutdown(&self) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Exporter that writes each record to the `tracing` subscriber.
///
/// Useful during development and as a sink of last resort; records are
/// emitted under the `audit` target at a level matching their severity.
#[derive(Debug, Default)]
pub struct TracingExporter;

#[async_trait]
impl Exporter for TracingExporter {
    async fn export(&self, batch: &[AuditRecord]) -> Result<(), ExportError> {
        for record in batch {
            match record.priority() {
                6 | 5 => error!(
                    target: "audit",
                    severity = %record.severity,
                    timestamp = %record.timestamp,
                    "{}",
                    record.body
                ),
                4 => warn!(
                    target: "audit",
                    severity = %record.severity,
                    timestamp = %record.timestamp,
                    "{}",
                    record.body
                ),
                _ => info!(
                    target: "audit",
                    severity = %record.severity,
                    timestamp = %record.timestamp,
                    "{}",
                    record.body
                ),
            }
        }
        Ok(())
    }
}
