//! Fault Reporting
//!
//! Errors arising on background work never reach a caller directly;
//! they are delivered synchronously to an injected handler. A handler
//! is always present; the default writes to `tracing`.

use crate::record::AuditRecord;
use tracing::{error, warn};

/// Category of a reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A record was emitted after shutdown and rejected.
    Shutdown,
    /// Persisting a record to the journal failed; the record was
    /// dropped and the emitter informed.
    StorageSave,
    /// Removing delivered records from the journal failed; they may be
    /// replayed (and re-delivered) after the next restart.
    StorageRemove,
    /// The retry budget for a batch is exhausted; the records remain
    /// journaled and will be retried on the next process start.
    ExportFailed,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::Shutdown => write!(f, "shutdown"),
            FaultKind::StorageSave => write!(f, "storage_save"),
            FaultKind::StorageRemove => write!(f, "storage_remove"),
            FaultKind::ExportFailed => write!(f, "export_failed"),
        }
    }
}

/// A fault surfaced to the [`FaultHandler`].
#[derive(Debug)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    /// Rendered underlying error, when there is one.
    pub cause: Option<String>,
    /// Records affected by the fault. May be empty.
    pub records: Vec<AuditRecord>,
}

impl Fault {
    pub(crate) fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            records: Vec::new(),
        }
    }

    pub(crate) fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub(crate) fn with_records(mut self, records: Vec<AuditRecord>) -> Self {
        self.records = records;
        self
    }
}

/// Receiver for faults raised by the processor.
///
/// Invoked synchronously from the emit path or the background worker;
/// implementations must be fast and must not block.
pub trait FaultHandler: Send + Sync {
    fn handle(&self, fault: Fault);
}

/// Default handler: logs every fault through `tracing`.
#[derive(Debug, Default)]
pub struct TracingFaultHandler;

impl FaultHandler for TracingFaultHandler {
    fn handle(&self, fault: Fault) {
        let cause = fault.cause.as_deref().unwrap_or("none");
        match fault.kind {
            FaultKind::Shutdown | FaultKind::StorageRemove => warn!(
                kind = %fault.kind,
                cause,
                records = fault.records.len(),
                "{}",
                fault.message
            ),
            FaultKind::StorageSave | FaultKind::ExportFailed => error!(
                kind = %fault.kind,
                cause,
                records = fault.records.len(),
                "{}",
                fault.message
            ),
        }
    }
}
