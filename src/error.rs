//! Processor Error Taxonomy

use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced to callers of the processor.
///
/// Only the emit, flush, shutdown, and construction paths return errors
/// directly; everything that goes wrong on background work is reported
/// through the [`FaultHandler`](crate::FaultHandler) instead.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The processor has shut down and no longer accepts records.
    #[error("processor is shut down")]
    ShutDown,

    /// The journal could not persist a record; it was not enqueued.
    #[error("failed to persist record to the journal")]
    StorageSave(#[source] StorageError),

    /// Replaying journaled records at construction failed.
    #[error("failed to replay journaled records")]
    Replay(#[source] StorageError),

    /// Construction rejected the configuration.
    #[error("invalid processor configuration: {0}")]
    InvalidConfig(String),

    /// A bounded flush ran out of time with records still queued.
    #[error("flush deadline exceeded with {pending} records still queued")]
    FlushTimeout { pending: usize },

    /// Shutdown's flush ran out of time with records still queued. The
    /// records remain journaled and replay on the next start.
    #[error("shutdown flush deadline exceeded with {pending} records still queued")]
    ShutdownTimeout { pending: usize },
}

pub type Result<T> = std::result::Result<T, ProcessorError>;
