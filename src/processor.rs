//! Audit Log Processor
//!
//! Owns the journal and the delivery queue, drives the background
//! export loop, and implements the emit / flush / shutdown lifecycle.
//! Every accepted record is journaled before it is queued, so delivery
//! survives a crash at any point between emit and export.

use crate::config::ProcessorConfig;
use crate::error::{ProcessorError, Result};
use crate::exporter::{ExportError, Exporter};
use crate::fault::{Fault, FaultHandler, FaultKind, TracingFaultHandler};
use crate::journal::Journal;
use crate::queue::SeverityQueue;
use crate::record::AuditRecord;
use crate::retry::RetryPolicy;
use crate::storage::StorageBackend;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Interval between queue checks while a flush drains.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Snapshot of processor counters.
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    /// Records accepted by `emit`.
    pub emitted: u64,
    /// Records delivered in successful export calls.
    pub exported: u64,
    /// Failed export cycles (each counts once, before any retry).
    pub export_failures: u64,
    /// Records recovered from the journal at construction.
    pub replayed: u64,
    /// Journal entries dropped during replay as missing or undecodable.
    pub journal_skipped: u64,
}

struct Inner {
    config: ProcessorConfig,
    journal: Journal,
    queue: std::sync::Mutex<SeverityQueue>,
    exporter: Box<dyn Exporter>,
    handler: Box<dyn FaultHandler>,

    shutdown: AtomicBool,
    retry_attempt: AtomicU32,
    last_retry_at_ms: AtomicI64,

    /// Serializes export cycles; the cycle is never re-entered.
    export_gate: Mutex<()>,
    stop_tx: broadcast::Sender<()>,

    emitted: AtomicU64,
    exported: AtomicU64,
    export_failures: AtomicU64,
    replayed: AtomicU64,
}

impl Inner {
    fn queue(&self) -> std::sync::MutexGuard<'_, SeverityQueue> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// One pop-batch-export-reconcile pass.
    ///
    /// Deliberately ignores the shutdown flag: the shutdown flush still
    /// drives this to drain the queue. Only `emit` and the public flush
    /// entry points consult the flag.
    async fn export_cycle(&self) {
        let _gate = self.export_gate.lock().await;

        if self.queue().is_empty() {
            return;
        }

        let attempt = self.retry_attempt.load(Ordering::Acquire);
        if attempt > 0 {
            let elapsed =
                Utc::now().timestamp_millis() - self.last_retry_at_ms.load(Ordering::Acquire);
            let required = self.config.retry.backoff_with_jitter(attempt).as_millis() as i64;
            if elapsed < required {
                return;
            }
        }

        let batch = self.queue().pop_up_to(self.config.max_batch);
        if batch.is_empty() {
            return;
        }

        let result = if self.config.exporter_timeout > Duration::ZERO {
            match tokio::time::timeout(self.config.exporter_timeout, self.exporter.export(&batch))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ExportError::TimedOut(self.config.exporter_timeout)),
            }
        } else {
            self.exporter.export(&batch).await
        };

        match result {
            Ok(()) => {
                self.retry_attempt.store(0, Ordering::Release);
                self.last_retry_at_ms.store(0, Ordering::Release);
                self.exported
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);

                if let Err(err) = self.journal.remove_all(&batch).await {
                    // The records are delivered; never re-enqueue them.
                    // The journal drops the stale entries on the next
                    // replay, at the cost of possible duplicates.
                    self.handler.handle(
                        Fault::new(
                            FaultKind::StorageRemove,
                            "failed to remove exported records from the journal",
                        )
                        .with_cause(&err)
                        .with_records(batch),
                    );
                }
            }
            Err(err) => self.handle_export_failure(batch, err),
        }
    }

    fn handle_export_failure(&self, batch: Vec<AuditRecord>, cause: ExportError) {
        let attempt = self.retry_attempt.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_retry_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.export_failures.fetch_add(1, Ordering::Relaxed);

        if attempt <= self.config.retry.max_attempts {
            debug!(attempt, batch = batch.len(), error = %cause, "export failed, batch re-queued");
            self.queue().push_many(batch);
            return;
        }

        self.retry_attempt.store(0, Ordering::Release);
        self.last_retry_at_ms.store(0, Ordering::Release);

        // The batch stays journaled; it replays on the next start.
        self.handler.handle(
            Fault::new(
                FaultKind::ExportFailed,
                format!(
                    "export failed after {} retry attempts",
                    self.config.retry.max_attempts
                ),
            )
            .with_cause(&cause)
            .with_records(batch),
        );
    }

    /// Drive export cycles until the queue drains or the deadline
    /// passes. Returns `true` when the queue drained.
    ///
    /// The deadline is checked between cycles, never mid-cycle: a batch
    /// popped for export is always either reconciled or re-queued
    /// before the flush gives up.
    async fn flush_until_empty(&self, deadline: Option<tokio::time::Instant>) -> bool {
        loop {
            if self.queue().is_empty() {
                return true;
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
            }
            self.export_cycle().await;
            tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
        }
    }
}

fn spawn_worker(inner: Arc<Inner>) -> JoinHandle<()> {
    let mut stop_rx = inner.stop_tx.subscribe();
    tokio::spawn(async move {
        let delay = inner.config.schedule_delay.max(Duration::from_millis(1));
        debug!(?delay, "export worker started");
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    debug!("export worker received stop signal");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    inner.export_cycle().await;
                }
            }
        }
    })
}

/// Durable, severity-ordered audit log processor.
///
/// Accepts records through [`emit`](AuditProcessor::emit), persists them
/// to the journal, and exports them in priority order from a background
/// worker with timeout and retry handling. Construct one with
/// [`AuditProcessor::builder`].
pub struct AuditProcessor {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditProcessor {
    /// Start building a processor around an exporter and a storage
    /// backend.
    pub fn builder(
        exporter: impl Exporter + 'static,
        backend: impl StorageBackend + 'static,
    ) -> ProcessorBuilder {
        ProcessorBuilder::new(exporter, backend)
    }

    /// Accept a record for durable, eventual delivery.
    ///
    /// The record is journaled, then queued by severity. If the queue
    /// has reached a full batch an export attempt is triggered without
    /// waiting for it; emit never blocks on the exporter.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::ShutDown`] after shutdown,
    /// [`ProcessorError::StorageSave`] when journaling fails. In both
    /// cases the record was not accepted and the fault handler has been
    /// informed.
    pub async fn emit(&self, record: AuditRecord) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            self.inner.handler.handle(
                Fault::new(
                    FaultKind::Shutdown,
                    "processor is shut down, cannot accept new records",
                )
                .with_records(vec![record]),
            );
            return Err(ProcessorError::ShutDown);
        }

        match self.inner.journal.append(&record).await {
            Ok(true) => {}
            // A record with this content is already journaled and
            // pending; queueing it again would double-deliver.
            Ok(false) => return Ok(()),
            Err(err) => {
                self.inner.handler.handle(
                    Fault::new(FaultKind::StorageSave, "failed to journal record")
                        .with_cause(&err)
                        .with_records(vec![record]),
                );
                return Err(ProcessorError::StorageSave(err));
            }
        }

        self.inner.emitted.fetch_add(1, Ordering::Relaxed);

        let queue_len = {
            let mut queue = self.inner.queue();
            queue.push(record);
            queue.len()
        };

        if queue_len >= self.inner.config.max_batch {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.export_cycle().await;
            });
        }

        Ok(())
    }

    /// Export until the queue is empty.
    ///
    /// A no-op after shutdown (the shutdown path flushes on its own).
    pub async fn force_flush(&self) -> Result<()> {
        if self.is_shutdown() {
            return Ok(());
        }
        self.inner.flush_until_empty(None).await;
        Ok(())
    }

    /// Export until the queue is empty or the deadline expires.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::FlushTimeout`] when the deadline expires with
    /// records still queued.
    pub async fn force_flush_with_timeout(&self, timeout: Duration) -> Result<()> {
        if self.is_shutdown() {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + timeout;
        if self.inner.flush_until_empty(Some(deadline)).await {
            Ok(())
        } else {
            Err(ProcessorError::FlushTimeout {
                pending: self.queue_size(),
            })
        }
    }

    /// Shut down: stop the worker, then flush once, without a deadline.
    ///
    /// Only the first call does work; later calls return success
    /// immediately. The exporter and the storage backend are never
    /// closed here; their lifetimes belong to whoever built them.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_inner(None).await
    }

    /// Shut down with a deadline on the final flush.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::ShutdownTimeout`] when the deadline expires
    /// with records still queued; they remain journaled and replay on
    /// the next start.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.shutdown_inner(Some(timeout)).await
    }

    async fn shutdown_inner(&self, timeout: Option<Duration>) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.inner.stop_tx.send(());
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "export worker exited abnormally");
            }
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        if self.inner.flush_until_empty(deadline).await {
            Ok(())
        } else {
            Err(ProcessorError::ShutdownTimeout {
                pending: self.queue_size(),
            })
        }
    }

    /// Records currently awaiting export.
    pub fn queue_size(&self) -> usize {
        self.inner.queue().len()
    }

    /// Consecutive failed export cycles for the current batch, zero
    /// when no retry is pending.
    pub fn retry_attempts(&self) -> u32 {
        self.inner.retry_attempt.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Snapshot of the processor counters.
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            emitted: self.inner.emitted.load(Ordering::Relaxed),
            exported: self.inner.exported.load(Ordering::Relaxed),
            export_failures: self.inner.export_failures.load(Ordering::Relaxed),
            replayed: self.inner.replayed.load(Ordering::Relaxed),
            journal_skipped: self.inner.journal.skipped_records(),
        }
    }
}

impl std::fmt::Debug for AuditProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditProcessor")
            .field("queue_size", &self.queue_size())
            .field("is_shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Fluent construction of an [`AuditProcessor`].
///
/// Defaults come from [`ProcessorConfig::default`]; the fault handler
/// defaults to [`TracingFaultHandler`]. `build` validates the
/// configuration, replays the journal into the queue, and starts the
/// background worker.
pub struct ProcessorBuilder {
    config: ProcessorConfig,
    exporter: Box<dyn Exporter>,
    backend: Box<dyn StorageBackend>,
    handler: Box<dyn FaultHandler>,
}

impl ProcessorBuilder {
    pub fn new(
        exporter: impl Exporter + 'static,
        backend: impl StorageBackend + 'static,
    ) -> Self {
        Self {
            config: ProcessorConfig::default(),
            exporter: Box::new(exporter),
            backend: Box::new(backend),
            handler: Box::new(TracingFaultHandler),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Interval between periodic export attempts.
    pub fn schedule_delay(mut self, delay: Duration) -> Self {
        self.config.schedule_delay = delay;
        self
    }

    /// Upper bound on records per export call.
    pub fn max_batch(mut self, size: usize) -> Self {
        self.config.max_batch = size;
        self
    }

    /// Per-export deadline. `Duration::ZERO` disables it.
    pub fn exporter_timeout(mut self, timeout: Duration) -> Self {
        self.config.exporter_timeout = timeout;
        self
    }

    /// Retry behavior for failed exports.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Receiver for background faults.
    pub fn fault_handler(mut self, handler: impl FaultHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Validate, replay the journal, and start the processor.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::InvalidConfig`] for a rejected configuration,
    /// [`ProcessorError::Replay`] when the journal cannot be read.
    pub async fn build(self) -> Result<AuditProcessor> {
        self.config
            .validate()
            .map_err(ProcessorError::InvalidConfig)?;

        let (stop_tx, _) = broadcast::channel(1);
        let inner = Arc::new(Inner {
            config: self.config,
            journal: Journal::new(self.backend),
            queue: std::sync::Mutex::new(SeverityQueue::new()),
            exporter: self.exporter,
            handler: self.handler,
            shutdown: AtomicBool::new(false),
            retry_attempt: AtomicU32::new(0),
            last_retry_at_ms: AtomicI64::new(0),
            export_gate: Mutex::new(()),
            stop_tx,
            emitted: AtomicU64::new(0),
            exported: AtomicU64::new(0),
            export_failures: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
        });

        // Replay before anything runs so the queue reflects durable
        // state from the previous process.
        let records = inner.journal.load_all().await.map_err(ProcessorError::Replay)?;
        if !records.is_empty() {
            debug!(count = records.len(), "replaying journaled records");
        }
        inner.replayed.store(records.len() as u64, Ordering::Relaxed);
        inner.queue().push_many(records);

        let worker = spawn_worker(Arc::clone(&inner));

        // One immediate attempt so replayed records do not wait a tick.
        let startup = Arc::clone(&inner);
        tokio::spawn(async move {
            startup.export_cycle().await;
        });

        Ok(AuditProcessor {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }
}
