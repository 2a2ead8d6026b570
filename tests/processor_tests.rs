//! End-to-end processor tests: delivery ordering, retry behavior,
//! crash recovery, shutdown semantics, and the durability contract.

use async_trait::async_trait;
use audit_relay::journal::INDEX_KEY;
use audit_relay::{
    AuditProcessor, AuditRecord, ExportError, Exporter, Fault, FaultHandler, FaultKind,
    MemoryBackend, ProcessorError, RetryPolicy, Severity, StorageBackend,
};
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Exporter that records successful deliveries and can be programmed
/// to fail its first calls or every call.
#[derive(Debug, Clone, Default)]
struct RecordingExporter {
    attempts: Arc<AtomicU32>,
    failures_remaining: Arc<AtomicU32>,
    always_fail: Arc<AtomicBool>,
    deliveries: Arc<Mutex<Vec<Vec<AuditRecord>>>>,
}

impl RecordingExporter {
    fn new() -> Self {
        Self::default()
    }

    fn failing_first(n: u32) -> Self {
        let exporter = Self::default();
        exporter.failures_remaining.store(n, Ordering::SeqCst);
        exporter
    }

    fn always_failing() -> Self {
        let exporter = Self::default();
        exporter.always_fail.store(true, Ordering::SeqCst);
        exporter
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn deliveries(&self) -> Vec<Vec<AuditRecord>> {
        self.deliveries.lock().unwrap().clone()
    }

    fn delivered_bodies(&self) -> Vec<Vec<String>> {
        self.deliveries()
            .iter()
            .map(|batch| batch.iter().map(|r| r.body.clone()).collect())
            .collect()
    }

    fn total_delivered(&self) -> usize {
        self.deliveries().iter().map(|batch| batch.len()).sum()
    }
}

#[async_trait]
impl Exporter for RecordingExporter {
    async fn export(&self, batch: &[AuditRecord]) -> Result<(), ExportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(ExportError::Transient("endpoint unavailable".into()));
        }
        let fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ExportError::Transient("endpoint unavailable".into()));
        }
        self.deliveries.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct CollectingHandler {
    faults: Arc<Mutex<Vec<(FaultKind, usize)>>>,
}

impl CollectingHandler {
    fn faults(&self) -> Vec<(FaultKind, usize)> {
        self.faults.lock().unwrap().clone()
    }
}

impl FaultHandler for CollectingHandler {
    fn handle(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .push((fault.kind, fault.records.len()));
    }
}

async fn wait_until<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn live_ids(backend: &MemoryBackend) -> Vec<String> {
    match backend.get(INDEX_KEY).await {
        Ok(data) => serde_json::from_slice(&data).unwrap(),
        Err(_) => Vec::new(),
    }
}

fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

#[tokio::test]
async fn test_basic_delivery_in_severity_order() {
    let exporter = RecordingExporter::new();
    let backend = MemoryBackend::new();
    let processor = AuditProcessor::builder(exporter.clone(), backend.clone())
        .max_batch(10)
        .schedule_delay(Duration::from_millis(100))
        .build()
        .await
        .unwrap();

    processor
        .emit(AuditRecord::new(Severity::Info, "a"))
        .await
        .unwrap();
    processor
        .emit(AuditRecord::new(Severity::Warn, "b"))
        .await
        .unwrap();
    processor
        .emit(AuditRecord::new(Severity::Error, "c"))
        .await
        .unwrap();

    assert!(
        wait_until(|| exporter.total_delivered() == 3, Duration::from_secs(2)).await,
        "records were not delivered"
    );
    assert_eq!(exporter.delivered_bodies(), vec![vec!["c", "b", "a"]]);

    let mut journal_empty = false;
    for _ in 0..200 {
        if live_ids(&backend).await.is_empty() {
            journal_empty = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(journal_empty, "journal was not emptied after delivery");

    processor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_priority_preemption_with_single_record_batches() {
    let exporter = RecordingExporter::new();
    let processor = AuditProcessor::builder(exporter.clone(), MemoryBackend::new())
        .max_batch(1)
        .schedule_delay(Duration::from_millis(50))
        .build()
        .await
        .unwrap();

    processor
        .emit(AuditRecord::new(Severity::Debug, "lo"))
        .await
        .unwrap();
    processor
        .emit(AuditRecord::new(Severity::Fatal, "hi"))
        .await
        .unwrap();

    assert!(
        wait_until(|| exporter.total_delivered() == 2, Duration::from_secs(2)).await,
        "records were not delivered"
    );
    assert_eq!(
        exporter.delivered_bodies(),
        vec![vec!["hi"], vec!["lo"]],
        "higher severity must ship in the earlier batch"
    );

    processor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_then_success() {
    let exporter = RecordingExporter::failing_first(2);
    let handler = CollectingHandler::default();
    let backend = MemoryBackend::new();
    let processor = AuditProcessor::builder(exporter.clone(), backend.clone())
        .schedule_delay(Duration::from_millis(20))
        .retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
        })
        .fault_handler(handler.clone())
        .build()
        .await
        .unwrap();

    processor
        .emit(AuditRecord::new(Severity::Error, "retry me"))
        .await
        .unwrap();

    assert!(
        wait_until(|| exporter.total_delivered() == 1, Duration::from_secs(5)).await,
        "record never made it through"
    );
    assert_eq!(exporter.attempts(), 3);
    assert_eq!(exporter.delivered_bodies(), vec![vec!["retry me"]]);
    assert!(handler.faults().is_empty(), "no fault is expected on eventual success");

    processor.shutdown().await.unwrap();
    assert!(live_ids(&backend).await.is_empty());
}

#[tokio::test]
async fn test_retry_exhaustion_surfaces_fault_and_keeps_journal() {
    let exporter = RecordingExporter::always_failing();
    let handler = CollectingHandler::default();
    let backend = MemoryBackend::new();
    let processor = AuditProcessor::builder(exporter.clone(), backend.clone())
        .schedule_delay(Duration::from_millis(10))
        .retry_policy(quick_retry(3))
        .fault_handler(handler.clone())
        .build()
        .await
        .unwrap();

    processor
        .emit(AuditRecord::new(Severity::Error, "doomed"))
        .await
        .unwrap();

    assert!(
        wait_until(
            || handler.faults().contains(&(FaultKind::ExportFailed, 1)),
            Duration::from_secs(5)
        )
        .await,
        "permanent failure was not surfaced"
    );

    // maxAttempts retries plus the initial try
    assert_eq!(exporter.attempts(), 4);
    assert_eq!(processor.queue_size(), 0);
    assert_eq!(processor.retry_attempts(), 0);
    assert_eq!(live_ids(&backend).await.len(), 1, "record must stay journaled");

    // The counters were reset and the queue is empty; no further
    // attempts happen.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exporter.attempts(), 4);

    processor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_crash_recovery_replays_journal() {
    let backend = MemoryBackend::new();
    let emitted: Vec<AuditRecord> = ["a", "b", "c"]
        .iter()
        .map(|body| AuditRecord::new(Severity::Info, *body))
        .collect();

    // First life: the endpoint is down, nothing gets delivered.
    {
        let exporter = RecordingExporter::always_failing();
        let handler = CollectingHandler::default();
        let processor = AuditProcessor::builder(exporter.clone(), backend.clone())
            .schedule_delay(Duration::from_millis(10))
            .retry_policy(quick_retry(0))
            .fault_handler(handler.clone())
            .build()
            .await
            .unwrap();

        for record in &emitted {
            processor.emit(record.clone()).await.unwrap();
        }
        processor.shutdown().await.unwrap();
        assert_eq!(exporter.total_delivered(), 0);
    }

    assert_eq!(live_ids(&backend).await.len(), 3);

    // Second life: same backend, working endpoint.
    let exporter = RecordingExporter::new();
    let processor = AuditProcessor::builder(exporter.clone(), backend.clone())
        .schedule_delay(Duration::from_millis(20))
        .build()
        .await
        .unwrap();

    assert_eq!(processor.stats().replayed, 3);
    processor.force_flush().await.unwrap();

    assert_eq!(exporter.total_delivered(), 3);
    let mut delivered_ids: Vec<String> = exporter
        .deliveries()
        .iter()
        .flatten()
        .map(|r| r.record_id().to_string())
        .collect();
    delivered_ids.sort();
    let mut expected_ids: Vec<String> = emitted
        .iter()
        .map(|r| r.record_id().to_string())
        .collect();
    expected_ids.sort();
    assert_eq!(delivered_ids, expected_ids);

    assert!(live_ids(&backend).await.is_empty());
    processor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_emit_after_shutdown_is_rejected() {
    let handler = CollectingHandler::default();
    let backend = MemoryBackend::new();
    let processor = AuditProcessor::builder(RecordingExporter::new(), backend.clone())
        .fault_handler(handler.clone())
        .build()
        .await
        .unwrap();

    processor.shutdown().await.unwrap();

    let result = processor
        .emit(AuditRecord::new(Severity::Info, "too late"))
        .await;
    assert!(matches!(result, Err(ProcessorError::ShutDown)));
    assert_eq!(handler.faults(), vec![(FaultKind::Shutdown, 1)]);
    assert!(live_ids(&backend).await.is_empty(), "journal must be untouched");
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let processor = AuditProcessor::builder(RecordingExporter::new(), MemoryBackend::new())
        .build()
        .await
        .unwrap();

    processor.shutdown().await.unwrap();
    processor.shutdown().await.unwrap();
    processor
        .shutdown_with_timeout(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(processor.is_shutdown());
}

#[tokio::test]
async fn test_batches_never_exceed_max_batch() {
    let exporter = RecordingExporter::new();
    let processor = AuditProcessor::builder(exporter.clone(), MemoryBackend::new())
        .max_batch(4)
        .schedule_delay(Duration::from_millis(30))
        .build()
        .await
        .unwrap();

    for i in 0..10 {
        processor
            .emit(AuditRecord::new(Severity::Info, format!("r{}", i)))
            .await
            .unwrap();
    }

    assert!(
        wait_until(|| exporter.total_delivered() == 10, Duration::from_secs(2)).await,
        "not all records delivered"
    );
    for batch in exporter.deliveries() {
        assert!(batch.len() <= 4, "batch of {} exceeds the bound", batch.len());
    }

    processor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_emissions_collapse() {
    let exporter = RecordingExporter::new();
    let backend = MemoryBackend::new();
    let processor = AuditProcessor::builder(exporter.clone(), backend.clone())
        .schedule_delay(Duration::from_millis(50))
        .build()
        .await
        .unwrap();

    let timestamp = Utc.with_ymd_and_hms(2024, 5, 14, 10, 0, 0).unwrap();
    let record = AuditRecord::new(Severity::Info, "dup").with_timestamp(timestamp);

    processor.emit(record.clone()).await.unwrap();
    processor.emit(record).await.unwrap();

    assert!(
        wait_until(|| exporter.total_delivered() >= 1, Duration::from_secs(2)).await,
        "record was not delivered"
    );
    assert_eq!(exporter.delivered_bodies(), vec![vec!["dup"]]);
    assert_eq!(processor.stats().emitted, 1);

    processor.shutdown().await.unwrap();
    assert_eq!(exporter.total_delivered(), 1);
}

#[tokio::test]
async fn test_exporter_not_invoked_while_queue_empty() {
    let exporter = RecordingExporter::new();
    let processor = AuditProcessor::builder(exporter.clone(), MemoryBackend::new())
        .schedule_delay(Duration::from_millis(25))
        .build()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(exporter.attempts(), 0);

    processor.shutdown().await.unwrap();
    assert_eq!(exporter.attempts(), 0);
}

#[tokio::test]
async fn test_bounded_flush_reports_timeout() {
    let exporter = RecordingExporter::always_failing();
    let processor = AuditProcessor::builder(exporter.clone(), MemoryBackend::new())
        .schedule_delay(Duration::from_secs(10))
        .retry_policy(RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        })
        .build()
        .await
        .unwrap();

    processor
        .emit(AuditRecord::new(Severity::Warn, "stuck"))
        .await
        .unwrap();

    let result = processor
        .force_flush_with_timeout(Duration::from_millis(100))
        .await;
    match result {
        Err(ProcessorError::FlushTimeout { pending }) => assert_eq!(pending, 1),
        other => panic!("expected FlushTimeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bounded_shutdown_reports_timeout_and_preserves_journal() {
    let exporter = RecordingExporter::always_failing();
    let backend = MemoryBackend::new();
    let processor = AuditProcessor::builder(exporter.clone(), backend.clone())
        .schedule_delay(Duration::from_secs(10))
        .retry_policy(RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        })
        .build()
        .await
        .unwrap();

    processor
        .emit(AuditRecord::new(Severity::Error, "stuck"))
        .await
        .unwrap();

    let result = processor
        .shutdown_with_timeout(Duration::from_millis(100))
        .await;
    assert!(matches!(
        result,
        Err(ProcessorError::ShutdownTimeout { pending: 1 })
    ));

    assert!(processor.is_shutdown());
    assert_eq!(live_ids(&backend).await.len(), 1, "record must stay journaled");

    let late = processor
        .emit(AuditRecord::new(Severity::Info, "late"))
        .await;
    assert!(matches!(late, Err(ProcessorError::ShutDown)));
}

#[tokio::test]
async fn test_flush_after_shutdown_is_a_no_op() {
    let processor = AuditProcessor::builder(RecordingExporter::new(), MemoryBackend::new())
        .build()
        .await
        .unwrap();

    processor.shutdown().await.unwrap();
    processor.force_flush().await.unwrap();
    processor
        .force_flush_with_timeout(Duration::from_millis(10))
        .await
        .unwrap();
}
