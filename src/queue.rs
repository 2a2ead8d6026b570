//! Severity-Ordered Delivery Queue
//!
//! In-memory max-heap of pending records. Higher severities drain first;
//! records of equal severity keep arrival order within a single run.

use crate::record::AuditRecord;
use std::collections::BinaryHeap;

struct Entry {
    priority: u8,
    seq: u64,
    record: AuditRecord,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap on priority; earlier insertion wins ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of records awaiting export.
///
/// Not durable on its own; durability comes from the journal. The caller
/// is expected to guard the queue with a lock.
#[derive(Default)]
pub struct SeverityQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl SeverityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, ordered by its severity priority.
    pub fn push(&mut self, record: AuditRecord) {
        let priority = record.priority();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority,
            seq,
            record,
        });
    }

    /// Add a batch of records.
    pub fn push_many(&mut self, records: impl IntoIterator<Item = AuditRecord>) {
        for record in records {
            self.push(record);
        }
    }

    /// Remove and return up to `n` records, highest priority first.
    pub fn pop_up_to(&mut self, n: usize) -> Vec<AuditRecord> {
        let mut batch = Vec::with_capacity(n.min(self.heap.len()));
        while batch.len() < n {
            match self.heap.pop() {
                Some(entry) => batch.push(entry.record),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
