//! Audit Record Definitions
//!
//! The record value carried through the processor, its severity scale,
//! and the content-derived identity used for journaling and dedup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use xxhash_rust::xxh3::xxh3_64;

/// Severity of an audit record.
///
/// Six priority bands plus `Unspecified` for records emitted without a
/// severity. Higher bands are delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// No severity was set on the record.
    Unspecified,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    /// Numeric delivery priority. Higher is exported earlier.
    pub fn priority(self) -> u8 {
        match self {
            Severity::Unspecified => 0,
            Severity::Trace => 1,
            Severity::Debug => 2,
            Severity::Info => 3,
            Severity::Warn => 4,
            Severity::Error => 5,
            Severity::Fatal => 6,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Unspecified => write!(f, "UNSPECIFIED"),
            Severity::Trace => write!(f, "TRACE"),
            Severity::Debug => write!(f, "DEBUG"),
            Severity::Info => write!(f, "INFO"),
            Severity::Warn => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// An immutable audit record.
///
/// The processor reads only the severity (for queue priority) and the
/// derived [`RecordId`] (for journal keying and dedup); everything else
/// is carried opaquely and round-trips through the journal unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the audited event occurred.
    pub timestamp: DateTime<Utc>,
    /// When the record was observed by the emitting process, if distinct.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_timestamp: Option<DateTime<Utc>>,
    /// Severity band.
    pub severity: Severity,
    /// Free-form severity label from the emitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_text: Option<String>,
    /// Record body.
    pub body: String,
    /// Additional attributes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl AuditRecord {
    /// Create a record stamped with the current time.
    pub fn new(severity: Severity, body: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            observed_timestamp: None,
            severity,
            severity_text: None,
            body: body.into(),
            attributes: HashMap::new(),
        }
    }

    /// Override the event timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the observed timestamp.
    pub fn with_observed_timestamp(mut self, observed: DateTime<Utc>) -> Self {
        self.observed_timestamp = Some(observed);
        self
    }

    /// Set the emitter's severity label.
    pub fn with_severity_text(mut self, text: impl Into<String>) -> Self {
        self.severity_text = Some(text.into());
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Delivery priority derived from the severity.
    pub fn priority(&self) -> u8 {
        self.severity.priority()
    }

    /// Content-derived identity of this record.
    ///
    /// Records with identical (timestamp, body, severity) share an id and
    /// collapse to a single journal entry.
    pub fn record_id(&self) -> RecordId {
        let nanos = self.timestamp.timestamp_nanos_opt().unwrap_or_default();
        let canonical = format!("{}_{}_{}", nanos, self.body, self.severity);
        RecordId(xxh3_64(canonical.as_bytes()))
    }
}

/// 64-bit content hash identifying a record in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
