//! Core data model for the delivery pipeline.
//!
//! - **EventRecord**: one reportable unit, immutable once created
//! - **Batch**: ordered group of records handed to the transport as one call
//! - **Payload**: the wire shape of a batch (single object or JSON array)
//! - **PipelineStats**: record accounting counters

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// EventRecord
// ============================================================================

/// One reportable telemetry unit.
///
/// Producer fields are flattened next to `ts` on the wire, so a record
/// `{"event": "click"}` enqueued at t=1700000000000 serializes as
/// `{"event":"click","ts":1700000000000}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(flatten)]
    fields: Map<String, Value>,
    ts: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    urgent: bool,
}

impl EventRecord {
    /// Create a record stamped with the current time.
    pub fn new(fields: Map<String, Value>, urgent: bool) -> Self {
        Self::at(fields, now_ms(), urgent)
    }

    /// Create a record with an explicit timestamp.
    ///
    /// A producer field named `ts` is shadowed by the assigned timestamp.
    pub fn at(mut fields: Map<String, Value>, ts: i64, urgent: bool) -> Self {
        fields.remove("ts");
        fields.remove("urgent");
        Self { fields, ts, urgent }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn ts(&self) -> i64 {
        self.ts
    }

    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    /// Look up a producer field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

// ============================================================================
// Batch / Payload
// ============================================================================

/// Immutable ordered slice of records sent as one transport call.
///
/// A batch is acknowledged or redirected to the retry store as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    records: Vec<EventRecord>,
    single: bool,
}

impl Batch {
    /// A batch that goes out as a JSON array.
    pub fn new(records: Vec<EventRecord>) -> Self {
        Self {
            records,
            single: false,
        }
    }

    /// A singleton that goes out as one bare JSON object.
    pub fn single(record: EventRecord) -> Self {
        Self {
            records: vec![record],
            single: true,
        }
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<EventRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encode to the collector wire format.
    pub fn encode(&self) -> Result<Payload, serde_json::Error> {
        match (self.single, self.records.as_slice()) {
            (true, [record]) => Ok(Payload {
                body: serde_json::to_string(record)?,
                single: Some(record.clone()),
            }),
            _ => Ok(Payload {
                body: serde_json::to_string(&self.records)?,
                single: None,
            }),
        }
    }
}

/// Encoded batch as it will be put on the wire.
#[derive(Debug, Clone)]
pub struct Payload {
    body: String,
    single: Option<EventRecord>,
}

impl Payload {
    /// JSON text of the payload.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// True encoded size in bytes (UTF-8), not character count.
    pub fn byte_len(&self) -> usize {
        self.body.len()
    }

    /// The record when this payload is a single, non-batched object.
    pub fn single(&self) -> Option<&EventRecord> {
        self.single.as_ref()
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Record accounting counters, shared by all pipeline components.
#[derive(Debug, Default)]
pub struct PipelineStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    persisted: AtomicU64,
    evicted: AtomicU64,
    replayed: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub persisted: u64,
    pub evicted: u64,
    pub replayed: u64,
}

impl PipelineStats {
    pub fn record_enqueued(&self, n: usize) {
        self.enqueued.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, n: usize) {
        self.delivered.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, n: usize) {
        self.persisted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, n: usize) {
        self.evicted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_replayed(&self, n: usize) {
        self.replayed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }
}
