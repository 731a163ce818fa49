//! Durable Retry Store — bounded persistent log of undelivered records
//!
//! Records land here when delivery fails or connectivity is known to be
//! absent. The log is order-preserving and capped: when a persist would
//! exceed `max_items` the oldest entries are dropped so the newest failures
//! are always retained.
//!
//! Replay re-sends the log in small front slices. A slice is removed only
//! after the transport confirms it, and the first failure stops the round
//! with the remainder left in place for the next trigger.

mod backend;

pub use backend::{InMemoryBackend, RetryBackend, SledBackend};

use crate::config::RetryConfig;
use crate::transport::DeliveryError;
use crate::types::{Batch, EventRecord, PipelineStats};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A persisted record tagged with its insertion sequence number.
///
/// Removal after replay is by sequence number, so records persisted while a
/// replay is in flight are never removed by mistake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub seq: u64,
    pub record: EventRecord,
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of one replay round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Nothing was persisted.
    Empty,
    /// Every record in the snapshot was re-delivered.
    Completed { delivered: usize },
    /// A slice failed; `remaining` records stay persisted.
    Stopped {
        delivered: usize,
        remaining: usize,
        error: DeliveryError,
    },
    /// Another replay round is in progress.
    AlreadyRunning,
}

pub struct RetryStore {
    backend: Box<dyn RetryBackend>,
    max_items: usize,
    slice_size: usize,
    pause: Duration,
    /// Serializes read-modify-write cycles on the backend. Never held across an await.
    write_lock: Mutex<u64>,
    replaying: AtomicBool,
    stats: Arc<PipelineStats>,
}

impl RetryStore {
    /// Open a store over `backend`, resuming the sequence counter from disk.
    pub fn open(
        backend: Box<dyn RetryBackend>,
        config: &RetryConfig,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, StoreError> {
        let entries = backend.load()?;
        let next_seq = entries.iter().map(|e| e.seq + 1).max().unwrap_or(0);

        if entries.is_empty() {
            debug!(backend = backend.backend_name(), "Retry store opened (empty)");
        } else {
            info!(
                backend = backend.backend_name(),
                pending = entries.len(),
                "Retry store opened with pending records"
            );
        }

        Ok(Self {
            backend,
            max_items: config.max_items.max(1),
            slice_size: config.slice_size.max(1),
            pause: config.pause(),
            write_lock: Mutex::new(next_seq),
            replaying: AtomicBool::new(false),
            stats,
        })
    }

    /// Append records in order, evicting the oldest beyond capacity.
    ///
    /// Returns how many entries were evicted. Overflow is never an error.
    pub fn persist(&self, records: Vec<EventRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let added = records.len();

        let mut next_seq = self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let mut entries = self.backend.load()?;
        for record in records {
            entries.push(RetryEntry {
                seq: *next_seq,
                record,
            });
            *next_seq += 1;
        }

        let evicted = entries.len().saturating_sub(self.max_items);
        if evicted > 0 {
            entries.drain(..evicted);
        }
        self.backend.save(&entries)?;
        drop(next_seq);

        self.stats.record_persisted(added);
        if evicted > 0 {
            self.stats.record_evicted(evicted);
            warn!(
                max = self.max_items,
                evicted,
                "Retry store full, dropped oldest records"
            );
        }
        debug!(added, pending = entries.len(), "Records persisted for retry");
        Ok(evicted)
    }

    /// All pending records, oldest first.
    pub fn pending(&self) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .backend
            .load()?
            .into_iter()
            .map(|e| e.record)
            .collect())
    }

    /// Number of pending records.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.backend.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Re-deliver persisted records slice by slice through `send`.
    ///
    /// Works on a snapshot of the log taken at the start of the round.
    /// Records persisted while the round runs wait for the next trigger.
    pub async fn replay<F, Fut>(&self, mut send: F) -> Result<ReplayOutcome, StoreError>
    where
        F: FnMut(Batch) -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        if self.replaying.swap(true, Ordering::SeqCst) {
            debug!("Replay already running, skipping trigger");
            return Ok(ReplayOutcome::AlreadyRunning);
        }
        let _guard = ReplayGuard(&self.replaying);

        let snapshot = self.backend.load()?;
        if snapshot.is_empty() {
            return Ok(ReplayOutcome::Empty);
        }
        info!(pending = snapshot.len(), "Replaying persisted records");

        let mut delivered = 0usize;
        let mut slices = snapshot.chunks(self.slice_size).peekable();
        while let Some(slice) = slices.next() {
            // Entries evicted since the snapshot are gone for good.
            let live = self.still_pending(slice)?;
            if live.is_empty() {
                debug!(slice = slice.len(), "Replay slice evicted before sending, skipping");
                continue;
            }
            let seqs: Vec<u64> = live.iter().map(|e| e.seq).collect();
            let batch = Batch::new(live.into_iter().map(|e| e.record).collect());

            if let Err(error) = send(batch).await {
                let remaining = self.len()?;
                warn!(
                    delivered,
                    remaining,
                    error = %error,
                    "Replay stopped on failed slice, keeping remainder"
                );
                return Ok(ReplayOutcome::Stopped {
                    delivered,
                    remaining,
                    error,
                });
            }

            let removed = self.remove(&seqs)?;
            delivered += removed;
            self.stats.record_replayed(removed);
            debug!(slice = seqs.len(), removed, delivered, "Replay slice delivered");

            if slices.peek().is_some() {
                tokio::time::sleep(self.pause).await;
            }
        }

        info!(delivered, "Replay complete");
        Ok(ReplayOutcome::Completed { delivered })
    }

    /// The entries of `slice` that are still in the log.
    fn still_pending(&self, slice: &[RetryEntry]) -> Result<Vec<RetryEntry>, StoreError> {
        let oldest = match self.backend.load()?.first() {
            Some(entry) => entry.seq,
            None => return Ok(Vec::new()),
        };
        // Only eviction removes entries outside a replay, and it removes from the front.
        Ok(slice.iter().filter(|e| e.seq >= oldest).cloned().collect())
    }

    /// Drop exactly the entries with the given sequence numbers.
    ///
    /// Returns how many of them were still present.
    fn remove(&self, seqs: &[u64]) -> Result<usize, StoreError> {
        let _lock = self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let mut entries = self.backend.load()?;
        let before = entries.len();
        entries.retain(|e| !seqs.contains(&e.seq));
        let removed = before - entries.len();
        if removed > 0 {
            self.backend.save(&entries)?;
        }
        Ok(removed)
    }
}

/// Clears the replay-in-progress flag however the round ends.
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};
    use std::sync::Mutex as StdMutex;

    fn record(n: i64) -> EventRecord {
        let mut fields = Map::new();
        fields.insert("n".to_string(), Value::from(n));
        EventRecord::at(fields, n, false)
    }

    fn store_with(max_items: usize, slice_size: usize) -> RetryStore {
        let config = RetryConfig {
            max_items,
            slice_size,
            pause_ms: 0,
            ..RetryConfig::default()
        };
        RetryStore::open(Box::new(InMemoryBackend::new()), &config, Arc::default()).unwrap()
    }

    fn ns(records: &[EventRecord]) -> Vec<i64> {
        records.iter().map(|r| r.get("n").and_then(Value::as_i64).unwrap()).collect()
    }

    #[test]
    fn test_persist_preserves_order() {
        let store = store_with(100, 5);
        store.persist(vec![record(1), record(2)]).unwrap();
        store.persist(vec![record(3)]).unwrap();
        assert_eq!(ns(&store.pending().unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let store = store_with(1000, 5);
        store.persist((0..1000).map(record).collect()).unwrap();
        assert_eq!(store.len().unwrap(), 1000);

        let evicted = store.persist(vec![record(1000)]).unwrap();
        assert_eq!(evicted, 1);

        let pending = ns(&store.pending().unwrap());
        assert_eq!(pending.len(), 1000);
        assert_eq!(pending[0], 1, "oldest original record is gone");
        assert_eq!(*pending.last().unwrap(), 1000);
        assert_eq!(store.stats.snapshot().evicted, 1);
    }

    #[tokio::test]
    async fn test_replay_empty_is_noop() {
        let store = store_with(10, 5);
        let outcome = store
            .replay(|_| async { Err::<(), _>(DeliveryError::NoStrategy) })
            .await
            .unwrap();
        assert_eq!(outcome, ReplayOutcome::Empty);
    }

    #[tokio::test]
    async fn test_replay_sends_front_slices_in_order() {
        let store = store_with(100, 5);
        store.persist((0..12).map(record).collect()).unwrap();

        let seen = StdMutex::new(Vec::new());
        let outcome = store
            .replay(|batch| {
                seen.lock().unwrap().push(ns(batch.records()));
                async { Ok::<(), DeliveryError>(()) }
            })
            .await
            .unwrap();

        assert_eq!(outcome, ReplayOutcome::Completed { delivered: 12 });
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], vec![0, 1, 2, 3, 4]);
        assert_eq!(seen[2], vec![10, 11]);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_replay_stops_on_failure_and_resumes() {
        let store = store_with(100, 5);
        store.persist((0..12).map(record).collect()).unwrap();

        let mut calls = 0;
        let outcome = store
            .replay(|_| {
                calls += 1;
                let result = if calls == 2 {
                    Err(DeliveryError::Network("down".into()))
                } else {
                    Ok(())
                };
                async move { result }
            })
            .await
            .unwrap();

        assert_eq!(calls, 2, "no slice attempted after the failure");
        assert!(matches!(
            outcome,
            ReplayOutcome::Stopped { delivered: 5, remaining: 7, .. }
        ));
        assert_eq!(ns(&store.pending().unwrap()), (5..12).collect::<Vec<_>>());

        // Next trigger resumes from the same remainder.
        let firsts = StdMutex::new(Vec::new());
        let outcome = store
            .replay(|batch| {
                firsts.lock().unwrap().push(ns(batch.records())[0]);
                async { Ok::<(), DeliveryError>(()) }
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReplayOutcome::Completed { delivered: 7 });
        assert_eq!(firsts.into_inner().unwrap(), vec![5, 10]);
    }

    #[tokio::test]
    async fn test_records_persisted_during_replay_survive() {
        let store = store_with(100, 2);
        store.persist(vec![record(0), record(1)]).unwrap();

        let s = &store;
        let outcome = store
            .replay(|_| async move {
                s.persist(vec![record(99)]).unwrap();
                Ok::<(), DeliveryError>(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, ReplayOutcome::Completed { delivered: 2 });
        assert_eq!(ns(&store.pending().unwrap()), vec![99]);
    }

    #[tokio::test]
    async fn test_eviction_during_replay_keeps_accounting_exact() {
        let store = store_with(5, 5);
        store.persist((0..5).map(record).collect()).unwrap();

        let s = &store;
        let outcome = store
            .replay(|_| async move {
                // Overflow while the slice is in flight: the whole snapshot is evicted.
                s.persist((100..105).map(record).collect()).unwrap();
                Ok::<(), DeliveryError>(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, ReplayOutcome::Completed { delivered: 0 });
        assert_eq!(ns(&store.pending().unwrap()), vec![100, 101, 102, 103, 104]);

        let stats = store.stats.snapshot();
        assert_eq!(stats.persisted, 10);
        assert_eq!(stats.evicted, 5);
        assert_eq!(stats.replayed, 0);
        assert_eq!(
            stats.persisted,
            stats.replayed + stats.evicted + store.len().unwrap() as u64
        );
    }

    #[tokio::test]
    async fn test_slice_evicted_before_sending_is_skipped() {
        let store = store_with(4, 2);
        store.persist((0..4).map(record).collect()).unwrap();

        let s = &store;
        let seen = StdMutex::new(Vec::new());
        let outcome = store
            .replay(|batch| {
                let first_slice = seen.lock().unwrap().is_empty();
                seen.lock().unwrap().push(ns(batch.records()));
                async move {
                    if first_slice {
                        // Evicts the in-flight slice and the one after it.
                        s.persist((10..14).map(record).collect()).unwrap();
                    }
                    Ok::<(), DeliveryError>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(seen.into_inner().unwrap(), vec![vec![0, 1]]);
        assert_eq!(outcome, ReplayOutcome::Completed { delivered: 0 });
        assert_eq!(ns(&store.pending().unwrap()), vec![10, 11, 12, 13]);

        let stats = store.stats.snapshot();
        assert_eq!(
            stats.persisted,
            stats.replayed + stats.evicted + store.len().unwrap() as u64
        );
    }

    #[tokio::test]
    async fn test_concurrent_replay_is_refused() {
        let store = store_with(100, 5);
        store.persist(vec![record(0)]).unwrap();

        let s = &store;
        let outcome = store
            .replay(|_| async move {
                let nested = s.replay(|_| async { Ok::<(), DeliveryError>(()) }).await.unwrap();
                assert_eq!(nested, ReplayOutcome::AlreadyRunning);
                Ok::<(), DeliveryError>(())
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReplayOutcome::Completed { delivered: 1 });
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("retry");
        let config = RetryConfig::default();
        {
            let backend = SledBackend::open(&path, "RETRY_LOGS").unwrap();
            let store = RetryStore::open(Box::new(backend), &config, Arc::default()).unwrap();
            store.persist(vec![record(0), record(1)]).unwrap();
        }
        let backend = SledBackend::open(&path, "RETRY_LOGS").unwrap();
        let store = RetryStore::open(Box::new(backend), &config, Arc::default()).unwrap();
        store.persist(vec![record(2)]).unwrap();

        let seqs: Vec<u64> = store.backend.load().unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(serde_json::to_value(&store.pending().unwrap()[2]).unwrap(), json!({"n": 2, "ts": 2}));
    }
}
