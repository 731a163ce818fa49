//! Delivery Queue — in-memory batcher in front of the dispatcher
//!
//! `empty → accumulating → flushing → empty`. A flush is triggered by
//! whichever comes first:
//!
//! - the queue reaching `max` records
//! - the wait timer armed by the first record after an empty queue
//! - a teardown signal from the host
//! - an explicit `flush()` call
//!
//! Taking the snapshot, clearing the queue and cancelling the timer happen
//! under one lock, so a flush never double-sends. Background flushes yield
//! to the scheduler before sending; that only affects when the batch goes
//! out, never whether it does.

use crate::config::QueueConfig;
use crate::dispatch::{DeliveryStatus, Dispatcher};
use crate::schedule::ScheduledTask;
use crate::types::{Batch, EventRecord, PipelineStats};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Why a flush happened, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Full,
    Timer,
    Teardown,
    Explicit,
}

#[derive(Default)]
struct QueueState {
    records: Vec<EventRecord>,
    timer: ScheduledTask,
}

pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    max: usize,
    wait: Duration,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<PipelineStats>,
    tasks: TaskTracker,
}

impl DeliveryQueue {
    pub fn new(
        config: &QueueConfig,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<PipelineStats>,
        tasks: TaskTracker,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            max: config.max.max(1),
            wait: config.wait(),
            dispatcher,
            stats,
            tasks,
        })
    }

    /// Report one record.
    ///
    /// `immediate` bypasses the queue: the record goes out on its own as a
    /// single object and this call does not wait for the result.
    pub fn report(self: &Arc<Self>, fields: Map<String, Value>, immediate: bool) {
        if immediate {
            let record = EventRecord::new(fields, true);
            self.stats.record_enqueued(1);
            let dispatcher = self.dispatcher.clone();
            self.tasks.spawn(async move {
                dispatcher.deliver(Batch::single(record)).await;
            });
            return;
        }
        self.report_many(vec![fields]);
    }

    /// Append several records atomically, flushing every time `max` is reached.
    pub fn report_many(self: &Arc<Self>, items: Vec<Map<String, Value>>) {
        if items.is_empty() {
            return;
        }
        self.stats.record_enqueued(items.len());

        let mut full_batches = Vec::new();
        {
            let mut state = self.lock();
            for fields in items {
                state.records.push(EventRecord::new(fields, false));
                if state.records.len() >= self.max {
                    full_batches.push(Self::take(&mut state));
                }
            }
            if !state.records.is_empty() && !state.timer.is_armed() {
                let queue = Arc::downgrade(self);
                state.timer.arm(self.wait, flush_on_timer(queue));
            }
        }

        for batch in full_batches {
            self.spawn_delivery(batch, FlushReason::Full);
        }
    }

    /// Flush now in the background. Returns how many records were taken.
    pub fn flush(&self) -> usize {
        self.flush_with(FlushReason::Explicit)
    }

    fn flush_with(&self, reason: FlushReason) -> usize {
        let batch = Self::take(&mut self.lock());
        let count = batch.len();
        self.spawn_delivery(batch, reason);
        count
    }

    /// Flush for host teardown: deliver immediately with teardown-safe
    /// strategies and wait for the hand-off.
    pub async fn flush_teardown(&self) -> DeliveryStatus {
        let batch = Self::take(&mut self.lock());
        if batch.is_empty() {
            return DeliveryStatus::Empty;
        }
        debug!(records = batch.len(), reason = ?FlushReason::Teardown, "Flushing queue");
        self.dispatcher.deliver_teardown(batch).await
    }

    /// Records currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot and clear the queue and cancel the pending timer.
    fn take(state: &mut QueueState) -> Batch {
        state.timer.cancel();
        Batch::new(std::mem::take(&mut state.records))
    }

    fn spawn_delivery(&self, batch: Batch, reason: FlushReason) {
        if batch.is_empty() {
            return;
        }
        debug!(records = batch.len(), ?reason, "Flushing queue");
        let dispatcher = self.dispatcher.clone();
        self.tasks.spawn(async move {
            tokio::task::yield_now().await;
            dispatcher.deliver(batch).await;
        });
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue state stays consistent across a panic in another holder.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn flush_on_timer(queue: Weak<DeliveryQueue>) {
    if let Some(queue) = queue.upgrade() {
        queue.flush_with(FlushReason::Timer);
    }
}
