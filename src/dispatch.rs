//! Dispatch policy — where a formed batch goes
//!
//! 1. Known offline: persist straight away, skip the request.
//! 2. Otherwise hand it to the transport selector.
//! 3. Any failure: persist the whole batch so nothing is lost.
//! 4. A network-layer failure additionally asks the monitor to re-probe;
//!    remote failures (server answered) never touch the belief.

use crate::network::NetworkMonitor;
use crate::store::{ReplayOutcome, RetryStore, StoreError};
use crate::transport::{DeliveryError, TransportSelector};
use crate::types::{Batch, EventRecord, Payload, PipelineStats};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happened to a batch handed to [`Dispatcher::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Accepted by the named strategy.
    Delivered(&'static str),
    /// Redirected to the retry store.
    Persisted,
    /// Nothing to send.
    Empty,
}

pub struct Dispatcher {
    selector: TransportSelector,
    monitor: Arc<NetworkMonitor>,
    store: Arc<RetryStore>,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    pub fn new(
        selector: TransportSelector,
        monitor: Arc<NetworkMonitor>,
        store: Arc<RetryStore>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            selector,
            monitor,
            store,
            stats,
        }
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<RetryStore> {
        &self.store
    }

    pub fn selector(&self) -> &TransportSelector {
        &self.selector
    }

    /// Deliver a fresh batch, falling back to the retry store.
    pub async fn deliver(&self, batch: Batch) -> DeliveryStatus {
        self.deliver_with(batch, false).await
    }

    /// Deliver during teardown using only teardown-safe strategies.
    ///
    /// Skips the reachability re-probe so teardown is never held up by it.
    pub async fn deliver_teardown(&self, batch: Batch) -> DeliveryStatus {
        self.deliver_with(batch, true).await
    }

    async fn deliver_with(&self, batch: Batch, teardown: bool) -> DeliveryStatus {
        if batch.is_empty() {
            return DeliveryStatus::Empty;
        }
        let count = batch.len();

        if !self.monitor.is_online() {
            debug!(records = count, "Offline, persisting batch without sending");
            self.persist(batch.into_records());
            return DeliveryStatus::Persisted;
        }

        let payload = match encode(&batch) {
            Ok(payload) => payload,
            Err(e) => {
                error!(records = count, error = %e, "Failed to encode batch, persisting");
                self.persist(batch.into_records());
                return DeliveryStatus::Persisted;
            }
        };

        let result = if teardown {
            self.selector.send_teardown(&payload).await
        } else {
            self.selector.send(&payload).await
        };

        match result {
            Ok(strategy) => {
                self.stats.record_delivered(count);
                DeliveryStatus::Delivered(strategy)
            }
            Err(e) => {
                warn!(records = count, error = %e, teardown, "Delivery failed, persisting batch");
                self.persist(batch.into_records());
                if e.is_network() && !teardown {
                    self.monitor.reverify().await;
                }
                DeliveryStatus::Persisted
            }
        }
    }

    /// Send an already-persisted slice. Failure leaves persistence to the store.
    pub async fn attempt(&self, batch: Batch) -> Result<(), DeliveryError> {
        let payload = encode(&batch)?;
        match self.selector.send(&payload).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_network() {
                    self.monitor.reverify().await;
                }
                Err(e)
            }
        }
    }

    /// Run one replay round of the retry store.
    ///
    /// Returns `None` without touching the store while the belief is offline.
    pub async fn replay(&self) -> Result<Option<ReplayOutcome>, StoreError> {
        if !self.monitor.is_online() {
            debug!("Offline, replay deferred");
            return Ok(None);
        }
        self.store
            .replay(|batch| self.attempt(batch))
            .await
            .map(Some)
    }

    fn persist(&self, records: Vec<EventRecord>) {
        let count = records.len();
        if let Err(e) = self.store.persist(records) {
            error!(records = count, error = %e, "Failed to persist undelivered records");
        }
    }
}

fn encode(batch: &Batch) -> Result<Payload, DeliveryError> {
    batch
        .encode()
        .map_err(|e| DeliveryError::Encode(e.to_string()))
}
