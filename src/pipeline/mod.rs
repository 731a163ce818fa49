//! Delivery Pipeline
//!
//! Owns every component and wires them together:
//!
//! ```text
//! producers ──► Correlator ──► DeliveryQueue ──► Dispatcher ──► TransportSelector ──► collector
//!                                                    │  ▲
//!                                       failure /    │  │ replay on "back online"
//!                                       offline      ▼  │
//!                                                  RetryStore
//! ```
//!
//! There is no global state: a [`Pipeline`] is built by
//! [`PipelineBuilder::start`] and torn down by [`Pipeline::shutdown`].

pub mod source;

use crate::config::{defaults, ConfigError, RelayConfig};
use crate::correlator::{CallKind, Correlator, RequestKey};
use crate::dispatch::{DeliveryStatus, Dispatcher};
use crate::network::{HttpProber, NetworkMonitor, Prober};
use crate::queue::DeliveryQueue;
use crate::store::{ReplayOutcome, RetryBackend, RetryStore, SledBackend, StoreError};
use crate::transport::{Strategy, TransportSelector};
use crate::types::{PipelineStats, StatsSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Lifecycle signals forwarded by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostSignal {
    /// Connectivity restored (still verified by a probe).
    Online,
    /// Connectivity lost.
    Offline,
    /// The host is being hidden; it may never come back.
    Hidden,
    /// The host is tearing down.
    PageHide,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("retry store: {0}")]
    Store(#[from] StoreError),
    #[error("HTTP client: {0}")]
    Http(String),
}

/// Assembles a [`Pipeline`] from configuration, with optional overrides
/// for the transport chain, the reachability prober and the retry backend.
pub struct PipelineBuilder {
    config: RelayConfig,
    strategies: Option<Vec<Box<dyn Strategy>>>,
    prober: Option<Box<dyn Prober>>,
    backend: Option<Box<dyn RetryBackend>>,
}

impl PipelineBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            strategies: None,
            prober: None,
            backend: None,
        }
    }

    /// Replace the configured transport chain.
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn Strategy>>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn with_prober(mut self, prober: Box<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Use `backend` instead of the sled store at `retry.store_path`.
    pub fn with_backend(mut self, backend: Box<dyn RetryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Build every component and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Pipeline, PipelineError> {
        let config = self.config;
        config.validate()?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Http(e.to_string()))?;
        let stats = Arc::new(PipelineStats::default());
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let (selector, beacon_worker) = match self.strategies {
            Some(strategies) => (TransportSelector::new(strategies), None),
            None => TransportSelector::from_config(&config, http.clone()),
        };
        let strategy_names = selector.strategy_names();

        let prober: Box<dyn Prober> = match self.prober {
            Some(prober) => prober,
            None => Box::new(HttpProber::new(http.clone(), config.probe_url())),
        };
        let monitor = Arc::new(NetworkMonitor::new(prober, config.network.assume_online));

        let backend: Box<dyn RetryBackend> = match self.backend {
            Some(backend) => backend,
            None => Box::new(SledBackend::open(
                &config.retry.store_path,
                defaults::RETRY_STORE_KEY,
            )?),
        };
        let backend_name = backend.backend_name();
        let store = Arc::new(RetryStore::open(backend, &config.retry, stats.clone())?);

        let dispatcher = Arc::new(Dispatcher::new(selector, monitor.clone(), store, stats.clone()));
        let queue = DeliveryQueue::new(&config.queue, dispatcher.clone(), stats.clone(), tasks.clone());
        let correlator = Correlator::new(&config.correlator, &config.endpoint, queue.clone(), monitor.clone());

        let beacon = beacon_worker.map(|worker| tokio::spawn(worker.run(shutdown.clone())));
        let replay_listener = tokio::spawn(replay_on_reconnect(
            dispatcher.clone(),
            monitor.subscribe(),
            shutdown.clone(),
        ));

        if config.retry.replay_on_start {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                tokio::select! {
                    () = shutdown.cancelled() => debug!("Startup replay interrupted by shutdown"),
                    () = run_replay(&dispatcher, "startup") => {}
                }
            });
        }

        info!(
            endpoint = %config.endpoint,
            strategies = ?strategy_names,
            backend = backend_name,
            online = monitor.is_online(),
            "Telemetry pipeline started"
        );

        Ok(Pipeline {
            queue,
            correlator,
            dispatcher,
            stats,
            tasks,
            shutdown,
            beacon,
            replay_listener,
            grace: config.shutdown_grace(),
        })
    }
}

/// A running delivery pipeline.
pub struct Pipeline {
    queue: Arc<DeliveryQueue>,
    correlator: Arc<Correlator>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<PipelineStats>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    beacon: Option<JoinHandle<usize>>,
    replay_listener: JoinHandle<()>,
    grace: Duration,
}

impl Pipeline {
    /// Report one event. Never fails and never blocks on delivery.
    pub fn report(&self, fields: Map<String, Value>, immediate: bool) {
        self.queue.report(fields, immediate);
    }

    pub fn report_many(&self, items: Vec<Map<String, Value>>) {
        self.queue.report_many(items);
    }

    /// Flush the queue in the background.
    pub fn flush(&self) -> usize {
        self.queue.flush()
    }

    pub fn on_call_start(&self, method: &str, target: &str, kind: CallKind) -> Option<RequestKey> {
        self.correlator.on_call_start(method, target, kind)
    }

    pub fn on_call_complete(&self, key: &RequestKey, status: u16) {
        self.correlator.on_call_complete(key, status);
    }

    pub fn set_page(&self, url: &str) {
        self.correlator.set_page(url);
    }

    /// React to a host lifecycle signal.
    pub async fn handle_signal(&self, signal: HostSignal) {
        debug!(?signal, "Host signal");
        match signal {
            HostSignal::Online => {
                // A verified transition wakes the replay listener.
                self.dispatcher.monitor().on_connectivity_restored().await;
            }
            HostSignal::Offline => self.dispatcher.monitor().on_connectivity_lost(),
            HostSignal::Hidden | HostSignal::PageHide => {
                self.teardown_flush().await;
            }
        }
    }

    async fn teardown_flush(&self) -> DeliveryStatus {
        self.correlator.flush_now();
        self.queue.flush_teardown().await
    }

    /// Run one replay round now.
    pub async fn replay(&self) -> Result<Option<ReplayOutcome>, StoreError> {
        self.dispatcher.replay().await
    }

    pub fn is_online(&self) -> bool {
        self.dispatcher.monitor().is_online()
    }

    /// Records waiting in the retry store.
    pub fn pending(&self) -> Result<usize, StoreError> {
        self.dispatcher.store().len()
    }

    /// Records waiting in the in-memory queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Flush everything and stop the background tasks.
    ///
    /// Waits at most `shutdown_grace_ms` for in-flight deliveries, for the
    /// replay listener and for the beacon worker to drain. A replay round
    /// still running is abandoned; its unconfirmed slices stay persisted.
    pub async fn shutdown(self) -> StatsSnapshot {
        let status = self.teardown_flush().await;
        debug!(?status, "Final flush");

        self.tasks.close();
        if tokio::time::timeout(self.grace, self.tasks.wait()).await.is_err() {
            warn!(in_flight = self.tasks.len(), "Shutdown grace elapsed with deliveries in flight");
        }

        self.shutdown.cancel();
        let mut listener = self.replay_listener;
        match tokio::time::timeout(self.grace, &mut listener).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Replay listener ended abnormally"),
            Err(_) => {
                warn!("Shutdown grace elapsed before replay listener stopped");
                listener.abort();
            }
        }
        if let Some(beacon) = self.beacon {
            match tokio::time::timeout(self.grace, beacon).await {
                Ok(Ok(sent)) => debug!(sent, "Beacon worker stopped"),
                Ok(Err(e)) => warn!(error = %e, "Beacon worker ended abnormally"),
                Err(_) => warn!("Shutdown grace elapsed before beacon queue drained"),
            }
        }

        let stats = self.stats.snapshot();
        info!(
            enqueued = stats.enqueued,
            delivered = stats.delivered,
            persisted = stats.persisted,
            evicted = stats.evicted,
            replayed = stats.replayed,
            "Telemetry pipeline stopped"
        );
        stats
    }
}

/// Replay the store every time the monitor reports the collector reachable again.
async fn replay_on_reconnect(
    dispatcher: Arc<Dispatcher>,
    mut back_online: broadcast::Receiver<()>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            msg = back_online.recv() => match msg {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    // An interrupted round leaves unconfirmed slices in the store.
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = run_replay(&dispatcher, "back online") => {}
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn run_replay(dispatcher: &Dispatcher, trigger: &'static str) {
    match dispatcher.replay().await {
        Ok(Some(ReplayOutcome::Stopped { remaining, error, .. })) => {
            debug!(trigger, remaining, error = %error, "Replay round stopped early");
        }
        Ok(Some(outcome)) => debug!(trigger, ?outcome, "Replay round finished"),
        Ok(None) => debug!(trigger, "Replay skipped while offline"),
        Err(e) => warn!(trigger, error = %e, "Replay failed to read retry store"),
    }
}
