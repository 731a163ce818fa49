//! Transport Selector — ordered fallback chain of delivery strategies
//!
//! Each payload goes out through exactly one strategy. The selector walks the
//! strategies in priority order and commits to the first one that accepts the
//! payload:
//!
//! 1. **beacon**: fire-and-forget enqueue, works during teardown, byte ceiling
//! 2. **pixel**: GET with query parameters, single records only, URL ceiling
//! 3. **keepalive**: async POST, 2xx = success
//! 4. **sync_post**: blocking POST on a dedicated thread, last resort
//!
//! Falling through happens only on [`DeliveryError::Rejected`] (capability or
//! size gate, refused local enqueue). Once a strategy has actually tried the
//! network its failure is final for this call.

pub mod beacon;
pub mod http;
pub mod pixel;

pub use beacon::{BeaconStrategy, BeaconWorker};
pub use http::{KeepAliveStrategy, SyncPostStrategy};
pub use pixel::PixelStrategy;

use crate::config::RelayConfig;
use crate::types::Payload;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Delivery failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Strategy unavailable or payload over its ceiling; the selector tries the next one.
    #[error("{strategy} rejected payload: {reason}")]
    Rejected { strategy: &'static str, reason: String },
    /// The call never reached a server.
    #[error("network failure: {0}")]
    Network(String),
    /// Server reachable but answered with a non-success status.
    #[error("collector returned status {status}")]
    Remote { status: u16 },
    /// Every strategy rejected the payload.
    #[error("no transport strategy accepted the payload")]
    NoStrategy,
    #[error("payload encoding failed: {0}")]
    Encode(String),
}

impl DeliveryError {
    /// Whether this failure says something about connectivity.
    ///
    /// Only a connection-level error produced by the failed call itself
    /// qualifies. Remote statuses never do.
    pub fn is_network(&self) -> bool {
        matches!(self, DeliveryError::Network(_))
    }

    pub(crate) fn rejected(strategy: &'static str, reason: impl Into<String>) -> Self {
        DeliveryError::Rejected {
            strategy,
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => DeliveryError::Remote {
                status: status.as_u16(),
            },
            None => DeliveryError::Network(e.to_string()),
        }
    }
}

/// Classify a completed call by its status code.
///
/// Status 0 is how hosts report a call that failed below HTTP (refused,
/// reset, CORS, aborted), so it is a network failure.
pub fn classify_status(status: u16) -> Result<(), DeliveryError> {
    match status {
        0 => Err(DeliveryError::Network("status 0".to_string())),
        200..=299 => Ok(()),
        status => Err(DeliveryError::Remote { status }),
    }
}

/// One delivery mechanism in the fallback chain.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Whether the strategy can fire without waiting on further scheduling,
    /// which makes it usable while the host is tearing down.
    fn teardown_safe(&self) -> bool {
        false
    }

    /// Capability and size gate. Must return `Rejected` when the payload
    /// cannot be carried by this strategy.
    fn check(&self, _payload: &Payload) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Deliver the payload.
    async fn send(&self, payload: &Payload) -> Result<(), DeliveryError>;
}

/// Ordered list of strategies; first capable, non-rejecting one wins.
pub struct TransportSelector {
    strategies: Vec<Box<dyn Strategy>>,
}

impl TransportSelector {
    pub fn new(strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    /// Build the standard chain from the host capabilities in `config`.
    ///
    /// Returns the beacon worker when the beacon strategy is enabled; the
    /// caller owns running it.
    pub fn from_config(config: &RelayConfig, http: reqwest::Client) -> (Self, Option<BeaconWorker>) {
        let t = &config.transport;
        let mut strategies: Vec<Box<dyn Strategy>> = Vec::new();
        let mut worker = None;

        if t.beacon {
            let (strategy, w) =
                beacon::channel(http.clone(), &config.endpoint, t.max_beacon_bytes, t.beacon_buffer);
            strategies.push(Box::new(strategy));
            worker = Some(w);
        }
        if t.pixel {
            strategies.push(Box::new(PixelStrategy::new(
                http.clone(),
                &config.endpoint,
                t.max_url_length,
            )));
        }
        if t.keepalive {
            strategies.push(Box::new(KeepAliveStrategy::new(http, &config.endpoint)));
        }
        if t.sync_post {
            strategies.push(Box::new(SyncPostStrategy::new(&config.endpoint)));
        }

        (Self::new(strategies), worker)
    }

    /// Strategy names in priority order.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Send through the first accepting strategy. Returns its name.
    pub async fn send(&self, payload: &Payload) -> Result<&'static str, DeliveryError> {
        self.dispatch(payload, false).await
    }

    /// Send using only teardown-safe strategies.
    pub async fn send_teardown(&self, payload: &Payload) -> Result<&'static str, DeliveryError> {
        self.dispatch(payload, true).await
    }

    async fn dispatch(
        &self,
        payload: &Payload,
        teardown: bool,
    ) -> Result<&'static str, DeliveryError> {
        for strategy in &self.strategies {
            if teardown && !strategy.teardown_safe() {
                continue;
            }
            let name = strategy.name();

            if let Err(e) = strategy.check(payload) {
                debug!(strategy = name, reason = %e, "Strategy skipped");
                continue;
            }

            match strategy.send(payload).await {
                Ok(()) => {
                    debug!(strategy = name, bytes = payload.byte_len(), "Payload delivered");
                    return Ok(name);
                }
                Err(e @ DeliveryError::Rejected { .. }) => {
                    warn!(strategy = name, reason = %e, "Strategy refused payload, falling through");
                }
                Err(e) => return Err(e),
            }
        }
        Err(DeliveryError::NoStrategy)
    }
}
