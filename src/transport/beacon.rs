//! Beacon strategy — fire-and-forget durable enqueue
//!
//! A payload is handed to a bounded channel drained by a background worker
//! that POSTs it to the collector. A successful local enqueue counts as
//! delivery even though nothing confirms remote receipt; once the worker owns
//! the payload the pipeline forgets it. This is the one strategy that keeps
//! working while the host is tearing down, as the worker is drained on
//! shutdown.

use super::{DeliveryError, Strategy};
use crate::types::Payload;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NAME: &str = "beacon";

/// Create a connected strategy / worker pair.
pub fn channel(
    http: reqwest::Client,
    endpoint: &str,
    max_bytes: usize,
    capacity: usize,
) -> (BeaconStrategy, BeaconWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        BeaconStrategy { tx, max_bytes },
        BeaconWorker {
            rx,
            http,
            endpoint: endpoint.to_string(),
        },
    )
}

/// Enqueue side, lives in the transport chain.
pub struct BeaconStrategy {
    tx: mpsc::Sender<String>,
    max_bytes: usize,
}

#[async_trait]
impl Strategy for BeaconStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn teardown_safe(&self) -> bool {
        true
    }

    fn check(&self, payload: &Payload) -> Result<(), DeliveryError> {
        if payload.byte_len() > self.max_bytes {
            return Err(DeliveryError::rejected(
                NAME,
                format!("{} bytes exceeds ceiling of {}", payload.byte_len(), self.max_bytes),
            ));
        }
        Ok(())
    }

    async fn send(&self, payload: &Payload) -> Result<(), DeliveryError> {
        match self.tx.try_send(payload.body().to_string()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::rejected(NAME, "beacon queue full")),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::rejected(NAME, "beacon worker stopped")),
        }
    }
}

/// Drain side, POSTs enqueued beacons in order.
pub struct BeaconWorker {
    rx: mpsc::Receiver<String>,
    http: reqwest::Client,
    endpoint: String,
}

impl BeaconWorker {
    /// Run until `shutdown` fires, then drain whatever is still queued.
    ///
    /// Returns the number of beacons handed to the network.
    pub async fn run(mut self, shutdown: CancellationToken) -> usize {
        let mut sent = 0usize;
        loop {
            tokio::select! {
                biased;
                body = self.rx.recv() => match body {
                    Some(body) => {
                        self.post(body).await;
                        sent += 1;
                    }
                    None => break,
                },
                () = shutdown.cancelled() => break,
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Some(body) = self.rx.recv().await {
            self.post(body).await;
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "Beacon worker drained queue on shutdown");
        }
        sent + drained
    }

    async fn post(&self, body: String) {
        let bytes = body.len();
        let result = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(bytes, "Beacon delivered");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), bytes, "Beacon rejected by collector after enqueue");
            }
            Err(e) => {
                warn!(error = %e, bytes, "Beacon lost after enqueue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Batch, EventRecord};
    use serde_json::{json, Map, Value};
    use wiremock::matchers::{body_string, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload_of(text: &str) -> Payload {
        let mut fields = Map::new();
        fields.insert("msg".to_string(), Value::String(text.to_string()));
        Batch::single(EventRecord::at(fields, 0, false)).encode().unwrap()
    }

    #[test]
    fn test_ceiling_counts_bytes_not_chars() {
        let (strategy, _worker) = channel(reqwest::Client::new(), "http://127.0.0.1:1/c", 40, 4);
        // 12 CJK chars = 36 bytes, the JSON wrapper pushes it past 40.
        let wide = payload_of("上报上报上报上报上报上报");
        assert!(wide.body().chars().count() <= 40);
        assert!(strategy.check(&wide).is_err());

        let narrow = payload_of("ok");
        assert!(strategy.check(&narrow).is_ok());
    }

    #[tokio::test]
    async fn test_full_channel_is_rejected() {
        let (strategy, _worker) = channel(reqwest::Client::new(), "http://127.0.0.1:1/c", 1024, 1);
        assert!(strategy.send(&payload_of("a")).await.is_ok());
        assert!(matches!(
            strategy.send(&payload_of("b")).await,
            Err(DeliveryError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_drains_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string(json!({"msg": "bye", "ts": 0}).to_string()))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let endpoint = format!("{}/collect", server.uri());
        let (strategy, worker) = channel(reqwest::Client::new(), &endpoint, 1024, 8);
        strategy.send(&payload_of("bye")).await.unwrap();
        strategy.send(&payload_of("bye")).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(worker.run(token).await, 2);
    }
}
