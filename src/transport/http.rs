//! POST strategies — keep-alive async POST and the blocking fallback
//!
//! Both send the JSON text as `text/plain` and share one contract: a 2xx
//! status is success, any other status is a remote failure, and an error
//! raised before a response arrives is a network failure.

use super::{classify_status, DeliveryError, Strategy};
use crate::types::Payload;
use async_trait::async_trait;
use tokio::sync::oneshot;

/// General-case async POST over the shared connection pool.
pub struct KeepAliveStrategy {
    http: reqwest::Client,
    endpoint: String,
}

impl KeepAliveStrategy {
    pub fn new(http: reqwest::Client, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl Strategy for KeepAliveStrategy {
    fn name(&self) -> &'static str {
        "keepalive"
    }

    async fn send(&self, payload: &Payload) -> Result<(), DeliveryError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .header(reqwest::header::CONNECTION, "keep-alive")
            .body(payload.body().to_string())
            .send()
            .await?;
        classify_status(resp.status().as_u16())
    }
}

/// Last-resort blocking POST.
///
/// The request runs to completion on its own OS thread with a blocking
/// client, so it never needs the async scheduler to make progress.
pub struct SyncPostStrategy {
    endpoint: String,
}

impl SyncPostStrategy {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
        }
    }
}

fn blocking_post(endpoint: &str, body: String) -> Result<(), DeliveryError> {
    let client = reqwest::blocking::Client::new();
    let resp = client
        .post(endpoint)
        .header(reqwest::header::CONTENT_TYPE, "text/plain")
        .body(body)
        .send()?;
    classify_status(resp.status().as_u16())
}

#[async_trait]
impl Strategy for SyncPostStrategy {
    fn name(&self) -> &'static str {
        "sync_post"
    }

    fn teardown_safe(&self) -> bool {
        true
    }

    async fn send(&self, payload: &Payload) -> Result<(), DeliveryError> {
        let (tx, rx) = oneshot::channel();
        let endpoint = self.endpoint.clone();
        let body = payload.body().to_string();
        std::thread::Builder::new()
            .name("relay-sync-post".to_string())
            .spawn(move || {
                let _ = tx.send(blocking_post(&endpoint, body));
            })
            .map_err(|e| DeliveryError::rejected("sync_post", format!("cannot spawn thread: {e}")))?;

        rx.await
            .unwrap_or_else(|_| Err(DeliveryError::Network("sync post thread died".to_string())))
    }
}
