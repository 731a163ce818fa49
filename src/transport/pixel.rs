//! Pixel strategy — single record as GET query parameters
//!
//! Each top-level field becomes one query parameter (strings verbatim, other
//! values as their JSON text) and `_ts` carries the send time. Only usable
//! for non-batched payloads whose full URL stays under the length ceiling.

use super::{classify_status, DeliveryError, Strategy};
use crate::config::defaults::PIXEL_TS_PARAM;
use crate::types::{now_ms, EventRecord, Payload};
use async_trait::async_trait;
use serde_json::Value;

const NAME: &str = "pixel";

pub struct PixelStrategy {
    http: reqwest::Client,
    endpoint: String,
    max_url_length: usize,
}

impl PixelStrategy {
    pub fn new(http: reqwest::Client, endpoint: &str, max_url_length: usize) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            max_url_length,
        }
    }

    /// Build the request URL for `record` stamped with `sent_at`.
    fn build_url(&self, record: &EventRecord, sent_at: i64) -> Result<String, DeliveryError> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| DeliveryError::rejected(NAME, format!("bad endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in record.fields() {
                query.append_pair(key, &param_value(value));
            }
            query.append_pair("ts", &record.ts().to_string());
            query.append_pair(PIXEL_TS_PARAM, &sent_at.to_string());
        }
        let url = url.to_string();
        if url.len() >= self.max_url_length {
            return Err(DeliveryError::rejected(
                NAME,
                format!("url length {} reaches ceiling of {}", url.len(), self.max_url_length),
            ));
        }
        Ok(url)
    }

    fn url_for(&self, payload: &Payload) -> Result<String, DeliveryError> {
        let record = payload
            .single()
            .ok_or_else(|| DeliveryError::rejected(NAME, "batched payload"))?;
        self.build_url(record, now_ms())
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Strategy for PixelStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn check(&self, payload: &Payload) -> Result<(), DeliveryError> {
        self.url_for(payload).map(|_| ())
    }

    async fn send(&self, payload: &Payload) -> Result<(), DeliveryError> {
        let url = self.url_for(payload)?;
        let resp = self.http.get(url).send().await?;
        classify_status(resp.status().as_u16())
    }
}
