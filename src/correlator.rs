//! Completion Correlator — pairs call starts with completions
//!
//! Producers announce each outbound call with `on_call_start` and later its
//! outcome with `on_call_complete`. Completions re-arm a single debounce
//! timer; when it fires, every completed entry is turned into one record and
//! the lot goes to the queue in one `report_many` call. Calls still in flight
//! stay tracked for the next round. The timer does not wait for every call to
//! return: one call that never completes would otherwise hold back all the
//! others.

use crate::config::CorrelatorConfig;
use crate::network::NetworkMonitor;
use crate::queue::DeliveryQueue;
use crate::schedule::ScheduledTask;
use crate::transport::{classify_status, DeliveryError};
use crate::types::now_ms;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// How the producer issued the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Xhr,
    Fetch,
    Jsonp,
    Other,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Xhr => "xhr",
            CallKind::Fetch => "fetch",
            CallKind::Jsonp => "jsonp",
            CallKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Sent,
    Complete,
}

/// Identity of one tracked call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    target: String,
    start_ms: i64,
    seq: u64,
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.target, self.start_ms, self.seq)
    }
}

#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub method: String,
    pub target: String,
    pub kind: CallKind,
    pub page: Option<String>,
    pub start_ms: i64,
    pub state: RequestState,
    pub status: Option<u16>,
    pub duration_ms: Option<i64>,
    seq: u64,
}

impl TrackedRequest {
    fn outcome(&self) -> &'static str {
        match self.status.map(classify_status) {
            Some(Ok(())) => "success",
            Some(Err(DeliveryError::Network(_))) => "network",
            Some(Err(_)) => "remote",
            None => "pending",
        }
    }

    fn into_fields(self) -> Map<String, Value> {
        let outcome = self.outcome();
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::from("api"));
        fields.insert("method".to_string(), Value::from(self.method));
        fields.insert("url".to_string(), Value::from(self.target));
        fields.insert("kind".to_string(), Value::from(self.kind.as_str()));
        if let Some(page) = self.page {
            fields.insert("page_url".to_string(), Value::from(page));
        }
        fields.insert("send_time".to_string(), Value::from(self.start_ms));
        if let Some(status) = self.status {
            fields.insert("status".to_string(), Value::from(status));
        }
        if let Some(duration) = self.duration_ms {
            fields.insert("duration".to_string(), Value::from(duration));
        }
        fields.insert("outcome".to_string(), Value::from(outcome));
        fields
    }
}

#[derive(Default)]
struct CorrelatorState {
    tracked: HashMap<RequestKey, TrackedRequest>,
    page: Option<String>,
    debounce: ScheduledTask,
    next_seq: u64,
}

pub struct Correlator {
    state: Mutex<CorrelatorState>,
    ignore: Vec<Regex>,
    endpoint: String,
    debounce: Duration,
    max_tracked: usize,
    queue: Arc<DeliveryQueue>,
    monitor: Arc<NetworkMonitor>,
}

impl Correlator {
    /// Invalid ignore patterns are logged and skipped; config validation
    /// rejects them before this point in normal startup.
    pub fn new(
        config: &CorrelatorConfig,
        endpoint: &str,
        queue: Arc<DeliveryQueue>,
        monitor: Arc<NetworkMonitor>,
    ) -> Arc<Self> {
        let ignore = config
            .ignore_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Ignoring invalid correlator pattern");
                    None
                }
            })
            .collect();

        Arc::new(Self {
            state: Mutex::new(CorrelatorState::default()),
            ignore,
            endpoint: endpoint.to_string(),
            debounce: config.debounce(),
            max_tracked: config.max_tracked.max(1),
            queue,
            monitor,
        })
    }

    /// Page the following calls originate from. The query string is dropped.
    pub fn set_page(&self, url: &str) {
        self.lock().page = Some(strip_query(url).to_string());
    }

    fn is_ignored(&self, target: &str) -> bool {
        target.starts_with(&self.endpoint) || self.ignore.iter().any(|re| re.is_match(target))
    }

    /// Start tracking a call. Returns `None` for ignored targets.
    pub fn on_call_start(&self, method: &str, target: &str, kind: CallKind) -> Option<RequestKey> {
        if self.is_ignored(target) {
            return None;
        }

        let start_ms = now_ms();
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let key = RequestKey {
            target: target.to_string(),
            start_ms,
            seq,
        };
        let request = TrackedRequest {
            method: method.to_uppercase(),
            target: target.to_string(),
            kind,
            page: state.page.clone(),
            start_ms,
            state: RequestState::Sent,
            status: None,
            duration_ms: None,
            seq,
        };
        state.tracked.insert(key.clone(), request);

        if state.tracked.len() > self.max_tracked {
            evict_oldest(&mut state.tracked, self.max_tracked);
        }
        Some(key)
    }

    /// Record a call's completion. Unknown keys are ignored.
    ///
    /// Status 0 means the call failed below HTTP and triggers a reachability
    /// re-probe. Other statuses never touch the connectivity belief.
    pub fn on_call_complete(self: &Arc<Self>, key: &RequestKey, status: u16) {
        {
            let mut state = self.lock();
            let Some(request) = state.tracked.get_mut(key) else {
                debug!(key = %key, "Completion for unknown call");
                return;
            };
            request.state = RequestState::Complete;
            request.status = Some(status);
            request.duration_ms = Some((now_ms() - request.start_ms).max(0));

            let correlator = Arc::downgrade(self);
            state.debounce.arm(self.debounce, report_on_debounce(correlator));
        }

        if classify_status(status).is_err_and(|e| e.is_network()) {
            let monitor = self.monitor.clone();
            tokio::spawn(async move {
                monitor.reverify().await;
            });
        }
    }

    /// Report completed entries now and cancel the pending debounce.
    pub fn flush_now(&self) -> usize {
        self.lock().debounce.cancel();
        self.report_completed()
    }

    /// Calls currently tracked, completed or not.
    pub fn tracked(&self) -> usize {
        self.lock().tracked.len()
    }

    fn report_completed(&self) -> usize {
        let mut done: Vec<TrackedRequest> = {
            let mut state = self.lock();
            let keys: Vec<RequestKey> = state
                .tracked
                .iter()
                .filter(|(_, r)| r.state == RequestState::Complete)
                .map(|(k, _)| k.clone())
                .collect();
            let done: Vec<TrackedRequest> = keys.iter().filter_map(|k| state.tracked.remove(k)).collect();
            done
        };
        if done.is_empty() {
            return 0;
        }

        done.sort_by_key(|r| (r.start_ms, r.seq));
        let count = done.len();
        debug!(calls = count, "Reporting completed calls");
        self.queue
            .report_many(done.into_iter().map(TrackedRequest::into_fields).collect());
        count
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn report_on_debounce(correlator: Weak<Correlator>) {
    if let Some(correlator) = correlator.upgrade() {
        correlator.report_completed();
    }
}

fn evict_oldest(tracked: &mut HashMap<RequestKey, TrackedRequest>, keep: usize) {
    let mut keys: Vec<RequestKey> = tracked.keys().cloned().collect();
    keys.sort_by_key(|k| (k.start_ms, k.seq));
    let excess = keys.len().saturating_sub(keep);
    for key in keys.into_iter().take(excess) {
        tracked.remove(&key);
    }
    warn!(dropped = excess, limit = keep, "Too many tracked calls, dropped oldest");
}

fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
