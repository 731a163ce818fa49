//! Delivery Integration Tests
//!
//! Run the full pipeline against a wiremock collector with the standard
//! transport chain built from configuration: real HTTP, real sled store.

use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use telemetry_relay::config::defaults::RETRY_STORE_KEY;
use telemetry_relay::{HostSignal, Pipeline, PipelineBuilder, RelayConfig, RetryBackend, SledBackend};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Config pointing at `server` with only the named strategies enabled.
fn config_for(endpoint: &str, store: &Path, strategies: &[&str]) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.endpoint = endpoint.to_string();
    config.retry.store_path = store.to_path_buf();
    config.retry.replay_on_start = false;
    config.retry.pause_ms = 0;
    config.transport.beacon = strategies.contains(&"beacon");
    config.transport.pixel = strategies.contains(&"pixel");
    config.transport.keepalive = strategies.contains(&"keepalive");
    config.transport.sync_post = strategies.contains(&"sync_post");
    config
}

async fn collector(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path("/collect"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

async fn requests_to(server: &MockServer, verb: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == verb)
        .collect()
}

fn body_json(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap()
}

async fn wait_until(pipeline: &Pipeline, mut done: impl FnMut(&Pipeline) -> bool) {
    for _ in 0..100 {
        if done(pipeline) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn batch_goes_out_as_json_array_over_keepalive() {
    let server = collector(200).await;
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(&format!("{}/collect", server.uri()), &tmp.path().join("retry"), &["keepalive"]);
    let pipeline = PipelineBuilder::new(config).start().unwrap();

    for n in 0..3 {
        pipeline.report(fields(json!({"event": "click", "n": n})), false);
    }
    assert_eq!(pipeline.flush(), 3);
    let stats = pipeline.shutdown().await;

    let posts = requests_to(&server, "POST").await;
    assert_eq!(posts.len(), 1);
    assert_eq!(
        posts[0].headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/plain")
    );
    let body = body_json(&posts[0]);
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2]["n"], 2);
    assert!(records.iter().all(|r| r["ts"].is_i64()));

    assert_eq!(stats.enqueued, 3);
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.persisted, 0);
}

#[tokio::test]
async fn small_immediate_record_uses_pixel_get() {
    let server = collector(204).await;
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(
        &format!("{}/collect", server.uri()),
        &tmp.path().join("retry"),
        &["pixel", "keepalive"],
    );
    let pipeline = PipelineBuilder::new(config).start().unwrap();

    pipeline.report(fields(json!({"event": "error", "msg": "boom"})), true);
    pipeline.shutdown().await;

    let gets = requests_to(&server, "GET").await;
    assert_eq!(gets.len(), 1);
    assert!(requests_to(&server, "POST").await.is_empty());

    let query: std::collections::HashMap<String, String> =
        gets[0].url.query_pairs().into_owned().collect();
    assert_eq!(query.get("event").map(String::as_str), Some("error"));
    assert_eq!(query.get("msg").map(String::as_str), Some("boom"));
    assert!(query.contains_key("ts"));
    assert!(query.contains_key("_ts"));
}

#[tokio::test]
async fn oversized_single_falls_back_to_post_object() {
    let server = collector(200).await;
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(
        &format!("{}/collect", server.uri()),
        &tmp.path().join("retry"),
        &["pixel", "keepalive"],
    );
    let pipeline = PipelineBuilder::new(config).start().unwrap();

    let stack = "x".repeat(3000);
    pipeline.report(fields(json!({"event": "error", "stack": stack})), true);
    pipeline.shutdown().await;

    assert!(requests_to(&server, "GET").await.is_empty());
    let posts = requests_to(&server, "POST").await;
    assert_eq!(posts.len(), 1);
    let body = body_json(&posts[0]);
    assert!(body.is_object(), "single record goes out as an object");
    assert_eq!(body["urgent"], true);
}

#[tokio::test]
async fn teardown_hands_queue_to_beacon_and_drains_on_shutdown() {
    let server = collector(200).await;
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(
        &format!("{}/collect", server.uri()),
        &tmp.path().join("retry"),
        &["beacon", "pixel", "keepalive", "sync_post"],
    );
    let pipeline = PipelineBuilder::new(config).start().unwrap();

    pipeline.report(fields(json!({"event": "pv"})), false);
    pipeline.report(fields(json!({"event": "leave"})), false);
    pipeline.handle_signal(HostSignal::PageHide).await;
    assert_eq!(pipeline.queued(), 0);
    let stats = pipeline.shutdown().await;

    let posts = requests_to(&server, "POST").await;
    assert_eq!(posts.len(), 1);
    assert_eq!(body_json(&posts[0]).as_array().map(Vec::len), Some(2));
    assert_eq!(stats.delivered, 2);
}

#[tokio::test]
async fn sync_post_is_last_resort() {
    let server = collector(200).await;
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(&format!("{}/collect", server.uri()), &tmp.path().join("retry"), &["sync_post"]);
    let pipeline = PipelineBuilder::new(config).start().unwrap();

    pipeline.report(fields(json!({"event": "a"})), false);
    pipeline.report(fields(json!({"event": "b"})), false);
    // Teardown flush works too: the blocking POST is teardown-safe.
    pipeline.handle_signal(HostSignal::Hidden).await;
    let stats = pipeline.shutdown().await;

    assert_eq!(requests_to(&server, "POST").await.len(), 1);
    assert_eq!(stats.delivered, 2);
}

#[tokio::test]
async fn remote_failure_persists_and_replays_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let store_path = tmp.path().join("retry");

    // First run: collector answers 503, every record lands in the store.
    let failing = collector(503).await;
    let config = config_for(&format!("{}/collect", failing.uri()), &store_path, &["keepalive"]);
    let pipeline = PipelineBuilder::new(config).start().unwrap();
    for n in 0..7 {
        pipeline.report(fields(json!({"n": n})), false);
    }
    pipeline.flush();
    let stats = pipeline.shutdown().await;
    assert_eq!(stats.persisted, 7);
    assert_eq!(stats.delivered, 0);
    assert_store_holds(&store_path, 7);

    // Second run: collector healthy, startup replay drains the store in slices.
    let healthy = collector(200).await;
    let mut config = config_for(&format!("{}/collect", healthy.uri()), &store_path, &["keepalive"]);
    config.retry.replay_on_start = true;
    let pipeline = PipelineBuilder::new(config).start().unwrap();
    wait_until(&pipeline, |p| p.pending().unwrap_or(usize::MAX) == 0).await;
    let stats = pipeline.shutdown().await;
    assert_eq!(stats.replayed, 7);

    let posts = requests_to(&healthy, "POST").await;
    let sizes: Vec<usize> = posts
        .iter()
        .map(|r| body_json(r).as_array().map(Vec::len).unwrap_or(0))
        .collect();
    assert_eq!(sizes, vec![5, 2]);

    let first: Vec<i64> = body_json(&posts[0])
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["n"].as_i64().unwrap())
        .collect();
    assert_eq!(first, vec![0, 1, 2, 3, 4], "oldest records replay first");

    assert_store_holds(&store_path, 0);
}

/// Open the store directly between runs and check how many entries it holds.
fn assert_store_holds(store_path: &Path, expected: usize) {
    let backend = SledBackend::open(store_path, RETRY_STORE_KEY).unwrap();
    let entries = tokio_test::assert_ok!(backend.load());
    assert_eq!(entries.len(), expected);
}

#[tokio::test]
async fn connection_failure_marks_offline_until_probe_succeeds() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(
        &format!("http://127.0.0.1:{port}/collect"),
        &tmp.path().join("retry"),
        &["keepalive"],
    );
    let pipeline = PipelineBuilder::new(config).start().unwrap();

    pipeline.report(fields(json!({"event": "lost"})), true);
    wait_until(&pipeline, |p| !p.is_online()).await;
    assert_eq!(pipeline.pending().unwrap(), 1);

    // Host claims connectivity is back, but the probe still cannot connect.
    pipeline.handle_signal(HostSignal::Online).await;
    assert!(!pipeline.is_online());

    // Offline reports skip the network entirely.
    pipeline.report(fields(json!({"event": "while offline"})), true);
    wait_until(&pipeline, |p| p.pending().unwrap_or(0) == 2).await;

    let stats = pipeline.shutdown().await;
    assert_eq!(stats.enqueued, stats.delivered + stats.persisted);
}

#[tokio::test]
async fn verified_online_signal_replays_store() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/favicon.ico"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/collect"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let mut config = config_for(&format!("{}/collect", server.uri()), &tmp.path().join("retry"), &["keepalive"]);
    config.network.assume_online = false;
    let pipeline = PipelineBuilder::new(config).start().unwrap();

    pipeline.report(fields(json!({"event": "queued offline"})), false);
    pipeline.flush();
    wait_until(&pipeline, |p| p.pending().unwrap_or(0) == 1).await;
    assert!(requests_to(&server, "POST").await.is_empty());

    pipeline.handle_signal(HostSignal::Online).await;
    assert!(pipeline.is_online(), "any probe response counts as reachable");
    wait_until(&pipeline, |p| p.pending().unwrap_or(usize::MAX) == 0).await;

    let stats = pipeline.shutdown().await;
    assert_eq!(stats.replayed, 1);
    assert_eq!(requests_to(&server, "HEAD").await.len(), 1);
}
