use std::path::Path;

use serde_json::{json, Value};

use trail_core::config::GatewayConfig;
use trail_core::wire::{IngestResponse, IngestStatus};
use trail_gateway::{start, GatewayHandle, GatewayOptions, SpoolEntry};

async fn gateway(root: &Path, max_batch: usize) -> GatewayHandle {
    let options = GatewayOptions {
        host: "127.0.0.1".into(),
        port: 0,
        max_batch,
        ..GatewayOptions::from_config(&GatewayConfig::default(), root.to_path_buf())
    };
    start(options).await.unwrap()
}

fn record(session: &str, seq: u64) -> Value {
    json!({
        "session_id": session,
        "seq": seq,
        "ts": "2024-05-01T10:00:00.000Z",
        "dir": "out",
        "len": 3,
        "hash": "0f".repeat(32),
    })
}

async fn post(handle: &GatewayHandle, body: Value) -> (u16, IngestResponse) {
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/ingest", handle.port))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

fn spooled(root: &Path) -> Vec<SpoolEntry> {
    let dir = root.join("gateway");
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let text = std::fs::read_to_string(entry.unwrap().path()).unwrap();
        out.extend(text.lines().map(|l| serde_json::from_str::<SpoolEntry>(l).unwrap()));
    }
    out
}

#[tokio::test]
async fn health_reports_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let handle = gateway(dir.path(), 10).await;
    assert!(handle.port > 0);

    let resp = reqwest::get(format!("http://127.0.0.1:{}/health", handle.port)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn accepted_batch_is_spooled_with_keys() {
    let dir = tempfile::tempdir().unwrap();
    let handle = gateway(dir.path(), 10).await;

    let (status, body) = post(
        &handle,
        json!({"source": "trail", "generated_at": "2024-05-01T10:00:01.000Z", "records": [record("sess_a", 0), record("sess_a", 1)]}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body.status, IngestStatus::Ok);
    assert_eq!(body.accepted, 2);
    assert_eq!(body.keys, vec!["sess_a:0", "sess_a:1"]);

    let stored = spooled(dir.path());
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].key, "sess_a:0");
    assert_eq!(stored[0].batch_id, body.batch_id);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn mixed_batch_is_partial() {
    let dir = tempfile::tempdir().unwrap();
    let handle = gateway(dir.path(), 10).await;

    let mut bad = record("sess_a", 1);
    bad["hash"] = json!("zz");
    let (status, body) = post(&handle, json!({"records": [record("sess_a", 0), bad]})).await;
    assert_eq!(status, 207);
    assert_eq!(body.status, IngestStatus::Partial);
    assert_eq!(body.accepted, 1);
    assert_eq!(body.rejected.len(), 1);
    assert_eq!(body.rejected[0].index, 1);
    assert_eq!(body.rejected[0].key.as_deref(), Some("sess_a:1"));
    assert_eq!(spooled(dir.path()).len(), 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn nothing_valid_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let handle = gateway(dir.path(), 10).await;

    let (status, body) = post(&handle, json!({"records": [record("", 0)]})).await;
    assert_eq!(status, 400);
    assert_eq!(body.status, IngestStatus::Rejected);
    assert!(!dir.path().join("gateway").exists());

    let (status, body) = post(&handle, json!({"events": "not a batch"})).await;
    assert_eq!(status, 400);
    assert!(body.rejected[0].reason.contains("malformed"));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_batch_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let handle = gateway(dir.path(), 1).await;
    let (status, body) = post(&handle, json!({"records": [record("sess_a", 0), record("sess_a", 1)]})).await;
    assert_eq!(status, 413);
    assert_eq!(body.accepted, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn redelivery_is_stored_again_under_the_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let handle = gateway(dir.path(), 10).await;
    let batch = json!({"records": [record("sess_b", 4)]});
    let (_, first) = post(&handle, batch.clone()).await;
    let (_, second) = post(&handle, batch).await;
    assert_eq!(first.keys, second.keys);
    assert_ne!(first.batch_id, second.batch_id);
    assert_eq!(spooled(dir.path()).len(), 2);
    handle.shutdown().await.unwrap();
}
