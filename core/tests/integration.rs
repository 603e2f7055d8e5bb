//! End-to-end tests against the live mock backend.
//!
//! # Design
//! Each test starts the mock server on a random port and drives the client
//! through the production transports: `ureq` for HTTP and tokio-tungstenite
//! for the realtime channel. Host surfaces are the recording ones from
//! `swordedge_core::testing`, except where a real directory is needed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use swordedge_core::host::{DirectoryStorage, KeyValueStore};
use swordedge_core::realtime::{CALIBRATE_EVENT, FRAME_EVENT};
use swordedge_core::testing::TestHost;
use swordedge_core::{ApiClient, ApiError, ChannelState, ClientConfig, LoginRequest, RequestOptions};

async fn spawn_backend() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mock_server::run(listener));
    format!("http://{addr}")
}

fn client(base: &str, host: &TestHost) -> ApiClient {
    ApiClient::new(ClientConfig::new(base), host.host())
}

fn recorder() -> (Arc<Mutex<Vec<u8>>>, swordedge_core::ProgressCallback) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, Arc::new(move |p| sink.lock().push(p)))
}

#[tokio::test]
async fn session_lifecycle_and_unauthorized_recovery() {
    let base = spawn_backend().await;
    let host = TestHost::new();
    let c = client(&base, &host);

    let login = c.auth().login(&LoginRequest::new("lee", "pw")).await.unwrap();
    assert_eq!(host.store.get("token"), Some(json!(login.token)));
    assert_eq!(host.store.get("userInfo").unwrap()["username"], "lee");

    let profile = c.auth().user_info().await.unwrap();
    assert_eq!(profile["id"], 1001);

    // The server revokes the token, but the stored copy is replaced to make
    // the next call carry a stale credential.
    host.store.set("token", json!("stale"));
    let err = c.auth().user_info().await.unwrap_err();
    assert_eq!(err.status_code(), Some(401));
    assert!(host.store.get("token").is_none());
    assert!(host.store.get("userInfo").is_none());
    assert_eq!(host.navigator.routes(), vec!["/pages/login/login".to_string()]);
    assert_eq!(
        host.notifier.messages(),
        vec!["Not logged in or session expired".to_string()]
    );
    assert_eq!(host.host().loading.active(), 0);
}

#[tokio::test]
async fn envelope_failures_over_http() {
    let base = spawn_backend().await;
    let host = TestHost::new();
    let c = client(&base, &host);

    let err = c.training().delete("999", RequestOptions::default()).await.unwrap_err();
    assert!(matches!(err, ApiError::Application { status: None, .. }));
    assert_eq!(err.message(), "training record not found");

    let err = c.plans().detail("999").await.unwrap_err();
    assert_eq!(err.message(), "plan not found");
    assert_eq!(err.raw().unwrap()["code"], 404);

    let records = c
        .training()
        .list(&json!({"type": "foil"}), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(records["data"].as_array().unwrap().len(), 1);

    assert_eq!(host.overlay.shows(), 3);
    assert_eq!(host.overlay.hides(), 3);
}

#[tokio::test]
async fn upload_starts_analysis_with_progress() {
    let base = spawn_backend().await;
    let host = TestHost::new();
    let c = client(&base, &host);

    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("bout.mp4");
    std::fs::write(&video, vec![7u8; 200 * 1024]).unwrap();
    let (seen, progress) = recorder();

    let started = c
        .analysis()
        .start(&video, &[("athlete".to_string(), "lee".to_string())], Some(progress))
        .await
        .unwrap();
    assert_eq!(started["bytes"], 200 * 1024);
    assert_eq!(started["file_name"], "bout.mp4");

    let session_id = started["session_id"].as_str().unwrap();
    let status = c.analysis().status(session_id).await.unwrap();
    assert_eq!(status["status"], "completed");
    assert_eq!(status["fields"]["athlete"], "lee");

    let seen = seen.lock().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|p| *p <= 100));
    assert_eq!(host.host().loading.active(), 0);
}

#[tokio::test]
async fn upload_keeps_awkward_file_names_intact() {
    let base = spawn_backend().await;
    let host = TestHost::new();
    let c = client(&base, &host);
    let dir = tempfile::tempdir().unwrap();

    let quoted = dir.path().join("bout \"final\".mp4");
    std::fs::write(&quoted, b"0123456789").unwrap();
    let started = c.analysis().start(&quoted, &[], None).await.unwrap();
    assert_eq!(started["file_name"], "bout \"final\".mp4");
    assert_eq!(started["bytes"], 10);

    let broken = dir.path().join("bout\r\nContent-Type: text\r\n\r\nx.mp4");
    std::fs::write(&broken, b"0123456789").unwrap();
    let started = c.analysis().start(&broken, &[], None).await.unwrap();
    assert_eq!(started["file_name"], "bout%0D%0AContent-Type: text%0D%0A%0D%0Ax.mp4");
    assert_eq!(started["bytes"], 10);
}

#[tokio::test]
async fn analyze_frame_uses_frame_field() {
    let base = spawn_backend().await;
    let host = TestHost::new();
    let dir = tempfile::tempdir().unwrap();
    let frame = dir.path().join("frame.jpg");
    std::fs::write(&frame, [0xFF, 0xD8, 0xFF]).unwrap();

    let value = client(&base, &host).analysis().analyze_frame(&frame).await.unwrap();
    assert_eq!(value["bytes"], 3);
}

#[tokio::test]
async fn download_saves_report() {
    let base = spawn_backend().await;
    let host = TestHost::new();
    let dir = tempfile::tempdir().unwrap();
    let mut wired = host.host();
    wired.storage = Arc::new(DirectoryStorage::new(dir.path()));
    let c = ApiClient::new(ClientConfig::new(&base), wired);
    let (seen, progress) = recorder();

    let path = c
        .download_file("/reports/s1/skeleton_yolo.mp4", Some(progress))
        .await
        .unwrap();

    assert!(path.starts_with(dir.path()));
    assert_eq!(
        std::fs::read(&path).unwrap(),
        mock_server::report_bytes("s1/skeleton_yolo.mp4")
    );
    assert_eq!(seen.lock().last().copied(), Some(100));
    assert_eq!(host.notifier.messages(), vec!["Download complete".to_string()]);
    assert_eq!(host.overlay.hides(), 1);
}

#[tokio::test]
async fn download_of_missing_resource_fails() {
    let base = spawn_backend().await;
    let host = TestHost::new();
    let err = client(&base, &host)
        .download_file("/missing/report.mp4", None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(404));
    assert_eq!(err.message(), "Download failed");
    assert!(host.files.saved().is_empty());
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let host = TestHost::new();
    let err = client(&format!("http://{addr}"), &host)
        .get("/api/settings", &Value::Null, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert_eq!(err.message(), "Network request failed");
    assert_eq!(host.host().loading.active(), 0);
}

#[tokio::test]
async fn realtime_channel_round_trip() {
    let base = spawn_backend().await;
    let host = TestHost::new();
    let c = client(&base, &host);
    c.auth().login(&LoginRequest::new("lee", "pw")).await.unwrap();

    let channel = c.realtime();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    channel.on_message(move |message| {
        let _ = tx.send(message.clone());
    });

    channel.connect().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.event, FRAME_EVENT);
    assert_eq!(first.data["authenticated"], true);

    assert!(channel.send(json!({"zero": true})));
    let ack = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.event, format!("{CALIBRATE_EVENT}_ack"));
    assert_eq!(ack.data["echo"], json!({"zero": true}));

    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!channel.send(json!({})));
}

#[tokio::test]
async fn realtime_handshake_uses_the_token_stored_at_connect_time() {
    let base = spawn_backend().await;
    let host = TestHost::new();
    let c = client(&base, &host);

    let channel = c.realtime();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    channel.on_message(move |message| {
        let _ = tx.send(message.clone());
    });
    c.auth().login(&LoginRequest::new("lee", "pw")).await.unwrap();

    channel.connect().await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.event, FRAME_EVENT);
    assert_eq!(first.data["authenticated"], true);
    channel.close();
}
