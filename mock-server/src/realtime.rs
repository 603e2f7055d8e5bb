//! `/ws` telemetry socket.
//!
//! Pushes one `frame` event as soon as a client connects and answers every
//! `calibrate` event with `calibrate_ack`. Other events are logged and
//! ignored.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::Response,
};
use serde_json::{json, Value};
use tracing::{debug, info};

pub(crate) async fn upgrade(ws: WebSocketUpgrade, headers: HeaderMap) -> Response {
    let authenticated = headers.contains_key(header::AUTHORIZATION);
    ws.on_upgrade(move |socket| session(socket, authenticated))
}

fn event(name: &str, data: Value) -> Message {
    Message::Text(json!({ "event": name, "data": data }).to_string().into())
}

async fn session(mut socket: WebSocket, authenticated: bool) {
    info!(authenticated, "realtime client connected");
    let frame = json!({
        "timestamp": 0,
        "keypoints": [[0.41, 0.22], [0.47, 0.38], [0.52, 0.61]],
        "authenticated": authenticated,
    });
    if socket.send(event("frame", frame)).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        let inbound: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        match inbound["event"].as_str() {
            Some("calibrate") => {
                let ack = json!({ "status": "ok", "echo": inbound["data"] });
                if socket.send(event("calibrate_ack", ack)).await.is_err() {
                    break;
                }
            }
            other => debug!(event = ?other, "ignoring realtime message"),
        }
    }
    info!("realtime client disconnected");
}
