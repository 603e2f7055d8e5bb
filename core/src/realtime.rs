//! Realtime channel to the training backend.
//!
//! # Design
//! A `ChannelSession` is a cheap handle over shared state. Each successful
//! open spawns one connection task that owns the sink and the stream and
//! multiplexes inbound frames with outbound commands. When that task sees
//! the connection end without a `close()`, it marks the session
//! Disconnected and schedules a reconnection. A failed `connect()` starts
//! the same schedule.
//!
//! Reconnection runs on a single-shot timer task. Its abort handle lives in
//! the session, so `close()` cancels it and no attempt can fire afterwards.
//! Every open bumps a generation number; a connection task from an older
//! generation never touches the session state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::client::{stored_token, ApiClient};
use crate::config::{DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY_MS};
use crate::http::TransportFailure;

/// Outbound control messages.
pub const CALIBRATE_EVENT: &str = "calibrate";
/// Server-pushed telemetry.
pub const FRAME_EVENT: &str = "frame";
/// Event name given to inbound text that is not an event envelope.
pub const RAW_MESSAGE_EVENT: &str = "message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// One event on the channel. On the wire: `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ChannelMessage {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) if map.get("event").is_some_and(Value::is_string) => {
                let event = map.get("event").and_then(Value::as_str).unwrap_or(RAW_MESSAGE_EVENT);
                Self::new(event, map.get("data").cloned().unwrap_or(Value::Null))
            }
            Ok(other) => Self::new(RAW_MESSAGE_EVENT, other),
            Err(_) => Self::new(RAW_MESSAGE_EVENT, Value::String(text.to_string())),
        }
    }

    pub fn to_text(&self) -> String {
        json!({ "event": self.event, "data": self.data }).to_string()
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("realtime channel failed to open: {0}")]
    Open(#[from] TransportFailure),
    #[error("realtime channel was closed")]
    Closed,
}

/// Opens connections to a realtime endpoint.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn RealtimeSink>, Box<dyn RealtimeStream>), TransportFailure>;
}

#[async_trait]
pub trait RealtimeSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportFailure>;
    async fn close(&mut self);
}

#[async_trait]
pub trait RealtimeStream: Send {
    /// Next text frame, or `None` once the peer has gone away.
    async fn next_text(&mut self) -> Option<Result<String, TransportFailure>>;
}

pub type MessageHandler = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

enum Command {
    Send(String),
    Close,
}

struct Inner {
    state: ChannelState,
    attempts: u32,
    manual_close: bool,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Command>>,
    timer: Option<AbortHandle>,
}

struct Shared {
    endpoint: String,
    transport: Arc<dyn RealtimeTransport>,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    inner: Mutex<Inner>,
    handlers: Mutex<Vec<MessageHandler>>,
}

impl Shared {
    fn dispatch(&self, message: &ChannelMessage) {
        let handlers = self.handlers.lock().clone();
        for (index, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                warn!(index, event = %message.event, "realtime handler panicked");
            }
        }
    }
}

/// Handle to one realtime session. Clones share the session.
///
/// A live connection keeps the session alive; call `close()` to end it.
#[derive(Clone)]
pub struct ChannelSession {
    shared: Arc<Shared>,
}

impl ChannelSession {
    pub fn new(endpoint: impl Into<String>, transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint: endpoint.into(),
                transport,
                reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
                max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
                inner: Mutex::new(Inner {
                    state: ChannelState::Disconnected,
                    attempts: 0,
                    manual_close: false,
                    generation: 0,
                    outbound: None,
                    timer: None,
                }),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Must be called before the session is cloned or connected.
    pub fn with_reconnect_policy(mut self, delay: Duration, max_attempts: u32) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.reconnect_delay = delay;
            shared.max_reconnect_attempts = max_attempts;
        }
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn state(&self) -> ChannelState {
        self.shared.inner.lock().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.inner.lock().attempts
    }

    /// Register a handler. Handlers run in registration order.
    pub fn on_message(&self, handler: impl Fn(&ChannelMessage) + Send + Sync + 'static) {
        self.shared.handlers.lock().push(Arc::new(handler));
    }

    /// Open the channel and resolve once it is connected.
    ///
    /// Resets the reconnection budget. A failed open is returned to the
    /// caller and also starts the reconnection schedule.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == ChannelState::Connected {
                return Ok(());
            }
            inner.manual_close = false;
            inner.attempts = 0;
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
        }
        info!(endpoint = %self.shared.endpoint, "connecting realtime channel");
        open(&self.shared).await.inspect_err(|err| {
            warn!(endpoint = %self.shared.endpoint, error = %err, "realtime connect failed");
            if matches!(err, ChannelError::Open(_)) {
                schedule_reconnect(&self.shared);
            }
        })
    }

    /// Schedule one reconnection attempt after the configured delay.
    ///
    /// Returns false when the session was closed or the attempts are used up.
    pub fn reconnect(&self) -> bool {
        schedule_reconnect(&self.shared)
    }

    /// Send a `calibrate` event.
    pub fn send(&self, data: Value) -> bool {
        self.emit(CALIBRATE_EVENT, data)
    }

    /// Send a named event. Dropped with a warning unless connected.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        let inner = self.shared.inner.lock();
        let outbound = match (&inner.outbound, inner.state) {
            (Some(outbound), ChannelState::Connected) => outbound,
            (_, state) => {
                warn!(event, ?state, "realtime channel not connected, dropping message");
                return false;
            }
        };
        outbound
            .send(Command::Send(ChannelMessage::new(event, data).to_text()))
            .is_ok()
    }

    /// Close the channel and cancel any pending reconnection.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock();
        inner.manual_close = true;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if let Some(outbound) = inner.outbound.take() {
            let _ = outbound.send(Command::Close);
        }
        if inner.state != ChannelState::Closed {
            info!(endpoint = %self.shared.endpoint, "realtime channel closed");
        }
        inner.state = ChannelState::Closed;
    }
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ChannelSession")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &inner.state)
            .field("attempts", &inner.attempts)
            .finish_non_exhaustive()
    }
}

async fn open(shared: &Arc<Shared>) -> Result<(), ChannelError> {
    let generation = {
        let mut inner = shared.inner.lock();
        if inner.manual_close {
            return Err(ChannelError::Closed);
        }
        inner.state = ChannelState::Connecting;
        inner.generation += 1;
        inner.generation
    };

    let (mut sink, stream) = match shared.transport.open(&shared.endpoint).await {
        Ok(halves) => halves,
        Err(failure) => {
            let mut inner = shared.inner.lock();
            if inner.generation == generation && !inner.manual_close {
                inner.state = ChannelState::Disconnected;
            }
            return Err(failure.into());
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let superseded = {
        let mut inner = shared.inner.lock();
        if inner.manual_close || inner.generation != generation {
            true
        } else {
            inner.state = ChannelState::Connected;
            inner.attempts = 0;
            inner.outbound = Some(tx);
            false
        }
    };
    if superseded {
        sink.close().await;
        return Err(ChannelError::Closed);
    }

    info!(endpoint = %shared.endpoint, "realtime channel connected");
    tokio::spawn(pump(Arc::clone(shared), generation, sink, stream, rx));
    Ok(())
}

async fn pump(
    shared: Arc<Shared>,
    generation: u64,
    mut sink: Box<dyn RealtimeSink>,
    mut stream: Box<dyn RealtimeStream>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        tokio::select! {
            inbound = stream.next_text() => match inbound {
                Some(Ok(text)) => shared.dispatch(&ChannelMessage::parse(&text)),
                Some(Err(failure)) => {
                    warn!(%failure, "realtime channel error");
                    break;
                }
                None => {
                    debug!("realtime peer closed the connection");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if let Err(failure) = sink.send_text(text).await {
                        warn!(%failure, "realtime send failed");
                        break;
                    }
                }
                Some(Command::Close) | None => break,
            },
        }
    }
    sink.close().await;

    let lost = {
        let mut inner = shared.inner.lock();
        if inner.generation != generation || inner.manual_close {
            false
        } else {
            inner.state = ChannelState::Disconnected;
            inner.outbound = None;
            true
        }
    };
    if lost {
        info!(endpoint = %shared.endpoint, "realtime channel lost");
        schedule_reconnect(&shared);
    }
}

fn schedule_reconnect(shared: &Arc<Shared>) -> bool {
    let mut inner = shared.inner.lock();
    if inner.manual_close {
        return false;
    }
    if inner.attempts >= shared.max_reconnect_attempts {
        warn!(attempts = inner.attempts, "realtime reconnect attempts exhausted");
        return false;
    }
    inner.attempts += 1;
    let attempt = inner.attempts;
    if let Some(previous) = inner.timer.take() {
        previous.abort();
    }

    let delay = shared.reconnect_delay;
    let task_shared = Arc::clone(shared);
    let timer = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        info!(attempt, "reconnecting realtime channel");
        if let Err(err) = open(&task_shared).await {
            warn!(attempt, error = %err, "realtime reconnect attempt failed");
            schedule_reconnect(&task_shared);
        }
    });
    inner.timer = Some(timer.abort_handle());
    true
}

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Yields the bearer token for the next handshake, if any.
pub type TokenSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// WebSocket transport over tokio-tungstenite.
#[derive(Clone, Default)]
pub struct WsTransport {
    token: Option<TokenSource>,
}

impl WsTransport {
    /// Transport that authenticates every handshake with a fixed `token`.
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.map(|token| Arc::new(move || Some(token.clone())) as TokenSource),
        }
    }

    /// Transport that asks `source` for the token on every handshake, so
    /// reconnects pick up a token stored after the session was built.
    pub fn with_token_source(source: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            token: Some(Arc::new(source)),
        }
    }

    fn bearer(&self) -> Option<String> {
        self.token.as_ref().and_then(|source| source())
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn RealtimeSink>, Box<dyn RealtimeStream>), TransportFailure> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| TransportFailure::new(e.to_string()))?;
        if let Some(token) = self.bearer() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportFailure::new(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (connection, _) = connect_async(request)
            .await
            .map_err(|e| TransportFailure::new(e.to_string()))?;
        let (sink, stream) = connection.split();
        Ok((Box::new(WsSink(sink)), Box::new(WsStream(stream))))
    }
}

struct WsSink(SplitSink<WsConnection, Message>);

#[async_trait]
impl RealtimeSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportFailure> {
        self.0
            .send(Message::text(text))
            .await
            .map_err(|e| TransportFailure::new(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = SinkExt::close(&mut self.0).await;
    }
}

struct WsStream(SplitStream<WsConnection>);

#[async_trait]
impl RealtimeStream for WsStream {
    async fn next_text(&mut self) -> Option<Result<String, TransportFailure>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportFailure::new(e.to_string()))),
            }
        }
    }
}

impl ApiClient {
    /// Realtime session for the configured endpoint. Each handshake carries
    /// whatever token is stored at that moment.
    pub fn realtime(&self) -> ChannelSession {
        ChannelSession::new(self.config().realtime_endpoint(), Arc::new(self.realtime_transport()))
            .with_reconnect_policy(self.config().reconnect_delay(), self.config().max_reconnect_attempts)
    }

    fn realtime_transport(&self) -> WsTransport {
        let store = Arc::clone(&self.host().store);
        let key = self.config().token_key.clone();
        WsTransport::with_token_source(move || stored_token(store.as_ref(), &key))
    }
}
