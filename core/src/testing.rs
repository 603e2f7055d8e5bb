//! Deterministic stand-ins for the network and the host.
//!
//! Used by this crate's tests. Downstream crates that want to exercise page
//! logic without a backend enable the `testing` feature.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::host::{FileStorage, Host, MemoryStore, Navigator, Notifier, Toast};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, ProgressFn, TransportFailure};
use crate::loading::{LoadingCoordinator, LoadingOverlay, OverlayError};
use crate::realtime::{RealtimeSink, RealtimeStream, RealtimeTransport};

/// What a `ScriptedTransport` does with the next request.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond(HttpResponse),
    /// Fail with this reason before any response arrives.
    Fail(String),
    /// Never answer.
    Stall,
}

impl ScriptedReply {
    pub fn json(status: u16, body: Value) -> Self {
        if body.is_null() {
            ScriptedReply::Respond(HttpResponse::new(status, Vec::new()))
        } else {
            ScriptedReply::Respond(HttpResponse::json(status, &body))
        }
    }
}

/// Replays queued replies in order and records every request.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(
        &self,
        request: HttpRequest,
        progress: Option<ProgressFn>,
    ) -> Result<HttpResponse, TransportFailure> {
        let sent = request.body.as_ref().map(|body| body.len() as u64);
        self.requests.lock().push(request);
        let reply = self.replies.lock().pop_front();

        match reply {
            Some(ScriptedReply::Respond(response)) => {
                if let Some(progress) = progress {
                    let total = sent.unwrap_or(response.body.len() as u64);
                    progress(total / 2, Some(total));
                    progress(total, Some(total));
                }
                Ok(response)
            }
            Some(ScriptedReply::Fail(reason)) => Err(TransportFailure::new(reason)),
            Some(ScriptedReply::Stall) => std::future::pending().await,
            None => Err(TransportFailure::new("no scripted reply")),
        }
    }
}

/// Counts overlay transitions.
#[derive(Debug, Default)]
pub struct CountingOverlay {
    shows: AtomicUsize,
    hides: AtomicUsize,
    fail: bool,
}

impl CountingOverlay {
    /// Overlay whose show and hide always fail, after counting the call.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn shows(&self) -> usize {
        self.shows.load(Ordering::SeqCst)
    }

    pub fn hides(&self) -> usize {
        self.hides.load(Ordering::SeqCst)
    }

    fn outcome(&self) -> Result<(), OverlayError> {
        if self.fail {
            Err(OverlayError("overlay detached".to_string()))
        } else {
            Ok(())
        }
    }
}

impl LoadingOverlay for CountingOverlay {
    fn show(&self, _title: &str) -> Result<(), OverlayError> {
        self.shows.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }

    fn hide(&self) -> Result<(), OverlayError> {
        self.hides.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    toasts: Mutex<Vec<Toast>>,
}

impl RecordingNotifier {
    pub fn toasts(&self) -> Vec<Toast> {
        self.toasts.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.toasts.lock().iter().map(|t| t.message.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn toast(&self, toast: Toast) {
        self.toasts.lock().push(toast);
    }
}

#[derive(Debug, Default)]
pub struct RecordingNavigator {
    routes: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate_to(&self, route: &str) {
        self.routes.lock().push(route.to_string());
    }
}

/// Keeps saved downloads in memory.
#[derive(Debug, Default)]
pub struct MemoryFiles {
    saved: Mutex<Vec<(String, Vec<u8>)>>,
    fail: AtomicBool,
}

impl MemoryFiles {
    pub fn saved(&self) -> Vec<(String, Vec<u8>)> {
        self.saved.lock().clone()
    }

    /// Make every later save fail.
    pub fn fail_saves(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl FileStorage for MemoryFiles {
    fn save(&self, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "storage full"));
        }
        self.saved.lock().push((file_name.to_string(), bytes.to_vec()));
        Ok(PathBuf::from("memory").join(file_name))
    }
}

/// Recording host with every surface reachable for assertions.
pub struct TestHost {
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub navigator: Arc<RecordingNavigator>,
    pub files: Arc<MemoryFiles>,
    pub overlay: Arc<CountingOverlay>,
    loading: Arc<LoadingCoordinator>,
}

impl TestHost {
    pub fn new() -> Self {
        let overlay = Arc::new(CountingOverlay::default());
        Self {
            store: Arc::new(MemoryStore::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            navigator: Arc::new(RecordingNavigator::default()),
            files: Arc::new(MemoryFiles::default()),
            loading: Arc::new(LoadingCoordinator::new(overlay.clone())),
            overlay,
        }
    }

    /// A `Host` wired to these recorders. Every call shares one coordinator.
    pub fn host(&self) -> Host {
        Host {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            navigator: self.navigator.clone(),
            storage: self.files.clone(),
            loading: Arc::clone(&self.loading),
        }
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct RealtimeScript {
    opens: usize,
    closes: usize,
    reject_all: bool,
    reject_next: usize,
    inbound: Option<mpsc::UnboundedSender<String>>,
    sent: Vec<String>,
}

/// Realtime transport driven by the test.
///
/// Opens succeed unless told otherwise. `push` feeds text to the live
/// connection and `drop_connection` ends it from the server side.
#[derive(Clone, Default)]
pub struct ScriptedRealtime {
    script: Arc<Mutex<RealtimeScript>>,
}

impl ScriptedRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_all(&self) {
        let mut script = self.script.lock();
        script.reject_all = false;
        script.reject_next = 0;
    }

    pub fn reject_all(&self) {
        self.script.lock().reject_all = true;
    }

    pub fn reject_next(&self, count: usize) {
        self.script.lock().reject_next = count;
    }

    pub fn open_count(&self) -> usize {
        self.script.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.script.lock().closes
    }

    pub fn sent(&self) -> Vec<String> {
        self.script.lock().sent.clone()
    }

    pub fn push(&self, text: &str) {
        if let Some(inbound) = &self.script.lock().inbound {
            let _ = inbound.send(text.to_string());
        }
    }

    pub fn drop_connection(&self) {
        self.script.lock().inbound = None;
    }
}

#[async_trait]
impl RealtimeTransport for ScriptedRealtime {
    async fn open(
        &self,
        _endpoint: &str,
    ) -> Result<(Box<dyn RealtimeSink>, Box<dyn RealtimeStream>), TransportFailure> {
        let mut script = self.script.lock();
        script.opens += 1;
        if script.reject_all {
            return Err(TransportFailure::new("connection refused"));
        }
        if script.reject_next > 0 {
            script.reject_next -= 1;
            return Err(TransportFailure::new("connection refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        script.inbound = Some(tx);
        Ok((
            Box::new(ScriptedSink {
                script: Arc::clone(&self.script),
            }),
            Box::new(ScriptedStream { inbound: rx }),
        ))
    }
}

struct ScriptedSink {
    script: Arc<Mutex<RealtimeScript>>,
}

#[async_trait]
impl RealtimeSink for ScriptedSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportFailure> {
        self.script.lock().sent.push(text);
        Ok(())
    }

    async fn close(&mut self) {
        self.script.lock().closes += 1;
    }
}

struct ScriptedStream {
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl RealtimeStream for ScriptedStream {
    async fn next_text(&mut self) -> Option<Result<String, TransportFailure>> {
        self.inbound.recv().await.map(Ok)
    }
}
