//! Request pipeline for the training backend.
//!
//! # Design
//! `ApiClient` keeps the build/parse split: `build_request` turns a call
//! into an `HttpRequest` (absolute URL, bearer token, default content type,
//! cache-busting query for GET) and `parse_response` turns an
//! `HttpResponse` into the caller's payload or an `ApiError`. Both are pure.
//! The async verbs wrap them with the side effects: the loading overlay,
//! the transport round-trip under a timeout, toasts, and 401 recovery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::config::ClientConfig;
use crate::envelope::{normalize_response, transport_error, OperationKind};
use crate::error::ApiError;
use crate::host::{Host, KeyValueStore, Toast};
use crate::http::{find_header, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ProgressFn, TransportFailure};
use crate::transport::UreqTransport;

/// Query parameter carrying the cache-busting stamp on GET requests.
pub const CACHE_BUST_PARAM: &str = "_t";

/// Per-call knobs.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub show_loading: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            timeout: None,
            show_loading: true,
        }
    }
}

impl RequestOptions {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Skip the loading overlay for this call.
    pub fn silent(mut self) -> Self {
        self.show_loading = false;
        self
    }
}

/// Hands out strictly increasing millisecond stamps.
#[derive(Debug, Default)]
struct CacheBuster {
    last: AtomicU64,
}

impl CacheBuster {
    fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut previous = self.last.load(Ordering::Relaxed);
        loop {
            let stamp = now.max(previous + 1);
            match self
                .last
                .compare_exchange_weak(previous, stamp, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return stamp,
                Err(actual) => previous = actual,
            }
        }
    }
}

/// Client for the training backend.
pub struct ApiClient {
    config: ClientConfig,
    host: Host,
    transport: Arc<dyn HttpTransport>,
    cache_buster: CacheBuster,
}

impl ApiClient {
    pub fn new(config: ClientConfig, host: Host) -> Self {
        Self {
            config,
            host,
            transport: Arc::new(UreqTransport),
            cache_buster: CacheBuster::default(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub async fn get(&self, url: &str, params: &Value, options: RequestOptions) -> Result<Value, ApiError> {
        self.send(HttpMethod::Get, url, Some(params.clone()), options).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let body = self.encode(body)?;
        self.send(HttpMethod::Post, url, Some(body), options).await
    }

    pub async fn put<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let body = self.encode(body)?;
        self.send(HttpMethod::Put, url, Some(body), options).await
    }

    pub async fn delete(&self, url: &str, params: &Value, options: RequestOptions) -> Result<Value, ApiError> {
        self.send(HttpMethod::Delete, url, Some(params.clone()), options).await
    }

    /// Build the request for one call.
    ///
    /// GET and DELETE carry `payload` in the query string; POST and PUT
    /// carry it as a JSON body.
    pub fn build_request(
        &self,
        method: HttpMethod,
        url: &str,
        payload: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<HttpRequest, ApiError> {
        let mut url = self.config.resolve_url(url);
        let headers = self.request_headers(&options.headers, "application/json");

        let body = match method {
            HttpMethod::Get | HttpMethod::Delete => {
                let mut pairs = query_pairs(payload);
                if method == HttpMethod::Get {
                    pairs.push((CACHE_BUST_PARAM.to_string(), self.cache_buster.next().to_string()));
                }
                append_query(&mut url, &pairs);
                None
            }
            HttpMethod::Post | HttpMethod::Put => match payload {
                Some(value) if !value.is_null() => Some(
                    serde_json::to_vec(value).map_err(|e| ApiError::local("Failed to encode request", e))?,
                ),
                _ => None,
            },
        };

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
            timeout: options.timeout.unwrap_or_else(|| self.config.timeout()),
        })
    }

    /// Interpret a response with the request wording.
    pub fn parse_response(&self, response: &HttpResponse) -> Result<Value, ApiError> {
        normalize_response(response, OperationKind::Request)
    }

    /// Stored bearer token, if the user is logged in.
    pub fn auth_token(&self) -> Option<String> {
        stored_token(self.host.store.as_ref(), &self.config.token_key)
    }

    async fn send(
        &self,
        method: HttpMethod,
        url: &str,
        payload: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let outcome = self.exchange(method, url, payload.as_ref(), &options).await;
        if let Err(err) = &outcome {
            self.surface(err);
        }
        outcome
    }

    async fn exchange(
        &self,
        method: HttpMethod,
        url: &str,
        payload: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<Value, ApiError> {
        let request = self.build_request(method, url, payload, options)?;
        debug!(%method, url = %request.url, "dispatching request");

        let _loading = options
            .show_loading
            .then(|| self.host.loading.acquire(OperationKind::Request.overlay_title()));

        let response = self.dispatch(request, None).await.map_err(|failure| {
            warn!(%failure, "request failed before a response arrived");
            transport_error(&failure, OperationKind::Request)
        })?;
        debug!(status = response.status, "response received");
        self.parse_response(&response)
    }

    /// Run one exchange on the transport, bounded by the request timeout.
    pub(crate) async fn dispatch(
        &self,
        request: HttpRequest,
        progress: Option<ProgressFn>,
    ) -> Result<HttpResponse, TransportFailure> {
        let limit = request.timeout;
        match tokio::time::timeout(limit, self.transport.execute(request, progress)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportFailure::timeout()),
        }
    }

    /// Caller headers plus bearer token and a default content type.
    pub(crate) fn request_headers(&self, extra: &[(String, String)], content_type: &str) -> Vec<(String, String)> {
        let mut headers = extra.to_vec();
        if let Some(token) = self.auth_token() {
            headers.retain(|(name, _)| !name.eq_ignore_ascii_case("authorization"));
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        if find_header(&headers, "content-type").is_none() {
            headers.push(("Content-Type".to_string(), content_type.to_string()));
        }
        headers
    }

    /// Toast the failure and run 401 recovery when it applies.
    pub(crate) fn surface(&self, error: &ApiError) {
        if error.status_code() == Some(401) {
            self.recover_unauthorized();
        }
        self.host.notifier.toast(Toast::error(error.message()));
    }

    fn recover_unauthorized(&self) {
        warn!("backend rejected the session, clearing stored credentials");
        self.host.store.remove(&self.config.token_key);
        self.host.store.remove(&self.config.user_info_key);
        self.host.navigator.navigate_to(&self.config.login_route);
    }

    fn encode<B: Serialize + ?Sized>(&self, body: &B) -> Result<Value, ApiError> {
        serde_json::to_value(body).map_err(|e| {
            let err = ApiError::local("Failed to encode request", e);
            self.surface(&err);
            err
        })
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

/// Non-empty string token under `key`.
pub(crate) fn stored_token(store: &dyn KeyValueStore, key: &str) -> Option<String> {
    match store.get(key) {
        Some(Value::String(token)) if !token.is_empty() => Some(token),
        _ => None,
    }
}

fn query_pairs(params: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = params else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

fn append_query(url: &mut String, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        return;
    }
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    let encoded = serializer.finish();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&encoded);
}
