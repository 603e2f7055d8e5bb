//! Upload and download with progress reporting.
//!
//! # Design
//! Uploads are multipart POSTs built in memory: extra form fields first,
//! then the file part. The form field name comes from the task when the
//! caller set one, otherwise from the endpoint (`video` for analysis
//! uploads, `frame` for single-frame analysis), otherwise `file`.
//!
//! Transports report bytes; callers see integer percentages. Repeated
//! percentages are suppressed, and values never exceed 100.

use std::fmt::Write as _;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use ureq::unversioned::multipart::{Form, Part};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::envelope::{normalize_response, transport_error, OperationKind};
use crate::error::ApiError;
use crate::host::Toast;
use crate::http::{HttpMethod, HttpRequest, ProgressFn};

pub const DEFAULT_FIELD_NAME: &str = "file";

/// Receives transfer progress as a percentage in `0..=100`.
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// A local file to send to an upload endpoint.
#[derive(Clone)]
pub struct UploadTask {
    pub url: String,
    pub file: PathBuf,
    pub field_name: Option<String>,
    pub extra_fields: Vec<(String, String)>,
    pub on_progress: Option<ProgressCallback>,
}

impl UploadTask {
    pub fn new(url: &str, file: impl Into<PathBuf>) -> Self {
        Self {
            url: url.to_string(),
            file: file.into(),
            field_name: None,
            extra_fields: Vec::new(),
            on_progress: None,
        }
    }

    /// Name the multipart field explicitly instead of inferring it.
    pub fn field(mut self, name: &str) -> Self {
        self.field_name = Some(name.to_string());
        self
    }

    pub fn extra(mut self, name: &str, value: &str) -> Self {
        self.extra_fields.push((name.to_string(), value.to_string()));
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn resolved_field_name(&self) -> &str {
        self.field_name
            .as_deref()
            .or_else(|| infer_field_name(&self.url))
            .unwrap_or(DEFAULT_FIELD_NAME)
    }
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask")
            .field("url", &self.url)
            .field("file", &self.file)
            .field("field_name", &self.resolved_field_name())
            .field("extra_fields", &self.extra_fields)
            .finish()
    }
}

/// Field name an upload endpoint expects, judged from its path.
pub fn infer_field_name(url: &str) -> Option<&'static str> {
    if url.contains("analyze_frame") {
        Some("frame")
    } else if url.contains("start_analysis") || url.contains("analyze_video") {
        Some("video")
    } else {
        None
    }
}

/// An encoded `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Encode text fields followed by one file part.
pub fn encode_multipart(
    fields: &[(String, String)],
    field_name: &str,
    file_name: &str,
    mime: &str,
    contents: &[u8],
) -> io::Result<MultipartBody> {
    let fields: Vec<(String, &str)> = fields
        .iter()
        .map(|(name, value)| (disposition_value(name), value.as_str()))
        .collect();
    let field_name = disposition_value(field_name);
    let file_name = disposition_value(file_name);

    let file = Part::bytes(contents)
        .file_name(&file_name)
        .mime_str(mime)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let mut form = fields
        .iter()
        .fold(Form::new(), |form, (name, value)| form.text(name, value))
        .part(&field_name, file);

    let content_type = format!("multipart/form-data; boundary={}", form.boundary());
    let mut bytes = Vec::with_capacity(contents.len() + 512);
    form.read_to_end(&mut bytes)?;
    Ok(MultipartBody { content_type, bytes })
}

/// Make a name safe inside a quoted `Content-Disposition` parameter.
///
/// Quotes are backslash-escaped. Backslashes and control characters are
/// percent-encoded so a name can never end the header line.
fn disposition_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("%5C"),
            c if c.is_ascii_control() && c != '\t' => {
                let _ = write!(out, "%{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Adapt a percentage callback to the transport's byte-level sink.
pub fn percent_progress(callback: ProgressCallback) -> ProgressFn {
    let last = Arc::new(AtomicU16::new(u16::MAX));
    Arc::new(move |done: u64, total: Option<u64>| {
        let Some(total) = total else {
            return;
        };
        let percent = if total == 0 {
            100
        } else {
            (done.saturating_mul(100) / total).min(100) as u16
        };
        if last.swap(percent, Ordering::Relaxed) != percent {
            callback(percent as u8);
        }
    })
}

fn download_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next().unwrap_or_default();
    let segment = if segment.is_empty() || segment.contains(':') {
        "download"
    } else {
        segment
    };
    format!("{}-{segment}", Uuid::new_v4().simple())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_FIELD_NAME.to_string())
}

impl ApiClient {
    /// Upload a local file as multipart form data.
    ///
    /// A 200 body that is not JSON is returned as a JSON string.
    pub async fn upload_file(&self, task: UploadTask) -> Result<Value, ApiError> {
        let outcome = self.upload(&task).await;
        if let Err(err) = &outcome {
            self.surface(err);
        }
        outcome
    }

    async fn upload(&self, task: &UploadTask) -> Result<Value, ApiError> {
        let _loading = self.host().loading.acquire(OperationKind::Upload.overlay_title());

        let contents = tokio::fs::read(&task.file).await.map_err(|e| {
            warn!(file = %task.file.display(), error = %e, "cannot read upload source");
            ApiError::local("Failed to read file", e)
        })?;
        let mime = mime_guess::from_path(&task.file).first_or_octet_stream();
        let field_name = task.resolved_field_name();
        let body = encode_multipart(
            &task.extra_fields,
            field_name,
            &file_name_of(&task.file),
            mime.essence_str(),
            &contents,
        )
        .map_err(|e| {
            warn!(file = %task.file.display(), error = %e, "cannot encode upload");
            ApiError::local("Failed to read file", e)
        })?;

        let request = HttpRequest {
            method: HttpMethod::Post,
            url: self.config().resolve_url(&task.url),
            headers: self.request_headers(&[], &body.content_type),
            body: Some(body.bytes),
            timeout: self.config().timeout(),
        };
        info!(url = %request.url, field = field_name, bytes = contents.len(), "uploading file");

        let progress = task.on_progress.clone().map(percent_progress);
        let response = self.dispatch(request, progress).await.map_err(|failure| {
            warn!(%failure, "upload failed before a response arrived");
            transport_error(&failure, OperationKind::Upload)
        })?;
        debug!(status = response.status, "upload response received");
        normalize_response(&response, OperationKind::Upload)
    }

    /// Download `url` into host storage and return the saved location.
    pub async fn download_file(
        &self,
        url: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, ApiError> {
        let outcome = self.download(url, on_progress).await;
        match &outcome {
            Ok(path) => {
                info!(path = %path.display(), "download saved");
                self.host().notifier.toast(Toast::success("Download complete"));
            }
            Err(err) => self.surface(err),
        }
        outcome
    }

    async fn download(&self, url: &str, on_progress: Option<ProgressCallback>) -> Result<PathBuf, ApiError> {
        let _loading = self.host().loading.acquire(OperationKind::Download.overlay_title());

        let request = HttpRequest {
            method: HttpMethod::Get,
            url: self.config().resolve_url(url),
            headers: self.request_headers(&[], "application/octet-stream"),
            body: None,
            timeout: self.config().timeout(),
        };
        info!(url = %request.url, "downloading file");

        let file_name = download_name(&request.url);
        let response = self
            .dispatch(request, on_progress.map(percent_progress))
            .await
            .map_err(|failure| {
                warn!(%failure, "download failed before a response arrived");
                transport_error(&failure, OperationKind::Download)
            })?;

        if response.status != 200 {
            warn!(status = response.status, "download rejected by server");
            return Err(ApiError::Application {
                status: Some(response.status),
                message: OperationKind::Download.failure_message().to_string(),
                raw: None,
            });
        }

        let storage = Arc::clone(&self.host().storage);
        let body = response.body;
        tokio::task::spawn_blocking(move || storage.save(&file_name, &body))
            .await
            .map_err(io::Error::other)
            .and_then(|saved| saved)
            .map_err(|e| {
                warn!(error = %e, "cannot save downloaded file");
                ApiError::local("Failed to save file", e)
            })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::config::ClientConfig;
    use crate::host::{KeyValueStore, ToastIcon};
    use crate::http::HttpResponse;
    use crate::testing::{ScriptedReply, ScriptedTransport, TestHost};

    fn client(host: &TestHost, transport: &ScriptedTransport) -> ApiClient {
        ApiClient::new(ClientConfig::default(), host.host()).with_transport(Arc::new(transport.clone()))
    }

    fn video_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    fn recorder() -> (Arc<Mutex<Vec<u8>>>, impl Fn(u8) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |p| sink.lock().push(p))
    }

    #[test]
    fn field_name_precedence() {
        assert_eq!(UploadTask::new("/api/start_analysis", "a.mp4").resolved_field_name(), "video");
        assert_eq!(UploadTask::new("/api/analyze_video", "a.mp4").resolved_field_name(), "video");
        assert_eq!(UploadTask::new("/api/analyze_frame", "a.jpg").resolved_field_name(), "frame");
        assert_eq!(UploadTask::new("/api/avatar", "a.png").resolved_field_name(), "file");
        assert_eq!(
            UploadTask::new("/api/start_analysis", "a.mp4").field("clip").resolved_field_name(),
            "clip"
        );
    }

    #[test]
    fn multipart_layout() {
        let body = encode_multipart(
            &[("athlete".to_string(), "lee".to_string())],
            "video",
            "bout.mp4",
            "video/mp4",
            b"VIDEO",
        )
        .unwrap();
        let boundary = body.content_type.split("boundary=").nth(1).unwrap().to_string();
        let text = String::from_utf8(body.bytes).unwrap();
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("name=\"athlete\"\r\n\r\nlee\r\n"));
        assert!(text.contains("name=\"video\"; filename=\"bout.mp4\"\r\nContent-Type: video/mp4\r\n\r\nVIDEO"));
        assert!(text.ends_with(&format!("\r\n--{boundary}--\r\n")));
    }

    #[test]
    fn multipart_names_cannot_break_part_headers() {
        let body = encode_multipart(
            &[("note\r\nX-Injected: 1".to_string(), "v".to_string())],
            "video",
            "bout \"final\"\r\nContent-Type: text\r\n\r\nx\\.mp4",
            "video/mp4",
            b"0123456789",
        )
        .unwrap();
        let text = String::from_utf8(body.bytes).unwrap();
        assert!(text.contains("name=\"note%0D%0AX-Injected: 1\"\r\n\r\nv\r\n"));
        assert!(text.contains(
            "filename=\"bout \\\"final\\\"%0D%0AContent-Type: text%0D%0A%0D%0Ax%5C.mp4\"\r\n\
             Content-Type: video/mp4\r\n\r\n0123456789\r\n"
        ));
        assert!(!text.contains("\r\nX-Injected"));
    }

    #[test]
    fn percent_progress_clamps_and_dedupes() {
        let (seen, callback) = recorder();
        let progress = percent_progress(Arc::new(callback));
        progress(0, Some(200));
        progress(1, Some(200));
        progress(100, Some(200));
        progress(250, Some(200));
        progress(300, Some(200));
        progress(5, None);
        assert_eq!(*seen.lock(), vec![0, 50, 100]);
    }

    #[test]
    fn download_names_keep_the_last_segment() {
        let name = download_name("http://localhost:5001/reports/s1/skeleton_yolo.mp4?x=1");
        assert!(name.ends_with("-skeleton_yolo.mp4"));
        assert!(download_name("http://localhost:5001/").ends_with("-download"));
        assert_ne!(download_name("http://h/a.mp4"), download_name("http://h/a.mp4"));
    }

    #[tokio::test]
    async fn upload_sends_multipart_and_reports_progress() {
        let host = TestHost::new();
        host.store.set("token", json!("tok"));
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::json(200, json!({"session_id": "s-1"})));
        let file = video_file(&[1u8; 4096]);
        let (seen, callback) = recorder();

        let value = client(&host, &transport)
            .upload_file(
                UploadTask::new("/api/start_analysis", file.path())
                    .extra("athlete", "lee")
                    .on_progress(callback),
            )
            .await
            .unwrap();

        assert_eq!(value, json!({"session_id": "s-1"}));
        let request = &transport.requests()[0];
        assert_eq!(request.url, "http://localhost:5001/api/start_analysis");
        assert!(request.header("content-type").unwrap().starts_with("multipart/form-data; boundary="));
        assert_eq!(request.header("authorization"), Some("Bearer tok"));
        let body = String::from_utf8_lossy(request.body.as_deref().unwrap()).into_owned();
        assert!(body.contains("name=\"video\""));
        assert!(body.contains("Content-Type: video/mp4"));

        let seen = seen.lock().clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|p| *p <= 100));
        assert_eq!(host.overlay.shows(), 1);
        assert_eq!(host.overlay.hides(), 1);
    }

    #[tokio::test]
    async fn upload_text_body_is_returned_as_string() {
        let host = TestHost::new();
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::Respond(HttpResponse::new(200, "queued")));
        let file = video_file(b"x");
        let value = client(&host, &transport)
            .upload_file(UploadTask::new("/api/analyze_frame", file.path()))
            .await
            .unwrap();
        assert_eq!(value, json!("queued"));
    }

    #[tokio::test]
    async fn upload_envelope_failure_uses_upload_wording() {
        let host = TestHost::new();
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::json(200, json!({"err": "decoder crashed"})));
        let file = video_file(b"x");
        let err = client(&host, &transport)
            .upload_file(UploadTask::new("/api/analyze_frame", file.path()))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Upload failed");
        assert_eq!(host.notifier.messages(), vec!["Upload failed".to_string()]);
        assert_eq!(host.overlay.hides(), 1);
    }

    #[tokio::test]
    async fn missing_upload_source_is_a_local_error() {
        let host = TestHost::new();
        let transport = ScriptedTransport::new();
        let err = client(&host, &transport)
            .upload_file(UploadTask::new("/api/start_analysis", "/definitely/not/here.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Local { .. }));
        assert!(transport.requests().is_empty());
        assert_eq!(host.host().loading.active(), 0);
        assert_eq!(host.notifier.messages(), vec!["Failed to read file".to_string()]);
    }

    #[tokio::test]
    async fn upload_timeout_wording() {
        let host = TestHost::new();
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::Fail("timeout: global".to_string()));
        let file = video_file(b"x");
        let err = client(&host, &transport)
            .upload_file(UploadTask::new("/api/start_analysis", file.path()))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Upload timed out, please check the network");
    }

    #[tokio::test]
    async fn download_saves_and_reports() {
        let host = TestHost::new();
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::Respond(HttpResponse::new(200, vec![9u8; 1000])));
        let (seen, callback) = recorder();

        let path = client(&host, &transport)
            .download_file("/reports/s1/skeleton_yolo.mp4", Some(Arc::new(callback)))
            .await
            .unwrap();

        assert!(path.to_string_lossy().ends_with("skeleton_yolo.mp4"));
        let saved = host.files.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].1.len(), 1000);
        assert_eq!(seen.lock().last().copied(), Some(100));
        let toasts = host.notifier.toasts();
        assert_eq!(toasts.len(), 1);
        assert_eq!(toasts[0].icon, ToastIcon::Success);
        assert_eq!(host.overlay.hides(), 1);
    }

    #[tokio::test]
    async fn download_non_200_fails() {
        let host = TestHost::new();
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::json(404, json!({"error": "gone"})));
        let err = client(&host, &transport)
            .download_file("/reports/missing.mp4", None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(404));
        assert_eq!(err.message(), "Download failed");
        assert!(host.files.saved().is_empty());
    }

    #[tokio::test]
    async fn download_save_failure_is_local() {
        let host = TestHost::new();
        host.files.fail_saves();
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::Respond(HttpResponse::new(200, "bytes")));
        let err = client(&host, &transport)
            .download_file("/reports/a.mp4", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Local { .. }));
        assert_eq!(host.notifier.messages(), vec!["Failed to save file".to_string()]);
        assert_eq!(host.host().loading.active(), 0);
    }

    #[derive(Default)]
    struct ThreadRecordingStorage {
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl crate::host::FileStorage for ThreadRecordingStorage {
        fn save(&self, file_name: &str, _bytes: &[u8]) -> io::Result<PathBuf> {
            self.threads.lock().push(std::thread::current().id());
            Ok(PathBuf::from(file_name))
        }
    }

    #[tokio::test]
    async fn download_saves_off_the_async_thread() {
        let host = TestHost::new();
        let storage = Arc::new(ThreadRecordingStorage::default());
        let mut wired = host.host();
        wired.storage = storage.clone();
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::Respond(HttpResponse::new(200, "bytes")));

        ApiClient::new(ClientConfig::default(), wired)
            .with_transport(Arc::new(transport))
            .download_file("/reports/a.mp4", None)
            .await
            .unwrap();

        let threads = storage.threads.lock().clone();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }
}
