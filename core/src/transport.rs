//! Production HTTP transport backed by `ureq`.
//!
//! `ureq` is blocking, so each exchange runs on tokio's blocking pool. A
//! fresh agent is built per call with status-as-error disabled: 4xx/5xx
//! responses come back as data and the pipeline interprets them.

use std::io::{self, Cursor, Read};

use async_trait::async_trait;
use tracing::debug;
use ureq::typestate::WithBody;

use crate::http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ProgressFn, TransportFailure};

const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct UreqTransport;

#[async_trait]
impl HttpTransport for UreqTransport {
    async fn execute(
        &self,
        request: HttpRequest,
        progress: Option<ProgressFn>,
    ) -> Result<HttpResponse, TransportFailure> {
        tokio::task::spawn_blocking(move || execute_blocking(request, progress))
            .await
            .map_err(|e| TransportFailure::new(format!("transport task failed: {e}")))?
    }
}

fn execute_blocking(
    request: HttpRequest,
    progress: Option<ProgressFn>,
) -> Result<HttpResponse, TransportFailure> {
    let agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(request.timeout))
        .build()
        .new_agent();

    let reports_download = request.body.is_none();
    let url = request.url.as_str();
    let headers = request.headers.as_slice();

    let result = match request.method {
        HttpMethod::Get => with_headers(agent.get(url), headers).call(),
        HttpMethod::Delete => with_headers(agent.delete(url), headers).call(),
        HttpMethod::Post => send_with_body(with_headers(agent.post(url), headers), request.body, progress.as_ref()),
        HttpMethod::Put => send_with_body(with_headers(agent.put(url), headers), request.body, progress.as_ref()),
    };
    let mut response = result.map_err(failure_from_ureq)?;

    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    let total = crate::http::find_header(&headers, "content-length").and_then(|v| v.parse::<u64>().ok());
    debug!(status, ?total, "transport received response head");

    let download_progress = if reports_download { progress } else { None };
    let body = read_body(response.body_mut().as_reader(), total, download_progress)?;

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn with_headers<B>(mut builder: ureq::RequestBuilder<B>, headers: &[(String, String)]) -> ureq::RequestBuilder<B> {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

fn send_with_body(
    builder: ureq::RequestBuilder<WithBody>,
    body: Option<Vec<u8>>,
    progress: Option<&ProgressFn>,
) -> Result<ureq::http::Response<ureq::Body>, ureq::Error> {
    let Some(body) = body else {
        return builder.send_empty();
    };
    match progress {
        Some(progress) => {
            let total = body.len() as u64;
            let mut reader = ProgressReader {
                inner: Cursor::new(body),
                done: 0,
                total,
                progress: progress.clone(),
            };
            builder.send(ureq::SendBody::from_reader(&mut reader))
        }
        None => builder.send(&body[..]),
    }
}

fn read_body(
    mut reader: impl Read,
    total: Option<u64>,
    progress: Option<ProgressFn>,
) -> Result<Vec<u8>, TransportFailure> {
    let mut body = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut chunk).map_err(failure_from_io)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
        if let Some(progress) = &progress {
            progress(body.len() as u64, total);
        }
    }
    // Without a length header the total is only known at the end.
    if let (Some(progress), None) = (&progress, total) {
        progress(body.len() as u64, Some(body.len() as u64));
    }
    Ok(body)
}

fn failure_from_ureq(err: ureq::Error) -> TransportFailure {
    match err {
        ureq::Error::Timeout(_) => TransportFailure::timeout(),
        ureq::Error::Io(io) => failure_from_io(io),
        other => TransportFailure::new(other.to_string()),
    }
}

fn failure_from_io(err: io::Error) -> TransportFailure {
    if err.kind() == io::ErrorKind::TimedOut {
        TransportFailure::timeout()
    } else {
        TransportFailure::new(err.to_string())
    }
}

/// Counts bytes as ureq pulls the request body and reports them.
struct ProgressReader<R> {
    inner: R,
    done: u64,
    total: u64,
    progress: ProgressFn,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            self.done += read as u64;
            (self.progress)(self.done, Some(self.total));
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn progress_reader_reports_cumulative_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut reader = ProgressReader {
            inner: Cursor::new(vec![7u8; 10]),
            done: 0,
            total: 10,
            progress: Arc::new(move |done, total| sink.lock().push((done, total))),
        };
        let mut buf = [0u8; 4];
        while reader.read(&mut buf).unwrap() > 0 {}
        assert_eq!(
            *seen.lock(),
            vec![(4, Some(10)), (8, Some(10)), (10, Some(10))]
        );
    }

    #[test]
    fn read_body_collects_everything() {
        let body = read_body(Cursor::new(b"frame-bytes".to_vec()), Some(11), None).unwrap();
        assert_eq!(body, b"frame-bytes");
    }

    #[test]
    fn io_timeouts_are_classified_as_timeouts() {
        let failure = failure_from_io(io::Error::new(io::ErrorKind::TimedOut, "slow peer"));
        assert_eq!(failure, TransportFailure::timeout());
        let failure = failure_from_io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(failure.reason, "refused");
    }
}
