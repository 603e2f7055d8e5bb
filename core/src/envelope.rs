//! Response normalization.
//!
//! # Design
//! The backend answers in several shapes: a bare payload, or a payload
//! flagged with `error`/`err`, `success: false`, or a `code` outside
//! {0, 200}. `inspect` runs those checks in that order over an untyped JSON
//! value and returns an `Envelope`, so callers branch on a sum type instead
//! of on thrown payloads. `normalize_response` combines that with the status
//! table for non-200 responses.

use serde_json::Value;

use crate::error::ApiError;
use crate::http::{HttpResponse, TransportFailure};

pub const NETWORK_FAILURE_MESSAGE: &str = "Network request failed";

/// Which kind of exchange produced an outcome; selects user-facing wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Request,
    Upload,
    Download,
}

impl OperationKind {
    pub fn overlay_title(&self) -> &'static str {
        match self {
            OperationKind::Request => "Loading...",
            OperationKind::Upload => "Uploading...",
            OperationKind::Download => "Downloading...",
        }
    }

    pub fn failure_message(&self) -> &'static str {
        match self {
            OperationKind::Request => "Request failed",
            OperationKind::Upload => "Upload failed",
            OperationKind::Download => "Download failed",
        }
    }

    pub fn timeout_message(&self) -> &'static str {
        match self {
            OperationKind::Request => "Request timed out, please check the network",
            OperationKind::Upload => "Upload timed out, please check the network",
            OperationKind::Download => "Download timed out, please check the network",
        }
    }
}

/// Which failure signal fired.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureSignal {
    /// Truthy `error` or `err` field.
    ErrorField,
    /// `success` present and falsy.
    SuccessFalse,
    /// `code` present and not 0 or 200.
    Code(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationFailure {
    pub signal: FailureSignal,
    pub message: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Success(Value),
    Failure(ApplicationFailure),
}

/// Classify a 200 payload.
pub fn inspect(payload: Value) -> Envelope {
    let Some(object) = payload.as_object() else {
        return Envelope::Success(payload);
    };

    let (signal, message) = if truthy(object.get("error")) || truthy(object.get("err")) {
        let message = text(object.get("message")).or_else(|| text(object.get("error")));
        (FailureSignal::ErrorField, message)
    } else if object.get("success").is_some_and(|v| !truthy(Some(v))) {
        (FailureSignal::SuccessFalse, text(object.get("message")))
    } else if let Some(code) = object.get("code").filter(|code| !is_ok_code(code)) {
        (FailureSignal::Code(code.clone()), text(object.get("message")))
    } else {
        return Envelope::Success(payload);
    };

    Envelope::Failure(ApplicationFailure {
        signal,
        message,
        payload,
    })
}

/// Status-line message for a non-200 response.
pub fn status_message(status: u16) -> String {
    match status {
        400 => "Invalid request parameters".to_string(),
        401 => "Not logged in or session expired".to_string(),
        403 => "Permission denied".to_string(),
        404 => "Requested resource not found".to_string(),
        500 => "Internal server error".to_string(),
        502 => "Bad gateway".to_string(),
        503 => "Service unavailable".to_string(),
        504 => "Gateway timeout".to_string(),
        other => format!("Request failed, status code: {other}"),
    }
}

/// Decode a body as JSON. Empty bodies are `null`; anything that is not
/// JSON comes back as a JSON string holding the raw text.
pub fn parse_body(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Apply the status table and the envelope checks to one response.
pub fn normalize_response(response: &HttpResponse, kind: OperationKind) -> Result<Value, ApiError> {
    let payload = parse_body(&response.body);
    if response.status != 200 {
        return Err(ApiError::Application {
            status: Some(response.status),
            message: status_message(response.status),
            raw: (!payload.is_null()).then_some(payload),
        });
    }
    match inspect(payload) {
        Envelope::Success(value) => Ok(value),
        Envelope::Failure(failure) => Err(ApiError::Application {
            status: None,
            message: failure
                .message
                .unwrap_or_else(|| kind.failure_message().to_string()),
            raw: Some(failure.payload),
        }),
    }
}

/// Classify a transport failure by its reason text.
pub fn transport_error(failure: &TransportFailure, kind: OperationKind) -> ApiError {
    let reason = failure.reason.to_ascii_lowercase();
    let message = if reason.contains("timeout") || reason.contains("timed out") {
        kind.timeout_message()
    } else {
        NETWORK_FAILURE_MESSAGE
    };
    ApiError::Transport {
        message: message.to_string(),
        reason: failure.reason.clone(),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn is_ok_code(code: &Value) -> bool {
    code.as_f64().is_some_and(|c| c == 0.0 || c == 200.0)
}

fn text(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
