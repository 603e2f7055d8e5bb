//! Error types for the transport core.
//!
//! # Design
//! Callers branch on three kinds of failure. `Transport` means no response
//! was interpretable. `Application` means a response arrived but signalled
//! failure, either through the status line or through the payload envelope.
//! `Local` covers the device side of a transfer (reading the file to upload,
//! saving a download) and request serialization. Every variant carries the
//! human-readable message that was shown to the user.

use serde_json::Value;
use thiserror::Error;

/// Normalized failure returned by every pipeline and transfer operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// DNS, connect, reset or timeout: nothing came back.
    #[error("{message}")]
    Transport { message: String, reason: String },

    /// A response arrived and was judged unsuccessful.
    ///
    /// `status` is the HTTP status for non-200 responses and `None` when a
    /// 200 response carried a failure signal in its payload.
    #[error("{message}")]
    Application {
        status: Option<u16>,
        message: String,
        raw: Option<Value>,
    },

    #[error("{message}")]
    Local { message: String, detail: String },
}

impl ApiError {
    pub fn message(&self) -> &str {
        match self {
            ApiError::Transport { message, .. }
            | ApiError::Application { message, .. }
            | ApiError::Local { message, .. } => message,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Application { status, .. } => *status,
            _ => None,
        }
    }

    /// Backend payload that accompanied the failure, if any.
    pub fn raw(&self) -> Option<&Value> {
        match self {
            ApiError::Application { raw, .. } => raw.as_ref(),
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport { .. })
    }

    pub(crate) fn local(message: &str, detail: impl ToString) -> Self {
        ApiError::Local {
            message: message.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidNumber { key: String, value: String },

    #[error("base url must start with http:// or https://, got {0:?}")]
    InvalidBaseUrl(String),
}
