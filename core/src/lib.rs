//! Network transport core for the SwordEdge fencing-training client.
//!
//! # Overview
//! Pages call the request pipeline (`ApiClient::get`/`post`/`put`/`delete`)
//! or the transfer subsystem (`upload_file`, `download_file`) and get back
//! either the backend payload or a normalized `ApiError`. Both consult the
//! shared `LoadingCoordinator` for the busy overlay. The realtime channel
//! (`ChannelSession`) is opened separately and pushes events to registered
//! handlers.
//!
//! # Design
//! - Requests and responses are plain data (`HttpRequest`, `HttpResponse`);
//!   only an `HttpTransport` touches the network, so everything above it is
//!   deterministic under `testing::ScriptedTransport`.
//! - Host surfaces (storage, toasts, navigation, file saving, overlay) are
//!   traits bundled in `Host` and injected into the client.
//! - Response envelopes are classified into a sum type before any error is
//!   raised; see `envelope`.
//! - The realtime transport is a trait with a WebSocket implementation and
//!   a scripted one for tests.

pub mod api;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod host;
pub mod http;
pub mod loading;
pub mod realtime;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transfer;
pub mod transport;
pub mod types;

pub use client::{ApiClient, RequestOptions};
pub use config::ClientConfig;
pub use envelope::{Envelope, OperationKind};
pub use error::{ApiError, ConfigError};
pub use host::{Host, Toast};
pub use http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportFailure};
pub use loading::{LoadingCoordinator, LoadingGuard, LoadingOverlay};
pub use realtime::{ChannelError, ChannelMessage, ChannelSession, ChannelState, WsTransport};
pub use transfer::{ProgressCallback, UploadTask};
pub use transport::UreqTransport;
pub use types::{CoachFeedbackRequest, LoginRequest, LoginResponse, SkeletonVideoRequest};
