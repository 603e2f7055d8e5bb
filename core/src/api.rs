//! Endpoint groups of the training backend.
//!
//! Each group borrows the client and forwards to the pipeline or the
//! transfer subsystem with the backend's paths. Payloads the pages interpret
//! stay untyped.

use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::info;

use crate::client::{ApiClient, RequestOptions};
use crate::error::ApiError;
use crate::transfer::{ProgressCallback, UploadTask};
use crate::types::{CoachFeedbackRequest, LoginRequest, LoginResponse, SkeletonVideoRequest};

impl ApiClient {
    pub fn auth(&self) -> Auth<'_> {
        Auth { client: self }
    }

    pub fn analysis(&self) -> Analysis<'_> {
        Analysis { client: self }
    }

    pub fn coach(&self) -> Coach<'_> {
        Coach { client: self }
    }

    pub fn training(&self) -> Training<'_> {
        Training { client: self }
    }

    pub fn plans(&self) -> Plans<'_> {
        Plans { client: self }
    }

    pub fn community(&self) -> Community<'_> {
        Community { client: self }
    }

    pub fn monitor(&self) -> Monitor<'_> {
        Monitor { client: self }
    }

    pub fn settings(&self) -> Settings<'_> {
        Settings { client: self }
    }
}

fn no_params() -> Value {
    Value::Null
}

/// Login, registration and the user profile.
pub struct Auth<'a> {
    client: &'a ApiClient,
}

impl Auth<'_> {
    /// Log in and store the token and profile for later requests.
    pub async fn login(&self, credentials: &LoginRequest) -> Result<LoginResponse, ApiError> {
        let value = self
            .client
            .post("/api/login", credentials, RequestOptions::default())
            .await?;
        let response: LoginResponse = serde_json::from_value(value).map_err(|e| {
            let err = ApiError::local("Unexpected login response", e);
            self.client.surface(&err);
            err
        })?;

        let config = self.client.config();
        let store = &self.client.host().store;
        store.set(&config.token_key, Value::String(response.token.clone()));
        store.set(&config.user_info_key, response.user_info.clone());
        info!(username = %credentials.username, "logged in");
        Ok(response)
    }

    pub async fn register(&self, data: &Value) -> Result<Value, ApiError> {
        self.client.post("/api/register", data, RequestOptions::default()).await
    }

    /// Log out. Stored credentials are cleared whatever the backend says.
    pub async fn logout(&self) -> Result<Value, ApiError> {
        let outcome = self
            .client
            .post("/api/logout", &no_params(), RequestOptions::default())
            .await;
        let config = self.client.config();
        let store = &self.client.host().store;
        store.remove(&config.token_key);
        store.remove(&config.user_info_key);
        outcome
    }

    pub async fn user_info(&self) -> Result<Value, ApiError> {
        self.client.get("/api/user/info", &no_params(), RequestOptions::default()).await
    }

    pub async fn update_user_info(&self, data: &Value) -> Result<Value, ApiError> {
        self.client.post("/api/user/update", data, RequestOptions::default()).await
    }
}

/// Video and frame analysis.
pub struct Analysis<'a> {
    client: &'a ApiClient,
}

impl Analysis<'_> {
    /// Upload a bout video and start an analysis session.
    pub async fn start(
        &self,
        video: impl Into<PathBuf>,
        extra_fields: &[(String, String)],
        on_progress: Option<ProgressCallback>,
    ) -> Result<Value, ApiError> {
        let mut task = UploadTask::new("/api/start_analysis", video).field("video");
        task.extra_fields = extra_fields.to_vec();
        task.on_progress = on_progress;
        self.client.upload_file(task).await
    }

    pub async fn status(&self, session_id: &str) -> Result<Value, ApiError> {
        self.client
            .get(
                &format!("/api/analysis_status/{session_id}"),
                &no_params(),
                RequestOptions::default(),
            )
            .await
    }

    pub async fn skeleton_video(&self, session_id: &str) -> Result<Value, ApiError> {
        let body = SkeletonVideoRequest {
            session_id: session_id.to_string(),
        };
        self.client
            .post("/api/generate_skeleton_video", &body, RequestOptions::default())
            .await
    }

    pub async fn analyze_frame(&self, frame: impl Into<PathBuf>) -> Result<Value, ApiError> {
        let task = UploadTask::new("/api/analyze_frame", frame).field("frame");
        self.client.upload_file(task).await
    }
}

pub struct Coach<'a> {
    client: &'a ApiClient,
}

impl Coach<'_> {
    pub async fn feedback(&self, request: &CoachFeedbackRequest) -> Result<Value, ApiError> {
        self.client
            .post("/api/get_coach_feedback", request, RequestOptions::default())
            .await
    }
}

/// Training records.
pub struct Training<'a> {
    client: &'a ApiClient,
}

impl Training<'_> {
    pub async fn list(&self, params: &Value, options: RequestOptions) -> Result<Value, ApiError> {
        self.client.get("/api/training/list", params, options).await
    }

    pub async fn detail(&self, id: &str, options: RequestOptions) -> Result<Value, ApiError> {
        self.client
            .get(&format!("/api/training/detail/{id}"), &json!({}), options)
            .await
    }

    pub async fn delete(&self, id: &str, options: RequestOptions) -> Result<Value, ApiError> {
        self.client
            .post(&format!("/api/training/delete/{id}"), &json!({}), options)
            .await
    }

    pub async fn stats(&self, params: &Value, options: RequestOptions) -> Result<Value, ApiError> {
        self.client.get("/api/training/stats", params, options).await
    }
}

pub struct Plans<'a> {
    client: &'a ApiClient,
}

impl Plans<'_> {
    pub async fn list(&self) -> Result<Value, ApiError> {
        self.client.get("/api/plans/list", &no_params(), RequestOptions::default()).await
    }

    pub async fn detail(&self, id: &str) -> Result<Value, ApiError> {
        self.client
            .get(&format!("/api/plans/detail/{id}"), &no_params(), RequestOptions::default())
            .await
    }

    pub async fn create(&self, plan: &Value) -> Result<Value, ApiError> {
        self.client.post("/api/plans/create", plan, RequestOptions::default()).await
    }

    pub async fn progress(&self, id: &str, progress: &Value) -> Result<Value, ApiError> {
        self.client
            .post(&format!("/api/plans/progress/{id}"), progress, RequestOptions::default())
            .await
    }
}

pub struct Community<'a> {
    client: &'a ApiClient,
}

impl Community<'_> {
    pub async fn feed(&self, params: &Value) -> Result<Value, ApiError> {
        self.client.get("/api/community/feed", params, RequestOptions::default()).await
    }

    pub async fn publish(&self, post: &Value) -> Result<Value, ApiError> {
        self.client.post("/api/community/publish", post, RequestOptions::default()).await
    }

    pub async fn like(&self, id: &str) -> Result<Value, ApiError> {
        self.client
            .post(&format!("/api/community/like/{id}"), &no_params(), RequestOptions::default())
            .await
    }

    pub async fn comment(&self, id: &str, comment: &Value) -> Result<Value, ApiError> {
        self.client
            .post(&format!("/api/community/comment/{id}"), comment, RequestOptions::default())
            .await
    }
}

/// Live monitoring control. The telemetry itself arrives on the realtime
/// channel.
pub struct Monitor<'a> {
    client: &'a ApiClient,
}

impl Monitor<'_> {
    pub async fn snapshot(&self) -> Result<Value, ApiError> {
        self.client
            .get("/api/monitor/realtime", &no_params(), RequestOptions::default())
            .await
    }

    pub async fn start(&self, data: &Value, options: RequestOptions) -> Result<Value, ApiError> {
        self.client.post("/api/monitor/start", data, options).await
    }

    pub async fn stop(&self, data: &Value, options: RequestOptions) -> Result<Value, ApiError> {
        self.client.post("/api/monitor/stop", data, options).await
    }
}

pub struct Settings<'a> {
    client: &'a ApiClient,
}

impl Settings<'_> {
    pub async fn get(&self) -> Result<Value, ApiError> {
        self.client.get("/api/settings", &no_params(), RequestOptions::default()).await
    }

    pub async fn update(&self, settings: &Value) -> Result<Value, ApiError> {
        self.client.post("/api/settings/update", settings, RequestOptions::default()).await
    }

    pub async fn export(&self) -> Result<Value, ApiError> {
        self.client.get("/api/settings/export", &no_params(), RequestOptions::default()).await
    }
}
