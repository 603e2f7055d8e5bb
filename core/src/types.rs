//! Request payloads and the few response shapes the core itself reads.
//!
//! # Design
//! Everything else the backend returns stays an untyped `serde_json::Value`;
//! pages interpret it. These types are defined independently from the
//! mock-server crate and integration tests catch schema drift.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

/// Successful login. Fields the core does not use are kept in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginResponse {
    pub token: String,
    #[serde(rename = "userInfo", default)]
    pub user_info: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoachFeedbackRequest {
    /// Analysis type, e.g. `fencing` or `posture`.
    #[serde(rename = "type")]
    pub kind: String,
    pub score: f64,
    #[serde(default)]
    pub metrics: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkeletonVideoRequest {
    pub session_id: String,
}
