//! Development backend for the SwordEdge client.
//!
//! In-memory stand-in for the training service: login tokens, analysis
//! sessions, training records and plans live in one `RwLock`ed store. Report
//! files under `/reports/` are synthesized on request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{info, warn};
use uuid::Uuid;

mod realtime;

/// Size of every synthesized report file.
pub const REPORT_SIZE: usize = 64 * 1024;

type Reply = (StatusCode, Json<Value>);

#[derive(Debug)]
struct AnalysisSession {
    file_name: String,
    bytes: usize,
    fields: HashMap<String, String>,
}

#[derive(Debug)]
struct Store {
    tokens: HashSet<String>,
    sessions: HashMap<String, AnalysisSession>,
    trainings: Vec<Value>,
    plans: Vec<Value>,
    posts: Vec<Value>,
    settings: Value,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            tokens: HashSet::new(),
            sessions: HashMap::new(),
            trainings: vec![
                json!({"id": "1", "type": "foil", "duration": 45, "score": 82}),
                json!({"id": "2", "type": "epee", "duration": 30, "score": 76}),
            ],
            plans: vec![json!({"id": "1", "name": "Footwork basics", "progress": 0})],
            posts: Vec::new(),
            settings: json!({"notifications": true, "units": "metric"}),
        }
    }
}

type Db = Arc<RwLock<Store>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Store::default()));
    Router::new()
        .route("/api/login", post(login))
        .route("/api/register", post(register))
        .route("/api/logout", post(logout))
        .route("/api/user/info", get(user_info))
        .route("/api/user/update", post(update_user))
        .route("/api/start_analysis", post(start_analysis))
        .route("/api/analysis_status/{id}", get(analysis_status))
        .route("/api/generate_skeleton_video", post(skeleton_video))
        .route("/api/analyze_frame", post(analyze_frame))
        .route("/api/get_coach_feedback", post(coach_feedback))
        .route("/api/training/list", get(training_list))
        .route("/api/training/detail/{id}", get(training_detail))
        .route("/api/training/delete/{id}", post(training_delete))
        .route("/api/training/stats", get(training_stats))
        .route("/api/plans/list", get(plan_list))
        .route("/api/plans/detail/{id}", get(plan_detail))
        .route("/api/plans/create", post(plan_create))
        .route("/api/plans/progress/{id}", post(plan_progress))
        .route("/api/community/feed", get(community_feed))
        .route("/api/community/publish", post(community_publish))
        .route("/api/community/like/{id}", post(community_like))
        .route("/api/community/comment/{id}", post(community_comment))
        .route("/api/monitor/start", post(monitor_start))
        .route("/api/monitor/stop", post(monitor_stop))
        .route("/api/monitor/realtime", get(monitor_realtime))
        .route("/api/settings", get(settings))
        .route("/api/settings/update", post(settings_update))
        .route("/api/settings/export", get(settings_export))
        .route("/reports/{*path}", get(report))
        .route("/ws", get(realtime::upgrade))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn ok(value: Value) -> Reply {
    (StatusCode::OK, Json(value))
}

fn fail(status: StatusCode, message: &str) -> Reply {
    (status, Json(json!({ "error": message })))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Body as JSON, tolerating an absent or empty body.
fn json_or_empty(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| json!({}))
}

#[derive(Deserialize)]
struct Credentials {
    username: Option<String>,
    password: Option<String>,
}

async fn login(State(db): State<Db>, Json(input): Json<Credentials>) -> Reply {
    let (Some(username), Some(_)) = (
        input.username.filter(|u| !u.is_empty()),
        input.password.filter(|p| !p.is_empty()),
    ) else {
        return fail(StatusCode::BAD_REQUEST, "username and password are required");
    };

    let token = format!("mock_token_{username}_{}", Uuid::new_v4().simple());
    db.write().await.tokens.insert(token.clone());
    info!(%username, "login");
    ok(json!({
        "token": token,
        "userInfo": {
            "id": 1001,
            "username": username,
            "nickname": username,
            "level": "intermediate",
            "trainingDays": 45
        },
        "message": "login successful"
    }))
}

async fn register(body: String) -> Reply {
    let input = json_or_empty(&body);
    info!(username = %input["username"], "register");
    ok(json!({ "message": "registered, please log in" }))
}

async fn logout(State(db): State<Db>, headers: HeaderMap) -> Reply {
    if let Some(token) = bearer(&headers) {
        db.write().await.tokens.remove(token);
    }
    ok(json!({ "message": "logged out" }))
}

async fn user_info(State(db): State<Db>, headers: HeaderMap) -> Reply {
    let known = match bearer(&headers) {
        Some(token) => db.read().await.tokens.contains(token),
        None => false,
    };
    if !known {
        return fail(StatusCode::UNAUTHORIZED, "not logged in");
    }
    ok(json!({
        "id": 1001,
        "username": "user",
        "nickname": "fencer",
        "level": "intermediate",
        "trainingDays": 45,
        "totalTrainings": 128,
        "achievements": 12
    }))
}

async fn update_user(_body: String) -> Reply {
    ok(json!({ "message": "profile updated" }))
}

/// Uploaded file plus the plain form fields around it.
struct Upload {
    file_name: String,
    bytes: usize,
    fields: HashMap<String, String>,
}

async fn read_upload(mut multipart: Multipart, file_field: &str) -> Result<Upload, Reply> {
    let mut upload = None;
    let mut fields = HashMap::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed multipart body");
                return Err(fail(StatusCode::BAD_REQUEST, "malformed multipart body"));
            }
        };
        let name = field.name().unwrap_or_default().to_string();
        if name == file_field {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|_| fail(StatusCode::BAD_REQUEST, "truncated upload"))?;
            upload = Some((file_name, bytes.len()));
        } else if let Ok(text) = field.text().await {
            fields.insert(name, text);
        }
    }

    match upload {
        Some((file_name, bytes)) => Ok(Upload {
            file_name,
            bytes,
            fields,
        }),
        None => Err(fail(
            StatusCode::BAD_REQUEST,
            &format!("missing {file_field} file"),
        )),
    }
}

async fn start_analysis(State(db): State<Db>, multipart: Multipart) -> Reply {
    let upload = match read_upload(multipart, "video").await {
        Ok(upload) => upload,
        Err(reply) => return reply,
    };
    let session_id = Uuid::new_v4().to_string();
    info!(%session_id, bytes = upload.bytes, "analysis started");
    let reply = json!({
        "session_id": session_id,
        "status": "processing",
        "file_name": upload.file_name,
        "bytes": upload.bytes,
        "fields": upload.fields,
    });
    db.write().await.sessions.insert(
        session_id,
        AnalysisSession {
            file_name: upload.file_name,
            bytes: upload.bytes,
            fields: upload.fields,
        },
    );
    ok(reply)
}

async fn analysis_status(State(db): State<Db>, Path(id): Path<String>) -> Reply {
    let store = db.read().await;
    let Some(session) = store.sessions.get(&id) else {
        return fail(StatusCode::NOT_FOUND, "analysis session not found");
    };
    ok(json!({
        "session_id": id,
        "status": "completed",
        "progress": 100,
        "file_name": session.file_name,
        "bytes": session.bytes,
        "fields": session.fields,
        "result": {"score": 84, "lunges": 12, "avg_reaction_ms": 310}
    }))
}

#[derive(Deserialize)]
struct SkeletonRequest {
    session_id: String,
}

async fn skeleton_video(State(db): State<Db>, Json(input): Json<SkeletonRequest>) -> Reply {
    if !db.read().await.sessions.contains_key(&input.session_id) {
        return fail(StatusCode::NOT_FOUND, "analysis session not found");
    }
    ok(json!({
        "session_id": input.session_id,
        "video_url": format!("/reports/{}/skeleton_yolo.mp4", input.session_id),
    }))
}

async fn analyze_frame(multipart: Multipart) -> Reply {
    match read_upload(multipart, "frame").await {
        Ok(upload) => ok(json!({
            "bytes": upload.bytes,
            "keypoints": [[0.41, 0.22], [0.47, 0.38], [0.52, 0.61]],
        })),
        Err(reply) => reply,
    }
}

async fn coach_feedback(Json(input): Json<Value>) -> Reply {
    let score = input["score"].as_f64().unwrap_or_default();
    let advice = if score >= 80.0 {
        "Strong bout. Keep the lunge recovery as sharp as the attack."
    } else {
        "Shorten the preparation before the lunge and keep the guard high."
    };
    ok(json!({ "type": input["type"], "score": score, "feedback": advice }))
}

async fn training_list(State(db): State<Db>, Query(params): Query<HashMap<String, String>>) -> Reply {
    let store = db.read().await;
    let records: Vec<Value> = match params.get("type") {
        Some(kind) => store
            .trainings
            .iter()
            .filter(|record| record["type"] == kind.as_str())
            .cloned()
            .collect(),
        None => store.trainings.clone(),
    };
    ok(json!({ "code": 0, "data": records }))
}

async fn training_detail(State(db): State<Db>, Path(id): Path<String>) -> Reply {
    let store = db.read().await;
    match store.trainings.iter().find(|record| record["id"] == id.as_str()) {
        Some(record) => ok(json!({ "code": 0, "data": record })),
        None => fail(StatusCode::NOT_FOUND, "training record not found"),
    }
}

async fn training_delete(State(db): State<Db>, Path(id): Path<String>) -> Reply {
    let mut store = db.write().await;
    let before = store.trainings.len();
    store.trainings.retain(|record| record["id"] != id.as_str());
    if store.trainings.len() == before {
        return ok(json!({ "success": false, "message": "training record not found" }));
    }
    ok(json!({ "success": true }))
}

async fn training_stats(State(db): State<Db>) -> Reply {
    let store = db.read().await;
    let minutes: i64 = store
        .trainings
        .iter()
        .filter_map(|record| record["duration"].as_i64())
        .sum();
    ok(json!({ "sessions": store.trainings.len(), "minutes": minutes }))
}

async fn plan_list(State(db): State<Db>) -> Reply {
    ok(json!({ "code": 0, "data": db.read().await.plans }))
}

async fn plan_detail(State(db): State<Db>, Path(id): Path<String>) -> Reply {
    let store = db.read().await;
    match store.plans.iter().find(|plan| plan["id"] == id.as_str()) {
        Some(plan) => ok(json!({ "code": 0, "data": plan })),
        None => ok(json!({ "code": 404, "message": "plan not found" })),
    }
}

async fn plan_create(State(db): State<Db>, Json(mut plan): Json<Value>) -> Reply {
    let id = Uuid::new_v4().to_string();
    plan["id"] = json!(id);
    plan["progress"] = json!(0);
    db.write().await.plans.push(plan.clone());
    ok(json!({ "code": 0, "data": plan }))
}

async fn plan_progress(State(db): State<Db>, Path(id): Path<String>, Json(update): Json<Value>) -> Reply {
    let mut store = db.write().await;
    let Some(plan) = store.plans.iter_mut().find(|plan| plan["id"] == id.as_str()) else {
        return ok(json!({ "code": 404, "message": "plan not found" }));
    };
    plan["progress"] = update["progress"].clone();
    ok(json!({ "code": 0, "data": plan }))
}

async fn community_feed(State(db): State<Db>) -> Reply {
    ok(json!({ "code": 0, "data": db.read().await.posts }))
}

async fn community_publish(State(db): State<Db>, Json(mut post): Json<Value>) -> Reply {
    post["id"] = json!(Uuid::new_v4().to_string());
    post["likes"] = json!(0);
    db.write().await.posts.push(post.clone());
    ok(json!({ "code": 0, "data": post }))
}

async fn community_like(Path(id): Path<String>) -> Reply {
    ok(json!({ "code": 0, "id": id, "liked": true }))
}

async fn community_comment(Path(id): Path<String>, body: String) -> Reply {
    ok(json!({ "code": 0, "id": id, "comment": json_or_empty(&body) }))
}

async fn monitor_start(body: String) -> Reply {
    ok(json!({ "status": "ok", "message": "monitor started", "config": json_or_empty(&body) }))
}

async fn monitor_stop() -> Reply {
    ok(json!({ "status": "ok", "message": "monitor stopped" }))
}

async fn monitor_realtime() -> Reply {
    ok(json!({ "status": "ok", "data": [] }))
}

async fn settings(State(db): State<Db>) -> Reply {
    ok(db.read().await.settings.clone())
}

async fn settings_update(State(db): State<Db>, Json(update): Json<Value>) -> Reply {
    let mut store = db.write().await;
    if let (Some(current), Some(update)) = (store.settings.as_object_mut(), update.as_object()) {
        for (key, value) in update {
            current.insert(key.clone(), value.clone());
        }
    }
    ok(json!({ "success": true, "settings": store.settings }))
}

async fn settings_export(State(db): State<Db>) -> Reply {
    let store = db.read().await;
    ok(json!({
        "settings": store.settings,
        "trainings": store.trainings,
        "plans": store.plans,
    }))
}

/// Deterministic report bytes for `path`.
pub fn report_bytes(path: &str) -> Vec<u8> {
    path.bytes().cycle().take(REPORT_SIZE).collect()
}

async fn report(Path(path): Path<String>) -> impl IntoResponse {
    if path.is_empty() || path.contains("..") {
        return (StatusCode::NOT_FOUND, Vec::new()).into_response();
    }
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        report_bytes(&path),
    )
        .into_response()
}
