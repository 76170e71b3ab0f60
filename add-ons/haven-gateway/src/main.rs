//! Axum-based HITL gateway: entry point for the crisis core. Config-driven
//! via HavenConfig.
//!
//! The inbound chat pipeline calls `/api/v1/chat`, which scores every message
//! inline and opens an alert when the configured threshold is met. Clinician
//! consoles attach to the `hitl_alert` SSE feed, acknowledge and resolve over
//! HTTP, and relay messages through the per-intervention SSE streams. The
//! supportive reply (with hotline information at critical level) is composed
//! before any alert plumbing runs and is returned no matter what that
//! plumbing did.

use axum::extract::{Json, Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::Router;
use haven_core::{
    AlertDetails, AlertManager, AlertSettings, AlertStore, FeedbackSink, HavenConfig, HavenError,
    ModerationPipeline, NotificationDispatcher, RealtimeBridge, RelaySender, RelaySide,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Gateway version from Cargo.toml, reported by the health endpoint.
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
struct AppState {
    config: Arc<HavenConfig>,
    pipeline: Arc<ModerationPipeline>,
    alerts: Arc<AlertManager>,
    bridge: Arc<RealtimeBridge>,
    feedback: Arc<FeedbackSink>,
    store: Arc<AlertStore>,
}

fn build_state(config: HavenConfig) -> AppState {
    let config = Arc::new(config);
    let store = Arc::new(AlertStore::open(&config.storage_path));
    let bridge = RealtimeBridge::new();
    let (events, _) = broadcast::channel(256);
    let dispatcher = NotificationDispatcher::from_config(&config, events.clone());
    let alerts = AlertManager::new(
        AlertSettings::from_config(&config),
        Arc::clone(&store),
        dispatcher,
        Arc::clone(&bridge),
        events,
    );
    let data_dir = config
        .lexicon_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| std::path::Path::new(&config.storage_path).join("data"));
    let pipeline = Arc::new(ModerationPipeline::from_data_dir(&data_dir));
    let feedback = FeedbackSink::new(Arc::clone(&store));
    AppState {
        config,
        pipeline,
        alerts,
        bridge,
        feedback,
        store,
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!(
            "[haven-gateway] .env not loaded: {} (using system environment)",
            e
        );
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match HavenConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[haven-gateway] config error: {}", e);
            std::process::exit(1);
        }
    };

    let state = build_state(config);
    let port = state.config.port;
    let app_name = state.config.app_name.clone();
    let store = Arc::clone(&state.store);
    let app = build_app(state);

    // Loopback only; a reverse proxy owns the public surface.
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("{} listening on {}", app_name, addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested, flushing alert store");
            store.flush();
        }
    }
}

fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/chat", post(chat_post))
        .route("/api/v1/alerts/active", get(alerts_active_get))
        .route("/api/v1/alerts/stats", get(alerts_stats_get))
        .route("/api/v1/alerts/review-queue", get(alerts_review_queue_get))
        .route("/api/v1/alerts/stream", get(alerts_stream))
        .route("/api/v1/alerts/:id/acknowledge", post(alert_acknowledge_post))
        .route("/api/v1/alerts/:id/resolve", post(alert_resolve_post))
        .route("/api/v1/clinicians/register", post(clinician_register_post))
        .route(
            "/api/v1/clinicians/:id/availability",
            post(clinician_availability_post),
        )
        .route("/api/v1/intervention/:alert_id/join", post(intervention_join_post))
        .route(
            "/api/v1/intervention/:alert_id/close",
            post(intervention_close_post),
        )
        .route(
            "/api/v1/intervention/:alert_id/expert-message",
            post(expert_message_post),
        )
        .route(
            "/api/v1/intervention/:alert_id/user-message",
            post(user_message_post),
        )
        .route(
            "/api/v1/intervention/:alert_id/stream",
            get(intervention_stream),
        )
        .route("/api/v1/feedback/:alert_id", post(feedback_post))
        .with_state(state)
        .layer(cors)
}

/// Maps the core error taxonomy onto HTTP statuses.
fn error_response(e: HavenError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        HavenError::Validation(_) => StatusCode::BAD_REQUEST,
        HavenError::NotFound(_) => StatusCode::NOT_FOUND,
        HavenError::InvalidState(_) | HavenError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    )
}

// -----------------------------------------------------------------------------
// Health
// -----------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "app": state.config.app_name,
        "version": GATEWAY_VERSION,
        "lexicon": state.pipeline.lexicon_version(),
        "durable_store": state.store.is_durable(),
    }))
}

// -----------------------------------------------------------------------------
// Chat (the inbound scoring path)
// -----------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct ChatRequest {
    user_id: String,
    session_id: String,
    message: String,
}

/// Scores one inbound message and opens an alert when warranted. The user
/// always gets a supportive reply, and at critical level the hotline block,
/// whether or not the alert subsystem succeeded.
async fn chat_post(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if body.user_id.trim().is_empty() || body.session_id.trim().is_empty() {
        return error_response(HavenError::Validation(
            "user_id and session_id are required".into(),
        ));
    }

    let result = state.pipeline.score(&body.message);

    // Compose the safety reply first; it must never depend on alert plumbing.
    let critical = result.risk_level == haven_core::RiskLevel::Critical;
    let reply = if critical {
        format!(
            "Mình đang ở đây và lắng nghe bạn. Bạn không đơn độc đâu. \
             Nếu bạn đang trong tình huống khẩn cấp, hãy gọi ngay đường dây nóng {} \
             hoặc 115. Một chuyên viên hỗ trợ đang được kết nối với bạn.",
            state.config.hotline
        )
    } else {
        "Mình đang ở đây và lắng nghe bạn. Bạn muốn chia sẻ thêm không?".to_string()
    };

    let mut alert_id: Option<String> = None;
    if result.risk_level >= state.config.alert_threshold() && result.risk_type.is_some() {
        let details = AlertDetails::from_result(&result, &body.message);
        match state
            .alerts
            .create_critical_alert(&body.user_id, &body.session_id, details)
            .await
        {
            Ok(alert) => {
                // A live intervention sees the user's words in real time.
                if state.bridge.bound_clinician(&alert.id).is_some() {
                    let _ = state.bridge.relay_from_user(&alert.id, &body.message);
                }
                alert_id = Some(alert.id);
            }
            Err(e) => {
                // Loud but non-blocking: the reply above already carries the
                // hotline, which is the part the user must never lose.
                tracing::error!(
                    target: "haven::gateway",
                    user_id = %body.user_id,
                    "CRISIS ALERT NOT RECORDED: {}",
                    e
                );
            }
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "risk_level": result.risk_level.as_str(),
            "risk_score": result.risk_score,
            "message_digest": result.message_digest,
            "alert_id": alert_id,
            "reply": reply,
            "hotline": if critical { Some(state.config.hotline.clone()) } else { None },
        })),
    )
}

// -----------------------------------------------------------------------------
// Alert lifecycle
// -----------------------------------------------------------------------------

async fn alerts_active_get(State(state): State<AppState>) -> Json<serde_json::Value> {
    let alerts = state.alerts.active_alerts().await;
    Json(serde_json::json!({ "status": "ok", "alerts": alerts }))
}

async fn alerts_stats_get(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.alerts.stats().await;
    Json(serde_json::json!({ "status": "ok", "stats": stats }))
}

async fn alerts_review_queue_get(State(state): State<AppState>) -> Json<serde_json::Value> {
    let parked = state.alerts.review_queue().await;
    Json(serde_json::json!({ "status": "ok", "alerts": parked }))
}

#[derive(serde::Deserialize)]
struct AcknowledgeRequest {
    clinician_id: String,
    #[serde(default)]
    notes: Option<String>,
}

async fn alert_acknowledge_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AcknowledgeRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state
        .alerts
        .acknowledge_alert(&id, &body.clinician_id, body.notes)
        .await
    {
        Ok(alert) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "alert": alert })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct ResolveRequest {
    resolution: String,
}

async fn alert_resolve_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.alerts.resolve_alert(&id, &body.resolution).await {
        Ok(alert) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "alert": alert })),
        ),
        Err(e) => error_response(e),
    }
}

/// SSE feed of hitl_alert events for every connected clinician console.
async fn alerts_stream(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>> + Send + 'static>
{
    use async_stream::stream;
    let mut rx = state.alerts.subscribe();
    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    yield Ok(Event::default()
                        .event("hitl_alert")
                        .json_data(&ev)
                        .unwrap_or_else(|_| Event::default().data("{}")));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream)
}

// -----------------------------------------------------------------------------
// Clinicians
// -----------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct RegisterRequest {
    clinician_id: String,
    #[serde(default)]
    name: String,
}

async fn clinician_register_post(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state
        .bridge
        .register_clinician(&body.clinician_id, &body.name)
    {
        Ok(session) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "clinician": session })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct AvailabilityRequest {
    availability: String,
}

async fn clinician_availability_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AvailabilityRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let availability = haven_core::ClinicianAvailability::parse(&body.availability);
    match state.bridge.set_availability(&id, availability) {
        Ok(session) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "clinician": session })),
        ),
        Err(e) => error_response(e),
    }
}

// -----------------------------------------------------------------------------
// Intervention (realtime relay)
// -----------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct JoinRequest {
    clinician_id: String,
}

async fn intervention_join_post(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
    Json(body): Json<JoinRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if state.alerts.get_alert(&alert_id).await.is_none() {
        return error_response(HavenError::NotFound(format!("alert {}", alert_id)));
    }
    match state.bridge.join_intervention(&body.clinician_id, &alert_id) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "alert_id": alert_id })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct CloseRequest {
    notes: String,
}

async fn intervention_close_post(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
    Json(body): Json<CloseRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.alerts.close_intervention(&alert_id, &body.notes).await {
        Ok(alert) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "alert": alert })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct RelayRequest {
    text: String,
}

async fn expert_message_post(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
    Json(body): Json<RelayRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.bridge.relay_from_clinician(&alert_id, &body.text) {
        Ok(message) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "message": message })),
        ),
        Err(e) => error_response(e),
    }
}

async fn user_message_post(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
    Json(body): Json<RelayRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.bridge.relay_from_user(&alert_id, &body.text) {
        Ok(message) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "message": message })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct StreamQuery {
    #[serde(default)]
    role: Option<String>,
}

/// SSE relay for one side of an intervention. The transcript so far is
/// replayed first, then live messages follow; event names match the sender.
async fn intervention_stream(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
    Query(q): Query<StreamQuery>,
) -> Result<
    Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>> + Send + 'static>,
    (StatusCode, Json<serde_json::Value>),
> {
    use async_stream::stream;
    let side = match q.role.as_deref() {
        Some("clinician") | Some("expert") => RelaySide::Clinician,
        _ => RelaySide::User,
    };
    let (snapshot, mut rx) = state
        .bridge
        .subscribe(&alert_id, side)
        .map_err(error_response)?;

    let stream = stream! {
        for msg in snapshot {
            yield Ok(relay_event(&msg));
        }
        loop {
            match rx.recv().await {
                Ok(msg) => yield Ok(relay_event(&msg)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Ok(Sse::new(stream))
}

fn relay_event(msg: &haven_core::RelayMessage) -> Event {
    let name = match msg.sender {
        RelaySender::User => "user_message",
        RelaySender::Clinician => "expert_message",
        RelaySender::System => "system_message",
    };
    Event::default()
        .event(name)
        .json_data(msg)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

// -----------------------------------------------------------------------------
// Feedback
// -----------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct FeedbackRequest {
    clinician_id: String,
    outcome: String,
    #[serde(default)]
    notes: String,
}

async fn feedback_post(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
    Json(body): Json<FeedbackRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if state.alerts.get_alert(&alert_id).await.is_none() {
        return error_response(HavenError::NotFound(format!("alert {}", alert_id)));
    }
    match state
        .feedback
        .record(&alert_id, &body.clinician_id, &body.outcome, &body.notes)
    {
        Ok(record) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "feedback": record })),
        ),
        Err(e) => error_response(e),
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let config = HavenConfig {
            storage_path: dir.path().to_string_lossy().into_owned(),
            escalation_window_secs: 60,
            ..HavenConfig::default()
        };
        // The tempdir must outlive the sled handles held by the state.
        std::mem::forget(dir);
        build_state(config)
    }

    async fn send_json(
        app: &Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_app(test_state());
        let (status, body) = get_json(&app, "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["durable_store"], true);
    }

    #[tokio::test]
    async fn critical_chat_opens_alert_and_carries_hotline() {
        let state = test_state();
        let app = build_app(state);
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/v1/chat",
            serde_json::json!({
                "user_id": "u1",
                "session_id": "s1",
                "message": "Tôi muốn chết"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["risk_level"], "critical");
        assert!(body["hotline"].is_string());
        assert!(body["alert_id"].is_string());
        assert!(body["reply"].as_str().unwrap().contains("115"));

        let (_, active) = get_json(&app, "/api/v1/alerts/active").await;
        let alerts = active["alerts"].as_array().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["status"], "pending");
    }

    #[tokio::test]
    async fn harmless_chat_opens_nothing() {
        let app = build_app(test_state());
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/v1/chat",
            serde_json::json!({
                "user_id": "u1",
                "session_id": "s1",
                "message": "hôm nay trời đẹp quá"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["risk_level"], "low");
        assert!(body["alert_id"].is_null());
        assert!(body["hotline"].is_null());

        let (_, active) = get_json(&app, "/api/v1/alerts/active").await;
        assert!(active["alerts"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_unknown_alert_is_404() {
        let app = build_app(test_state());
        let (status, _) = send_json(
            &app,
            "POST",
            "/api/v1/alerts/no-such-id/acknowledge",
            serde_json::json!({ "clinician_id": "dr-a" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn full_intervention_flow() {
        let app = build_app(test_state());

        let (status, _) = send_json(
            &app,
            "POST",
            "/api/v1/clinicians/register",
            serde_json::json!({ "clinician_id": "dr-a", "name": "Dr. An" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, chat) = send_json(
            &app,
            "POST",
            "/api/v1/chat",
            serde_json::json!({
                "user_id": "u9",
                "session_id": "s9",
                "message": "Tôi muốn chết và sẽ làm đêm nay"
            }),
        )
        .await;
        let alert_id = chat["alert_id"].as_str().unwrap().to_string();

        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/api/v1/alerts/{}/acknowledge", alert_id),
            serde_json::json!({ "clinician_id": "dr-a" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/api/v1/intervention/{}/expert-message", alert_id),
            serde_json::json!({ "text": "Chào bạn, mình là chuyên viên hỗ trợ." }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/api/v1/intervention/{}/close", alert_id),
            serde_json::json!({ "notes": "stabilized, follow-up scheduled" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, active) = get_json(&app, "/api/v1/alerts/active").await;
        assert!(active["alerts"].as_array().unwrap().is_empty());

        // Terminal transitions are final.
        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/api/v1/alerts/{}/resolve", alert_id),
            serde_json::json!({ "resolution": "again" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, stats) = get_json(&app, "/api/v1/alerts/stats").await;
        assert_eq!(stats["stats"]["resolved"], 1);
    }

    #[tokio::test]
    async fn feedback_requires_known_alert() {
        let app = build_app(test_state());
        let (status, _) = send_json(
            &app,
            "POST",
            "/api/v1/feedback/no-such-id",
            serde_json::json!({ "clinician_id": "dr-a", "outcome": "stabilized" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
