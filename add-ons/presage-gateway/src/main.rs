//! Axum-based API gateway: HTTP surface for the presage engine. Config-driven
//! via CoreConfig; every route maps onto one engine operation.

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{
    extract::{Json, Path, State},
    Router,
};
use presage_core::{
    CoreConfig, EngineError, Observation, Processor, SequenceOptions, SessionOverlay,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pre-flight check: verify storage opens and the port is free.
fn run_verify() -> Result<(), String> {
    let config = CoreConfig::load().map_err(|e| format!("Config load failed: {e}"))?;

    print!("Checking engine storage... ");
    let processor = Processor::open(config.clone()).map_err(|e| {
        format!("engine storage LOCKED or inaccessible: {e}")
    })?;
    let kbs = processor.list_kbs().map_err(|e| format!("kb registry failed: {e}"))?;
    println!("OK ({} knowledge bases)", kbs.len());
    drop(processor);

    let port = config.port;
    print!("Checking port {port}... ");
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    match std::net::TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            println!("OK (available)");
        }
        Err(e) => return Err(format!("Port {port} BLOCKED: {e}")),
    }

    println!("\nSUCCESS: ready to start gateway.");
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[presage-gateway] .env not loaded: {e} (using system environment)");
    }

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--verify") {
        match run_verify() {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("PRE-FLIGHT FAILED: {e}");
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CoreConfig::load().expect("load CoreConfig");
    let port = config.port;
    let app_name = config.app_name.clone();
    let processor = Processor::open(config.clone()).expect("open presage engine");

    // Expired-session sweeper: lazy expiry is enough for correctness, this
    // keeps the session tree from accumulating dead state.
    let sweep_secs = std::env::var("PRESAGE_SWEEP_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(60)
        .max(1);
    tokio::spawn(sweep_loop(
        Arc::clone(&processor),
        Duration::from_secs(sweep_secs),
    ));

    let app = build_app(AppState {
        processor,
        request_timeout: Duration::from_secs(config.request_timeout_secs),
    });

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("{} listening on {}", app_name, addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await.unwrap(), app)
        .await
        .unwrap();
}

async fn sweep_loop(processor: Arc<Processor>, tick: Duration) {
    tracing::info!(
        target: "presage::gateway",
        tick_secs = tick.as_secs(),
        "session sweeper started"
    );
    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        if let Err(e) = processor.sessions().sweep_expired() {
            tracing::warn!(target: "presage::gateway", error = %e, "session sweep failed");
        }
    }
}

fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/kbs", post(create_kb).get(list_kbs))
        .route("/v1/kbs/:kb_id/clear-all", post(clear_all_memory))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:id", get(get_session).delete(delete_session))
        .route("/v1/sessions/:id/config", put(update_session_config))
        .route("/v1/sessions/:id/observe", post(observe))
        .route("/v1/sessions/:id/observe-sequence", post(observe_sequence))
        .route("/v1/sessions/:id/stm", get(get_stm))
        .route("/v1/sessions/:id/learn", post(learn))
        .route("/v1/sessions/:id/predictions", get(get_predictions))
        .route("/v1/sessions/:id/clear-stm", post(clear_stm))
        .layer(cors)
        .with_state(state)
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) processor: Arc<Processor>,
    pub(crate) request_timeout: Duration,
}

/// Wire-side failure: an engine error, or the request-level timeout.
enum ApiError {
    Engine(EngineError),
    Timeout,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message, retryable) = match self {
            Self::Engine(e) => {
                let status = match &e {
                    EngineError::SessionNotFound(_) | EngineError::KbNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    EngineError::SessionBusy(_) => StatusCode::CONFLICT,
                    EngineError::InvalidVectorDim { .. } | EngineError::InvalidConfig { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    EngineError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                if matches!(e, EngineError::StorageUnavailable(_)) {
                    tracing::error!(target: "presage::gateway", error = %e, "backend failure");
                }
                (status, e.kind(), e.to_string(), e.retryable())
            }
            Self::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "request_timeout",
                "request exceeded the configured timeout".to_string(),
                true,
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": kind,
                "message": message,
                "retryable": retryable,
            })),
        )
            .into_response()
    }
}

/// Bounds an engine call by the request-level timeout.
async fn bounded<T>(
    state: &AppState,
    operation: impl Future<Output = presage_core::Result<T>>,
) -> Result<T, ApiError> {
    match tokio::time::timeout(state.request_timeout, operation).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => Err(ApiError::Timeout),
    }
}

/// GET /api/v1/health – liveness check for UI and scripts.
async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

/// GET /v1/status – app identity plus KB and session counts.
async fn status(State(state): State<AppState>) -> Result<axum::Json<serde_json::Value>, ApiError> {
    let kbs = state.processor.list_kbs()?;
    let sessions = state.processor.sessions().count()?;
    let config = state.processor.config();
    Ok(axum::Json(serde_json::json!({
        "app_name": config.app_name,
        "port": config.port,
        "knowledge_bases": kbs,
        "live_sessions": sessions,
    })))
}

#[derive(Deserialize)]
struct CreateKbRequest {
    kb_id: String,
}

/// POST /v1/kbs – KBs are never created implicitly; this is the explicit op.
async fn create_kb(
    State(state): State<AppState>,
    Json(req): Json<CreateKbRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.processor.create_kb(&req.kb_id)?;
    Ok((
        StatusCode::CREATED,
        axum::Json(serde_json::json!({ "kb_id": req.kb_id, "status": "created" })),
    ))
}

/// GET /v1/kbs
async fn list_kbs(
    State(state): State<AppState>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    let kbs = state.processor.list_kbs()?;
    Ok(axum::Json(serde_json::json!({ "knowledge_bases": kbs })))
}

/// POST /v1/kbs/:kb_id/clear-all – KB-scoped and destructive.
async fn clear_all_memory(
    State(state): State<AppState>,
    Path(kb_id): Path<String>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    state.processor.clear_all_memory(&kb_id)?;
    Ok(axum::Json(serde_json::json!({ "kb_id": kb_id, "status": "cleared" })))
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    kb_id: String,
    #[serde(default)]
    config: SessionOverlay,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

/// POST /v1/sessions
async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .processor
        .create_session(&req.kb_id, req.config, req.ttl_secs)?;
    Ok((StatusCode::CREATED, axum::Json(session)))
}

/// GET /v1/sessions/:id
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(axum::Json(state.processor.get_session(&id)?))
}

/// PUT /v1/sessions/:id/config
async fn update_session_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(overlay): Json<SessionOverlay>,
) -> Result<impl IntoResponse, ApiError> {
    let session = bounded(&state, state.processor.update_session_config(&id, overlay)).await?;
    Ok(axum::Json(session))
}

/// DELETE /v1/sessions/:id
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    state.processor.delete_session(&id)?;
    Ok(axum::Json(serde_json::json!({ "session_id": id, "status": "deleted" })))
}

/// POST /v1/sessions/:id/observe
async fn observe(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(observation): Json<Observation>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = bounded(&state, state.processor.observe(&id, observation)).await?;
    Ok(axum::Json(outcome))
}

#[derive(Deserialize)]
struct ObserveSequenceRequest {
    #[serde(default)]
    events: Vec<Observation>,
    #[serde(default)]
    learn_after_each: bool,
    #[serde(default)]
    learn_at_end: bool,
    #[serde(default)]
    clear_between: bool,
}

/// POST /v1/sessions/:id/observe-sequence
async fn observe_sequence(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ObserveSequenceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let options = SequenceOptions {
        learn_after_each: req.learn_after_each,
        learn_at_end: req.learn_at_end,
        clear_between: req.clear_between,
    };
    let outcome = bounded(
        &state,
        state.processor.observe_sequence(&id, req.events, options),
    )
    .await?;
    Ok(axum::Json(outcome))
}

/// GET /v1/sessions/:id/stm
async fn get_stm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let events = bounded(&state, state.processor.get_stm(&id)).await?;
    Ok(axum::Json(events))
}

/// POST /v1/sessions/:id/learn
async fn learn(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    let pattern_id = bounded(&state, state.processor.learn(&id)).await?;
    Ok(axum::Json(serde_json::json!({ "pattern_id": pattern_id })))
}

/// GET /v1/sessions/:id/predictions
async fn get_predictions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let predictions = bounded(&state, state.processor.get_predictions(&id)).await?;
    Ok(axum::Json(predictions))
}

/// POST /v1/sessions/:id/clear-stm
async fn clear_stm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    bounded(&state, state.processor.clear_stm(&id)).await?;
    Ok(axum::Json(serde_json::json!({ "session_id": id, "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            storage_path: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let processor = Processor::open(config).unwrap();
        let app = build_app(AppState {
            processor,
            request_timeout: Duration::from_secs(30),
        });
        (dir, app)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create_session(app: &Router, config: serde_json::Value) -> String {
        let (status, _) = send(
            app,
            "POST",
            "/v1/kbs",
            Some(serde_json::json!({ "kb_id": "kb" })),
        )
        .await;
        assert!(status == StatusCode::CREATED || status == StatusCode::OK);
        let (status, json) = send(
            app,
            "POST",
            "/v1/sessions",
            Some(serde_json::json!({ "kb_id": "kb", "config": config })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        json["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_is_ok() {
        let (_dir, app) = test_app();
        let (status, json) = send(&app, "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_reports_identity_and_counts() {
        let (_dir, app) = test_app();
        send(
            &app,
            "POST",
            "/v1/kbs",
            Some(serde_json::json!({ "kb_id": "kb" })),
        )
        .await;
        let (status, json) = send(&app, "GET", "/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["app_name"], "Presage Gateway");
        assert_eq!(json["knowledge_bases"], serde_json::json!(["kb"]));
        assert_eq!(json["live_sessions"], 0);
    }

    #[tokio::test]
    async fn test_session_requires_existing_kb() {
        let (_dir, app) = test_app();
        let (status, json) = send(
            &app,
            "POST",
            "/v1/sessions",
            Some(serde_json::json!({ "kb_id": "ghost" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "kb_not_found");
        assert_eq!(json["retryable"], false);
    }

    #[tokio::test]
    async fn test_observe_learn_predict_flow() {
        let (_dir, app) = test_app();
        let sid = create_session(&app, serde_json::json!({})).await;

        for symbol in ["x", "y", "z"] {
            let (status, _) = send(
                &app,
                "POST",
                &format!("/v1/sessions/{sid}/observe"),
                Some(serde_json::json!({ "strings": [symbol] })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, json) = send(&app, "POST", &format!("/v1/sessions/{sid}/learn"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json["pattern_id"],
            "PTRN|5b17f2d1146e4a1bafaaaf8f83c113dac7ff6018"
        );

        send(&app, "POST", &format!("/v1/sessions/{sid}/clear-stm"), None).await;
        send(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/observe"),
            Some(serde_json::json!({ "strings": ["y"] })),
        )
        .await;

        let (status, json) = send(
            &app,
            "GET",
            &format!("/v1/sessions/{sid}/predictions"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let predictions = json.as_array().unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0]["past"], serde_json::json!([["x"]]));
        assert_eq!(predictions[0]["present"], serde_json::json!([["y"]]));
        assert_eq!(predictions[0]["future"], serde_json::json!([["z"]]));
        assert_eq!(predictions[0]["similarity"], 1.0);
    }

    #[tokio::test]
    async fn test_auto_learn_over_http() {
        let (_dir, app) = test_app();
        let sid = create_session(
            &app,
            serde_json::json!({ "max_pattern_length": 3, "stm_mode": "CLEAR" }),
        )
        .await;
        send(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/observe"),
            Some(serde_json::json!({ "strings": ["a", "b"] })),
        )
        .await;
        send(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/observe"),
            Some(serde_json::json!({ "strings": ["c"] })),
        )
        .await;
        let (_, json) = send(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/observe"),
            Some(serde_json::json!({ "strings": ["d", "e"] })),
        )
        .await;
        assert_eq!(
            json["auto_learned_pattern"],
            "PTRN|db44a704d9ef8e88781459125636a090f3275b5a"
        );
        assert_eq!(json["stm_length"], 0);
        let (_, stm) = send(&app, "GET", &format!("/v1/sessions/{sid}/stm"), None).await;
        assert_eq!(stm, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_observe_sequence_batches_under_one_call() {
        let (_dir, app) = test_app();
        let sid = create_session(&app, serde_json::json!({})).await;
        let (status, json) = send(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/observe-sequence"),
            Some(serde_json::json!({
                "events": [
                    { "strings": ["a"] },
                    { "strings": ["b"] },
                    { "strings": ["c"] }
                ],
                "learn_at_end": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["observed"], 3);
        assert_eq!(json["learned_patterns"].as_array().unwrap().len(), 1);
        assert_eq!(json["stm_length"], 0);
    }

    #[tokio::test]
    async fn test_bad_vector_dimension_is_a_client_error() {
        let (_dir, app) = test_app();
        let sid = create_session(&app, serde_json::json!({})).await;
        let (status, json) = send(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/observe"),
            Some(serde_json::json!({ "vectors": [[0.1, 0.2]] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_vector_dim");
    }

    #[tokio::test]
    async fn test_invalid_overlay_is_rejected() {
        let (_dir, app) = test_app();
        let sid = create_session(&app, serde_json::json!({})).await;
        let (status, json) = send(
            &app,
            "PUT",
            &format!("/v1/sessions/{sid}/config"),
            Some(serde_json::json!({ "recall_threshold": 2.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_config");
        assert!(json["message"]
            .as_str()
            .unwrap()
            .contains("recall_threshold"));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (_dir, app) = test_app();
        let (status, json) = send(&app, "GET", "/v1/sessions/ghost/stm", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "session_not_found");
    }

    #[tokio::test]
    async fn test_delete_session_then_404() {
        let (_dir, app) = test_app();
        let sid = create_session(&app, serde_json::json!({})).await;
        let (status, _) = send(&app, "DELETE", &format!("/v1/sessions/{sid}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, "GET", &format!("/v1/sessions/{sid}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_clear_all_memory_route_is_kb_scoped() {
        let (_dir, app) = test_app();
        let sid = create_session(&app, serde_json::json!({})).await;
        send(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/observe-sequence"),
            Some(serde_json::json!({
                "events": [{ "strings": ["p"] }, { "strings": ["q"] }],
                "learn_at_end": true
            })),
        )
        .await;
        let (status, _) = send(&app, "POST", "/v1/kbs/kb/clear-all", None).await;
        assert_eq!(status, StatusCode::OK);
        send(
            &app,
            "POST",
            &format!("/v1/sessions/{sid}/observe"),
            Some(serde_json::json!({ "strings": ["p"] })),
        )
        .await;
        let (_, predictions) = send(
            &app,
            "GET",
            &format!("/v1/sessions/{sid}/predictions"),
            None,
        )
        .await;
        assert_eq!(predictions, serde_json::json!([]));
    }
}
