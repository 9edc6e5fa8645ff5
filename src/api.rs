//! REST API Server for the workflow orchestrator
//!
//! Exposes request routing, event dispatch and engine statistics over HTTP.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::Orchestrator;
use crate::aggregator::aggregate;
use crate::conditions::Event;
use crate::context::ExecutionContext;
use crate::error::OrchestrationError;
use crate::models::ExecutionResult;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunRequest {
    pub request: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub session_id: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn error_with(message: String, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::error(message)
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

/// Map a terminal orchestration error to its HTTP status.
fn error_response(err: OrchestrationError) -> ApiResult {
    match &err {
        OrchestrationError::NoConfidentMatch { candidates, .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ApiResponse::error_with(
                err.to_string(),
                json!({
                    "clarification": err.clarification(),
                    "candidates": candidates,
                }),
            )),
        ),
        OrchestrationError::UnknownWorkflow(_) | OrchestrationError::InvalidPlan(_) => {
            (StatusCode::BAD_REQUEST, Json(ApiResponse::error(err.to_string())))
        }
        _ => {
            warn!(error = %err, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(err.to_string())),
            )
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Registry Endpoints
/// =============================

async fn list_workflows(State(state): State<ApiState>) -> ApiResult {
    let registry = state.orchestrator.registry();
    let workflows: Vec<_> = registry.list();
    (
        StatusCode::OK,
        Json(ApiResponse::success(json!({
            "workflows": workflows,
            "stats": registry.stats(),
        }))),
    )
}

async fn stats(State(state): State<ApiState>) -> ApiResult {
    let executor = state.orchestrator.stats().await;
    (
        StatusCode::OK,
        Json(ApiResponse::success(json!({
            "executor": executor,
            "registry": state.orchestrator.registry_stats(),
        }))),
    )
}

/// =============================
/// Request Routing Endpoint
/// =============================

async fn run_request(State(state): State<ApiState>, Json(req): Json<RunRequest>) -> ApiResult {
    info!(session_id = ?req.session_id, "Received request: {}", req.request);

    if req.request.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("request must not be empty".into())),
        );
    }

    let outcome = match req.session_id.as_deref() {
        Some(session_id) => state.orchestrator.run_session(session_id, &req.request).await,
        None => {
            state
                .orchestrator
                .run(&req.request, &mut ExecutionContext::new())
                .await
        }
    };

    match outcome {
        Ok(result) => (StatusCode::OK, Json(ApiResponse::success(aggregate(&result)))),
        Err(e) => error_response(e),
    }
}

/// =============================
/// Event Endpoint
/// =============================

async fn dispatch_event(State(state): State<ApiState>, Json(req): Json<EventRequest>) -> ApiResult {
    info!(event_type = %req.event_type, session_id = ?req.session_id, "Received event");

    let event = Event::new(&req.event_type, req.payload);
    let outcome = async {
        let sessions = state.orchestrator.sessions();
        let mut context = match req.session_id.as_deref() {
            Some(session_id) => sessions.load(session_id).await?,
            None => ExecutionContext::new(),
        };
        let result = state.orchestrator.handle_event(event, &mut context).await?;
        if let Some(session_id) = req.session_id.as_deref() {
            sessions.save(session_id, &context).await?;
        }
        Ok::<ExecutionResult, OrchestrationError>(result)
    }
    .await;

    match outcome {
        Ok(result) => (
            StatusCode::OK,
            Json(ApiResponse::success(json!({
                "dispatched": result.children.len(),
                "response": aggregate(&result),
            }))),
        ),
        Err(e) => error_response(e),
    }
}

/// =============================
/// Session Endpoint
/// =============================

async fn end_session(State(state): State<ApiState>, Path(session_id): Path<String>) -> ApiResult {
    match state.orchestrator.sessions().end(&session_id).await {
        Ok(true) => (StatusCode::OK, Json(ApiResponse::success(json!({ "ended": session_id })))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("unknown session {}", session_id))),
        ),
        Err(e) => error_response(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/workflows", get(list_workflows))
        .route("/api/run", post(run_request))
        .route("/api/events", post(dispatch_event))
        .route("/api/stats", get(stats))
        .route("/api/sessions/:session_id", delete(end_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
