//! REST API Server for the financial agent router
//!
//! Exposes conversation submission, cancellation, reset and the audit trail
//! over HTTP

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::Orchestrator;
use crate::error::OrchestrationError;
use crate::models::TurnOutcome;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubmitRequest {
    pub session_id: String,
    pub text: String,
    /// Force a specific agent for this request
    #[serde(default)]
    pub agent: Option<String>,
    /// The text answers a pending elicitation
    #[serde(default)]
    pub answer: bool,
}

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
    pub model: String,
    pub capabilities: Vec<String>,
    pub human_input: bool,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Machine-readable error kind
    pub error_kind: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            error_kind: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            error_kind: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn from_error(err: &OrchestrationError) -> Self {
        Self {
            error_kind: Some(err.kind().to_string()),
            ..Self::error(err.to_string())
        }
    }
}

fn status_for(err: &OrchestrationError) -> StatusCode {
    match err {
        OrchestrationError::RoutingAmbiguous(_)
        | OrchestrationError::UnknownAgent(_)
        | OrchestrationError::NoPendingElicitation(_) => StatusCode::BAD_REQUEST,
        OrchestrationError::ExecutionBudgetExceeded(_)
        | OrchestrationError::ContextOverflow(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestrationError::Cancelled => StatusCode::CONFLICT,
        OrchestrationError::Upstream { .. } if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        OrchestrationError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: OrchestrationError) -> (StatusCode, Json<ApiResponse>) {
    (status_for(&err), Json(ApiResponse::from_error(&err)))
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

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Agents
/// =============================

async fn list_agents(State(state): State<ApiState>) -> Json<ApiResponse> {
    let agents: Vec<AgentSummary> = state
        .orchestrator
        .agents()
        .iter()
        .map(|a| AgentSummary {
            name: a.name.clone(),
            description: a.description.clone(),
            model: a.model.clone(),
            capabilities: a.capabilities.clone(),
            human_input: a.human_input,
        })
        .collect();

    Json(ApiResponse::success(agents))
}

/// =============================
/// Submit Endpoint
/// =============================

async fn submit(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.session_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("session_id must not be empty".into())),
        );
    }

    info!(session_id = %req.session_id, answer = req.answer, "Received submission");

    match state
        .orchestrator
        .submit(&req.session_id, &req.text, req.agent.as_deref(), req.answer)
        .await
    {
        Ok(outcome) => {
            let current = state.orchestrator.current_agent(&req.session_id).await;
            let mut data = serde_json::to_value(&outcome).unwrap_or_default();
            data["session_id"] = serde_json::json!(req.session_id);
            data["current_agent"] = serde_json::json!(current);
            if let TurnOutcome::Elicitation { .. } = outcome {
                data["awaiting_answer"] = serde_json::json!(true);
            }
            (StatusCode::OK, Json(ApiResponse::success(data)))
        }
        Err(e) => error_response(e),
    }
}

/// =============================
/// Session Controls
/// =============================

async fn reset_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.reset(&session_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({ "session_id": session_id, "reset": true }))),
        ),
        Err(e) => error_response(e),
    }
}

async fn cancel_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Json<ApiResponse> {
    let cancelled = state.orchestrator.cancel(&session_id);
    Json(ApiResponse::success(serde_json::json!({
        "session_id": session_id,
        "cancelled": cancelled,
    })))
}

async fn session_audit(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Json<ApiResponse> {
    let records = state.orchestrator.audit(&session_id).await;
    Json(ApiResponse::success(records))
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/agents", get(list_agents))
        .route("/api/submit", post(submit))
        .route("/api/sessions/:id/reset", post(reset_session))
        .route("/api/sessions/:id/cancel", post(cancel_session))
        .route("/api/sessions/:id/audit", get(session_audit))
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
