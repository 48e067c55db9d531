//! REST API server for the agent workflows
//!
//! Runs agents, lists and resolves pending human decisions, toggles
//! autonomous mode per session and exposes the audit trail.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::execution::{Resolution, RunOptions, WorkflowEngine};
use crate::hitl::DEFAULT_HISTORY_LIMIT;
use crate::models::RunSummary;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    pub hitl_enabled: Option<bool>,
    pub autonomous_mode: Option<bool>,
}

impl RunRequest {
    fn options(&self) -> RunOptions {
        let defaults = RunOptions::default();
        RunOptions {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            hitl_enabled: self.hitl_enabled.unwrap_or(defaults.hitl_enabled),
            autonomous_mode: self.autonomous_mode.unwrap_or(defaults.autonomous_mode),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AutonomousRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionQuery {
    pub agent_id: Option<String>,
    pub limit: Option<usize>,
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
}

type Reply = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> Reply {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn failure(e: WorkflowError) -> Reply {
    let status = match &e {
        WorkflowError::DecisionNotFound(_)
        | WorkflowError::RunNotFound(_)
        | WorkflowError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::Validation(_) | WorkflowError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(kind = e.kind(), error = %e, "Request failed");
    (status, Json(ApiResponse::error(e.to_string())))
}

fn resolution_view(resolution: &Resolution) -> Value {
    serde_json::json!({
        "decision": resolution.decision,
        "applied": resolution.won(),
        "outcome": resolution.outcome.as_ref().map(RunSummary::from),
    })
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<WorkflowEngine>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "workflows": state.engine.workflow_ids().await,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Agent Runs
/// =============================

async fn run_agent(
    State(state): State<ApiState>,
    Path(agent): Path<String>,
    Json(req): Json<RunRequest>,
) -> Reply {
    info!(agent = %agent, session_id = ?req.session_id, "Received run request");

    match state.engine.run(&agent, req.inputs.clone(), req.options()).await {
        Ok(result) => ok(RunSummary::from(&result)),
        Err(e) => failure(e),
    }
}

/// =============================
/// Decisions
/// =============================

async fn pending_decisions(
    State(state): State<ApiState>,
    Query(query): Query<DecisionQuery>,
) -> Reply {
    match state.engine.list_pending(query.agent_id.as_deref()).await {
        Ok(decisions) => ok(decisions),
        Err(e) => failure(e),
    }
}

async fn decision_history(
    State(state): State<ApiState>,
    Query(query): Query<DecisionQuery>,
) -> Reply {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match state.engine.history(query.agent_id.as_deref(), limit).await {
        Ok(decisions) => ok(decisions),
        Err(e) => failure(e),
    }
}

async fn get_decision(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Reply {
    match state.engine.get_decision(id).await {
        Ok(decision) => ok(decision),
        Err(e) => failure(e),
    }
}

async fn approve_decision(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ResolveRequest>>,
) -> Reply {
    let comment = body.and_then(|Json(b)| b.comment);
    match state.engine.approve(id, comment).await {
        Ok(resolution) => ok(resolution_view(&resolution)),
        Err(e) => failure(e),
    }
}

async fn reject_decision(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ResolveRequest>>,
) -> Reply {
    let comment = body.and_then(|Json(b)| b.comment);
    match state.engine.reject(id, comment).await {
        Ok(resolution) => ok(resolution_view(&resolution)),
        Err(e) => failure(e),
    }
}

/// =============================
/// Sessions
/// =============================

async fn set_autonomous(
    State(state): State<ApiState>,
    Path(session): Path<String>,
    Json(req): Json<AutonomousRequest>,
) -> Reply {
    if !req.enabled {
        // Runs read the flag at start; nothing pending changes.
        return ok(serde_json::json!({ "session_id": session, "enabled": false, "bypassed": [] }));
    }
    match state.engine.enable_autonomous_mode(&session).await {
        Ok(resolutions) => {
            let bypassed: Vec<Value> = resolutions.iter().map(resolution_view).collect();
            ok(serde_json::json!({ "session_id": session, "enabled": true, "bypassed": bypassed }))
        }
        Err(e) => failure(e),
    }
}

/// =============================
/// Audit
/// =============================

async fn audit_records(State(state): State<ApiState>, Path(agent): Path<String>) -> Reply {
    let audit = state.engine.audit();
    let records = match audit.read_records(&agent).await {
        Ok(records) => records,
        Err(e) => return failure(e),
    };
    let verified = records.iter().all(|r| audit.verify_integrity(r));
    ok(serde_json::json!({
        "agent_id": agent,
        "count": records.len(),
        "integrity_verified": verified,
        "records": records,
    }))
}

/// =============================
/// Router
/// =============================

pub fn create_router(engine: Arc<WorkflowEngine>) -> Router {
    let state = ApiState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/agents/:agent/run", post(run_agent))
        .route("/api/decisions/pending", get(pending_decisions))
        .route("/api/decisions/history", get(decision_history))
        .route("/api/decisions/:id", get(get_decision))
        .route("/api/decisions/:id/approve", post(approve_decision))
        .route("/api/decisions/:id/reject", post(reject_decision))
        .route("/api/sessions/:session/autonomous", post(set_autonomous))
        .route("/api/audit/:agent", get(audit_records))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    engine: Arc<WorkflowEngine>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(engine);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::engine;
    use crate::agents::PORTFOLIO_OPTIMIZER;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_run_approve_and_audit_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(Arc::new(engine(&dir).await));

        let (status, reply) = call(
            &router,
            "POST",
            "/api/agents/portfolio_optimizer/run",
            Some(serde_json::json!({
                "sessionId": "web",
                "inputs": {"budget": 250000, "risk_level": "Medium"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let data = &reply["data"];
        assert_eq!(data["status"], "awaiting_approval");
        let trace = data["reasoning_trace"].as_array().unwrap();
        assert_eq!(trace.len(), 5);
        assert!(trace[0].as_str().unwrap().starts_with("Analyze Inputs: budget $250000"));
        assert!(trace[4].as_str().unwrap().starts_with("Optimize Portfolio:"));
        let id = data["decision"]["id"].as_str().unwrap().to_string();

        let (_, pending) = call(&router, "GET", "/api/decisions/pending?agentId=portfolio_optimizer", None).await;
        assert_eq!(pending["data"].as_array().unwrap().len(), 1);

        let (status, reply) = call(
            &router,
            "POST",
            &format!("/api/decisions/{}/approve", id),
            Some(serde_json::json!({"comment": "fine"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let data = &reply["data"];
        assert_eq!(data["applied"], true);
        assert_eq!(data["decision"]["status"], "APPROVED");
        assert_eq!(data["outcome"]["status"], "completed");

        // second approval is a no-op
        let (_, reply) = call(&router, "POST", &format!("/api/decisions/{}/approve", id), None).await;
        assert_eq!(reply["data"]["applied"], false);

        let (_, reply) = call(&router, "GET", &format!("/api/audit/{}", PORTFOLIO_OPTIMIZER), None).await;
        let data = &reply["data"];
        assert_eq!(data["count"], 1);
        assert_eq!(data["integrity_verified"], true);
    }

    #[tokio::test]
    async fn test_autonomous_toggle_bypasses_session() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(Arc::new(engine(&dir).await));

        for _ in 0..2 {
            call(
                &router,
                "POST",
                "/api/agents/portfolio_optimizer/run",
                Some(serde_json::json!({"sessionId": "desk", "inputs": {"budget": 500000}})),
            )
            .await;
        }

        let (status, reply) = call(
            &router,
            "POST",
            "/api/sessions/desk/autonomous",
            Some(serde_json::json!({"enabled": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["data"]["bypassed"].as_array().unwrap().len(), 2);

        let (_, pending) = call(&router, "GET", "/api/decisions/pending", None).await;
        assert!(pending["data"].as_array().unwrap().is_empty());

        let (_, history) = call(&router, "GET", "/api/decisions/history?limit=1", None).await;
        let history = &history["data"];
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["status"], "BYPASSED");
    }

    #[tokio::test]
    async fn test_unknown_resources_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(Arc::new(engine(&dir).await));

        let (status, reply) = call(
            &router,
            "POST",
            "/api/agents/crystal_ball/run",
            Some(serde_json::json!({"inputs": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reply["success"], false);

        let (status, _) = call(&router, "GET", &format!("/api/decisions/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, health) = call(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["workflows"].as_array().unwrap().len(), 4);
    }
}
