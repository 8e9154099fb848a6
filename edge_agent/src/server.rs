//! HTTP front end for the controller stub.
//!
//! Serves the agent endpoints (check, callback, join) plus a small control
//! surface for queuing operations and reading counters by hand.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::client::{AgentClient, JoinClient, CALLBACK_PATH, CHECK_PATH, JOIN_PATH};
use crate::error::AgentError;
use crate::plugin::Params;
use crate::protocol::{AgentCheckRequest, AgentJoinRequest, OperationResponse};
use crate::stub::StubController;

#[derive(Clone)]
pub struct StubState {
    pub controller: Arc<StubController>,
}

#[derive(Deserialize)]
struct QueueOperationRequest {
    plugin: String,
    operation: String,
    #[serde(default)]
    params: Params,
}

#[derive(Serialize)]
struct QueueOperationResponse {
    operation_id: String,
}

#[derive(Serialize)]
struct StubStats {
    checks: u64,
    callbacks: u64,
    responses: Vec<OperationResponse>,
}

pub fn create_router(state: StubState) -> Router {
    Router::new()
        .route(CHECK_PATH, post(agent_check))
        .route(CALLBACK_PATH, post(agent_callback))
        .route(JOIN_PATH, post(agent_join))
        .route("/stub/operations", post(queue_operation))
        .route("/stub/stats", get(stats))
        .with_state(state)
}

fn error_status(err: &AgentError) -> StatusCode {
    match err {
        AgentError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        AgentError::NotFound(_) => StatusCode::NOT_FOUND,
        AgentError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
        AgentError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        AgentError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AgentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[instrument(skip_all)]
async fn agent_check(
    State(state): State<StubState>,
    Json(request): Json<AgentCheckRequest>,
) -> impl IntoResponse {
    match state.controller.agent_check(request).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            warn!(error = %e, "check rejected");
            Err((error_status(&e), e.to_string()))
        }
    }
}

#[instrument(skip_all)]
async fn agent_callback(
    State(state): State<StubState>,
    Json(response): Json<OperationResponse>,
) -> impl IntoResponse {
    match state.controller.callback_agent_operation(response).await {
        Ok(()) => Ok(Json(serde_json::json!({}))),
        Err(e) => {
            warn!(error = %e, "callback rejected");
            Err((error_status(&e), e.to_string()))
        }
    }
}

#[instrument(skip_all)]
async fn agent_join(
    State(state): State<StubState>,
    Json(request): Json<AgentJoinRequest>,
) -> impl IntoResponse {
    match state.controller.agent_join(request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!(error = %e, "join rejected");
            Err((error_status(&e), e.to_string()))
        }
    }
}

async fn queue_operation(
    State(state): State<StubState>,
    Json(request): Json<QueueOperationRequest>,
) -> Json<QueueOperationResponse> {
    let operation_id = state
        .controller
        .queue_operation(&request.plugin, &request.operation, request.params);
    info!(%operation_id, plugin = %request.plugin, operation = %request.operation, "queued operation");
    Json(QueueOperationResponse { operation_id })
}

async fn stats(State(state): State<StubState>) -> Json<StubStats> {
    Json(StubStats {
        checks: state.controller.num_checks(),
        callbacks: state.controller.num_callbacks(),
        responses: state.controller.responses(),
    })
}

/// Serve the stub on `addr` until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, controller: Arc<StubController>, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed binding {}: {}", addr, e))?;
    serve_listener(listener, controller, shutdown).await
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    controller: Arc<StubController>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = create_router(StubState { controller });
    info!("controller stub listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("controller stub stopped");
    Ok(())
}
