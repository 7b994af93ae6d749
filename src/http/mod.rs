//! Controller HTTP surface: the claim endpoint nodes race on, the webhook
//! and manual triggers, node registration and the operator-gated cleanup,
//! cancel and healthcheck tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::ingest::Ingestor;
use crate::registry::{constant_time_eq, NodeRegistry};
use crate::scheduler::{ClaimCoordinator, Janitor};

/// Header carrying the node identity on node-originated requests.
pub const NODE_ID_HEADER: &str = "X-IGLU-NODE-ID";

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<NodeRegistry>,
    pub coordinator: Arc<ClaimCoordinator>,
    pub ingestor: Arc<Ingestor>,
    pub janitor: Arc<Janitor>,
    pub operator_psk: String,
    pub healthcheck_wait: Duration,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/node/job/apply", post(apply_job))
        .route("/api/v1/node/job/update", post(update_job))
        .route("/api/v1/node/register", post(register_node))
        .route("/api/v1/node/healthcheck", get(node_healthcheck))
        .route("/api/v1/webhooks/builder/:hook", get(webhook_trigger))
        .route("/api/v1/builder/:id/run", post(run_builder))
        .route("/api/v1/job/:id/cancel", post(cancel_job))
        .route("/api/v1/tasks/cleanup", get(cleanup))
        .layer(cors)
        .with_state(state)
}

fn error_response(err: SchedulerError) -> Response {
    let (status, body) = match &err {
        SchedulerError::Unauthorized { cause } => (
            StatusCode::UNAUTHORIZED,
            match cause {
                Some(cause) => json!({"message": "Unauthorized", "cause": cause}),
                None => json!({"message": "Unauthorized"}),
            },
        ),
        SchedulerError::BadRequest(cause) => (
            StatusCode::BAD_REQUEST,
            json!({"message": "Bad Request", "cause": cause}),
        ),
        SchedulerError::NotAcceptable(_) => (
            StatusCode::NOT_ACCEPTABLE,
            json!({"message": "Not acceptable"}),
        ),
        SchedulerError::NotFound(what) => (StatusCode::NOT_FOUND, json!({"error": what})),
        SchedulerError::Gone(cause) => (
            StatusCode::GONE,
            json!({"message": "Internal Server Error", "cause": cause}),
        ),
        SchedulerError::Conflict(what) => (StatusCode::CONFLICT, json!({"error": what})),
        SchedulerError::Internal(what) => {
            (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": what}))
        }
        SchedulerError::Serde(_) | SchedulerError::Redis(_) => {
            tracing::error!(error = %err, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "Internal Server Error"}),
            )
        }
    };
    (status, Json(body)).into_response()
}

fn operator_authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    if state.operator_psk.is_empty() {
        return false;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| constant_time_eq(auth.as_bytes(), state.operator_psk.as_bytes()))
        .unwrap_or(false)
}

fn operator_unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"status": "error", "message": "Unauthorized"})),
    )
        .into_response()
}

/// A node applies to execute a queued job.
async fn apply_job(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    let node_id = headers.get(NODE_ID_HEADER).and_then(|v| v.to_str().ok());
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.coordinator.claim(node_id, authorization, &body).await {
        Ok(_) => Json(json!({})).into_response(),
        Err(e) => error_response(e),
    }
}

/// A node reports execution progress for a job it was awarded.
async fn update_job(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    let node_id = headers.get(NODE_ID_HEADER).and_then(|v| v.to_str().ok());
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state
        .coordinator
        .update_progress(node_id, authorization, &body)
        .await
    {
        Ok(()) => Json(json!({})).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct RegisterRequest {
    node_id: String,
    psk: String,
    #[serde(default)]
    arch: Vec<String>,
}

async fn register_node(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if !operator_authorized(&state, &headers) {
        return operator_unauthorized();
    }
    match state
        .registry
        .register(&req.node_id, &req.psk, req.arch)
        .await
    {
        Ok(()) => Json(json!({})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn node_healthcheck(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !operator_authorized(&state, &headers) {
        return operator_unauthorized();
    }
    match state.registry.health_sweep(state.healthcheck_wait).await {
        Ok(deregistered) => {
            tracing::debug!(
                deregistered = deregistered.len(),
                "Health check pass complete"
            );
            Json(json!({"status": "ok"})).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn webhook_trigger(State(state): State<ApiState>, Path(hook): Path<String>) -> Response {
    match state.ingestor.trigger_webhook(&hook).await {
        Ok((builder, job)) => {
            tracing::debug!(job_id = %job.id, "Published build job from webhook");
            Json(builder).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn run_builder(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.ingestor.trigger_manual(&id).await {
        Ok((_, job)) => Json(json!({"job_id": job.id})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !operator_authorized(&state, &headers) {
        return operator_unauthorized();
    }
    let Ok(job_id) = id.parse::<Uuid>() else {
        return error_response(SchedulerError::BadRequest("Invalid job ID"));
    };
    match state.coordinator.cancel(job_id).await {
        Ok(()) => Json(json!({})).into_response(),
        Err(e) => error_response(e),
    }
}

/// One janitor pass on demand.
async fn cleanup(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !operator_authorized(&state, &headers) {
        return operator_unauthorized();
    }
    match state.janitor.sweep().await {
        Ok(removed) => {
            tracing::debug!(removed, "Cleanup task removed stale queue entries");
            Json(json!({})).into_response()
        }
        Err(e) => error_response(e),
    }
}
