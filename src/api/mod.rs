//! HTTP surface of the gateway
//!
//! - `POST /api/vm/{start,save,shutdown,poweroff}?vmid=...` - queue a VM action
//! - `GET /api/vm/list?domain=...&username=...` - VMs owned by a user
//! - `GET /api/pool/status` - session pool counters
//! - `GET /metrics` - Prometheus exposition

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::command::{DispatchError, Dispatcher, Vm};
use crate::metrics;
use crate::session::PoolStats;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Deserialize)]
pub struct VmQuery {
    pub vmid: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub domain: String,
    pub username: String,
}

/// Dispatch failure rendered as a short plain-text response
#[derive(Debug)]
pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            DispatchError::TemplateUnavailable(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error: script not found.".to_string(),
            ),
            DispatchError::InvalidArgument(reason) => {
                (StatusCode::UNPROCESSABLE_ENTITY, reason.clone())
            }
            DispatchError::ServiceUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No SCVMM session available.".to_string(),
            ),
            DispatchError::UpstreamTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "SCVMM is not available now.".to_string(),
            ),
            DispatchError::UpstreamError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SCVMM-API internal error occured.".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, status = status.as_u16(), "Request failed");
        } else {
            tracing::info!(error = %self.0, status = status.as_u16(), "Request rejected");
        }

        (status, body).into_response()
    }
}

/// Create the gateway router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/vm/list", get(list_vms))
        .route("/api/vm/start", post(start_vm))
        .route("/api/vm/save", post(save_vm))
        .route("/api/vm/shutdown", post(shutdown_vm))
        .route("/api/vm/poweroff", post(poweroff_vm))
        .route("/api/pool/status", get(pool_status))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

async fn index() -> Redirect {
    Redirect::temporary("/api/pool/status")
}

async fn list_vms(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Vm>>, ApiError> {
    let domain = query.domain.to_uppercase();
    let username = query.username.to_lowercase();
    let vms = state.dispatcher.list_vms(&domain, &username).await?;
    Ok(Json(vms))
}

async fn start_vm(
    State(state): State<ApiState>,
    Query(query): Query<VmQuery>,
) -> Result<StatusCode, ApiError> {
    state.dispatcher.start_vm(&query.vmid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn save_vm(
    State(state): State<ApiState>,
    Query(query): Query<VmQuery>,
) -> Result<StatusCode, ApiError> {
    state.dispatcher.save_vm(&query.vmid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn shutdown_vm(
    State(state): State<ApiState>,
    Query(query): Query<VmQuery>,
) -> Result<StatusCode, ApiError> {
    state.dispatcher.shutdown_vm(&query.vmid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn poweroff_vm(
    State(state): State<ApiState>,
    Query(query): Query<VmQuery>,
) -> Result<StatusCode, ApiError> {
    state.dispatcher.poweroff_vm(&query.vmid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pool_status(State(state): State<ApiState>) -> Json<PoolStats> {
    Json(state.dispatcher.pool().stats())
}

async fn metrics_text() -> Response {
    match metrics::render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
