//! Admin API handlers.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use pane_core::new_widget_id;
use pane_state::{StateError, WidgetData, WidgetStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::AppState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_error(e: &StateError) -> axum::response::Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::AlreadyExists(_) => StatusCode::CONFLICT,
        e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Health ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct Health {
    backend: &'static str,
    worker_id: String,
    backend_reachable: bool,
    local_connections: usize,
}

/// GET /healthz
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let manager = state.dispatcher.manager();
    let reachable = manager.healthy().await;
    let health = Health {
        backend: manager.backend().as_str(),
        worker_id: manager.worker_id().to_string(),
        backend_reachable: reachable,
        local_connections: state.dispatcher.local_connections(),
    };
    let status = if reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, ApiResponse::ok(health)).into_response()
}

// ── Widgets ────────────────────────────────────────────────────

/// Create request body. The id is generated when absent.
#[derive(Deserialize)]
pub struct CreateWidget {
    #[serde(default)]
    pub widget_id: Option<String>,
    pub html: String,
    #[serde(default)]
    pub structure: Value,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// GET /api/v1/widgets
pub async fn list_widgets(State(state): State<AppState>) -> impl IntoResponse {
    match state.dispatcher.manager().widgets().list().await {
        Ok(ids) => ApiResponse::ok(ids).into_response(),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/widgets
pub async fn create_widget(
    State(state): State<AppState>,
    Json(req): Json<CreateWidget>,
) -> impl IntoResponse {
    let manager = state.dispatcher.manager();
    let widget_id = req.widget_id.unwrap_or_else(new_widget_id);
    let mut widget = WidgetData::new(widget_id, req.html).with_structure(req.structure);
    widget.config = req.config;
    widget.ttl_secs = req.ttl_secs;
    widget.owner_worker_id = Some(manager.worker_id().to_string());

    match manager.widgets().create(widget).await {
        Ok(created) => (StatusCode::CREATED, ApiResponse::ok(created)).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/widgets/{id}
pub async fn get_widget(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.manager().widgets().get(&id).await {
        Ok(widget) => ApiResponse::ok(widget).into_response(),
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/widgets/{id}
pub async fn delete_widget(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.manager().widgets().delete(&id).await {
        Ok(true) => {
            if let Err(e) = state.dispatcher.forget_widget(&id).await {
                warn!(widget_id = %id, error = %e, "failed to drop widget callbacks");
            }
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("widget not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => state_error(&e),
    }
}
