//! HTTP surface: ingest publish hooks and the relay control API.
//!
//! - `POST /hooks/publish`, `POST /hooks/unpublish` - ingest server callbacks
//!   (form fields `app` + `name`, or `path`). Always answered with `200` so
//!   the ingest server never rejects a publish because of relay state.
//! - `GET /api/status` - status of every destination.
//! - `POST /api/relays/start`, `POST /api/relays/stop` - all destinations.
//! - `POST /api/relays/{id}/start`, `POST /api/relays/{id}/stop`.
//! - `GET /api/relays/{id}/diagnostics` - recent relay output.
//! - `GET /health`

use axum::extract::rejection::FormRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use crate::ingest::IngestEvent;
use crate::supervisor::{DestinationStatus, SupervisorError, SupervisorHandle};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: SupervisorHandle,
}

pub fn build_router(supervisor: SupervisorHandle) -> Router {
    Router::new()
        .route("/hooks/publish", post(on_publish))
        .route("/hooks/unpublish", post(on_unpublish))
        .route("/api/status", get(status))
        .route("/api/relays/start", post(start_all))
        .route("/api/relays/stop", post(stop_all))
        .route("/api/relays/{id}/start", post(start_one))
        .route("/api/relays/{id}/stop", post(stop_one))
        .route("/api/relays/{id}/diagnostics", get(diagnostics))
        .route("/health", get(health))
        .with_state(AppState { supervisor })
}

/// Publish hook payload. nginx-rtmp sends `app` and `name`; other ingest
/// servers send the full `path`.
#[derive(Debug, Default, Deserialize)]
pub struct PublishHook {
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl PublishHook {
    /// Reported stream path; empty when the hook carried none.
    pub fn stream_path(&self) -> String {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if let Some(path) = non_empty(&self.path) {
            return path;
        }
        match (non_empty(&self.app), non_empty(&self.name)) {
            (Some(app), Some(name)) => format!("/{}/{name}", app.trim_matches('/')),
            (None, Some(name)) => name,
            _ => String::new(),
        }
    }
}

fn hook_path(form: Result<Form<PublishHook>, FormRejection>) -> String {
    match form {
        Ok(Form(hook)) => hook.stream_path(),
        Err(e) => {
            warn!(error = %e, "Malformed publish hook, treating as missing stream path");
            String::new()
        }
    }
}

async fn on_publish(
    State(state): State<AppState>,
    form: Result<Form<PublishHook>, FormRejection>,
) -> StatusCode {
    let stream_path = hook_path(form);
    if let Err(e) = state
        .supervisor
        .ingest(IngestEvent::PublishStarted { stream_path })
        .await
    {
        error!(error = %e, "Publish notification could not be handled");
    }
    StatusCode::OK
}

async fn on_unpublish(
    State(state): State<AppState>,
    form: Result<Form<PublishHook>, FormRejection>,
) -> StatusCode {
    let stream_path = hook_path(form);
    if let Err(e) = state
        .supervisor
        .ingest(IngestEvent::PublishEnded { stream_path })
        .await
    {
        error!(error = %e, "Unpublish notification could not be handled");
    }
    StatusCode::OK
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    active: usize,
    destinations: Vec<DestinationStatus>,
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let destinations = state.supervisor.status().await?;
    let active = destinations.iter().filter(|d| d.state.is_active()).count();
    Ok(Json(StatusResponse {
        active,
        destinations,
    }))
}

async fn start_all(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let started = state.supervisor.start_all().await?;
    Ok(Json(json!({ "started": started })))
}

async fn stop_all(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stopped = state.supervisor.stop_all().await?;
    Ok(Json(json!({ "stopped": stopped })))
}

async fn start_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = state.supervisor.start_one(&id).await?;
    Ok(Json(json!({ "destination": id, "started": started })))
}

async fn stop_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stopped = state.supervisor.stop_one(&id).await?;
    Ok(Json(json!({ "destination": id, "stopped": stopped })))
}

async fn diagnostics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    state
        .supervisor
        .diagnostics(&id)
        .await?
        .map(Json)
        .ok_or(ApiError(SupervisorError::UnknownDestination { id }))
}

async fn health() -> &'static str {
    "ok"
}

/// Supervisor error rendered as a JSON response.
struct ApiError(SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SupervisorError::UnknownDestination { .. } => StatusCode::NOT_FOUND,
            SupervisorError::Disabled { .. } | SupervisorError::MissingCredential { .. } => {
                StatusCode::CONFLICT
            }
            SupervisorError::Spawn { .. } => StatusCode::BAD_GATEWAY,
            SupervisorError::ShuttingDown | SupervisorError::Unavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
