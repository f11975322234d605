//! HTTP surface of the workspace router daemon.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::router::engine;
use crate::router::state::{Diagnostics, ServiceRecord, Workspace, WorkspaceKind};
use crate::router::DaemonContext;
use crate::supervise::pid_alive;

type Ctx = State<Arc<DaemonContext>>;

/// Handler-level failure rendered as `{error}` JSON; never crashes the
/// daemon.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn build_router(ctx: Arc<DaemonContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workspaces", get(list_workspaces).post(add_local_workspace))
        .route("/workspaces/remote", post(add_remote_workspace))
        .route("/workspaces/:id", get(get_workspace))
        .route("/workspaces/:id/activate", post(activate_workspace))
        .route("/workspaces/:id/path", get(workspace_path))
        .route("/instances/:id/dispose", post(dispose_instance))
        .route("/shutdown", post(shutdown))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(ctx)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    ok: bool,
    daemon: Option<ServiceRecord>,
    engine: Option<ServiceRecord>,
    active_id: String,
    workspace_count: usize,
    #[serde(flatten)]
    diagnostics: Diagnostics,
}

async fn health(State(ctx): Ctx) -> Json<HealthResponse> {
    let state = ctx.store.snapshot().await;
    // A recorded process is only reported when its pid is still alive.
    let engine = state.engine.filter(|rec| pid_alive(rec.pid));
    Json(HealthResponse {
        ok: true,
        daemon: state.daemon,
        engine,
        active_id: state.active_workspace_id,
        workspace_count: state.workspaces.len(),
        diagnostics: state.diagnostics,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceListResponse {
    active_id: String,
    workspaces: Vec<Workspace>,
}

async fn list_workspaces(State(ctx): Ctx) -> Json<WorkspaceListResponse> {
    let state = ctx.store.snapshot().await;
    Json(WorkspaceListResponse {
        active_id: state.active_workspace_id,
        workspaces: state.workspaces,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddLocalRequest {
    path: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceResponse {
    active_id: String,
    workspace: Workspace,
}

async fn add_local_workspace(
    State(ctx): Ctx,
    Json(request): Json<AddLocalRequest>,
) -> Result<Json<WorkspaceResponse>, ApiError> {
    if request.path.trim().is_empty() {
        return Err(ApiError::bad_request("path must not be empty"));
    }
    let workspace = ctx
        .store
        .mutate(|state| state.upsert_local(&request.path, request.name.clone()))
        .await?;
    Ok(Json(WorkspaceResponse {
        active_id: workspace.id.clone(),
        workspace,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddRemoteRequest {
    base_url: String,
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

async fn add_remote_workspace(
    State(ctx): Ctx,
    Json(request): Json<AddRemoteRequest>,
) -> Result<Json<WorkspaceResponse>, ApiError> {
    if request.base_url.trim().is_empty() {
        return Err(ApiError::bad_request("baseUrl must not be empty"));
    }
    let workspace = ctx
        .store
        .mutate(|state| {
            state.upsert_remote(
                &request.base_url,
                request.directory.clone(),
                request.name.clone(),
            )
        })
        .await?;
    Ok(Json(WorkspaceResponse {
        active_id: workspace.id.clone(),
        workspace,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceOnlyResponse {
    workspace: Workspace,
}

async fn get_workspace(
    State(ctx): Ctx,
    Path(key): Path<String>,
) -> Result<Json<WorkspaceOnlyResponse>, ApiError> {
    let state = ctx.store.snapshot().await;
    let workspace = state
        .find(&key)
        .cloned()
        .ok_or_else(|| ApiError::not_found("workspace not found"))?;
    Ok(Json(WorkspaceOnlyResponse { workspace }))
}

async fn activate_workspace(
    State(ctx): Ctx,
    Path(key): Path<String>,
) -> Result<Json<WorkspaceResponse>, ApiError> {
    let activated = ctx.store.mutate(|state| state.activate(&key)).await?;
    let workspace = activated.ok_or_else(|| ApiError::not_found("workspace not found"))?;
    Ok(Json(WorkspaceResponse {
        active_id: workspace.id.clone(),
        workspace,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspacePathResponse {
    workspace: Workspace,
    path: String,
}

async fn workspace_path(
    State(ctx): Ctx,
    Path(key): Path<String>,
) -> Result<Json<WorkspacePathResponse>, ApiError> {
    let state = ctx.store.snapshot().await;
    let workspace = state
        .find(&key)
        .cloned()
        .ok_or_else(|| ApiError::not_found("workspace not found"))?;

    let path = match workspace.kind {
        WorkspaceKind::Local => {
            let directory = workspace
                .path
                .clone()
                .ok_or_else(|| ApiError::bad_request("workspace has no local path"))?;
            let base_url = engine::ensure_engine(&ctx).await?;
            engine::query_path(&ctx.http, &base_url, &directory).await?
        }
        WorkspaceKind::Remote => {
            let base_url = workspace
                .base_url
                .clone()
                .ok_or_else(|| ApiError::bad_request("workspace has no base URL"))?;
            let directory = workspace.directory.clone().unwrap_or_default();
            engine::query_path(&ctx.http, &base_url, &directory).await?
        }
    };

    Ok(Json(WorkspacePathResponse { workspace, path }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DisposeResponse {
    disposed: bool,
}

async fn dispose_instance(
    State(ctx): Ctx,
    Path(key): Path<String>,
) -> Result<Json<DisposeResponse>, ApiError> {
    let state = ctx.store.snapshot().await;
    let workspace = state
        .find(&key)
        .cloned()
        .ok_or_else(|| ApiError::not_found("workspace not found"))?;

    let disposed = match workspace.kind {
        WorkspaceKind::Local => {
            let directory = workspace
                .path
                .clone()
                .ok_or_else(|| ApiError::bad_request("workspace has no local path"))?;
            let engine_record = state
                .engine
                .filter(|rec| pid_alive(rec.pid))
                .ok_or_else(|| ApiError::bad_request("engine is not running"))?;
            engine::dispose_instance(&ctx.http, &engine_record.base_url, &directory).await?
        }
        WorkspaceKind::Remote => {
            let base_url = workspace
                .base_url
                .clone()
                .ok_or_else(|| ApiError::bad_request("workspace has no base URL"))?;
            let directory = workspace.directory.clone().unwrap_or_default();
            engine::dispose_instance(&ctx.http, &base_url, &directory).await?
        }
    };

    Ok(Json(DisposeResponse { disposed }))
}

async fn shutdown(State(ctx): Ctx) -> Json<serde_json::Value> {
    tracing::info!("Shutdown requested over HTTP");
    ctx.request_shutdown();
    Json(json!({ "ok": true }))
}

async fn not_found() -> ApiError {
    ApiError::not_found("not found")
}
