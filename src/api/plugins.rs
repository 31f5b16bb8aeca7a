//! Plugin management REST endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;

use super::{ApiState, OperationResponse, status_for};
use crate::plugins::{PluginSummary, RegistrationSummary};
use crate::router::RouteInfo;

/// One plugin with its routes
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDetailResponse {
    #[serde(flatten)]
    pub plugin: PluginSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registrations: Option<RegistrationSummary>,
    pub routes: Vec<RouteInfo>,
}

/// Build plugin management routes
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(list_plugins))
        .route("/{id}", get(get_plugin).delete(delete_plugin))
        .route("/{id}/enable", post(enable_plugin))
        .route("/{id}/disable", post(disable_plugin))
        .route("/{id}/reload", post(reload_plugin))
        .with_state(state)
}

type Operation = (StatusCode, Json<OperationResponse>);

fn outcome(result: crate::Result<()>) -> Operation {
    match result {
        Ok(()) => (StatusCode::OK, Json(OperationResponse::ok())),
        Err(e) => (status_for(&e), Json(OperationResponse::failed(e.to_string()))),
    }
}

/// List every discovered plugin
async fn list_plugins(State(state): State<ApiState>) -> Json<Vec<PluginSummary>> {
    Json(state.manager.list_plugins().await)
}

/// One plugin with its routes
async fn get_plugin(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<PluginDetailResponse>, Operation> {
    let plugin = state
        .manager
        .list_plugins()
        .await
        .into_iter()
        .find(|p| p.id == id)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(OperationResponse::failed(format!("plugin {id} not found"))),
            )
        })?;

    Ok(Json(PluginDetailResponse {
        registrations: state.manager.get_plugin(&id).map(|p| p.registrations),
        routes: state.manager.plugin_routes(&id),
        plugin,
    }))
}

/// Enable and load a plugin
async fn enable_plugin(State(state): State<ApiState>, Path(id): Path<String>) -> Operation {
    outcome(state.manager.enable_plugin(&id).await)
}

/// Disable and unload a plugin
async fn disable_plugin(State(state): State<ApiState>, Path(id): Path<String>) -> Operation {
    state.manager.disable_plugin(&id).await;
    outcome(Ok(()))
}

/// Reload a plugin with fresh code
async fn reload_plugin(State(state): State<ApiState>, Path(id): Path<String>) -> Operation {
    outcome(state.manager.reload_plugin(&id).await.map(|_| ()))
}

/// Remove a plugin from disk
async fn delete_plugin(State(state): State<ApiState>, Path(id): Path<String>) -> Operation {
    outcome(state.manager.delete_plugin(&id).await)
}
