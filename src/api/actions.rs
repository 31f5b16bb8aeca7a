//! Automation action endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};

use super::ApiState;
use crate::actions::{ActionInfo, ActionResult};

/// Build action routes
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(list_actions))
        .route("/{name}", post(execute_action))
        .with_state(state)
}

/// Registered actions with their owners
async fn list_actions(State(state): State<ApiState>) -> Json<Vec<ActionInfo>> {
    Json(state.services().actions.list())
}

/// Run an action; the request body is its params
async fn execute_action(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    params: Option<Json<serde_json::Value>>,
) -> (StatusCode, Json<ActionResult>) {
    let actions = &state.services().actions;
    if !actions.list().iter().any(|a| a.name == name) {
        return (
            StatusCode::NOT_FOUND,
            Json(ActionResult::failed(format!("unknown action: {name}"))),
        );
    }

    let params = params.map_or(serde_json::Value::Null, |Json(p)| p);
    let result = actions.execute(&name, params).await;
    tracing::debug!(action = %name, success = result.success, "executed action");
    (StatusCode::OK, Json(result))
}
