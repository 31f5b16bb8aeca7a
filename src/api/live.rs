//! Live-event injection
//!
//! The bridge to the external live-event source posts each event here; it
//! is fanned out to every plugin subscribed to that event name.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use serde::Serialize;

use super::ApiState;

#[derive(Serialize)]
pub struct PublishResponse {
    pub delivered: usize,
}

/// Build live-event routes
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/{event}", post(publish_event))
        .with_state(state)
}

async fn publish_event(
    State(state): State<ApiState>,
    Path(event): Path<String>,
    data: Option<Json<serde_json::Value>>,
) -> Json<PublishResponse> {
    let data = data.map_or(serde_json::Value::Null, |Json(d)| d);
    let delivered = state.services().live.publish(&event, data).await;
    Json(PublishResponse { delivered })
}
