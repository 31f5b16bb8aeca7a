//! WebSocket transport for the realtime hub
//!
//! Frames are `{"event": ..., "data": ...}` in both directions. Each socket
//! is registered with the [`RealtimeHub`](crate::realtime::RealtimeHub), which
//! attaches every plugin listener to it.

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};

use super::ApiState;
use crate::plugins::PluginManager;
use crate::realtime::RealtimeFrame;

/// Event sent to a client right after it connects
pub const CONNECTED_EVENT: &str = "connected";

/// Event carrying plugin lifecycle transitions to every client
pub const LIFECYCLE_EVENT: &str = "plugin:lifecycle";

/// Outbound frames buffered per connection
const CONNECTION_BUFFER: usize = 32;

/// Build WebSocket router
pub fn router(state: ApiState) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<ApiState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: ApiState) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<RealtimeFrame>(CONNECTION_BUFFER);
    let hub = &state.services().realtime;
    let conn = hub.connect(tx);
    let connection_id = conn.id().to_string();

    conn.send(
        CONNECTED_EVENT,
        serde_json::json!({ "connectionId": connection_id }),
    );
    tracing::info!(connection_id = %connection_id, "WebSocket connected");

    // Forward queued frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&frame) {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Handle incoming frames
    let recv_state = state.clone();
    let recv_id = connection_id.clone();
    let mut recv_task = tokio::spawn(async move {
        let hub = &recv_state.services().realtime;
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<RealtimeFrame>(text.as_str()) {
                    Ok(frame) => {
                        let handled = hub.dispatch(&recv_id, frame).await;
                        tracing::trace!(
                            connection_id = %recv_id,
                            handled,
                            "dispatched realtime frame"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(
                            connection_id = %recv_id,
                            error = %e,
                            "invalid realtime frame"
                        );
                        conn.send("error", serde_json::json!({ "error": "invalid frame" }));
                    }
                },
                Message::Ping(data) => {
                    // axum answers pings itself
                    tracing::trace!(len = data.len(), "received ping");
                }
                Message::Close(_) => {
                    tracing::info!(connection_id = %recv_id, "WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.disconnect(&connection_id);
    tracing::info!(connection_id = %connection_id, "WebSocket disconnected");
}

/// Broadcast every plugin lifecycle transition to realtime clients
///
/// Runs until the manager's event bus closes; abort the handle to stop early.
pub fn forward_lifecycle_events(manager: &PluginManager) -> tokio::task::JoinHandle<()> {
    let mut events = manager.subscribe();
    let services = std::sync::Arc::clone(manager.services());

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_value(&event) {
                    Ok(data) => {
                        services.realtime.broadcast(LIFECYCLE_EVENT, &data);
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize lifecycle event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "lifecycle bridge lagged, transitions dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
