//! Real-time pub/sub hub
//!
//! Tracks connected clients and the event listeners attached to each one.
//! Plugin listeners are attached to every connection present at registration
//! time and to every connection that arrives later, and can be detached per
//! owner. The websocket transport (`api::websocket`) feeds incoming frames in
//! through [`RealtimeHub::dispatch`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Event name used to report a failing plugin listener back to the client
pub const PLUGIN_ERROR_EVENT: &str = "plugin:error";

/// Wire frame in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RealtimeFrame {
    /// Build a frame
    #[must_use]
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Outbound half of one client connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: String,
    tx: mpsc::Sender<RealtimeFrame>,
}

impl ConnectionHandle {
    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a frame for this connection, returning false if it is gone or full
    pub fn send(&self, event: impl Into<String>, data: serde_json::Value) -> bool {
        self.tx.try_send(RealtimeFrame::new(event, data)).is_ok()
    }
}

/// Type-erased, already error-wrapped listener
pub type RealtimeHandler =
    Arc<dyn Fn(ConnectionHandle, serde_json::Value) -> BoxFuture<'static, ()> + Send + Sync>;

struct Listener {
    id: u64,
    owner: String,
    event: String,
    handler: RealtimeHandler,
}

struct Connection {
    handle: ConnectionHandle,
    listeners: Vec<Arc<Listener>>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, Connection>,
    registrations: Vec<Arc<Listener>>,
}

/// Connected clients and their attached listeners
#[derive(Default)]
pub struct RealtimeHub {
    state: RwLock<HubState>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for RealtimeHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("RealtimeHub")
            .field("connections", &state.connections.len())
            .field("registrations", &state.registrations.len())
            .finish()
    }
}

impl RealtimeHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and attach every current listener to it
    pub fn connect(&self, tx: mpsc::Sender<RealtimeFrame>) -> ConnectionHandle {
        let handle = ConnectionHandle {
            id: uuid::Uuid::new_v4().to_string(),
            tx,
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let listeners = state.registrations.clone();
        state.connections.insert(
            handle.id.clone(),
            Connection {
                handle: handle.clone(),
                listeners,
            },
        );
        drop(state);

        tracing::debug!(connection_id = %handle.id, "realtime client connected");
        handle
    }

    /// Forget a connection
    pub fn disconnect(&self, connection_id: &str) {
        let removed = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .remove(connection_id);

        if removed.is_some() {
            tracing::debug!(connection_id = %connection_id, "realtime client disconnected");
        }
    }

    /// Store a listener and attach it to every connected client
    pub fn register(&self, owner: &str, event: &str, handler: RealtimeHandler) {
        let listener = Arc::new(Listener {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            owner: owner.to_string(),
            event: event.to_string(),
            handler,
        });

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for conn in state.connections.values_mut() {
            conn.listeners.push(Arc::clone(&listener));
        }
        state.registrations.push(listener);
    }

    /// Detach every listener `owner` registered, from every connection
    ///
    /// Returns the number of registrations removed.
    pub fn unregister_owner(&self, owner: &str) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.registrations.len();
        state.registrations.retain(|l| l.owner != owner);
        for conn in state.connections.values_mut() {
            conn.listeners.retain(|l| l.owner != owner);
        }
        before - state.registrations.len()
    }

    /// Deliver an incoming frame to the listeners attached to its connection
    ///
    /// Returns the number of listeners invoked.
    pub async fn dispatch(&self, connection_id: &str, frame: RealtimeFrame) -> usize {
        let targets: Vec<(ConnectionHandle, RealtimeHandler, u64)> = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let Some(conn) = state.connections.get(connection_id) else {
                return 0;
            };
            conn.listeners
                .iter()
                .filter(|l| l.event == frame.event)
                .map(|l| (conn.handle.clone(), Arc::clone(&l.handler), l.id))
                .collect()
        };

        for (handle, handler, id) in &targets {
            tracing::trace!(event = %frame.event, listener = id, "dispatching realtime event");
            handler(handle.clone(), frame.data.clone()).await;
        }

        targets.len()
    }

    /// Send a frame to every connected client
    ///
    /// Returns the number of clients the frame was queued for.
    pub fn broadcast(&self, event: &str, data: &serde_json::Value) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .connections
            .values()
            .filter(|conn| conn.handle.send(event, data.clone()))
            .count()
    }

    /// Number of connected clients
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .len()
    }

    /// Number of listeners attached to a connection
    #[must_use]
    pub fn listener_count(&self, connection_id: &str) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .get(connection_id)
            .map_or(0, |c| c.listeners.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> RealtimeHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_conn, _data| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn listeners_attach_to_current_and_future_connections() {
        let hub = RealtimeHub::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let early = hub.connect(tx1);

        let counter = Arc::new(AtomicUsize::new(0));
        hub.register("p", "ping", counting(&counter));

        let (tx2, _rx2) = mpsc::channel(8);
        let late = hub.connect(tx2);

        assert_eq!(hub.listener_count(early.id()), 1);
        assert_eq!(hub.listener_count(late.id()), 1);

        hub.dispatch(early.id(), RealtimeFrame::new("ping", json!(null))).await;
        hub.dispatch(late.id(), RealtimeFrame::new("ping", json!(null))).await;
        hub.dispatch(late.id(), RealtimeFrame::new("other", json!(null))).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unregister_owner_detaches_everywhere() {
        let hub = RealtimeHub::new();
        let (tx, _rx) = mpsc::channel(8);
        let conn = hub.connect(tx);

        let counter = Arc::new(AtomicUsize::new(0));
        hub.register("a", "ping", counting(&counter));
        hub.register("b", "ping", counting(&counter));

        assert_eq!(hub.unregister_owner("a"), 1);
        assert_eq!(hub.listener_count(conn.id()), 1);

        hub.dispatch(conn.id(), RealtimeFrame::new("ping", json!(null))).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let hub = RealtimeHub::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        hub.connect(tx1);
        let second = hub.connect(tx2);

        assert_eq!(hub.broadcast("score", &json!({"points": 3})), 2);
        assert_eq!(rx1.recv().await.unwrap().data["points"], 3);
        assert_eq!(rx2.recv().await.unwrap().event, "score");

        hub.disconnect(second.id());
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn dispatch_to_unknown_connection_is_noop() {
        let hub = RealtimeHub::new();
        assert_eq!(hub.dispatch("missing", RealtimeFrame::new("x", json!(1))).await, 0);
    }
}
