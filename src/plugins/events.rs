//! Plugin lifecycle notifications
//!
//! Transitions are published on a broadcast channel; collaborators (the
//! realtime bridge, admin UIs, tests) subscribe without the manager knowing
//! about them. Publishing never blocks and never fails the transition.

use serde::Serialize;
use tokio::sync::broadcast;

/// Buffered transitions per subscriber before the slowest one starts lagging
const BUS_CAPACITY: usize = 64;

/// A plugin state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginEvent {
    Loaded { id: String },
    Unloaded { id: String },
    Enabled { id: String },
    Disabled { id: String },
    Reloaded { id: String, reload_count: u32 },
    Deleted { id: String },
}

impl PluginEvent {
    /// Plugin the event is about
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        match self {
            Self::Loaded { id }
            | Self::Unloaded { id }
            | Self::Enabled { id }
            | Self::Disabled { id }
            | Self::Reloaded { id, .. }
            | Self::Deleted { id } => id,
        }
    }
}

/// Broadcast bus for [`PluginEvent`]s
#[derive(Debug, Clone)]
pub struct PluginEventBus {
    tx: broadcast::Sender<PluginEvent>,
}

impl Default for PluginEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginEventBus {
    /// Create a bus with no subscribers
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Receive every transition published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.tx.subscribe()
    }

    /// Publish a transition
    pub fn publish(&self, event: PluginEvent) {
        tracing::debug!(plugin_id = %event.plugin_id(), event = ?event, "plugin transition");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}
