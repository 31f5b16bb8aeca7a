//! Shared host infrastructure handed to every capability surface

use std::sync::Arc;

use crate::actions::ActionRegistry;
use crate::db::SettingsRepo;
use crate::live::LiveEventHub;
use crate::realtime::RealtimeHub;
use crate::router::{PluginRouter, StaleRoutePolicy};

/// Host-side subsystems plugins reach through their [`PluginContext`]
///
/// Plugins never hold this directly.
///
/// [`PluginContext`]: crate::plugins::PluginContext
#[derive(Debug)]
pub struct HostServices {
    /// Shared plugin route table
    pub router: Arc<PluginRouter>,
    /// Real-time client connections
    pub realtime: RealtimeHub,
    /// External live-event fan-out
    pub live: LiveEventHub,
    /// Automation actions
    pub actions: ActionRegistry,
    /// Per-plugin settings
    pub settings: SettingsRepo,
}

impl HostServices {
    /// Assemble the host services around a settings store
    #[must_use]
    pub fn new(settings: SettingsRepo, stale_routes: StaleRoutePolicy) -> Self {
        Self {
            router: Arc::new(PluginRouter::new(stale_routes)),
            realtime: RealtimeHub::new(),
            live: LiveEventHub::new(),
            actions: ActionRegistry::new(),
            settings,
        }
    }
}
