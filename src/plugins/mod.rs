//! Plugin runtime
//!
//! Plugins are discovered from `plugin.json` manifests in sub-directories of
//! the plugins root. Each loaded plugin receives a [`PluginContext`], its
//! only handle on host infrastructure, and is driven through its lifecycle by
//! the [`PluginManager`].

pub mod context;
pub mod discovery;
pub mod events;
pub mod manager;
pub mod manifest;
pub mod module;
pub mod state;

pub use context::{PluginContext, RegistrationSummary, RouteRecord};
pub use discovery::{discover_candidates, discover_plugins, find_plugin, read_manifest};
pub use events::{PluginEvent, PluginEventBus};
pub use manager::{LoadOutcome, LoadSummary, PluginInfo, PluginManager, PluginSummary};
pub use manifest::{MANIFEST_FILE, PluginManifest};
pub use module::{ModuleLoader, ModuleRegistry, Plugin, PluginFactory};
pub use state::{PersistedPluginState, PluginStateMap, PluginStateStore, STATE_FILE};
