//! Plugin code contract and module loading
//!
//! A plugin's code is a [`PluginFactory`]: given its [`PluginContext`] it
//! constructs a [`Plugin`] instance. Where the factory comes from is the
//! [`ModuleLoader`]'s business; the lifecycle manager only knows that it
//! asks for a fresh copy every time a plugin is loaded.
//!
//! # Example
//!
//! ```rust,ignore
//! use stagelight::plugins::{ModuleRegistry, Plugin, PluginContext};
//!
//! struct Soundboard;
//!
//! #[async_trait::async_trait]
//! impl Plugin for Soundboard {}
//!
//! let modules = ModuleRegistry::new();
//! modules.register_fn("soundboard", |ctx: PluginContext| {
//!     ctx.register_route("GET", "/api/soundboard/sounds", |_req| async {
//!         Ok(RouteResponse::ok(serde_json::json!([])))
//!     });
//!     Ok(Box::new(Soundboard))
//! });
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::context::PluginContext;
use super::manifest::PluginManifest;

/// A loaded plugin instance
///
/// Both hooks are optional; the defaults do nothing.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once after construction
    ///
    /// # Errors
    ///
    /// An error aborts the load and rolls back everything the plugin
    /// registered
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once before the plugin is unloaded
    ///
    /// # Errors
    ///
    /// Errors are logged; the unload proceeds regardless
    async fn destroy(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Constructor for a plugin instance
pub type PluginFactory =
    Arc<dyn Fn(PluginContext) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;

/// Source of plugin code
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Evaluate the plugin's entry and return its constructor
    ///
    /// # Errors
    ///
    /// Returns error if the entry cannot be evaluated or does not provide a
    /// constructor
    async fn load(&self, manifest: &PluginManifest, entry: &Path) -> anyhow::Result<PluginFactory>;

    /// Drop any cached copy of the entry so the next load sees fresh code
    fn evict(&self, _manifest: &PluginManifest, _entry: &Path) {}
}

/// In-process modules keyed by plugin id
///
/// Registering a factory under an id that already has one replaces it; the
/// replacement takes effect on the plugin's next load or reload.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, PluginFactory>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids = self.ids();
        ids.sort();
        f.debug_struct("ModuleRegistry").field("modules", &ids).finish()
    }
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide the code for plugin `id`
    pub fn register(&self, id: impl Into<String>, factory: PluginFactory) {
        let id = id.into();
        let replaced = self
            .modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), factory)
            .is_some();
        tracing::debug!(plugin_id = %id, replaced, "registered plugin module");
    }

    /// Provide the code for plugin `id` from a closure
    pub fn register_fn<F>(&self, id: impl Into<String>, factory: F)
    where
        F: Fn(PluginContext) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.register(id, Arc::new(factory));
    }

    /// Forget the code for plugin `id`
    pub fn unregister(&self, id: &str) -> bool {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Ids with registered code
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ModuleLoader for ModuleRegistry {
    async fn load(&self, manifest: &PluginManifest, entry: &Path) -> anyhow::Result<PluginFactory> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&manifest.id)
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no module registered for entry {}",
                    entry.display()
                )
            })
    }

    fn evict(&self, manifest: &PluginManifest, entry: &Path) {
        tracing::trace!(
            plugin_id = %manifest.id,
            entry = %entry.display(),
            "evicting cached module"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SettingsRepo, init_memory};
    use crate::router::StaleRoutePolicy;
    use crate::services::HostServices;

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {}

    fn manifest(id: &str) -> PluginManifest {
        let raw = serde_json::json!({"id": id, "name": id, "entry": "main.js"});
        serde_json::from_value(raw).unwrap()
    }

    fn context(id: &str) -> PluginContext {
        let services = HostServices::new(
            SettingsRepo::new(init_memory().unwrap()),
            StaleRoutePolicy::Retain,
        );
        PluginContext::new(id, Arc::new(services))
    }

    #[tokio::test]
    async fn default_hooks_are_noops() {
        let mut plugin = Noop;
        plugin.init().await.unwrap();
        plugin.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_module_fails_to_load() {
        let registry = ModuleRegistry::new();
        let err = registry
            .load(&manifest("ghost"), Path::new("/plugins/ghost/main.js"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("main.js"));
    }

    #[tokio::test]
    async fn registered_module_constructs_plugin() {
        let registry = ModuleRegistry::new();
        registry.register_fn("noop", |_ctx| Ok(Box::new(Noop)));

        let factory = registry
            .load(&manifest("noop"), Path::new("main.js"))
            .await
            .unwrap();
        assert!(factory(context("noop")).is_ok());

        assert!(registry.unregister("noop"));
        assert!(registry.ids().is_empty());
    }
}
