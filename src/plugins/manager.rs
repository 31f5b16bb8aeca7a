//! Plugin lifecycle manager
//!
//! Owns the registry of loaded plugins and drives every transition:
//! discovery, batched loading, enable/disable, reload and delete. Each
//! operation on a given id is serialised by a per-id lock; operations on
//! different ids run concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt as _;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, broadcast};

use super::context::{PluginContext, RegistrationSummary, RouteRecord, panic_message};
use super::discovery::{discover_candidates, discover_plugins, find_plugin, read_manifest};
use super::events::{PluginEvent, PluginEventBus};
use super::manifest::PluginManifest;
use super::module::{ModuleLoader, Plugin, PluginFactory};
use super::state::{PluginStateStore, STATE_FILE, resolve_enabled};
use crate::config::PluginsConfig;
use crate::router::RouteInfo;
use crate::services::HostServices;
use crate::{Error, Result};

/// Result of a single load attempt that did not hard-fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOutcome {
    /// Plugin is now loaded
    Loaded,
    /// Plugin resolved to disabled; nothing was evaluated
    Disabled,
    /// No readable, valid manifest in the directory
    NoManifest,
    /// Manifest names an entry file that does not exist
    MissingEntry,
    /// Another directory already provides a loaded plugin with this id
    AlreadyLoaded,
}

/// Tally of a [`PluginManager::load_all_plugins`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub loaded: usize,
    pub disabled: usize,
    pub failed: usize,
}

/// Snapshot of a loaded plugin
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub manifest: PluginManifest,
    pub dir: PathBuf,
    pub loaded_at: DateTime<Utc>,
    pub registrations: RegistrationSummary,
    pub routes: Vec<RouteRecord>,
}

/// A discovered plugin with its resolved status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub dir: PathBuf,
    pub enabled: bool,
    pub loaded: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    pub reload_count: u32,
    pub last_reload: Option<DateTime<Utc>>,
}

struct LoadedPlugin {
    manifest: PluginManifest,
    dir: PathBuf,
    loaded_at: DateTime<Utc>,
    context: PluginContext,
    instance: Box<dyn Plugin>,
}

impl LoadedPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            manifest: self.manifest.clone(),
            dir: self.dir.clone(),
            loaded_at: self.loaded_at,
            registrations: self.context.summary(),
            routes: self.context.routes(),
        }
    }
}

/// Discover, load, and manage plugins
pub struct PluginManager {
    config: PluginsConfig,
    services: Arc<HostServices>,
    loader: Arc<dyn ModuleLoader>,
    state: PluginStateStore,
    plugins: RwLock<HashMap<String, LoadedPlugin>>,
    locks: IdLocks,
    events: PluginEventBus,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("dir", &self.config.dir)
            .field("loaded", &self.loaded_ids())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Create a manager for the plugins under `config.dir`
    ///
    /// Loads persisted state from `<dir>/plugins_state.json`. Nothing is
    /// discovered or loaded until [`Self::load_all_plugins`] runs.
    pub async fn new(
        config: PluginsConfig,
        services: Arc<HostServices>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Self {
        let state = PluginStateStore::open(config.dir.join(STATE_FILE)).await;
        Self {
            config,
            services,
            loader,
            state,
            plugins: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            events: PluginEventBus::new(),
        }
    }

    /// Discover every plugin and load them in bounded concurrent batches
    ///
    /// A failing plugin never stops its batch or the following batches.
    pub async fn load_all_plugins(&self) -> LoadSummary {
        let candidates = discover_candidates(&self.config.dir);
        let batch_size = self.config.batch_size.max(1);
        let mut summary = LoadSummary::default();

        tracing::info!(
            dir = %self.config.dir.display(),
            candidates = candidates.len(),
            batch_size,
            "loading plugins"
        );

        for batch in candidates.chunks(batch_size) {
            let results = join_all(batch.iter().map(|dir| self.load_plugin(dir))).await;

            for (dir, result) in batch.iter().zip(results) {
                match result {
                    Ok(LoadOutcome::Loaded) => summary.loaded += 1,
                    Ok(LoadOutcome::Disabled) => summary.disabled += 1,
                    Ok(outcome) => {
                        tracing::debug!(
                            path = %dir.display(),
                            outcome = ?outcome,
                            "plugin skipped"
                        );
                        summary.failed += 1;
                    }
                    Err(e) => {
                        tracing::error!(path = %dir.display(), error = %e, "plugin failed to load");
                        summary.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            loaded = summary.loaded,
            disabled = summary.disabled,
            failed = summary.failed,
            "plugin loading complete"
        );
        summary
    }

    /// Load the plugin in `dir`
    ///
    /// # Errors
    ///
    /// Returns [`Error::PluginLoad`] if the module cannot be evaluated, the
    /// plugin cannot be constructed, or its `init` hook fails or times out.
    /// Everything the plugin registered before failing is rolled back.
    pub async fn load_plugin(&self, dir: &Path) -> Result<LoadOutcome> {
        let Some(manifest) = read_manifest(dir).await else {
            return Ok(LoadOutcome::NoManifest);
        };

        let _guard = self.lock(&manifest.id).await;
        self.load_locked(dir, manifest).await
    }

    /// Unload a plugin; a plugin that is not loaded is a no-op
    ///
    /// Returns whether anything was unloaded.
    pub async fn unload_plugin(&self, id: &str) -> bool {
        let _guard = self.lock(id).await;
        self.unload_locked(id).await
    }

    /// Unload every loaded plugin, leaving persisted state untouched
    ///
    /// Used on shutdown so each plugin's `destroy` hook runs.
    pub async fn unload_all(&self) -> usize {
        let ids = self.loaded_ids();
        let results = join_all(ids.iter().map(|id| self.unload_plugin(id))).await;
        results.into_iter().filter(|unloaded| *unloaded).count()
    }

    /// Persist the plugin as enabled and load it if needed
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id, or the load failure.
    /// On a load failure the persisted state stays enabled.
    pub async fn enable_plugin(&self, id: &str) -> Result<()> {
        let _guard = self.lock(id).await;

        let located = self.locate(id).await;
        if located.is_none() && !self.is_plugin_loaded(id) {
            return Err(Error::NotFound(format!("plugin {id}")));
        }

        if self.state.set_enabled(id, true).await {
            self.events.publish(PluginEvent::Enabled { id: id.to_string() });
        }

        if self.is_plugin_loaded(id) {
            return Ok(());
        }

        let failure = match located {
            Some((dir, manifest)) => match self.load_locked(&dir, manifest).await {
                Ok(LoadOutcome::Loaded | LoadOutcome::AlreadyLoaded) => return Ok(()),
                Ok(outcome) => Error::plugin_load(id, format!("{outcome:?}")),
                Err(e) => e,
            },
            None => Error::NotFound(format!("plugin {id}")),
        };

        tracing::warn!(
            plugin_id = %id,
            error = %failure,
            "plugin is persisted as enabled but failed to load; \
             state and runtime diverge until it loads"
        );
        Err(failure)
    }

    /// Persist the plugin as disabled and unload it
    ///
    /// Idempotent: disabling a disabled or unloaded plugin succeeds and
    /// leaves the persisted state untouched. Unknown ids are ignored
    /// without touching the state file.
    pub async fn disable_plugin(&self, id: &str) {
        let _guard = self.lock(id).await;

        let known = self.is_plugin_loaded(id)
            || self.state.get(id).await.is_some()
            || self.locate(id).await.is_some();
        let changed = known && self.state.set_enabled(id, false).await;
        let unloaded = self.unload_locked(id).await;

        if changed || unloaded {
            self.events.publish(PluginEvent::Disabled { id: id.to_string() });
        }
    }

    /// Unload and load a plugin again with fresh code
    ///
    /// The reload counter is bumped and persisted before anything else, so
    /// it counts attempts whether or not the load succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id, or the load failure
    pub async fn reload_plugin(&self, id: &str) -> Result<LoadOutcome> {
        let _guard = self.lock(id).await;

        let located = self.locate(id).await;
        if located.is_none() && !self.is_plugin_loaded(id) {
            return Err(Error::NotFound(format!("plugin {id}")));
        }

        let enabled_if_new = located
            .as_ref()
            .is_none_or(|(_, manifest)| manifest.enabled.unwrap_or(true));
        let reload_count = self.state.record_reload(id, enabled_if_new).await;

        if reload_count > self.config.reload_warn_threshold {
            tracing::warn!(
                plugin_id = %id,
                reload_count,
                stale_routes = self.services.router.stale_count(),
                "plugin reloaded many times; every reload leaves stale route handlers behind, \
                 restart the process to reclaim them"
            );
        }

        self.unload_locked(id).await;

        let Some((dir, manifest)) = located else {
            return Err(Error::NotFound(format!("plugin {id} directory")));
        };
        let outcome = self.load_locked(&dir, manifest).await?;

        self.events.publish(PluginEvent::Reloaded {
            id: id.to_string(),
            reload_count,
        });
        Ok(outcome)
    }

    /// Unload a plugin and remove its directory, persisted state, and settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id, or an IO error if the
    /// directory cannot be removed
    pub async fn delete_plugin(&self, id: &str) -> Result<()> {
        let _guard = self.lock(id).await;

        let dir = match self.locate(id).await {
            Some((dir, _)) => Some(dir),
            None => self.loaded_dir(id),
        };
        if dir.is_none() && self.state.get(id).await.is_none() {
            return Err(Error::NotFound(format!("plugin {id}")));
        }

        self.unload_locked(id).await;

        if let Some(dir) = dir.filter(|d| d.exists()) {
            tokio::fs::remove_dir_all(&dir).await?;
            tracing::info!(plugin_id = %id, path = %dir.display(), "removed plugin directory");
        }

        self.state.remove(id).await;
        match self.services.settings.clear(id) {
            Ok(cleared) => tracing::debug!(plugin_id = %id, cleared, "cleared plugin settings"),
            Err(e) => {
                tracing::warn!(plugin_id = %id, error = %e, "failed to clear plugin settings");
            }
        }

        self.events.publish(PluginEvent::Deleted { id: id.to_string() });
        Ok(())
    }

    /// Snapshot of a loaded plugin
    #[must_use]
    pub fn get_plugin(&self, id: &str) -> Option<PluginInfo> {
        self.registry().get(id).map(LoadedPlugin::info)
    }

    /// Whether a plugin is currently loaded
    #[must_use]
    pub fn is_plugin_loaded(&self, id: &str) -> bool {
        self.registry().contains_key(id)
    }

    /// Resolved enabled flag for a plugin
    ///
    /// Persisted choice first, then the manifest default. Unknown plugins are
    /// reported as disabled.
    pub async fn is_plugin_enabled(&self, id: &str) -> bool {
        let persisted = self.state.get(id).await;
        if let Some(persisted) = &persisted {
            return persisted.enabled;
        }

        let manifest = self.registry().get(id).map(|p| p.manifest.clone());
        let manifest = match manifest {
            Some(manifest) => Some(manifest),
            None => self.locate(id).await.map(|(_, manifest)| manifest),
        };
        manifest.is_some_and(|m| resolve_enabled(None, &m))
    }

    /// Every loaded plugin, sorted by id
    #[must_use]
    pub fn loaded_plugins(&self) -> Vec<PluginInfo> {
        let mut plugins: Vec<PluginInfo> =
            self.registry().values().map(LoadedPlugin::info).collect();
        plugins.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        plugins
    }

    /// Every discovered plugin with its resolved status
    pub async fn list_plugins(&self) -> Vec<PluginSummary> {
        let discovered = discover_plugins(&self.config.dir).await;
        let state = self.state.snapshot().await;

        discovered
            .into_iter()
            .map(|(dir, manifest)| {
                let persisted = state.get(&manifest.id);
                let loaded = self.is_plugin_loaded(&manifest.id);
                PluginSummary {
                    enabled: resolve_enabled(persisted, &manifest),
                    loaded,
                    loaded_at: persisted.and_then(|s| s.loaded_at),
                    reload_count: persisted.map_or(0, |s| s.reload_count),
                    last_reload: persisted.and_then(|s| s.last_reload),
                    id: manifest.id,
                    name: manifest.name,
                    version: manifest.version,
                    description: manifest.description,
                    author: manifest.author,
                    kind: manifest.kind,
                    dir,
                }
            })
            .collect()
    }

    /// Routes a plugin registered, including stale ones
    #[must_use]
    pub fn plugin_routes(&self, id: &str) -> Vec<RouteInfo> {
        self.services.router.routes_for(id)
    }

    /// Receive lifecycle transitions published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    /// Lifecycle event bus
    #[must_use]
    pub const fn events(&self) -> &PluginEventBus {
        &self.events
    }

    /// Persisted plugin state
    #[must_use]
    pub const fn state(&self) -> &PluginStateStore {
        &self.state
    }

    /// Host services shared with every plugin
    #[must_use]
    pub const fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    /// Plugin runtime configuration
    #[must_use]
    pub const fn config(&self) -> &PluginsConfig {
        &self.config
    }

    async fn load_locked(&self, dir: &Path, manifest: PluginManifest) -> Result<LoadOutcome> {
        let id = manifest.id.clone();

        if self.is_plugin_loaded(&id) {
            tracing::warn!(
                plugin_id = %id,
                path = %dir.display(),
                "plugin with this id is already loaded, skipping"
            );
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        if !self.state.is_enabled(&manifest).await {
            tracing::info!(plugin_id = %id, "plugin disabled, skipping");
            return Ok(LoadOutcome::Disabled);
        }

        let entry = match manifest.entry_path(dir) {
            Some(entry) if tokio::fs::try_exists(&entry).await.unwrap_or(false) => entry,
            _ => {
                tracing::warn!(
                    plugin_id = %id,
                    entry = %manifest.entry,
                    "plugin entry file not found, skipping"
                );
                return Ok(LoadOutcome::MissingEntry);
            }
        };

        self.loader.evict(&manifest, &entry);
        let factory = self
            .loader
            .load(&manifest, &entry)
            .await
            .map_err(|e| Error::plugin_load(&id, format!("{e:#}")))?;

        let context = PluginContext::new(&id, Arc::clone(&self.services));
        let mut instance = match construct(&factory, context.clone()) {
            Ok(instance) => instance,
            Err(reason) => {
                self.roll_back(&context);
                return Err(Error::plugin_load(&id, format!("construction failed: {reason}")));
            }
        };

        if let Err(reason) = run_hook(instance.init(), self.config.hook_timeout).await {
            self.roll_back(&context);
            return Err(Error::plugin_load(&id, format!("init failed: {reason}")));
        }

        let loaded_at = Utc::now();
        self.state.mark_loaded(&id, loaded_at).await;

        tracing::info!(
            plugin_id = %id,
            name = %manifest.name,
            version = %manifest.version,
            routes = context.summary().routes,
            "loaded plugin"
        );

        self.registry_mut().insert(
            id.clone(),
            LoadedPlugin {
                manifest,
                dir: dir.to_path_buf(),
                loaded_at,
                context,
                instance,
            },
        );

        self.events.publish(PluginEvent::Loaded { id });
        Ok(LoadOutcome::Loaded)
    }

    async fn unload_locked(&self, id: &str) -> bool {
        let removed = self.registry_mut().remove(id);
        let Some(mut plugin) = removed else {
            tracing::debug!(plugin_id = %id, "plugin not loaded, nothing to unload");
            return false;
        };

        if let Err(reason) = run_hook(plugin.instance.destroy(), self.config.hook_timeout).await {
            tracing::warn!(
                plugin_id = %id,
                error = %reason,
                "plugin destroy hook failed, unloading anyway"
            );
        }

        self.release(&plugin.context);
        tracing::info!(plugin_id = %id, "unloaded plugin");

        self.events.publish(PluginEvent::Unloaded { id: id.to_string() });
        true
    }

    /// Remove everything `context` registered from the host subsystems
    fn release(&self, context: &PluginContext) {
        context.unregister_all();
        self.purge_owner(context.plugin_id());
    }

    /// Undo a load that failed part-way, dropping its routes outright
    fn roll_back(&self, context: &PluginContext) {
        context.rollback();
        self.purge_owner(context.plugin_id());
    }

    fn purge_owner(&self, id: &str) {
        let subscriptions = self.services.live.unsubscribe_owner(id);
        let actions = self.services.actions.unregister_owner(id);
        tracing::debug!(plugin_id = %id, subscriptions, actions, "released plugin registrations");
    }

    async fn locate(&self, id: &str) -> Option<(PathBuf, PluginManifest)> {
        find_plugin(&self.config.dir, id).await
    }

    fn loaded_dir(&self, id: &str) -> Option<PathBuf> {
        self.registry().get(id).map(|p| p.dir.clone())
    }

    fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn lock(&self, id: &str) -> IdGuard<'_> {
        let lock = Arc::clone(
            self.locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(id.to_string())
                .or_default(),
        );
        let guard = Arc::clone(&lock).lock_owned().await;
        IdGuard {
            locks: &self.locks,
            id: id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, LoadedPlugin>> {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, LoadedPlugin>> {
        self.plugins.write().unwrap_or_else(PoisonError::into_inner)
    }
}

type IdLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Held for the duration of one lifecycle operation on an id
///
/// The id's entry is dropped from the lock map once no other operation
/// holds or waits on it.
struct IdGuard<'a> {
    locks: &'a IdLocks,
    id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = locks
            .get(&self.id)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2);
        if idle {
            locks.remove(&self.id);
        }
    }
}

fn construct(
    factory: &PluginFactory,
    context: PluginContext,
) -> std::result::Result<Box<dyn Plugin>, String> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| factory(context))) {
        Ok(Ok(instance)) => Ok(instance),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

/// Run a lifecycle hook under `timeout`, folding errors and panics into a message
async fn run_hook<F>(hook: F, timeout: Duration) -> std::result::Result<(), String>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(hook).catch_unwind()).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(format!("{e:#}")),
        Ok(Err(payload)) => Err(panic_message(payload.as_ref())),
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs_f64())),
    }
}
