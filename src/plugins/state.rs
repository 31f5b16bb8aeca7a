//! Persisted plugin state (`plugins_state.json`)
//!
//! The administrator's explicit enable/disable choices and reload history,
//! kept across restarts. The whole file is rewritten on every mutation. A
//! write failure is logged and the in-memory map stays authoritative for the
//! running process.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::manifest::PluginManifest;

/// State file name inside the plugins root
pub const STATE_FILE: &str = "plugins_state.json";

/// Persisted entry for one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPluginState {
    pub enabled: bool,
    #[serde(default)]
    pub loaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reload_count: u32,
    #[serde(default)]
    pub last_reload: Option<DateTime<Utc>>,
}

impl PersistedPluginState {
    const fn with_enabled(enabled: bool) -> Self {
        Self {
            enabled,
            loaded_at: None,
            reload_count: 0,
            last_reload: None,
        }
    }
}

/// Plugin id → persisted entry
pub type PluginStateMap = BTreeMap<String, PersistedPluginState>;

/// Resolve a plugin's enabled flag
///
/// An explicit persisted choice wins over the manifest default; with
/// neither, plugins are enabled.
#[must_use]
pub fn resolve_enabled(
    persisted: Option<&PersistedPluginState>,
    manifest: &PluginManifest,
) -> bool {
    persisted
        .map(|s| s.enabled)
        .or(manifest.enabled)
        .unwrap_or(true)
}

/// Durable store for [`PluginStateMap`]
#[derive(Debug)]
pub struct PluginStateStore {
    path: PathBuf,
    state: Mutex<PluginStateMap>,
}

impl PluginStateStore {
    /// Open the store at `path`, loading whatever is there
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load(&path).await;
        tracing::debug!(path = %path.display(), plugins = state.len(), "loaded plugin state");
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Location of the state file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted entry for a plugin
    pub async fn get(&self, id: &str) -> Option<PersistedPluginState> {
        self.state.lock().await.get(id).cloned()
    }

    /// Copy of the whole map
    pub async fn snapshot(&self) -> PluginStateMap {
        self.state.lock().await.clone()
    }

    /// Enabled flag for `manifest` under the resolution rule
    pub async fn is_enabled(&self, manifest: &PluginManifest) -> bool {
        resolve_enabled(self.state.lock().await.get(&manifest.id), manifest)
    }

    /// Persist an explicit enabled choice
    ///
    /// Returns whether anything changed; an unchanged value is not rewritten.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut state = self.state.lock().await;
        if state.get(id).is_some_and(|s| s.enabled == enabled) {
            return false;
        }

        state
            .entry(id.to_string())
            .and_modify(|s| s.enabled = enabled)
            .or_insert_with(|| PersistedPluginState::with_enabled(enabled));
        save(&self.path, &state).await;
        true
    }

    /// Persist a successful load
    pub async fn mark_loaded(&self, id: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let entry = state
            .entry(id.to_string())
            .or_insert_with(|| PersistedPluginState::with_enabled(true));
        entry.enabled = true;
        entry.loaded_at = Some(at);
        save(&self.path, &state).await;
    }

    /// Bump and persist the reload counter, returning the new count
    ///
    /// `enabled_if_new` seeds the entry when the plugin has none yet.
    pub async fn record_reload(&self, id: &str, enabled_if_new: bool) -> u32 {
        let mut state = self.state.lock().await;
        let entry = state
            .entry(id.to_string())
            .or_insert_with(|| PersistedPluginState::with_enabled(enabled_if_new));
        entry.reload_count = entry.reload_count.saturating_add(1);
        entry.last_reload = Some(Utc::now());
        let count = entry.reload_count;
        save(&self.path, &state).await;
        count
    }

    /// Drop a plugin's entry
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.remove(id).is_none() {
            return false;
        }
        save(&self.path, &state).await;
        true
    }
}

/// Read the state file
///
/// A missing file is an empty map; a corrupt one is an empty map plus a
/// warning.
pub async fn load(path: &Path) -> PluginStateMap {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PluginStateMap::new(),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read plugin state, using manifest defaults"
            );
            return PluginStateMap::new();
        }
    };

    serde_json::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "corrupt plugin state file, using manifest defaults"
        );
        PluginStateMap::new()
    })
}

/// Rewrite the state file in full; failures are logged, never returned
pub async fn save(path: &Path, state: &PluginStateMap) {
    let bytes = match serde_json::to_vec_pretty(state) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize plugin state");
            return;
        }
    };

    let target = path.to_path_buf();
    let written = tokio::task::spawn_blocking(move || write_atomic(&target, &bytes)).await;

    match written {
        Ok(Ok(())) => tracing::trace!(path = %path.display(), "saved plugin state"),
        Ok(Err(e)) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "failed to save plugin state; change is in memory only"
            );
        }
        Err(e) => tracing::error!(error = %e, "plugin state writer task failed"),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
