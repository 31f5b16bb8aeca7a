//! Plugin discovery - scan the plugins root for `plugin.json` manifests

use std::path::{Path, PathBuf};

use super::manifest::{MANIFEST_FILE, PluginManifest};

/// List candidate plugin directories under `root`
///
/// Creates `root` if it does not exist. Skips non-directories and names
/// starting with `_` or `.`, which mark private or internal directories.
/// Results are sorted so load order is stable across runs.
#[must_use]
pub fn discover_candidates(root: &Path) -> Vec<PathBuf> {
    if !root.is_dir() {
        match std::fs::create_dir_all(root) {
            Ok(()) => tracing::info!(path = %root.display(), "created plugins directory"),
            Err(e) => {
                tracing::warn!(
                    path = %root.display(),
                    error = %e,
                    "failed to create plugins directory"
                );
            }
        }
        return Vec::new();
    }

    let Ok(entries) = std::fs::read_dir(root) else {
        tracing::warn!(path = %root.display(), "failed to read plugins directory");
        return Vec::new();
    };

    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| !name.starts_with('_') && !name.starts_with('.'))
        })
        .collect();

    candidates.sort();
    candidates
}

/// Read and validate the manifest of one plugin directory
///
/// A missing file, malformed JSON, or blank required field is a soft
/// failure: logged and reported as `None`.
pub async fn read_manifest(dir: &Path) -> Option<PluginManifest> {
    let path = dir.join(MANIFEST_FILE);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "plugin manifest not readable, skipping"
            );
            return None;
        }
    };

    let manifest = match serde_json::from_str::<PluginManifest>(&content) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse plugin manifest");
            return None;
        }
    };

    if let Some(field) = manifest.missing_field() {
        tracing::warn!(path = %path.display(), field, "plugin manifest missing required field");
        return None;
    }

    Some(manifest)
}

/// Every candidate directory with a valid manifest
pub async fn discover_plugins(root: &Path) -> Vec<(PathBuf, PluginManifest)> {
    let mut results = Vec::new();

    for dir in discover_candidates(root) {
        if let Some(manifest) = read_manifest(&dir).await {
            tracing::debug!(plugin_id = %manifest.id, path = %dir.display(), "discovered plugin");
            results.push((dir, manifest));
        }
    }

    results
}

/// Directory and manifest of the plugin whose manifest declares `id`
pub async fn find_plugin(root: &Path, id: &str) -> Option<(PathBuf, PluginManifest)> {
    discover_plugins(root)
        .await
        .into_iter()
        .find(|(_, manifest)| manifest.id == id)
}
