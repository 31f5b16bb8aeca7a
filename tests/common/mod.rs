//! Shared test utilities
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::json;
use stagelight::config::PluginsConfig;
use stagelight::db::{self, SettingsRepo};
use stagelight::plugins::MANIFEST_FILE;
use stagelight::{
    HostServices, ModuleRegistry, Plugin, PluginContext, PluginManager, RouteResponse,
    StaleRoutePolicy,
};
use tempfile::TempDir;

/// Hook invocation counters shared between a test and its plugin instances
#[derive(Debug, Default)]
pub struct Counters {
    pub inits: AtomicUsize,
    pub destroys: AtomicUsize,
    pub live_events: AtomicUsize,
    pub realtime_events: AtomicUsize,
}

impl Counters {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn live_events(&self) -> usize {
        self.live_events.load(Ordering::SeqCst)
    }

    pub fn realtime_events(&self) -> usize {
        self.realtime_events.load(Ordering::SeqCst)
    }
}

/// Plugin that counts its hooks and can be told to fail `init`
pub struct TestPlugin {
    counters: Arc<Counters>,
    fail_init: bool,
}

impl TestPlugin {
    /// Instance whose counters nobody watches
    pub fn noop() -> Self {
        Self {
            counters: Arc::default(),
            fail_init: false,
        }
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    async fn init(&mut self) -> anyhow::Result<()> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            anyhow::bail!("init refused");
        }
        Ok(())
    }

    async fn destroy(&mut self) -> anyhow::Result<()> {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Register every capability a plugin can use, all tagged with `label`
///
/// - `GET /api/<id>/ping` answers `{"plugin": id, "label": label}`
/// - realtime event `<id>:ping` and live event `gift` bump the counters
/// - action `<id>.echo` returns its params
pub fn register_capabilities(ctx: &PluginContext, counters: &Arc<Counters>, label: &str) {
    let id = ctx.plugin_id().to_string();

    let body = json!({ "plugin": id, "label": label });
    ctx.register_route("GET", &format!("/api/{id}/ping"), move |_req| {
        let body = body.clone();
        async move { Ok::<_, anyhow::Error>(RouteResponse::ok(body)) }
    });

    let realtime = Arc::clone(counters);
    ctx.register_realtime_event(&format!("{id}:ping"), move |_conn, _data| {
        let realtime = Arc::clone(&realtime);
        async move {
            realtime.realtime_events.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        }
    });

    let live = Arc::clone(counters);
    ctx.register_external_event("gift", move |_data| {
        let live = Arc::clone(&live);
        async move {
            live.live_events.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        }
    });

    ctx.register_automation_action(&format!("{id}.echo"), |params| async move {
        Ok::<_, anyhow::Error>(params)
    });
}

/// Provide code for `id` that registers every capability
pub fn register_module(modules: &ModuleRegistry, id: &str, label: &str) -> Arc<Counters> {
    let counters = Arc::new(Counters::default());
    let shared = Arc::clone(&counters);
    let label = label.to_string();
    modules.register_fn(id, move |ctx| {
        register_capabilities(&ctx, &shared, &label);
        Ok(Box::new(TestPlugin {
            counters: Arc::clone(&shared),
            fail_init: false,
        }))
    });
    counters
}

/// Provide code for `id` that registers a route and a listener, then fails `init`
pub fn register_failing_module(modules: &ModuleRegistry, id: &str) -> Arc<Counters> {
    let counters = Arc::new(Counters::default());
    let shared = Arc::clone(&counters);
    modules.register_fn(id, move |ctx| {
        register_capabilities(&ctx, &shared, "failing");
        Ok(Box::new(TestPlugin {
            counters: Arc::clone(&shared),
            fail_init: true,
        }))
    });
    counters
}

/// Write a plugin directory with a manifest and (optionally) its entry file
pub fn write_plugin(
    root: &Path,
    dir_name: &str,
    manifest: &serde_json::Value,
    with_entry: bool,
) -> PathBuf {
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir).expect("failed to create plugin dir");
    std::fs::write(dir.join(MANIFEST_FILE), manifest.to_string())
        .expect("failed to write manifest");

    if with_entry {
        if let Some(entry) = manifest.get("entry").and_then(|e| e.as_str()) {
            std::fs::write(dir.join(entry), "// plugin entry\n").expect("failed to write entry");
        }
    }
    dir
}

/// Write an enabled plugin named after its id with entry `main.js`
pub fn write_simple_plugin(root: &Path, id: &str) -> PathBuf {
    write_plugin(
        root,
        id,
        &json!({ "id": id, "name": id, "entry": "main.js" }),
        true,
    )
}

/// A plugin host rooted in a temporary directory
pub struct TestHost {
    pub dir: TempDir,
    pub services: Arc<HostServices>,
    pub modules: Arc<ModuleRegistry>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_policy(StaleRoutePolicy::Retain)
    }

    pub fn with_policy(policy: StaleRoutePolicy) -> Self {
        let pool = db::init_memory().expect("failed to init test db");
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
            services: Arc::new(HostServices::new(SettingsRepo::new(pool), policy)),
            modules: Arc::new(ModuleRegistry::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> PluginsConfig {
        let mut config = PluginsConfig::new(self.root());
        config.batch_size = 2;
        config.hook_timeout = Duration::from_secs(2);
        config
    }

    /// A fresh manager over this host, as after a process restart
    pub async fn manager(&self) -> PluginManager {
        PluginManager::new(self.config(), Arc::clone(&self.services), self.modules.clone()).await
    }

    /// Raw state file contents, if any
    pub fn state_file(&self) -> Option<String> {
        std::fs::read_to_string(self.root().join(stagelight::plugins::STATE_FILE)).ok()
    }

    /// Issue a request straight against the shared plugin router
    pub async fn request(&self, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("failed to build request");
        let response = self.services.router.dispatch(req).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("failed to read body");
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        self.request(Method::GET, uri).await
    }
}
