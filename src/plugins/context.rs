//! Capability surface handed to each plugin
//!
//! A [`PluginContext`] is the only way a plugin touches host infrastructure.
//! Every registration is tagged with the plugin id and every callback is
//! wrapped so that an `Err` or a panic inside plugin code turns into a local,
//! structured failure instead of reaching the host.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use futures::FutureExt as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::actions::{ActionHandler, ActionResult};
use crate::live::LiveEventHandler;
use crate::realtime::{ConnectionHandle, PLUGIN_ERROR_EVENT, RealtimeHandler};
use crate::router::{
    BoxedRouteHandler, RouteId, RouteRequest, RouteResponse, StaleRoutePolicy, normalize_path,
    parse_method,
};
use crate::services::HostServices;

/// A route this plugin registered
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    #[serde(skip)]
    pub id: RouteId,
    pub method: String,
    pub path: String,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_since: Option<DateTime<Utc>>,
}

/// Counts of what a plugin currently has registered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSummary {
    pub routes: usize,
    pub stale_routes: usize,
    pub realtime_events: usize,
    pub external_events: usize,
    pub actions: usize,
}

#[derive(Default)]
struct Registrations {
    routes: Vec<RouteRecord>,
    realtime_events: Vec<String>,
    external_events: Vec<String>,
    actions: Vec<String>,
    retired: bool,
}

struct ContextInner {
    id: String,
    services: Arc<HostServices>,
    registrations: Mutex<Registrations>,
}

/// Capability surface scoped to one plugin
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.inner.id)
            .field("registrations", &self.summary())
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    /// Create the surface for `plugin_id`
    #[must_use]
    pub fn new(plugin_id: impl Into<String>, services: Arc<HostServices>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: plugin_id.into(),
                services,
                registrations: Mutex::new(Registrations::default()),
            }),
        }
    }

    /// Plugin this surface belongs to
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.inner.id
    }

    fn registrations(&self) -> std::sync::MutexGuard<'_, Registrations> {
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn refuse_if_retired(&self, what: &str, name: &str) -> bool {
        if self.registrations().retired {
            tracing::warn!(
                plugin_id = %self.inner.id,
                kind = what,
                name = %name,
                "registration after unload ignored"
            );
            return true;
        }
        false
    }

    /// Register an HTTP route on the shared plugin router
    ///
    /// Returns `false` for an unsupported method. A handler error or panic
    /// answers `500 {"success": false, "error": ...}`.
    pub fn register_route<F, Fut>(&self, method: &str, path: &str, handler: F) -> bool
    where
        F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<RouteResponse>> + Send + 'static,
    {
        let Some(method) = parse_method(method) else {
            tracing::warn!(plugin_id = %self.inner.id, method = %method, "invalid route method");
            return false;
        };
        let path = normalize_path(path);
        if self.refuse_if_retired("route", &path) {
            return false;
        }

        let plugin_id = self.inner.id.clone();
        let handler = Arc::new(handler);
        let boxed: BoxedRouteHandler = Arc::new(move |req: RouteRequest| {
            let handler = Arc::clone(&handler);
            let plugin_id = plugin_id.clone();
            Box::pin(async move {
                let path = req.path.clone();
                match run_guarded(|| handler(req)).await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::error!(
                            plugin_id = %plugin_id,
                            path = %path,
                            error = %e,
                            "plugin route failed"
                        );
                        RouteResponse::failure(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal plugin error",
                        )
                    }
                }
            })
        });

        let id = self
            .inner
            .services
            .router
            .add(&self.inner.id, method.clone(), &path, boxed);

        tracing::debug!(
            plugin_id = %self.inner.id,
            method = %method,
            path = %path,
            "registered plugin route"
        );
        self.registrations().routes.push(RouteRecord {
            id,
            method: method.to_string(),
            path,
            stale: false,
            stale_since: None,
        });
        true
    }

    /// Listen for a real-time event on every current and future connection
    ///
    /// A callback error or panic is reported to the originating connection
    /// as a `plugin:error` event.
    pub fn register_realtime_event<F, Fut>(&self, event: &str, callback: F) -> bool
    where
        F: Fn(ConnectionHandle, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.refuse_if_retired("realtime event", event) {
            return false;
        }

        let plugin_id = self.inner.id.clone();
        let event_name = event.to_string();
        let callback = Arc::new(callback);
        let handler: RealtimeHandler = Arc::new(move |conn: ConnectionHandle, data| {
            let callback = Arc::clone(&callback);
            let plugin_id = plugin_id.clone();
            let event_name = event_name.clone();
            Box::pin(async move {
                let reply = conn.clone();
                if let Err(e) = run_guarded(|| callback(conn, data)).await {
                    tracing::warn!(
                        plugin_id = %plugin_id,
                        event = %event_name,
                        error = %e,
                        "plugin realtime handler failed"
                    );
                    reply.send(
                        PLUGIN_ERROR_EVENT,
                        serde_json::json!({
                            "plugin": plugin_id,
                            "event": event_name,
                            "error": e,
                        }),
                    );
                }
            })
        });

        self.inner
            .services
            .realtime
            .register(&self.inner.id, event, handler);
        self.registrations().realtime_events.push(event.to_string());
        true
    }

    /// Subscribe to a named event from the external live-event source
    ///
    /// A callback error or panic is logged only; other subscribers still run.
    pub fn register_external_event<F, Fut>(&self, event: &str, callback: F) -> bool
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.refuse_if_retired("external event", event) {
            return false;
        }

        let plugin_id = self.inner.id.clone();
        let event_name = event.to_string();
        let callback = Arc::new(callback);
        let handler: LiveEventHandler = Arc::new(move |data| {
            let callback = Arc::clone(&callback);
            let plugin_id = plugin_id.clone();
            let event_name = event_name.clone();
            Box::pin(async move {
                if let Err(e) = run_guarded(|| callback(data)).await {
                    tracing::error!(
                        plugin_id = %plugin_id,
                        event = %event_name,
                        error = %e,
                        "plugin live event handler failed"
                    );
                }
            })
        });

        self.inner.services.live.subscribe(&self.inner.id, event, handler);
        self.registrations().external_events.push(event.to_string());
        true
    }

    /// Contribute a named automation action
    ///
    /// A handler error or panic becomes `{success: false, error}`. Returns
    /// `false` when the name is empty or already held by another plugin.
    pub fn register_automation_action<F, Fut>(&self, name: &str, handler: F) -> bool
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        if name.trim().is_empty() || self.refuse_if_retired("action", name) {
            return false;
        }

        let plugin_id = self.inner.id.clone();
        let action_name = name.to_string();
        let handler = Arc::new(handler);
        let wrapped: ActionHandler = Arc::new(move |params| {
            let handler = Arc::clone(&handler);
            let plugin_id = plugin_id.clone();
            let action_name = action_name.clone();
            Box::pin(async move {
                match run_guarded(|| handler(params)).await {
                    Ok(data) => ActionResult::ok(data),
                    Err(e) => {
                        tracing::warn!(
                            plugin_id = %plugin_id,
                            action = %action_name,
                            error = %e,
                            "plugin action failed"
                        );
                        ActionResult::failed(e)
                    }
                }
            })
        });

        if !self.inner.services.actions.register(&self.inner.id, name, wrapped) {
            return false;
        }
        self.registrations().actions.push(name.to_string());
        true
    }

    /// Read a value from this plugin's config namespace
    ///
    /// `None` on absence or on any storage or deserialization error.
    #[must_use]
    pub fn get_config<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.inner.services.settings.get(&self.inner.id, key) {
            Ok(Some(value)) => serde_json::from_value(value)
                .map_err(|e| {
                    tracing::debug!(
                        plugin_id = %self.inner.id,
                        key = %key,
                        error = %e,
                        "config value has unexpected shape"
                    );
                })
                .ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    plugin_id = %self.inner.id,
                    key = %key,
                    error = %e,
                    "failed to read plugin config"
                );
                None
            }
        }
    }

    /// Write a value to this plugin's config namespace
    pub fn set_config<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let result = serde_json::to_value(value)
            .map_err(crate::Error::from)
            .and_then(|value| self.inner.services.settings.set(&self.inner.id, key, &value));

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    plugin_id = %self.inner.id,
                    key = %key,
                    error = %e,
                    "failed to write plugin config"
                );
                false
            }
        }
    }

    /// Broadcast an event to every connected real-time client
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) -> bool {
        match serde_json::to_value(data) {
            Ok(data) => {
                self.inner.services.realtime.broadcast(event, &data);
                true
            }
            Err(e) => {
                tracing::warn!(
                    plugin_id = %self.inner.id,
                    event = %event,
                    error = %e,
                    "failed to emit plugin event"
                );
                false
            }
        }
    }

    /// Tear down everything this plugin registered that can be torn down
    ///
    /// Real-time listeners are detached from every connection and the
    /// external-event and action lists are cleared (the owning subsystems
    /// are purged by the lifecycle manager). Routes cannot be unregistered
    /// from a live router: they are flagged stale, or dropped when the router
    /// runs with [`StaleRoutePolicy::Remove`].
    pub fn unregister_all(&self) {
        let policy = self.inner.services.router.policy();
        let retired = self.teardown(policy);

        if retired > 0 && policy == StaleRoutePolicy::Retain {
            tracing::warn!(
                plugin_id = %self.inner.id,
                stale_routes = retired,
                total_stale = self.inner.services.router.stale_count(),
                "plugin routes cannot be removed from the running router and are now stale; \
                 repeated reloads leak route handlers, restart the process to clear them"
            );
        }
    }

    /// Undo every registration of a plugin that never finished loading
    ///
    /// Unlike [`PluginContext::unregister_all`], routes are dropped from the
    /// table whatever the stale-route policy says.
    pub fn rollback(&self) {
        let removed = self.teardown(StaleRoutePolicy::Remove);
        tracing::debug!(
            plugin_id = %self.inner.id,
            routes = removed,
            "rolled back plugin registrations"
        );
    }

    /// Retire the surface and detach everything, treating routes per `policy`
    fn teardown(&self, policy: StaleRoutePolicy) -> usize {
        let services = &self.inner.services;
        let detached = services.realtime.unregister_owner(&self.inner.id);

        let mut regs = self.registrations();
        regs.retired = true;
        regs.realtime_events.clear();
        regs.external_events.clear();
        regs.actions.clear();

        let live_ids: Vec<RouteId> = regs
            .routes
            .iter()
            .filter(|r| !r.stale)
            .map(|r| r.id)
            .collect();

        let affected = match policy {
            StaleRoutePolicy::Retain => {
                let count = services.router.retire(&live_ids);
                let now = Utc::now();
                for route in regs.routes.iter_mut().filter(|r| !r.stale) {
                    route.stale = true;
                    route.stale_since = Some(now);
                }
                count
            }
            StaleRoutePolicy::Remove => {
                let all_ids: Vec<RouteId> = regs.routes.iter().map(|r| r.id).collect();
                regs.routes.clear();
                services.router.remove(&all_ids)
            }
        };
        drop(regs);

        tracing::debug!(
            plugin_id = %self.inner.id,
            realtime_listeners = detached,
            "unregistered plugin listeners"
        );
        affected
    }

    /// Routes this plugin registered
    #[must_use]
    pub fn routes(&self) -> Vec<RouteRecord> {
        self.registrations().routes.clone()
    }

    /// What this plugin currently has registered
    #[must_use]
    pub fn summary(&self) -> RegistrationSummary {
        let regs = self.registrations();
        RegistrationSummary {
            routes: regs.routes.iter().filter(|r| !r.stale).count(),
            stale_routes: regs.routes.iter().filter(|r| r.stale).count(),
            realtime_events: regs.realtime_events.len(),
            external_events: regs.external_events.len(),
            actions: regs.actions.len(),
        }
    }
}

/// Run plugin code, folding an `Err` or a panic into an error message
async fn run_guarded<T, Fut>(make: impl FnOnce() -> Fut) -> Result<T, String>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    let future = match std::panic::catch_unwind(AssertUnwindSafe(make)) {
        Ok(future) => future,
        Err(payload) => return Err(panic_message(payload.as_ref())),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

pub(super) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map_or_else(|| "plugin panicked".to_string(), |msg| format!("plugin panicked: {msg}"))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::db::{SettingsRepo, init_memory};
    use crate::realtime::RealtimeFrame;

    fn services(policy: StaleRoutePolicy) -> Arc<HostServices> {
        Arc::new(HostServices::new(
            SettingsRepo::new(init_memory().unwrap()),
            policy,
        ))
    }

    async fn get(services: &HostServices, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = services.router.dispatch(req).await;
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn route_registration_and_invalid_method() {
        let services = services(StaleRoutePolicy::Retain);
        let ctx = PluginContext::new("soundboard", Arc::clone(&services));

        assert!(ctx.register_route("get", "api/sound//list/", |_req| async {
            Ok::<_, anyhow::Error>(RouteResponse::ok(json!(["horn"])))
        }));
        assert!(!ctx.register_route("CONNECT", "/api/sound", |_req| async {
            Ok::<_, anyhow::Error>(RouteResponse::ok(json!(null)))
        }));

        assert_eq!(ctx.routes()[0].path, "/api/sound/list");
        let (status, body) = get(&services, "/api/sound/list").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(["horn"]));
    }

    #[tokio::test]
    async fn failing_route_returns_structured_500() {
        let services = services(StaleRoutePolicy::Retain);
        let ctx = PluginContext::new("p", Arc::clone(&services));

        ctx.register_route("GET", "/err", |_req| async {
            Err::<RouteResponse, _>(anyhow::anyhow!("boom"))
        });
        ctx.register_route("GET", "/panic", |_req| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, anyhow::Error>(RouteResponse::ok(json!(null)))
        });

        for uri in ["/err", "/panic"] {
            let (status, body) = get(&services, uri).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body["success"], false);
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn realtime_error_is_reported_to_origin() {
        let services = services(StaleRoutePolicy::Retain);
        let ctx = PluginContext::new("p", Arc::clone(&services));
        ctx.register_realtime_event("explode", |_conn, _data| async {
            Err::<(), _>(anyhow::anyhow!("nope"))
        });

        let (tx, mut rx) = mpsc::channel(8);
        let conn = services.realtime.connect(tx);
        services
            .realtime
            .dispatch(conn.id(), RealtimeFrame::new("explode", json!({})))
            .await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, PLUGIN_ERROR_EVENT);
        assert_eq!(frame.data["plugin"], "p");
        assert_eq!(frame.data["event"], "explode");
    }

    #[tokio::test]
    async fn realtime_callback_can_reply() {
        let services = services(StaleRoutePolicy::Retain);
        let ctx = PluginContext::new("p", Arc::clone(&services));
        ctx.register_realtime_event("ping", |conn, data| async move {
            conn.send("pong", data);
            Ok::<_, anyhow::Error>(())
        });

        let (tx, mut rx) = mpsc::channel(8);
        let conn = services.realtime.connect(tx);
        services
            .realtime
            .dispatch(conn.id(), RealtimeFrame::new("ping", json!(7)))
            .await;

        assert_eq!(rx.recv().await.unwrap(), RealtimeFrame::new("pong", json!(7)));
    }

    #[tokio::test]
    async fn failing_external_handler_does_not_block_others() {
        let services = services(StaleRoutePolicy::Retain);
        let bad = PluginContext::new("bad", Arc::clone(&services));
        let good = PluginContext::new("good", Arc::clone(&services));

        bad.register_external_event("gift", |_data| async {
            Err::<(), _>(anyhow::anyhow!("broken"))
        });
        let (tx, mut rx) = mpsc::channel(1);
        good.register_external_event("gift", move |data| {
            let tx = tx.clone();
            async move {
                tx.send(data).await?;
                Ok::<_, anyhow::Error>(())
            }
        });

        assert_eq!(services.live.publish("gift", json!({"coins": 1})).await, 2);
        assert_eq!(rx.recv().await.unwrap()["coins"], 1);
    }

    #[tokio::test]
    async fn failing_action_becomes_structured_result() {
        let services = services(StaleRoutePolicy::Retain);
        let ctx = PluginContext::new("p", Arc::clone(&services));
        ctx.register_automation_action("fail", |_params| async {
            Err::<serde_json::Value, _>(anyhow::anyhow!("no sound"))
        });
        ctx.register_automation_action("ok", |params| async move {
            Ok::<_, anyhow::Error>(params)
        });

        let failed = services.actions.execute("fail", json!(null)).await;
        assert!(!failed.success);
        assert!(failed.error.unwrap().contains("no sound"));

        let ok = services.actions.execute("ok", json!(1)).await;
        assert_eq!(ok, ActionResult::ok(json!(1)));
    }

    #[test]
    fn config_is_namespaced_and_lenient() {
        let services = services(StaleRoutePolicy::Retain);
        let a = PluginContext::new("a", Arc::clone(&services));
        let b = PluginContext::new("b", Arc::clone(&services));

        assert!(a.set_config("volume", &80_u32));
        assert_eq!(a.get_config::<u32>("volume"), Some(80));
        assert_eq!(b.get_config::<u32>("volume"), None);
        // Wrong shape is absence, not an error
        assert_eq!(a.get_config::<Vec<String>>("volume"), None);
    }

    #[test]
    fn emit_broadcasts() {
        let services = services(StaleRoutePolicy::Retain);
        let ctx = PluginContext::new("p", Arc::clone(&services));
        let (tx, mut rx) = mpsc::channel(8);
        services.realtime.connect(tx);

        assert!(ctx.emit("overlay:update", &json!({"text": "hi"})));
        assert_eq!(rx.try_recv().unwrap().event, "overlay:update");
    }

    #[tokio::test]
    async fn unregister_all_retains_stale_routes() {
        let services = services(StaleRoutePolicy::Retain);
        let ctx = PluginContext::new("p", Arc::clone(&services));
        ctx.register_route("GET", "/still-here", |_req| async {
            Ok::<_, anyhow::Error>(RouteResponse::ok(json!("alive")))
        });
        ctx.register_realtime_event("ping", |_conn, _data| async { Ok::<_, anyhow::Error>(()) });

        ctx.unregister_all();

        let summary = ctx.summary();
        assert_eq!(summary.routes, 0);
        assert_eq!(summary.stale_routes, 1);
        assert_eq!(summary.realtime_events, 0);
        assert!(ctx.routes()[0].stale_since.is_some());

        let (status, body) = get(&services, "/still-here").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("alive"));

        // Surface is retired
        assert!(!ctx.register_route("GET", "/late", |_req| async {
            Ok::<_, anyhow::Error>(RouteResponse::ok(json!(null)))
        }));
    }

    #[tokio::test]
    async fn unregister_all_removes_routes_under_remove_policy() {
        let services = services(StaleRoutePolicy::Remove);
        let ctx = PluginContext::new("p", Arc::clone(&services));
        ctx.register_route("GET", "/gone", |_req| async {
            Ok::<_, anyhow::Error>(RouteResponse::ok(json!(1)))
        });

        ctx.unregister_all();

        assert!(ctx.routes().is_empty());
        let (status, _) = get(&services, "/gone").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rollback_removes_routes_under_retain_policy() {
        let services = services(StaleRoutePolicy::Retain);
        let ctx = PluginContext::new("p", Arc::clone(&services));
        ctx.register_route("GET", "/half-loaded", |_req| async {
            Ok::<_, anyhow::Error>(RouteResponse::ok(json!(1)))
        });

        ctx.rollback();

        assert!(ctx.routes().is_empty());
        assert!(services.router.is_empty());
        let (status, _) = get(&services, "/half-loaded").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!ctx.register_automation_action("late", |params| async move {
            Ok::<_, anyhow::Error>(params)
        }));
    }

    #[test]
    fn action_name_held_by_another_plugin_is_refused() {
        let services = services(StaleRoutePolicy::Retain);
        let first = PluginContext::new("first", Arc::clone(&services));
        let second = PluginContext::new("second", Arc::clone(&services));

        assert!(first.register_automation_action("shared", |params| async move {
            Ok::<_, anyhow::Error>(params)
        }));
        assert!(!second.register_automation_action("shared", |params| async move {
            Ok::<_, anyhow::Error>(params)
        }));
        assert_eq!(second.summary().actions, 0);
        assert_eq!(services.actions.list()[0].owner, "first");
    }
}
