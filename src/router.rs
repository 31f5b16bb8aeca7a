//! Shared plugin router
//!
//! One append-ordered route table, mounted exactly once as the host router's
//! fallback. Core routes therefore always win, plugin routes are matched next,
//! and the terminal JSON 404 runs only when nothing matched. Because the table
//! is consulted per request, routes added long after the server started are
//! reachable without re-mounting anything.
//!
//! Unloading a plugin never silently drops its routes: under
//! [`StaleRoutePolicy::Retain`] they stay reachable but are flagged stale and
//! ranked behind every live route, under [`StaleRoutePolicy::Remove`] they are
//! deleted from the table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use axum::body::Bytes;
use axum::extract::{Query, Request};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest request body handed to a plugin route
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// What happens to a plugin's routes when it is unloaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleRoutePolicy {
    /// Keep routes reachable, flag them stale, rank them after live routes
    #[default]
    Retain,
    /// Delete routes from the table
    Remove,
}

/// Identifier of a single route registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RouteId(u64);

/// Request as seen by a plugin route handler
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub method: Method,
    pub path: String,
    /// Captured `:name` / `{name}` / `*` segments
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RouteRequest {
    /// Captured path parameter
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Deserialize the body as JSON
    ///
    /// # Errors
    ///
    /// Returns error if the body is not valid JSON for `T`
    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Response produced by a plugin route handler
#[derive(Debug, Clone)]
pub struct RouteResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl RouteResponse {
    /// `200 OK` with a JSON body
    #[must_use]
    pub const fn ok(body: serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    /// JSON body with an explicit status
    #[must_use]
    pub const fn with_status(status: StatusCode, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    /// Generic structured failure
    #[must_use]
    pub fn failure(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({ "success": false, "error": error.into() }),
        }
    }
}

impl IntoResponse for RouteResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Type-erased, already error-wrapped route handler
pub type BoxedRouteHandler =
    Arc<dyn Fn(RouteRequest) -> BoxFuture<'static, RouteResponse> + Send + Sync>;

/// Public view of one route table entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub id: RouteId,
    pub owner: String,
    pub method: String,
    pub path: String,
    pub registered_at: DateTime<Utc>,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// Parsed route path
#[derive(Debug, Clone, PartialEq, Eq)]
struct RoutePattern {
    segments: Vec<Segment>,
}

impl RoutePattern {
    fn parse(path: &str) -> Self {
        let segments = split_segments(path)
            .map(|s| {
                if s == "*" {
                    Segment::Wildcard
                } else if let Some(name) = s.strip_prefix(':') {
                    Segment::Param(name.to_string())
                } else if let Some(name) = s.strip_prefix('{').and_then(|n| n.strip_suffix('}')) {
                    Segment::Param(name.to_string())
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Self { segments }
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = split_segments(path).collect();
        let mut params = HashMap::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Wildcard => {
                    params.insert("*".to_string(), parts.get(i..)?.join("/"));
                    return Some(params);
                }
                Segment::Literal(lit) => {
                    if *parts.get(i)? != lit.as_str() {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), (*parts.get(i)?).to_string());
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Normalize a route path: leading slash, no duplicate or trailing slashes
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let joined = split_segments(path).collect::<Vec<_>>().join("/");
    format!("/{joined}")
}

/// Parse a plugin-supplied HTTP method, accepting only the verbs plugins may route
#[must_use]
pub fn parse_method(method: &str) -> Option<Method> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some(Method::GET),
        "POST" => Some(Method::POST),
        "PUT" => Some(Method::PUT),
        "PATCH" => Some(Method::PATCH),
        "DELETE" => Some(Method::DELETE),
        _ => None,
    }
}

struct RouteEntry {
    id: RouteId,
    owner: String,
    method: Method,
    path: String,
    pattern: RoutePattern,
    handler: BoxedRouteHandler,
    registered_at: DateTime<Utc>,
    stale_since: Option<DateTime<Utc>>,
}

impl RouteEntry {
    fn info(&self) -> RouteInfo {
        RouteInfo {
            id: self.id,
            owner: self.owner.clone(),
            method: self.method.to_string(),
            path: self.path.clone(),
            registered_at: self.registered_at,
            stale: self.stale_since.is_some(),
            stale_since: self.stale_since,
        }
    }
}

/// The single route table every plugin route lands on
pub struct PluginRouter {
    routes: RwLock<Vec<RouteEntry>>,
    mounted: AtomicBool,
    next_id: AtomicU64,
    policy: StaleRoutePolicy,
}

impl Default for PluginRouter {
    fn default() -> Self {
        Self::new(StaleRoutePolicy::default())
    }
}

impl std::fmt::Debug for PluginRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRouter")
            .field("routes", &self.len())
            .field("mounted", &self.is_mounted())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PluginRouter {
    /// Create an empty, unmounted route table
    #[must_use]
    pub const fn new(policy: StaleRoutePolicy) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            mounted: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            policy,
        }
    }

    /// Unload policy in effect
    #[must_use]
    pub const fn policy(&self) -> StaleRoutePolicy {
        self.policy
    }

    /// Mount the table as `host`'s fallback
    ///
    /// Must happen once, before any plugin loads. The returned router answers
    /// plugin routes after every route already on `host` and ends in a JSON 404.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouterAlreadyMounted`] on a second call
    pub fn mount(self: &Arc<Self>, host: Router) -> Result<Router> {
        if self.mounted.swap(true, Ordering::SeqCst) {
            return Err(Error::RouterAlreadyMounted);
        }

        let table = Arc::clone(self);
        tracing::info!("plugin router mounted");
        Ok(host.fallback(move |req: Request| {
            let table = Arc::clone(&table);
            async move { table.dispatch(req).await }
        }))
    }

    /// Whether [`PluginRouter::mount`] has run
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Append a route
    ///
    /// Duplicate `{method, path}` registrations are accepted; the first live
    /// one keeps answering and a warning names both owners.
    pub fn add(
        &self,
        owner: &str,
        method: Method,
        path: &str,
        handler: BoxedRouteHandler,
    ) -> RouteId {
        let path = normalize_path(path);
        let id = RouteId(self.next_id.fetch_add(1, Ordering::Relaxed));

        if !self.is_mounted() {
            tracing::warn!(
                plugin_id = %owner,
                path = %path,
                "route added before plugin router was mounted"
            );
        }

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = routes
            .iter()
            .find(|r| r.stale_since.is_none() && r.method == method && r.path == path)
        {
            tracing::warn!(
                plugin_id = %owner,
                shadowed_by = %existing.owner,
                method = %method,
                path = %path,
                "duplicate plugin route; the earlier registration keeps answering"
            );
        }

        routes.push(RouteEntry {
            id,
            owner: owner.to_string(),
            method,
            pattern: RoutePattern::parse(&path),
            path,
            handler,
            registered_at: Utc::now(),
            stale_since: None,
        });

        id
    }

    /// Retire routes after their owner unloaded, according to the policy
    ///
    /// Returns the number of routes affected.
    pub fn retire(&self, ids: &[RouteId]) -> usize {
        if ids.is_empty() {
            return 0;
        }

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match self.policy {
            StaleRoutePolicy::Retain => {
                let now = Utc::now();
                let mut count = 0;
                for route in routes.iter_mut().filter(|r| ids.contains(&r.id)) {
                    if route.stale_since.is_none() {
                        route.stale_since = Some(now);
                        count += 1;
                    }
                }
                count
            }
            StaleRoutePolicy::Remove => {
                drop(routes);
                self.remove(ids)
            }
        }
    }

    /// Drop routes from the table, whatever the policy
    ///
    /// Returns the number of routes removed.
    pub fn remove(&self, ids: &[RouteId]) -> usize {
        if ids.is_empty() {
            return 0;
        }

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|r| !ids.contains(&r.id));
        before - routes.len()
    }

    /// Snapshot of every route
    #[must_use]
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(RouteEntry::info)
            .collect()
    }

    /// Snapshot of one plugin's routes
    #[must_use]
    pub fn routes_for(&self, owner: &str) -> Vec<RouteInfo> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.owner == owner)
            .map(RouteEntry::info)
            .collect()
    }

    /// Number of stale routes still in the table
    #[must_use]
    pub fn stale_count(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.stale_since.is_some())
            .count()
    }

    /// Number of routes in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the handler for a request: live routes first, then stale ones
    fn resolve(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(BoxedRouteHandler, HashMap<String, String>)> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let candidates = routes.iter().filter(|r| &r.method == method);

        let live = candidates.clone().filter(|r| r.stale_since.is_none());
        let stale = candidates.filter(|r| r.stale_since.is_some());

        live.chain(stale).find_map(|route| {
            route
                .pattern
                .matches(path)
                .map(|params| (Arc::clone(&route.handler), params))
        })
    }

    /// Serve one request from the table
    pub async fn dispatch(&self, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let path = normalize_path(parts.uri.path());

        let Some((handler, params)) = self.resolve(&parts.method, &path) else {
            return not_found().await.into_response();
        };

        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return RouteResponse::failure(StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
                    .into_response();
            }
        };

        let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();

        let request = RouteRequest {
            method: parts.method,
            path,
            params,
            query,
            headers: parts.headers,
            body,
        };

        handler(request).await.into_response()
    }
}

/// Terminal not-found handler
pub async fn not_found() -> impl IntoResponse {
    RouteResponse::failure(StatusCode::NOT_FOUND, "Not found")
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::json;

    use super::*;

    fn fixed(body: serde_json::Value) -> BoxedRouteHandler {
        Arc::new(move |_req| {
            let body = body.clone();
            Box::pin(async move { RouteResponse::ok(body) })
        })
    }

    fn echo_params() -> BoxedRouteHandler {
        Arc::new(|req: RouteRequest| {
            Box::pin(async move {
                RouteResponse::ok(json!({ "params": req.params, "query": req.query }))
            })
        })
    }

    async fn call(
        router: &PluginRouter,
        method: Method,
        uri: &str,
    ) -> (StatusCode, serde_json::Value) {
        let req = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = router.dispatch(req).await;
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("api//sound/"), "/api/sound");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/a/b"), "/a/b");
    }

    #[test]
    fn parses_methods() {
        assert_eq!(parse_method("get"), Some(Method::GET));
        assert_eq!(parse_method("Delete"), Some(Method::DELETE));
        assert_eq!(parse_method("TRACE"), None);
        assert_eq!(parse_method("bogus"), None);
    }

    #[test]
    fn pattern_matching() {
        let pattern = RoutePattern::parse("/api/:plugin/{item}");
        let params = pattern.matches("/api/sound/horn").unwrap();
        assert_eq!(params["plugin"], "sound");
        assert_eq!(params["item"], "horn");
        assert!(pattern.matches("/api/sound").is_none());
        assert!(pattern.matches("/api/sound/horn/extra").is_none());

        let wildcard = RoutePattern::parse("/static/*");
        assert_eq!(wildcard.matches("/static/a/b.css").unwrap()["*"], "a/b.css");
    }

    #[tokio::test]
    async fn dispatches_params_and_query() {
        let router = PluginRouter::default();
        router.add("p", Method::GET, "/items/:id", echo_params());

        let (status, body) = call(&router, Method::GET, "/items/42?page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["params"]["id"], "42");
        assert_eq!(body["query"]["page"], "2");
    }

    #[tokio::test]
    async fn unmatched_is_json_not_found() {
        let router = PluginRouter::default();
        router.add("p", Method::GET, "/a", fixed(json!("a")));

        let (status, body) = call(&router, Method::POST, "/a").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn duplicate_route_first_registration_wins() {
        let router = PluginRouter::default();
        router.add("first", Method::GET, "/dup", fixed(json!("first")));
        router.add("second", Method::GET, "/dup", fixed(json!("second")));

        let (_, body) = call(&router, Method::GET, "/dup").await;
        assert_eq!(body, json!("first"));
        assert_eq!(router.len(), 2);
    }

    #[tokio::test]
    async fn retained_stale_route_ranks_after_live() {
        let router = PluginRouter::new(StaleRoutePolicy::Retain);
        let old = router.add("p", Method::GET, "/x", fixed(json!("old")));

        assert_eq!(router.retire(&[old]), 1);
        assert_eq!(router.stale_count(), 1);

        // Still reachable while nothing shadows it
        let (status, body) = call(&router, Method::GET, "/x").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("old"));

        router.add("p", Method::GET, "/x", fixed(json!("new")));
        let (_, body) = call(&router, Method::GET, "/x").await;
        assert_eq!(body, json!("new"));

        let info = router.routes_for("p");
        assert!(info[0].stale && info[0].stale_since.is_some());
        assert!(!info[1].stale);
    }

    #[tokio::test]
    async fn remove_policy_deletes_routes() {
        let router = PluginRouter::new(StaleRoutePolicy::Remove);
        let id = router.add("p", Method::GET, "/x", fixed(json!("old")));

        assert_eq!(router.retire(&[id]), 1);
        assert!(router.is_empty());

        let (status, _) = call(&router, Method::GET, "/x").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn remove_ignores_retain_policy() {
        let router = PluginRouter::new(StaleRoutePolicy::Retain);
        let id = router.add("p", Method::GET, "/x", fixed(json!("half")));
        router.add("q", Method::GET, "/y", fixed(json!("kept")));

        assert_eq!(router.remove(&[id]), 1);
        assert_eq!(router.len(), 1);
        assert_eq!(router.stale_count(), 0);

        let (status, _) = call(&router, Method::GET, "/x").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn mounts_only_once() {
        let router = Arc::new(PluginRouter::default());
        assert!(router.mount(Router::new()).is_ok());
        assert!(router.is_mounted());
        assert!(matches!(
            router.mount(Router::new()),
            Err(Error::RouterAlreadyMounted)
        ));
    }
}
