//! Policy executor.
//!
//! Each request category maps to one serving policy:
//!
//! | category | policy | namespace |
//! |----------|--------|-----------|
//! | `Navigation` | network first, shell fallback chain | precache |
//! | `DefaultGet` | network first, offline page | runtime |
//! | `ApiRead` | stale-while-revalidate | api |
//! | `StaticAsset` | cache first, background refresh | runtime |
//! | `ExternalAsset` | cache first (opaque allowed), background refresh | external |
//! | `ApiMutation`, `FormMutation` | network, queue on failure | - |
//! | `Upload` | network only | - |
//!
//! Every policy resolves to a response. Cache reads and writes are best
//! effort: a failing store degrades to a miss or a skipped write.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use http::StatusCode;
use offgrid_core::{CacheRole, OffgridError, WorkerConfig};
use offgrid_net::{Category, CredentialsMode, Fetcher, NetError, Request, RequestMode, Response};
use offgrid_store::{
    CacheStorage, MatchOptions, MutationQueue, Namespace, NewQueueEntry, ReplayReport,
};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{LifetimeTracker, WorkerEvent, WorkerState};

const OFFLINE_IMAGE_SVG: &str = concat!(
    r#"<svg xmlns="http://www.w3.org/2000/svg" width="800" height="600">"#,
    r##"<rect width="100%" height="100%" fill="#e5e7eb"/>"##,
    r##"<text x="50%" y="50%" dominant-baseline="middle" text-anchor="middle" fill="#9ca3af" font-family="sans-serif" font-size="24">Offline</text>"##,
    "</svg>"
);

const OFFLINE_HTML: &str = concat!(
    "<!doctype html><html><head><meta charset=\"utf-8\"><title>Offline</title></head>",
    "<body><h1>You are offline</h1><p>Check your connection and try again.</p></body></html>"
);

/// Where a warmed URL is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmRoute {
    /// API URLs to the API namespace, everything else to the precache.
    Shell,
    /// Cross-origin assets fetched no-cors into the external namespace.
    External,
}

/// Outcome of a warm pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub cached: usize,
    pub failed: usize,
}

/// [`Fetcher`] that bounds every request by a timeout.
struct TimeoutFetcher {
    inner: Arc<dyn Fetcher>,
    timeout: Duration,
}

impl Fetcher for TimeoutFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.inner.fetch(request)).await {
                Ok(result) => result,
                Err(_) => Err(NetError::Timeout(self.timeout)),
            }
        })
    }
}

/// Executes serving policies against the namespaces, queue and network.
#[derive(Clone)]
pub struct PolicyExecutor {
    config: Arc<WorkerConfig>,
    caches: CacheStorage,
    queue: MutationQueue,
    fetcher: Arc<dyn Fetcher>,
    lifetime: LifetimeTracker,
    state: watch::Receiver<WorkerState>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl std::fmt::Debug for PolicyExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyExecutor")
            .field("version", &self.config.version)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl PolicyExecutor {
    pub(crate) fn new(
        config: Arc<WorkerConfig>,
        caches: CacheStorage,
        queue: MutationQueue,
        fetcher: Arc<dyn Fetcher>,
        lifetime: LifetimeTracker,
        state: watch::Receiver<WorkerState>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let fetcher: Arc<dyn Fetcher> = Arc::new(TimeoutFetcher {
            inner: fetcher,
            timeout: config.network_timeout(),
        });
        Self {
            config,
            caches,
            queue,
            fetcher,
            lifetime,
            state,
            events,
        }
    }

    /// Serve `request` according to its category. `Ignore` yields `None`.
    pub async fn execute(
        &self,
        category: Category,
        request: &Request,
        preload: Option<Response>,
    ) -> Option<Response> {
        let response = match category {
            Category::Navigation => self.navigation(request, preload).await,
            Category::DefaultGet => self.network_first(request).await,
            Category::ApiRead => self.stale_while_revalidate(request).await,
            Category::StaticAsset => self.cache_first(CacheRole::Runtime, request).await,
            Category::ExternalAsset => self.cache_first(CacheRole::External, request).await,
            Category::ApiMutation | Category::FormMutation => {
                self.queue_on_failure(request).await
            }
            Category::Upload => self.network_only(request).await,
            Category::Ignore => return None,
        };
        trace!(
            url = %request.url,
            category = ?category,
            status = %response.status,
            from_cache = response.from_cache,
            "Served request"
        );
        Some(response)
    }

    // ==================== Policies ====================

    async fn navigation(&self, request: &Request, preload: Option<Response>) -> Response {
        let fetched = match preload {
            Some(preloaded) => Ok(preloaded),
            None => self.fetcher.fetch(request).await,
        };

        match fetched {
            Ok(response) => {
                self.store(CacheRole::Precache, request, &response).await;
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation offline, using shell");
                self.shell_fallback(request).await
            }
        }
    }

    /// Exact match, then shell routes, then the offline page.
    async fn shell_fallback(&self, request: &Request) -> Response {
        let precache = self.namespace(CacheRole::Precache);
        if let Some(hit) = self.lookup(&precache, request).await {
            return hit;
        }
        for route in &self.config.shell_fallbacks {
            if let Some(hit) = self.lookup_path(&precache, route).await {
                return hit;
            }
        }
        if let Some(hit) = self.lookup_path(&precache, &self.config.offline_url).await {
            return hit;
        }
        Response::with_content_type(
            StatusCode::SERVICE_UNAVAILABLE,
            "text/html; charset=utf-8",
            OFFLINE_HTML,
        )
    }

    async fn network_first(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(CacheRole::Runtime, request, &response).await;
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                let runtime = self.namespace(CacheRole::Runtime);
                if let Some(hit) = self.lookup(&runtime, request).await {
                    return hit;
                }
                if self.config.is_same_origin(&request.url) && request.accepts("text/html") {
                    let precache = self.namespace(CacheRole::Precache);
                    if let Some(hit) = self.lookup_path(&precache, &self.config.offline_url).await
                    {
                        return hit;
                    }
                }
                Response::with_content_type(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "text/plain; charset=utf-8",
                    "Offline",
                )
            }
        }
    }

    async fn stale_while_revalidate(&self, request: &Request) -> Response {
        let api = self.namespace(CacheRole::Api);
        if let Some(hit) = self.lookup(&api, request).await {
            self.refresh_in_background(CacheRole::Api, request.clone());
            return hit;
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(CacheRole::Api, request, &response).await;
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "API read offline with no cached copy");
                offline_json()
            }
        }
    }

    async fn cache_first(&self, role: CacheRole, request: &Request) -> Response {
        let namespace = self.namespace(role);
        let options = match role {
            CacheRole::External => MatchOptions::ignore_vary(),
            _ => MatchOptions::default(),
        };

        match namespace.match_request(request, options).await {
            Ok(Some(hit)) => {
                self.refresh_in_background(role, request.clone());
                return hit;
            }
            Ok(None) => {}
            Err(e) => warn!(namespace = %namespace.name(), error = %e, "Cache read failed"),
        }

        let outbound = asset_request(role, request);
        match self.fetcher.fetch(&outbound).await {
            Ok(response) => {
                self.store(role, request, &response).await;
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Asset unavailable offline");
                if request.accepts("image") {
                    Response::with_content_type(StatusCode::OK, "image/svg+xml", OFFLINE_IMAGE_SVG)
                } else if role == CacheRole::External {
                    Response::new(StatusCode::GATEWAY_TIMEOUT, "")
                } else {
                    Response::with_content_type(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "text/plain; charset=utf-8",
                        "Offline",
                    )
                }
            }
        }
    }

    async fn queue_on_failure(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                let error = OffgridError::from(e);
                if !error.is_retryable() {
                    warn!(
                        url = %request.url,
                        category = error.category(),
                        error = %error,
                        "Mutation cannot be sent, not queueing"
                    );
                    return Response::json(
                        StatusCode::BAD_REQUEST,
                        &json!({ "ok": false, "queued": false }),
                    );
                }
                debug!(
                    url = %request.url,
                    method = %request.method,
                    error = %error,
                    "Mutation failed, queueing"
                );
                self.enqueue(NewQueueEntry::from_request(request)).await;
                Response::json(StatusCode::ACCEPTED, &json!({ "ok": true, "queued": true }))
            }
        }
    }

    async fn network_only(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Upload failed offline");
                offline_json()
            }
        }
    }

    // ==================== Queue ====================

    /// Append to the mutation queue and ask for a sync. Persistence
    /// failures are logged and dropped.
    pub async fn enqueue(&self, entry: NewQueueEntry) -> Option<i64> {
        let url = entry.url.clone();
        match self.queue.enqueue(entry).await {
            Ok(id) => {
                let _ = self.events.send(WorkerEvent::SyncRequested {
                    tag: self.config.sync_tag(),
                });
                Some(id)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Could not persist queued mutation");
                None
            }
        }
    }

    /// Replay the mutation queue through the network.
    pub async fn replay(&self) -> ReplayReport {
        let report = self.queue.replay_all(self.fetcher.as_ref()).await;
        let _ = self.events.send(WorkerEvent::Replayed(report));
        report
    }

    // ==================== Warmup ====================

    /// Fetch `urls` concurrently and store the successful ones.
    pub async fn warm(&self, urls: &[String], route: WarmRoute) -> WarmReport {
        let results = join_all(urls.iter().map(|url| self.warm_one(url, route))).await;
        let cached = results.iter().filter(|ok| **ok).count();
        WarmReport {
            cached,
            failed: results.len() - cached,
        }
    }

    async fn warm_one(&self, url: &str, route: WarmRoute) -> bool {
        let target = match self.config.resolve(url) {
            Ok(target) => target,
            Err(e) => {
                debug!(url, error = %e, "Skipping unresolvable warm URL");
                return false;
            }
        };

        let (role, request) = match route {
            WarmRoute::External => (
                CacheRole::External,
                Request::get(target).mode(RequestMode::NoCors),
            ),
            WarmRoute::Shell => {
                let role = if self.is_api(&target) {
                    CacheRole::Api
                } else {
                    CacheRole::Precache
                };
                (
                    role,
                    Request::get(target).credentials(CredentialsMode::SameOrigin),
                )
            }
        };

        match self.fetcher.fetch(&request).await {
            Ok(response) if response.ok() || route == WarmRoute::External => {
                self.store(role, &request, &response).await
            }
            Ok(response) => {
                debug!(url = %request.url, status = %response.status, "Warm fetch not ok");
                false
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Warm fetch failed");
                false
            }
        }
    }

    // ==================== Cache helpers ====================

    pub(crate) fn namespace(&self, role: CacheRole) -> Namespace {
        self.caches.open(&self.config.namespace_name(role))
    }

    fn is_api(&self, url: &Url) -> bool {
        self.config.is_same_origin(url) && url.path().starts_with(&self.config.api_prefix)
    }

    fn writes_enabled(&self) -> bool {
        !self.state.borrow().is_terminal()
    }

    /// Write through if the response is cacheable, then trim bounded roles.
    /// Returns whether the response was stored.
    async fn store(&self, role: CacheRole, request: &Request, response: &Response) -> bool {
        if !response.is_cacheable() {
            return false;
        }
        if !self.writes_enabled() {
            debug!(url = %request.url, "Worker is redundant, dropping cache write");
            return false;
        }

        let namespace = self.namespace(role);
        if let Err(e) = namespace.put(request, response).await {
            warn!(
                namespace = %namespace.name(),
                url = %request.url,
                error = %e,
                "Cache write failed"
            );
            return false;
        }

        if let Some(max) = self.config.max_entries(role) {
            if let Err(e) = namespace.trim(max).await {
                warn!(namespace = %namespace.name(), error = %e, "Trim failed");
            }
        }
        true
    }

    async fn lookup(&self, namespace: &Namespace, request: &Request) -> Option<Response> {
        match namespace.match_request(request, MatchOptions::default()).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(namespace = %namespace.name(), error = %e, "Cache read failed");
                None
            }
        }
    }

    async fn lookup_path(&self, namespace: &Namespace, path: &str) -> Option<Response> {
        let url = self.config.resolve(path).ok()?;
        match namespace.match_url(&url).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(namespace = %namespace.name(), error = %e, "Cache read failed");
                None
            }
        }
    }

    fn refresh_in_background(&self, role: CacheRole, request: Request) {
        let executor = self.clone();
        self.lifetime.wait_until(async move {
            let outbound = asset_request(role, &request);
            match executor.fetcher.fetch(&outbound).await {
                Ok(response) => {
                    executor.store(role, &request, &response).await;
                }
                Err(e) => trace!(url = %request.url, error = %e, "Background refresh failed"),
            }
        });
    }
}

/// The request actually sent for an asset of `role`.
fn asset_request(role: CacheRole, request: &Request) -> Request {
    match role {
        CacheRole::External => request.clone().mode(RequestMode::NoCors),
        CacheRole::Runtime => request.clone().credentials(CredentialsMode::SameOrigin),
        CacheRole::Precache | CacheRole::Api => request.clone(),
    }
}

fn offline_json() -> Response {
    Response::json(
        StatusCode::SERVICE_UNAVAILABLE,
        &json!({ "ok": false, "offline": true }),
    )
}
