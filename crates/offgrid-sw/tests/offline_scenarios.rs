//! End-to-end scenarios: a registration driving workers against a scripted
//! network and a shared store.

use std::sync::Arc;

use http::{HeaderValue, Method, StatusCode};
use offgrid_core::{CacheRole, WorkerConfig};
use offgrid_net::mock::MockFetcher;
use offgrid_net::{Request, Response};
use offgrid_store::{CacheStorage, Database, MutationQueue, ReplayReport};
use offgrid_sw::{
    Clients, FetchEvent, NotificationCenter, OfflineWorker, Registration, WorkerEvent,
    WorkerState,
};
use serde_json::json;
use tokio::sync::mpsc;
use url::Url;

struct Site {
    db: Database,
    fetcher: Arc<MockFetcher>,
    clients: Arc<Clients>,
    notifications: Arc<NotificationCenter>,
    registration: Registration,
}

impl Site {
    fn new(db: Database) -> Self {
        init_tracing();
        let clients = Arc::new(Clients::new());
        Self {
            db,
            fetcher: Arc::new(MockFetcher::new()),
            registration: Registration::new(
                Url::parse("http://localhost/").unwrap(),
                clients.clone(),
            ),
            clients,
            notifications: Arc::new(NotificationCenter::new()),
        }
    }

    async fn in_memory() -> Self {
        Self::new(Database::open_in_memory().await.unwrap())
    }

    async fn deploy(
        &mut self,
        config: WorkerConfig,
    ) -> (Arc<OfflineWorker>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (worker, events) = OfflineWorker::builder(config)
            .database(self.db.clone())
            .fetcher(self.fetcher.clone())
            .clients(self.clients.clone())
            .notifier(self.notifications.clone())
            .build()
            .unwrap();
        let worker = Arc::new(worker);
        self.registration.register(worker.clone()).await.unwrap();
        (worker, events)
    }

    async fn fetch(&self, request: Request) -> Response {
        self.registration
            .handle_fetch(FetchEvent::new(request))
            .await
            .expect("request should be intercepted")
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> WorkerConfig {
    WorkerConfig {
        precache_urls: vec!["/shell-home".to_string()],
        external_warm_urls: vec![],
        ..WorkerConfig::default()
    }
}

fn url(path: &str) -> Url {
    Url::parse(&format!("http://localhost{path}")).unwrap()
}

#[tokio::test]
async fn shell_route_is_served_from_precache_offline() {
    let mut site = Site::in_memory().await;
    site.fetcher
        .respond("http://localhost/shell-home", 200, "<h1>home</h1>");
    let (worker, _events) = site.deploy(config()).await;
    assert_eq!(worker.state(), WorkerState::Active);

    site.fetcher.set_online(false);
    let response = site.fetch(Request::navigate(url("/shell-home"))).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text().unwrap(), "<h1>home</h1>");
    assert!(response.from_cache);
}

#[tokio::test]
async fn offline_mutation_is_queued_then_replayed() {
    let mut site = Site::in_memory().await;
    let (worker, mut events) = site.deploy(config()).await;
    site.fetcher.set_online(false);

    let request = Request::post(url("/api/mutate"), r#"{"like":7}"#).header(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    let response = site.fetch(request).await;

    assert_eq!(response.status, StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json_body().unwrap();
    assert_eq!(body["queued"], true);

    let queue = MutationQueue::new(site.db.clone());
    let entries = queue.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].method, "POST");
    assert_eq!(entries[0].url, url("/api/mutate"));

    let mut sync_tags = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WorkerEvent::SyncRequested { tag } = event {
            sync_tags.push(tag);
        }
    }
    assert_eq!(sync_tags, vec!["offgrid-sync".to_string()]);

    site.fetcher.set_online(true);
    site.fetcher
        .respond_to(Method::POST, "http://localhost/api/mutate", 200, "{}");
    worker.handle_sync("offgrid-sync").await;

    assert!(queue.is_empty().await.unwrap());
    let replayed = site
        .fetcher
        .calls()
        .into_iter()
        .filter(|c| c.method == Method::POST)
        .count();
    assert_eq!(replayed, 2);
}

#[tokio::test]
async fn failed_replay_keeps_queue_intact() {
    let mut site = Site::in_memory().await;
    let (worker, _events) = site.deploy(config()).await;
    site.fetcher.set_online(false);

    for path in ["/api/a", "/api/b", "/api/c"] {
        let response = site.fetch(Request::post(url(path), "{}")).await;
        assert_eq!(response.status, StatusCode::ACCEPTED);
    }

    let report = worker.replay_queue().await;
    assert_eq!(
        report,
        ReplayReport {
            attempted: 3,
            delivered: 0,
            retained: 3
        }
    );

    let paths: Vec<String> = worker
        .queue()
        .entries()
        .await
        .unwrap()
        .iter()
        .map(|e| e.url.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/api/a", "/api/b", "/api/c"]);
}

#[tokio::test]
async fn replay_message_from_page() {
    let mut site = Site::in_memory().await;
    let (worker, _events) = site.deploy(config()).await;
    site.fetcher.set_online(false);
    site.fetch(Request::post(url("/api/mutate"), "{}")).await;

    site.fetcher.set_online(true);
    site.fetcher
        .respond_to(Method::POST, "http://localhost/api/mutate", 201, "");
    site.registration
        .post_message(&json!({"type": "REPLAY_QUEUE"}))
        .await
        .unwrap();

    assert!(worker.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn plain_text_push_still_notifies() {
    let mut site = Site::in_memory().await;
    let (worker, _events) = site.deploy(config()).await;

    let shown = worker.handle_push(Some(&b"hello"[..])).await;

    let visible = site.notifications.visible();
    assert_eq!(visible.len(), 1);
    assert!(!visible[0].title.is_empty());
    assert_eq!(visible[0].body, "hello");
    assert_eq!(visible[0], shown);
}

#[tokio::test]
async fn runtime_namespace_keeps_newest_entries() {
    let mut site = Site::in_memory().await;
    let (worker, _events) = site
        .deploy(WorkerConfig {
            runtime_max_entries: 3,
            ..config()
        })
        .await;

    for i in 0..5 {
        let asset = format!("http://localhost/static/img/{i}.png");
        site.fetcher.respond(&asset, 200, "png");
        site.fetch(Request::get(Url::parse(&asset).unwrap())).await;
    }
    worker.settle().await;

    let runtime = worker
        .caches()
        .open(&worker.config().namespace_name(CacheRole::Runtime));
    let kept: Vec<String> = runtime
        .keys()
        .await
        .unwrap()
        .into_iter()
        .map(|k| k.url.path().to_string())
        .collect();
    assert_eq!(
        kept,
        vec!["/static/img/2.png", "/static/img/3.png", "/static/img/4.png"]
    );
}

#[tokio::test]
async fn activation_purges_superseded_namespaces() {
    let mut site = Site::in_memory().await;
    let caches = CacheStorage::new(site.db.clone());
    let seed = Request::get(url("/"));
    let seeded = Response {
        kind: offgrid_net::ResponseKind::Basic,
        ..Response::new(StatusCode::OK, "old")
    };
    for name in [
        "offgrid-precache-v0.9.0",
        "offgrid-api-v0.9.0",
        "offgrid-api-v1.0.0",
        "someone-elses-cache",
    ] {
        caches.open(name).put(&seed, &seeded).await.unwrap();
    }

    let (_worker, mut events) = site.deploy(config()).await;

    let remaining = caches.keys().await.unwrap();
    assert!(remaining.contains(&"offgrid-api-v1.0.0".to_string()));
    assert!(!remaining.contains(&"offgrid-precache-v0.9.0".to_string()));
    assert!(!remaining.contains(&"offgrid-api-v0.9.0".to_string()));
    assert!(!remaining.contains(&"someone-elses-cache".to_string()));

    let purged = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
        WorkerEvent::Purged { removed } => Some(removed),
        _ => None,
    });
    assert_eq!(purged.map(|r| r.len()), Some(3));
}

#[tokio::test]
async fn new_version_replaces_old_namespaces() {
    let mut site = Site::in_memory().await;
    site.fetcher.respond("http://localhost/shell-home", 200, "v1");
    let (v1, _events) = site.deploy(config()).await;

    site.fetcher.respond("http://localhost/shell-home", 200, "v2");
    let (v2, _events) = site
        .deploy(WorkerConfig {
            version: "v2.0.0".to_string(),
            ..config()
        })
        .await;

    assert_eq!(v1.state(), WorkerState::Redundant);
    assert_eq!(v2.state(), WorkerState::Active);
    let names = CacheStorage::new(site.db.clone()).keys().await.unwrap();
    assert_eq!(names, vec!["offgrid-precache-v2.0.0".to_string()]);
}

#[tokio::test]
async fn static_asset_second_request_needs_no_network() {
    let mut site = Site::in_memory().await;
    let (worker, _events) = site.deploy(config()).await;
    let asset = "http://localhost/static/app.css";
    site.fetcher.respond(asset, 200, "body{}");

    let first = site.fetch(Request::get(Url::parse(asset).unwrap())).await;
    assert!(!first.from_cache);
    assert_eq!(site.fetcher.call_count(asset), 1);

    site.fetcher.set_online(false);
    let second = site.fetch(Request::get(Url::parse(asset).unwrap())).await;
    assert!(second.from_cache);
    assert_eq!(second.text().unwrap(), "body{}");

    worker.settle().await;
}

#[tokio::test]
async fn api_read_returns_cached_copy_first() {
    let mut site = Site::in_memory().await;
    let (worker, _events) = site.deploy(config()).await;
    let api = "http://localhost/api/lands/approved";
    site.fetcher.respond(api, 200, r#"[1]"#);

    site.fetch(Request::get(Url::parse(api).unwrap())).await;
    site.fetcher.respond(api, 200, r#"[1,2]"#);

    let cached = site.fetch(Request::get(Url::parse(api).unwrap())).await;
    assert!(cached.from_cache);
    assert_eq!(cached.text().unwrap(), "[1]");

    worker.settle().await;
    let fresh = site.fetch(Request::get(Url::parse(api).unwrap())).await;
    assert_eq!(fresh.text().unwrap(), "[1,2]");
}

#[tokio::test]
async fn admin_traffic_is_never_intercepted() {
    let mut site = Site::in_memory().await;
    site.deploy(config()).await;

    let response = site
        .registration
        .handle_fetch(FetchEvent::new(Request::navigate(url("/admin/dashboard"))))
        .await;
    assert!(response.is_none());
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    {
        let mut site = Site::new(Database::open(&path).await.unwrap());
        site.deploy(config()).await;
        site.fetcher.set_online(false);
        let response = site.fetch(Request::post(url("/api/mutate"), "{}")).await;
        assert_eq!(response.status, StatusCode::ACCEPTED);
    }

    let mut site = Site::new(Database::open(&path).await.unwrap());
    site.fetcher
        .respond_to(Method::POST, "http://localhost/api/mutate", 200, "{}");
    let (worker, _events) = site.deploy(config()).await;

    assert_eq!(worker.queue().len().await.unwrap(), 1);
    let report = worker.replay_queue().await;
    assert_eq!(report.delivered, 1);
    assert!(worker.queue().is_empty().await.unwrap());
}
