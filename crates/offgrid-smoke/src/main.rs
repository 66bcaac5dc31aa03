//! Offgrid smoke test
//!
//! Drives one worker version against a live origin: install, activate,
//! then a navigation and an API read through the interception layer.
//! Run it a second time with `--offline-replay` after stopping the origin
//! to exercise the cache fallbacks and the mutation queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use offgrid_core::{init_logging, LogConfig, WorkerConfig};
use offgrid_net::{HttpFetcher, LoaderConfig, Request};
use offgrid_store::Database;
use offgrid_sw::{Clients, FetchEvent, OfflineWorker, Registration, WorkerEvent};
use tracing::{error, info, warn};
use url::Url;

/// Command line arguments
struct Args {
    origin: Option<String>,
    db: PathBuf,
    config: Option<PathBuf>,
    api_path: String,
    log_json: bool,
    offline_replay: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1).peekable();
        let mut origin = None;
        let mut db = PathBuf::from("offgrid-smoke.db");
        let mut config = None;
        let mut api_path = "/api/health".to_string();
        let mut log_json = false;
        let mut offline_replay = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    if let Some(val) = args.next() {
                        db = PathBuf::from(val);
                    }
                }
                "--config" => {
                    config = args.next().map(PathBuf::from);
                }
                "--api" => {
                    if let Some(val) = args.next() {
                        api_path = val;
                    }
                }
                "--log-json" => {
                    log_json = true;
                }
                "--offline-replay" => {
                    offline_replay = true;
                }
                other if !other.starts_with("--") && origin.is_none() => {
                    origin = Some(other.to_string());
                }
                _ => {}
            }
        }

        Self {
            origin,
            db,
            config,
            api_path,
            log_json,
            offline_replay,
        }
    }

    fn load_config(&self) -> anyhow::Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_json_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => WorkerConfig::default(),
        };
        if let Some(origin) = &self.origin {
            config.scope = Url::parse(origin).with_context(|| format!("bad origin {origin}"))?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_config = if args.log_json {
        LogConfig::production()
    } else {
        LogConfig::default().with_filter("info,offgrid_sw=debug,offgrid_store=debug")
    };
    init_logging(log_config)?;

    let config = args.load_config()?;
    info!(
        scope = %config.scope,
        version = %config.version,
        db = %args.db.display(),
        "Offgrid smoke test starting"
    );

    let db = Database::open(&args.db).await?;
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig {
        timeout: config.network_timeout(),
        ..LoaderConfig::default()
    })?);
    let clients = Arc::new(Clients::new());

    let (worker, mut events) = OfflineWorker::builder(config.clone())
        .database(db)
        .fetcher(fetcher)
        .clients(clients.clone())
        .build()?;
    let worker = Arc::new(worker);

    let mut registration = Registration::new(config.scope.clone(), clients);
    registration.register(worker.clone()).await?;
    info!(state = %worker.state(), "Registration settled");

    let mut failures = 0;

    let home = config.resolve("/")?;
    match registration
        .handle_fetch(FetchEvent::new(Request::navigate(home.clone())))
        .await
    {
        Some(response) => info!(
            url = %home,
            status = %response.status,
            from_cache = response.from_cache,
            bytes = response.body.len(),
            "Navigation served"
        ),
        None => {
            error!(url = %home, "Navigation was not intercepted");
            failures += 1;
        }
    }

    let api = config.resolve(&args.api_path)?;
    match registration
        .handle_fetch(FetchEvent::new(Request::get(api.clone())))
        .await
    {
        Some(response) => info!(
            url = %api,
            status = %response.status,
            from_cache = response.from_cache,
            "API read served"
        ),
        None => {
            warn!(url = %api, "API read was not intercepted");
        }
    }

    if args.offline_replay {
        let pending = worker.queue().len().await?;
        let report = worker.replay_queue().await;
        info!(
            pending,
            delivered = report.delivered,
            retained = report.retained,
            "Queue replay finished"
        );
    }

    let settled = worker.settle().await;
    info!(tasks = settled, "Background work settled");

    while let Ok(event) = events.try_recv() {
        match event {
            WorkerEvent::Precached { cached, failed } => {
                info!(cached, failed, "Precache result");
                if cached == 0 && failed > 0 {
                    failures += 1;
                }
            }
            WorkerEvent::Purged { removed } => info!(?removed, "Stale namespaces removed"),
            WorkerEvent::SyncRequested { tag } => info!(%tag, "Sync requested"),
            other => info!(event = ?other, "Worker event"),
        }
    }

    let namespaces = worker.caches().keys().await?;
    info!(
        namespaces = %serde_json::to_string(&namespaces)?,
        "Cache storage"
    );

    if failures > 0 {
        bail!("smoke test finished with {failures} failure(s)");
    }
    info!("Offgrid smoke test passed");
    Ok(())
}
