//! Registration: version handoff between worker instances.
//!
//! A registration owns up to three workers for one scope. A new version
//! installs into the `installing` slot, moves to `waiting`, and is promoted
//! to `active` once nothing holds it back: there is no active worker, the
//! active worker controls no open client, or the waiting worker asked to
//! skip waiting. Promotion retires the previous active worker before the
//! new one purges stale namespaces.

use std::sync::Arc;

use offgrid_net::Response;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{ClientHub, ClientMatchOptions};
use crate::control::ControlMessage;
use crate::worker::{FetchEvent, OfflineWorker};
use crate::WorkerResult;

/// Worker slots for one scope.
pub struct Registration {
    scope: Url,
    installing: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
    active: Option<Arc<OfflineWorker>>,
    clients: Arc<dyn ClientHub>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("scope", &self.scope.as_str())
            .field("installing", &self.installing.as_ref().map(|w| w.id()))
            .field("waiting", &self.waiting.as_ref().map(|w| w.id()))
            .field("active", &self.active.as_ref().map(|w| w.id()))
            .finish()
    }
}

impl Registration {
    pub fn new(scope: Url, clients: Arc<dyn ClientHub>) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            clients,
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn installing(&self) -> Option<&Arc<OfflineWorker>> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&Arc<OfflineWorker>> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&Arc<OfflineWorker>> {
        self.active.as_ref()
    }

    /// Install a new worker version and promote it if possible.
    ///
    /// A worker that fails to install becomes redundant and leaves the
    /// other slots untouched.
    pub async fn register(&mut self, worker: Arc<OfflineWorker>) -> WorkerResult<()> {
        if let Some(previous) = self.installing.replace(worker.clone()) {
            previous.mark_redundant();
        }

        if let Err(e) = worker.install().await {
            warn!(worker = %worker.id(), error = %e, "Install failed");
            worker.mark_redundant();
            self.installing = None;
            return Err(e);
        }
        self.installing = None;

        if let Some(superseded) = self.waiting.replace(worker) {
            debug!(worker = %superseded.id(), "Waiting worker superseded");
            superseded.mark_redundant();
        }

        self.try_activate().await?;
        Ok(())
    }

    /// Promote the waiting worker if nothing holds it back. Returns whether
    /// a promotion happened.
    pub async fn try_activate(&mut self) -> WorkerResult<bool> {
        let Some(waiting) = &self.waiting else {
            return Ok(false);
        };

        let ready = self.active.is_none()
            || waiting.skip_waiting_requested()
            || self.controlled_clients() == 0;
        if !ready {
            debug!(
                worker = %waiting.id(),
                clients = self.controlled_clients(),
                "Worker waiting for clients to close"
            );
            return Ok(false);
        }

        self.promote().await?;
        Ok(true)
    }

    /// Notify the registration that a page closed.
    pub async fn client_closed(&mut self) -> WorkerResult<bool> {
        self.try_activate().await
    }

    async fn promote(&mut self) -> WorkerResult<()> {
        let Some(next) = self.waiting.take() else {
            return Ok(());
        };

        if let Some(previous) = self.active.take() {
            previous.mark_redundant();
        }

        if let Err(e) = next.activate().await {
            warn!(worker = %next.id(), error = %e, "Activation failed");
            next.mark_redundant();
            return Err(e);
        }

        info!(worker = %next.id(), scope = %self.scope, "Worker now controls scope");
        self.active = Some(next);
        Ok(())
    }

    /// Number of open clients controlled by the active worker.
    fn controlled_clients(&self) -> usize {
        let Some(active) = &self.active else {
            return 0;
        };
        self.clients
            .match_all(ClientMatchOptions::default())
            .iter()
            .filter(|c| c.controller == Some(active.id()))
            .count()
    }

    /// Route a fetch event to the active worker.
    pub async fn handle_fetch(&self, event: FetchEvent) -> Option<Response> {
        match &self.active {
            Some(active) => active.handle_fetch(event).await,
            None => None,
        }
    }

    /// Deliver a page message. A takeover request goes to the waiting
    /// worker and promotes it; everything else goes to the active worker.
    pub async fn post_message(&mut self, message: &Value) -> WorkerResult<ControlMessage> {
        if ControlMessage::parse(message) == ControlMessage::SkipWaiting {
            if let Some(waiting) = &self.waiting {
                waiting.handle_message(message).await;
                self.try_activate().await?;
            }
            return Ok(ControlMessage::SkipWaiting);
        }

        match &self.active {
            Some(active) => Ok(active.handle_message(message).await),
            None => Ok(ControlMessage::parse(message)),
        }
    }

    /// Retire every worker.
    pub fn unregister(&mut self) {
        for worker in [
            self.installing.take(),
            self.waiting.take(),
            self.active.take(),
        ]
        .into_iter()
        .flatten()
        {
            worker.mark_redundant();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Client, Clients, WorkerState};
    use offgrid_core::WorkerConfig;
    use offgrid_net::mock::MockFetcher;
    use offgrid_store::Database;
    use serde_json::json;

    fn config(version: &str, skip_waiting: bool) -> WorkerConfig {
        WorkerConfig {
            version: version.to_string(),
            precache_urls: vec![],
            external_warm_urls: vec![],
            skip_waiting_on_install: skip_waiting,
            ..WorkerConfig::default()
        }
    }

    fn worker(db: &Database, clients: &Arc<Clients>, config: WorkerConfig) -> Arc<OfflineWorker> {
        let (worker, _events) = OfflineWorker::builder(config)
            .database(db.clone())
            .fetcher(Arc::new(MockFetcher::new()))
            .clients(clients.clone())
            .build()
            .unwrap();
        Arc::new(worker)
    }

    fn scope() -> Url {
        Url::parse("http://localhost/").unwrap()
    }

    #[tokio::test]
    async fn test_first_worker_activates_immediately() {
        let db = Database::open_in_memory().await.unwrap();
        let clients = Arc::new(Clients::new());
        let mut registration = Registration::new(scope(), clients.clone());

        let v1 = worker(&db, &clients, config("v1", false));
        registration.register(v1.clone()).await.unwrap();

        assert_eq!(v1.state(), WorkerState::Active);
        assert!(registration.waiting().is_none());
        assert_eq!(registration.active().unwrap().id(), v1.id());
    }

    #[tokio::test]
    async fn test_new_version_waits_for_clients() {
        let db = Database::open_in_memory().await.unwrap();
        let clients = Arc::new(Clients::new());
        let page = Client::window(Url::parse("http://localhost/app").unwrap());
        clients.add(page.clone());
        let mut registration = Registration::new(scope(), clients.clone());

        let v1 = worker(&db, &clients, config("v1", false));
        registration.register(v1.clone()).await.unwrap();

        let v2 = worker(&db, &clients, config("v2", false));
        registration.register(v2.clone()).await.unwrap();
        assert_eq!(v2.state(), WorkerState::Waiting);
        assert_eq!(v1.state(), WorkerState::Active);

        clients.remove(&page.id);
        assert!(registration.client_closed().await.unwrap());
        assert_eq!(v2.state(), WorkerState::Active);
        assert_eq!(v1.state(), WorkerState::Redundant);
    }

    #[tokio::test]
    async fn test_skip_waiting_message_promotes() {
        let db = Database::open_in_memory().await.unwrap();
        let clients = Arc::new(Clients::new());
        clients.add(Client::window(Url::parse("http://localhost/app").unwrap()));
        let mut registration = Registration::new(scope(), clients.clone());

        let v1 = worker(&db, &clients, config("v1", false));
        registration.register(v1.clone()).await.unwrap();
        let v2 = worker(&db, &clients, config("v2", false));
        registration.register(v2.clone()).await.unwrap();
        assert_eq!(v2.state(), WorkerState::Waiting);

        let routed = registration
            .post_message(&json!({"type": "SKIP_WAITING"}))
            .await
            .unwrap();
        assert_eq!(routed, ControlMessage::SkipWaiting);
        assert_eq!(v2.state(), WorkerState::Active);
        assert_eq!(v1.state(), WorkerState::Redundant);
    }

    #[tokio::test]
    async fn test_skip_waiting_on_install_takes_over() {
        let db = Database::open_in_memory().await.unwrap();
        let clients = Arc::new(Clients::new());
        clients.add(Client::window(Url::parse("http://localhost/app").unwrap()));
        let mut registration = Registration::new(scope(), clients.clone());

        let v1 = worker(&db, &clients, config("v1", true));
        registration.register(v1.clone()).await.unwrap();
        let v2 = worker(&db, &clients, config("v2", true));
        registration.register(v2.clone()).await.unwrap();

        assert_eq!(v2.state(), WorkerState::Active);
        assert_eq!(v1.state(), WorkerState::Redundant);
    }

    #[tokio::test]
    async fn test_unregister_retires_everything() {
        let db = Database::open_in_memory().await.unwrap();
        let clients = Arc::new(Clients::new());
        let mut registration = Registration::new(scope(), clients.clone());

        let v1 = worker(&db, &clients, config("v1", true));
        registration.register(v1.clone()).await.unwrap();
        registration.unregister();

        assert_eq!(v1.state(), WorkerState::Redundant);
        assert!(registration.active().is_none());
    }
}
