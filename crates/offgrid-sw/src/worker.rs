//! The offline worker: one versioned instance of the interception layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use offgrid_core::WorkerConfig;
use offgrid_net::{Fetcher, Request, RequestClassifier, Response};
use offgrid_store::{CacheStorage, Database, MutationQueue, NewQueueEntry, ReplayReport};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::clients::{ClientHub, ClientMatchOptions, Clients};
use crate::control::{body_text, ControlMessage};
use crate::notification::{NotificationCenter, NotificationDescriptor, Notifier};
use crate::policy::{PolicyExecutor, WarmReport, WarmRoute};
use crate::push::{ClickOutcome, PushPayload};
use crate::{LifetimeTracker, WorkerError, WorkerEvent, WorkerId, WorkerResult, WorkerState};

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    /// Navigation preload response supplied by the platform, if any.
    pub preload: Option<Response>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            preload: None,
        }
    }

    pub fn with_preload(mut self, response: Response) -> Self {
        self.preload = Some(response);
        self
    }
}

/// Builder for [`OfflineWorker`].
pub struct OfflineWorkerBuilder {
    config: WorkerConfig,
    database: Option<Database>,
    fetcher: Option<Arc<dyn Fetcher>>,
    clients: Option<Arc<dyn ClientHub>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl OfflineWorkerBuilder {
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Platform client hub. Defaults to an in-process [`Clients`].
    pub fn clients(mut self, clients: Arc<dyn ClientHub>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Platform notifier. Defaults to an in-process [`NotificationCenter`].
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the worker in the `Installing` state, along with the receiver
    /// of its events.
    pub fn build(self) -> WorkerResult<(OfflineWorker, mpsc::UnboundedReceiver<WorkerEvent>)> {
        let database = self.database.ok_or(WorkerError::Builder("database"))?;
        let fetcher = self.fetcher.ok_or(WorkerError::Builder("fetcher"))?;
        let clients = self
            .clients
            .unwrap_or_else(|| Arc::new(Clients::new()) as Arc<dyn ClientHub>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(NotificationCenter::new()) as Arc<dyn Notifier>);

        let config = Arc::new(self.config);
        let caches = CacheStorage::new(database.clone());
        let queue = MutationQueue::new(database);
        let lifetime = LifetimeTracker::new();
        let (state, state_rx) = watch::channel(WorkerState::Installing);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let executor = PolicyExecutor::new(
            config.clone(),
            caches.clone(),
            queue.clone(),
            fetcher,
            lifetime.clone(),
            state_rx,
            event_tx.clone(),
        );

        let worker = OfflineWorker {
            id: WorkerId::new(),
            classifier: RequestClassifier::from_config(&config),
            config,
            executor,
            caches,
            queue,
            clients,
            notifier,
            lifetime,
            state,
            skip_waiting: AtomicBool::new(false),
            navigation_preload: AtomicBool::new(false),
            events: event_tx,
        };
        info!(worker = %worker.id, version = %worker.config.version, "Worker created");

        Ok((worker, event_rx))
    }
}

/// One versioned instance of the interception layer.
pub struct OfflineWorker {
    id: WorkerId,
    config: Arc<WorkerConfig>,
    classifier: RequestClassifier,
    executor: PolicyExecutor,
    caches: CacheStorage,
    queue: MutationQueue,
    clients: Arc<dyn ClientHub>,
    notifier: Arc<dyn Notifier>,
    lifetime: LifetimeTracker,
    state: watch::Sender<WorkerState>,
    skip_waiting: AtomicBool,
    navigation_preload: AtomicBool,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl OfflineWorker {
    pub fn builder(config: WorkerConfig) -> OfflineWorkerBuilder {
        OfflineWorkerBuilder {
            config,
            database: None,
            fetcher: None,
            clients: None,
            notifier: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn navigation_preload_enabled(&self) -> bool {
        self.navigation_preload.load(Ordering::SeqCst)
    }

    /// Ask to be activated without waiting for the previous version's
    /// clients to close.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Wait for every outstanding background task.
    pub async fn settle(&self) -> usize {
        self.lifetime.settle().await
    }

    fn transition(&self, next: WorkerState) -> WorkerResult<()> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition { from, to: next });
        }
        self.state.send_replace(next);
        debug!(worker = %self.id, from = %from, to = %next, "State changed");
        let _ = self.events.send(WorkerEvent::StateChange {
            worker: self.id,
            state: next,
        });
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Populate the precache and the external namespace, then move to
    /// `Waiting`. Individual fetch failures never fail the install.
    pub async fn install(&self) -> WorkerResult<WarmReport> {
        if self.state() != WorkerState::Installing {
            return Err(WorkerError::InvalidTransition {
                from: self.state(),
                to: WorkerState::Waiting,
            });
        }

        let (shell, external) = futures::join!(
            self.executor
                .warm(&self.config.precache_urls, WarmRoute::Shell),
            self.executor
                .warm(&self.config.external_warm_urls, WarmRoute::External),
        );
        let report = WarmReport {
            cached: shell.cached + external.cached,
            failed: shell.failed + external.failed,
        };
        if report.failed > 0 {
            warn!(
                worker = %self.id,
                failed = report.failed,
                "Some precache URLs could not be fetched"
            );
        }
        let _ = self.events.send(WorkerEvent::Precached {
            cached: report.cached,
            failed: report.failed,
        });

        if self.config.skip_waiting_on_install {
            self.skip_waiting();
        }
        self.transition(WorkerState::Waiting)?;
        info!(worker = %self.id, cached = report.cached, "Worker installed");
        Ok(report)
    }

    /// Purge superseded namespaces, claim open clients, enable navigation
    /// preload, and become `Active`.
    pub async fn activate(&self) -> WorkerResult<()> {
        self.transition(WorkerState::Activating)?;

        let current = self.config.current_namespaces();
        match self.caches.purge_stale(&current).await {
            Ok(removed) => {
                let _ = self.events.send(WorkerEvent::Purged { removed });
            }
            Err(e) => warn!(worker = %self.id, error = %e, "Namespace purge failed"),
        }

        match self.clients.claim(self.id, &self.config.scope) {
            Ok(claimed) => debug!(worker = %self.id, claimed, "Claimed clients"),
            Err(e) => warn!(worker = %self.id, error = %e, "Could not claim clients"),
        }

        if self.config.navigation_preload {
            self.navigation_preload.store(true, Ordering::SeqCst);
        }

        self.transition(WorkerState::Active)?;
        info!(worker = %self.id, version = %self.config.version, "Worker active");
        Ok(())
    }

    /// Retire this worker. Pending cache writes are dropped from now on.
    pub fn mark_redundant(&self) {
        if self.state().is_terminal() {
            return;
        }
        if let Err(e) = self.transition(WorkerState::Redundant) {
            warn!(worker = %self.id, error = %e, "Could not retire worker");
        }
    }

    // ==================== Events ====================

    /// Serve an intercepted request. `None` lets the platform's default
    /// network path handle it.
    pub async fn handle_fetch(&self, event: FetchEvent) -> Option<Response> {
        if self.state() != WorkerState::Active {
            return None;
        }
        let category = self.classifier.classify(&event.request);
        if !category.is_intercepted() {
            return None;
        }
        let preload = if self.navigation_preload_enabled() {
            event.preload
        } else {
            None
        };
        self.executor.execute(category, &event.request, preload).await
    }

    /// Show a notification for a push message, then republish its payload
    /// to every open window.
    pub async fn handle_push(&self, raw: Option<&[u8]>) -> NotificationDescriptor {
        let payload = PushPayload::from_bytes(raw);
        let notification = payload.to_notification(&self.config);

        if let Err(e) = self.notifier.show(&notification).await {
            warn!(tag = %notification.tag, error = %e, "Could not show notification");
        }

        let message = json!({ "type": "PUSH_RECEIVED", "payload": payload.to_value() });
        for client in self.clients.match_all(ClientMatchOptions::all_windows()) {
            if let Err(e) = self.clients.post_message(&client.id, &message) {
                debug!(client = %client.id, error = %e, "Could not deliver push payload");
            }
        }
        notification
    }

    /// Close the notification and bring its target page to the front.
    pub async fn handle_notification_click(
        &self,
        notification: &NotificationDescriptor,
    ) -> ClickOutcome {
        self.notifier.close(&notification.tag);

        let target = match self.config.resolve(&notification.url) {
            Ok(target) => target,
            Err(e) => {
                warn!(url = %notification.url, error = %e, "Notification target is not a URL");
                return ClickOutcome::Nothing;
            }
        };

        let existing = self
            .clients
            .match_all(ClientMatchOptions::all_windows())
            .into_iter()
            .find(|c| c.url.path() == target.path());

        if let Some(client) = existing {
            match self.clients.focus(&client.id).await {
                Ok(focused) => return ClickOutcome::Focused(focused.id),
                Err(e) => debug!(client = %client.id, error = %e, "Focus failed, opening window"),
            }
        }

        match self.clients.open_window(&target).await {
            Ok(opened) => ClickOutcome::Opened(opened.id),
            Err(e) => {
                warn!(url = %target, error = %e, "Could not open window");
                ClickOutcome::Nothing
            }
        }
    }

    /// Handle a control message from a page. Returns the decoded message.
    pub async fn handle_message(&self, message: &Value) -> ControlMessage {
        let decoded = ControlMessage::parse(message);
        if self.state().is_terminal() {
            debug!(worker = %self.id, "Redundant worker ignores messages");
            return decoded;
        }

        match &decoded {
            ControlMessage::Warmup { urls } => {
                let report = self.executor.warm(urls, WarmRoute::Shell).await;
                debug!(cached = report.cached, failed = report.failed, "Warmup finished");
            }
            ControlMessage::WarmupIcons { urls } => {
                let urls = urls.as_ref().unwrap_or(&self.config.external_warm_urls);
                let report = self.executor.warm(urls, WarmRoute::External).await;
                debug!(cached = report.cached, failed = report.failed, "External warmup finished");
            }
            ControlMessage::QueueRequest {
                url,
                method,
                headers,
                body,
                credentials,
            } => match self.config.resolve(url) {
                Ok(url) => {
                    let entry = NewQueueEntry {
                        url,
                        method: method.clone().unwrap_or_else(|| "POST".to_string()),
                        headers: headers.clone(),
                        body: body_text(body),
                        credentials: credentials.unwrap_or_default(),
                    };
                    self.executor.enqueue(entry).await;
                }
                Err(e) => warn!(url = %url, error = %e, "Cannot queue request for invalid URL"),
            },
            ControlMessage::SkipWaiting => self.skip_waiting(),
            ControlMessage::ReplayQueue => {
                self.replay_queue().await;
            }
            ControlMessage::WarmupSync => {
                let _ = self.events.send(WorkerEvent::SyncRequested {
                    tag: self.config.warmup_tag(),
                });
            }
            ControlMessage::Unknown => {}
        }
        decoded
    }

    /// Handle a background sync event.
    pub async fn handle_sync(&self, tag: &str) {
        if self.state().is_terminal() {
            return;
        }
        if tag == self.config.sync_tag() {
            self.replay_queue().await;
        } else if tag == self.config.warmup_tag() {
            let report = self
                .executor
                .warm(&self.config.warmup_sync_urls, WarmRoute::Shell)
                .await;
            debug!(cached = report.cached, failed = report.failed, "Warmup sync finished");
        } else {
            debug!(tag, "Ignoring unknown sync tag");
        }
    }

    /// Replay the mutation queue now.
    pub async fn replay_queue(&self) -> ReplayReport {
        self.executor.replay().await
    }
}
