//! Clients: the pages a worker controls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use hashbrown::HashMap;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{WorkerError, WorkerId, WorkerResult};

/// A client (open page or worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Worker currently controlling this client.
    pub controller: Option<WorkerId>,
}

impl Client {
    /// A new, uncontrolled window client.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// Options for [`ClientHub::match_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientMatchOptions {
    /// Every window, controlled or not.
    pub fn all_windows() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        }
    }
}

/// Platform seam for reaching open clients.
pub trait ClientHub: Send + Sync {
    /// Clients matching `options`.
    fn match_all(&self, options: ClientMatchOptions) -> Vec<Client>;

    /// Deliver a structured message to one client.
    fn post_message(&self, client_id: &str, message: &Value) -> WorkerResult<()>;

    /// Focus a window client.
    fn focus<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, WorkerResult<Client>>;

    /// Open a new window at `url`.
    fn open_window<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, WorkerResult<Client>>;

    /// Make `worker` the controller of every client in scope. Returns how
    /// many clients changed controller.
    fn claim(&self, worker: WorkerId, scope: &Url) -> WorkerResult<usize>;
}

/// In-process [`ClientHub`].
#[derive(Debug, Default)]
pub struct Clients {
    inner: Mutex<ClientsInner>,
}

#[derive(Debug, Default)]
struct ClientsInner {
    clients: HashMap<String, Client>,
    order: Vec<String>,
    inbox: HashMap<String, Vec<Value>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client.
    pub fn add(&self, client: Client) {
        let mut inner = self.lock();
        inner.order.push(client.id.clone());
        inner.clients.insert(client.id.clone(), client);
    }

    /// Remove a client (its page closed).
    pub fn remove(&self, id: &str) -> Option<Client> {
        let mut inner = self.lock();
        inner.order.retain(|c| c != id);
        inner.inbox.remove(id);
        inner.clients.remove(id)
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<Client> {
        self.lock().clients.get(id).cloned()
    }

    /// Messages delivered to a client, oldest first.
    pub fn messages(&self, id: &str) -> Vec<Value> {
        self.lock().inbox.get(id).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, ClientsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientHub for Clients {
    fn match_all(&self, options: ClientMatchOptions) -> Vec<Client> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.clients.get(id))
            .filter(|c| options.include_uncontrolled || c.controller.is_some())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .cloned()
            .collect()
    }

    fn post_message(&self, client_id: &str, message: &Value) -> WorkerResult<()> {
        let mut inner = self.lock();
        if !inner.clients.contains_key(client_id) {
            return Err(WorkerError::Client(format!("no such client: {client_id}")));
        }
        inner
            .inbox
            .entry(client_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn focus<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, WorkerResult<Client>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let target = match inner.clients.get(client_id) {
                Some(c) if c.client_type == ClientType::Window => c.id.clone(),
                Some(_) => {
                    return Err(WorkerError::Client(
                        "Can only focus window clients".to_string(),
                    ))
                }
                None => return Err(WorkerError::Client(format!("no such client: {client_id}"))),
            };
            for client in inner.clients.values_mut() {
                client.focused = client.id == target;
            }
            inner
                .clients
                .get(&target)
                .cloned()
                .ok_or_else(|| WorkerError::Client(format!("no such client: {client_id}")))
        })
    }

    fn open_window<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, WorkerResult<Client>> {
        Box::pin(async move {
            let mut client = Client::window(url.clone());
            client.focused = true;
            let mut inner = self.lock();
            for other in inner.clients.values_mut() {
                other.focused = false;
            }
            inner.order.push(client.id.clone());
            inner.clients.insert(client.id.clone(), client.clone());
            debug!(client = %client.id, url = %url, "Opened window");
            Ok(client)
        })
    }

    fn claim(&self, worker: WorkerId, scope: &Url) -> WorkerResult<usize> {
        let mut inner = self.lock();
        let mut claimed = 0;
        for client in inner.clients.values_mut() {
            if client.url.origin() == scope.origin()
                && client.url.path().starts_with(scope.path())
                && client.controller != Some(worker)
            {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        Ok(claimed)
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
