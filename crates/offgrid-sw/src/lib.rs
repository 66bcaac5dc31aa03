//! # Offgrid Worker
//!
//! Offline-first request interception for a web client.
//!
//! ## Features
//!
//! - **Fetch interception**: per-category serving policies over versioned
//!   cache namespaces
//! - **Mutation queue**: failed writes are acknowledged with 202 and
//!   replayed later with at-least-once delivery
//! - **Lifecycle**: `Installing → Waiting → Activating → Active → Redundant`
//!   with a registration that hands control from one version to the next
//! - **Push bridge**: push payloads become notifications; clicks focus or
//!   open a client window
//! - **Control channel**: warmup, queueing and takeover messages from pages
//!
//! ## Architecture
//!
//! ```text
//! Registration
//!     ├── installing (OfflineWorker)
//!     ├── waiting (OfflineWorker)
//!     └── active (OfflineWorker)
//!             ├── RequestClassifier ── Category
//!             ├── PolicyExecutor
//!             │       ├── CacheStorage ── Namespace ("{prefix}-{role}-{version}")
//!             │       ├── MutationQueue
//!             │       └── Fetcher
//!             ├── ClientHub / Notifier (platform seams)
//!             └── LifetimeTracker (wait_until / settle)
//! ```

use offgrid_net::NetError;
use offgrid_store::{ReplayReport, StoreError};
use thiserror::Error;

pub mod clients;
pub mod control;
pub mod lifecycle;
pub mod lifetime;
pub mod notification;
pub mod policy;
pub mod push;
pub mod registration;
pub mod worker;

pub use clients::{Client, ClientHub, ClientMatchOptions, ClientType, Clients};
pub use control::ControlMessage;
pub use lifecycle::{WorkerId, WorkerState};
pub use lifetime::LifetimeTracker;
pub use notification::{NotificationCenter, NotificationDescriptor, Notifier};
pub use policy::{PolicyExecutor, WarmReport, WarmRoute};
pub use push::{ClickOutcome, PushPayload};
pub use registration::Registration;
pub use worker::{FetchEvent, OfflineWorker, OfflineWorkerBuilder};

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    #[error("Worker {0} is redundant")]
    Redundant(WorkerId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Missing component: {0}")]
    Builder(&'static str),
}

/// Result type alias for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

impl From<WorkerError> for offgrid_core::OffgridError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Network(e) => e.into(),
            WorkerError::Store(e) => e.into(),
            other => offgrid_core::OffgridError::lifecycle(other.to_string()),
        }
    }
}

// ==================== Events ====================

/// Events emitted by a worker for the hosting platform.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Lifecycle state changed.
    StateChange { worker: WorkerId, state: WorkerState },
    /// Install finished populating the precache.
    Precached { cached: usize, failed: usize },
    /// Activation removed superseded namespaces.
    Purged { removed: Vec<String> },
    /// The worker wants the platform to fire a background sync with `tag`
    /// once connectivity returns.
    SyncRequested { tag: String },
    /// A queue replay pass finished.
    Replayed(ReplayReport),
}
