//! # Offgrid Store
//!
//! Durable state of the offline request layer.
//!
//! ## Features
//!
//! - **Cache namespaces**: named, versioned request → response stores
//! - **Eviction**: FIFO-by-insertion trimming to an entry bound
//! - **Mutation queue**: ordered, durable log of failed mutating requests
//!   with at-least-once replay
//!
//! ## Architecture
//!
//! ```text
//! Database (one SQLite file)
//!     │
//!     ├── CacheStorage
//!     │       └── Namespace ("{prefix}-{role}-{version}")
//!     │               └── request identity → stored response
//!     │
//!     └── MutationQueue
//!             └── QueueEntry (id ascending = enqueue order)
//! ```

use thiserror::Error;

pub mod database;
pub mod evict;
pub mod namespace;
pub mod queue;

pub use database::Database;
pub use namespace::{CacheStorage, MatchOptions, Namespace, RequestIdentity};
pub use queue::{MutationQueue, NewQueueEntry, QueueEntry, ReplayReport};

/// Errors raised by the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::rusqlite::Error),

    #[error("Connection error: {0}")]
    Connection(tokio_rusqlite::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => StoreError::Database(e),
            other => StoreError::Connection(other),
        }
    }
}

impl From<tokio_rusqlite::Error<StoreError>> for StoreError {
    fn from(err: tokio_rusqlite::Error<StoreError>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::Close(c) => {
                StoreError::Connection(tokio_rusqlite::Error::Close(c))
            }
            _ => StoreError::Connection(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for offgrid_core::OffgridError {
    fn from(err: StoreError) -> Self {
        offgrid_core::OffgridError::store(err.to_string())
    }
}
