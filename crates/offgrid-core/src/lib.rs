//! Offgrid Core Library
//!
//! Shared configuration, errors, and logging setup for the offline-first
//! request layer.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{CacheRole, NotificationDefaults, WorkerConfig};
pub use error::{OffgridError, OffgridResult};
pub use logging::{init_logging, LogConfig, LogFormat};
