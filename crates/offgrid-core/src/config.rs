//! Worker configuration
//!
//! A [`WorkerConfig`] is resolved once when a worker instance is built and is
//! never mutated afterwards. Every constant the request layer relies on
//! (version token, path prefixes, trim bounds, notification defaults) lives
//! here so a deployment can override it from a JSON file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{OffgridError, OffgridResult};

/// Logical role of a cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRole {
    /// Shell routes and critical assets populated at install.
    Precache,
    /// Same-origin static assets and default GETs.
    Runtime,
    /// API read responses.
    Api,
    /// Allow-listed external origins (CDN scripts, fonts, icons).
    External,
}

impl CacheRole {
    /// All roles, in the order namespaces are reported.
    pub const ALL: [CacheRole; 4] = [
        CacheRole::Precache,
        CacheRole::Runtime,
        CacheRole::Api,
        CacheRole::External,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheRole::Precache => "precache",
            CacheRole::Runtime => "runtime",
            CacheRole::Api => "api",
            CacheRole::External => "external",
        }
    }
}

impl fmt::Display for CacheRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Defaults used when a push payload omits a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub url: String,
    pub icon: String,
    pub badge: String,
    /// Fallback de-duplication tag. `None` derives `"{prefix}-push"`.
    pub tag: Option<String>,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "New notification".to_string(),
            body: "You have a new message".to_string(),
            url: "/notifications".to_string(),
            icon: "/static/icons/icon-192.png".to_string(),
            badge: "/static/icons/icon-192.png".to_string(),
            tag: None,
            vibrate: vec![100, 50, 100],
        }
    }
}

/// Offline request layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Version token baked into every namespace name.
    pub version: String,

    /// Prefix shared by all namespaces and sync tags of this deployment.
    pub cache_prefix: String,

    /// Registration scope; its origin defines "same-origin".
    pub scope: Url,

    /// Path prefix of the JSON API.
    pub api_prefix: String,

    /// Sub-prefix of the API used for multipart uploads (never queued).
    pub upload_prefix: String,

    /// Prefixes that are never intercepted (e.g. the admin area).
    pub excluded_prefixes: Vec<String>,

    /// Same-origin static asset and user-upload prefixes.
    pub static_prefixes: Vec<String>,

    /// Application form-submission prefixes.
    pub form_prefixes: Vec<String>,

    /// External origins whose GETs are cached (scheme://host[:port]).
    pub external_origins: Vec<String>,

    /// Shell routes and critical assets fetched at install.
    pub precache_urls: Vec<String>,

    /// External assets warmed into the external namespace at install.
    pub external_warm_urls: Vec<String>,

    /// URLs refreshed when the warmup sync tag fires.
    pub warmup_sync_urls: Vec<String>,

    /// Generic shell entries tried, in order, for offline navigations.
    pub shell_fallbacks: Vec<String>,

    /// Cached offline placeholder page.
    pub offline_url: String,

    /// Entry bound for the API namespace.
    pub api_max_entries: usize,

    /// Entry bound for the runtime namespace.
    pub runtime_max_entries: usize,

    /// A network attempt slower than this counts as unavailable.
    pub network_timeout_secs: u64,

    /// Activate immediately after install instead of waiting.
    pub skip_waiting_on_install: bool,

    /// Enable navigation preload during activation.
    pub navigation_preload: bool,

    /// Push notification defaults.
    pub notifications: NotificationDefaults,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let offline_url = "/static/offline.html".to_string();
        Self {
            version: "v1.0.0".to_string(),
            cache_prefix: "offgrid".to_string(),
            scope: Url::parse("http://localhost/").expect("static scope URL is valid"),
            api_prefix: "/api/".to_string(),
            upload_prefix: "/api/uploads/".to_string(),
            excluded_prefixes: vec!["/admin/".to_string()],
            static_prefixes: vec!["/static/".to_string(), "/uploads/".to_string()],
            form_prefixes: vec!["/express/partner/".to_string()],
            external_origins: [
                "https://cdn.tailwindcss.com",
                "https://cdnjs.cloudflare.com",
                "https://unpkg.com",
                "https://cdn.jsdelivr.net",
                "https://fonts.googleapis.com",
                "https://fonts.gstatic.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            precache_urls: [
                "/",
                "/start",
                "/app",
                "/search",
                "/manifest.webmanifest",
                offline_url.as_str(),
                "/static/icons/icon-192.png",
                "/static/icons/icon-512.png",
                "/static/sounds/notify.mp3",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            external_warm_urls: vec![
                "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.5.0/css/all.min.css"
                    .to_string(),
            ],
            warmup_sync_urls: vec!["/".to_string(), "/app".to_string()],
            shell_fallbacks: vec!["/app".to_string(), "/".to_string()],
            offline_url,
            api_max_entries: 50,
            runtime_max_entries: 150,
            network_timeout_secs: 15,
            skip_waiting_on_install: true,
            navigation_preload: true,
            notifications: NotificationDefaults::default(),
        }
    }
}

impl WorkerConfig {
    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> OffgridResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> OffgridResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    fn validate(&self) -> OffgridResult<()> {
        if self.version.trim().is_empty() {
            return Err(OffgridError::config("version token must not be empty"));
        }
        if self.cache_prefix.trim().is_empty() {
            return Err(OffgridError::config("cache_prefix must not be empty"));
        }
        if !self.api_prefix.starts_with('/') {
            return Err(OffgridError::config(format!(
                "api_prefix must be an absolute path: {}",
                self.api_prefix
            )));
        }
        Ok(())
    }

    /// Namespace name for a role under the current version.
    pub fn namespace_name(&self, role: CacheRole) -> String {
        format!("{}-{}-{}", self.cache_prefix, role, self.version)
    }

    /// Names of every namespace that belongs to the current version.
    pub fn current_namespaces(&self) -> Vec<String> {
        CacheRole::ALL
            .iter()
            .map(|role| self.namespace_name(*role))
            .collect()
    }

    /// Entry bound for a role, if the role is trimmed.
    pub fn max_entries(&self, role: CacheRole) -> Option<usize> {
        match role {
            CacheRole::Api => Some(self.api_max_entries),
            CacheRole::Runtime => Some(self.runtime_max_entries),
            CacheRole::Precache | CacheRole::External => None,
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    /// Sync tag that replays the mutation queue.
    pub fn sync_tag(&self) -> String {
        format!("{}-sync", self.cache_prefix)
    }

    /// Sync tag that refreshes the warmup URL list.
    pub fn warmup_tag(&self) -> String {
        format!("{}-warmup", self.cache_prefix)
    }

    /// Notification tag used when a push payload carries none.
    pub fn default_push_tag(&self) -> String {
        self.notifications
            .tag
            .clone()
            .unwrap_or_else(|| format!("{}-push", self.cache_prefix))
    }

    /// Resolve a scope-relative path (or absolute URL) to an absolute URL.
    pub fn resolve(&self, path: &str) -> OffgridResult<Url> {
        Ok(self.scope.join(path)?)
    }

    /// Whether `url` shares the scope's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin()
    }

    /// Whether `url`'s origin is on the external allow-list.
    pub fn is_external_origin(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        self.external_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/') == origin)
    }
}
