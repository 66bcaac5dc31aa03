//! # Offgrid Net
//!
//! HTTP-shaped values and the network seam for the offline request layer.
//!
//! ## Design Goals
//!
//! 1. **Plain values**: requests and responses are fully buffered and
//!    cheaply cloneable so they can be written to a cache and served at once
//! 2. **One seam**: everything that touches the network goes through
//!    [`Fetcher`], so the worker can be driven by a real client or a script
//! 3. **Classification**: [`RequestClassifier`] maps a request to the
//!    serving policy family it belongs to

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod classify;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use classify::{Category, RequestClassifier};

/// Errors that can occur in networking.
#[derive(Error, Debug, Clone)]
pub enum NetError {
    #[error("Network unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Body read failed: {0}")]
    Body(String),
}

impl From<NetError> for offgrid_core::OffgridError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Timeout(after) => offgrid_core::OffgridError::Timeout(after),
            NetError::InvalidRequest(msg) => offgrid_core::OffgridError::request(msg),
            other => offgrid_core::OffgridError::network(other.to_string()),
        }
    }
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    /// Never send cookies or authorization.
    Omit,
    /// Send credentials only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send credentials.
    Include,
}

impl CredentialsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialsMode::Omit => "omit",
            CredentialsMode::SameOrigin => "same-origin",
            CredentialsMode::Include => "include",
        }
    }
}

impl fmt::Display for CredentialsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialsMode {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "omit" => Ok(CredentialsMode::Omit),
            "same-origin" => Ok(CredentialsMode::SameOrigin),
            "include" => Ok(CredentialsMode::Include),
            other => Err(NetError::InvalidRequest(format!(
                "unknown credentials mode: {other}"
            ))),
        }
    }
}

/// Request mode as seen by the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Cross-origin with CORS.
    #[default]
    Cors,
    /// Cross-origin without CORS; the response is opaque.
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub credentials: CredentialsMode,
    pub mode: RequestMode,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            credentials: CredentialsMode::SameOrigin,
            mode: RequestMode::Cors,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .header(http::header::ACCEPT, HeaderValue::from_static("text/html"))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the credentials mode.
    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    /// Get a header value as a string.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the Accept header mentions `needle` (e.g. "image").
    pub fn accepts(&self, needle: &str) -> bool {
        self.header_str("accept")
            .map(|accept| accept.contains(needle))
            .unwrap_or(false)
    }

    /// Whether the body is multipart form data.
    pub fn is_multipart(&self) -> bool {
        self.header_str("content-type")
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .map(|m| m.type_() == mime::MULTIPART && m.subtype() == mime::FORM_DATA)
            .unwrap_or(false)
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// How a response came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Same-origin or CORS network response.
    #[default]
    Basic,
    /// Cross-origin no-cors response; status is not trusted.
    Opaque,
    /// Built locally (offline placeholder, queued acknowledgement).
    Synthetic,
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub kind: ResponseKind,
    /// Served from a cache namespace rather than the network.
    pub from_cache: bool,
}

impl Response {
    /// Build a synthetic response.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            kind: ResponseKind::Synthetic,
            from_cache: false,
        }
    }

    /// Build a synthetic response with a content type.
    pub fn with_content_type(
        status: StatusCode,
        content_type: &'static str,
        body: impl Into<Bytes>,
    ) -> Self {
        Self::new(status, body).header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        )
    }

    /// Synthetic JSON response.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::with_content_type(status, "application/json", value.to_string())
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if the response is a visible success (2xx, not opaque).
    pub fn ok(&self) -> bool {
        self.kind != ResponseKind::Opaque && self.status.is_success()
    }

    /// Whether the response may be written to a cache namespace.
    pub fn is_cacheable(&self) -> bool {
        match self.kind {
            ResponseKind::Opaque => true,
            ResponseKind::Basic => self.status.is_success(),
            ResponseKind::Synthetic => false,
        }
    }

    /// Get a header value as a string.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::Body(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::Body(e.to_string()))
    }
}

/// The network seam.
///
/// Implementations resolve with `Err` only when no HTTP response was
/// obtained at all (offline, DNS, connect failure, timeout); an HTTP error
/// status is still `Ok`.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>>;
}

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("offgrid/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(15),
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] backed by reqwest.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::InvalidRequest(e.to_string()))?;

        info!(timeout = ?config.timeout, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    async fn execute(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            if request.credentials == CredentialsMode::Omit
                && (name == http::header::COOKIE || name == http::header::AUTHORIZATION)
            {
                continue;
            }
            builder = builder.header(name, value);
        }

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| self.classify_error(e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(|e| self.classify_error(e))?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(Response {
            url: Some(url),
            status,
            headers,
            body,
            kind: match request.mode {
                RequestMode::NoCors => ResponseKind::Opaque,
                _ => ResponseKind::Basic,
            },
            from_cache: false,
        })
    }

    fn classify_error(&self, err: reqwest::Error) -> NetError {
        if err.is_timeout() {
            NetError::Timeout(self.config.timeout)
        } else if err.is_builder() {
            NetError::InvalidRequest(err.to_string())
        } else {
            NetError::Unavailable(err.to_string())
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>> {
        Box::pin(self.execute(request))
    }
}
