//! Request classification.
//!
//! Maps an intercepted request to the category that selects its serving
//! policy. Rules are evaluated in a fixed precedence order and the first
//! match wins; only the URL origin, path prefix, method, mode and
//! content type are inspected.

use http::Method;
use offgrid_core::WorkerConfig;
use tracing::trace;
use url::Url;

use crate::Request;

/// Category of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Non-GET to the API (outside the upload sub-prefix).
    ApiMutation,
    /// Non-GET, non-multipart submission to an application form path.
    FormMutation,
    /// Non-GET to the upload sub-prefix; network only, never queued.
    Upload,
    /// Top-level page load.
    Navigation,
    /// Same-origin GET under the API prefix.
    ApiRead,
    /// Same-origin GET under a static or user-upload prefix.
    StaticAsset,
    /// GET to an allow-listed external origin.
    ExternalAsset,
    /// Any other GET.
    DefaultGet,
    /// Not intercepted; the default network path handles it.
    Ignore,
}

impl Category {
    /// Whether the worker responds to this request at all.
    pub fn is_intercepted(&self) -> bool {
        *self != Category::Ignore
    }
}

/// Prefix-based request classifier.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    scope: Url,
    api_prefix: String,
    upload_prefix: String,
    excluded_prefixes: Vec<String>,
    static_prefixes: Vec<String>,
    form_prefixes: Vec<String>,
    external_origins: Vec<String>,
}

impl RequestClassifier {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            scope: config.scope.clone(),
            api_prefix: config.api_prefix.clone(),
            upload_prefix: config.upload_prefix.clone(),
            excluded_prefixes: config.excluded_prefixes.clone(),
            static_prefixes: config.static_prefixes.clone(),
            form_prefixes: config.form_prefixes.clone(),
            external_origins: config
                .external_origins
                .iter()
                .map(|o| o.trim_end_matches('/').to_string())
                .collect(),
        }
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> Category {
        let category = self.evaluate(request);
        trace!(
            url = %request.url,
            method = %request.method,
            category = ?category,
            "Classified request"
        );
        category
    }

    fn evaluate(&self, request: &Request) -> Category {
        let url = &request.url;
        let same_origin = self.is_same_origin(url);
        let path = url.path();
        let is_get = request.method == Method::GET;

        if same_origin && has_any_prefix(path, &self.excluded_prefixes) {
            return Category::Ignore;
        }

        if !is_get && same_origin && path.starts_with(&self.api_prefix) {
            if path.starts_with(&self.upload_prefix) {
                return Category::Upload;
            }
            return Category::ApiMutation;
        }

        if !is_get
            && same_origin
            && has_any_prefix(path, &self.form_prefixes)
            && !request.is_multipart()
        {
            return Category::FormMutation;
        }

        if !is_get {
            return Category::Ignore;
        }

        if request.is_navigation() {
            return Category::Navigation;
        }

        if same_origin && path.starts_with(&self.api_prefix) {
            return Category::ApiRead;
        }

        if same_origin && has_any_prefix(path, &self.static_prefixes) {
            return Category::StaticAsset;
        }

        if self.is_external(url) {
            return Category::ExternalAsset;
        }

        Category::DefaultGet
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin()
    }

    fn is_external(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        self.external_origins.iter().any(|o| *o == origin)
    }
}

fn has_any_prefix(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| path.starts_with(p.as_str()))
}
