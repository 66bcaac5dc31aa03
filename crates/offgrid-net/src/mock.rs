//! Scripted in-process [`Fetcher`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::{Fetcher, NetError, Request, RequestMode, Response, ResponseKind};

/// A request observed by [`MockFetcher`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Fetcher with an online switch, canned responses, and a call log.
///
/// Unrouted URLs answer 404 while online. Every call is recorded, including
/// those that fail because the fetcher is offline.
pub struct MockFetcher {
    online: AtomicBool,
    routes: Mutex<HashMap<(Method, String), (StatusCode, HeaderMap, Bytes)>>,
    failing: Mutex<HashSet<String>>,
    rejecting: Mutex<HashSet<String>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            routes: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            rejecting: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Answer `GET url` with `status` and `body`.
    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.respond_to(Method::GET, url, status, body);
    }

    /// Answer `method url` with `status` and `body`.
    pub fn respond_to(&self, method: Method, url: &str, status: u16, body: &str) {
        self.respond_with_headers(method, url, status, body, &[]);
    }

    /// Answer `method url` with extra response headers.
    pub fn respond_with_headers(
        &self,
        method: Method,
        url: &str,
        status: u16,
        body: &str,
        headers: &[(&'static str, &'static str)],
    ) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(value));
        }
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        self.routes
            .lock()
            .expect("mock routes lock poisoned")
            .insert(
                (method, url.to_string()),
                (status, map, Bytes::from(body.to_string())),
            );
    }

    /// Make `url` fail at the network layer even while online.
    pub fn fail(&self, url: &str) {
        self.failing
            .lock()
            .expect("mock failing lock poisoned")
            .insert(url.to_string());
    }

    /// Make `url` fail before it is sent, as a malformed request would.
    pub fn reject(&self, url: &str) {
        self.rejecting
            .lock()
            .expect("mock rejecting lock poisoned")
            .insert(url.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("mock calls lock poisoned").clone()
    }

    /// Number of calls made to `url` with any method.
    pub fn call_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .expect("mock calls lock poisoned")
            .iter()
            .filter(|c| c.url == url)
            .count()
    }

    fn answer(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        self.calls
            .lock()
            .expect("mock calls lock poisoned")
            .push(RecordedCall {
                method: request.method.clone(),
                url: url.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
            });

        if self
            .rejecting
            .lock()
            .expect("mock rejecting lock poisoned")
            .contains(&url)
        {
            return Err(NetError::InvalidRequest(format!("{url} rejected")));
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::Unavailable("offline".to_string()));
        }
        if self
            .failing
            .lock()
            .expect("mock failing lock poisoned")
            .contains(&url)
        {
            return Err(NetError::Unavailable(format!("{url} unreachable")));
        }

        let routed = self
            .routes
            .lock()
            .expect("mock routes lock poisoned")
            .get(&(request.method.clone(), url))
            .cloned();
        let (status, headers, body) =
            routed.unwrap_or((StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new()));

        Ok(Response {
            url: Some(request.url.clone()),
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
}

impl Fetcher for MockFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>> {
        let result = self.answer(request);
        Box::pin(async move {
            tokio::task::yield_now().await;
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn test_mock_routes_and_offline() {
        let mock = MockFetcher::new();
        mock.respond("http://localhost/a", 200, "A");
        let request = Request::get(Url::parse("http://localhost/a").unwrap());

        let response = mock.fetch(&request).await.unwrap();
        assert_eq!(response.text().unwrap(), "A");

        mock.set_online(false);
        assert!(mock.fetch(&request).await.is_err());
        assert_eq!(mock.call_count("http://localhost/a"), 2);
    }

    #[tokio::test]
    async fn test_mock_unrouted_is_404() {
        let mock = MockFetcher::new();
        let request = Request::get(Url::parse("http://localhost/none").unwrap());
        let response = mock.fetch(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
