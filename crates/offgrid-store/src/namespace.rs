//! Cache namespaces.
//!
//! A namespace maps a request identity (method + absolute URL, plus the
//! request header values named by the stored response's `Vary`) to the most
//! recently stored response. Namespaces are created lazily on first write
//! and removed only by an explicit delete or the activation purge.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use offgrid_net::{Request, Response, ResponseKind};
use tokio_rusqlite::rusqlite::{params, OptionalExtension};
use tracing::{debug, info, trace};
use url::Url;

use crate::{Database, StoreError, StoreResult};

/// Vary marker that never matches unless vary is ignored.
const VARY_ANY: &str = "*";

/// Identity under which a response is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    pub method: Method,
    pub url: Url,
}

impl RequestIdentity {
    pub fn new(method: Method, mut url: Url) -> Self {
        url.set_fragment(None);
        Self { method, url }
    }

    pub fn of(request: &Request) -> Self {
        Self::new(request.method.clone(), request.url.clone())
    }

    /// Lexical key used by the store.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Options for namespace lookups.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    /// Match regardless of the stored `Vary` header values.
    pub ignore_vary: bool,
}

impl MatchOptions {
    pub fn ignore_vary() -> Self {
        Self { ignore_vary: true }
    }
}

/// Persistent collection of named cache namespaces.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    db: Database,
}

impl CacheStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get a handle to a namespace. Nothing is persisted until the first write.
    pub fn open(&self, name: &str) -> Namespace {
        Namespace {
            db: self.db.clone(),
            name: name.to_string(),
        }
    }

    /// Check if a namespace exists.
    pub async fn has(&self, name: &str) -> StoreResult<bool> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM cache_namespaces WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    /// Names of every existing namespace, oldest first.
    pub async fn keys(&self) -> StoreResult<Vec<String>> {
        self.db
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM cache_namespaces ORDER BY created_at, name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
    }

    /// Delete a namespace and all of its entries.
    pub async fn delete(&self, name: &str) -> StoreResult<bool> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM cache_entries WHERE namespace = ?1", params![name])?;
                let removed =
                    tx.execute("DELETE FROM cache_namespaces WHERE name = ?1", params![name])?;
                tx.commit()?;
                Ok(removed > 0)
            })
            .await
    }

    /// Delete every namespace whose name is not in `current`.
    ///
    /// Returns the names that were removed.
    pub async fn purge_stale(&self, current: &[String]) -> StoreResult<Vec<String>> {
        let stale: Vec<String> = self
            .keys()
            .await?
            .into_iter()
            .filter(|name| !current.contains(name))
            .collect();

        for name in &stale {
            self.delete(name).await?;
        }

        if !stale.is_empty() {
            info!(removed = ?stale, "Purged stale cache namespaces");
        }
        Ok(stale)
    }

}

/// Handle to one namespace.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub(crate) db: Database,
    pub(crate) name: String,
}

impl Namespace {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `response` under the identity of `request`.
    ///
    /// Overwriting an existing identity moves it to the newest insertion
    /// position. Only GET requests can be stored.
    pub async fn put(&self, request: &Request, response: &Response) -> StoreResult<()> {
        if request.method != Method::GET {
            return Err(StoreError::Unsupported(format!(
                "cannot cache {} {}",
                request.method, request.url
            )));
        }

        let identity = RequestIdentity::of(request);
        let vary = serde_json::to_string(&vary_snapshot(request, response))?;
        let headers = serde_json::to_string(&encode_headers(&response.headers))?;
        let kind = serde_json::to_string(&response.kind)?;
        let namespace = self.name.clone();
        let key = identity.key();
        let status = response.status.as_u16();
        let body = response.body.to_vec();
        let now = Utc::now().timestamp_millis();

        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?1, ?2)",
                    params![namespace, now],
                )?;
                tx.execute(
                    "DELETE FROM cache_entries WHERE namespace = ?1 AND request_key = ?2",
                    params![namespace, key],
                )?;
                tx.execute(
                    "INSERT INTO cache_entries
                        (namespace, request_key, method, url, vary, status, headers, body, kind, stored_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        namespace,
                        key,
                        identity.method.as_str(),
                        identity.url.as_str(),
                        vary,
                        status,
                        headers,
                        body,
                        kind,
                        now
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        trace!(namespace = %self.name, url = %request.url, "Stored response");
        Ok(())
    }

    /// Find the stored response for `request`.
    pub async fn match_request(
        &self,
        request: &Request,
        options: MatchOptions,
    ) -> StoreResult<Option<Response>> {
        let identity = RequestIdentity::of(request);
        let Some(row) = self.load(&identity).await? else {
            return Ok(None);
        };

        if !options.ignore_vary && !vary_matches(&row.vary, request) {
            debug!(namespace = %self.name, url = %request.url, "Cached entry rejected by Vary");
            return Ok(None);
        }

        row.into_response().map(Some)
    }

    /// Find the stored GET response for `url`, ignoring `Vary`.
    pub async fn match_url(&self, url: &Url) -> StoreResult<Option<Response>> {
        let identity = RequestIdentity::new(Method::GET, url.clone());
        match self.load(&identity).await? {
            Some(row) => row.into_response().map(Some),
            None => Ok(None),
        }
    }

    /// Delete the entry stored for `request`.
    pub async fn delete(&self, request: &Request) -> StoreResult<bool> {
        self.delete_identity(&RequestIdentity::of(request)).await
    }

    pub(crate) async fn delete_identity(&self, identity: &RequestIdentity) -> StoreResult<bool> {
        let namespace = self.name.clone();
        let key = identity.key();
        self.db
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM cache_entries WHERE namespace = ?1 AND request_key = ?2",
                    params![namespace, key],
                )?;
                Ok(removed > 0)
            })
            .await
    }

    /// Stored identities in insertion order, oldest first.
    pub async fn keys(&self) -> StoreResult<Vec<RequestIdentity>> {
        let namespace = self.name.clone();
        let rows: Vec<(String, String)> = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT method, url FROM cache_entries WHERE namespace = ?1 ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map(params![namespace], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(method, url)| {
                let method = Method::from_bytes(method.as_bytes())
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let url = Url::parse(&url).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(RequestIdentity::new(method, url))
            })
            .collect()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> StoreResult<usize> {
        let namespace = self.name.clone();
        self.db
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?1",
                    params![namespace],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await
    }

    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    async fn load(&self, identity: &RequestIdentity) -> StoreResult<Option<StoredRow>> {
        let namespace = self.name.clone();
        let key = identity.key();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT url, vary, status, headers, body, kind
                         FROM cache_entries WHERE namespace = ?1 AND request_key = ?2",
                        params![namespace, key],
                        |row| {
                            Ok(StoredRow {
                                url: row.get(0)?,
                                vary: row.get(1)?,
                                status: row.get(2)?,
                                headers: row.get(3)?,
                                body: row.get(4)?,
                                kind: row.get(5)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }
}

struct StoredRow {
    url: String,
    vary: String,
    status: u16,
    headers: String,
    body: Vec<u8>,
    kind: String,
}

impl StoredRow {
    fn into_response(self) -> StoreResult<Response> {
        let status =
            StatusCode::from_u16(self.status).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let pairs: Vec<(String, String)> = serde_json::from_str(&self.headers)?;
        let kind: ResponseKind = serde_json::from_str(&self.kind)?;

        Ok(Response {
            url: Url::parse(&self.url).ok(),
            status,
            headers: decode_headers(pairs),
            body: Bytes::from(self.body),
            kind,
            from_cache: true,
        })
    }
}

/// Request header values named by the response's `Vary` header.
fn vary_snapshot(request: &Request, response: &Response) -> BTreeMap<String, String> {
    let mut snapshot = BTreeMap::new();
    let Some(vary) = response.header_str("vary") else {
        return snapshot;
    };
    for name in vary.split(',').map(|n| n.trim().to_ascii_lowercase()) {
        if name.is_empty() {
            continue;
        }
        if name == VARY_ANY {
            snapshot.insert(VARY_ANY.to_string(), String::new());
            continue;
        }
        let value = request.header_str(&name).unwrap_or_default().to_string();
        snapshot.insert(name, value);
    }
    snapshot
}

fn vary_matches(stored: &str, request: &Request) -> bool {
    let Ok(snapshot) = serde_json::from_str::<BTreeMap<String, String>>(stored) else {
        return false;
    };
    snapshot.iter().all(|(name, value)| {
        name != VARY_ANY && request.header_str(name).unwrap_or_default() == value
    })
}

fn encode_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn decode_headers(pairs: Vec<(String, String)>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}
