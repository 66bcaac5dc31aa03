//! Durable offline mutation queue.
//!
//! Entries are appended with a monotonically increasing id and replayed in
//! id order. An entry is deleted only after a replay attempt observes a 2xx
//! response; every other outcome leaves it in place for the next trigger.
//! Two replays running at once may both deliver the same entry, so the
//! receiving server must tolerate duplicates.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use offgrid_net::{CredentialsMode, Fetcher, Request};
use tokio_rusqlite::rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::{Database, StoreError, StoreResult};

/// A mutation to append to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueueEntry {
    pub url: Url,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub credentials: CredentialsMode,
}

impl NewQueueEntry {
    /// Capture a request that could not reach the network.
    ///
    /// The body is stored as text; invalid UTF-8 is replaced lossily.
    /// Repeated header values are folded into one comma-separated value.
    pub fn from_request(request: &Request) -> Self {
        let headers = request
            .headers
            .keys()
            .filter_map(|name| {
                let values: Vec<&str> = request
                    .headers
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .collect();
                (!values.is_empty()).then(|| (name.as_str().to_string(), values.join(", ")))
            })
            .collect();

        Self {
            url: request.url.clone(),
            method: request.method.as_str().to_string(),
            headers,
            body: request
                .body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
            credentials: request.credentials,
        }
    }
}

/// A persisted queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: i64,
    pub url: Url,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub credentials: CredentialsMode,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Rebuild the request to re-issue on replay.
    pub fn to_request(&self) -> StoreResult<Request> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| StoreError::Corrupt(format!("entry {}: {e}", self.id)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(entry = self.id, header = %name, "Dropping invalid queued header"),
            }
        }

        let mut request = Request::new(method, self.url.clone()).credentials(self.credentials);
        request.headers = headers;
        if let Some(body) = &self.body {
            request.body = Some(Bytes::from(body.clone()));
        }
        Ok(request)
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries re-issued.
    pub attempted: usize,
    /// Entries that got a 2xx and were removed.
    pub delivered: usize,
    /// Entries left in the queue.
    pub retained: usize,
}

/// Handle to the queue table.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    db: Database,
}

impl MutationQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an entry and return its id.
    pub async fn enqueue(&self, entry: NewQueueEntry) -> StoreResult<i64> {
        let headers = serde_json::to_string(&entry.headers)?;
        let now = Utc::now().timestamp_millis();
        let id = self
            .db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_queue (url, method, headers, body, credentials, enqueued_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        entry.url.as_str(),
                        entry.method,
                        headers,
                        entry.body,
                        entry.credentials.as_str(),
                        now
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!(id, "Queued mutation");
        Ok(id)
    }

    /// All entries, oldest first.
    pub async fn entries(&self) -> StoreResult<Vec<QueueEntry>> {
        let rows: Vec<(i64, String, String, String, Option<String>, String, i64)> = self
            .db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, url, method, headers, body, credentials, enqueued_at
                     FROM sync_queue ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, url, method, headers, body, credentials, enqueued_at)| {
                Ok(QueueEntry {
                    id,
                    url: Url::parse(&url)
                        .map_err(|e| StoreError::Corrupt(format!("entry {id}: {e}")))?,
                    method,
                    headers: serde_json::from_str(&headers)?,
                    body,
                    credentials: credentials
                        .parse()
                        .map_err(|e| StoreError::Corrupt(format!("entry {id}: {e}")))?,
                    enqueued_at: Utc
                        .timestamp_millis_opt(enqueued_at)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    /// Delete one entry.
    pub async fn remove(&self, id: i64) -> StoreResult<bool> {
        self.db
            .call(move |conn| {
                let removed = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
                Ok(removed > 0)
            })
            .await
    }

    pub async fn len(&self) -> StoreResult<usize> {
        self.db
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
                Ok(count as usize)
            })
            .await
    }

    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Re-issue every entry in enqueue order, deleting those that succeed.
    ///
    /// Failures of any kind are logged and leave the entry queued.
    pub async fn replay_all(&self, fetcher: &dyn Fetcher) -> ReplayReport {
        let mut report = ReplayReport::default();

        let entries = match self.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Could not read mutation queue");
                return report;
            }
        };

        for entry in entries {
            report.attempted += 1;

            let request = match entry.to_request() {
                Ok(request) => request,
                Err(e) => {
                    warn!(id = entry.id, error = %e, "Skipping unreadable queue entry");
                    report.retained += 1;
                    continue;
                }
            };

            match fetcher.fetch(&request).await {
                Ok(response) if response.ok() => match self.remove(entry.id).await {
                    Ok(_) => report.delivered += 1,
                    Err(e) => {
                        warn!(id = entry.id, error = %e, "Delivered entry could not be removed");
                        report.retained += 1;
                    }
                },
                Ok(response) => {
                    debug!(
                        id = entry.id,
                        status = %response.status,
                        "Replay rejected, keeping entry"
                    );
                    report.retained += 1;
                }
                Err(e) => {
                    debug!(id = entry.id, error = %e, "Replay failed, keeping entry");
                    report.retained += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                retained = report.retained,
                "Replayed mutation queue"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offgrid_net::mock::MockFetcher;

    async fn queue() -> MutationQueue {
        MutationQueue::new(Database::open_in_memory().await.unwrap())
    }

    fn entry(path: &str) -> NewQueueEntry {
        let request = Request::post(
            Url::parse(&format!("http://localhost{path}")).unwrap(),
            "{\"n\":1}",
        )
        .header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .credentials(CredentialsMode::Include);
        NewQueueEntry::from_request(&request)
    }

    #[tokio::test]
    async fn test_enqueue_preserves_request() {
        let queue = queue().await;
        let id = queue.enqueue(entry("/api/mutate")).await.unwrap();

        let entries = queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        let stored = &entries[0];
        assert_eq!(stored.id, id);
        assert_eq!(stored.method, "POST");
        assert_eq!(stored.url.path(), "/api/mutate");
        assert_eq!(stored.body.as_deref(), Some("{\"n\":1}"));
        assert_eq!(stored.credentials, CredentialsMode::Include);
        assert_eq!(
            stored.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );

        let request = stored.to_request().unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.header_str("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_repeated_header_values_are_replayed() {
        let queue = queue().await;
        let mut request = Request::post(Url::parse("http://localhost/api/tag").unwrap(), "");
        request.headers.append("x-tag", HeaderValue::from_static("a"));
        request.headers.append("x-tag", HeaderValue::from_static("b"));
        queue.enqueue(NewQueueEntry::from_request(&request)).await.unwrap();

        let stored = &queue.entries().await.unwrap()[0];
        assert_eq!(stored.headers.get("x-tag").map(String::as_str), Some("a, b"));

        let fetcher = MockFetcher::new();
        fetcher.respond_to(Method::POST, "http://localhost/api/tag", 200, "{}");
        let report = queue.replay_all(&fetcher).await;
        assert_eq!(report.delivered, 1);

        let calls = fetcher.calls();
        let sent: Vec<&str> = calls[0]
            .headers
            .get_all("x-tag")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(sent, vec!["a, b"]);
    }

    #[tokio::test]
    async fn test_entries_are_fifo() {
        let queue = queue().await;
        for path in ["/api/a", "/api/b", "/api/c"] {
            queue.enqueue(entry(path)).await.unwrap();
        }
        let paths: Vec<String> = queue
            .entries()
            .await
            .unwrap()
            .iter()
            .map(|e| e.url.path().to_string())
            .collect();
        assert_eq!(paths, vec!["/api/a", "/api/b", "/api/c"]);
    }

    #[tokio::test]
    async fn test_replay_delivers_everything_when_online() {
        let queue = queue().await;
        let fetcher = MockFetcher::new();
        for path in ["/api/a", "/api/b"] {
            queue.enqueue(entry(path)).await.unwrap();
            fetcher.respond_to(Method::POST, &format!("http://localhost{path}"), 200, "{}");
        }

        let report = queue.replay_all(&fetcher).await;
        assert_eq!(
            report,
            ReplayReport {
                attempted: 2,
                delivered: 2,
                retained: 0
            }
        );
        assert!(queue.is_empty().await.unwrap());

        let calls = fetcher.calls();
        assert_eq!(calls[0].url, "http://localhost/api/a");
        assert_eq!(calls[1].url, "http://localhost/api/b");
        assert_eq!(calls[0].body.as_deref(), Some(&b"{\"n\":1}"[..]));
    }

    #[tokio::test]
    async fn test_replay_offline_keeps_count_and_order() {
        let queue = queue().await;
        for path in ["/api/a", "/api/b", "/api/c"] {
            queue.enqueue(entry(path)).await.unwrap();
        }
        let before: Vec<i64> = queue.entries().await.unwrap().iter().map(|e| e.id).collect();

        let fetcher = MockFetcher::new();
        fetcher.set_online(false);
        let report = queue.replay_all(&fetcher).await;

        assert_eq!(report.delivered, 0);
        assert_eq!(report.retained, 3);
        let after: Vec<i64> = queue.entries().await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_replay_keeps_rejected_entries() {
        let queue = queue().await;
        queue.enqueue(entry("/api/ok")).await.unwrap();
        queue.enqueue(entry("/api/broken")).await.unwrap();

        let fetcher = MockFetcher::new();
        fetcher.respond_to(Method::POST, "http://localhost/api/ok", 201, "");
        fetcher.respond_to(Method::POST, "http://localhost/api/broken", 500, "");

        let report = queue.replay_all(&fetcher).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.retained, 1);

        let remaining = queue.entries().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].url.path(), "/api/broken");
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.db");

        {
            let queue = MutationQueue::new(Database::open(&path).await.unwrap());
            queue.enqueue(entry("/api/mutate")).await.unwrap();
        }

        let queue = MutationQueue::new(Database::open(&path).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
