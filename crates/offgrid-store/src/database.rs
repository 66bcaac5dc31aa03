use chrono::Utc;
use std::path::Path;
use tokio_rusqlite::rusqlite::{params, OptionalExtension};
use tokio_rusqlite::{rusqlite, Connection};
use tracing::{debug, info};

use crate::{StoreError, StoreResult};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Shared handle to the embedded database.
///
/// Cache namespaces and the mutation queue live in the same file so both
/// survive process restarts together. Statements run on the connection's
/// background thread; callers only await the result.
#[derive(Clone, Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database file at `path` and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .await
            .map_err(|e| StoreError::Connection(e.into()))?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;",
            )
        })
        .await?;
        info!(path = %path.display(), "Opened offline store");
        Self::init(conn).await
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Connection(e.into()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> StoreResult<Self> {
        let db = Self { conn };
        db.call(|conn| {
            conn.execute("PRAGMA foreign_keys = ON", [])?;

            let table_exists: bool = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get::<_, i32>(0).map(|count| count > 0),
            )?;

            let version: i32 = if table_exists {
                conn.query_row(
                    "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0)
            } else {
                0
            };

            if version < SCHEMA_VERSION {
                migrate(conn, version)?;
            }
            Ok(())
        })
        .await?;
        Ok(db)
    }

    /// Run a synchronous closure against the connection on its background
    /// thread.
    pub async fn call<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.conn.call(f).await?)
    }
}

fn migrate(conn: &rusqlite::Connection, from_version: i32) -> StoreResult<()> {
    if from_version < 1 {
        create_schema_v1(conn)?;
    }
    Ok(())
}

/// Create initial schema (version 1)
fn create_schema_v1(conn: &rusqlite::Connection) -> StoreResult<()> {
    debug!("Creating offline store schema v1");
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_namespaces (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace TEXT NOT NULL REFERENCES cache_namespaces(name) ON DELETE CASCADE,
            request_key TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            vary TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            kind TEXT NOT NULL,
            stored_at INTEGER NOT NULL,
            UNIQUE (namespace, request_key)
        );

        CREATE INDEX IF NOT EXISTS idx_entries_namespace_seq ON cache_entries(namespace, seq);

        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            method TEXT NOT NULL,
            headers TEXT NOT NULL,
            body TEXT,
            credentials TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| StoreError::Migration(format!("failed to create schema: {e}")))?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, Utc::now().timestamp()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_creates_schema() {
        let db = Database::open_in_memory().await.unwrap();
        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
            .unwrap();

        assert!(tables.contains(&"cache_namespaces".to_string()));
        assert!(tables.contains(&"cache_entries".to_string()));
        assert!(tables.contains(&"sync_queue".to_string()));
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("offline.db");

        Database::open(&path).await.unwrap();
        let db = Database::open(&path).await.unwrap();

        let versions: i64 = db
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[tokio::test]
    async fn test_statements_run_off_the_runtime_thread() {
        let db = Database::open_in_memory().await.unwrap();
        let caller = std::thread::current().id();

        let worker = db
            .call(|_conn| Ok(std::thread::current().id()))
            .await
            .unwrap();
        assert_ne!(worker, caller);
    }
}
