//! FIFO eviction for bounded namespaces.

use tokio_rusqlite::rusqlite::params;
use tracing::debug;

use crate::{Namespace, StoreResult};

impl Namespace {
    /// Delete the oldest entries until at most `max_entries` remain.
    ///
    /// Age is insertion order; reads do not refresh an entry. Returns the
    /// number of entries removed.
    pub async fn trim(&self, max_entries: usize) -> StoreResult<usize> {
        let namespace = self.name.clone();
        let removed = self
            .db
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?1",
                    params![namespace],
                    |row| row.get(0),
                )?;
                let excess = count - max_entries as i64;
                if excess <= 0 {
                    return Ok(0);
                }
                let removed = conn.execute(
                    "DELETE FROM cache_entries WHERE seq IN (
                        SELECT seq FROM cache_entries WHERE namespace = ?1
                        ORDER BY seq ASC LIMIT ?2
                     )",
                    params![namespace, excess],
                )?;
                Ok(removed)
            })
            .await?;

        if removed > 0 {
            debug!(namespace = %self.name, removed, max_entries, "Trimmed namespace");
        }
        Ok(removed)
    }
}
