use super::Storage;
use crate::error::StorageError;
use crate::sqlite::SharedConnection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::Path;

const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS routes (
        host TEXT NOT NULL,
        target TEXT NOT NULL,
        idles INTEGER NOT NULL,
        PRIMARY KEY (host, target)
    );
    CREATE INDEX IF NOT EXISTS idx_routes_target ON routes(target);

    CREATE TABLE IF NOT EXISTS activity (
        target TEXT PRIMARY KEY,
        last_seen_ms INTEGER NOT NULL,
        in_flight INTEGER NOT NULL DEFAULT 0
    );
"#];

/// Durable routing table in a SQLite file
///
/// Router processes on the same host can share one file; the `idles` flag is
/// stored per registration and checked by [`Storage::stale`].
pub struct SqliteStorage {
    db: SharedConnection,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = SharedConnection::open(path)?;
        db.migrate("storage", MIGRATIONS)?;
        Ok(Self { db })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let db = SharedConnection::open_in_memory()?;
        db.migrate("storage", MIGRATIONS)?;
        Ok(Self { db })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn target_add(&self, host: &str, target: &str, idles: bool) -> Result<(), StorageError> {
        let (host, target) = (host.to_string(), target.to_string());
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO routes (host, target, idles) VALUES (?1, ?2, ?3)
                     ON CONFLICT(host, target) DO UPDATE SET idles = excluded.idles",
                    params![host, target, idles],
                )
            })
            .await
            .map(|_| ())
    }

    async fn target_remove(&self, host: &str, target: &str) -> Result<(), StorageError> {
        let (host, target) = (host.to_string(), target.to_string());
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM routes WHERE host = ?1 AND target = ?2",
                    params![host, target],
                )
            })
            .await
            .map(|_| ())
    }

    async fn target_list(&self, host: &str) -> Result<Vec<String>, StorageError> {
        let host = host.to_string();
        self.db
            .call(move |conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT target FROM routes WHERE host = ?1 ORDER BY target")?;
                let rows = stmt.query_map(params![host], |row| row.get(0))?;
                rows.collect()
            })
            .await
    }

    async fn host_list(&self) -> Result<Vec<String>, StorageError> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare_cached("SELECT DISTINCT host FROM routes ORDER BY host")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect()
            })
            .await
    }

    async fn request_begin(&self, target: &str) -> Result<(), StorageError> {
        let target = target.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO activity (target, last_seen_ms, in_flight) VALUES (?1, ?2, 1)
                     ON CONFLICT(target) DO UPDATE SET
                         last_seen_ms = excluded.last_seen_ms,
                         in_flight = in_flight + 1",
                    params![target, now],
                )
            })
            .await
            .map(|_| ())
    }

    async fn request_end(&self, target: &str) -> Result<(), StorageError> {
        let target = target.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE activity SET in_flight = MAX(in_flight - 1, 0), last_seen_ms = ?2
                     WHERE target = ?1",
                    params![target, now],
                )
            })
            .await
            .map(|_| ())
    }

    async fn in_flight(&self, target: &str) -> Result<usize, StorageError> {
        let target = target.to_string();
        let count: Result<Option<i64>, StorageError> = self
            .db
            .call(move |conn| {
                conn.query_row(
                    "SELECT in_flight FROM activity WHERE target = ?1",
                    params![target],
                    |row| row.get(0),
                )
                .optional()
            })
            .await;
        Ok(count?.unwrap_or(0).max(0) as usize)
    }

    async fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        let cutoff = cutoff.timestamp_millis();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM activity
                     WHERE in_flight = 0
                       AND NOT EXISTS (SELECT 1 FROM routes r WHERE r.target = activity.target)",
                    [],
                )?;

                let stale = {
                    let mut stmt = tx.prepare_cached(
                        "SELECT a.target FROM activity a
                         WHERE a.in_flight = 0
                           AND a.last_seen_ms < ?1
                           AND EXISTS (SELECT 1 FROM routes r WHERE r.target = a.target)
                           AND NOT EXISTS (
                               SELECT 1 FROM routes r WHERE r.target = a.target AND r.idles = 0
                           )
                         ORDER BY a.target",
                    )?;
                    let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
                    rows.collect::<rusqlite::Result<Vec<String>>>()?
                };

                tx.commit()?;
                Ok(stale)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;

    fn storage() -> SqliteStorage {
        SqliteStorage::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        conformance::add_is_idempotent(&storage()).await;
    }

    #[tokio::test]
    async fn test_remove_drops_empty_host() {
        conformance::remove_drops_empty_host(&storage()).await;
    }

    #[tokio::test]
    async fn test_stale_respects_idles_flag() {
        conformance::stale_respects_idles_flag(&storage()).await;
    }

    #[tokio::test]
    async fn test_stale_skips_in_flight_and_recent() {
        conformance::stale_skips_in_flight_and_recent(&storage()).await;
    }

    #[tokio::test]
    async fn test_activity_pairs_begins_with_ends() {
        conformance::activity_pairs_begins_with_ends(&storage()).await;
    }

    #[tokio::test]
    async fn test_request_end_saturates() {
        conformance::request_end_saturates(&storage()).await;
    }

    #[tokio::test]
    async fn test_unregistered_targets_are_never_stale() {
        conformance::unregistered_targets_are_never_stale(&storage()).await;
    }

    #[tokio::test]
    async fn test_routes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage
                .target_add("api.example.com", "http://api.prod.svc.cluster.local:8080", false)
                .await
                .unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(
            storage.target_list("api.example.com").await.unwrap(),
            vec!["http://api.prod.svc.cluster.local:8080".to_string()]
        );

        // The idles flag is persisted with the registration
        storage.request_begin("http://api.prod.svc.cluster.local:8080").await.unwrap();
        storage.request_end("http://api.prod.svc.cluster.local:8080").await.unwrap();
        let future = Utc::now() + chrono::Duration::hours(2);
        assert!(storage.stale(future).await.unwrap().is_empty());
    }
}
