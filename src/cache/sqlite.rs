use super::Cache;
use crate::error::CacheError;
use crate::sqlite::SharedConnection;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS cache_entries (
        key TEXT PRIMARY KEY,
        data BLOB NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
"#];

/// Certificate cache persisted in SQLite so restarts don't re-issue
pub struct SqliteCache {
    db: SharedConnection,
}

impl SqliteCache {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = SharedConnection::open(path)?;
        db.migrate("cache", MIGRATIONS)?;
        Ok(Self { db })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let db = SharedConnection::open_in_memory()?;
        db.migrate("cache", MIGRATIONS)?;
        Ok(Self { db })
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let key = key.to_string();
        let data: Option<Vec<u8>> = self
            .db
            .call::<_, CacheError, _>(move |conn| {
                conn.query_row(
                    "SELECT data FROM cache_entries WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        data.ok_or(CacheError::Miss)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let (key, data) = (key.to_string(), data.to_vec());
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cache_entries (key, data) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = datetime('now')",
                    params![key, data],
                )
            })
            .await
            .map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_string();
        self.db
            .call(move |conn| conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]))
            .await
            .map(|_| ())
    }
}
