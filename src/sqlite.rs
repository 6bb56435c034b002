//! SQLite plumbing shared by the durable storage and cache
//!
//! Both stores may point at the same file. Each one owns its tables and
//! records its schema version under its own name in `schema_migrations`.

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A connection shared between async callers; every call runs on the blocking pool
#[derive(Clone)]
pub struct SharedConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        // WAL lets several router processes read while one writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        info!(path = %path.display(), "SQLite database opened");
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Apply `migrations[n]` for every version `n + 1` above the recorded one
    pub fn migrate(&self, component: &str, migrations: &[&str]) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                component TEXT NOT NULL,
                version INTEGER NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (component, version)
            )",
            [],
        )?;

        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations WHERE component = ?1",
            params![component],
            |row| row.get(0),
        )?;

        for (index, sql) in migrations.iter().enumerate() {
            let version = index as i64 + 1;
            if version <= current {
                continue;
            }

            debug!(component, version, "Applying migration");
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (component, version) VALUES (?1, ?2)",
                params![component, version],
            )?;
            tx.commit()?;
        }

        if (migrations.len() as i64) > current {
            info!(component, from = current, to = migrations.len(), "Migrations applied");
        }

        Ok(())
    }

    /// Run `f` against the connection without blocking the async runtime
    pub async fn call<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<rusqlite::Error> + From<tokio::task::JoinError>,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?;
        Ok(result?)
    }
}
