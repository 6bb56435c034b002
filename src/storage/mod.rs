//! Routing table: host -> targets, plus per-target activity
//!
//! Every variant honours the `idles` flag given to [`Storage::target_add`]:
//! a target is only ever reported by [`Storage::stale`] while each host it
//! is registered under allows idling.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::config::StoreConfig;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Register `target` under `host`. Idempotent; a repeated call updates `idles`.
    async fn target_add(&self, host: &str, target: &str, idles: bool) -> Result<(), StorageError>;

    /// Unregister `target` from `host`. Idempotent; the host disappears with its last target.
    async fn target_remove(&self, host: &str, target: &str) -> Result<(), StorageError>;

    /// Targets registered under exactly `host` (no wildcard expansion)
    async fn target_list(&self, host: &str) -> Result<Vec<String>, StorageError>;

    /// Every host with at least one target
    async fn host_list(&self) -> Result<Vec<String>, StorageError>;

    /// A request to `target` started
    async fn request_begin(&self, target: &str) -> Result<(), StorageError>;

    /// A request to `target` finished; a no-op for targets without activity
    async fn request_end(&self, target: &str) -> Result<(), StorageError>;

    /// Requests to `target` currently in flight; zero for targets without activity
    async fn in_flight(&self, target: &str) -> Result<usize, StorageError>;

    /// Idle-eligible targets last seen before `cutoff` with nothing in flight
    async fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StorageError>;
}

/// Build the configured storage variant
pub fn open(config: &StoreConfig) -> anyhow::Result<Arc<dyn Storage>> {
    match config {
        StoreConfig::Memory => {
            info!("Using in-memory routing table");
            Ok(Arc::new(MemoryStorage::new()))
        }
        StoreConfig::Sqlite { path } => {
            info!(path = %path, "Using SQLite routing table");
            Ok(Arc::new(SqliteStorage::open(path)?))
        }
    }
}
