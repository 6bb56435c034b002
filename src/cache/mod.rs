//! Opaque byte cache for ACME account credentials and issued certificates

mod memory;
mod sqlite;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

use crate::config::StoreConfig;
use crate::error::CacheError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch `key`, or [`CacheError::Miss`] when absent
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Remove `key`; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Build the configured cache variant
pub fn open(config: &StoreConfig) -> anyhow::Result<Arc<dyn Cache>> {
    match config {
        StoreConfig::Memory => {
            info!("Using in-memory certificate cache");
            Ok(Arc::new(MemoryCache::new()))
        }
        StoreConfig::Sqlite { path } => {
            info!(path = %path, "Using SQLite certificate cache");
            Ok(Arc::new(SqliteCache::open(path)?))
        }
    }
}
