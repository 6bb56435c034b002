use super::Cache;
use crate::error::CacheError;
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.entries
            .get(key)
            .map(|v| v.value().clone())
            .ok_or(CacheError::Miss)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}
