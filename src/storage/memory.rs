//! An in-process, size-bounded store.

use anyhow::Result;
use bytes::Bytes;
use moka::future::Cache;

use crate::storage::KeyValueStore;

/// A store that keeps values in memory, evicting the least recently used
/// entries once the total size of keys and values exceeds a limit.
#[derive(Clone)]
pub struct MemoryStore {
    /// The underlying cache.
    cache: Cache<String, Bytes>,
}

impl MemoryStore {
    /// Creates a store holding at most `max_bytes` of keys and values.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_bytes)
                .weigher(|key: &String, value: &Bytes| {
                    u32::try_from(key.len() + value.len()).unwrap_or(u32::MAX)
                })
                .build(),
        }
    }

    /// Gets the number of entries in the store.
    ///
    /// Pending evictions are processed first so the count is current.
    pub async fn len(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    /// Determines if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.cache.get(key).await)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.cache.insert(key.to_string(), value).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
