//! Key/value storage back ends for the HTTP cache.

use std::future::Future;

use anyhow::Result;
use bytes::Bytes;

mod file;
mod memory;

pub use file::*;
pub use memory::*;

/// A byte-oriented key/value store.
///
/// The HTTP cache layers response semantics on top of a store; the store only
/// deals in opaque blobs.
///
/// Implementations are expected to be safe for concurrent use on distinct
/// keys; concurrent writes to the same key are last-writer-wins.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Gets the value stored under the given key.
    ///
    /// Returns `Ok(None)` if the key is not present.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>>> + Send;

    /// Gets the values stored under several keys.
    ///
    /// The results are in the same order as the keys. By default this issues
    /// one [`KeyValueStore::get`] per key.
    fn get_many(&self, keys: &[String]) -> impl Future<Output = Vec<Result<Option<Bytes>>>> + Send {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.get(key).await);
            }
            results
        }
    }

    /// Puts a value into the store, replacing any previous value.
    fn put(&self, key: &str, value: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Deletes the value stored under the given key.
    ///
    /// Deleting a key that is not present is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Gets a short description of the store, used in log messages.
    fn name(&self) -> &str;
}
