//! Implementation of the two-level HTTP cache.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::FindOptions;
use super::FindOutcome;
use super::FindResult;
use super::HttpCache;
use super::HttpCacheOptions;
use super::HttpCacheStats;
use super::encode_entry;
use crate::headers::RequestProperties;
use crate::headers::ResponseHeaders;
use crate::headers::VaryOption;
use crate::storage::KeyValueStore;
use crate::timer::Timer;
use crate::value::CacheEntry;

/// An HTTP cache with a first level in front of a second level.
///
/// Lookups try the first level and fall through to the second when the first
/// has nothing usable. Whatever the second level finds is copied into the
/// first. Writes and remembered outcomes go to both levels.
///
/// Both levels share one set of statistics. Only the final outcome of a
/// lookup is counted, except that a first-level hit is counted as a hit.
/// Writes count once per level.
pub struct WriteThroughHttpCache<S1, S2> {
    /// The first level, usually small and fast.
    l1: HttpCache<S1>,
    /// The second level.
    l2: HttpCache<S2>,
    /// Entries this large or larger are only written to the second level.
    l1_size_limit: Option<usize>,
}

impl<S1: KeyValueStore, S2: KeyValueStore> WriteThroughHttpCache<S1, S2> {
    /// Constructs a new cache with the default options.
    pub fn new(l1: S1, l2: S2, timer: Arc<dyn Timer>) -> Self {
        Self::new_with_options(l1, l2, timer, HttpCacheOptions::default())
    }

    /// Constructs a new cache whose levels both use the given options.
    pub fn new_with_options(
        l1: S1,
        l2: S2,
        timer: Arc<dyn Timer>,
        options: HttpCacheOptions,
    ) -> Self {
        let stats = Arc::<HttpCacheStats>::default();
        Self {
            l1: HttpCache::new_with_options(l1, timer.clone(), options.clone())
                .with_stats(stats.clone()),
            l2: HttpCache::new_with_options(l2, timer, options).with_stats(stats),
            l1_size_limit: None,
        }
    }

    /// Uses the given statistics for both levels.
    pub fn with_stats(mut self, stats: Arc<HttpCacheStats>) -> Self {
        self.l1 = self.l1.with_stats(stats.clone());
        self.l2 = self.l2.with_stats(stats);
        self
    }

    /// Keeps entries whose key, fragment and encoded size add up to `limit`
    /// bytes or more out of the first level.
    pub fn with_l1_size_limit(mut self, limit: usize) -> Self {
        self.l1_size_limit = Some(limit);
        self
    }

    /// Gets the first level.
    pub fn l1(&self) -> &HttpCache<S1> {
        &self.l1
    }

    /// Gets the second level.
    pub fn l2(&self) -> &HttpCache<S2> {
        &self.l2
    }

    /// Gets the statistics shared by both levels.
    pub fn stats(&self) -> &Arc<HttpCacheStats> {
        self.l2.stats()
    }

    /// Sets the key version of both levels.
    pub fn set_version(&self, version: u32) {
        self.l1.set_version(version);
        self.l2.set_version(version);
    }

    /// Stops both levels from remembering negative outcomes.
    pub fn set_ignore_failure_puts(&self) {
        self.l1.set_ignore_failure_puts();
        self.l2.set_ignore_failure_puts();
    }

    /// Looks up a URL in the first level, then in the second.
    ///
    /// A stale second-level value is preferred as the fallback over a stale
    /// first-level one.
    pub async fn find(&self, key: &str, fragment: &str, options: &FindOptions) -> FindOutcome {
        let (l1, _) = self.l1.lookup(key, fragment, options, false).await;
        if l1.result != FindResult::NotFound {
            return l1;
        }

        let (l2, entry) = self
            .l2
            .lookup(key, fragment, options, options.update_stats_on_failure)
            .await;

        if let Some(entry) = entry {
            self.put_in_l1(key, fragment, &entry).await;
            return l2;
        }

        if l2.fallback.is_some() || l1.fallback.is_none() {
            return l2;
        }

        if options.update_stats_on_failure {
            self.stats().cache_fallbacks.increment();
        }

        FindOutcome {
            fallback: l1.fallback,
            ..l2
        }
    }

    /// Stores a response in both levels.
    ///
    /// The storage policy is that of [`HttpCache::put`]. Returns whether the
    /// second level stored it.
    pub async fn put(
        &self,
        key: &str,
        fragment: &str,
        request: &RequestProperties,
        vary: VaryOption,
        headers: ResponseHeaders,
        content: impl Into<Bytes>,
    ) -> bool {
        let Some((compound, entry)) =
            self.l2
                .prepare_put(key, fragment, request, vary, headers, content.into())
        else {
            return false;
        };

        let stored = self.l2.store_entry(key, &compound, &entry).await;
        self.put_in_l1(key, fragment, &entry).await;
        stored
    }

    /// Remembers a failed fetch in both levels.
    pub async fn remember_fetch_failed(&self, key: &str, fragment: &str) {
        self.l1.remember_fetch_failed(key, fragment).await;
        self.l2.remember_fetch_failed(key, fragment).await;
    }

    /// Remembers a dropped fetch in both levels.
    pub async fn remember_fetch_dropped(&self, key: &str, fragment: &str) {
        self.l1.remember_fetch_dropped(key, fragment).await;
        self.l2.remember_fetch_dropped(key, fragment).await;
    }

    /// Remembers an uncacheable response in both levels.
    pub async fn remember_not_cacheable(
        &self,
        key: &str,
        fragment: &str,
        is_original_status_200: bool,
    ) {
        self.l1
            .remember_not_cacheable(key, fragment, is_original_status_200)
            .await;
        self.l2
            .remember_not_cacheable(key, fragment, is_original_status_200)
            .await;
    }

    /// Remembers an empty response in both levels.
    pub async fn remember_empty(&self, key: &str, fragment: &str) {
        self.l1.remember_empty(key, fragment).await;
        self.l2.remember_empty(key, fragment).await;
    }

    /// Deletes the URL from both levels.
    pub async fn delete(&self, key: &str, fragment: &str) {
        self.l1.delete(key, fragment).await;
        self.l2.delete(key, fragment).await;
    }

    /// Copies an entry into the first level if it is small enough.
    async fn put_in_l1(&self, key: &str, fragment: &str, entry: &CacheEntry) {
        let Some(compound) = self.l1.compound_key(key, fragment) else {
            return;
        };

        let Some(bytes) = encode_entry(key, entry) else {
            return;
        };

        let size = key.len() + fragment.len() + bytes.len();
        if self.l1_size_limit.is_some_and(|limit| size >= limit) {
            debug!(key, size, "entry is too large for the first level");
            return;
        }

        self.l1.store_bytes(key, &compound, bytes).await;
    }
}
