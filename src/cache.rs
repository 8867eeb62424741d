//! Implementation of the HTTP cache.
//!
//! [`HttpCache`] layers HTTP caching semantics over a byte-oriented
//! [`KeyValueStore`]:
//!
//! * Only cacheable `200 OK` responses are stored, stripped of cookies and
//!   connection headers.
//! * Lookups apply caller policy (validity, freshness and TTL overrides) and
//!   hand back the stale value as a fallback when an entry has expired.
//! * Negative outcomes of recent fetches are remembered for a short while so
//!   that callers do not stampede a failing origin.
//! * Every key is namespaced by a fragment and a version; bumping the version
//!   orphans all existing entries at once.
//!
//! [`WriteThroughHttpCache`] stacks two such caches into a small, fast first
//! level in front of a larger second level.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use http::HeaderMap;
use http::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;
use url::Url;

use crate::headers::RequestProperties;
use crate::headers::ResponseHeaders;
use crate::headers::VaryOption;
use crate::purge::PurgeSet;
use crate::stats::Variable;
use crate::storage::KeyValueStore;
use crate::timer::SECOND_MS;
use crate::timer::Timer;
use crate::value::CacheEntry;
use crate::value::HttpValue;
use crate::value::Marker;
use crate::value::MarkerKind;
use crate::value::hash_contents;

mod write_through;

pub use write_through::*;

/// The name of the counter of microseconds spent in lookups.
pub const CACHE_TIME_US: &str = "cache_time_us";
/// The name of the counter of lookups that found a usable value.
pub const CACHE_HITS: &str = "cache_hits";
/// The name of the counter of lookups that did not find a usable value.
pub const CACHE_MISSES: &str = "cache_misses";
/// The name of the counter of lookups that found something in the store.
pub const CACHE_BACKEND_HITS: &str = "cache_backend_hits";
/// The name of the counter of lookups that found nothing in the store.
pub const CACHE_BACKEND_MISSES: &str = "cache_backend_misses";
/// The name of the counter of misses that offered a fallback value.
pub const CACHE_FALLBACKS: &str = "cache_fallbacks";
/// The name of the counter of misses caused by an expired entry.
pub const CACHE_EXPIRATIONS: &str = "cache_expirations";
/// The name of the counter of entries written to the store.
pub const CACHE_INSERTS: &str = "cache_inserts";
/// The name of the counter of entries deleted from the store.
pub const CACHE_DELETES: &str = "cache_deletes";

/// The outcome of a cache lookup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FindResult {
    /// A fresh, valid value was found.
    Found,
    /// Nothing usable was found.
    NotFound,
    /// A recent fetch failed or was dropped.
    RecentFetchFailed,
    /// A recent fetch produced a response that could not be cached.
    RecentFetchNotCacheable,
    /// A recent fetch produced an empty response.
    RecentFetchEmpty,
}

impl fmt::Display for FindResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found => write!(f, "found"),
            Self::NotFound => write!(f, "not found"),
            Self::RecentFetchFailed => write!(f, "recent fetch failed"),
            Self::RecentFetchNotCacheable => write!(f, "recent fetch not cacheable"),
            Self::RecentFetchEmpty => write!(f, "recent fetch empty"),
        }
    }
}

/// The statistics of an [`HttpCache`].
#[derive(Debug)]
pub struct HttpCacheStats {
    /// Microseconds spent in lookups.
    pub cache_time_us: Variable,
    /// Lookups that found a usable value.
    pub cache_hits: Variable,
    /// Lookups that did not find a usable value.
    pub cache_misses: Variable,
    /// Lookups that found something in the store.
    pub cache_backend_hits: Variable,
    /// Lookups that found nothing in the store.
    pub cache_backend_misses: Variable,
    /// Misses that offered a fallback value.
    pub cache_fallbacks: Variable,
    /// Misses caused by an expired entry.
    pub cache_expirations: Variable,
    /// Entries written to the store.
    pub cache_inserts: Variable,
    /// Entries deleted from the store.
    pub cache_deletes: Variable,
}

impl Default for HttpCacheStats {
    fn default() -> Self {
        Self {
            cache_time_us: Variable::new(CACHE_TIME_US),
            cache_hits: Variable::new(CACHE_HITS),
            cache_misses: Variable::new(CACHE_MISSES),
            cache_backend_hits: Variable::new(CACHE_BACKEND_HITS),
            cache_backend_misses: Variable::new(CACHE_BACKEND_MISSES),
            cache_fallbacks: Variable::new(CACHE_FALLBACKS),
            cache_expirations: Variable::new(CACHE_EXPIRATIONS),
            cache_inserts: Variable::new(CACHE_INSERTS),
            cache_deletes: Variable::new(CACHE_DELETES),
        }
    }
}

impl HttpCacheStats {
    /// Gets the current value of every counter by name.
    pub fn snapshot(&self) -> Vec<(&'static str, i64)> {
        [
            &self.cache_time_us,
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_backend_hits,
            &self.cache_backend_misses,
            &self.cache_fallbacks,
            &self.cache_expirations,
            &self.cache_inserts,
            &self.cache_deletes,
        ]
        .into_iter()
        .map(Variable::sample)
        .collect()
    }

    /// Gets the value of a counter by name.
    pub fn get(&self, name: &str) -> Option<i64> {
        self.snapshot()
            .into_iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }
}

/// The configuration of an [`HttpCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpCacheOptions {
    /// How long a failed fetch is remembered.
    pub remember_fetch_failed_ttl_seconds: i64,
    /// How long an uncacheable response is remembered.
    pub remember_not_cacheable_ttl_seconds: i64,
    /// How long a dropped fetch is remembered.
    pub remember_fetch_dropped_ttl_seconds: i64,
    /// How long an empty response is remembered.
    pub remember_empty_ttl_seconds: i64,
    /// Whether HTML served over https is never stored.
    pub disable_html_caching_on_https: bool,
    /// The prefix placed before the version number in every key.
    pub version_prefix: String,
    /// The largest body that may be stored, or -1 for no limit.
    pub max_cacheable_response_content_length: i64,
    /// Whether responses are stored and served regardless of their caching
    /// headers.
    ///
    /// Stored responses then never expire and are served even when they are
    /// not proxy-cacheable. Remembered fetch outcomes keep their TTLs.
    pub force_caching: bool,
}

impl Default for HttpCacheOptions {
    fn default() -> Self {
        Self {
            remember_fetch_failed_ttl_seconds: 300,
            remember_not_cacheable_ttl_seconds: 300,
            remember_fetch_dropped_ttl_seconds: 10,
            remember_empty_ttl_seconds: 300,
            disable_html_caching_on_https: false,
            version_prefix: "v".to_string(),
            max_cacheable_response_content_length: -1,
            force_caching: false,
        }
    }
}

/// A predicate deciding whether a stored entry is still valid for a key.
type ValidityHook = Box<dyn Fn(&str, &ResponseHeaders) -> bool + Send + Sync>;

/// A predicate deciding whether a stored entry is fresh enough to use.
type FreshnessHook = Box<dyn Fn(&ResponseHeaders) -> bool + Send + Sync>;

/// The caller policy applied to a single lookup.
pub struct FindOptions {
    /// The properties of the request being served.
    request: RequestProperties,
    /// How `Vary` headers are treated.
    vary: VaryOption,
    /// A freshness lifetime to extend stored entries to, if positive.
    override_cache_ttl_ms: i64,
    /// Whether unsuccessful lookups are counted.
    update_stats_on_failure: bool,
    /// The validity predicate.
    is_cache_valid: Option<ValidityHook>,
    /// The freshness predicate.
    is_fresh: Option<FreshnessHook>,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            request: RequestProperties::default(),
            vary: VaryOption::RespectVary,
            override_cache_ttl_ms: -1,
            update_stats_on_failure: true,
            is_cache_valid: None,
            is_fresh: None,
        }
    }
}

impl FindOptions {
    /// Sets the properties of the request being served.
    pub fn with_request(mut self, request: RequestProperties) -> Self {
        self.request = request;
        self
    }

    /// Sets how `Vary` headers are treated.
    pub fn with_vary(mut self, vary: VaryOption) -> Self {
        self.vary = vary;
        self
    }

    /// Sets a freshness lifetime that stored entries are extended to.
    ///
    /// Overrides that are not positive, or not longer than an entry's own
    /// lifetime, have no effect on that entry.
    pub fn with_override_cache_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.override_cache_ttl_ms = ttl_ms;
        self
    }

    /// Sets whether lookups that do not find a value update the statistics.
    pub fn with_update_stats_on_failure(mut self, update: bool) -> Self {
        self.update_stats_on_failure = update;
        self
    }

    /// Sets the validity predicate.
    ///
    /// An entry the predicate rejects is treated as missing and is not
    /// offered as a fallback.
    pub fn with_cache_validator(
        mut self,
        hook: impl Fn(&str, &ResponseHeaders) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_cache_valid = Some(Box::new(hook));
        self
    }

    /// Sets the freshness predicate.
    ///
    /// An entry the predicate rejects is treated as missing but is still
    /// offered as a fallback.
    pub fn with_freshness(
        mut self,
        hook: impl Fn(&ResponseHeaders) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_fresh = Some(Box::new(hook));
        self
    }

    /// Uses a purge set as the validity predicate.
    ///
    /// Entries dated at or before a purge of their URL are invalid.
    pub fn with_purge_set(self, purge_set: Arc<PurgeSet>) -> Self {
        self.with_cache_validator(move |key, headers| purge_set.is_valid(key, headers.date_ms()))
    }

    /// Applies the validity predicate.
    fn is_cache_valid(&self, key: &str, headers: &ResponseHeaders) -> bool {
        self.is_cache_valid.as_ref().is_none_or(|hook| hook(key, headers))
    }

    /// Applies the freshness predicate.
    fn is_fresh(&self, headers: &ResponseHeaders) -> bool {
        self.is_fresh.as_ref().is_none_or(|hook| hook(headers))
    }
}

impl fmt::Debug for FindOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindOptions")
            .field("request", &self.request)
            .field("vary", &self.vary)
            .field("override_cache_ttl_ms", &self.override_cache_ttl_ms)
            .field("update_stats_on_failure", &self.update_stats_on_failure)
            .field("is_cache_valid", &self.is_cache_valid.is_some())
            .field("is_fresh", &self.is_fresh.is_some())
            .finish()
    }
}

/// The result of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindOutcome {
    /// What the lookup found.
    pub result: FindResult,
    /// The value, when `result` is [`FindResult::Found`].
    pub value: Option<HttpValue>,
    /// A stale value that may be served when a fresh one cannot be obtained.
    pub fallback: Option<HttpValue>,
}

impl FindOutcome {
    /// An outcome with the given result and no values.
    fn empty(result: FindResult) -> Self {
        Self {
            result,
            value: None,
            fallback: None,
        }
    }
}

/// What a lookup learned about the stored entry, for statistics.
#[derive(Debug, Default, Clone, Copy)]
struct LookupFacts {
    /// The store had an entry for the key.
    backend_hit: bool,
    /// The entry had expired.
    expired: bool,
}

/// An HTTP cache over a key/value store.
pub struct HttpCache<S> {
    /// The underlying store.
    store: S,
    /// The source of time.
    timer: Arc<dyn Timer>,
    /// The cache configuration.
    options: HttpCacheOptions,
    /// The current key version.
    version: AtomicU32,
    /// Whether negative outcomes are no longer remembered.
    ignore_failure_puts: AtomicBool,
    /// The cache statistics.
    stats: Arc<HttpCacheStats>,
}

impl<S: KeyValueStore> HttpCache<S> {
    /// Constructs a new cache with the default options.
    pub fn new(store: S, timer: Arc<dyn Timer>) -> Self {
        Self::new_with_options(store, timer, HttpCacheOptions::default())
    }

    /// Constructs a new cache with the given options.
    pub fn new_with_options(store: S, timer: Arc<dyn Timer>, options: HttpCacheOptions) -> Self {
        Self {
            store,
            timer,
            options,
            version: AtomicU32::new(1),
            ignore_failure_puts: AtomicBool::new(false),
            stats: Arc::default(),
        }
    }

    /// Uses the given statistics instead of a private set.
    ///
    /// Several caches may share one set of statistics.
    pub fn with_stats(mut self, stats: Arc<HttpCacheStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Gets the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Gets the timer of the cache.
    pub fn timer(&self) -> &Arc<dyn Timer> {
        &self.timer
    }

    /// Gets the cache configuration.
    pub fn options(&self) -> &HttpCacheOptions {
        &self.options
    }

    /// Gets the cache statistics.
    pub fn stats(&self) -> &Arc<HttpCacheStats> {
        &self.stats
    }

    /// Gets the current key version.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Sets the key version.
    ///
    /// Entries written under any other version become unreachable.
    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Release);
    }

    /// Stops remembering negative outcomes.
    ///
    /// There is no way to turn this back off.
    pub fn set_ignore_failure_puts(&self) {
        self.ignore_failure_puts.store(true, Ordering::Release);
    }

    /// Determines if negative outcomes are being ignored.
    pub fn ignore_failure_puts(&self) -> bool {
        self.ignore_failure_puts.load(Ordering::Acquire)
    }

    /// Computes the store key for a URL within a fragment.
    ///
    /// Returns `None` if the URL is not a fetchable http(s) URL or the
    /// fragment contains a `/`.
    pub fn compound_key(&self, key: &str, fragment: &str) -> Option<String> {
        let url = parse_fetchable(key)?;
        if fragment.contains('/') {
            return None;
        }

        let prefix = &self.options.version_prefix;
        let version = self.version();
        Some(if fragment.is_empty() {
            format!("{prefix}{version}/{url}")
        } else {
            format!("{prefix}{version}/{fragment}/{url}")
        })
    }

    /// Determines if a body of the given length may be stored.
    pub fn is_cacheable_body_size(&self, len: usize) -> bool {
        let max = self.options.max_cacheable_response_content_length;
        max < 0 || u64::try_from(max).is_ok_and(|max| len as u64 <= max)
    }

    /// Looks up a URL.
    ///
    /// Never fails: store errors and undecodable entries are logged and
    /// reported as [`FindResult::NotFound`].
    pub async fn find(&self, key: &str, fragment: &str, options: &FindOptions) -> FindOutcome {
        self.lookup(key, fragment, options, options.update_stats_on_failure)
            .await
            .0
    }

    /// Looks up a URL, counting unsuccessful lookups only if `count_failures`
    /// is set.
    ///
    /// Also returns the stored entry behind any result other than
    /// [`FindResult::NotFound`].
    async fn lookup(
        &self,
        key: &str,
        fragment: &str,
        options: &FindOptions,
        count_failures: bool,
    ) -> (FindOutcome, Option<CacheEntry>) {
        let start_us = self.timer.now_us();
        let mut facts = LookupFacts::default();

        let entry = match self.compound_key(key, fragment) {
            Some(compound) => self.load(&compound, &mut facts).await,
            None => {
                debug!(key, fragment, "cannot look up an invalid URL or fragment");
                None
            }
        };

        let outcome = match entry.clone() {
            Some(CacheEntry::Value(value)) => self.evaluate_value(key, value, options, &mut facts),
            Some(CacheEntry::Marker(marker)) => {
                self.evaluate_marker(key, marker, options, &mut facts)
            }
            None => FindOutcome::empty(FindResult::NotFound),
        };

        if count_failures || outcome.result == FindResult::Found {
            self.update_stats(&outcome, facts, start_us);
        }

        let entry = entry.filter(|_| outcome.result != FindResult::NotFound);
        (outcome, entry)
    }

    /// Stores a response.
    ///
    /// The response is stored only if it is a fresh, proxy-cacheable
    /// `200 OK` for a fetchable URL. Returns whether it was stored.
    ///
    /// With [`HttpCacheOptions::force_caching`], only the status and the
    /// https HTML policy are checked.
    pub async fn put(
        &self,
        key: &str,
        fragment: &str,
        request: &RequestProperties,
        vary: VaryOption,
        headers: ResponseHeaders,
        content: impl Into<Bytes>,
    ) -> bool {
        match self.prepare_put(key, fragment, request, vary, headers, content.into()) {
            Some((compound, entry)) => self.store_entry(key, &compound, &entry).await,
            None => false,
        }
    }

    /// Applies the storage policy to a response, producing the store key and
    /// the entry to write.
    fn prepare_put(
        &self,
        key: &str,
        fragment: &str,
        request: &RequestProperties,
        vary: VaryOption,
        mut headers: ResponseHeaders,
        content: Bytes,
    ) -> Option<(String, CacheEntry)> {
        let now_ms = self.timer.now_ms();

        let Some(compound) = self.compound_key(key, fragment) else {
            debug!(key, fragment, "not caching an invalid URL or fragment");
            return None;
        };

        if headers.status() != StatusCode::OK {
            debug!(key, status = %headers.status(), "not caching a non-200 response");
            return None;
        }

        headers.compute_caching(now_ms);
        if !self.may_cache(key, &headers) {
            debug!(key, "not caching HTML served over https");
            return None;
        }

        if !self.options.force_caching {
            if headers.is_expired(now_ms) {
                debug!(key, "not caching an already expired response");
                return None;
            }

            if !headers.is_proxy_cacheable(request, vary) {
                debug!(key, "not caching a response that is not proxy-cacheable");
                return None;
            }

            if !self.is_cacheable_body_size(content.len()) {
                debug!(key, len = content.len(), "not caching an oversized response");
                return None;
            }
        }

        headers.sanitize();
        headers.ensure_etag(&hash_contents(&content));
        Some((compound, CacheEntry::Value(HttpValue::new(headers, content))))
    }

    /// Stores an existing value.
    ///
    /// This is subject to the same checks as [`HttpCache::put`].
    pub async fn put_value(
        &self,
        key: &str,
        fragment: &str,
        request: &RequestProperties,
        vary: VaryOption,
        value: &HttpValue,
    ) -> bool {
        self.put(
            key,
            fragment,
            request,
            vary,
            value.headers().clone(),
            value.contents().clone(),
        )
        .await
    }

    /// Remembers that a fetch of the URL recently failed.
    pub async fn remember_fetch_failed(&self, key: &str, fragment: &str) {
        self.remember(
            key,
            fragment,
            MarkerKind::FetchFailed,
            self.options.remember_fetch_failed_ttl_seconds,
        )
        .await;
    }

    /// Remembers that a fetch of the URL was recently dropped.
    pub async fn remember_fetch_dropped(&self, key: &str, fragment: &str) {
        self.remember(
            key,
            fragment,
            MarkerKind::FetchDropped,
            self.options.remember_fetch_dropped_ttl_seconds,
        )
        .await;
    }

    /// Remembers that a recent fetch of the URL could not be cached.
    ///
    /// A marker for a `200 OK` response cannot be overridden by a TTL
    /// override at lookup time; a marker for any other status can.
    pub async fn remember_not_cacheable(
        &self,
        key: &str,
        fragment: &str,
        is_original_status_200: bool,
    ) {
        let kind = if is_original_status_200 {
            MarkerKind::NotCacheable200
        } else {
            MarkerKind::NotCacheable
        };

        self.remember(
            key,
            fragment,
            kind,
            self.options.remember_not_cacheable_ttl_seconds,
        )
        .await;
    }

    /// Remembers that a recent fetch of the URL returned an empty body.
    pub async fn remember_empty(&self, key: &str, fragment: &str) {
        self.remember(
            key,
            fragment,
            MarkerKind::Empty,
            self.options.remember_empty_ttl_seconds,
        )
        .await;
    }

    /// Deletes whatever is stored for the URL.
    pub async fn delete(&self, key: &str, fragment: &str) {
        let Some(compound) = self.compound_key(key, fragment) else {
            return;
        };

        self.stats.cache_deletes.increment();
        if let Err(e) = self.store.delete(&compound).await {
            warn!(
                key,
                store = self.store.name(),
                error = format!("{e:?}"),
                "failed to delete cache entry"
            );
        }
    }

    /// Loads and decodes the entry for a store key.
    async fn load(&self, compound: &str, facts: &mut LookupFacts) -> Option<CacheEntry> {
        let bytes = match self.store.get(compound).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(
                    key = compound,
                    store = self.store.name(),
                    error = format!("{e:?}"),
                    "cache store is unavailable: treating lookup as a miss"
                );
                return None;
            }
        };

        facts.backend_hit = true;
        CacheEntry::decode(&bytes)
            .inspect_err(|e| {
                warn!(
                    key = compound,
                    error = format!("{e:?}"),
                    "cache entry is corrupt: treating lookup as a miss"
                );
            })
            .ok()
    }

    /// Applies caller policy to a stored response.
    fn evaluate_value(
        &self,
        key: &str,
        value: HttpValue,
        options: &FindOptions,
        facts: &mut LookupFacts,
    ) -> FindOutcome {
        let forced = self.options.force_caching;
        let headers = value.headers();
        if !forced && !headers.is_proxy_cacheable(&options.request, options.vary) {
            debug!(key, "stored response is not cacheable for this request");
            return FindOutcome::empty(FindResult::NotFound);
        }

        if !options.is_cache_valid(key, headers) {
            debug!(key, "stored response was invalidated");
            return FindOutcome::empty(FindResult::NotFound);
        }

        let mut extended = headers.clone();
        if extended.extend_lifetime(options.override_cache_ttl_ms) {
            debug!(
                key,
                ttl_ms = options.override_cache_ttl_ms,
                "extending stored response lifetime"
            );
        }

        let now_ms = self.timer.now_ms();
        facts.expired = !forced && extended.is_expired(now_ms);
        if !facts.expired && options.is_fresh(&extended) {
            let contents = value.contents().clone();
            return FindOutcome {
                result: FindResult::Found,
                value: Some(HttpValue::new(extended, contents)),
                fallback: None,
            };
        }

        FindOutcome {
            result: FindResult::NotFound,
            value: None,
            fallback: Some(value),
        }
    }

    /// Applies caller policy to a stored negative marker.
    fn evaluate_marker(
        &self,
        key: &str,
        marker: Marker,
        options: &FindOptions,
        facts: &mut LookupFacts,
    ) -> FindOutcome {
        // Markers present to the policy hooks as bodiless responses dated when
        // the outcome was recorded
        let headers = ResponseHeaders::from_parts(
            StatusCode::NO_CONTENT,
            HeaderMap::new(),
            marker.date_ms,
            marker.expiration_ms,
        );

        facts.expired = headers.is_expired(self.timer.now_ms());
        if facts.expired || !options.is_cache_valid(key, &headers) || !options.is_fresh(&headers) {
            return FindOutcome::empty(FindResult::NotFound);
        }

        let result = match marker.kind {
            MarkerKind::FetchFailed | MarkerKind::FetchDropped => FindResult::RecentFetchFailed,
            MarkerKind::NotCacheable if options.override_cache_ttl_ms > 0 => {
                debug!(key, "TTL override allows a retry of an uncacheable response");
                FindResult::NotFound
            }
            MarkerKind::NotCacheable | MarkerKind::NotCacheable200 => {
                FindResult::RecentFetchNotCacheable
            }
            MarkerKind::Empty => FindResult::RecentFetchEmpty,
        };

        debug!(key, %result, "found a remembered fetch outcome");
        FindOutcome::empty(result)
    }

    /// Records the statistics of a lookup.
    fn update_stats(&self, outcome: &FindOutcome, facts: LookupFacts, start_us: i64) {
        self.stats
            .cache_time_us
            .add(self.timer.now_us() - start_us);

        if facts.backend_hit {
            self.stats.cache_backend_hits.increment();
        } else {
            self.stats.cache_backend_misses.increment();
        }

        if outcome.result == FindResult::Found {
            self.stats.cache_hits.increment();
            return;
        }

        self.stats.cache_misses.increment();
        if outcome.fallback.is_some() {
            self.stats.cache_fallbacks.increment();
        }
        if facts.expired {
            self.stats.cache_expirations.increment();
        }
    }

    /// Writes a negative marker unless failure puts are ignored.
    async fn remember(&self, key: &str, fragment: &str, kind: MarkerKind, ttl_seconds: i64) {
        if self.ignore_failure_puts() {
            debug!(key, ?kind, "not remembering a fetch outcome");
            return;
        }

        let Some(compound) = self.compound_key(key, fragment) else {
            return;
        };

        let now_ms = self.timer.now_ms();
        let marker = Marker {
            kind,
            date_ms: now_ms,
            expiration_ms: now_ms + ttl_seconds * SECOND_MS,
        };
        self.store_entry(key, &compound, &CacheEntry::Marker(marker))
            .await;
    }

    /// Encodes and writes an entry, returning whether the store accepted it.
    async fn store_entry(&self, key: &str, compound: &str, entry: &CacheEntry) -> bool {
        match encode_entry(key, entry) {
            Some(bytes) => self.store_bytes(key, compound, bytes).await,
            None => false,
        }
    }

    /// Writes an encoded entry, returning whether the store accepted it.
    async fn store_bytes(&self, key: &str, compound: &str, bytes: Bytes) -> bool {
        self.stats.cache_inserts.increment();
        match self.store.put(compound, bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    key,
                    store = self.store.name(),
                    error = format!("{e:?}"),
                    "failed to write cache entry"
                );
                false
            }
        }
    }

    /// Applies the URL-level storage policy.
    fn may_cache(&self, key: &str, headers: &ResponseHeaders) -> bool {
        !(self.options.disable_html_caching_on_https
            && parse_fetchable(key).is_some_and(|url| url.scheme() == "https")
            && headers.is_html_like())
    }
}

/// Encodes an entry for the store, logging failures.
fn encode_entry(key: &str, entry: &CacheEntry) -> Option<Bytes> {
    entry
        .encode()
        .inspect_err(|e| warn!(key, error = format!("{e:?}"), "failed to encode cache entry"))
        .ok()
}

/// Parses a URL, requiring an http(s) scheme.
fn parse_fetchable(key: &str) -> Option<Url> {
    Url::parse(key.trim())
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
}
