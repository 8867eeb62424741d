//! Tests of `HttpCache` lookups, stores and remembered fetch outcomes.

use std::sync::Arc;

use anyhow::Result;
use anyhow::bail;
use bytes::Bytes;
use pagespeed_cache::CACHE_BACKEND_MISSES;
use pagespeed_cache::CACHE_EXPIRATIONS;
use pagespeed_cache::CACHE_FALLBACKS;
use pagespeed_cache::CACHE_HITS;
use pagespeed_cache::CACHE_INSERTS;
use pagespeed_cache::CACHE_MISSES;
use pagespeed_cache::FindOptions;
use pagespeed_cache::FindResult;
use pagespeed_cache::HttpCache;
use pagespeed_cache::HttpCacheOptions;
use pagespeed_cache::MockTimer;
use pagespeed_cache::PurgeSet;
use pagespeed_cache::RequestProperties;
use pagespeed_cache::ResponseHeaders;
use pagespeed_cache::Timer;
use pagespeed_cache::VaryOption;
use pagespeed_cache::http::HeaderMap;
use pagespeed_cache::http::HeaderValue;
use pagespeed_cache::http::StatusCode;
use pagespeed_cache::http::header;
use pagespeed_cache::storage::KeyValueStore;
use pagespeed_cache::storage::MemoryStore;

const URL: &str = "http://www.example.com/a.css";
const FRAGMENT: &str = "f";

fn cache_with(options: HttpCacheOptions) -> (MockTimer, HttpCache<MemoryStore>) {
    let timer = MockTimer::default();
    let cache = HttpCache::new_with_options(
        MemoryStore::new(1024 * 1024),
        Arc::new(timer.clone()),
        options,
    );
    (timer, cache)
}

fn cache() -> (MockTimer, HttpCache<MemoryStore>) {
    cache_with(HttpCacheOptions::default())
}

fn response(status: StatusCode, headers: &[(&'static str, &'static str)]) -> ResponseHeaders {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(*name, HeaderValue::from_static(value));
    }
    ResponseHeaders::new(status, map)
}

fn cacheable(cache_control: &'static str) -> ResponseHeaders {
    response(
        StatusCode::OK,
        &[
            ("cache-control", cache_control),
            ("content-type", "text/css"),
        ],
    )
}

async fn put<S: KeyValueStore>(
    cache: &HttpCache<S>,
    url: &str,
    fragment: &str,
    headers: ResponseHeaders,
    content: &'static str,
) -> bool {
    cache
        .put(
            url,
            fragment,
            &RequestProperties::default(),
            VaryOption::RespectVary,
            headers,
            content,
        )
        .await
}

fn stat<S: KeyValueStore>(cache: &HttpCache<S>, name: &str) -> i64 {
    cache.stats().get(name).unwrap()
}

#[tokio::test]
async fn put_find_and_expire() {
    let (timer, cache) = cache();
    assert!(put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "content").await);
    assert_eq!(stat(&cache, CACHE_INSERTS), 1);

    let found = cache.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::Found);
    assert_eq!(found.value.unwrap().contents().as_ref(), b"content");
    assert_eq!(stat(&cache, CACHE_HITS), 1);

    timer.advance_ms(301 * 1000);
    let found = cache.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert!(found.value.is_none());
    assert_eq!(found.fallback.unwrap().contents().as_ref(), b"content");
    assert_eq!(stat(&cache, CACHE_EXPIRATIONS), 1);
    assert_eq!(stat(&cache, CACHE_FALLBACKS), 1);
    assert_eq!(stat(&cache, CACHE_MISSES), 1);
}

#[tokio::test]
async fn missing_entries_have_no_fallback() {
    let (_, cache) = cache();
    let found = cache.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert!(found.fallback.is_none());
    assert_eq!(stat(&cache, CACHE_BACKEND_MISSES), 1);
}

#[tokio::test]
async fn remembered_outcomes_expire_after_their_ttl() {
    let (timer, cache) = cache();
    let cases = [
        ("http://www.example.com/failed", 300, FindResult::RecentFetchFailed),
        ("http://www.example.com/uncacheable", 300, FindResult::RecentFetchNotCacheable),
        ("http://www.example.com/dropped", 10, FindResult::RecentFetchFailed),
        ("http://www.example.com/empty", 300, FindResult::RecentFetchEmpty),
    ];

    for (url, ttl_seconds, expected) in cases {
        let start_ms = timer.now_ms();
        match url {
            "http://www.example.com/failed" => cache.remember_fetch_failed(url, FRAGMENT).await,
            "http://www.example.com/uncacheable" => {
                cache.remember_not_cacheable(url, FRAGMENT, false).await
            }
            "http://www.example.com/dropped" => cache.remember_fetch_dropped(url, FRAGMENT).await,
            _ => cache.remember_empty(url, FRAGMENT).await,
        }

        timer.set_time_ms(start_ms + ttl_seconds * 1000 - 1);
        let found = cache.find(url, FRAGMENT, &FindOptions::default()).await;
        assert_eq!(found.result, expected, "{url} before its TTL");

        timer.set_time_ms(start_ms + ttl_seconds * 1000 + 1);
        let found = cache.find(url, FRAGMENT, &FindOptions::default()).await;
        assert_eq!(found.result, FindResult::NotFound, "{url} after its TTL");
    }
}

#[tokio::test]
async fn configured_ttls_are_used() {
    let (timer, cache) = cache_with(HttpCacheOptions {
        remember_fetch_failed_ttl_seconds: 5,
        ..Default::default()
    });

    cache.remember_fetch_failed(URL, FRAGMENT).await;
    timer.advance_ms(4000);
    assert_eq!(
        cache.find(URL, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::RecentFetchFailed
    );
    timer.advance_ms(2000);
    assert_eq!(
        cache.find(URL, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::NotFound
    );
}

#[tokio::test]
async fn fragments_are_isolated() {
    let (_, cache) = cache();
    assert!(put(&cache, URL, "a", cacheable("max-age=300"), "from a").await);

    let other = cache.find(URL, "b", &FindOptions::default()).await;
    assert_eq!(other.result, FindResult::NotFound);
    assert!(other.fallback.is_none());
    assert_eq!(
        cache.find(URL, "", &FindOptions::default()).await.result,
        FindResult::NotFound
    );

    assert!(put(&cache, URL, "b", cacheable("max-age=300"), "from b").await);
    let a = cache.find(URL, "a", &FindOptions::default()).await;
    let b = cache.find(URL, "b", &FindOptions::default()).await;
    assert_eq!(a.value.unwrap().contents().as_ref(), b"from a");
    assert_eq!(b.value.unwrap().contents().as_ref(), b"from b");
}

#[tokio::test]
async fn version_bump_orphans_every_entry() {
    let (_, cache) = cache();
    let urls = ["http://www.example.com/1", "http://www.example.com/2"];
    for url in urls {
        assert!(put(&cache, url, FRAGMENT, cacheable("max-age=300"), "old").await);
    }
    cache.remember_fetch_failed("http://www.example.com/3", FRAGMENT).await;

    let version = cache.version();
    cache.set_version(version + 1);
    cache.set_version(version + 1);

    for url in urls.iter().chain(&["http://www.example.com/3"]) {
        let found = cache.find(url, FRAGMENT, &FindOptions::default()).await;
        assert_eq!(found.result, FindResult::NotFound);
        assert!(found.fallback.is_none());
    }

    assert!(put(&cache, urls[0], FRAGMENT, cacheable("max-age=300"), "new").await);
    let found = cache.find(urls[0], FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.value.unwrap().contents().as_ref(), b"new");

    cache.set_version(version);
    let found = cache.find(urls[1], FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.value.unwrap().contents().as_ref(), b"old");
}

#[tokio::test]
async fn invalidated_entries_offer_no_fallback() {
    let (_, cache) = cache();
    assert!(put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "content").await);

    let options = FindOptions::default().with_cache_validator(|_, _| false);
    let found = cache.find(URL, FRAGMENT, &options).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert!(found.fallback.is_none());

    let options = FindOptions::default().with_freshness(|_| false);
    let found = cache.find(URL, FRAGMENT, &options).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert_eq!(found.fallback.unwrap().contents().as_ref(), b"content");
}

#[tokio::test]
async fn purge_sets_invalidate_older_entries() {
    let (timer, cache) = cache();
    assert!(put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "content").await);
    let stored_at = timer.now_ms();

    let mut purges = PurgeSet::new(1024);
    purges.put(URL, stored_at - 1000);
    let options = FindOptions::default().with_purge_set(Arc::new(purges.clone()));
    assert_eq!(cache.find(URL, FRAGMENT, &options).await.result, FindResult::Found);

    purges.put(URL, stored_at);
    let options = FindOptions::default().with_purge_set(Arc::new(purges));
    let found = cache.find(URL, FRAGMENT, &options).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert!(found.fallback.is_none());
}

#[tokio::test]
async fn ttl_override_only_extends() {
    let (timer, cache) = cache();
    assert!(put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "content").await);

    // A shorter override does not shorten the lifetime
    timer.advance_ms(299 * 1000);
    let options = FindOptions::default().with_override_cache_ttl_ms(100 * 1000);
    let found = cache.find(URL, FRAGMENT, &options).await;
    assert_eq!(found.result, FindResult::Found);
    assert_eq!(
        found.value.unwrap().headers().lookup1(header::CACHE_CONTROL),
        Some("max-age=300")
    );

    // A longer override extends it and is reflected in the headers
    timer.advance_ms(101 * 1000);
    let options = FindOptions::default().with_override_cache_ttl_ms(600 * 1000);
    let found = cache.find(URL, FRAGMENT, &options).await;
    assert_eq!(found.result, FindResult::Found);
    assert_eq!(
        found.value.unwrap().headers().lookup1(header::CACHE_CONTROL),
        Some("max-age=600")
    );

    let found = cache.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::NotFound);

    let options = FindOptions::default().with_override_cache_ttl_ms(-1);
    assert_eq!(cache.find(URL, FRAGMENT, &options).await.result, FindResult::NotFound);
}

#[tokio::test]
async fn ttl_override_retries_only_non_200_uncacheable() {
    let (_, cache) = cache();
    let options = FindOptions::default().with_override_cache_ttl_ms(200 * 1000);

    let ok = "http://www.example.com/ok";
    cache.remember_not_cacheable(ok, FRAGMENT, true).await;
    assert_eq!(
        cache.find(ok, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::RecentFetchNotCacheable
    );
    assert_eq!(
        cache.find(ok, FRAGMENT, &options).await.result,
        FindResult::RecentFetchNotCacheable
    );

    let not_ok = "http://www.example.com/not-ok";
    cache.remember_not_cacheable(not_ok, FRAGMENT, false).await;
    assert_eq!(
        cache.find(not_ok, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::RecentFetchNotCacheable
    );
    assert_eq!(
        cache.find(not_ok, FRAGMENT, &options).await.result,
        FindResult::NotFound
    );

    let failed = "http://www.example.com/failed";
    cache.remember_fetch_failed(failed, FRAGMENT).await;
    assert_eq!(
        cache.find(failed, FRAGMENT, &options).await.result,
        FindResult::RecentFetchFailed
    );
}

#[tokio::test]
async fn put_supersedes_markers() {
    let (_, cache) = cache();
    cache.remember_fetch_failed(URL, FRAGMENT).await;
    assert!(put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "content").await);
    assert_eq!(
        cache.find(URL, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::Found
    );

    cache.remember_empty(URL, FRAGMENT).await;
    assert_eq!(
        cache.find(URL, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::RecentFetchEmpty
    );
}

#[tokio::test]
async fn only_cacheable_200s_are_stored() {
    let (_, cache) = cache();
    let cases = [
        response(StatusCode::NOT_FOUND, &[("cache-control", "max-age=300")]),
        response(StatusCode::PARTIAL_CONTENT, &[("cache-control", "max-age=300")]),
        response(
            StatusCode::MOVED_PERMANENTLY,
            &[("cache-control", "max-age=300"), ("location", "/b")],
        ),
        cacheable("no-store"),
        cacheable("private, max-age=300"),
        cacheable("max-age=0"),
    ];

    for headers in cases {
        assert!(!put(&cache, URL, FRAGMENT, headers, "content").await);
    }

    assert!(!put(&cache, "ftp://www.example.com/a", FRAGMENT, cacheable("max-age=300"), "x").await);
    assert!(!put(&cache, "not a url", FRAGMENT, cacheable("max-age=300"), "x").await);
    assert!(!put(&cache, URL, "bad/fragment", cacheable("max-age=300"), "x").await);
    assert_eq!(stat(&cache, CACHE_INSERTS), 0);
}

#[tokio::test]
async fn vary_rules() {
    let (_, cache) = cache();
    let vary_ua = || {
        response(
            StatusCode::OK,
            &[
                ("cache-control", "max-age=300"),
                ("content-type", "text/css"),
                ("vary", "User-Agent"),
            ],
        )
    };

    let request = RequestProperties::default();
    assert!(
        !cache
            .put(URL, FRAGMENT, &request, VaryOption::RespectVary, vary_ua(), "x")
            .await
    );
    assert!(
        cache
            .put(URL, FRAGMENT, &request, VaryOption::IgnoreVary, vary_ua(), "x")
            .await
    );

    // HTML always respects vary
    let html = response(
        StatusCode::OK,
        &[
            ("cache-control", "max-age=300"),
            ("content-type", "text/html"),
            ("vary", "User-Agent"),
        ],
    );
    assert!(
        !cache
            .put(URL, FRAGMENT, &request, VaryOption::IgnoreVary, html, "x")
            .await
    );

    // Accept-Encoding never blocks caching
    let gzip = response(
        StatusCode::OK,
        &[
            ("cache-control", "max-age=300"),
            ("content-type", "text/css"),
            ("vary", "Accept-Encoding"),
        ],
    );
    assert!(
        cache
            .put(URL, FRAGMENT, &request, VaryOption::RespectVary, gzip, "x")
            .await
    );

    // A request with a cookie cannot share a response that varies on it
    let cookie = || {
        response(
            StatusCode::OK,
            &[
                ("cache-control", "max-age=300"),
                ("content-type", "text/css"),
                ("vary", "Cookie"),
            ],
        )
    };
    let with_cookie = RequestProperties {
        has_cookie: true,
        ..Default::default()
    };
    assert!(
        !cache
            .put(URL, FRAGMENT, &with_cookie, VaryOption::IgnoreVary, cookie(), "x")
            .await
    );
    assert!(
        cache
            .put(URL, FRAGMENT, &request, VaryOption::IgnoreVary, cookie(), "x")
            .await
    );
}

#[tokio::test]
async fn stored_headers_are_sanitized() {
    let (_, cache) = cache();
    let headers = response(
        StatusCode::OK,
        &[
            ("cache-control", "public, max-age=300"),
            ("content-type", "text/css"),
            ("set-cookie", "session=secret"),
            ("set-cookie2", "session=secret"),
            ("connection", "x-private"),
            ("x-private", "1"),
            ("x-public", "1"),
        ],
    );
    assert!(put(&cache, URL, FRAGMENT, headers, "content").await);

    let value = cache
        .find(URL, FRAGMENT, &FindOptions::default())
        .await
        .value
        .unwrap();
    let headers = value.headers();
    assert!(headers.lookup1(header::SET_COOKIE).is_none());
    assert!(headers.lookup1("set-cookie2").is_none());
    assert!(headers.lookup1("x-private").is_none());
    assert_eq!(headers.lookup1("x-public"), Some("1"));
    assert!(
        headers
            .lookup1(header::ETAG)
            .unwrap()
            .starts_with("W/\"PSA-")
    );
}

#[tokio::test]
async fn existing_etags_are_kept() {
    let (_, cache) = cache();
    let headers = response(
        StatusCode::OK,
        &[("cache-control", "max-age=300"), ("etag", "\"abc\"")],
    );
    assert!(put(&cache, URL, FRAGMENT, headers, "content").await);
    let value = cache
        .find(URL, FRAGMENT, &FindOptions::default())
        .await
        .value
        .unwrap();
    assert_eq!(value.headers().lookup1(header::ETAG), Some("\"abc\""));
}

#[tokio::test]
async fn html_over_https_can_be_excluded() {
    let html = || {
        response(
            StatusCode::OK,
            &[("cache-control", "max-age=300"), ("content-type", "text/html")],
        )
    };

    let (_, cache) = cache_with(HttpCacheOptions {
        disable_html_caching_on_https: true,
        ..Default::default()
    });
    assert!(!put(&cache, "https://www.example.com/", FRAGMENT, html(), "<html>").await);
    assert!(put(&cache, "http://www.example.com/", FRAGMENT, html(), "<html>").await);
    assert!(
        put(
            &cache,
            "https://www.example.com/a.css",
            FRAGMENT,
            cacheable("max-age=300"),
            "a"
        )
        .await
    );

    let (_, cache) = self::cache();
    assert!(put(&cache, "https://www.example.com/", FRAGMENT, html(), "<html>").await);
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let (_, cache) = cache_with(HttpCacheOptions {
        max_cacheable_response_content_length: 4,
        ..Default::default()
    });
    assert!(cache.is_cacheable_body_size(4));
    assert!(!cache.is_cacheable_body_size(5));
    assert!(put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "1234").await);
    assert!(!put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "12345").await);
}

#[tokio::test]
async fn ignoring_failure_puts() {
    let (_, cache) = cache();
    cache.set_ignore_failure_puts();
    assert!(cache.ignore_failure_puts());

    cache.remember_fetch_failed(URL, FRAGMENT).await;
    cache.remember_not_cacheable(URL, FRAGMENT, true).await;
    cache.remember_fetch_dropped(URL, FRAGMENT).await;
    cache.remember_empty(URL, FRAGMENT).await;
    assert_eq!(
        cache.find(URL, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::NotFound
    );
    assert_eq!(stat(&cache, CACHE_INSERTS), 0);

    assert!(put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "content").await);
    assert_eq!(
        cache.find(URL, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::Found
    );
}

#[tokio::test]
async fn delete_removes_entries() {
    let (_, cache) = cache();
    assert!(put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "content").await);
    cache.delete(URL, FRAGMENT).await;
    let found = cache.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert!(found.fallback.is_none());
    assert_eq!(cache.stats().cache_deletes.get(), 1);
}

#[tokio::test]
async fn corrupt_entries_are_misses() -> Result<()> {
    let (_, cache) = cache();
    let key = cache.compound_key(URL, FRAGMENT).unwrap();
    cache
        .store()
        .put(&key, Bytes::from_static(b"definitely not an entry"))
        .await?;

    let found = cache.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert!(found.fallback.is_none());
    Ok(())
}

#[tokio::test]
async fn stats_can_skip_failed_lookups() {
    let (_, cache) = cache();
    let options = FindOptions::default().with_update_stats_on_failure(false);
    cache.find(URL, FRAGMENT, &options).await;
    assert_eq!(stat(&cache, CACHE_MISSES), 0);
    assert_eq!(stat(&cache, CACHE_BACKEND_MISSES), 0);

    assert!(put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "content").await);
    cache.find(URL, FRAGMENT, &options).await;
    assert_eq!(stat(&cache, CACHE_HITS), 1);
}

/// A store whose back end is unreachable.
struct UnavailableStore;

impl KeyValueStore for UnavailableStore {
    async fn get(&self, _: &str) -> Result<Option<Bytes>> {
        bail!("store is unavailable")
    }

    async fn put(&self, _: &str, _: Bytes) -> Result<()> {
        bail!("store is unavailable")
    }

    async fn delete(&self, _: &str) -> Result<()> {
        bail!("store is unavailable")
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

#[tokio::test]
async fn unavailable_stores_degrade_to_misses() {
    let timer = MockTimer::default();
    let cache = HttpCache::new(UnavailableStore, Arc::new(timer));

    assert!(!put(&cache, URL, FRAGMENT, cacheable("max-age=300"), "content").await);
    cache.remember_fetch_failed(URL, FRAGMENT).await;
    cache.delete(URL, FRAGMENT).await;

    let found = cache.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert_eq!(stat(&cache, CACHE_BACKEND_MISSES), 1);
}

#[tokio::test]
async fn forced_caching_ignores_caching_headers() {
    let (timer, cache) = cache_with(HttpCacheOptions {
        force_caching: true,
        max_cacheable_response_content_length: 1,
        ..Default::default()
    });

    assert!(put(&cache, URL, FRAGMENT, cacheable("private, max-age=0"), "content").await);
    timer.advance_ms(3600 * 1000);
    let found = cache.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::Found);
    assert_eq!(found.value.unwrap().contents().as_ref(), b"content");

    // Only the status still matters
    assert!(!put(&cache, URL, FRAGMENT, response(StatusCode::NOT_FOUND, &[]), "x").await);

    // Remembered outcomes keep their TTLs
    let other = "http://www.example.com/b.css";
    cache.remember_fetch_dropped(other, FRAGMENT).await;
    timer.advance_ms(11 * 1000);
    assert_eq!(
        cache.find(other, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::NotFound
    );
}

#[tokio::test]
async fn forced_caching_serves_entries_other_requests_could_not_use() {
    let timer = MockTimer::default();
    let store = MemoryStore::new(1024 * 1024);
    let cache = HttpCache::new(store.clone(), Arc::new(timer.clone()));
    let forced = HttpCache::new_with_options(
        store,
        Arc::new(timer.clone()),
        HttpCacheOptions {
            force_caching: true,
            ..Default::default()
        },
    );

    let vary_ua = response(
        StatusCode::OK,
        &[
            ("cache-control", "max-age=300"),
            ("content-type", "text/css"),
            ("vary", "User-Agent"),
        ],
    );
    assert!(
        cache
            .put(
                URL,
                FRAGMENT,
                &RequestProperties::default(),
                VaryOption::IgnoreVary,
                vary_ua,
                "content",
            )
            .await
    );

    let found = cache.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert!(found.fallback.is_none());

    let found = forced.find(URL, FRAGMENT, &FindOptions::default()).await;
    assert_eq!(found.result, FindResult::Found);

    // The forced cache never expires it; the regular one offers no fallback
    timer.advance_ms(301 * 1000);
    assert_eq!(
        forced.find(URL, FRAGMENT, &FindOptions::default()).await.result,
        FindResult::Found
    );
    assert!(
        cache
            .find(URL, FRAGMENT, &FindOptions::default())
            .await
            .fallback
            .is_none()
    );
}
