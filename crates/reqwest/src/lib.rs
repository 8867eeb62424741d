//! A [`reqwest`][reqwest] middleware that serves `GET` requests through a
//! [`pagespeed-cache`][pagespeed_cache] [`HttpCache`].
//!
//! Responses found in the cache are served without touching the network.
//! Misses are fetched and, when cacheable, stored. Recent fetch failures
//! remembered by the cache short-circuit further requests until they expire,
//! unless the middleware is told to ignore them.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pagespeed_cache::HttpCache;
//! use pagespeed_cache::SystemTimer;
//! use pagespeed_cache::storage::MemoryStore;
//! use pagespeed_cache_reqwest::CacheMiddleware;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use reqwest_middleware::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let cache = HttpCache::new(MemoryStore::new(64 * 1024 * 1024), Arc::new(SystemTimer));
//!     let client = ClientBuilder::new(Client::new())
//!         .with(CacheMiddleware::new(Arc::new(cache)))
//!         .build();
//!     client.get("https://example.com").send().await?;
//!     Ok(())
//! }
//! ```
//!
//! [reqwest]: https://github.com/seanmonstar/reqwest

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;

use anyhow::Context as _;
use anyhow::anyhow;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use pagespeed_cache::FindOptions;
use pagespeed_cache::FindResult;
use pagespeed_cache::HttpCache;
use pagespeed_cache::RequestProperties;
use pagespeed_cache::ResponseHeaders;
use pagespeed_cache::VaryOption;
use pagespeed_cache::http::Extensions;
use pagespeed_cache::http::HeaderMap;
use pagespeed_cache::http::HeaderValue;
use pagespeed_cache::http::Method;
use pagespeed_cache::http::StatusCode;
use pagespeed_cache::http::Version;
pub use pagespeed_cache::storage;
use pagespeed_cache::storage::KeyValueStore;
use reqwest::Request;
use reqwest::Response;
use reqwest::ResponseBuilderExt;
use reqwest::Url;
use reqwest_middleware::Next;
use tracing::debug;

/// The name of the header added to responses to describe how the cache
/// handled them.
///
/// The value is `HIT`, `MISS` or `STALE`.
pub const X_CACHE: &str = "x-cache";

/// How the cache handled a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheStatus {
    /// Served from the cache.
    Hit,
    /// Fetched from the network.
    Miss,
    /// Served from an expired cache entry because the fetch failed.
    Stale,
}

impl CacheStatus {
    /// Gets the `x-cache` header value.
    fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
        })
    }
}

/// Implements a caching middleware for [`reqwest`].
pub struct CacheMiddleware<S> {
    /// The cache.
    cache: Arc<HttpCache<S>>,
    /// The fragment requests are cached under.
    fragment: String,
    /// How `Vary` headers are treated.
    vary: VaryOption,
    /// Whether expired entries are served when a fetch fails.
    serve_stale_on_error: bool,
    /// Whether unsuccessful fetches are remembered.
    remember_failures: bool,
    /// Whether remembered fetch outcomes are refetched instead of failing.
    ignore_recent_fetch_failed: bool,
}

impl<S: KeyValueStore> CacheMiddleware<S> {
    /// Constructs a new caching middleware over the given cache.
    pub fn new(cache: Arc<HttpCache<S>>) -> Self {
        Self {
            cache,
            fragment: String::new(),
            vary: VaryOption::RespectVary,
            serve_stale_on_error: true,
            remember_failures: true,
            ignore_recent_fetch_failed: false,
        }
    }

    /// Caches requests under the given fragment.
    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.fragment = fragment.into();
        self
    }

    /// Sets how `Vary` headers are treated.
    pub fn with_vary(mut self, vary: VaryOption) -> Self {
        self.vary = vary;
        self
    }

    /// Sets whether an expired entry is served when a fetch fails.
    ///
    /// Defaults to `true`.
    pub fn with_serve_stale_on_error(mut self, serve: bool) -> Self {
        self.serve_stale_on_error = serve;
        self
    }

    /// Sets whether failed, empty and uncacheable fetches are remembered so
    /// that they are not retried until the memory expires.
    ///
    /// Defaults to `true`.
    pub fn with_remember_failures(mut self, remember: bool) -> Self {
        self.remember_failures = remember;
        self
    }

    /// Sets whether requests whose recent fetch failed, was empty or could
    /// not be cached go to the network anyway instead of failing.
    ///
    /// Defaults to `false`.
    pub fn with_ignore_recent_fetch_failed(mut self, ignore: bool) -> Self {
        self.ignore_recent_fetch_failed = ignore;
        self
    }

    /// Gets the underlying cache.
    pub fn cache(&self) -> &Arc<HttpCache<S>> {
        &self.cache
    }

    /// Remembers the outcome of a fetch that was not stored.
    async fn remember_outcome(&self, url: &str, status: StatusCode, body: &Bytes, stored: bool) {
        if !self.remember_failures || stored {
            return;
        }

        let fragment = &self.fragment;
        if status == StatusCode::OK && body.is_empty() {
            self.cache.remember_empty(url, fragment).await;
        } else if status.is_server_error() {
            self.cache.remember_fetch_failed(url, fragment).await;
        } else {
            self.cache
                .remember_not_cacheable(url, fragment, status == StatusCode::OK)
                .await;
        }
    }
}

/// Builds a `reqwest` response from its parts.
fn build_response(
    url: &str,
    version: Version,
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
    cache_status: CacheStatus,
) -> anyhow::Result<Response> {
    let url: Url = url
        .parse()
        .with_context(|| format!("invalid response URL `{url}`"))?;

    let mut builder = pagespeed_cache::http::Response::builder()
        .version(version)
        .status(status)
        .url(url);

    if let Some(map) = builder.headers_mut() {
        map.extend(headers.clone());
        map.insert(X_CACHE, cache_status.header_value());
    }

    let response = builder.body(body).context("failed to create response")?;
    Ok(response.into())
}

impl<S: KeyValueStore> reqwest_middleware::Middleware for CacheMiddleware<S> {
    fn handle<'a, 'b, 'c, 'd>(
        &'a self,
        req: Request,
        extensions: &'b mut Extensions,
        next: Next<'c>,
    ) -> BoxFuture<'d, reqwest_middleware::Result<Response>>
    where
        'a: 'd,
        'b: 'd,
        'c: 'd,
        Self: 'd,
    {
        async move {
            if req.method() != Method::GET {
                return next.run(req, extensions).await;
            }

            let url = req.url().to_string();
            let request = RequestProperties::from_headers(req.headers());
            let options = FindOptions::default()
                .with_request(request)
                .with_vary(self.vary);

            let found = self.cache.find(&url, &self.fragment, &options).await;
            match found.result {
                FindResult::Found => {
                    if let Some(value) = found.value {
                        debug!(url = %url, "serving response from the cache");
                        let (headers, body) = value.into_parts();
                        return Ok(build_response(
                            &url,
                            Version::HTTP_11,
                            headers.status(),
                            headers.headers(),
                            body,
                            CacheStatus::Hit,
                        )?);
                    }
                }
                FindResult::NotFound => {}
                result if self.ignore_recent_fetch_failed => {
                    debug!(url = %url, %result, "refetching despite a remembered outcome");
                }
                result => {
                    return Err(anyhow!("not fetching `{url}`: {result}").into());
                }
            }

            let response = match next.run(req, extensions).await {
                Ok(response) => response,
                Err(e) => {
                    if self.remember_failures {
                        self.cache
                            .remember_fetch_failed(&url, &self.fragment)
                            .await;
                    }

                    if let Some(fallback) = found.fallback.filter(|_| self.serve_stale_on_error) {
                        debug!(url = %url, error = %e, "fetch failed: serving a stale response");
                        let (headers, body) = fallback.into_parts();
                        return Ok(build_response(
                            &url,
                            Version::HTTP_11,
                            headers.status(),
                            headers.headers(),
                            body,
                            CacheStatus::Stale,
                        )?);
                    }

                    return Err(e);
                }
            };

            let version = response.version();
            let status = response.status();
            let headers = response.headers().clone();
            let response_url = response.url().to_string();
            let body = response.bytes().await?;

            let stored = status == StatusCode::OK
                && !body.is_empty()
                && self
                    .cache
                    .put(
                        &url,
                        &self.fragment,
                        &request,
                        self.vary,
                        ResponseHeaders::new(status, headers.clone()),
                        body.clone(),
                    )
                    .await;
            self.remember_outcome(&url, status, &body, stored).await;

            Ok(build_response(
                &response_url,
                version,
                status,
                &headers,
                body,
                CacheStatus::Miss,
            )?)
        }
        .boxed()
    }
}
