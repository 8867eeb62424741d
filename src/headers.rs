//! Response headers annotated with their cache lifetime.

use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::Method;
use http::StatusCode;
use http::Uri;
use http::header;
use http_cache_semantics::CacheOptions;
use http_cache_semantics::CachePolicy;
use http_cache_semantics::RequestLike;
use http_cache_semantics::ResponseLike;
use serde::Deserialize;
use serde::Serialize;

use crate::timer::ms_from_system_time;
use crate::timer::system_time_from_ms;

/// The prefix of entity tags synthesized for stored responses.
pub const ETAG_PREFIX: &str = "W/\"PSA-";

/// Headers that only apply to a single transport-level connection.
const HOP_BY_HOP_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Formats an entity tag for the given content hash.
pub fn format_etag(hash: &str) -> String {
    format!("{ETAG_PREFIX}{hash}\"")
}

/// Controls whether `Vary` is honored for non-HTML resources.
///
/// HTML responses always respect `Vary`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaryOption {
    /// Any `Vary` header other than `Accept-Encoding` makes a response
    /// uncacheable.
    #[default]
    RespectVary,
    /// `Vary` is ignored, except that `Vary: Cookie` still prevents caching a
    /// response to a request that carried a cookie.
    IgnoreVary,
}

/// Properties of the request that produced a response.
///
/// These influence whether the response may be shared between users.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestProperties {
    /// Whether the request carried a `Cookie` header.
    pub has_cookie: bool,
    /// Whether the request carried a `Cookie2` header.
    pub has_cookie2: bool,
    /// Whether the request carried an `Authorization` header.
    pub has_authorization: bool,
}

impl RequestProperties {
    /// Derives the request properties from a set of request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            has_cookie: headers.contains_key(header::COOKIE),
            has_cookie2: headers.contains_key("cookie2"),
            has_authorization: headers.contains_key(header::AUTHORIZATION),
        }
    }
}

/// A synthesized request used to evaluate a cache policy.
struct PolicyRequest {
    /// The request method; always `GET`.
    method: Method,
    /// Headers reflecting the request properties.
    headers: HeaderMap,
}

impl PolicyRequest {
    /// Creates a policy request from request properties.
    fn new(properties: &RequestProperties) -> Self {
        let mut headers = HeaderMap::new();
        if properties.has_authorization {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static("present"));
        }
        if properties.has_cookie {
            headers.insert(header::COOKIE, HeaderValue::from_static("present"));
        }

        Self {
            method: Method::GET,
            headers,
        }
    }
}

impl RequestLike for PolicyRequest {
    fn uri(&self) -> Uri {
        Uri::from_static("/")
    }

    fn is_same_uri(&self, _: &Uri) -> bool {
        true
    }

    fn method(&self) -> &Method {
        &self.method
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// The status and headers of an HTTP response plus its computed cache
/// lifetime.
///
/// The lifetime is expressed as the response date and the time at which the
/// response stops being fresh, both in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeaders {
    /// The response status.
    status: StatusCode,
    /// The response headers.
    headers: HeaderMap,
    /// The time the response was generated.
    date_ms: i64,
    /// The time at which the response expires.
    expiration_ms: i64,
}

impl ResponseHeaders {
    /// Creates response headers whose caching has not been computed yet.
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            date_ms: 0,
            expiration_ms: 0,
        }
    }

    /// Creates response headers with a known lifetime.
    pub(crate) fn from_parts(
        status: StatusCode,
        headers: HeaderMap,
        date_ms: i64,
        expiration_ms: i64,
    ) -> Self {
        Self {
            status,
            headers,
            date_ms,
            expiration_ms,
        }
    }

    /// Gets the response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Gets the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Gets the response headers mutably.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Gets the first value of a header as a string, if it is valid UTF-8.
    pub fn lookup1(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Gets the response date in milliseconds since the Unix epoch.
    pub fn date_ms(&self) -> i64 {
        self.date_ms
    }

    /// Gets the time at which the response expires.
    pub fn cache_expiration_ms(&self) -> i64 {
        self.expiration_ms
    }

    /// Gets the freshness lifetime of the response.
    pub fn cache_ttl_ms(&self) -> i64 {
        self.expiration_ms - self.date_ms
    }

    /// Determines if the response has expired at the given time.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration_ms <= now_ms
    }

    /// Determines if the response content is HTML.
    pub fn is_html_like(&self) -> bool {
        self.media_type()
            .is_some_and(|t| t == "text/html" || t == "application/xhtml+xml")
    }

    /// Gets the lowercased media type of the `Content-Type` header.
    pub fn media_type(&self) -> Option<String> {
        self.lookup1(header::CONTENT_TYPE).map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    /// Determines if the content is stored without a content coding.
    pub fn is_identity_encoded(&self) -> bool {
        self.lookup1(header::CONTENT_ENCODING)
            .is_none_or(|v| v.trim().eq_ignore_ascii_case("identity"))
    }

    /// Sets the `Date` and a `Cache-Control: max-age` header and the lifetime
    /// to match.
    pub fn set_date_and_caching(&mut self, date_ms: i64, ttl_ms: i64) {
        self.set_date(date_ms);
        self.set_max_age(ttl_ms);
        self.expiration_ms = date_ms + ttl_ms;
    }

    /// Computes the cache lifetime of the response from its headers.
    ///
    /// A response without a valid `Date` header is dated at `now_ms`.
    pub fn compute_caching(&mut self, now_ms: i64) {
        let date_ms = match self
            .lookup1(header::DATE)
            .and_then(|d| httpdate::parse_http_date(d).ok())
        {
            Some(date) => ms_from_system_time(date),
            None => {
                self.set_date(now_ms);
                now_ms
            }
        };

        let ttl = self
            .policy(&RequestProperties::default(), now_ms)
            .time_to_live(system_time_from_ms(now_ms));

        self.date_ms = date_ms;
        self.expiration_ms = now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
    }

    /// Determines if the response may be stored by a shared cache.
    pub fn is_proxy_cacheable(&self, request: &RequestProperties, vary: VaryOption) -> bool {
        if !self.policy(request, self.date_ms).is_storable() {
            return false;
        }

        let respect_vary = vary == VaryOption::RespectVary || self.is_html_like();
        for value in self.headers.get_all(header::VARY) {
            let Ok(value) = value.to_str() else {
                return false;
            };

            for token in value.split(',').map(|t| t.trim().to_ascii_lowercase()) {
                match token.as_str() {
                    "" | "accept-encoding" => continue,
                    "*" => return false,
                    _ if respect_vary => return false,
                    "cookie" if request.has_cookie => return false,
                    "cookie2" if request.has_cookie2 => return false,
                    _ => continue,
                }
            }
        }

        true
    }

    /// Extends the freshness lifetime to `ttl_ms` if that is longer than the
    /// current lifetime.
    ///
    /// The `Cache-Control` header is rewritten to reflect the new lifetime.
    /// Returns whether the lifetime was extended.
    pub fn extend_lifetime(&mut self, ttl_ms: i64) -> bool {
        if ttl_ms <= 0 || ttl_ms <= self.cache_ttl_ms() {
            return false;
        }

        self.set_max_age(ttl_ms);
        self.expiration_ms = self.date_ms + ttl_ms;
        true
    }

    /// Removes headers that must never be replayed from a shared cache.
    ///
    /// Returns whether any header was removed.
    pub fn sanitize(&mut self) -> bool {
        let mut removed = false;

        // Headers named by `Connection` are connection-specific as well
        let named: Vec<HeaderName> = self
            .headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
            .collect();

        for name in named
            .iter()
            .chain(HOP_BY_HOP_HEADERS)
            .chain([&header::SET_COOKIE])
        {
            removed |= self.headers.remove(name).is_some();
        }

        for name in ["set-cookie2", "keep-alive"] {
            removed |= self.headers.remove(name).is_some();
        }

        removed
    }

    /// Adds an entity tag derived from the content hash if none is present.
    ///
    /// Returns whether a tag was added.
    pub fn ensure_etag(&mut self, content_hash: &str) -> bool {
        if self.headers.contains_key(header::ETAG) {
            return false;
        }

        match HeaderValue::from_str(&format_etag(content_hash)) {
            Ok(value) => {
                self.headers.insert(header::ETAG, value);
                true
            }
            Err(_) => false,
        }
    }

    /// Sets the `Date` header.
    fn set_date(&mut self, date_ms: i64) {
        let formatted = httpdate::fmt_http_date(system_time_from_ms(date_ms));
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            self.headers.insert(header::DATE, value);
        }
        self.date_ms = date_ms;
    }

    /// Replaces any freshness headers with a single `max-age`.
    fn set_max_age(&mut self, ttl_ms: i64) {
        self.headers.remove(header::EXPIRES);
        if let Ok(value) = HeaderValue::from_str(&format!("max-age={}", ttl_ms / 1000)) {
            self.headers.insert(header::CACHE_CONTROL, value);
        }
    }

    /// Builds the shared-cache policy for this response.
    fn policy(&self, request: &RequestProperties, response_time_ms: i64) -> CachePolicy {
        CachePolicy::new_options(
            &PolicyRequest::new(request),
            self,
            system_time_from_ms(response_time_ms),
            CacheOptions {
                shared: true,
                ..Default::default()
            },
        )
    }
}

impl ResponseLike for ResponseHeaders {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}
