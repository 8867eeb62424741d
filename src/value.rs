//! Cached values and their serialized form.

use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use http::HeaderMap;
use http::StatusCode;
use serde::Deserialize;
use serde::Serialize;

use crate::headers::ResponseHeaders;

/// The number of hex characters kept from a content hash.
pub const HASH_LEN: usize = 10;

/// Hashes content into a short, URL-safe string.
pub fn hash_contents(contents: &[u8]) -> String {
    let hash = blake3::hash(contents);
    let mut hex = hash.to_hex().to_string();
    hex.truncate(HASH_LEN);
    hex
}

/// A complete HTTP response: headers plus body.
///
/// Values are immutable once built; the body is reference counted so
/// handing a value to a caller does not copy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpValue {
    /// The response headers.
    headers: ResponseHeaders,
    /// The response body.
    contents: Bytes,
}

impl HttpValue {
    /// Creates a new value.
    pub fn new(headers: ResponseHeaders, contents: impl Into<Bytes>) -> Self {
        Self {
            headers,
            contents: contents.into(),
        }
    }

    /// Gets the response headers.
    pub fn headers(&self) -> &ResponseHeaders {
        &self.headers
    }

    /// Gets the response body.
    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    /// Splits the value into headers and body.
    pub fn into_parts(self) -> (ResponseHeaders, Bytes) {
        (self.headers, self.contents)
    }
}

/// The kinds of negative marker that can be remembered for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MarkerKind {
    /// A recent fetch failed.
    FetchFailed,
    /// A recent fetch was dropped before being attempted.
    FetchDropped,
    /// A recent fetch returned a non-200 response that was not cacheable.
    NotCacheable,
    /// A recent fetch returned a 200 response that was not cacheable.
    NotCacheable200,
    /// A recent fetch returned an empty body.
    Empty,
}

/// A negative marker stored in place of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Marker {
    /// What was remembered.
    pub kind: MarkerKind,
    /// When it was remembered.
    pub date_ms: i64,
    /// When the marker stops applying.
    pub expiration_ms: i64,
}

/// Anything stored under a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CacheEntry {
    /// A full response.
    Value(HttpValue),
    /// A remembered negative outcome.
    Marker(Marker),
}

/// Represents a reference to a stored entry.
///
/// This type is what gets serialized.
#[derive(Serialize)]
enum StoredEntryRef<'a> {
    /// A full response.
    Value {
        /// The response status.
        #[serde(with = "http_serde::status_code")]
        status: StatusCode,
        /// The response headers.
        #[serde(with = "http_serde::header_map")]
        headers: &'a HeaderMap,
        /// The response date.
        date_ms: i64,
        /// The response expiration.
        expiration_ms: i64,
        /// The response body.
        contents: &'a [u8],
    },
    /// A remembered negative outcome.
    Marker {
        /// The marker kind.
        kind: MarkerKind,
        /// The time the marker was recorded.
        date_ms: i64,
        /// The marker expiration.
        expiration_ms: i64,
    },
}

/// Represents a stored entry.
///
/// This type is what gets deserialized; its variants mirror
/// [`StoredEntryRef`].
#[derive(Deserialize)]
enum StoredEntry {
    /// A full response.
    Value {
        /// The response status.
        #[serde(with = "http_serde::status_code")]
        status: StatusCode,
        /// The response headers.
        #[serde(with = "http_serde::header_map")]
        headers: HeaderMap,
        /// The response date.
        date_ms: i64,
        /// The response expiration.
        expiration_ms: i64,
        /// The response body.
        contents: Vec<u8>,
    },
    /// A remembered negative outcome.
    Marker {
        /// The marker kind.
        kind: MarkerKind,
        /// The time the marker was recorded.
        date_ms: i64,
        /// The marker expiration.
        expiration_ms: i64,
    },
}

impl CacheEntry {
    /// Encodes the entry for storage.
    pub(crate) fn encode(&self) -> Result<Bytes> {
        let stored = match self {
            Self::Value(value) => StoredEntryRef::Value {
                status: value.headers.status(),
                headers: value.headers.headers(),
                date_ms: value.headers.date_ms(),
                expiration_ms: value.headers.cache_expiration_ms(),
                contents: &value.contents,
            },
            Self::Marker(marker) => StoredEntryRef::Marker {
                kind: marker.kind,
                date_ms: marker.date_ms,
                expiration_ms: marker.expiration_ms,
            },
        };

        bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map(Bytes::from)
            .context("failed to encode cache entry")
    }

    /// Decodes an entry previously produced by [`CacheEntry::encode`].
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let (stored, read) = bincode::serde::decode_from_slice::<StoredEntry, _>(
            bytes,
            bincode::config::standard(),
        )
        .context("failed to decode cache entry")?;

        anyhow::ensure!(
            read == bytes.len(),
            "cache entry has {extra} trailing bytes",
            extra = bytes.len() - read
        );

        Ok(match stored {
            StoredEntry::Value {
                status,
                headers,
                date_ms,
                expiration_ms,
                contents,
            } => Self::Value(HttpValue::new(
                ResponseHeaders::from_parts(status, headers, date_ms, expiration_ms),
                contents,
            )),
            StoredEntry::Marker {
                kind,
                date_ms,
                expiration_ms,
            } => Self::Marker(Marker {
                kind,
                date_ms,
                expiration_ms,
            }),
        })
    }
}
