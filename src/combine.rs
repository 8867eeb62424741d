//! Combining several resources into one.
//!
//! A [`ResourceCombiner`] accumulates resources one at a time, keeping the
//! URL of the eventual combination within configured budgets, and then writes
//! the combination through an [`HttpCache`].
//!
//! The combination is named by multipart-encoding the escaped paths of its
//! inputs relative to their longest common directory, so the name alone is
//! enough to find the inputs again.

use anyhow::Result;
use bytes::Bytes;
use bytes::BytesMut;
use http::HeaderMap;
use http::HeaderValue;
use http::StatusCode;
use http::header;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;
use url::Url;

mod encoding;
mod namer;
mod partnership;

pub use encoding::*;
pub use namer::*;
pub use partnership::*;

use crate::cache::FindOptions;
use crate::cache::FindResult;
use crate::cache::HttpCache;
use crate::headers::RequestProperties;
use crate::headers::ResponseHeaders;
use crate::headers::VaryOption;
use crate::storage::KeyValueStore;
use crate::timer::YEAR_MS;
use crate::value::HttpValue;
use crate::value::hash_contents;

/// URL length reserved for filters that lengthen URLs after combining.
pub const URL_SLACK: usize = 61;

/// The hash used in the name under which a combination is remembered.
const MEMO_HASH: &str = "0";

/// Headers that are set on a combination rather than merged from its inputs.
const COMPUTED_HEADERS: &[header::HeaderName] = &[
    header::AGE,
    header::CACHE_CONTROL,
    header::CONTENT_LENGTH,
    header::CONTENT_TYPE,
    header::DATE,
    header::ETAG,
    header::EXPIRES,
    header::LAST_MODIFIED,
    header::PRAGMA,
    header::SET_COOKIE,
    header::VARY,
];

/// The budgets of a [`ResourceCombiner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinerOptions {
    /// The longest allowed leaf name of a combination.
    pub max_url_segment_size: usize,
    /// The longest allowed URL of a combination.
    pub max_url_size: usize,
    /// The largest allowed combined content, or `-1` for no limit.
    pub max_combined_size: i64,
    /// Whether resources from different directories may be combined.
    pub combine_across_paths: bool,
}

impl Default for CombinerOptions {
    fn default() -> Self {
        Self {
            max_url_segment_size: 1024,
            max_url_size: 2083,
            max_combined_size: -1,
            combine_across_paths: true,
        }
    }
}

/// A fetched resource offered for combining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// The URL of the resource, possibly relative to the document.
    pub url: String,
    /// The response headers.
    pub headers: ResponseHeaders,
    /// The response body.
    pub contents: Bytes,
}

impl Resource {
    /// Creates a resource.
    pub fn new(url: impl Into<String>, headers: ResponseHeaders, contents: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            headers,
            contents: contents.into(),
        }
    }

    /// Creates a resource from a cached value.
    pub fn from_value(url: impl Into<String>, value: HttpValue) -> Self {
        let (headers, contents) = value.into_parts();
        Self::new(url, headers, contents)
    }
}

/// The customization points of a [`ResourceCombiner`].
pub trait CombineFilter: Send + Sync {
    /// Gets the short identifier placed in combination names.
    fn id(&self) -> &str;

    /// Gets the file extension of combinations.
    fn extension(&self) -> &str;

    /// Gets the `Content-Type` of combinations.
    fn content_type(&self) -> &str;

    /// Determines if a resource may be combined.
    ///
    /// Returns the reason if it may not.
    fn resource_combinable(&self, resource: &Resource) -> Result<(), String> {
        let _ = resource;
        Ok(())
    }

    /// Appends one input to the combination.
    fn write_piece(
        &self,
        index: usize,
        num_pieces: usize,
        resource: &Resource,
        out: &mut BytesMut,
    ) -> Result<()> {
        let _ = (index, num_pieces);
        out.extend_from_slice(&resource.contents);
        Ok(())
    }
}

/// The result of offering a resource to a [`ResourceCombiner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddResult {
    /// The earliest expiration among the accepted resources, if any.
    pub expiration_ms: Option<i64>,
    /// Whether the resource was accepted.
    pub accepted: bool,
    /// Why the resource was rejected.
    pub failure_reason: Option<String>,
}

/// A combined resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputResource {
    /// The content-addressed URL of the combination.
    pub url: String,
    /// The combination.
    pub value: HttpValue,
}

/// Accumulates resources into a combination that fits the URL budgets.
///
/// A combiner serves one document at a time and is not meant to be shared
/// between concurrent callers.
#[derive(Debug)]
pub struct ResourceCombiner<F> {
    /// The customization points.
    filter: F,
    /// The budgets.
    options: CombinerOptions,
    /// The URLs of the accepted resources.
    partnership: UrlPartnership,
    /// The accepted resources.
    resources: Vec<Resource>,
    /// The escaped relative path of each accepted resource.
    multipart_urls: Vec<String>,
    /// The common directory count when the base was last resolved.
    prev_num_components: Option<usize>,
    /// The length of the combination's leaf name, or zero if unknown.
    accumulated_leaf_size: usize,
    /// The directory the combination is named in.
    resolved_base: String,
    /// The total length of the accepted contents.
    combined_size: usize,
}

impl<F: CombineFilter> ResourceCombiner<F> {
    /// Creates a combiner for resources of the given document.
    pub fn new(filter: F, document: Url, options: CombinerOptions) -> Self {
        let partnership = UrlPartnership::new(document, options.combine_across_paths);
        Self {
            filter,
            options,
            partnership,
            resources: Vec::new(),
            multipart_urls: Vec::new(),
            prev_num_components: None,
            accumulated_leaf_size: 0,
            resolved_base: String::new(),
            combined_size: 0,
        }
    }

    /// Gets the filter.
    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Gets the budgets.
    pub fn options(&self) -> &CombinerOptions {
        &self.options
    }

    /// Empties the combiner and moves it to another document.
    pub fn reset(&mut self, document: Url) {
        self.partnership.reset(document);
        self.clear();
    }

    /// Gets the accepted resources.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Gets the number of accepted resources.
    pub fn num_resources(&self) -> usize {
        self.resources.len()
    }

    /// Gets the directory the combination will be named in.
    pub fn resolved_base(&self) -> &str {
        &self.resolved_base
    }

    /// Gets the multipart-encoded name of the combination.
    pub fn url_safe_id(&self) -> String {
        encode_multipart(&self.multipart_urls)
    }

    /// Gets the length the combination's leaf name will have.
    pub fn accumulated_leaf_size(&self) -> usize {
        self.accumulated_leaf_size
    }

    /// Offers a resource for the combination.
    ///
    /// A rejected resource leaves the combiner exactly as it was.
    pub fn add_resource_no_fetch(&mut self, resource: Resource) -> AddResult {
        if self.resources.is_empty() {
            self.clear();
        }

        let url = resource.url.clone();
        let failure_reason = match self.try_add(resource) {
            Ok(()) => None,
            Err(reason) => {
                debug!(url = %url, reason = %reason, "not combining resource");
                Some(reason)
            }
        };

        AddResult {
            expiration_ms: self
                .resources
                .iter()
                .map(|r| r.headers.cache_expiration_ms())
                .min(),
            accepted: failure_reason.is_none(),
            failure_reason,
        }
    }

    /// Removes the most recently accepted resource.
    pub fn remove_last_resource(&mut self) {
        let Some(resource) = self.resources.pop() else {
            return;
        };

        if self.resources.is_empty() {
            self.partnership.remove_last();
            self.clear();
            return;
        }

        self.partnership.remove_last();
        self.multipart_urls.pop();
        self.combined_size -= resource.contents.len();

        if Some(self.partnership.num_common_components()) != self.prev_num_components {
            self.update_resolved_base();
        }
        self.compute_leaf_size();
    }

    /// Writes the combination, or finds a previous identical one.
    ///
    /// Requires at least two resources. Returns `None` if there are too few
    /// or the combination cannot be written.
    pub async fn combine<S: KeyValueStore>(&self, cache: &HttpCache<S>) -> Option<OutputResource> {
        if self.resources.len() < 2 {
            debug!(
                count = self.resources.len(),
                "not enough resources to combine"
            );
            return None;
        }

        let name = self.url_safe_id();
        let memo_key = format!(
            "{base}{leaf}",
            base = self.resolved_base,
            leaf = self.namer(&name, MEMO_HASH).encode()
        );

        if let Some(output) = self.find_previous(cache, &memo_key).await {
            debug!(url = %output.url, "reusing a previous combination");
            return Some(output);
        }

        self.write_combination(cache, &name, &memo_key).await
    }

    /// Attempts to accept a resource.
    fn try_add(&mut self, resource: Resource) -> Result<(), String> {
        if resource.headers.status() != StatusCode::OK {
            return Err(format!(
                "resource was fetched with status {status}",
                status = resource.headers.status()
            ));
        }

        if !resource.headers.is_identity_encoded() {
            return Err("resource is content-encoded".to_string());
        }

        self.filter.resource_combinable(&resource)?;
        self.partnership.add_url(&resource.url)?;

        let num_components = self.partnership.num_common_components();
        self.combined_size += resource.contents.len();
        self.resources.push(resource);

        let piece_len = if Some(num_components) != self.prev_num_components {
            self.update_resolved_base();
            None
        } else {
            let index = self.resources.len() - 1;
            let piece = UrlEscaper::encode(self.partnership.relative_path(index).unwrap_or_default());
            let len = multipart_piece_len(&piece);
            self.multipart_urls.push(piece);
            Some(len)
        };

        match piece_len {
            Some(len) if self.accumulated_leaf_size > 0 => self.accumulated_leaf_size += len + 1,
            _ => self.compute_leaf_size(),
        }

        if let Err(reason) = self.check_budgets() {
            self.remove_last_resource();
            return Err(reason);
        }

        Ok(())
    }

    /// Checks the accepted resources against the budgets.
    fn check_budgets(&self) -> Result<(), String> {
        let expanded = self.accumulated_leaf_size + URL_SLACK;
        if expanded > self.options.max_url_segment_size {
            return Err(format!(
                "combined leaf name of {expanded} bytes exceeds the segment limit of {max}",
                max = self.options.max_url_segment_size
            ));
        }

        let url_size = expanded + self.resolved_base.len();
        if url_size > self.options.max_url_size {
            return Err(format!(
                "combined URL of {url_size} bytes exceeds the URL limit of {max}",
                max = self.options.max_url_size
            ));
        }

        if usize::try_from(self.options.max_combined_size)
            .is_ok_and(|max| self.combined_size > max)
        {
            return Err(format!(
                "combined content of {size} bytes exceeds the limit of {max}",
                size = self.combined_size,
                max = self.options.max_combined_size
            ));
        }

        Ok(())
    }

    /// Re-derives the base and every relative path after the common
    /// directory changed.
    fn update_resolved_base(&mut self) {
        let partnership = &self.partnership;
        self.prev_num_components = Some(partnership.num_common_components());
        self.resolved_base = partnership.resolved_base().to_string();
        self.multipart_urls = (0..partnership.num_urls())
            .map(|i| UrlEscaper::encode(partnership.relative_path(i).unwrap_or_default()))
            .collect();
        self.accumulated_leaf_size = 0;
    }

    /// Computes the leaf name length from scratch.
    fn compute_leaf_size(&mut self) {
        self.accumulated_leaf_size = ResourceNamer::eventual_size(
            self.filter.id(),
            self.filter.extension(),
            self.url_safe_id().len(),
        );
    }

    /// Returns the combiner to its empty state, keeping the document.
    fn clear(&mut self) {
        while self.partnership.num_urls() > 0 {
            self.partnership.remove_last();
        }
        self.resources.clear();
        self.multipart_urls.clear();
        self.prev_num_components = None;
        self.accumulated_leaf_size = 0;
        self.resolved_base.clear();
        self.combined_size = 0;
    }

    /// Creates a namer for the combination.
    fn namer(&self, name: &str, hash: &str) -> ResourceNamer {
        ResourceNamer::new(self.filter.id(), name, hash, self.filter.extension())
    }

    /// Looks for a combination remembered under the given key.
    async fn find_previous<S: KeyValueStore>(
        &self,
        cache: &HttpCache<S>,
        memo_key: &str,
    ) -> Option<OutputResource> {
        let options = FindOptions::default().with_update_stats_on_failure(false);
        let memo = cache.find(memo_key, "", &options).await;
        if memo.result != FindResult::Found {
            return None;
        }

        let url = String::from_utf8(memo.value?.contents().to_vec()).ok()?;
        let output = cache.find(&url, "", &options).await;
        match output.result {
            FindResult::Found => Some(OutputResource {
                url,
                value: output.value?,
            }),
            _ => None,
        }
    }

    /// Concatenates the inputs and stores the result.
    async fn write_combination<S: KeyValueStore>(
        &self,
        cache: &HttpCache<S>,
        name: &str,
        memo_key: &str,
    ) -> Option<OutputResource> {
        let num_pieces = self.resources.len();
        let mut contents = BytesMut::new();
        for (index, resource) in self.resources.iter().enumerate() {
            if let Err(e) = self
                .filter
                .write_piece(index, num_pieces, resource, &mut contents)
            {
                warn!(
                    url = %resource.url,
                    error = format!("{e:?}"),
                    "failed to write a piece of a combination"
                );
                return None;
            }
        }
        let contents = contents.freeze();

        let mut headers = self.intersect_headers();
        let content_type = match HeaderValue::from_str(self.filter.content_type()) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    content_type = self.filter.content_type(),
                    error = format!("{e:?}"),
                    "invalid combination content type"
                );
                return None;
            }
        };
        headers.insert(header::CONTENT_TYPE, content_type);

        let now_ms = cache.timer().now_ms();
        let mut headers = ResponseHeaders::new(StatusCode::OK, headers);
        headers.set_date_and_caching(now_ms, YEAR_MS);

        let url = format!(
            "{base}{leaf}",
            base = self.resolved_base,
            leaf = self.namer(name, &hash_contents(&contents)).encode()
        );

        let request = RequestProperties::default();
        if !cache
            .put(
                &url,
                "",
                &request,
                VaryOption::RespectVary,
                headers.clone(),
                contents.clone(),
            )
            .await
        {
            warn!(url = %url, "failed to store a combination");
            return None;
        }

        self.remember_combination(cache, memo_key, &url, now_ms)
            .await;

        Some(OutputResource {
            url,
            value: HttpValue::new(headers, contents),
        })
    }

    /// Remembers where a combination was stored for as long as every input
    /// stays fresh.
    async fn remember_combination<S: KeyValueStore>(
        &self,
        cache: &HttpCache<S>,
        memo_key: &str,
        url: &str,
        now_ms: i64,
    ) {
        let Some(expiration_ms) = self
            .resources
            .iter()
            .map(|r| r.headers.cache_expiration_ms())
            .min()
        else {
            return;
        };

        let ttl_ms = expiration_ms - now_ms;
        if ttl_ms <= 0 {
            return;
        }

        let mut map = HeaderMap::new();
        map.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        let mut headers = ResponseHeaders::new(StatusCode::OK, map);
        headers.set_date_and_caching(now_ms, ttl_ms);

        let request = RequestProperties::default();
        if !cache
            .put(
                memo_key,
                "",
                &request,
                VaryOption::RespectVary,
                headers,
                Bytes::copy_from_slice(url.as_bytes()),
            )
            .await
        {
            debug!(memo_key, "could not remember a combination");
        }
    }

    /// Gets the headers every input agrees on, excluding those that are
    /// computed for the combination.
    fn intersect_headers(&self) -> HeaderMap {
        let Some((first, rest)) = self.resources.split_first() else {
            return HeaderMap::new();
        };

        let mut merged = first.headers.headers().clone();
        for name in COMPUTED_HEADERS {
            merged.remove(name);
        }

        for resource in rest {
            let other = resource.headers.headers();
            let mismatched: Vec<_> = merged
                .keys()
                .filter(|name| !merged.get_all(*name).iter().eq(other.get_all(*name).iter()))
                .cloned()
                .collect();

            for name in mismatched {
                merged.remove(&name);
            }
        }

        merged
    }
}
