//! Tracking the common base of URLs being combined.

use url::Position;
use url::Url;

/// A set of URLs that may be combined, along with their longest common
/// directory.
///
/// URLs are resolved against the document they appear in and must share its
/// scheme, host and port.
#[derive(Debug, Clone)]
pub struct UrlPartnership {
    /// The URL of the document the resources appear in.
    base: Url,
    /// Whether resources from different directories may be combined.
    combine_across_paths: bool,
    /// The resolved URLs, in order of addition.
    urls: Vec<Url>,
    /// The directory segments shared by every URL.
    common: Vec<String>,
    /// The common directory as a URL ending in `/`.
    resolved_base: String,
}

impl UrlPartnership {
    /// Creates an empty partnership for resources of the given document.
    pub fn new(base: Url, combine_across_paths: bool) -> Self {
        Self {
            base,
            combine_across_paths,
            urls: Vec::new(),
            common: Vec::new(),
            resolved_base: String::new(),
        }
    }

    /// Empties the partnership and moves it to another document.
    pub fn reset(&mut self, base: Url) {
        self.base = base;
        self.urls.clear();
        self.common.clear();
        self.resolved_base.clear();
    }

    /// Adds a URL, resolving it against the document.
    ///
    /// Fails without changing the partnership if the URL is blank, cannot be
    /// resolved, lives on another origin, or lives in another directory when
    /// combining across paths is disabled.
    pub fn add_url(&mut self, url: &str) -> Result<(), String> {
        let url = url.trim();
        if url.is_empty() {
            return Err("cannot combine an empty URL".to_string());
        }

        let resolved = self
            .base
            .join(url)
            .map_err(|e| format!("cannot resolve `{url}`: {e}"))?;

        if !matches!(resolved.scheme(), "http" | "https") {
            return Err(format!("cannot combine non-http URL `{resolved}`"));
        }

        if authority(&resolved) != authority(&self.base) {
            return Err(format!(
                "`{resolved}` is not on the same origin as `{base}`",
                base = self.base
            ));
        }

        let dirs = directories(&resolved);
        if !self.combine_across_paths
            && self
                .urls
                .first()
                .is_some_and(|first| directories(first) != dirs)
        {
            return Err(format!(
                "`{resolved}` is not in the same directory as the other resources"
            ));
        }

        self.urls.push(resolved);
        self.recompute();
        Ok(())
    }

    /// Removes the most recently added URL.
    pub fn remove_last(&mut self) {
        if self.urls.pop().is_some() {
            self.recompute();
        }
    }

    /// Gets the number of URLs.
    pub fn num_urls(&self) -> usize {
        self.urls.len()
    }

    /// Gets the number of directory segments shared by every URL.
    pub fn num_common_components(&self) -> usize {
        self.common.len()
    }

    /// Gets the common directory of every URL; empty if there are no URLs.
    pub fn resolved_base(&self) -> &str {
        &self.resolved_base
    }

    /// Gets the resolved form of a URL.
    pub fn full_path(&self, index: usize) -> Option<&Url> {
        self.urls.get(index)
    }

    /// Gets a URL relative to the resolved base.
    pub fn relative_path(&self, index: usize) -> Option<&str> {
        self.urls
            .get(index)
            .and_then(|url| url.as_str().strip_prefix(self.resolved_base.as_str()))
    }

    /// Recomputes the common directory.
    fn recompute(&mut self) {
        let Some((first, rest)) = self.urls.split_first() else {
            self.common.clear();
            self.resolved_base.clear();
            return;
        };

        let mut common = directories(first);
        for url in rest {
            let dirs = directories(url);
            let shared = common
                .iter()
                .zip(&dirs)
                .take_while(|(a, b)| a == b)
                .count();
            common.truncate(shared);
        }

        let mut resolved_base = format!("{}/", authority(first));
        for dir in &common {
            resolved_base.push_str(dir);
            resolved_base.push('/');
        }

        self.common = common;
        self.resolved_base = resolved_base;
    }
}

/// Gets the scheme and authority of a URL, up to its path.
fn authority(url: &Url) -> &str {
    &url[..Position::BeforePath]
}

/// Gets the directory segments of a URL's path.
fn directories(url: &Url) -> Vec<String> {
    let mut segments: Vec<String> = url
        .path_segments()
        .map(|s| s.map(str::to_string).collect())
        .unwrap_or_default();
    segments.pop();
    segments
}
