//! A bounded record of purged URLs.

use std::fmt;

use lru::LruCache;

use crate::timer::MINUTE_MS;

/// The timestamp meaning "nothing has been purged".
pub const INITIAL_TIMESTAMP_MS: i64 = -1;

/// How far into the future a purge timestamp may be before it is rejected.
pub const CLOCK_SKEW_ALLOWANCE_MS: i64 = 10 * MINUTE_MS;

/// The bytes charged per entry on top of the URL itself.
const ENTRY_OVERHEAD_BYTES: usize = std::mem::size_of::<i64>();

/// Determines if a purge timestamp is acceptable at the given time.
pub fn is_valid_timestamp_ms(timestamp_ms: i64, now_ms: i64) -> bool {
    timestamp_ms == INITIAL_TIMESTAMP_MS
        || (timestamp_ms >= 0 && timestamp_ms <= now_ms + CLOCK_SKEW_ALLOWANCE_MS)
}

/// A global invalidation timestamp plus per-URL invalidation timestamps.
///
/// A URL cached at time `t` is valid iff `t` is after the global timestamp
/// and after the URL's own timestamp, if it has one.
///
/// The per-URL entries are bounded by memory. When an entry is evicted the
/// global timestamp is raised to cover it, so eviction can only make the set
/// invalidate more, never less.
pub struct PurgeSet {
    /// Everything cached at or before this time is invalid.
    global_invalidation_timestamp_ms: i64,
    /// Per-URL invalidation timestamps, least recently purged first.
    entries: LruCache<String, i64>,
    /// The bytes currently charged for the entries.
    bytes: usize,
    /// The most bytes the entries may be charged.
    max_bytes: usize,
}

impl PurgeSet {
    /// Creates an empty set holding at most `max_bytes` of entries.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            global_invalidation_timestamp_ms: INITIAL_TIMESTAMP_MS,
            entries: LruCache::unbounded(),
            bytes: 0,
            max_bytes,
        }
    }

    /// Gets the global invalidation timestamp.
    pub fn global_invalidation_timestamp_ms(&self) -> i64 {
        self.global_invalidation_timestamp_ms
    }

    /// Gets the number of per-URL entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Determines if the set has no per-URL entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Determines if a URL cached at `timestamp_ms` is still valid.
    pub fn is_valid(&self, url: &str, timestamp_ms: i64) -> bool {
        timestamp_ms > self.global_invalidation_timestamp_ms
            && self.entries.peek(url).is_none_or(|&purged| timestamp_ms > purged)
    }

    /// Raises the global invalidation timestamp; it never goes backwards.
    pub fn update_global_invalidation_timestamp_ms(&mut self, timestamp_ms: i64) {
        if timestamp_ms > self.global_invalidation_timestamp_ms {
            self.global_invalidation_timestamp_ms = timestamp_ms;
        }
    }

    /// Records a purge of a URL.
    ///
    /// Purges no later than the global timestamp are already covered and are
    /// not recorded. An existing entry is only ever moved later.
    pub fn put(&mut self, url: &str, timestamp_ms: i64) {
        if timestamp_ms <= self.global_invalidation_timestamp_ms {
            return;
        }

        match self.entries.get_mut(url) {
            Some(existing) => {
                if timestamp_ms > *existing {
                    *existing = timestamp_ms;
                }
            }
            None => {
                self.entries.put(url.to_string(), timestamp_ms);
                self.bytes += url.len() + ENTRY_OVERHEAD_BYTES;
                self.evict();
            }
        }
    }

    /// Merges another set into this one.
    pub fn merge(&mut self, other: &PurgeSet) {
        self.update_global_invalidation_timestamp_ms(other.global_invalidation_timestamp_ms);
        for (url, &timestamp_ms) in other.entries.iter().rev() {
            self.put(url, timestamp_ms);
        }
    }

    /// Removes every entry and resets the global timestamp.
    pub fn clear(&mut self) {
        self.global_invalidation_timestamp_ms = INITIAL_TIMESTAMP_MS;
        self.entries.clear();
        self.bytes = 0;
    }

    /// Iterates the per-URL entries, least recently purged first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().rev().map(|(url, &ts)| (url.as_str(), ts))
    }

    /// Evicts the least recently purged entries until the set fits.
    fn evict(&mut self) {
        while self.bytes > self.max_bytes {
            let Some((url, timestamp_ms)) = self.entries.pop_lru() else {
                break;
            };

            self.bytes -= url.len() + ENTRY_OVERHEAD_BYTES;
            self.update_global_invalidation_timestamp_ms(timestamp_ms);
        }
    }
}

impl Clone for PurgeSet {
    fn clone(&self) -> Self {
        let mut entries = LruCache::unbounded();
        for (url, &timestamp_ms) in self.entries.iter().rev() {
            entries.put(url.clone(), timestamp_ms);
        }

        Self {
            global_invalidation_timestamp_ms: self.global_invalidation_timestamp_ms,
            entries,
            bytes: self.bytes,
            max_bytes: self.max_bytes,
        }
    }
}

impl PartialEq for PurgeSet {
    fn eq(&self, other: &Self) -> bool {
        self.global_invalidation_timestamp_ms == other.global_invalidation_timestamp_ms
            && self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(url, ts)| other.entries.peek(url) == Some(ts))
    }
}

impl Eq for PurgeSet {}

impl fmt::Debug for PurgeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurgeSet")
            .field(
                "global_invalidation_timestamp_ms",
                &self.global_invalidation_timestamp_ms,
            )
            .field("entries", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}
