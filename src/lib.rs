//! An HTTP response cache with purging and resource combining.
//!
//! The crate is made of three cooperating parts:
//!
//! * [`HttpCache`] stores HTTP responses in a [`KeyValueStore`], interprets
//!   their caching headers and remembers recent fetch failures so that callers
//!   can back off from a failing origin.
//! * [`PurgeContext`] shares per-URL and global purges between processes
//!   through a lock-protected file. Its [`PurgeSet`] snapshots plug into
//!   lookups through [`FindOptions::with_purge_set`].
//! * [`ResourceCombiner`] merges several resources into one whose URL stays
//!   within configured length budgets, storing the result in an
//!   [`HttpCache`].
//!
//! All time is read through a [`Timer`], so tests can drive the cache with a
//! [`MockTimer`].
//!
//! By default, this crate uses `tokio` as its async runtime.
//!
//! Enable the `smol` feature for using the `smol` runtime instead.
//!
//! [`KeyValueStore`]: storage::KeyValueStore

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

mod cache;
mod combine;
mod fs;
mod headers;
pub mod lock;
mod purge;
pub(crate) mod runtime;
mod stats;
pub mod storage;
mod timer;
mod value;

pub use cache::*;
pub use combine::*;
pub use fs::*;
pub use headers::*;
pub use purge::*;
pub use stats::*;
pub use timer::*;
pub use value::HASH_LEN;
pub use value::HttpValue;
pub use value::hash_contents;
// Re-export the http crate.
pub use http;
// Re-export the semantics crate
pub use http_cache_semantics as semantics;
