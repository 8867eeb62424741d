//! Statistics counters.
//!
//! Components group their counters into a plain struct of [`Variable`]s that
//! can be shared behind an `Arc`; an external collector reads them by name
//! through each group's `snapshot` method.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

/// A named, lock-free statistics counter.
#[derive(Debug)]
pub struct Variable {
    /// The name the counter is exported under.
    name: &'static str,
    /// The current value.
    value: AtomicI64,
}

impl Variable {
    /// Creates a new counter with a value of zero.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicI64::new(0),
        }
    }

    /// Gets the name of the counter.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Gets the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Adds to the counter, returning the new value.
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Sets the counter to the given value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Gets the `(name, value)` pair for this counter.
    pub fn sample(&self) -> (&'static str, i64) {
        (self.name, self.get())
    }
}
