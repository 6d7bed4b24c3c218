//! Collects counters about the work performed by a cache coordinator.
//!
//! Each [Cacher](crate::cacher::Cacher) owns a [Metrics] instance which can be inspected at any
//! time. All counters are atomics, therefore recording never blocks a caller.
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::average::Average;

/// Counts hits, misses and fetches of a coordinator.
#[derive(Default)]
pub struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
    waits: AtomicU64,
    fetch_duration: Average,
}

impl Metrics {
    /// Creates a new set of counters, all being zero.
    pub fn new() -> Self {
        Metrics::default()
    }

    pub(crate) fn record_hit(&self) {
        let _ = self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        let _ = self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wait(&self) {
        let _ = self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch(&self, duration: Duration, successful: bool) {
        let _ = self.fetches.fetch_add(1, Ordering::Relaxed);
        if !successful {
            let _ = self.fetch_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.fetch_duration.add_duration(duration);
    }

    /// Returns the number of lookups which were answered by the store.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the number of lookups which didn't find a value.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the number of fetch functions which have been invoked.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Returns the number of fetch functions which failed.
    pub fn fetch_errors(&self) -> u64 {
        self.fetch_errors.load(Ordering::Relaxed)
    }

    /// Returns the number of callers which waited for the fetch of another caller.
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    /// Returns the average duration of recent fetches.
    pub fn fetch_duration(&self) -> &Average {
        &self.fetch_duration
    }
}

impl Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits: {}, misses: {}, waits: {}, fetches: {} ({} failed), fetch duration: {}",
            self.hits(),
            self.misses(),
            self.waits(),
            self.fetches(),
            self.fetch_errors(),
            self.fetch_duration
        )
    }
}
