//! Provides a lock free sliding average used to track fetch durations.
//!
//! # Example
//!
//! ```
//! # use cacher::average::Average;
//! let durations = Average::new();
//! durations.add(1_000);
//! durations.add(3_000);
//!
//! assert_eq!(durations.avg(), 2_000);
//! assert_eq!(durations.count(), 2);
//! ```
use crate::fmt::format_micros;
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The number of samples after which older samples start to lose weight.
const WINDOW: i32 = 100;

/// Computes a sliding average over recorded values (usually microseconds).
///
/// The running sum and the number of samples in the window are packed into a single
/// **AtomicU64** (upper 32 bits: sum, lower 32 bits: count), so recording a value never blocks.
/// Once the window is full or the sum would overflow, both are halved before the next value is
/// added.
#[derive(Default)]
pub struct Average {
    window: AtomicU64,
    total: AtomicU64,
}

fn pack(sum: i32, count: i32) -> u64 {
    ((sum as u32 as u64) << 32) | count as u32 as u64
}

fn unpack(packed: u64) -> (i32, i32) {
    ((packed >> 32) as u32 as i32, packed as u32 as i32)
}

impl Average {
    /// Creates an empty average.
    pub fn new() -> Average {
        Average::default()
    }

    /// Records another value.
    pub fn add(&self, value: i32) {
        let _ = self.total.fetch_add(1, Ordering::Relaxed);

        let (mut sum, mut count) = unpack(self.window.load(Ordering::Relaxed));
        while count > WINDOW || sum as i64 + value as i64 > i32::MAX as i64 {
            sum = (sum as i64 * (count / 2) as i64 / count as i64) as i32;
            count /= 2;
        }

        self.window
            .store(pack(sum + value, count + 1), Ordering::Relaxed);
    }

    /// Records the given duration in microseconds (saturating at **i32::MAX**).
    pub fn add_duration(&self, duration: Duration) {
        self.add(i32::try_from(duration.as_micros()).unwrap_or(i32::MAX));
    }

    /// Returns the total number of recorded values.
    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Returns the sliding average of the most recent values.
    pub fn avg(&self) -> i32 {
        match unpack(self.window.load(Ordering::Relaxed)) {
            (_, 0) => 0,
            (sum, count) => sum / count,
        }
    }
}

impl Display for Average {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_micros(self.avg(), f)?;
        write!(f, " ({})", self.count())
    }
}
