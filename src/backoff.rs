//! Provides the polling engine used by callers which lost the race for a lock.
//!
//! A waiting caller polls the store for the value with exponentially increasing pauses
//! ([Backoff]). Between polls, it checks whether the lock still exists: once the lock is gone
//! without a value being published, the winning fetch most probably failed and the caller gives
//! up with [CacheError::NotPopulated] instead of waiting for the full deadline.
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::codec::decode;
use crate::context::Context;
use crate::error::{CacheError, CacheResult};
use crate::fmt::format_duration;
use crate::store::Store;

/// Generates exponentially growing wait intervals.
///
/// # Example
/// ```
/// # use cacher::backoff::Backoff;
/// # use std::time::Duration;
/// let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
///
/// assert_eq!(backoff.next(), Duration::from_millis(10));
/// assert_eq!(backoff.next(), Duration::from_millis(20));
/// assert_eq!(backoff.next(), Duration::from_millis(40));
/// assert_eq!(backoff.next(), Duration::from_millis(50));
/// assert_eq!(backoff.next(), Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    /// Creates a backoff which starts at **initial** and doubles up to **max**.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            current: initial.min(max),
            max,
        }
    }

    /// Returns the next interval to wait.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);

        result
    }
}

/// Describes how long and how often to poll.
#[derive(Debug, Clone)]
pub struct WaitSettings {
    /// The overall time to wait for a value.
    pub timeout: Duration,
    /// The first pause between two polls.
    pub initial_backoff: Duration,
    /// The upper bound for a pause between two polls.
    pub max_backoff: Duration,
}

/// Waits until the value for **key** is published by the holder of **lock_key**.
///
/// Returns:
/// * the decoded value, once it appears in the store,
/// * [CacheError::NotPopulated] if the lock vanished without a value being published,
/// * [CacheError::WaitTimeout] if neither happened within the configured timeout,
/// * [CacheError::Cancelled] / [CacheError::DeadlineExceeded] if the context finishes first.
pub async fn wait_for_value<S: Store, T: DeserializeOwned>(
    ctx: &Context,
    store: &S,
    key: &str,
    lock_key: &str,
    settings: &WaitSettings,
) -> CacheResult<T> {
    let deadline = Instant::now() + settings.timeout;
    let mut backoff = Backoff::new(settings.initial_backoff, settings.max_backoff);

    loop {
        if let Some(data) = read(ctx, store, key).await? {
            return decode(&data);
        }

        let locked = ctx
            .run(store.exists(lock_key))
            .await?
            .map_err(|error| CacheError::store("exists", error))?;
        if !locked {
            // The winner might have published its value right between both reads...
            return match read(ctx, store, key).await? {
                Some(data) => decode(&data),
                None => {
                    log::warn!(
                        "The lock for {} vanished but no value was published...",
                        key
                    );
                    Err(CacheError::NotPopulated)
                }
            };
        }

        let now = Instant::now();
        if now >= deadline {
            log::warn!(
                "Gave up waiting for {} after {}...",
                key,
                format_duration(settings.timeout)
            );
            return Err(CacheError::WaitTimeout(settings.timeout));
        }

        ctx.sleep(backoff.next().min(deadline - now)).await?;
    }
}

async fn read<S: Store>(ctx: &Context, store: &S, key: &str) -> CacheResult<Option<Vec<u8>>> {
    ctx.run(store.get(key))
        .await?
        .map_err(|error| CacheError::store("get", error))
}
