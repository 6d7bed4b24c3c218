//! Provides an owner verified, self extending lock on top of a [Store].
//!
//! A lock is a plain key (see [lock_key](crate::store::lock_key)) which is created atomically via
//! **set_if_absent** and carries a random token identifying its owner. While held, a background
//! task extends the expiry every `ttl / 3`, so that a long running fetch keeps its lock while a
//! crashed owner releases it by expiry at the latest after **ttl**.
//!
//! Both, extending and releasing verify the token. Therefore an owner whose lock expired and was
//! taken over by another caller never extends or deletes the lock of the new owner.
//!
//! A [LockGuard] should be released via [LockGuard::release]. If it is dropped instead (e.g. as
//! the owning future was dropped or panicked), the release is spawned onto the current runtime.
//!
//! # Example
//! ```
//! # use cacher::store::MemoryStore;
//! # use cacher::config::MemorySettings;
//! # use cacher::lock::try_acquire;
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new(&MemorySettings::default()));
//!
//! let guard = try_acquire(&store, "report:lock", Duration::from_secs(30), Duration::from_secs(5))
//!     .await?
//!     .unwrap();
//! // Nobody else can acquire the lock now...
//! assert_eq!(try_acquire(&store, "report:lock", Duration::from_secs(30), Duration::from_secs(5))
//!     .await?
//!     .is_none(), true);
//!
//! assert_eq!(guard.release().await?, true);
//! # Ok(())
//! # }
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::fmt::format_duration;
use crate::store::Store;

/// Represents a held lock.
pub struct LockGuard<S: Store> {
    store: Arc<S>,
    key: String,
    token: String,
    release_timeout: Duration,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    released: bool,
}

/// Tries to acquire the lock with the given key.
///
/// Returns **None** if the lock is currently held by someone else. Otherwise a guard is returned
/// and a background task starts to extend the lock every `ttl / 3`.
///
/// Just like the release, the attempt is bounded by **release_timeout** and not by any caller
/// context, so that a created lock always ends up in a guard.
pub async fn try_acquire<S: Store>(
    store: &Arc<S>,
    key: &str,
    ttl: Duration,
    release_timeout: Duration,
) -> anyhow::Result<Option<LockGuard<S>>> {
    let token = uuid::Uuid::new_v4().to_string();
    let acquired =
        match tokio::time::timeout(release_timeout, store.set_if_absent(key, &token, ttl)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "Acquiring lock {} timed out after {}",
                    key,
                    format_duration(release_timeout)
                ))
            }
        };
    if !acquired {
        return Ok(None);
    }

    log::debug!("Acquired lock {}...", key);

    let lost = Arc::new(AtomicBool::new(false));
    let stop = CancellationToken::new();
    crate::spawn!(extend_lock(
        store.clone(),
        key.to_owned(),
        token.clone(),
        ttl,
        lost.clone(),
        stop.clone()
    ));

    Ok(Some(LockGuard {
        store: store.clone(),
        key: key.to_owned(),
        token,
        release_timeout,
        lost,
        stop,
        released: false,
    }))
}

async fn extend_lock<S: Store>(
    store: Arc<S>,
    key: String,
    token: String,
    ttl: Duration,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let period = (ttl / 3).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match store.compare_and_expire(&key, &token, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                log::warn!(
                    "Lost lock {} while still holding it. Another caller may run the same fetch.",
                    key
                );
                lost.store(true, Ordering::Release);
                return;
            }
            Err(error) => {
                log::warn!("Failed to extend lock {}: {:#}", key, error);
            }
        }
    }
}

async fn release_lock<S: Store>(
    store: &S,
    key: &str,
    token: &str,
    timeout: Duration,
) -> anyhow::Result<bool> {
    match tokio::time::timeout(timeout, store.compare_and_delete(key, token)).await {
        Ok(Ok(true)) => {
            log::debug!("Released lock {}...", key);
            Ok(true)
        }
        Ok(Ok(false)) => {
            log::debug!("Lock {} was no longer owned when releasing it...", key);
            Ok(false)
        }
        Ok(Err(error)) => Err(error),
        Err(_) => Err(anyhow::anyhow!(
            "Releasing lock {} timed out after {}",
            key,
            format_duration(timeout)
        )),
    }
}

impl<S: Store> LockGuard<S> {
    /// Returns the key of the lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the random token which identifies the owner of this lock.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Determines if an extension found the lock owned by someone else (or missing).
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Stops extending the lock and deletes it, if it is still owned by this guard.
    ///
    /// Returns **false** if the lock had already expired or was taken over. The delete is bounded
    /// by the release timeout but otherwise independent of any caller context, so that a
    /// cancelled caller still cleans up its lock.
    pub async fn release(mut self) -> anyhow::Result<bool> {
        self.released = true;
        self.stop.cancel();
        release_lock(
            self.store.as_ref(),
            &self.key,
            &self.token,
            self.release_timeout,
        )
        .await
    }
}

impl<S: Store> Drop for LockGuard<S> {
    fn drop(&mut self) {
        self.stop.cancel();
        if self.released {
            return;
        }

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let timeout = self.release_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                std::mem::drop(handle.spawn(async move {
                    if let Err(error) = release_lock(store.as_ref(), &key, &token, timeout).await {
                        log::warn!(
                            "Failed to release dropped lock {}: {:#}. It will expire on its own.",
                            key,
                            error
                        );
                    }
                }));
            }
            Err(_) => {
                log::warn!(
                    "Cannot release dropped lock {} outside of a runtime. It will expire on its own.",
                    key
                );
            }
        }
    }
}
