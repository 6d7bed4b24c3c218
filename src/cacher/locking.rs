//! Provides the coordinator which uses a lock in the store to elect a single fetcher.
//!
//! On a miss, all callers try to create the lock `<key>:lock`. The one which succeeds checks the
//! store once more (the value might have been published in the meantime), invokes the fetch
//! function, stores the value and finally releases its lock. While the fetch is running, the
//! lock is extended every `lock_ttl / 3` (see [lock](crate::lock)).
//!
//! All other callers poll the store with an exponential backoff until the value appears (see
//! [backoff](crate::backoff)). If the lock vanishes without a value, the fetch failed and they
//! give up with [CacheError::NotPopulated] instead of waiting for the full timeout.
//!
//! As the store is the only shared state, several processes can use a [LockingCacher] on the
//! same Redis database and still fetch each missing value only once. Hits never touch the lock.
//!
//! # Example
//! ```no_run
//! # use cacher::cacher::{Cacher, LockingCacher};
//! # use cacher::config::Config;
//! # use cacher::context::Context;
//! # use cacher::store::RedisStore;
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = Arc::new(Config::default());
//! let store = Arc::new(RedisStore::connect(&config.current().redis.url).await?);
//! let cacher = LockingCacher::<Vec<String>, _>::new(store, config);
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(10));
//! let roles = cacher
//!     .get_or_fetch(&ctx, "roles:42", Duration::from_secs(300), |_ctx| async {
//!         Ok(vec!["admin".to_owned()])
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::backoff::wait_for_value;
use crate::cacher::{delete_matching, publish_value, read_value, verify_key, Cacher};
use crate::config::Config;
use crate::context::Context;
use crate::error::{CacheError, CacheResult};
use crate::fmt::format_duration;
use crate::lock::try_acquire;
use crate::metrics::Metrics;
use crate::store::{lock_key, Store};

/// Coordinates fetches across processes via a lock in the shared store.
pub struct LockingCacher<T, S: Store> {
    store: Arc<S>,
    config: Arc<Config>,
    metrics: Metrics,
    _value: PhantomData<fn() -> T>,
}

impl<T, S: Store> LockingCacher<T, S> {
    /// Creates a new coordinator on top of the given store.
    ///
    /// The timing parameters are read from the config for each lookup.
    pub fn new(store: Arc<S>, config: Arc<Config>) -> Self {
        LockingCacher {
            store,
            config,
            metrics: Metrics::new(),
            _value: PhantomData,
        }
    }

    /// Provides access to the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the counters of this coordinator.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl<T, S> LockingCacher<T, S>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Store,
{
    async fn fetch_and_publish<F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> CacheResult<T>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if let Some(value) = read_value(ctx, self.store.as_ref(), key).await? {
            log::debug!("{} was published while acquiring the lock...", key);
            return Ok(value);
        }

        log::debug!("Fetching {}...", key);
        let watch = Instant::now();
        let result = ctx.run(fetch(ctx.clone())).await?;
        self.metrics.record_fetch(watch.elapsed(), result.is_ok());

        let value = match result {
            Ok(value) => value,
            Err(error) => {
                log::debug!("Fetching {} failed: {:#}", key, error);
                return Err(CacheError::fetch(error));
            }
        };

        publish_value(self.store.as_ref(), key, &value, ttl).await?;
        log::debug!(
            "Fetched and stored {} in {}...",
            key,
            format_duration(watch.elapsed())
        );

        Ok(value)
    }
}

#[async_trait]
impl<T, S> Cacher<T> for LockingCacher<T, S>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Store,
{
    async fn get_or_fetch<F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> CacheResult<T>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        verify_key(key)?;

        if let Some(value) = read_value(ctx, self.store.as_ref(), key).await? {
            self.metrics.record_hit();
            return Ok(value);
        }
        self.metrics.record_miss();

        let settings = self.config.current();
        let lock = lock_key(key);
        ctx.check()?;
        let guard = try_acquire(
            &self.store,
            &lock,
            settings.cacher.lock_ttl,
            settings.cacher.release_timeout,
        )
        .await
        .map_err(|error| CacheError::store("acquire lock", error))?;

        match guard {
            Some(guard) => {
                if let Err(error) = ctx.check() {
                    if let Err(release_error) = guard.release().await {
                        log::error!("Failed to release lock {}: {:#}", lock, release_error);
                    }
                    return Err(error);
                }

                let result = self.fetch_and_publish(ctx, key, ttl, fetch).await;
                if guard.is_lost() {
                    log::warn!(
                        "The lock for {} expired during the fetch. The value might have been fetched more than once.",
                        key
                    );
                }
                if let Err(error) = guard.release().await {
                    log::error!("Failed to release lock {}: {:#}", lock, error);
                }

                result
            }
            None => {
                self.metrics.record_wait();
                log::debug!("{} is being fetched by another caller. Waiting...", key);
                wait_for_value(
                    ctx,
                    self.store.as_ref(),
                    key,
                    &lock,
                    &settings.cacher.wait_settings(),
                )
                .await
            }
        }
    }

    async fn delete(&self, ctx: &Context, key: &str) -> CacheResult<()> {
        let _ = ctx
            .run(self.store.delete(&[key.to_owned()]))
            .await?
            .map_err(|error| CacheError::store("delete", error))?;

        Ok(())
    }

    async fn clear(&self, ctx: &Context) -> CacheResult<()> {
        ctx.run(self.store.flush())
            .await?
            .map_err(|error| CacheError::store("flush", error))
    }

    async fn item_count(&self, ctx: &Context) -> CacheResult<usize> {
        ctx.run(self.store.count())
            .await?
            .map_err(|error| CacheError::store("count", error))
    }

    async fn delete_by_prefix(&self, ctx: &Context, prefix: &str) -> CacheResult<usize> {
        let batch_size = self.config.current().cacher.scan_batch_size;
        delete_matching(ctx, self.store.as_ref(), prefix, batch_size, batch_size).await
    }
}

#[cfg(test)]
mod tests {
    use crate::cacher::{Cacher, LockingCacher};
    use crate::codec::encode;
    use crate::config::{CacherSettings, Config, MemorySettings, Settings};
    use crate::context::Context;
    use crate::error::{CacheError, ErrorKind};
    use crate::store::testing::CancellingStore;
    use crate::store::{MemoryStore, Store};
    use mock_instant::thread_local::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    const TTL: Duration = Duration::from_secs(60);

    fn cacher_with(settings: CacherSettings) -> Arc<LockingCacher<String, MemoryStore>> {
        let config = Config::from_settings(Settings {
            cacher: settings,
            ..Settings::default()
        });
        Arc::new(LockingCacher::new(
            Arc::new(MemoryStore::new(&MemorySettings::default())),
            Arc::new(config),
        ))
    }

    fn cacher() -> Arc<LockingCacher<String, MemoryStore>> {
        cacher_with(CacherSettings::default())
    }

    #[test]
    fn hits_never_invoke_the_fetch_function() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let ctx = Context::background();
            cacher
                .store()
                .set("k", encode(&"cached").unwrap(), TTL)
                .await
                .unwrap();

            let value = cacher
                .get_or_fetch(&ctx, "k", TTL, |_| async {
                    Err(anyhow::anyhow!("must not be invoked"))
                })
                .await
                .unwrap();
            assert_eq!(value, "cached");
            assert_eq!(cacher.metrics().hits(), 1);
            assert_eq!(cacher.metrics().fetches(), 0);
            assert_eq!(cacher.store().exists("k:lock").await.unwrap(), false);
        });
    }

    #[test]
    fn concurrent_misses_fetch_once() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let invocations = Arc::new(AtomicUsize::new(0));

            let mut callers = Vec::new();
            for _ in 0..10 {
                let cacher = cacher.clone();
                let invocations = invocations.clone();
                callers.push(tokio::spawn(async move {
                    cacher
                        .get_or_fetch(&Context::background(), "k", TTL, move |_| async move {
                            let _ = invocations.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("fetched".to_owned())
                        })
                        .await
                }));
            }

            for caller in callers {
                assert_eq!(caller.await.unwrap().unwrap(), "fetched");
            }
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(cacher.metrics().fetches(), 1);
            assert_eq!(cacher.metrics().waits(), 9);

            // The value was published before the lock was released...
            assert_eq!(cacher.store().exists("k:lock").await.unwrap(), false);
            assert_eq!(cacher.item_count(&Context::background()).await.unwrap(), 1);
        });
    }

    #[test]
    fn held_locks_survive_a_full_store() {
        crate::testing::test_async(async {
            let store = Arc::new(MemoryStore::new(&MemorySettings {
                max_entries: 2,
                ..MemorySettings::default()
            }));
            let cacher = Arc::new(LockingCacher::<String, _>::new(
                store.clone(),
                Arc::new(Config::default()),
            ));
            let invocations = Arc::new(AtomicUsize::new(0));

            let fetch = |invocations: Arc<AtomicUsize>| {
                move |_: Context| async move {
                    let _ = invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, anyhow::Error>("fetched".to_owned())
                }
            };

            let first = {
                let cacher = cacher.clone();
                let fetch = fetch(invocations.clone());
                tokio::spawn(async move {
                    cacher
                        .get_or_fetch(&Context::background(), "k", TTL, fetch)
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(store.exists("k:lock").await.unwrap(), true);

            // Unrelated writes fill up the store while the fetch is running...
            store.set("x", b"1".to_vec(), TTL).await.unwrap();
            store.set("y", b"2".to_vec(), TTL).await.unwrap();
            assert_eq!(store.exists("k:lock").await.unwrap(), true);

            let second = {
                let cacher = cacher.clone();
                let fetch = fetch(invocations.clone());
                tokio::spawn(async move {
                    cacher
                        .get_or_fetch(&Context::background(), "k", TTL, fetch)
                        .await
                })
            };

            assert_eq!(first.await.unwrap().unwrap(), "fetched");
            assert_eq!(second.await.unwrap().unwrap(), "fetched");
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(cacher.metrics().waits(), 1);
        });
    }

    #[test]
    fn callers_cancelled_while_acquiring_leave_no_lock_behind() {
        crate::testing::test_async(async {
            let ctx = Context::background().child();
            let store = Arc::new(CancellingStore::new(
                MemoryStore::new(&MemorySettings::default()),
                ctx.clone(),
                "set_if_absent",
            ));
            let cacher = LockingCacher::<String, _>::new(store.clone(), Arc::new(Config::default()));

            let error = cacher
                .get_or_fetch(&ctx, "k", TTL, |_| async {
                    Err(anyhow::anyhow!("must not be invoked"))
                })
                .await
                .unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Cancelled);
            assert_eq!(cacher.metrics().fetches(), 0);
            assert_eq!(store.exists("k:lock").await.unwrap(), false);
        });
    }

    #[test]
    fn errors_are_returned_verbatim_and_never_cached() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let ctx = Context::background();

            let error = cacher
                .get_or_fetch(&ctx, "k", TTL, |_| async {
                    Err(anyhow::anyhow!("database offline"))
                })
                .await
                .unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Fetch);
            assert_eq!(
                error.fetch_error().unwrap().to_string(),
                "database offline"
            );
            assert_eq!(cacher.store().exists("k").await.unwrap(), false);
            assert_eq!(cacher.store().exists("k:lock").await.unwrap(), false);

            let value = cacher
                .get_or_fetch(&ctx, "k", TTL, |_| async { Ok("second try".to_owned()) })
                .await
                .unwrap();
            assert_eq!(value, "second try");
            assert_eq!(cacher.metrics().fetch_errors(), 1);
        });
    }

    #[test]
    fn waiters_of_a_failed_fetch_do_not_hang() {
        crate::testing::test_async(async {
            let cacher = cacher();

            let winner = {
                let cacher = cacher.clone();
                tokio::spawn(async move {
                    cacher
                        .get_or_fetch(&Context::background(), "k", TTL, |_| async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err(anyhow::anyhow!("boom"))
                        })
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;

            let start = Instant::now();
            let result = cacher
                .get_or_fetch(&Context::background(), "k", TTL, |_| async {
                    Ok("never".to_owned())
                })
                .await;

            assert_eq!(result.unwrap_err().kind(), ErrorKind::NotPopulated);
            assert_eq!(start.elapsed() < Duration::from_secs(5), true);
            assert_eq!(winner.await.unwrap().unwrap_err().kind(), ErrorKind::Fetch);
        });
    }

    #[test]
    fn waiters_time_out_if_the_lock_is_never_released() {
        crate::testing::test_async(async {
            let cacher = cacher_with(CacherSettings {
                wait_timeout: Duration::from_millis(300),
                ..CacherSettings::default()
            });
            let _ = cacher
                .store()
                .set_if_absent("k:lock", "another process", TTL)
                .await
                .unwrap();

            let start = Instant::now();
            let result = cacher
                .get_or_fetch(&Context::background(), "k", TTL, |_| async {
                    Ok("never".to_owned())
                })
                .await;
            let elapsed = start.elapsed();

            assert_eq!(
                matches!(result, Err(CacheError::WaitTimeout(_))),
                true
            );
            assert_eq!(elapsed >= Duration::from_millis(300), true);
            assert_eq!(elapsed < Duration::from_millis(300 + 500), true);
        });
    }

    #[test]
    fn an_expired_lock_can_be_taken_over() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let _ = cacher
                .store()
                .set_if_absent("k:lock", "crashed process", Duration::from_secs(30))
                .await
                .unwrap();

            MockClock::advance(Duration::from_secs(31));
            let value = cacher
                .get_or_fetch(&Context::background(), "k", TTL, |_| async {
                    Ok("fetched".to_owned())
                })
                .await
                .unwrap();
            assert_eq!(value, "fetched");
            assert_eq!(cacher.store().exists("k:lock").await.unwrap(), false);
        });
    }

    #[test]
    fn cancelled_winners_release_their_lock() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let ctx = Context::background().with_timeout(Duration::from_millis(30));

            let result = cacher
                .get_or_fetch(&ctx, "k", TTL, |_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok("too late".to_owned())
                })
                .await;

            assert_eq!(result.unwrap_err().kind(), ErrorKind::DeadlineExceeded);
            assert_eq!(cacher.store().exists("k:lock").await.unwrap(), false);
            assert_eq!(cacher.store().exists("k").await.unwrap(), false);
        });
    }

    #[test]
    fn prefixes_are_deleted() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let ctx = Context::background();
            for key in ["user:1", "user:2", "order:1"] {
                let _ = cacher
                    .get_or_fetch(&ctx, key, TTL, |_| async { Ok("x".to_owned()) })
                    .await
                    .unwrap();
            }

            assert_eq!(cacher.delete_by_prefix(&ctx, "user:").await.unwrap(), 2);
            assert_eq!(cacher.item_count(&ctx).await.unwrap(), 1);
            assert_eq!(cacher.delete_by_prefix(&ctx, "user:").await.unwrap(), 0);
        });
    }

    #[test]
    fn deletes_are_idempotent() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let ctx = Context::background();
            let _ = cacher
                .get_or_fetch(&ctx, "k", TTL, |_| async { Ok("x".to_owned()) })
                .await
                .unwrap();

            cacher.delete(&ctx, "k").await.unwrap();
            cacher.delete(&ctx, "k").await.unwrap();
            assert_eq!(cacher.item_count(&ctx).await.unwrap(), 0);

            let _ = cacher
                .get_or_fetch(&ctx, "a", TTL, |_| async { Ok("x".to_owned()) })
                .await
                .unwrap();
            cacher.clear(&ctx).await.unwrap();
            assert_eq!(cacher.item_count(&ctx).await.unwrap(), 0);
        });
    }

    #[test]
    fn values_expire_after_their_ttl() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let ctx = Context::background();
            let _ = cacher
                .get_or_fetch(&ctx, "k", Duration::from_secs(10), |_| async {
                    Ok("first".to_owned())
                })
                .await
                .unwrap();

            MockClock::advance(Duration::from_secs(11));
            let value = cacher
                .get_or_fetch(&ctx, "k", Duration::from_secs(10), |_| async {
                    Ok("second".to_owned())
                })
                .await
                .unwrap();
            assert_eq!(value, "second");
        });
    }

    #[test]
    fn empty_keys_are_rejected() {
        crate::testing::test_async(async {
            let result = cacher()
                .get_or_fetch(&Context::background(), "", TTL, |_| async {
                    Ok("x".to_owned())
                })
                .await;
            assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidKey);
        });
    }
}
