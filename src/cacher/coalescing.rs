//! Provides the coordinator which coalesces concurrent fetches within the process.
//!
//! On a miss, the first caller registers an in-flight fetch for the key and spawns it as a task.
//! Every caller which misses the same key while the fetch is running attaches to the registered
//! fetch instead of starting its own. Once the fetch completes, its outcome (the value or the
//! error) is handed to all attached callers, the value is stored and the registration is
//! removed, so that the next miss starts a new fetch.
//!
//! The fetch runs as a task of its own. A caller which gives up (cancelled or deadline
//! exceeded) therefore doesn't abort the fetch for the others. A fetch function which panics is
//! reported as [CacheError::Fetch] to all attached callers.
//!
//! The registry is guarded by a plain mutex which is never held across an await point.
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::cacher::{delete_matching, publish_value, read_value, verify_key, Cacher};
use crate::config::{ChangeNotifier, Config};
use crate::context::Context;
use crate::error::{CacheError, CacheResult};
use crate::fmt::format_duration;
use crate::metrics::Metrics;
use crate::store::{MemoryStore, Store};

type SharedFetch<T> = Shared<BoxFuture<'static, CacheResult<T>>>;

struct InFlight<T> {
    generation: u64,
    fetch: SharedFetch<T>,
}

struct Registry<T> {
    next_generation: u64,
    in_flight: HashMap<String, InFlight<T>>,
}

type SharedRegistry<T> = Arc<Mutex<Registry<T>>>;

fn lock_registry<T>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the registration of a fetch once the fetch task completes (or is torn down).
///
/// The generation ensures that a newer fetch for the same key is left alone.
struct Registration<T> {
    registry: Weak<Mutex<Registry<T>>>,
    key: String,
    generation: u64,
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = lock_registry(&registry);
            if matches!(registry.in_flight.get(&self.key), Some(in_flight) if in_flight.generation == self.generation)
            {
                let _ = registry.in_flight.remove(&self.key);
            }
        }
    }
}

/// Coordinates fetches of callers within this process.
pub struct CoalescingCacher<T, S: Store = MemoryStore> {
    store: Arc<S>,
    config: Arc<Config>,
    registry: SharedRegistry<T>,
    metrics: Arc<Metrics>,
}

impl<T: Send + Sync + 'static> CoalescingCacher<T, MemoryStore> {
    /// Creates a coordinator with a new [MemoryStore] built from the memory settings.
    ///
    /// This starts the janitor of the store and re-applies the memory settings whenever the
    /// config changes. Therefore this must be called within a tokio runtime.
    pub fn new(config: Arc<Config>) -> Self {
        let store = MemoryStore::with_janitor(&config.current().memory);
        crate::spawn!(follow_memory_settings(
            Arc::downgrade(&store),
            Arc::downgrade(&config),
            config.notifier()
        ));

        CoalescingCacher::with_store(store, config)
    }
}

async fn follow_memory_settings(
    store: Weak<MemoryStore>,
    config: Weak<Config>,
    mut notifier: ChangeNotifier,
) {
    loop {
        match notifier.recv().await {
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                match (store.upgrade(), config.upgrade()) {
                    (Some(store), Some(config)) => {
                        store.apply_settings(&config.current().memory)
                    }
                    _ => return,
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

impl<T, S: Store> CoalescingCacher<T, S> {
    /// Creates a coordinator on top of the given store.
    pub fn with_store(store: Arc<S>, config: Arc<Config>) -> Self {
        CoalescingCacher {
            store,
            config,
            registry: Arc::new(Mutex::new(Registry {
                next_generation: 0,
                in_flight: HashMap::new(),
            })),
            metrics: Arc::new(Metrics::new()),
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

    /// Returns the number of fetches which are currently running.
    pub fn in_flight(&self) -> usize {
        lock_registry(&self.registry).in_flight.len()
    }
}

impl<T, S> CoalescingCacher<T, S>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: Store,
{
    /// Attaches to the running fetch for **key** or starts a new one.
    fn attach_or_start<F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> SharedFetch<T>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut registry = lock_registry(&self.registry);
        if let Some(in_flight) = registry.in_flight.get(key) {
            self.metrics.record_wait();
            log::debug!("{} is being fetched by another caller. Attaching...", key);
            return in_flight.fetch.clone();
        }

        let generation = registry.next_generation;
        registry.next_generation += 1;

        let registration = Registration {
            registry: Arc::downgrade(&self.registry),
            key: key.to_owned(),
            generation,
        };
        let task = tokio::spawn(run_fetch(
            self.store.clone(),
            self.metrics.clone(),
            ctx.clone(),
            registration,
            ttl,
            fetch,
        ));

        let fetch = async move {
            match task.await {
                Ok(result) => result,
                Err(error) => Err(CacheError::fetch(anyhow::anyhow!(
                    "fetch task failed: {}",
                    error
                ))),
            }
        }
        .boxed()
        .shared();

        let _ = registry.in_flight.insert(
            key.to_owned(),
            InFlight {
                generation,
                fetch: fetch.clone(),
            },
        );

        fetch
    }
}

async fn run_fetch<T, S, F, Fut>(
    store: Arc<S>,
    metrics: Arc<Metrics>,
    ctx: Context,
    registration: Registration<T>,
    ttl: Duration,
    fetch: F,
) -> CacheResult<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Store,
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let key = registration.key.as_str();

    if let Some(value) = read_value(&Context::background(), store.as_ref(), key).await? {
        log::debug!("{} was published while registering the fetch...", key);
        return Ok(value);
    }

    log::debug!("Fetching {}...", key);
    let watch = Instant::now();
    let result = AssertUnwindSafe(async move { fetch(ctx).await })
        .catch_unwind()
        .await;
    let result = match result {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "fetch function panicked: {}",
            panic_message(panic.as_ref())
        )),
    };
    metrics.record_fetch(watch.elapsed(), result.is_ok());

    let value = match result {
        Ok(value) => value,
        Err(error) => {
            log::debug!("Fetching {} failed: {:#}", key, error);
            return Err(CacheError::fetch(error));
        }
    };

    publish_value(store.as_ref(), key, &value, ttl).await?;
    log::debug!(
        "Fetched and stored {} in {}...",
        key,
        format_duration(watch.elapsed())
    );

    Ok(value)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown cause"
    }
}

#[async_trait]
impl<T, S> Cacher<T> for CoalescingCacher<T, S>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
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

        let fetch = self.attach_or_start(ctx, key, ttl, fetch);
        ctx.run(fetch).await?
    }

    async fn delete(&self, ctx: &Context, key: &str) -> CacheResult<()> {
        ctx.check()?;
        let _ = self
            .store
            .delete(&[key.to_owned()])
            .await
            .map_err(|error| CacheError::store("delete", error))?;

        Ok(())
    }

    async fn clear(&self, ctx: &Context) -> CacheResult<()> {
        ctx.check()?;
        self.store
            .flush()
            .await
            .map_err(|error| CacheError::store("flush", error))
    }

    async fn item_count(&self, ctx: &Context) -> CacheResult<usize> {
        ctx.check()?;
        self.store
            .count()
            .await
            .map_err(|error| CacheError::store("count", error))
    }

    async fn delete_by_prefix(&self, ctx: &Context, prefix: &str) -> CacheResult<usize> {
        let scan_count = self.config.current().cacher.scan_batch_size;
        delete_matching(ctx, self.store.as_ref(), prefix, scan_count, 1).await
    }
}

#[cfg(test)]
mod tests {
    use crate::cacher::{Cacher, CoalescingCacher};
    use crate::config::{Config, MemorySettings, Settings};
    use crate::context::Context;
    use crate::error::ErrorKind;
    use crate::store::{MemoryStore, Store};
    use mock_instant::thread_local::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    fn cacher() -> Arc<CoalescingCacher<String>> {
        Arc::new(CoalescingCacher::with_store(
            Arc::new(MemoryStore::new(&MemorySettings::default())),
            Arc::new(Config::default()),
        ))
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
            assert_eq!(cacher.metrics().waits(), 9);
            assert_eq!(cacher.in_flight(), 0);
            assert_eq!(cacher.item_count(&Context::background()).await.unwrap(), 1);
        });
    }

    #[test]
    fn errors_are_shared_but_never_cached() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let invocations = Arc::new(AtomicUsize::new(0));

            let mut callers = Vec::new();
            for _ in 0..5 {
                let cacher = cacher.clone();
                let invocations = invocations.clone();
                callers.push(tokio::spawn(async move {
                    cacher
                        .get_or_fetch(&Context::background(), "k", TTL, move |_| async move {
                            let _ = invocations.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Err(anyhow::anyhow!("database offline"))
                        })
                        .await
                }));
            }

            for caller in callers {
                let error = caller.await.unwrap().unwrap_err();
                assert_eq!(error.kind(), ErrorKind::Fetch);
                assert_eq!(
                    error.fetch_error().unwrap().to_string(),
                    "database offline"
                );
            }
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(cacher.store().exists("k").await.unwrap(), false);
            assert_eq!(cacher.in_flight(), 0);

            let value = cacher
                .get_or_fetch(&Context::background(), "k", TTL, |_| async {
                    Ok("recovered".to_owned())
                })
                .await
                .unwrap();
            assert_eq!(value, "recovered");
        });
    }

    #[test]
    fn panicking_fetches_are_reported_as_errors() {
        crate::testing::test_async(async {
            let cacher = cacher();

            let error = cacher
                .get_or_fetch(&Context::background(), "k", TTL, |_| async {
                    if true {
                        panic!("kaputt");
                    }
                    Ok("never".to_owned())
                })
                .await
                .unwrap_err();

            assert_eq!(error.kind(), ErrorKind::Fetch);
            assert_eq!(error.to_string().contains("kaputt"), true);
            assert_eq!(cacher.in_flight(), 0);
        });
    }

    #[test]
    fn a_cancelled_caller_does_not_abort_the_fetch_of_others() {
        crate::testing::test_async(async {
            let cacher = cacher();

            let patient = {
                let cacher = cacher.clone();
                tokio::spawn(async move {
                    cacher
                        .get_or_fetch(&Context::background(), "k", TTL, |_| async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("fetched".to_owned())
                        })
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(5)).await;

            let ctx = Context::background().with_timeout(Duration::from_millis(10));
            let result = cacher
                .get_or_fetch(&ctx, "k", TTL, |_| async { Ok("other".to_owned()) })
                .await;
            assert_eq!(result.unwrap_err().kind(), ErrorKind::DeadlineExceeded);

            assert_eq!(patient.await.unwrap().unwrap(), "fetched");
        });
    }

    #[test]
    fn maintenance_operations_honor_a_cancelled_context() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let ctx = Context::background();
            let _ = cacher
                .get_or_fetch(&ctx, "user:1", TTL, |_| async { Ok("x".to_owned()) })
                .await
                .unwrap();

            let cancelled = Context::background().child();
            cancelled.cancel();
            assert_eq!(
                cacher.delete(&cancelled, "user:1").await.unwrap_err().kind(),
                ErrorKind::Cancelled
            );
            assert_eq!(
                cacher.clear(&cancelled).await.unwrap_err().kind(),
                ErrorKind::Cancelled
            );
            assert_eq!(
                cacher.item_count(&cancelled).await.unwrap_err().kind(),
                ErrorKind::Cancelled
            );
            let error = cacher
                .delete_by_prefix(&cancelled, "user:")
                .await
                .unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Cancelled);
            assert_eq!(error.deleted_before_failure(), 0);

            assert_eq!(cacher.item_count(&ctx).await.unwrap(), 1);
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

            cacher.delete(&ctx, "order:1").await.unwrap();
            cacher.delete(&ctx, "order:1").await.unwrap();
            assert_eq!(cacher.item_count(&ctx).await.unwrap(), 0);
        });
    }

    #[test]
    fn values_expire_after_their_ttl() {
        crate::testing::test_async(async {
            let cacher = cacher();
            let ctx = Context::background();
            let _ = cacher
                .get_or_fetch(&ctx, "k", Duration::from_secs(5), |_| async {
                    Ok("first".to_owned())
                })
                .await
                .unwrap();

            MockClock::advance(Duration::from_secs(6));
            assert_eq!(cacher.item_count(&ctx).await.unwrap(), 0);
            let value = cacher
                .get_or_fetch(&ctx, "k", Duration::from_secs(5), |_| async {
                    Ok("second".to_owned())
                })
                .await
                .unwrap();
            assert_eq!(value, "second");
        });
    }

    #[test]
    fn memory_settings_follow_the_config() {
        crate::testing::test_async(async {
            let config = Arc::new(Config::default());
            let cacher = CoalescingCacher::<String>::new(config.clone());
            let ctx = Context::background();
            for key in ["a", "b", "c"] {
                let _ = cacher
                    .get_or_fetch(&ctx, key, TTL, |_| async { Ok("x".to_owned()) })
                    .await
                    .unwrap();
            }

            let mut settings = Settings::default();
            settings.memory.max_entries = 1;
            config.update(settings);

            // Let the listener pick up the change...
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(cacher.item_count(&ctx).await.unwrap(), 1);
        });
    }
}
