//! Provides the in-process store backed by an [ExpiringTable].
//!
//! A **MemoryStore** keeps all values in a mutex protected table. The mutex is never held across
//! an await point, therefore all operations complete immediately. Expired entries are dropped
//! lazily on access, or periodically by a janitor task (see [MemoryStore::spawn_janitor]).
//!
//! # Example
//! ```
//! # use cacher::store::{MemoryStore, Store};
//! # use cacher::config::MemorySettings;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let store = MemoryStore::new(&MemorySettings::default());
//!
//! store.set("greeting", b"hello".to_vec(), Duration::from_secs(60)).await.unwrap();
//! assert_eq!(store.get("greeting").await.unwrap(), Some(b"hello".to_vec()));
//!
//! // Locks are plain entries which are created atomically...
//! assert_eq!(store.set_if_absent("greeting:lock", "me", Duration::from_secs(30)).await.unwrap(), true);
//! assert_eq!(store.set_if_absent("greeting:lock", "you", Duration::from_secs(30)).await.unwrap(), false);
//! # }
//! ```
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::MemorySettings;
use crate::fmt::{format_duration, format_size};
use crate::store::expiring_table::ExpiringTable;
use crate::store::{ScanPage, Store};

struct Inner {
    table: ExpiringTable<Vec<u8>>,
    default_ttl: Option<Duration>,
}

/// Provides an in-process expiring key/value store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

/// Reports the state of a [MemoryStore].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStats {
    /// The number of entries (including expired ones which haven't been purged yet).
    pub entries: usize,
    /// The memory allocated by keys and values in bytes.
    pub allocated_memory: usize,
    /// The number of reads since the last flush.
    pub reads: usize,
    /// The number of reads which found a value.
    pub hits: usize,
    /// The hit rate in percent.
    pub hit_rate: f32,
    /// The number of entries evicted due to the size constraints.
    pub evictions: usize,
}

impl MemoryStore {
    /// Creates a new store using the given settings.
    ///
    /// Note that this doesn't start a janitor. Expired entries are still never reported, but are
    /// only dropped once accessed or counted.
    pub fn new(settings: &MemorySettings) -> Self {
        MemoryStore {
            inner: Mutex::new(Inner {
                table: ExpiringTable::new(settings.max_entries, settings.max_memory),
                default_ttl: settings.default_ttl,
            }),
        }
    }

    /// Creates a new store and starts its janitor if a cleanup interval is configured.
    ///
    /// This must be called from within a tokio runtime.
    pub fn with_janitor(settings: &MemorySettings) -> Arc<Self> {
        let store = Arc::new(MemoryStore::new(settings));
        if let Some(interval) = settings.cleanup_interval {
            store.spawn_janitor(interval);
        }

        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a background task which purges expired entries every **interval**.
    ///
    /// The task only keeps a weak reference and stops once the store is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) {
        let store = Arc::downgrade(self);
        log::debug!(
            "Starting janitor for memory store (runs every {})...",
            format_duration(interval)
        );

        crate::spawn!(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            let _ = ticker.tick().await;
            loop {
                let _ = ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            log::debug!("Janitor purged {} expired entries.", purged);
                        }
                    }
                    None => return,
                }
            }
        });
    }

    /// Drops all expired entries and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.lock().table.purge_expired()
    }

    /// Applies changed settings (e.g. after a config reload).
    ///
    /// Shrinking the limits evicts the least recently used entries immediately.
    pub fn apply_settings(&self, settings: &MemorySettings) {
        let mut inner = self.lock();
        if inner.table.capacity() != settings.max_entries {
            log::info!(
                "Updating max_entries of the memory store from {} to {}.",
                inner.table.capacity(),
                settings.max_entries
            );
            inner.table.set_capacity(settings.max_entries);
        }
        if inner.table.max_memory() != settings.max_memory {
            log::info!(
                "Updating max_memory of the memory store from {} to {}.",
                format_size(inner.table.max_memory()),
                format_size(settings.max_memory)
            );
            inner.table.set_max_memory(settings.max_memory);
        }
        inner.default_ttl = settings.default_ttl;
    }

    /// Returns the current metrics of this store.
    pub fn stats(&self) -> MemoryStats {
        let inner = self.lock();
        MemoryStats {
            entries: inner.table.len(),
            allocated_memory: inner.table.allocated_memory(),
            reads: inner.table.reads(),
            hits: inner.table.hits(),
            hit_rate: inner.table.hit_rate(),
            evictions: inner.table.evictions(),
        }
    }

    /// A zero ttl falls back to the default ttl of the store (which might be "never").
    fn effective_ttl(inner: &Inner, ttl: Duration) -> Option<Duration> {
        if ttl.is_zero() {
            inner.default_ttl
        } else {
            Some(ttl)
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.lock().table.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let ttl = MemoryStore::effective_ttl(&inner, ttl);
        inner.table.put(key.to_owned(), value, ttl)
    }

    async fn delete(&self, keys: &[String]) -> anyhow::Result<usize> {
        let mut inner = self.lock();
        Ok(keys
            .iter()
            .filter(|key| inner.table.contains(key) && inner.table.remove(key))
            .count())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.lock().table.contains(key))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut inner = self.lock();
        let ttl = MemoryStore::effective_ttl(&inner, ttl);
        inner
            .table
            .put_if_absent(key, value.as_bytes().to_vec(), ttl)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let mut inner = self.lock();
        let ttl = MemoryStore::effective_ttl(&inner, ttl);
        Ok(inner
            .table
            .expire_if(key, ttl, |value| value.as_slice() == expected.as_bytes()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool> {
        Ok(self
            .lock()
            .table
            .remove_if(key, |value| value.as_slice() == expected.as_bytes()))
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        _cursor: u64,
        _count: usize,
    ) -> anyhow::Result<ScanPage> {
        // The whole table is local, therefore a single page covers all keys...
        Ok(ScanPage {
            cursor: 0,
            keys: self.lock().table.keys_with_prefix(prefix),
        })
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.lock().table.flush();
        Ok(())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        let mut inner = self.lock();
        let _ = inner.table.purge_expired();
        Ok(inner.table.len())
    }
}
