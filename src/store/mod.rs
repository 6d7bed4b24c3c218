//! Provides the uniform adapter over the backing key/value stores.
//!
//! A [Store] keeps raw bytes and offers the atomic primitives required to coordinate fetches:
//! **set_if_absent** to acquire a lock and the owner checked **compare_and_expire** /
//! **compare_and_delete** to extend or release it. Two implementations are provided:
//!
//! * [MemoryStore](memory::MemoryStore): an in-process expiring table. Used by the
//!   [CoalescingCacher](crate::cacher::coalescing::CoalescingCacher), but it also implements all
//!   lock primitives so that the lock protocol can be run without a server.
//! * [RedisStore](remote::RedisStore): a shared Redis database which coordinates fetches across
//!   processes and machines, used by the [LockingCacher](crate::cacher::locking::LockingCacher).
//!
//! All operations return **anyhow** errors. The coordinators wrap them into
//! [CacheError::Store](crate::error::CacheError::Store) along with the name of the operation.
use std::time::Duration;

use async_trait::async_trait;

pub mod expiring_table;
pub mod memory;
pub mod remote;

pub use memory::MemoryStore;
pub use remote::RedisStore;

/// Contains the suffix which turns a cache key into the key of its lock.
pub const LOCK_SUFFIX: &str = ":lock";

/// Derives the lock key for the given cache key.
///
/// # Example
/// ```
/// assert_eq!(cacher::store::lock_key("user:42"), "user:42:lock");
/// ```
pub fn lock_key(key: &str) -> String {
    format!("{}{}", key, LOCK_SUFFIX)
}

/// One page of keys returned by [Store::scan_prefix].
#[derive(Debug, Default)]
pub struct ScanPage {
    /// The cursor to pass in to fetch the next page. **0** signals that the scan is complete.
    pub cursor: u64,
    /// The keys of this page which start with the requested prefix.
    pub keys: Vec<String>,
}

/// Describes the operations a backing store has to provide.
///
/// A ttl of **Duration::ZERO** for [set](Store::set) is backend defined: the
/// [MemoryStore](memory::MemoryStore) applies its default ttl, Redis stores the value without
/// expiry.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Reads the value stored for the given key.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Stores the value for the given key, replacing any previous value.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()>;

    /// Deletes the given keys and returns how many of them existed.
    async fn delete(&self, keys: &[String]) -> anyhow::Result<usize>;

    /// Determines if a (non expired) value exists for the given key.
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Atomically stores the value if and only if no value exists for the key.
    ///
    /// Returns **true** if the value was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Atomically resets the expiry of the key to **ttl** if its value equals **expected**.
    ///
    /// Returns **true** if the expiry was updated.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool>;

    /// Atomically deletes the key if its value equals **expected**.
    ///
    /// Returns **true** if the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool>;

    /// Returns the next page of keys starting with **prefix**.
    ///
    /// Start with a cursor of **0** and continue until the returned cursor is **0** again.
    /// A page may be empty even if the scan isn't complete yet.
    async fn scan_prefix(&self, prefix: &str, cursor: u64, count: usize)
        -> anyhow::Result<ScanPage>;

    /// Removes all keys of the store.
    async fn flush(&self) -> anyhow::Result<()>;

    /// Returns the number of keys in the store.
    async fn count(&self) -> anyhow::Result<usize>;
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::context::Context;
    use crate::store::{MemoryStore, ScanPage, Store};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Wraps a [MemoryStore] and cancels the given context once the named operation completed.
    pub(crate) struct CancellingStore {
        store: MemoryStore,
        ctx: Context,
        operation: &'static str,
    }

    impl CancellingStore {
        pub(crate) fn new(store: MemoryStore, ctx: Context, operation: &'static str) -> Self {
            CancellingStore {
                store,
                ctx,
                operation,
            }
        }

        fn cancel_after(&self, operation: &str) -> bool {
            if self.operation == operation {
                self.ctx.cancel();
                true
            } else {
                false
            }
        }
    }

    #[async_trait]
    impl Store for CancellingStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            self.store.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
            self.store.set(key, value, ttl).await
        }

        async fn delete(&self, keys: &[String]) -> anyhow::Result<usize> {
            let deleted = self.store.delete(keys).await?;
            let _ = self.cancel_after("delete");
            Ok(deleted)
        }

        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            self.store.exists(key).await
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> anyhow::Result<bool> {
            let acquired = self.store.set_if_absent(key, value, ttl).await?;
            if self.cancel_after("set_if_absent") {
                // Stay pending once, so that the cancellation arrives while still acquiring...
                tokio::task::yield_now().await;
            }
            Ok(acquired)
        }

        async fn compare_and_expire(
            &self,
            key: &str,
            expected: &str,
            ttl: Duration,
        ) -> anyhow::Result<bool> {
            self.store.compare_and_expire(key, expected, ttl).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool> {
            self.store.compare_and_delete(key, expected).await
        }

        async fn scan_prefix(
            &self,
            prefix: &str,
            cursor: u64,
            count: usize,
        ) -> anyhow::Result<ScanPage> {
            self.store.scan_prefix(prefix, cursor, count).await
        }

        async fn flush(&self) -> anyhow::Result<()> {
            self.store.flush().await
        }

        async fn count(&self) -> anyhow::Result<usize> {
            self.store.count().await
        }
    }
}
