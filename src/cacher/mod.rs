//! Provides the cache-aside coordinators.
//!
//! A [Cacher] answers lookups from a [Store] and computes missing values via a caller supplied
//! fetch function. The central promise is that concurrent lookups of the same missing key invoke
//! the fetch function only once, while all of them receive the fetched value (or its error).
//! Errors are never cached, so the next lookup after a failed fetch tries again.
//!
//! Two coordinators are provided:
//!
//! * [LockingCacher](locking::LockingCacher) coordinates via a lock stored next to the value.
//!   This works across processes sharing a [RedisStore](crate::store::RedisStore): the caller
//!   which obtains the lock fetches, all others poll the store until the value appears.
//! * [CoalescingCacher](coalescing::CoalescingCacher) coordinates within the process: all
//!   callers of a key attach to a single in-flight fetch and receive its outcome directly.
//!
//! # Example
//! ```
//! # use cacher::cacher::{Cacher, CoalescingCacher};
//! # use cacher::config::Config;
//! # use cacher::context::Context;
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let cacher = CoalescingCacher::<String>::new(Arc::new(Config::default()));
//! let ctx = Context::background();
//!
//! let name = cacher
//!     .get_or_fetch(&ctx, "user:42", Duration::from_secs(60), |_ctx| async {
//!         // Load the value from the slow source...
//!         Ok("Jane Doe".to_owned())
//!     })
//!     .await?;
//! assert_eq!(name, "Jane Doe");
//!
//! // The second lookup is answered by the cache...
//! let name = cacher
//!     .get_or_fetch(&ctx, "user:42", Duration::from_secs(60), |_ctx| async {
//!         Err(anyhow::anyhow!("not invoked"))
//!     })
//!     .await?;
//! assert_eq!(name, "Jane Doe");
//! # Ok(())
//! # }
//! ```
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{decode, encode};
use crate::context::Context;
use crate::error::{CacheError, CacheResult};
use crate::store::Store;

pub mod coalescing;
pub mod locking;

pub use coalescing::CoalescingCacher;
pub use locking::LockingCacher;

/// Describes the operations of a cache coordinator for values of type **T**.
#[async_trait]
pub trait Cacher<T: Send + 'static>: Send + Sync {
    /// Returns the value cached for **key** or invokes **fetch** to compute it.
    ///
    /// A fetched value is stored with the given **ttl** (a zero ttl is handled by the store:
    /// the memory store applies its default ttl, Redis keeps the value forever). If the fetch
    /// fails, nothing is stored and the error is returned as [CacheError::Fetch].
    ///
    /// Concurrent calls for the same missing key invoke **fetch** only once. The fetch function
    /// receives the context of the caller which invoked it.
    async fn get_or_fetch<F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> CacheResult<T>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static;

    /// Removes the value cached for **key**. Removing a missing key is not an error.
    ///
    /// Note that this doesn't touch a lock which might currently be held for the key.
    async fn delete(&self, ctx: &Context, key: &str) -> CacheResult<()>;

    /// Removes all entries of the underlying store.
    ///
    /// If the store is shared (e.g. a Redis database), this also removes unrelated keys.
    async fn clear(&self, ctx: &Context) -> CacheResult<()>;

    /// Returns the number of entries in the underlying store.
    async fn item_count(&self, ctx: &Context) -> CacheResult<usize>;

    /// Removes all entries whose key starts with **prefix** and returns how many were removed.
    ///
    /// If the operation is cancelled or fails part-way, a [CacheError::Interrupted] carrying the
    /// number of already removed entries is returned.
    async fn delete_by_prefix(&self, ctx: &Context, prefix: &str) -> CacheResult<usize>;
}

/// Ensures that a usable cache key was given.
pub(crate) fn verify_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        Err(CacheError::InvalidKey("cache keys must not be empty".to_owned()))
    } else {
        Ok(())
    }
}

/// Reads and decodes the value stored for **key**.
pub(crate) async fn read_value<S: Store, T: DeserializeOwned>(
    ctx: &Context,
    store: &S,
    key: &str,
) -> CacheResult<Option<T>> {
    match ctx
        .run(store.get(key))
        .await?
        .map_err(|error| CacheError::store("get", error))?
    {
        Some(data) => decode(&data).map(Some),
        None => Ok(None),
    }
}

/// Encodes and stores a freshly fetched value.
///
/// This isn't bound to a caller context: once a value has been fetched, it is published even if
/// the caller gave up in the meantime.
pub(crate) async fn publish_value<S: Store, T: Serialize>(
    store: &S,
    key: &str,
    value: &T,
    ttl: Duration,
) -> CacheResult<()> {
    let data = encode(value)?;
    store
        .set(key, data, ttl)
        .await
        .map_err(|error| CacheError::store("set", error))
}

/// Scans for all keys starting with **prefix** and deletes them in chunks of **delete_batch**.
///
/// The context is checked before each chunk.
pub(crate) async fn delete_matching<S: Store>(
    ctx: &Context,
    store: &S,
    prefix: &str,
    scan_count: usize,
    delete_batch: usize,
) -> CacheResult<usize> {
    let interrupted = |deleted: usize, cause: CacheError| CacheError::Interrupted {
        deleted,
        cause: Box::new(cause),
    };

    let mut deleted = 0;
    let mut cursor = 0;
    loop {
        let page = match ctx.run(store.scan_prefix(prefix, cursor, scan_count)).await {
            Ok(Ok(page)) => page,
            Ok(Err(error)) => return Err(interrupted(deleted, CacheError::store("scan", error))),
            Err(error) => return Err(interrupted(deleted, error)),
        };

        for chunk in page.keys.chunks(delete_batch.max(1)) {
            match ctx.run(store.delete(chunk)).await {
                Ok(Ok(count)) => deleted += count,
                Ok(Err(error)) => {
                    return Err(interrupted(deleted, CacheError::store("delete", error)))
                }
                Err(error) => return Err(interrupted(deleted, error)),
            }
        }

        cursor = page.cursor;
        if cursor == 0 {
            return Ok(deleted);
        }
    }
}
