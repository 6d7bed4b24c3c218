//! Provides the store which is shared via a Redis server.
//!
//! All operations are sent through a **ConnectionManager** which multiplexes a single connection
//! and transparently reconnects if it breaks. The owner checked lock operations are implemented
//! as Lua scripts so that comparing the token and updating the key happens atomically on the
//! server.
//!
//! Values are stored as raw bytes. A ttl of zero stores a value without expiry.
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::store::{ScanPage, Store};

lazy_static::lazy_static! {
    static ref COMPARE_AND_EXPIRE: Script = Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
          else
            return 0
          end",
    );
    static ref COMPARE_AND_DELETE: Script = Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
          else
            return 0
          end",
    );
}

/// Provides a [Store] backed by a Redis database.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connects to the Redis server at the given url (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        log::info!("Connecting to Redis at {}...", url);
        let client =
            redis::Client::open(url).with_context(|| format!("Invalid Redis url: {}", url))?;
        let connection = ConnectionManager::new(client)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", url))?;

        Ok(RedisStore { connection })
    }

    /// Creates a store which uses an already established connection.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        RedisStore { connection }
    }
}

/// Converts a ttl into the millisecond argument of PX / PEXPIRE (which has to be positive).
fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Escapes all characters which have a special meaning in a Redis glob pattern.
///
/// # Example
/// ```
/// assert_eq!(cacher::store::remote::escape_glob("user:[1]*"), "user:\\[1\\]\\*");
/// ```
pub fn escape_glob(text: &str) -> String {
    let mut result = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\' | '^' | '-') {
            result.push('\\');
        }
        result.push(ch);
    }

    result
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let mut command = redis::cmd("SET");
        let _ = command.arg(key).arg(value);
        if !ttl.is_zero() {
            let _ = command.arg("PX").arg(millis(ttl));
        }

        let _: () = command.query_async(&mut connection).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> anyhow::Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut connection = self.connection.clone();
        let deleted: usize = redis::cmd("DEL")
            .arg(keys.to_vec())
            .query_async(&mut connection)
            .await?;

        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut connection = self.connection.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut connection)
            .await?;

        Ok(exists)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut connection = self.connection.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut connection)
            .await?;

        Ok(result.is_some())
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let mut connection = self.connection.clone();
        let updated: i64 = COMPARE_AND_EXPIRE
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut connection)
            .await?;

        Ok(updated == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool> {
        let mut connection = self.connection.clone();
        let deleted: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut connection)
            .await?;

        Ok(deleted == 1)
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> anyhow::Result<ScanPage> {
        let mut connection = self.connection.clone();
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(format!("{}*", escape_glob(prefix)))
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut connection)
            .await?;

        Ok(ScanPage {
            cursor,
            keys: keys
                .into_iter()
                .filter(|key| key.starts_with(prefix))
                .collect(),
        })
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut connection).await?;
        Ok(())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        let mut connection = self.connection.clone();
        let count: usize = redis::cmd("DBSIZE").query_async(&mut connection).await?;
        Ok(count)
    }
}
