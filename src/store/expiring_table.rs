//! Provides a size constrained table whose entries expire after an individual ttl.
//!
//! This is the data structure behind the [MemoryStore](crate::store::memory::MemoryStore). Each
//! entry carries its own expiry. Expired entries are never returned and are dropped lazily on
//! access or eagerly via [ExpiringTable::purge_expired]. To bound memory usage, the table also
//! enforces a maximal number of entries and a maximal amount of allocated memory. If either limit
//! is exceeded, the least recently used entries are evicted.
//!
//! Entries created via [ExpiringTable::put_if_absent] are used as locks. These are **pinned**:
//! they are never evicted to make room, only removed explicitly or by their expiry. While pinned
//! entries alone exceed a limit, the table stays above it.
//!
//! # Examples
//! ```
//! # use cacher::store::expiring_table::ExpiringTable;
//! # use std::time::Duration;
//! // A table for up to 128 entries which may allocate up to 1 KiB...
//! let mut table = ExpiringTable::new(128, 1024);
//!
//! table.put("user:1".to_owned(), b"Jane".to_vec(), Some(Duration::from_secs(60))).unwrap();
//! assert_eq!(table.get("user:1").unwrap(), &b"Jane".to_vec());
//!
//! // Entries without ttl never expire...
//! table.put("user:2".to_owned(), b"John".to_vec(), None).unwrap();
//! assert_eq!(table.keys_with_prefix("user:").len(), 2);
//! ```
#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::time::Duration;

use linked_hash_map::LinkedHashMap;

/// Returns the allocated memory in bytes.
pub trait ByteSize {
    /// Returns the (approximate) amount of heap memory used by this value.
    fn allocated_size(&self) -> usize;
}

impl ByteSize for Vec<u8> {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

/// Provides a map whose entries expire and which is bounded in size.
pub struct ExpiringTable<V: ByteSize> {
    capacity: usize,
    allocated_memory: usize,
    max_memory: usize,
    reads: usize,
    hits: usize,
    writes: usize,
    evictions: usize,
    map: LinkedHashMap<String, Entry<V>>,
}

struct Entry<V: ByteSize> {
    mem_size: usize,
    expires_at: Option<Instant>,
    pinned: bool,
    value: V,
}

impl<V: ByteSize> Entry<V> {
    fn is_alive(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

impl<V: ByteSize> ExpiringTable<V> {
    /// Creates a new table which can store up to **capacity** entries or as many as fit into
    /// **max_memory** bytes.
    pub fn new(capacity: usize, max_memory: usize) -> Self {
        ExpiringTable {
            capacity,
            allocated_memory: 0,
            max_memory,
            reads: 0,
            hits: 0,
            writes: 0,
            evictions: 0,
            map: LinkedHashMap::new(),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// The entry expires after **ttl** or never, if **None** is given.
    ///
    /// # Errors
    /// Fails if the given entry alone is larger than **max_memory**.
    pub fn put(&mut self, key: String, value: V, ttl: Option<Duration>) -> anyhow::Result<()> {
        self.insert(key, value, ttl, false)
    }

    fn insert(
        &mut self,
        key: String,
        value: V,
        ttl: Option<Duration>,
        pinned: bool,
    ) -> anyhow::Result<()> {
        let entry = Entry {
            mem_size: key.len() + value.allocated_size(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
            pinned,
            value,
        };

        if entry.mem_size > self.max_memory {
            return Err(anyhow::anyhow!(
                "The entry for '{}' ({} bytes) is larger than the whole table ({} bytes)!",
                key,
                entry.mem_size,
                self.max_memory
            ));
        }

        self.allocated_memory += entry.mem_size;
        if let Some(previous) = self.map.insert(key, entry) {
            self.allocated_memory -= previous.mem_size;
        }

        self.writes += 1;
        self.enforce_constraints();

        Ok(())
    }

    /// Stores the given value only if there is no live entry for the key.
    ///
    /// Returns **true** if the value was stored. The new entry is pinned, so that it is never
    /// evicted due to the size constraints.
    pub fn put_if_absent(
        &mut self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
    ) -> anyhow::Result<bool> {
        if self.live_entry(key).is_some() {
            Ok(false)
        } else {
            self.insert(key.to_owned(), value, ttl, true)?;
            Ok(true)
        }
    }

    fn enforce_constraints(&mut self) {
        while self.map.len() > self.capacity || self.allocated_memory > self.max_memory {
            let victim = self
                .map
                .iter()
                .find(|(_, entry)| !entry.pinned)
                .map(|(key, _)| key.clone());

            match victim.and_then(|key| self.map.remove(&key).map(|entry| (key, entry))) {
                Some((key, entry)) => {
                    self.allocated_memory -= entry.mem_size;
                    self.evictions += 1;
                    log::debug!("Evicted '{}' to make room in the expiring table.", key);
                }
                None => break,
            }
        }
    }

    /// Returns the live entry for the key, dropping it if it has expired.
    fn live_entry(&mut self, key: &str) -> Option<&mut Entry<V>> {
        let now = Instant::now();
        let alive = self.map.get(key).map(|entry| entry.is_alive(now))?;
        if alive {
            self.map.get_refresh(key)
        } else {
            let _ = self.remove(key);
            None
        }
    }

    /// Returns the value stored for the given key unless it is absent or expired.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.reads += 1;
        if self.live_entry(key).is_none() {
            return None;
        }

        self.hits += 1;
        self.map.get(key).map(|entry| &entry.value)
    }

    /// Determines if there is a live entry for the given key.
    ///
    /// In contrast to [get](ExpiringTable::get) this isn't recorded as read.
    pub fn contains(&mut self, key: &str) -> bool {
        self.live_entry(key).is_some()
    }

    /// Resets the expiry of the entry to **ttl** if its value matches the given predicate.
    ///
    /// Returns **true** if the entry was updated.
    pub fn expire_if(
        &mut self,
        key: &str,
        ttl: Option<Duration>,
        predicate: impl FnOnce(&V) -> bool,
    ) -> bool {
        match self.live_entry(key) {
            Some(entry) => {
                let matches = predicate(&entry.value);
                if matches {
                    entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
                }
                matches
            }
            None => false,
        }
    }

    /// Removes the entry if its value matches the given predicate.
    ///
    /// Returns **true** if the entry was removed.
    pub fn remove_if(&mut self, key: &str, predicate: impl FnOnce(&V) -> bool) -> bool {
        let matches = match self.live_entry(key) {
            Some(entry) => predicate(&entry.value),
            None => false,
        };

        matches && self.remove(key)
    }

    /// Removes the entry for the given key.
    ///
    /// Returns **true** if a (possibly expired) entry was present.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.map.remove(key) {
            Some(entry) => {
                self.writes += 1;
                self.allocated_memory -= entry.mem_size;
                true
            }
            None => false,
        }
    }

    /// Returns all live keys which start with the given prefix.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.map
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_alive(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drops all expired entries and returns how many were dropped.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|(_, entry)| !entry.is_alive(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            let _ = self.remove(key);
        }

        expired.len()
    }

    /// Removes all entries and resets all metrics.
    pub fn flush(&mut self) {
        self.map.clear();
        self.allocated_memory = 0;
        self.reads = 0;
        self.hits = 0;
        self.writes = 0;
        self.evictions = 0;
    }

    /// Returns the number of entries, including expired ones which haven't been purged yet.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the table is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the maximal number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the maximal number of entries, evicting entries if necessary.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.enforce_constraints();
    }

    /// Returns the maximal amount of memory to (roughly) occupy.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Changes the maximal amount of memory, evicting entries if necessary.
    pub fn set_max_memory(&mut self, max_memory: usize) {
        self.max_memory = max_memory;
        self.enforce_constraints();
    }

    /// Returns the memory in bytes allocated by keys and values.
    pub fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }

    /// Returns the total number of reads since the last flush.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the number of reads which found a live entry since the last flush.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Returns the total number of writes since the last flush.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the number of entries which were evicted due to the size constraints.
    pub fn evictions(&self) -> usize {
        self.evictions
    }

    /// Returns the hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            n => self.hits as f32 / n as f32 * 100.,
        }
    }
}
