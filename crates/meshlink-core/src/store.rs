//! Keyed store with per-entry expiry
//!
//! [`TtlStore`] backs every short-lived piece of gateway state: seen packet
//! ids, conversation states, pending one-time codes and cached device
//! records. Entries expire independently of insertion order. Expiry is
//! passive (checked on access) with an explicit [`TtlStore::purge_expired`]
//! sweep for housekeeping.
//!
//! An optional capacity bounds memory; when it is reached the least recently
//! used entry is evicted, which never shortens the lifetime of a live entry
//! below its TTL unless the store is genuinely full.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Thread-safe keyed store with per-entry time-to-live
#[derive(Debug)]
pub struct TtlStore<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, Entry<V>>>,
    default_ttl: Duration,
}

impl<K, V> TtlStore<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create an unbounded store
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            default_ttl,
        }
    }

    /// Create a store holding at most `capacity` entries
    pub fn with_capacity(capacity: usize, default_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            default_ttl,
        }
    }

    /// The TTL applied by [`TtlStore::insert`]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert or replace a value with the default TTL
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Insert or replace a value with an explicit TTL
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key, entry);
    }

    /// Insert only if no live entry exists for `key`
    ///
    /// Returns `true` when the value was inserted. The check and the insert
    /// happen under one lock so concurrent callers see exactly one winner.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            if !entry.is_expired(now) {
                return false;
            }
        }
        entries.put(
            key,
            Entry {
                value,
                expires_at: now + self.default_ttl,
            },
        );
        true
    }

    /// Get a clone of a live value, dropping it if it has expired
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Mutate a live value in place without touching its expiry
    ///
    /// Returns `None` if there is no live entry for `key`.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => return Some(f(&mut entry.value)),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Remove an entry, returning its value if it was still live
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .lock()
            .pop(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value)
    }

    /// Check for a live entry
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Number of stored entries, including ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_insert_and_expire() {
        let store = TtlStore::new(Duration::from_secs(10));
        store.insert("a", 1);
        assert_eq!(store.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get(&"a"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_independently() {
        let store = TtlStore::new(Duration::from_secs(60));
        store.insert_with_ttl("short", 1, Duration::from_secs(5));
        store.insert("long", 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get(&"short"), None);
        assert_eq!(store.get(&"long"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_if_absent() {
        let store = TtlStore::new(Duration::from_secs(30));
        assert!(store.insert_if_absent(7u32, ()));
        assert!(!store.insert_if_absent(7u32, ()));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.insert_if_absent(7u32, ()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_keeps_expiry() {
        let store = TtlStore::new(Duration::from_secs(10));
        store.insert("k", 0u32);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.update(&"k", |v| {
            *v += 1;
            *v
        }), Some(1));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.update(&"k", |v| *v), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = TtlStore::new(Duration::from_secs(10));
        store.insert(1, "a");
        store.insert(2, "b");
        store.insert_with_ttl(3, "c", Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.len(), 3);
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let store = TtlStore::with_capacity(2, Duration::from_secs(60));
        store.insert(1, ());
        store.insert(2, ());
        store.insert(3, ());
        assert_eq!(store.len(), 2);
        assert!(!store.contains(&1));
        assert!(store.contains(&3));
    }

    #[test]
    fn test_remove() {
        let store = TtlStore::new(Duration::from_secs(60));
        store.insert("x", 5);
        assert_eq!(store.remove(&"x"), Some(5));
        assert_eq!(store.remove(&"x"), None);
    }
}
