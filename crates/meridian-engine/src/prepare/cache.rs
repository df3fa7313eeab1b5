//! # In-Process TTL + LRU Cache
//!
//! One cache implementation serves four roles: the prepared-input
//! cache, the compiled-rule cache, the L1 result cache, and the
//! idempotency cache.
//!
//! ## Thread Safety
//! The map lives behind a `Mutex` because:
//! 1. Multiple request tasks read and write concurrently
//! 2. Only one writer may touch an entry at a time
//! 3. Every operation is short (no I/O under the lock)
//!
//! ## Policy
//! - Entries expire `ttl` after insertion (reads never refresh the TTL)
//! - At `capacity`, the least-recently-*used* entry is evicted
//! - Values are handed out by clone; callers store `Arc<T>` so a clone
//!   is pointer-sized

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted: Instant,
    touched: Instant,
}

/// A bounded TTL cache with LRU eviction.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl: Duration,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    /// Creates a cache holding at most `capacity` entries for `ttl`.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        TtlCache {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Fetches a live entry and marks it used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_with_age(key).map(|(value, _)| value)
    }

    /// Fetches a live entry along with its age since insertion. The
    /// delta optimiser uses the age for its rebuild decision.
    pub fn get_with_age(&self, key: &K) -> Option<(V, Duration)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        match entries.get_mut(key) {
            None => None,
            Some(entry) if now.duration_since(entry.inserted) > self.ttl => {
                entries.remove(key);
                None
            }
            Some(entry) => {
                entry.touched = now;
                Some((entry.value.clone(), now.duration_since(entry.inserted)))
            }
        }
    }

    /// Inserts or replaces an entry, evicting the least-recently-used
    /// entry if the cache is full.
    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        // Drop expired entries first; they are free capacity.
        let ttl = self.ttl;
        entries.retain(|_, entry| now.duration_since(entry.inserted) <= ttl);

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(lru) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru);
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted: now,
                touched: now,
            },
        );
    }

    /// Removes an entry.
    pub fn remove(&self, key: &K) {
        self.entries.lock().expect("cache lock poisoned").remove(key);
    }

    /// Number of entries, counting expired-but-unswept ones.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
