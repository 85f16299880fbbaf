//! In-process (L1) tier mirroring hot keys.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics;
use crate::pattern::KeyPattern;

/// A mirrored value with its own expiry bookkeeping.
///
/// The expiry is computed from the same TTL sent to the backend, after the
/// backend accepted the write, so it never outlives the remote copy.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expires_at: ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| Instant::now() + ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Bounded map of raw (serialized) values owned by one `CacheClient`.
#[derive(Debug)]
pub struct LocalCacheTier {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
}

impl LocalCacheTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Fresh raw value for `key`; expired entries are dropped on the way.
    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn contains_fresh(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&self, key: &str, value: String, ttl: Option<Duration>) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }
        self.entries
            .insert(key.to_string(), CacheEntry::new(key, value, ttl));
        metrics::set_cache_entries("local", self.entries.len());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict every entry matching a glob pattern, returning how many went.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let pattern = KeyPattern::new(pattern);
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.matches(key));
        let removed = before.saturating_sub(self.entries.len());
        metrics::set_cache_entries("local", self.entries.len());
        removed
    }

    /// Track a backend increment: the local copy takes the backend's result
    /// if present and numeric, otherwise it is dropped to force a re-fetch.
    pub fn apply_incr(&self, key: &str, new_value: i64) {
        let keep = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() && entry.value.parse::<i64>().is_ok() => {
                entry.value = new_value.to_string();
                true
            }
            Some(_) => false,
            None => return,
        };
        if !keep {
            self.entries.remove(key);
        }
    }

    /// Align the local expiry with a new remote TTL.
    pub fn apply_expire(&self, key: &str, ttl: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        metrics::set_cache_entries("local", 0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Purge expired entries; if still full, evict an arbitrary one.
    fn make_room(&self) {
        self.entries.retain(|_, e| !e.is_expired());
        if self.entries.len() >= self.max_entries {
            if let Some(victim) = self.entries.iter().next().map(|e| e.key().clone()) {
                self.entries.remove(&victim);
                tracing::debug!(key = %victim, "Evicted entry from local cache");
            }
        }
    }
}
