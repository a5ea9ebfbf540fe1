//! Cache (C13): in-memory TTL map for enhanced queries and result sets.
//!
//! Bounded by `cache.max_entries`; eviction is expired-on-read plus
//! least-recently-used once the cap is hit. Process-local, lock-guarded,
//! never persisted, and disabled outright in the `Testing` environment so
//! test runs never observe stale cross-test state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{CacheConfig, Environment};

struct Entry {
    value: String,
    expires_at: Instant,
    last_accessed: Instant,
}

pub struct Cache {
    enabled: bool,
    max_entries: usize,
    default_ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Cache {
    pub fn new(config: &CacheConfig, environment: Environment) -> Self {
        Self {
            enabled: config.enabled && environment != Environment::Testing,
            max_entries: config.max_entries.max(1),
            default_ttl: Duration::from_secs(config.default_ttl_s),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up `key`, returning `None` on a miss or an expired entry
    /// (expired entries are dropped as a side effect of the lookup).
    pub fn get(&self, key: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, value: String) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: String, value: String, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let now = Instant::now();

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            evict_lru(&mut entries);
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }
}

fn evict_lru(entries: &mut HashMap<String, Entry>) {
    if let Some(oldest) = entries
        .iter()
        .min_by_key(|(_, e)| e.last_accessed)
        .map(|(k, _)| k.clone())
    {
        entries.remove(&oldest);
    }
}
