//! Bounded validation cache
//!
//! Keyed by `(schema_id, sha256(payload))`, stores the verdict so repeated
//! identical payloads skip the validator. Eviction removes the least
//! recently used entry; capacity 0 disables the cache entirely.

use super::Verdict;
use parking_lot::Mutex;
use std::collections::HashMap;

type Key = (String, [u8; 32]);

struct Entry {
    verdict: Verdict,
    last_used: u64,
}

pub struct ValidationCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: HashMap<Key, Entry>,
    clock: u64,
}

impl ValidationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                map: HashMap::with_capacity(capacity.min(1024)),
                clock: 0,
            }),
        }
    }

    pub fn get(&self, schema_id: &str, payload_hash: &[u8; 32]) -> Option<Verdict> {
        if self.capacity == 0 {
            return None;
        }
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner
            .map
            .get_mut(&(schema_id.to_string(), *payload_hash))?;
        entry.last_used = clock;
        Some(entry.verdict.clone())
    }

    pub fn put(&self, schema_id: &str, payload_hash: [u8; 32], verdict: Verdict) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;

        if inner.map.len() >= self.capacity
            && !inner.map.contains_key(&(schema_id.to_string(), payload_hash))
        {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest);
            }
        }

        inner.map.insert(
            (schema_id.to_string(), payload_hash),
            Entry {
                verdict,
                last_used: clock,
            },
        );
    }

    /// Drop every entry belonging to a schema; called on reload.
    pub fn invalidate_schema(&self, schema_id: &str) {
        let mut inner = self.inner.lock();
        inner.map.retain(|(id, _), _| id != schema_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }
}
