use parking_lot::Mutex;

use crate::item::StoreItem;
use crate::lru::{DEFAULT_CAPACITY, LruCache};
use crate::policy::{CachePolicy, Evictions, Verdict};

/// Keeps at most `capacity` keys in the store, evicting the least recently used.
///
/// Every lookup refreshes recency; every insert beyond capacity trims the tail
/// key from the store before the insert returns.
pub struct LruPolicy {
    lru: Mutex<LruCache<String, ()>>,
}

impl LruPolicy {
    /// Create a new LruPolicy holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        LruPolicy {
            lru: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lru.lock().capacity()
    }

    /// Tracked keys, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        self.lru.lock().keys()
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<D, E> CachePolicy<D, E> for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn on_lookup(&self, key: &str, _item: &StoreItem<D, E>, _evictions: &mut Evictions) -> Verdict {
        match self.lru.lock().get(key) {
            Some(_) => Verdict::Keep,
            None => Verdict::Reject,
        }
    }

    fn on_insert(
        &self,
        key: &str,
        _item: &mut StoreItem<D, E>,
        evictions: &mut Evictions,
    ) -> Verdict {
        self.lru
            .lock()
            .set_with_trim(key.to_string(), (), |trimmed| evictions.push(trimmed.as_str()));
        Verdict::Keep
    }

    fn on_remove(&self, key: &str) {
        self.lru.lock().remove(key);
    }
}
