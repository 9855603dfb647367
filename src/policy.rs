use crate::item::{ItemUpdate, StoreItem};

/// Outcome of a cache-policy hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The entry stays valid.
    Keep,
    /// The entry is no longer valid and must be destroyed.
    Reject,
}

/// Keys a policy trimmed while running a hook.
///
/// The store removes them once the hook returns, then re-checks whether the key
/// it was working on still exists.
#[derive(Debug, Default)]
pub struct Evictions {
    keys: Vec<String>,
}

impl Evictions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the store to destroy `key`.
    pub fn push(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    pub fn extend<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        for key in keys {
            self.push(key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.keys)
    }
}

/// A pluggable strategy that intercepts every store access.
///
/// Every hook defaults to a pass-through, so a policy only implements the
/// points it cares about. Hooks run while the store is locked: they must not
/// call back into the store. Report other keys to drop through `evictions`.
pub trait CachePolicy<D, E>: Send + Sync {
    /// A name for tracing.
    ///
    /// # Example
    /// - "lru"
    /// - "moka"
    fn name(&self) -> &'static str;

    /// Called before an existing entry is read.
    fn on_lookup(
        &self,
        _key: &str,
        _item: &StoreItem<D, E>,
        _evictions: &mut Evictions,
    ) -> Verdict {
        Verdict::Keep
    }

    /// Called before a new entry becomes visible. The item may be adjusted in place.
    fn on_insert(
        &self,
        _key: &str,
        _item: &mut StoreItem<D, E>,
        _evictions: &mut Evictions,
    ) -> Verdict {
        Verdict::Keep
    }

    /// Called before a partial update is applied. The pending change may be adjusted in place.
    fn on_update(
        &self,
        _key: &str,
        _item: &StoreItem<D, E>,
        _change: &mut ItemUpdate<D, E>,
        _evictions: &mut Evictions,
    ) -> Verdict {
        Verdict::Keep
    }

    /// Called after the store destroyed `key` for any reason.
    fn on_remove(&self, _key: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evictions_deduplicate() {
        let mut evictions = Evictions::new();
        evictions.push("a");
        evictions.push("a".to_string());
        evictions.extend(vec!["b".to_string(), "a".to_string()]);

        assert_eq!(evictions.len(), 2);
        assert!(evictions.contains("b"));
        assert_eq!(evictions.take(), vec!["a".to_string(), "b".to_string()]);
        assert!(evictions.is_empty());
    }
}
