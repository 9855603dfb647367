use moka::notification::RemovalCause;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::item::StoreItem;
use crate::policy::{CachePolicy, Evictions, Verdict};

/// Configuration for MokaPolicy.
#[derive(Debug, Clone)]
pub struct MokaPolicyConfig {
    /// Maximum number of keys the store may hold.
    pub max_capacity: u64,

    /// Time to live: keys are dropped after this duration from insertion.
    /// `None` means keys never expire based on time (only by size limit).
    pub time_to_live: Option<Duration>,

    /// Time to idle: keys are dropped if not looked up within this duration.
    /// `None` means keys don't expire based on idle time.
    pub time_to_idle: Option<Duration>,
}

impl Default for MokaPolicyConfig {
    fn default() -> Self {
        MokaPolicyConfig {
            max_capacity: 10_000,
            time_to_live: None,
            time_to_idle: None,
        }
    }
}

/// Size- and time-bounded cache policy backed by Moka.
///
/// Moka decides admission and eviction on its own schedule, so evictions are
/// observed lazily: keys Moka dropped are reported on the next hook call, and a
/// lookup of a key Moka no longer holds is rejected.
pub struct MokaPolicy {
    cache: Cache<String, ()>,
    evicted: Arc<Mutex<Vec<String>>>,
}

impl MokaPolicy {
    /// Create a new MokaPolicy with the given configuration.
    ///
    /// # Example
    /// ```ignore
    /// let config = MokaPolicyConfig {
    ///     max_capacity: 10_000,
    ///     time_to_live: Some(Duration::from_secs(300)),
    ///     time_to_idle: Some(Duration::from_secs(60)),
    /// };
    /// let policy = MokaPolicy::new(config);
    /// ```
    pub fn new(config: MokaPolicyConfig) -> Self {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);

        let mut builder = Cache::builder()
            .max_capacity(config.max_capacity)
            .eviction_listener(move |key: Arc<String>, _value: (), cause: RemovalCause| {
                if cause.was_evicted() {
                    sink.lock().push(key.as_ref().clone());
                }
            });

        if let Some(ttl) = config.time_to_live {
            builder = builder.time_to_live(ttl);
        }

        if let Some(tti) = config.time_to_idle {
            builder = builder.time_to_idle(tti);
        }

        MokaPolicy {
            cache: builder.build(),
            evicted,
        }
    }

    /// Get cache statistics (for monitoring/debugging).
    pub fn stats(&self) -> (u64, u64) {
        let entry_count = self.cache.entry_count();
        let weighted_size = self.cache.weighted_size();
        (entry_count, weighted_size)
    }

    /// Run Moka's pending maintenance so that evictions become observable.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    fn drain_evicted(&self, evictions: &mut Evictions) {
        let drained: Vec<String> = std::mem::take(&mut *self.evicted.lock());
        if !drained.is_empty() {
            tracing::trace!(count = drained.len(), "moka evicted keys");
        }
        evictions.extend(drained);
    }
}

impl Default for MokaPolicy {
    fn default() -> Self {
        Self::new(MokaPolicyConfig::default())
    }
}

impl<D, E> CachePolicy<D, E> for MokaPolicy {
    fn name(&self) -> &'static str {
        "moka"
    }

    fn on_lookup(&self, key: &str, _item: &StoreItem<D, E>, evictions: &mut Evictions) -> Verdict {
        self.drain_evicted(evictions);
        match self.cache.get(key) {
            Some(()) => Verdict::Keep,
            None => Verdict::Reject,
        }
    }

    fn on_insert(
        &self,
        key: &str,
        _item: &mut StoreItem<D, E>,
        evictions: &mut Evictions,
    ) -> Verdict {
        self.cache.insert(key.to_string(), ());
        self.cache.run_pending_tasks();
        self.drain_evicted(evictions);
        Verdict::Keep
    }

    fn on_remove(&self, key: &str) {
        self.cache.invalidate(key);
    }
}
