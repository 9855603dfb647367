//! The authoritative per-key state container.
//!
//! Every operation takes the state lock for its whole read-modify-write, so
//! observers never see a partially applied update. Change notifications are
//! delivered after the lock is released, and are deferred and de-duplicated
//! while a [`Store::batch`] is open.

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

use crate::item::{ItemUpdate, StoreItem};
use crate::policy::{CachePolicy, Evictions, Verdict};
use crate::revalidate::Flights;

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_key: HashMap<String, Vec<(u64, Listener)>>,
    all: Vec<(u64, Listener)>,
}

impl Listeners {
    fn matching(&self, key: &str) -> Vec<Listener> {
        let keyed = self.by_key.get(key).into_iter().flatten();
        keyed
            .chain(self.all.iter())
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

/// Keeps a store listener registered until dropped.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    listeners: Weak<Mutex<Listeners>>,
    key: Option<String>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };
        let mut listeners = listeners.lock();
        match &self.key {
            Some(key) => {
                if let Some(entries) = listeners.by_key.get_mut(key) {
                    entries.retain(|(id, _)| *id != self.id);
                    if entries.is_empty() {
                        listeners.by_key.remove(key);
                    }
                }
            }
            None => listeners.all.retain(|(id, _)| *id != self.id),
        }
    }
}

/// Result of trying to claim a key for a fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The caller owns the key until it commits or releases this attempt id.
    Owned(u64),
    /// Another attempt is in flight.
    InFlight,
    /// The key is disabled or a cache policy refused the entry.
    Refused,
}

struct StoreState<D, E> {
    items: HashMap<String, StoreItem<D, E>>,
    batch_depth: usize,
    pending: Vec<String>,
}

/// Process-wide map of keys to [`StoreItem`]s, guarded by a chain of cache policies.
///
/// Construct one per application and share it behind an `Arc`.
pub struct Store<D, E> {
    state: Mutex<StoreState<D, E>>,
    listeners: Arc<Mutex<Listeners>>,
    policies: Vec<Arc<dyn CachePolicy<D, E>>>,
    flights: Flights<D, E>,
    next_attempt: AtomicU64,
}

impl<D, E> Store<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a store without any cache policy: entries live until removed.
    pub fn new() -> Self {
        Self::with_policies(Vec::new())
    }

    /// Create a store guarded by a single cache policy.
    pub fn with_policy(policy: Arc<dyn CachePolicy<D, E>>) -> Self {
        Self::with_policies(vec![policy])
    }

    /// Create a store guarded by a chain of cache policies.
    ///
    /// Policies run in order; the first `Reject` wins.
    pub fn with_policies(policies: Vec<Arc<dyn CachePolicy<D, E>>>) -> Self {
        Store {
            state: Mutex::new(StoreState {
                items: HashMap::new(),
                batch_depth: 0,
                pending: Vec::new(),
            }),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            policies,
            flights: Flights::default(),
            next_attempt: AtomicU64::new(1),
        }
    }

    /// Return the item for `key`, or an empty item with `exists == false`.
    ///
    /// Runs the policies' `on_lookup` hooks first; a rejected entry is destroyed
    /// and the empty item is returned. An empty key is treated as disabled.
    pub fn lookup_or_default(&self, key: &str) -> StoreItem<D, E> {
        if key.is_empty() {
            return StoreItem::empty();
        }

        let mut state = self.state.lock();
        let mut touched = Vec::new();
        let item = if self.lookup_locked(&mut state, key, &mut touched) {
            state.items.get(key).cloned().unwrap_or_default()
        } else {
            StoreItem::empty()
        };
        self.finish(state, touched);
        item
    }

    /// Return the item for `key` without running any policy hook.
    pub fn peek(&self, key: &str) -> StoreItem<D, E> {
        self.state
            .lock()
            .items
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `key` is materialized. Does not run any policy hook.
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().items.contains_key(key)
    }

    /// Merge `partial` into the item for `key`, creating the item first if needed.
    pub fn update(&self, key: &str, partial: ItemUpdate<D, E>) {
        self.modify(key, true, |_| Some(partial));
    }

    /// Like [`Store::update`], computing the partial from the current item under the lock.
    pub fn update_with<F>(&self, key: &str, f: F)
    where
        F: FnOnce(&StoreItem<D, E>) -> ItemUpdate<D, E>,
    {
        self.modify(key, true, |item| Some(f(item)));
    }

    /// Mutate the current `data` of `key` in place, creating the item first if needed.
    ///
    /// Nothing is written when the key has no data yet. Observers are only
    /// notified when the draft actually changed the payload.
    pub fn update_data_produce<F>(&self, key: &str, producer: F)
    where
        F: FnOnce(&mut D),
    {
        if key.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        let mut touched = Vec::new();
        let mut change = ItemUpdate::new();
        if self.prepare_locked(&mut state, key, true, &mut change, &mut touched) {
            let changed = match state.items.get_mut(key) {
                Some(item) => {
                    let mut changed = change.apply_to(item);
                    match item.data.as_mut() {
                        Some(data) => {
                            let before = data.clone();
                            producer(data);
                            changed |= *data != before;
                        }
                        None => tracing::trace!(key = %key, "no data to produce on"),
                    }
                    changed
                }
                None => false,
            };
            if changed {
                touched.push(key.to_string());
            }
        }
        self.finish(state, touched);
    }

    /// Register one more consumer of `key`.
    pub fn mount(&self, key: &str) {
        self.modify(key, true, |item| {
            Some(ItemUpdate::new().mounted_count(item.mounted_count + 1))
        });
    }

    /// Release one consumer of `key`; the count never drops below zero.
    pub fn unmount(&self, key: &str) {
        self.modify(key, false, |item| {
            Some(ItemUpdate::new().mounted_count(item.mounted_count.saturating_sub(1)))
        });
    }

    /// Destroy the item for `key`.
    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        let mut touched = Vec::new();
        self.destroy_locked(&mut state, key, &mut touched);
        self.finish(state, touched);
    }

    /// All materialized keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().items.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Run `f` with change notifications held back until the outermost batch ends.
    ///
    /// Each changed key is then reported once.
    pub fn batch<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.state.lock().batch_depth += 1;
        let _guard = BatchGuard { store: self };
        f()
    }

    /// Call `listener` after every committed change to `key`.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners
            .by_key
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            key: Some(key.to_string()),
            id,
        }
    }

    /// Call `listener` after every committed change to any key.
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.all.push((id, Arc::new(listener)));

        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            key: None,
            id,
        }
    }

    /// Wait until `key` has no fetch in flight.
    pub async fn wait_idle(&self, key: &str) {
        let notify = Arc::new(Notify::new());
        let _subscription = {
            let notify = Arc::clone(&notify);
            self.subscribe(key, move |_| notify.notify_waiters())
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.peek(key).is_busy {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn flights(&self) -> &Flights<D, E> {
        &self.flights
    }

    /// A fresh attempt id, never zero.
    pub(crate) fn next_attempt(&self) -> u64 {
        self.next_attempt.fetch_add(1, Ordering::Relaxed)
    }

    /// Atomically claim `key` for `attempt`: clear the error and mark it busy
    /// and loading.
    pub(crate) fn try_begin(&self, key: &str, attempt: u64) -> Claim {
        let mut in_flight = false;
        let began = self.modify(key, true, |item| {
            if item.is_busy {
                in_flight = true;
                return None;
            }
            Some(
                ItemUpdate::new()
                    .clear_err()
                    .busy(true)
                    .loading(true)
                    .owned_by(attempt),
            )
        });

        match (began, in_flight) {
            (true, _) => Claim::Owned(attempt),
            (false, true) => Claim::InFlight,
            (false, false) => Claim::Refused,
        }
    }

    /// Commit the result of `attempt` unless a different attempt owns the key.
    pub(crate) fn commit<F>(&self, key: &str, attempt: u64, f: F) -> bool
    where
        F: FnOnce(&StoreItem<D, E>) -> ItemUpdate<D, E>,
    {
        self.modify(key, true, |item| {
            (item.busy_owner == 0 || item.busy_owner == attempt).then(|| f(item))
        })
    }

    /// Clear the busy and loading flags if `attempt` still owns the key.
    pub(crate) fn release(&self, key: &str, attempt: u64) -> bool {
        self.modify(key, false, |item| {
            (item.busy_owner == attempt).then(|| ItemUpdate::new().busy(false).loading(false))
        })
    }

    /// Shared update path. Returns whether `f` produced a change that was applied.
    fn modify<F>(&self, key: &str, create: bool, f: F) -> bool
    where
        F: FnOnce(&StoreItem<D, E>) -> Option<ItemUpdate<D, E>>,
    {
        if key.is_empty() {
            return false;
        }

        let mut state = self.state.lock();
        let mut touched = Vec::new();

        let exists = if create {
            self.make_exist_locked(&mut state, key, &mut touched)
        } else {
            self.lookup_locked(&mut state, key, &mut touched)
        };
        let change = match state.items.get(key) {
            Some(item) if exists => f(item),
            _ => None,
        };
        let Some(mut change) = change else {
            self.finish(state, touched);
            return false;
        };

        let mut applied = false;
        if self.prepare_locked(&mut state, key, false, &mut change, &mut touched)
            && let Some(item) = state.items.get_mut(key)
        {
            applied = true;
            if change.apply_to(item) {
                touched.push(key.to_string());
            }
        }

        self.finish(state, touched);
        applied
    }

    /// Run the `on_update` hooks (after materializing the entry when `create` is set).
    /// Returns whether the entry still exists afterwards.
    fn prepare_locked(
        &self,
        state: &mut StoreState<D, E>,
        key: &str,
        create: bool,
        change: &mut ItemUpdate<D, E>,
        touched: &mut Vec<String>,
    ) -> bool {
        if create && !self.make_exist_locked(state, key, touched) {
            return false;
        }
        let Some(item) = state.items.get(key) else {
            return false;
        };

        let mut evictions = Evictions::new();
        let mut verdict = Verdict::Keep;
        for policy in &self.policies {
            verdict = policy.on_update(key, item, change, &mut evictions);
            if verdict == Verdict::Reject {
                tracing::trace!(key = %key, policy = policy.name(), "update rejected");
                break;
            }
        }

        if verdict == Verdict::Reject {
            self.destroy_locked(state, key, touched);
        }
        self.evict_locked(state, &mut evictions, touched);
        state.items.contains_key(key)
    }

    /// Run the `on_lookup` hooks on an existing entry. Returns whether it survived.
    fn lookup_locked(
        &self,
        state: &mut StoreState<D, E>,
        key: &str,
        touched: &mut Vec<String>,
    ) -> bool {
        let Some(item) = state.items.get(key) else {
            return false;
        };

        let mut evictions = Evictions::new();
        let mut verdict = Verdict::Keep;
        for policy in &self.policies {
            verdict = policy.on_lookup(key, item, &mut evictions);
            if verdict == Verdict::Reject {
                tracing::trace!(key = %key, policy = policy.name(), "lookup rejected");
                break;
            }
        }

        if verdict == Verdict::Reject {
            self.destroy_locked(state, key, touched);
        }
        self.evict_locked(state, &mut evictions, touched);
        state.items.contains_key(key)
    }

    /// Make sure `key` is materialized, running the `on_insert` hooks for a new entry.
    /// Returns whether the entry exists afterwards.
    fn make_exist_locked(
        &self,
        state: &mut StoreState<D, E>,
        key: &str,
        touched: &mut Vec<String>,
    ) -> bool {
        if self.lookup_locked(state, key, touched) {
            return true;
        }

        let mut item = StoreItem::materialized();
        let mut evictions = Evictions::new();
        for policy in &self.policies {
            if policy.on_insert(key, &mut item, &mut evictions) == Verdict::Reject {
                tracing::trace!(key = %key, policy = policy.name(), "insert rejected");
                for policy in &self.policies {
                    policy.on_remove(key);
                }
                self.evict_locked(state, &mut evictions, touched);
                return false;
            }
        }

        state.items.insert(key.to_string(), item);
        touched.push(key.to_string());
        self.evict_locked(state, &mut evictions, touched);
        state.items.contains_key(key)
    }

    fn evict_locked(
        &self,
        state: &mut StoreState<D, E>,
        evictions: &mut Evictions,
        touched: &mut Vec<String>,
    ) {
        for key in evictions.take() {
            tracing::trace!(key = %key, "evicting");
            self.destroy_locked(state, &key, touched);
        }
    }

    fn destroy_locked(&self, state: &mut StoreState<D, E>, key: &str, touched: &mut Vec<String>) {
        if state.items.remove(key).is_some() {
            touched.push(key.to_string());
        }
        for policy in &self.policies {
            policy.on_remove(key);
        }
    }

    /// Release the lock and deliver (or queue) notifications for `touched` keys.
    fn finish(&self, mut state: MutexGuard<'_, StoreState<D, E>>, touched: Vec<String>) {
        if touched.is_empty() {
            return;
        }

        if state.batch_depth > 0 {
            for key in touched {
                if !state.pending.contains(&key) {
                    state.pending.push(key);
                }
            }
            return;
        }

        drop(state);
        self.notify(dedup(touched));
    }

    fn notify(&self, keys: Vec<String>) {
        for key in keys {
            let listeners = self.listeners.lock().matching(&key);
            for listener in listeners {
                listener(&key);
            }
        }
    }
}

impl<D, E> Store<D, E>
where
    D: Clone + PartialEq + Serialize + Send + Sync + 'static,
    E: Clone + Serialize + Send + Sync + 'static,
{
    /// Dump every materialized item as JSON, keyed by store key.
    pub fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        let state = self.state.lock();
        let items: BTreeMap<&String, &StoreItem<D, E>> = state.items.iter().collect();
        serde_json::to_value(items)
    }
}

impl<D, E> Default for Store<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct BatchGuard<'a, D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    store: &'a Store<D, E>,
}

impl<D, E> Drop for BatchGuard<'_, D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let pending = {
            let mut state = self.store.state.lock();
            state.batch_depth = state.batch_depth.saturating_sub(1);
            if state.batch_depth > 0 {
                return;
            }
            std::mem::take(&mut state.pending)
        };
        self.store.notify(pending);
    }
}

fn dedup(keys: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys {
        if !unique.contains(&key) {
            unique.push(key);
        }
    }
    unique
}
