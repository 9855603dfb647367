//! Fixed-capacity least-recently-used cache.
//!
//! Nodes live in a slot vector and link to each other by index, so the list
//! never hands out references that could outlive a `get`/`set` call. The
//! forward map resolves `key -> slot`; each node keeps its own key, which is
//! what the tail eviction reports back to the caller.
//!
//! ```text
//!   head ──► [D] ◄──► [A] ◄──► [B] ◄── tail
//!            MRU                LRU
//! ```

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Default capacity used by [`crate::policies::LruPolicy`].
pub const DEFAULT_CAPACITY: usize = 5_000;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Least-recently-used cache with O(1) `get`/`set`.
///
/// Inserting a new key beyond `capacity` detaches the tail and reports its key
/// through the trim callback before `set` returns. A capacity of `0` keeps
/// nothing: the key that was just inserted is the one trimmed.
pub struct LruCache<K, V> {
    lookup: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    capacity: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create an empty cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        LruCache {
            lookup: HashMap::with_capacity(capacity.min(1024)),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            capacity,
        }
    }

    /// Return the value for `key` and mark it most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.lookup.get(key)?;
        self.detach(idx);
        self.prepend(idx);
        self.node(idx).map(|node| &node.value)
    }

    /// Return the value for `key` without touching recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = *self.lookup.get(key)?;
        self.node(idx).map(|node| &node.value)
    }

    /// Whether `key` is present. Does not touch recency.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lookup.contains_key(key)
    }

    /// Insert or overwrite `key`, returning the key evicted by this call, if any.
    pub fn set(&mut self, key: K, value: V) -> Option<K> {
        let mut evicted = None;
        self.set_with_trim(key, value, |k| evicted = Some(k.clone()));
        evicted
    }

    /// Insert or overwrite `key`, calling `on_trim` with the evicted key when the
    /// insert pushed the cache over capacity.
    pub fn set_with_trim<F>(&mut self, key: K, value: V, on_trim: F)
    where
        F: FnOnce(&K),
    {
        if let Some(&idx) = self.lookup.get(&key) {
            self.detach(idx);
            self.prepend(idx);
            if let Some(node) = self.node_mut(idx) {
                node.value = value;
            }
            return;
        }

        let idx = self.alloc(Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.lookup.insert(key, idx);
        self.len += 1;
        self.prepend(idx);

        if self.len > self.capacity
            && let Some((evicted, _)) = self.pop_tail()
        {
            on_trim(&evicted);
        }
    }

    /// Remove `key`, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.lookup.remove(key)?;
        self.detach(idx);
        self.len -= 1;
        self.release(idx).map(|node| node.value)
    }

    /// All keys, most recently used first.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(node) = self.node(idx) else { break };
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry without invoking any trim callback.
    pub fn clear(&mut self) {
        self.lookup.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    fn pop_tail(&mut self) -> Option<(K, V)> {
        let idx = self.tail?;
        self.detach(idx);
        let node = self.release(idx)?;
        self.lookup.remove(&node.key);
        self.len -= 1;
        Some((node.key, node.value))
    }

    fn alloc(&mut self, node: Node<K, V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Option<Node<K, V>> {
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        Some(node)
    }

    fn node(&self, idx: usize) -> Option<&Node<K, V>> {
        self.slots.get(idx).and_then(|slot| slot.as_ref())
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K, V>> {
        self.slots.get_mut(idx).and_then(|slot| slot.as_mut())
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.node(idx) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None if self.head == Some(idx) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None if self.tail == Some(idx) => self.tail = prev,
            None => {}
        }

        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn prepend(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(node) = self.node_mut(h) {
                    node.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }
}

impl<K, V> Default for LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<K, V> fmt::Debug for LruCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("keys", &self.keys())
            .finish()
    }
}
