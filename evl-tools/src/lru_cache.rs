//! Least recently used (LRU) cache
//!
//! A bounded map with least recently used replacement. A HashMap gives
//! fast access by key, the access order is kept in a doubly linked list
//! threaded through a slab of nodes, so no unsafe pointer juggling is
//! needed.

use std::collections::HashMap;
use std::hash::Hash;

/// Interface for getting values on cache misses.
pub trait Cacher<K, V> {
    /// Fetch a value for key on cache miss.
    ///
    /// If no value can be obtained for the given key, None is returned
    /// and the cache is not updated.
    fn fetch(&mut self, key: K) -> Result<Option<V>, anyhow::Error>;
}

const NIL: usize = usize::MAX;

struct CacheNode<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// LRU cache instance.
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    slab: Vec<Option<CacheNode<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Create an LRU cache holding up to `capacity` entries at once.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::with_capacity(capacity),
            slab: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    /// Number of entries in the cache.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` when the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.map.clear();
        self.slab.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Insert or update the entry for `key`, making it the most recently
    /// used one. The least recently used entry is evicted if the cache is
    /// over capacity afterwards.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            self.node_mut(idx).value = value;
            self.unlink(idx);
            self.push_front(idx);
            return;
        }

        let node = CacheNode {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slab[idx] = Some(node);
                idx
            }
            None => {
                self.slab.push(Some(node));
                self.slab.len() - 1
            }
        };

        self.map.insert(key, idx);
        self.push_front(idx);

        if self.map.len() > self.capacity {
            self.pop_tail();
        }
    }

    /// Remove the entry for `key` and return its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        self.free.push(idx);
        self.slab[idx].take().map(|node| node.value)
    }

    /// Get a mutable reference to the value for `key`, making the entry
    /// the most recently used one. None on cache miss.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.map.get(key)?;
        self.unlink(idx);
        self.push_front(idx);
        Some(&mut self.node_mut(idx).value)
    }

    /// Like [`get_mut`](Self::get_mut), but on a miss the cacher's fetch
    /// method provides the value, which is then inserted as the most
    /// recently used entry. Returns None if fetch yields no value.
    pub fn access<'a>(
        &'a mut self,
        key: K,
        cacher: &mut dyn Cacher<K, V>,
    ) -> Result<Option<&'a mut V>, anyhow::Error> {
        if !self.map.contains_key(&key) {
            match cacher.fetch(key.clone())? {
                None => return Ok(None),
                Some(value) => self.insert(key.clone(), value),
            }
        }
        Ok(self.get_mut(&key))
    }

    fn node(&self, idx: usize) -> &CacheNode<K, V> {
        self.slab[idx].as_ref().expect("stale cache slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut CacheNode<K, V> {
        self.slab[idx].as_mut().expect("stale cache slot")
    }

    fn push_front(&mut self, idx: usize) {
        let head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = NIL;
            node.next = head;
        }
        if head != NIL {
            self.node_mut(head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        if prev != NIL {
            self.node_mut(prev).next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.node_mut(next).prev = prev;
        } else {
            self.tail = prev;
        }
        let node = self.node_mut(idx);
        node.prev = NIL;
        node.next = NIL;
    }

    fn pop_tail(&mut self) {
        let tail = self.tail;
        if tail == NIL {
            return;
        }
        self.unlink(tail);
        if let Some(node) = self.slab[tail].take() {
            self.map.remove(&node.key);
        }
        self.free.push(tail);
    }
}
