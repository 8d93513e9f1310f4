//! Fixed-capacity least-recently-used cache.
//!
//! Entries live in an arena of slots addressed by stable indices. Each slot
//! carries `older`/`newer` links so promotion, insertion and eviction are all
//! O(1); a key→slot map gives direct access and vacated slots are recycled
//! through a free list.
//!
//! ```text
//!    head (oldest)                                 tail (newest)
//!     ┌─────┐ newer ┌─────┐ newer ┌─────┐ newer ┌─────┐
//!     │  A  │ ────▶ │  B  │ ────▶ │  C  │ ────▶ │  D  │
//!     └─────┘ ◀──── └─────┘ ◀──── └─────┘ ◀──── └─────┘
//!              older         older         older
//!  evicted ◀──────────────────────────────────────── added
//! ```
//!
//! The cache is not synchronised; callers share it behind a lock.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// Sentinel index for "no slot".
const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Slot<K, V> {
    key: K,
    value: V,
    older: usize,
    newer: usize,
}

/// Least-recently-used cache with a fixed capacity.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns true if `key` is cached, without touching recency.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Looks up `key` and marks it as most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let idx = *self.index.get(key)?;
        if idx != self.tail {
            self.detach(idx);
            self.attach_newest(idx);
        }
        Some(&self.slot(idx).value)
    }

    /// Looks up `key` without registering a use.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let idx = *self.index.get(key)?;
        Some(&self.slot(idx).value)
    }

    /// Inserts or updates `key`.
    ///
    /// Updating an existing key replaces its value and promotes it without
    /// consuming capacity. Inserting a new key into a full cache evicts the
    /// least recently used entry, which is returned.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.index.get(&key) {
            self.slot_mut(idx).value = value;
            if idx != self.tail {
                self.detach(idx);
                self.attach_newest(idx);
            }
            return None;
        }

        if self.capacity == 0 {
            return Some((key, value));
        }

        let evicted = if self.index.len() >= self.capacity {
            self.pop_oldest()
        } else {
            None
        };

        let slot = Slot {
            key: key.clone(),
            value,
            older: NIL,
            newer: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                debug_assert!(self.slots[idx].is_none(), "free slot {idx} is occupied");
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.attach_newest(idx);

        debug_assert!(self.index.len() <= self.capacity);
        evicted
    }

    /// Removes `key` and returns its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let idx = self.index.remove(key)?;
        self.detach(idx);
        let slot = self.take_slot(idx);
        Some(slot.value)
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.detach(idx);
        let slot = self.take_slot(idx);
        self.index.remove(&slot.key);
        Some((slot.key, slot.value))
    }

    /// Drops every entry.
    pub fn remove_all(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Iterates entries from oldest to newest.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cache: self,
            cursor: self.head,
        }
    }

    /// Iterates keys from oldest to newest.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    fn slot(&self, idx: usize) -> &Slot<K, V> {
        match self.slots.get(idx) {
            Some(Some(slot)) => slot,
            _ => panic!("lru cache corrupted: slot {idx} is vacant"),
        }
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot<K, V> {
        match self.slots.get_mut(idx) {
            Some(Some(slot)) => slot,
            _ => panic!("lru cache corrupted: slot {idx} is vacant"),
        }
    }

    fn take_slot(&mut self, idx: usize) -> Slot<K, V> {
        match self.slots.get_mut(idx).and_then(Option::take) {
            Some(slot) => {
                self.free.push(idx);
                slot
            }
            None => panic!("lru cache corrupted: slot {idx} is vacant"),
        }
    }

    /// Unlinks `idx` from the recency list, leaving it unlinked.
    fn detach(&mut self, idx: usize) {
        let (older, newer) = {
            let slot = self.slot(idx);
            (slot.older, slot.newer)
        };

        if older == NIL {
            debug_assert_eq!(self.head, idx);
            self.head = newer;
        } else {
            self.slot_mut(older).newer = newer;
        }

        if newer == NIL {
            debug_assert_eq!(self.tail, idx);
            self.tail = older;
        } else {
            self.slot_mut(newer).older = older;
        }

        let slot = self.slot_mut(idx);
        slot.older = NIL;
        slot.newer = NIL;
    }

    /// Links an unlinked `idx` in as the newest entry.
    fn attach_newest(&mut self, idx: usize) {
        let old_tail = self.tail;
        {
            let slot = self.slot_mut(idx);
            debug_assert!(slot.older == NIL && slot.newer == NIL);
            slot.older = old_tail;
        }

        if old_tail == NIL {
            self.head = idx;
        } else {
            self.slot_mut(old_tail).newer = idx;
        }
        self.tail = idx;
    }
}

/// Iterator over cache entries, oldest first.
pub struct Iter<'a, K, V> {
    cache: &'a LruCache<K, V>,
    cursor: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Eq + Hash + Clone,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let slot = self.cache.slot(self.cursor);
        self.cursor = slot.newer;
        Some((&slot.key, &slot.value))
    }
}
