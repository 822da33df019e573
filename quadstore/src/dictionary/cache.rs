//! Bounded least-recently-used cache with idle expiry.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Slot<V> {
    value: V,
    tick: u64,
    last_used: Instant,
}

/// Keeps at most `capacity` entries; the least recently used goes first.
pub struct LruCache<K, V> {
    entries: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    next_tick: u64,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    /// A cache of `capacity` entries. Zero disables caching.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            capacity,
        }
    }

    fn touch(&mut self, key: &K) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, key.clone());
        tick
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let old_tick = self.entries.get(key)?.tick;
        self.order.remove(&old_tick);
        let tick = self.touch(key);
        let slot = self.entries.get_mut(key)?;
        slot.tick = tick;
        slot.last_used = Instant::now();
        Some(slot.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.tick);
        }
        let tick = self.touch(&key);
        self.entries.insert(
            key,
            Slot {
                value,
                tick,
                last_used: Instant::now(),
            },
        );
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    /// Drop entries unused for longer than `max_idle`. Returns how many.
    pub fn sweep(&mut self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        let order = &mut self.order;
        self.entries.retain(|_, slot| {
            let keep = now.duration_since(slot.last_used) <= max_idle;
            if !keep {
                order.remove(&slot.tick);
            }
            keep
        });
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
