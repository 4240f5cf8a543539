//! Bounded cache of decoded data blocks.
//!
//! Table reads go through this cache keyed by `(file_number, block_offset)`,
//! so hot blocks are decoded once and table files are not re-read for
//! repeated point lookups. Eviction uses the S3-FIFO scheme: new entries
//! enter a small probationary queue, entries that get re-referenced are
//! promoted to the main queue, and a ghost list of recently evicted keys
//! lets a returning block skip probation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::sstable::block::Block;

const MAX_FREQUENCY: u8 = 3;

struct Entry<K, V> {
    key: K,
    value: V,
    freq: AtomicU8,
}

/// Generic bounded cache. Not thread-safe on its own; [`BlockCache`] wraps
/// it in a mutex.
struct Cache<K, V>
where
    K: PartialEq + Eq + std::hash::Hash + Clone,
    V: Clone,
{
    capacity: usize,
    main_capacity: usize,
    /// New entries land here first.
    small: VecDeque<Arc<Entry<K, V>>>,
    /// Entries re-referenced while in `small` graduate here.
    main: VecDeque<Arc<Entry<K, V>>>,
    /// Keys evicted from `small` before they proved themselves.
    ghost: VecDeque<K>,
    entries: HashMap<K, Arc<Entry<K, V>>>,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + std::hash::Hash + Clone,
    V: Clone,
{
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let small_capacity = (capacity / 10).max(1);
        Self {
            capacity,
            main_capacity: capacity - small_capacity,
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        let freq = entry.freq.load(Ordering::Relaxed).saturating_add(1);
        entry.freq.store(freq.min(MAX_FREQUENCY), Ordering::Relaxed);
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            return;
        }
        self.evict();

        let entry = Arc::new(Entry {
            key: key.clone(),
            value,
            freq: AtomicU8::new(0),
        });
        self.entries.insert(key.clone(), entry.clone());

        if self.ghost.contains(&key) {
            self.main.push_back(entry);
        } else {
            self.small.push_back(entry);
        }
    }

    fn evict(&mut self) {
        while self.small.len() + self.main.len() >= self.capacity {
            if self.main.len() >= self.main_capacity || self.small.is_empty() {
                self.evict_main();
            } else {
                self.evict_small();
            }
        }
    }

    fn evict_main(&mut self) {
        while let Some(entry) = self.main.pop_front() {
            let freq = entry.freq.load(Ordering::Relaxed);
            if freq > 0 {
                entry.freq.store(freq - 1, Ordering::Relaxed);
                self.main.push_back(entry);
            } else {
                self.entries.remove(&entry.key);
                break;
            }
        }
    }

    fn evict_small(&mut self) {
        while let Some(entry) = self.small.pop_front() {
            if entry.freq.load(Ordering::Relaxed) > 0 {
                self.main.push_back(entry);
            } else {
                self.entries.remove(&entry.key);
                self.remember_ghost(entry.key.clone());
                break;
            }
        }
    }

    fn remember_ghost(&mut self, key: K) {
        if self.ghost.len() >= self.capacity {
            self.ghost.pop_front();
        }
        self.ghost.push_back(key);
    }
}

/// Shared, thread-safe block cache with hit/miss accounting.
pub struct BlockCache {
    inner: Mutex<Cache<(u64, u64), Arc<Block>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl BlockCache {
    /// `capacity_bytes` is divided by `block_size` to bound the entry count.
    pub fn new(capacity_bytes: usize, block_size: usize) -> Self {
        let capacity = (capacity_bytes / block_size.max(1)).max(1);
        Self {
            inner: Mutex::new(Cache::new(capacity)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, file_number: u64, offset: u64) -> Option<Arc<Block>> {
        let hit = self.inner.lock().unwrap().get(&(file_number, offset));
        match &hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    pub fn insert(&self, file_number: u64, offset: u64, block: Arc<Block>) {
        self.inner
            .lock()
            .unwrap()
            .insert((file_number, offset), block);
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
