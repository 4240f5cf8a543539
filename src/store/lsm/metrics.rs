//! Operation counters and the `stats()` snapshot.
//!
//! The engine only counts; formatting and export are the caller's problem.
//! A periodic background task logs the same snapshot through `tracing`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters, updated lock-free from the hot paths.
#[derive(Debug, Default)]
pub struct Counters {
    pub puts: AtomicU64,
    pub deletes: AtomicU64,
    pub gets: AtomicU64,
    pub get_hits: AtomicU64,
    pub scans: AtomicU64,
    pub batch_writes: AtomicU64,
    pub wal_syncs: AtomicU64,
    /// Point lookups a bloom filter proved absent (block read avoided).
    pub bloom_negatives: AtomicU64,
    /// Data blocks read from disk (cache misses included, hits not).
    pub block_reads: AtomicU64,
    pub memtable_flushes: AtomicU64,
    pub compactions: AtomicU64,
    pub bytes_flushed: AtomicU64,
    pub bytes_compacted: AtomicU64,
    /// Writes delayed by the level-0 slowdown threshold.
    pub write_stalls: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time view returned by `stats()`.
#[derive(Debug, Clone)]
pub struct Stats {
    pub puts: u64,
    pub deletes: u64,
    pub gets: u64,
    pub get_hits: u64,
    pub scans: u64,
    pub batch_writes: u64,
    pub wal_syncs: u64,
    pub bloom_negatives: u64,
    pub block_reads: u64,
    pub memtable_flushes: u64,
    pub compactions: u64,
    pub bytes_flushed: u64,
    pub bytes_compacted: u64,
    pub write_stalls: u64,
    pub block_cache_hits: u64,
    pub block_cache_misses: u64,

    pub last_sequence: u64,
    pub next_file_number: u64,
    pub active_memtable_size: usize,
    pub frozen_memtable_count: usize,
    /// `(table_count, total_bytes)` per level, L0 first.
    pub levels: Vec<(usize, u64)>,
}

impl Stats {
    pub fn total_table_count(&self) -> usize {
        self.levels.iter().map(|(count, _)| count).sum()
    }

    pub fn total_table_bytes(&self) -> u64 {
        self.levels.iter().map(|(_, bytes)| bytes).sum()
    }
}

pub(crate) fn snapshot_counters(counters: &Counters) -> [u64; 14] {
    [
        counters.puts.load(Ordering::Relaxed),
        counters.deletes.load(Ordering::Relaxed),
        counters.gets.load(Ordering::Relaxed),
        counters.get_hits.load(Ordering::Relaxed),
        counters.scans.load(Ordering::Relaxed),
        counters.batch_writes.load(Ordering::Relaxed),
        counters.wal_syncs.load(Ordering::Relaxed),
        counters.bloom_negatives.load(Ordering::Relaxed),
        counters.block_reads.load(Ordering::Relaxed),
        counters.memtable_flushes.load(Ordering::Relaxed),
        counters.compactions.load(Ordering::Relaxed),
        counters.bytes_flushed.load(Ordering::Relaxed),
        counters.bytes_compacted.load(Ordering::Relaxed),
        counters.write_stalls.load(Ordering::Relaxed),
    ]
}
