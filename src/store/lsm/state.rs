//! All shared mutable state for the LSM store.
//!
//! Locking discipline:
//! - `writer` serializes every mutation (and memtable rotation). Readers
//!   never take it.
//! - `version` and the memtable pointers are behind short read/write locks
//!   held only to clone or swap Arcs, never across I/O.
//! - `manifest` is locked while appending edits; data-block I/O happens
//!   outside it.
//!
//! Readers grab `(active, frozen, version)` Arcs in one pass and then work
//! entirely on those pinned sources.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::Config;
use crate::error::Result;
use crate::store::lsm::cache::BlockCache;
use crate::store::lsm::manifest::{Manifest, Version};
use crate::store::lsm::memtable::{ActiveMemtable, FrozenMemtable};
use crate::store::lsm::metrics::Counters;
use crate::store::lsm::snapshot::SnapshotList;

/// DB lifecycle: `Closed -> Opening -> Open -> Closing -> Closed`.
/// Only `Open` accepts operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Closed = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Lifecycle {
        match v {
            1 => Lifecycle::Opening,
            2 => Lifecycle::Open,
            3 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }
}

pub struct LsmState {
    // Write path.
    pub active: RwLock<Arc<ActiveMemtable>>,
    pub frozen: RwLock<VecDeque<Arc<FrozenMemtable>>>,
    /// Serializes all mutations and memtable rotation.
    pub writer: Mutex<()>,

    // Read path.
    pub version: RwLock<Arc<Version>>,

    // Metadata.
    pub manifest: Mutex<Manifest>,
    pub next_file_number: AtomicU64,
    pub last_sequence: AtomicU64,
    /// Lowest WAL number that still holds unflushed data.
    pub log_number: AtomicU64,

    // Cross-cutting.
    pub snapshots: SnapshotList,
    pub counters: Arc<Counters>,
    pub block_cache: Option<Arc<BlockCache>>,

    // Coordination.
    lifecycle: AtomicU8,
    /// Set when a WAL append failed after fsync; all further writes are
    /// rejected with `ReadOnly`.
    pub degraded: AtomicBool,
    flush_pending: AtomicBool,
    compaction_running: AtomicBool,
    /// Per-level key the round-robin compaction pick resumes after.
    pub compact_pointers: Mutex<Vec<Vec<u8>>>,
    /// Serializes `compact_range` callers.
    pub manual_compaction: tokio::sync::Mutex<()>,
}

impl LsmState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        active: ActiveMemtable,
        frozen: VecDeque<Arc<FrozenMemtable>>,
        version: Version,
        manifest: Manifest,
        next_file_number: u64,
        last_sequence: u64,
        log_number: u64,
        counters: Arc<Counters>,
        block_cache: Option<Arc<BlockCache>>,
        config: &Config,
    ) -> Self {
        Self {
            active: RwLock::new(Arc::new(active)),
            frozen: RwLock::new(frozen),
            writer: Mutex::new(()),
            version: RwLock::new(Arc::new(version)),
            manifest: Mutex::new(manifest),
            next_file_number: AtomicU64::new(next_file_number),
            last_sequence: AtomicU64::new(last_sequence),
            log_number: AtomicU64::new(log_number),
            snapshots: SnapshotList::new(),
            counters,
            block_cache,
            lifecycle: AtomicU8::new(Lifecycle::Opening as u8),
            degraded: AtomicBool::new(false),
            flush_pending: AtomicBool::new(false),
            compaction_running: AtomicBool::new(false),
            compact_pointers: Mutex::new(vec![Vec::new(); config.max_level]),
            manual_compaction: tokio::sync::Mutex::new(()),
        }
    }

    /// Allocates the next file number (shared by WALs, tables, manifests).
    pub fn next_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    pub fn set_lifecycle(&self, state: Lifecycle) {
        self.lifecycle.store(state as u8, Ordering::SeqCst);
    }

    pub fn check_open(&self) -> Result<()> {
        if self.lifecycle() != Lifecycle::Open {
            return Err(crate::Error::NotOpen);
        }
        Ok(())
    }

    /// The sources a read pins: active memtable, frozen memtables newest
    /// first, and the current version.
    pub fn read_sources(
        &self,
    ) -> (
        Arc<ActiveMemtable>,
        Vec<Arc<FrozenMemtable>>,
        Arc<Version>,
    ) {
        let active = self.active.read().unwrap().clone();
        let frozen: Vec<_> = self
            .frozen
            .read()
            .unwrap()
            .iter()
            .rev()
            .cloned()
            .collect();
        let version = self.version.read().unwrap().clone();
        (active, frozen, version)
    }

    pub fn current_version(&self) -> Arc<Version> {
        self.version.read().unwrap().clone()
    }

    pub fn install_version(&self, version: Version) {
        *self.version.write().unwrap() = Arc::new(version);
    }

    pub fn level0_table_count(&self) -> usize {
        self.version.read().unwrap().level(0).table_count()
    }

    // Flush coordination.

    pub fn needs_flush(&self) -> bool {
        !self.frozen.read().unwrap().is_empty() && !self.flush_pending.load(Ordering::SeqCst)
    }

    pub fn try_mark_flush_pending(&self) -> bool {
        !self.flush_pending.swap(true, Ordering::SeqCst)
    }

    pub fn mark_flush_completed(&self) {
        self.flush_pending.store(false, Ordering::SeqCst);
    }

    // Compaction coordination.

    pub fn try_start_compaction(&self) -> Option<CompactionGuard> {
        if self.compaction_running.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(CompactionGuard { state: self })
        }
    }

    pub fn compaction_running(&self) -> bool {
        self.compaction_running.load(Ordering::SeqCst)
    }

    /// The floor below which duplicate versions may be discarded: the
    /// oldest pinned snapshot, or everything up to now when none is open.
    pub fn compaction_visibility_floor(&self) -> u64 {
        self.snapshots.oldest().unwrap_or_else(|| self.last_sequence())
    }
}

/// RAII guard for the single background compaction slot.
pub struct CompactionGuard<'a> {
    state: &'a LsmState,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.state.compaction_running.store(false, Ordering::SeqCst);
    }
}
