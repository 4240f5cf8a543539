//! The LSM store facade.
//!
//! `LsmTree` owns every component: the lock file, the shared state, and the
//! background scheduler. Foreground writes run under the single writer
//! mutex; reads pin `(active, frozen, version)` and proceed without locks;
//! flush and compaction run on the scheduler and coordinate through the
//! state's atomic flags.

use std::ops::RangeBounds;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::config::{Config, SyncMode};
use crate::error::Result;
use crate::flock::FileLock;
use crate::scheduler::Scheduler;
use crate::store::lsm::batch::WriteBatch;
use crate::store::lsm::iterator::{LsmScanIterator, RecordSource};
use crate::store::lsm::memtable::ActiveMemtable;
use crate::store::lsm::metrics::{snapshot_counters, Counters, Stats};
use crate::store::lsm::record::{validate_key, validate_value, Op, Record};
use crate::store::lsm::snapshot::Snapshot;
use crate::store::lsm::state::{Lifecycle, LsmState};
use crate::store::lsm::wal::{segment_file_name, Wal};
use crate::store::lsm::{cache::BlockCache, compaction, flush, recovery, tasks};
use crate::Error;

const LOCK_FILE: &str = "LOCK";

pub struct LsmTree {
    config: Config,
    lock: Option<FileLock>,
    pub(crate) state: Arc<LsmState>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl LsmTree {
    /// Opens (or creates) the store at `dir` with default configuration.
    pub fn open(dir: &str) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    pub fn open_with_config(config: Config) -> Result<Self> {
        let exists = config.dir.join(crate::store::lsm::manifest::CURRENT_FILE).exists();
        if exists && config.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "store already exists at {}",
                config.dir.display()
            )));
        }
        if !exists && !config.create_if_missing {
            return Err(Error::InvalidArgument(format!(
                "store does not exist at {}",
                config.dir.display()
            )));
        }

        std::fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE)).map_err(|_| Error::AlreadyOpen)?;

        let counters = Arc::new(Counters::default());
        let block_cache = (config.block_cache_size > 0)
            .then(|| Arc::new(BlockCache::new(config.block_cache_size, config.block_size)));

        let state = Arc::new(recovery::recover_state(
            &config,
            counters,
            block_cache,
        )?);
        state.set_lifecycle(Lifecycle::Open);

        let tree = Self {
            config,
            lock: Some(lock),
            state,
            scheduler: Mutex::new(None),
        };
        if !tree.config.read_only {
            tree.start_background_tasks();
        }
        Ok(tree)
    }

    fn start_background_tasks(&self) {
        let scheduler = Scheduler::new();
        scheduler
            .register(Arc::new(tasks::FlushTask::new(
                self.state.clone(),
                self.config.clone(),
            )))
            .register(Arc::new(tasks::CompactionTask::new(
                self.state.clone(),
                self.config.clone(),
            )))
            .register(Arc::new(tasks::WalCleanupTask::new(
                self.state.clone(),
                self.config.clone(),
            )))
            .register(Arc::new(tasks::MetricsTask::new(
                self.state.clone(),
                self.config.clone(),
            )));

        if let SyncMode::IntervalMs(ms) = self.config.wal_sync {
            scheduler.register(Arc::new(tasks::WalSyncTask::new(self.state.clone(), ms)));
        }

        *self.scheduler.lock().unwrap() = Some(scheduler);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops accepting operations, finishes in-flight writes, stops the
    /// background tasks at their next boundary, and fsyncs the WAL.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.state.lifecycle() != Lifecycle::Open {
            return Ok(());
        }
        self.state.set_lifecycle(Lifecycle::Closing);

        // Wait for the in-flight mutation, if any.
        drop(self.state.writer.lock()?);

        let scheduler = self.scheduler.lock().unwrap().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await?;
        }

        if !self.config.read_only {
            self.state.active.read().unwrap().sync()?;
        }
        self.state.set_lifecycle(Lifecycle::Closed);
        tracing::info!(dir = %self.config.dir.display(), "store closed");
        Ok(())
    }

    // ---- Reads ----

    /// Point lookup at the current sequence.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(key, None)
    }

    /// Point lookup pinned to `snapshot` when given.
    pub fn get_at(&self, key: &[u8], snapshot: Option<&Snapshot>) -> Result<Option<Vec<u8>>> {
        self.state.check_open()?;
        validate_key(key)?;
        Counters::bump(&self.state.counters.gets);

        let seq = snapshot
            .map(|s| s.sequence())
            .unwrap_or_else(|| self.state.last_sequence());
        let (active, frozen, version) = self.state.read_sources();

        // Newest source first; a tombstone hit ends the search.
        if let Some(value) = active.get(key, seq) {
            return Ok(self.count_hit(value));
        }
        for memtable in &frozen {
            if let Some(value) = memtable.get(key, seq) {
                return Ok(self.count_hit(value));
            }
        }
        if let Some(record) = version.get(key, seq)? {
            let value = (!record.is_tombstone()).then_some(record.value);
            return Ok(self.count_hit(value));
        }

        Ok(None)
    }

    fn count_hit(&self, value: Option<Vec<u8>>) -> Option<Vec<u8>> {
        if value.is_some() {
            Counters::bump(&self.state.counters.get_hits);
        }
        value
    }

    /// Ordered scan over `[start, end)` at the current sequence.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<LsmScanIterator> {
        self.scan(start.to_vec()..end.to_vec())
    }

    /// Ordered scan over an arbitrary range at the current sequence.
    pub fn scan<R>(&self, range: R) -> Result<LsmScanIterator>
    where
        R: RangeBounds<Vec<u8>> + Clone + Send + Sync + 'static,
    {
        self.scan_at(range, None)
    }

    /// Ordered scan pinned to `snapshot` when given. The iterator captures
    /// its sources at creation: concurrent writes, rotations and
    /// compactions never change what it yields.
    pub fn scan_at<R>(&self, range: R, snapshot: Option<&Snapshot>) -> Result<LsmScanIterator>
    where
        R: RangeBounds<Vec<u8>> + Clone + Send + Sync + 'static,
    {
        self.state.check_open()?;
        Counters::bump(&self.state.counters.scans);

        let seq = snapshot
            .map(|s| s.sequence())
            .unwrap_or_else(|| self.state.last_sequence());
        let (active, frozen, version) = self.state.read_sources();

        let mut sources: Vec<RecordSource> = Vec::new();
        sources.push(Box::new(active.iter(range.clone())));
        for memtable in &frozen {
            sources.push(Box::new(memtable.iter(range.clone())));
        }
        for level in &version.levels {
            for table in &level.tables {
                sources.push(Box::new(table.table.scan(range.clone())?));
            }
        }

        Ok(LsmScanIterator::new(sources, seq))
    }

    /// Pins the current sequence for repeatable reads. Dropped snapshots
    /// release their pin; none survive `close`.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.state.check_open()?;
        Ok(self.state.snapshots.pin(self.state.last_sequence()))
    }

    // ---- Writes ----

    pub fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    /// Applies the batch atomically: contiguous sequences, contiguous WAL
    /// frames, one visibility flip.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.state.check_open()?;
        if self.config.read_only || self.state.degraded.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }

        for (op, key, value) in batch.ops() {
            validate_key(key)?;
            if *op == Op::Set {
                validate_value(value)?;
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        // Backpressure from level 0.
        let l0_count = self.state.level0_table_count();
        if l0_count >= self.config.l0_stop {
            Counters::bump(&self.state.counters.write_stalls);
            return Err(Error::Busy);
        }
        if l0_count >= self.config.l0_slowdown {
            Counters::bump(&self.state.counters.write_stalls);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let _writer = self.state.writer.lock()?;

        // Rotate first so the whole batch lands in one segment.
        if self.state.active.read().unwrap().size() >= self.config.memtable_size {
            self.rotate_locked()?;
        }

        let active = self.state.active.read().unwrap().clone();
        let base = self.state.last_sequence() + 1;
        let ops = batch.into_ops();
        let count = ops.len() as u64;
        let mut puts = 0u64;
        let mut deletes = 0u64;

        for (i, (op, key, value)) in ops.into_iter().enumerate() {
            match op {
                Op::Set => puts += 1,
                Op::Delete => deletes += 1,
            }
            let record = Record {
                key,
                seq: base + i as u64,
                op,
                value,
            };
            if let Err(e) = active.put(record) {
                if matches!(e, Error::IO(_)) {
                    // The segment now has a torn tail; no further write can
                    // be trusted to land after it.
                    self.state.degraded.store(true, Ordering::SeqCst);
                    tracing::error!(error = %e, "WAL append failed, store is now read-only");
                }
                return Err(e);
            }
        }

        if matches!(self.config.wal_sync, SyncMode::Batch) {
            active.sync()?;
            Counters::bump(&self.state.counters.wal_syncs);
        }

        // Publishing last_sequence makes the whole batch visible at once.
        self.state
            .last_sequence
            .store(base + count - 1, Ordering::SeqCst);

        Counters::add(&self.state.counters.puts, puts);
        Counters::add(&self.state.counters.deletes, deletes);
        if count > 1 {
            Counters::bump(&self.state.counters.batch_writes);
        }
        Ok(())
    }

    /// Seals the active memtable and replaces it with a fresh one backed by
    /// a new WAL segment. Caller holds the writer mutex.
    fn rotate_locked(&self) -> Result<()> {
        if self.state.active.read().unwrap().is_empty() {
            return Ok(());
        }

        let number = self.state.next_file_number();
        let path = self.config.dir.join(segment_file_name(number));
        let wal = Wal::open(
            path,
            number,
            matches!(self.config.wal_sync, SyncMode::Always),
        )?;
        let fresh = Arc::new(ActiveMemtable::new(wal));

        // Swap and enqueue under both locks (active before frozen, the
        // order every reader uses) so no one observes the sealed memtable
        // missing from both places.
        {
            let mut active = self.state.active.write().unwrap();
            let mut frozen_queue = self.state.frozen.write().unwrap();
            let sealed = active.freeze()?;
            *active = fresh;
            frozen_queue.push_back(Arc::new(sealed));
        }

        tracing::debug!(segment = number, "rotated memtable");
        Ok(())
    }

    // ---- Maintenance ----

    /// Fsyncs the active WAL segment. Under `IntervalMs` this is the only
    /// way to force durability of recent writes.
    pub fn sync(&self) -> Result<()> {
        self.state.check_open()?;
        self.state.active.read().unwrap().sync()?;
        Counters::bump(&self.state.counters.wal_syncs);
        Ok(())
    }

    /// Rotates the active memtable (if non-empty) and flushes everything
    /// frozen.
    pub async fn flush(&self) -> Result<()> {
        self.state.check_open()?;
        {
            let _writer = self.state.writer.lock()?;
            self.rotate_locked()?;
        }
        while flush::flush_memtable(&self.state, &self.config).await? {}
        Ok(())
    }

    /// Compacts every level overlapping `[start, end]` down one level.
    /// Concurrent callers are serialized.
    pub async fn compact_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        self.state.check_open()?;
        self.flush().await?;
        compaction::compact_range(&self.state, &self.config, start, end).await
    }

    /// Counter and shape snapshot.
    pub fn stats(&self) -> Stats {
        let [puts, deletes, gets, get_hits, scans, batch_writes, wal_syncs, bloom_negatives, block_reads, memtable_flushes, compactions, bytes_flushed, bytes_compacted, write_stalls] =
            snapshot_counters(&self.state.counters);
        let (block_cache_hits, block_cache_misses) = self
            .state
            .block_cache
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or((0, 0));

        let version = self.state.current_version();
        Stats {
            puts,
            deletes,
            gets,
            get_hits,
            scans,
            batch_writes,
            wal_syncs,
            bloom_negatives,
            block_reads,
            memtable_flushes,
            compactions,
            bytes_flushed,
            bytes_compacted,
            write_stalls,
            block_cache_hits: block_cache_hits as u64,
            block_cache_misses: block_cache_misses as u64,
            last_sequence: self.state.last_sequence(),
            next_file_number: self.state.next_file_number.load(Ordering::SeqCst),
            active_memtable_size: self.state.active.read().unwrap().size(),
            frozen_memtable_count: self.state.frozen.read().unwrap().len(),
            levels: version
                .levels
                .iter()
                .map(|l| (l.table_count(), l.size()))
                .collect(),
        }
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        // A store dropped without close() still tells its tasks to stop;
        // they exit at their next tick.
        if let Some(scheduler) = self.scheduler.lock().unwrap().take() {
            scheduler.signal_shutdown();
        }
        if let Some(lock) = self.lock.take() {
            let _ = lock.unlock();
        }
    }
}

impl crate::store::Store for LsmTree {
    type ScanIterator = LsmScanIterator;

    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        LsmTree::set(self, key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        LsmTree::get(self, key)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        LsmTree::delete(self, key)
    }

    fn scan(
        &self,
        range: (
            std::ops::Bound<Vec<u8>>,
            std::ops::Bound<Vec<u8>>,
        ),
    ) -> Result<Self::ScanIterator> {
        LsmTree::scan(self, range)
    }

    fn sync(&self) -> Result<()> {
        LsmTree::sync(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::store::Store;
    use crate::tmpfs::TempDir;
    use std::time::Duration;

    fn test_config(dir: &TempDir) -> Config {
        Config::new(dir.path()).scheduler(
            SchedulerConfig::default()
                .flush_interval(Duration::from_millis(10))
                .compaction_interval(Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn test_basic_operations() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        store.set(b"k1", b"v1".to_vec())?;
        store.set(b"k2", b"v2".to_vec())?;

        assert_eq!(store.get(b"k1")?, Some(b"v1".to_vec()));
        assert_eq!(store.get(b"k2")?, Some(b"v2".to_vec()));
        assert_eq!(store.get(b"k3")?, None);

        store.delete(b"k1")?;
        assert_eq!(store.get(b"k1")?, None);

        store.set(b"k1", b"v1b".to_vec())?;
        assert_eq!(store.get(b"k1")?, Some(b"v1b".to_vec()));

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_overwrite_returns_newest() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        store.set(b"k", b"v1".to_vec())?;
        store.set(b"k", b"v2".to_vec())?;
        assert_eq!(store.get(b"k")?, Some(b"v2".to_vec()));

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_key_rejected() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        assert!(matches!(
            store.set(b"", b"v".to_vec()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(store.get(b""), Err(Error::InvalidArgument(_))));

        // A key at the limit is accepted.
        let max_key = vec![7u8; crate::store::lsm::record::MAX_KEY_LEN];
        store.set(&max_key, b"v".to_vec())?;
        assert_eq!(store.get(&max_key)?, Some(b"v".to_vec()));

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_range_scan() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        for i in 0..100 {
            let key = format!("key{i:02}");
            let value = format!("val{i:02}");
            store.set(key.as_bytes(), value.into_bytes())?;
        }

        let entries: Vec<_> = store
            .range(b"key20", b"key25")?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(
            entries,
            vec![
                (b"key20".to_vec(), b"val20".to_vec()),
                (b"key21".to_vec(), b"val21".to_vec()),
                (b"key22".to_vec(), b"val22".to_vec()),
                (b"key23".to_vec(), b"val23".to_vec()),
                (b"key24".to_vec(), b"val24".to_vec()),
            ]
        );

        // End-exclusive even when the bound key exists.
        let empty: Vec<_> = store
            .range(b"key20", b"key20")?
            .collect::<Result<Vec<_>>>()?;
        assert!(empty.is_empty());

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_is_atomic_and_ordered() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        store.set(b"gone", b"x".to_vec())?;

        let mut batch = WriteBatch::new();
        batch.put(&b"a"[..], &b"1"[..]);
        batch.delete(&b"gone"[..]);
        batch.put(&b"a"[..], &b"2"[..]);
        store.write(batch)?;

        assert_eq!(store.get(b"a")?, Some(b"2".to_vec()), "later op in batch wins");
        assert_eq!(store.get(b"gone")?, None);

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_memtable_rotation_keeps_data_readable() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).memtable_size(4096);
        let store = LsmTree::open_with_config(config)?;

        for i in 0..2000 {
            let key = format!("k{i:06}");
            loop {
                match store.set(key.as_bytes(), format!("v{i:06}").into_bytes()) {
                    Err(Error::Busy) => tokio::time::sleep(Duration::from_millis(5)).await,
                    result => break result?,
                }
            }
        }

        // Give the background flush a moment, then verify everything.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = store.stats();
        assert!(
            stats.memtable_flushes >= 1,
            "small memtables must have flushed to level 0"
        );

        for i in (0..2000).step_by(97) {
            let key = format!("k{i:06}");
            assert_eq!(
                store.get(key.as_bytes())?,
                Some(format!("v{i:06}").into_bytes())
            );
        }

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_reads_are_repeatable() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        store.set(b"k", b"v1".to_vec())?;
        let snap = store.snapshot()?;

        store.set(b"k", b"v2".to_vec())?;
        store.delete(b"k")?;

        assert_eq!(store.get_at(b"k", Some(&snap))?, Some(b"v1".to_vec()));
        assert_eq!(store.get(b"k")?, None);

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_iterator_is_snapshot_consistent() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        for i in 0..10 {
            store.set(format!("k{i}").as_bytes(), b"before".to_vec())?;
        }

        let snap = store.snapshot()?;
        let iter = store.scan_at(.., Some(&snap))?;

        // Writes after iterator creation are invisible to it.
        for i in 0..10 {
            store.set(format!("k{i}").as_bytes(), b"after".to_vec())?;
        }
        store.set(b"new_key", b"after".to_vec())?;

        let entries: Vec<_> = iter.collect::<Result<Vec<_>>>()?;
        assert_eq!(entries.len(), 10);
        for (_, value) in entries {
            assert_eq!(value, b"before".to_vec());
        }

        // The same scan at the same snapshot yields the same multiset.
        let again: Vec<_> = store
            .scan_at(.., Some(&snap))?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(again.len(), 10);

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_exclusive_directory_access() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        let second = LsmTree::open_with_config(test_config(&dir));
        assert!(matches!(second, Err(Error::AlreadyOpen)));

        store.close().await?;
        drop(store);

        let reopened = LsmTree::open_with_config(test_config(&dir))?;
        reopened.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen_preserves_mapping() -> Result<()> {
        let dir = TempDir::new().unwrap();

        {
            let store = LsmTree::open_with_config(test_config(&dir))?;
            for i in 0..500 {
                store.set(format!("key_{i:04}").as_bytes(), format!("value_{i}").into_bytes())?;
            }
            store.delete(b"key_0100")?;
            store.close().await?;
        }

        {
            let store = LsmTree::open_with_config(test_config(&dir))?;
            for i in 0..500 {
                let expected = if i == 100 {
                    None
                } else {
                    Some(format!("value_{i}").into_bytes())
                };
                assert_eq!(store.get(format!("key_{i:04}").as_bytes())?, expected);
            }
            store.close().await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_recovery_after_simulated_crash() -> Result<()> {
        let dir = TempDir::new().unwrap();

        // No close(): the store is dropped with WAL contents on disk, like
        // a crash after fsync.
        {
            let store =
                LsmTree::open_with_config(test_config(&dir).wal_sync(SyncMode::Always))?;
            for i in 0..500 {
                store.set(format!("key_{i:04}").as_bytes(), format!("value_{i}").into_bytes())?;
            }
            // Drop without close; the scheduler tasks die with the runtime.
            let scheduler = store.scheduler.lock().unwrap().take();
            if let Some(scheduler) = scheduler {
                scheduler.shutdown().await?;
            }
        }

        {
            let store = LsmTree::open_with_config(test_config(&dir))?;
            for i in 0..500 {
                assert_eq!(
                    store.get(format!("key_{i:04}").as_bytes())?,
                    Some(format!("value_{i}").into_bytes()),
                    "acknowledged write lost after crash"
                );
            }
            store.close().await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;
        store.set(b"k", b"v".to_vec())?;
        store.close().await?;

        assert!(matches!(store.get(b"k"), Err(Error::NotOpen)));
        assert!(matches!(
            store.set(b"k", b"v".to_vec()),
            Err(Error::NotOpen)
        ));
        assert!(matches!(store.snapshot(), Err(Error::NotOpen)));

        // close() is idempotent.
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_read_only_open() -> Result<()> {
        let dir = TempDir::new().unwrap();

        {
            let store = LsmTree::open_with_config(test_config(&dir))?;
            store.set(b"k", b"v".to_vec())?;
            store.close().await?;
        }

        let store = LsmTree::open_with_config(test_config(&dir).read_only(true))?;
        assert_eq!(store.get(b"k")?, Some(b"v".to_vec()));
        assert!(matches!(
            store.set(b"x", b"y".to_vec()),
            Err(Error::ReadOnly)
        ));
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_write_stall_at_l0_stop() -> Result<()> {
        let dir = TempDir::new().unwrap();
        // Stop almost immediately and keep compaction parked.
        let config = test_config(&dir)
            .l0_slowdown(1)
            .l0_stop(2)
            .l0_compaction_trigger(100)
            .scheduler(
                SchedulerConfig::default()
                    .flush_interval(Duration::from_secs(3600))
                    .compaction_interval(Duration::from_secs(3600)),
            );
        let store = LsmTree::open_with_config(config)?;

        for round in 0..2 {
            store.set(format!("k{round}").as_bytes(), b"v".to_vec())?;
            store.flush().await?;
        }
        assert_eq!(store.stats().levels[0].0, 2);

        assert!(matches!(
            store.set(b"blocked", b"v".to_vec()),
            Err(Error::Busy)
        ));
        assert!(store.stats().write_stalls >= 1);

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_bloom_filters_short_circuit_absent_keys() -> Result<()> {
        let dir = TempDir::new().unwrap();
        // Disable the cache so every real block access counts a read.
        let config = test_config(&dir).block_cache_size(0);
        let store = LsmTree::open_with_config(config)?;

        for i in 0..10_000 {
            store.set(format!("present_{i:05}").as_bytes(), b"v".to_vec())?;
        }
        store.flush().await?;

        let reads_before = store.stats().block_reads;
        // Absent keys interleave with present ones so the index alone
        // cannot rule them out; only the bloom filter can.
        for i in 0..10_000 {
            assert_eq!(store.get(format!("present_{i:05}_x").as_bytes())?, None);
        }
        let block_reads = store.stats().block_reads - reads_before;

        assert!(
            block_reads <= 300,
            "absent-key lookups read too many blocks: {block_reads}/10000"
        );

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_across_rotation_no_dup_no_skip() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir).memtable_size(1 << 20))?;

        for i in 0..1000 {
            store.set(format!("key_{i:05}").as_bytes(), b"v".to_vec())?;
        }

        let iter = store.scan(..)?;

        // Rotate and flush mid-scan.
        store.flush().await?;
        for i in 1000..1100 {
            store.set(format!("key_{i:05}").as_bytes(), b"v".to_vec())?;
        }

        let keys: Vec<_> = iter
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys.len(), 1000, "no key skipped or duplicated");
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, keys);

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_store_trait_object_usage() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        fn exercise<S: Store>(store: &S) -> Result<()> {
            store.set(b"trait_key", b"trait_value".to_vec())?;
            assert_eq!(store.get(b"trait_key")?, Some(b"trait_value".to_vec()));
            store.sync()
        }
        exercise(&store)?;

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_report_shape() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(test_config(&dir))?;

        store.set(b"a", b"1".to_vec())?;
        store.get(b"a")?;
        store.get(b"missing")?;
        store.flush().await?;

        let stats = store.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.get_hits, 1);
        assert_eq!(stats.memtable_flushes, 1);
        assert!(stats.last_sequence >= 1);
        assert_eq!(stats.levels[0].0, 1);

        store.close().await?;
        Ok(())
    }
}
