//! Background task implementations driven by the scheduler.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::Result;
use crate::scheduler::BackgroundTask;
use crate::store::lsm::metrics::snapshot_counters;
use crate::store::lsm::state::LsmState;
use crate::store::lsm::{compaction, flush, wal_cleanup};

pub struct FlushTask {
    state: Arc<LsmState>,
    config: Config,
}

impl FlushTask {
    pub fn new(state: Arc<LsmState>, config: Config) -> Self {
        Self { state, config }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "memtable-flush"
    }

    fn interval(&self) -> Duration {
        self.config.scheduler.flush_interval
    }

    async fn execute(&self) -> Result<()> {
        while flush::flush_memtable(&self.state, &self.config).await? {}
        Ok(())
    }
}

pub struct CompactionTask {
    state: Arc<LsmState>,
    config: Config,
    consecutive_failures: AtomicU32,
    retry_after: Mutex<Option<Instant>>,
}

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

impl CompactionTask {
    pub fn new(state: Arc<LsmState>, config: Config) -> Self {
        Self {
            state,
            config,
            consecutive_failures: AtomicU32::new(0),
            retry_after: Mutex::new(None),
        }
    }

    fn in_backoff(&self) -> bool {
        self.retry_after
            .lock()
            .unwrap()
            .is_some_and(|t| Instant::now() < t)
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = BACKOFF_BASE
            .saturating_mul(1u32 << failures.min(16))
            .min(BACKOFF_CAP);
        *self.retry_after.lock().unwrap() = Some(Instant::now() + delay);
        tracing::warn!(failures, ?delay, "compaction failed, backing off");
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.retry_after.lock().unwrap() = None;
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.config.scheduler.compaction_interval
    }

    async fn execute(&self) -> Result<()> {
        if self.in_backoff() || !compaction::needs_compaction(&self.state, &self.config) {
            return Ok(());
        }

        match compaction::compact(&self.state, &self.config).await {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

pub struct WalCleanupTask {
    state: Arc<LsmState>,
    config: Config,
}

impl WalCleanupTask {
    pub fn new(state: Arc<LsmState>, config: Config) -> Self {
        Self { state, config }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for WalCleanupTask {
    fn name(&self) -> &'static str {
        "wal-cleanup"
    }

    fn interval(&self) -> Duration {
        self.config.scheduler.wal_cleanup_interval
    }

    async fn execute(&self) -> Result<()> {
        wal_cleanup::cleanup_wals(&self.state, &self.config)
    }
}

/// Periodic fsync of the active WAL segment for `SyncMode::IntervalMs`.
pub struct WalSyncTask {
    state: Arc<LsmState>,
    interval: Duration,
}

impl WalSyncTask {
    pub fn new(state: Arc<LsmState>, interval_ms: u64) -> Self {
        Self {
            state,
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for WalSyncTask {
    fn name(&self) -> &'static str {
        "wal-sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        let active = self.state.active.read().unwrap().clone();
        active.sync()?;
        crate::store::lsm::metrics::Counters::bump(&self.state.counters.wal_syncs);
        Ok(())
    }
}

pub struct MetricsTask {
    state: Arc<LsmState>,
    config: Config,
}

impl MetricsTask {
    pub fn new(state: Arc<LsmState>, config: Config) -> Self {
        Self { state, config }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.config.scheduler.metrics_interval
    }

    async fn execute(&self) -> Result<()> {
        let version = self.state.current_version();
        let levels: Vec<(usize, u64)> = version
            .levels
            .iter()
            .map(|l| (l.table_count(), l.size()))
            .collect();
        let [puts, deletes, gets, _, scans, _, _, bloom_negatives, block_reads, flushes, compactions, ..] =
            snapshot_counters(&self.state.counters);

        tracing::info!(
            puts,
            deletes,
            gets,
            scans,
            bloom_negatives,
            block_reads,
            flushes,
            compactions,
            active_memtable = self.state.active.read().unwrap().size(),
            frozen = self.state.frozen.read().unwrap().len(),
            last_sequence = self.state.last_sequence(),
            ?levels,
            "lsm health"
        );
        Ok(())
    }
}
