use std::path::PathBuf;
use std::time::Duration;

/// When WAL writes are made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync after every appended frame.
    Always,
    /// fsync once per mutation batch, before the batch becomes visible.
    Batch,
    /// fsync from a background task every `n` milliseconds.
    IntervalMs(u64),
}

/// Configuration for the LSM store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database.
    pub dir: PathBuf,

    /// Active memtable size that triggers rotation (default: 4 MiB).
    pub memtable_size: usize,

    /// Target data block size inside SSTables (default: 4 KiB).
    pub block_size: usize,

    /// Compaction output files roll at this size (default: 2 MiB).
    pub target_sst_size: u64,

    /// Bloom filter bits per key; 0 disables the filter (default: 10).
    pub bloom_filter_bits: usize,

    /// Number of levels, L0..L(max_level-1) (default: 7).
    pub max_level: usize,

    /// Target total size of level 1 (default: 4 MiB).
    pub level0_size: u64,

    /// Per-level size multiplier for targets beyond level 1 (default: 10).
    pub size_ratio: u64,

    /// Level-0 table count that triggers compaction (default: 4).
    pub l0_compaction_trigger: usize,

    /// Level-0 table count that slows writers down (default: 8).
    pub l0_slowdown: usize,

    /// Level-0 table count at which writes fail with `Busy` (default: 12).
    pub l0_stop: usize,

    /// WAL durability policy (default: once per batch).
    pub wal_sync: SyncMode,

    /// Total bytes of decoded blocks kept in the block cache; 0 disables
    /// caching (default: 8 MiB).
    pub block_cache_size: usize,

    /// Open without background tasks and reject all mutations.
    pub read_only: bool,

    /// Create the directory tree on open if absent (default: true).
    pub create_if_missing: bool,

    /// Fail open when the store already exists (default: false).
    pub error_if_exists: bool,

    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check for flush opportunities (default: 50ms).
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 200ms).
    pub compaction_interval: Duration,

    /// How often to clean up stale WAL files (default: 30s).
    pub wal_cleanup_interval: Duration,

    /// How often to log metrics (default: 10s).
    pub metrics_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            memtable_size: 4 * 1024 * 1024,
            block_size: 4 * 1024,
            target_sst_size: 2 * 1024 * 1024,
            bloom_filter_bits: 10,
            max_level: 7,
            level0_size: 4 * 1024 * 1024,
            size_ratio: 10,
            l0_compaction_trigger: 4,
            l0_slowdown: 8,
            l0_stop: 12,
            wal_sync: SyncMode::Batch,
            block_cache_size: 8 * 1024 * 1024,
            read_only: false,
            create_if_missing: true,
            error_if_exists: false,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            compaction_interval: Duration::from_millis(200),
            wal_cleanup_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn target_sst_size(mut self, size: u64) -> Self {
        self.target_sst_size = size;
        self
    }

    pub fn bloom_filter_bits(mut self, bits: usize) -> Self {
        self.bloom_filter_bits = bits;
        self
    }

    pub fn max_level(mut self, levels: usize) -> Self {
        self.max_level = levels;
        self
    }

    pub fn level0_size(mut self, size: u64) -> Self {
        self.level0_size = size;
        self
    }

    pub fn size_ratio(mut self, ratio: u64) -> Self {
        self.size_ratio = ratio;
        self
    }

    pub fn l0_compaction_trigger(mut self, count: usize) -> Self {
        self.l0_compaction_trigger = count;
        self
    }

    pub fn l0_slowdown(mut self, count: usize) -> Self {
        self.l0_slowdown = count;
        self
    }

    pub fn l0_stop(mut self, count: usize) -> Self {
        self.l0_stop = count;
        self
    }

    pub fn wal_sync(mut self, mode: SyncMode) -> Self {
        self.wal_sync = mode;
        self
    }

    pub fn block_cache_size(mut self, bytes: usize) -> Self {
        self.block_cache_size = bytes;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn error_if_exists(mut self, error: bool) -> Self {
        self.error_if_exists = error;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Target total size for a level >= 1.
    pub fn level_target_size(&self, level: usize) -> u64 {
        debug_assert!(level >= 1);
        self.level0_size * self.size_ratio.pow(level as u32 - 1)
    }
}

impl SchedulerConfig {
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn wal_cleanup_interval(mut self, interval: Duration) -> Self {
        self.wal_cleanup_interval = interval;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dir, PathBuf::from("./emberdb"));
        assert_eq!(config.memtable_size, 4 * 1024 * 1024);
        assert_eq!(config.block_size, 4 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert_eq!(config.wal_sync, SyncMode::Batch);
        assert!(config.create_if_missing);
        assert!(!config.error_if_exists);
        assert!(!config.read_only);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .memtable_size(1 << 20)
            .bloom_filter_bits(14)
            .wal_sync(SyncMode::Always)
            .scheduler(
                SchedulerConfig::default()
                    .flush_interval(Duration::from_millis(10))
                    .compaction_interval(Duration::from_millis(20)),
            );

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.memtable_size, 1 << 20);
        assert_eq!(config.bloom_filter_bits, 14);
        assert_eq!(config.wal_sync, SyncMode::Always);
        assert_eq!(config.scheduler.flush_interval, Duration::from_millis(10));
        assert_eq!(
            config.scheduler.compaction_interval,
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_level_target_sizes() {
        let config = Config::default();
        assert_eq!(config.level_target_size(1), 4 * 1024 * 1024);
        assert_eq!(config.level_target_size(2), 40 * 1024 * 1024);
        assert_eq!(config.level_target_size(3), 400 * 1024 * 1024);
    }
}
