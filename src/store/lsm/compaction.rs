//! Leveled compaction: selection policy and executor.
//!
//! Level 0 compacts by table count (its tables overlap, so every lookup
//! touches all of them); levels >= 1 compact by size score
//! `total_bytes / target_bytes`, picking one table round-robin by smallest
//! key and merging it with every overlapping table one level down. Outputs
//! roll at the configured size, but never split the versions of one user
//! key across files.
//!
//! Version retention follows the oldest pinned snapshot: once a record at
//! or below that floor has been kept for a key, everything older is
//! garbage. Tombstones are dropped only when the compaction writes into
//! the bottommost level that can contain the key, otherwise they must
//! survive to keep masking older versions further down.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::store::lsm::iterator::{MergeIterator, RecordSource};
use crate::store::lsm::manifest::edit::VersionEdit;
use crate::store::lsm::manifest::meta::TableMeta;
use crate::store::lsm::manifest::{TableHandle, Version};
use crate::store::lsm::metrics::Counters;
use crate::store::lsm::sstable::{table_file_name, Table, TableBuilder};
use crate::store::lsm::state::LsmState;

pub struct CompactionJob {
    pub level: usize,
    pub inputs: Vec<Arc<TableHandle>>,
    pub next_inputs: Vec<Arc<TableHandle>>,
    pub bottommost: bool,
}

impl CompactionJob {
    fn target_level(&self) -> usize {
        self.level + 1
    }

    fn input_bytes(&self) -> u64 {
        self.inputs
            .iter()
            .chain(self.next_inputs.iter())
            .map(|t| t.meta.size)
            .sum()
    }
}

/// Whether the selection policy would pick any work right now.
pub fn needs_compaction(state: &LsmState, config: &Config) -> bool {
    !state.compaction_running() && pick_compaction(state, config).is_some()
}

fn key_range(tables: &[Arc<TableHandle>]) -> (Vec<u8>, Vec<u8>) {
    let mut smallest = tables[0].meta.smallest_key.clone();
    let mut largest = tables[0].meta.largest_key.clone();
    for table in &tables[1..] {
        if table.meta.smallest_key < smallest {
            smallest = table.meta.smallest_key.clone();
        }
        if table.meta.largest_key > largest {
            largest = table.meta.largest_key.clone();
        }
    }
    (smallest, largest)
}

fn is_bottommost(version: &Version, below_level: usize, smallest: &[u8], largest: &[u8]) -> bool {
    version.levels[below_level..]
        .iter()
        .all(|level| level.overlapping(smallest, largest).is_empty())
}

/// Picks the most urgent compaction, or `None` when every level is within
/// its target.
pub fn pick_compaction(state: &LsmState, config: &Config) -> Option<CompactionJob> {
    let version = state.current_version();

    // Level 0 first: triggered by table count.
    if version.level(0).table_count() >= config.l0_compaction_trigger {
        let inputs = version.level(0).tables.clone();
        let (smallest, largest) = key_range(&inputs);
        let next_inputs = if version.max_level() > 1 {
            version.level(1).overlapping(&smallest, &largest)
        } else {
            Vec::new()
        };
        let bottommost = is_bottommost(&version, 2.min(version.max_level()), &smallest, &largest);
        return Some(CompactionJob {
            level: 0,
            inputs,
            next_inputs,
            bottommost,
        });
    }

    // Deeper levels: highest size score >= 1.0 wins.
    let mut best: Option<(f64, usize)> = None;
    for level in 1..version.max_level().saturating_sub(1) {
        let size = version.level(level).size();
        if size == 0 {
            continue;
        }
        let score = size as f64 / config.level_target_size(level) as f64;
        if score >= 1.0 && best.map_or(true, |(s, _)| score > s) {
            best = Some((score, level));
        }
    }
    let (_, level) = best?;

    // Round-robin within the level: the first table past the last pick.
    let tables = &version.level(level).tables;
    let input = {
        let pointers = state.compact_pointers.lock().unwrap();
        tables
            .iter()
            .find(|t| t.meta.smallest_key > pointers[level])
            .unwrap_or(&tables[0])
            .clone()
    };

    let (smallest, largest) = (
        input.meta.smallest_key.clone(),
        input.meta.largest_key.clone(),
    );
    let next_inputs = version.level(level + 1).overlapping(&smallest, &largest);
    let bottommost = is_bottommost(&version, level + 2, &smallest, &largest);

    Some(CompactionJob {
        level,
        inputs: vec![input],
        next_inputs,
        bottommost,
    })
}

/// Runs one round of background compaction if the policy calls for it.
pub async fn compact(state: &LsmState, config: &Config) -> Result<()> {
    let Some(_guard) = state.try_start_compaction() else {
        return Ok(());
    };
    let Some(job) = pick_compaction(state, config) else {
        return Ok(());
    };
    run_job(state, config, job)
}

/// Compacts every level whose tables overlap `[start, end]`, front to
/// back. Serialized against other manual compactions; repeated calls are
/// semantically idempotent.
pub async fn compact_range(
    state: &LsmState,
    config: &Config,
    start: &[u8],
    end: &[u8],
) -> Result<()> {
    let _manual = state.manual_compaction.lock().await;

    for level in 0..config.max_level.saturating_sub(1) {
        let version = state.current_version();
        let inputs = version.level(level).overlapping(start, end);
        if inputs.is_empty() {
            continue;
        }

        let (smallest, largest) = key_range(&inputs);
        let next_inputs = version.level(level + 1).overlapping(&smallest, &largest);
        let bottommost = is_bottommost(&version, level + 2, &smallest, &largest);
        let job = CompactionJob {
            level,
            inputs,
            next_inputs,
            bottommost,
        };

        // Wait out any background compaction; manual requests are rare.
        let guard = loop {
            if let Some(guard) = state.try_start_compaction() {
                break guard;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        run_job(state, config, job)?;
        drop(guard);
    }

    Ok(())
}

fn run_job(state: &LsmState, config: &Config, job: CompactionJob) -> Result<()> {
    let target_level = job.target_level().min(config.max_level - 1);
    let visibility_floor = state.compaction_visibility_floor();

    tracing::info!(
        level = job.level,
        target_level,
        inputs = job.inputs.len(),
        next_inputs = job.next_inputs.len(),
        bottommost = job.bottommost,
        "starting compaction"
    );

    let mut sources: Vec<RecordSource> = Vec::new();
    for table in job.inputs.iter().chain(job.next_inputs.iter()) {
        sources.push(Box::new(table.table.scan(..)?));
    }
    let merged = MergeIterator::new(sources);

    let writer = OutputWriter::new(state, config, target_level as u32);
    let outputs = write_outputs(merged, writer, visibility_floor, job.bottommost)?;

    // One edit removes all inputs and adds all outputs.
    let removed: Vec<(u32, u64)> = job
        .inputs
        .iter()
        .map(|t| (job.level as u32, t.number()))
        .chain(
            job.next_inputs
                .iter()
                .map(|t| (target_level as u32, t.number())),
        )
        .collect();

    let edit = VersionEdit {
        added: outputs.iter().map(|h| h.meta.clone()).collect(),
        removed: removed.clone(),
        next_file_number: state.next_file_number.load(Ordering::SeqCst),
        last_sequence: state.last_sequence(),
        log_number: state.log_number.load(Ordering::SeqCst),
    };

    {
        let mut manifest = state.manifest.lock()?;
        manifest.append(&edit)?;
        if manifest.should_snapshot() {
            let replayed = manifest.replay()?;
            let new_number = state.next_file_number();
            manifest.rewrite(&config.dir, new_number, &replayed)?;
        }
    }

    let output_count = outputs.len();
    let output_bytes: u64 = outputs.iter().map(|h| h.meta.size).sum();
    let version = state
        .current_version()
        .apply(outputs, &removed, config.max_level);
    #[cfg(debug_assertions)]
    version.validate()?;
    state.install_version(version);

    // Round-robin pointer: the next pick at this level resumes past these
    // inputs.
    if job.level >= 1 {
        let (_, largest) = key_range(&job.inputs);
        state.compact_pointers.lock().unwrap()[job.level] = largest;
    }

    // Inputs are dead; files are unlinked when the last reader drops.
    for table in job.inputs.iter().chain(job.next_inputs.iter()) {
        table.mark_obsolete();
    }

    Counters::bump(&state.counters.compactions);
    Counters::add(&state.counters.bytes_compacted, job.input_bytes());
    tracing::info!(
        level = job.level,
        target_level,
        outputs = output_count,
        output_bytes,
        "completed compaction"
    );

    Ok(())
}

/// Allocates file numbers and rolls output tables at the size cap.
struct OutputWriter<'a> {
    state: &'a LsmState,
    config: &'a Config,
    level: u32,
    builder: Option<(u64, std::path::PathBuf, TableBuilder)>,
    outputs: Vec<Arc<TableHandle>>,
}

impl<'a> OutputWriter<'a> {
    fn new(state: &'a LsmState, config: &'a Config, level: u32) -> Self {
        Self {
            state,
            config,
            level,
            builder: None,
            outputs: Vec::new(),
        }
    }

    fn add(&mut self, record: &crate::store::lsm::record::Record) -> Result<()> {
        // Roll only at a user-key boundary so all versions of a key stay in
        // one file.
        let should_roll = self.builder.as_ref().is_some_and(|(_, _, builder)| {
            builder.estimated_size() >= self.config.target_sst_size
                && builder.last_key() != record.key.as_slice()
        });
        if should_roll {
            self.finish_current()?;
        }

        if self.builder.is_none() {
            let number = self.state.next_file_number();
            let path = self.config.dir.join(table_file_name(number));
            let builder = TableBuilder::create(
                &path,
                self.config.block_size,
                self.config.bloom_filter_bits,
            )?;
            self.builder = Some((number, path, builder));
        }

        self.builder.as_mut().unwrap().2.add(record)
    }

    fn finish_current(&mut self) -> Result<()> {
        let Some((number, path, builder)) = self.builder.take() else {
            return Ok(());
        };
        if builder.is_empty() {
            builder.abandon();
            return Ok(());
        }

        let summary = builder.finish()?;
        let meta = TableMeta {
            number,
            level: self.level,
            size: summary.file_size,
            entry_count: summary.entry_count,
            smallest_key: summary.smallest_key,
            largest_key: summary.largest_key,
            smallest_seq: summary.smallest_seq,
            largest_seq: summary.largest_seq,
        };
        let table = Table::open(
            &path,
            number,
            self.state.block_cache.clone(),
            self.state.counters.clone(),
        )?;
        self.outputs.push(Arc::new(TableHandle::new(meta, table, path)));
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<Arc<TableHandle>>> {
        self.finish_current()?;
        Ok(self.outputs)
    }

    fn abandon(mut self) {
        if let Some((_, _, builder)) = self.builder.take() {
            builder.abandon();
        }
        // Finished outputs stay on disk but are never added to the
        // manifest; recovery ignores them and a later compaction may reuse
        // nothing from them.
    }
}

fn write_outputs(
    merged: MergeIterator,
    mut writer: OutputWriter<'_>,
    visibility_floor: u64,
    bottommost: bool,
) -> Result<Vec<Arc<TableHandle>>> {
    let mut current_key: Option<Vec<u8>> = None;
    let mut key_resolved = false;

    for item in merged {
        let record = match item {
            Ok(record) => record,
            Err(e) => {
                writer.abandon();
                return Err(e);
            }
        };

        if current_key.as_deref() != Some(record.key.as_slice()) {
            current_key = Some(record.key.clone());
            key_resolved = false;
        }

        // A newer record at or below the floor already shadows this one
        // for every possible reader.
        if key_resolved {
            continue;
        }
        if record.seq <= visibility_floor {
            key_resolved = true;
        }

        // A tombstone below the floor is only needed to mask deeper
        // levels; at the bottom it can vanish along with everything it
        // masked.
        if record.is_tombstone() && record.seq <= visibility_floor && bottommost {
            continue;
        }

        if let Err(e) = writer.add(&record) {
            writer.abandon();
            return Err(e);
        }
    }

    writer.finish()
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, SchedulerConfig};
    use crate::error::Result;
    use crate::store::lsm::store::LsmTree;
    use crate::tmpfs::TempDir;

    fn manual_config(dir: &TempDir) -> Config {
        Config::new(dir.path())
            .l0_compaction_trigger(2)
            .target_sst_size(64 * 1024)
            .scheduler(
                SchedulerConfig::default()
                    .flush_interval(std::time::Duration::from_secs(3600))
                    .compaction_interval(std::time::Duration::from_secs(3600)),
            )
    }

    async fn fill_and_flush(store: &LsmTree, round: usize, keys: usize) -> Result<()> {
        for i in 0..keys {
            let key = format!("key_{i:04}");
            store.set(key.as_bytes(), format!("value_{round}_{i}").into_bytes())?;
        }
        store.flush().await
    }

    #[tokio::test]
    async fn test_l0_compaction_merges_tables() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(manual_config(&dir))?;

        for round in 0..3 {
            fill_and_flush(&store, round, 100).await?;
        }
        assert_eq!(store.stats().levels[0].0, 3);

        assert!(super::needs_compaction(&store.state, store.config()));
        super::compact(&store.state, store.config()).await?;

        let stats = store.stats();
        assert_eq!(stats.levels[0].0, 0, "level 0 drained");
        assert!(stats.levels[1].0 >= 1, "outputs landed in level 1");

        // Newest round wins for every key.
        for i in 0..100 {
            let key = format!("key_{i:04}");
            assert_eq!(
                store.get(key.as_bytes())?,
                Some(format!("value_2_{i}").into_bytes())
            );
        }

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_compaction_reclaims_overwrites() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(manual_config(&dir))?;

        // Overwrite the same keys ten times.
        for round in 0..10 {
            fill_and_flush(&store, round, 1000).await?;
        }
        let before = store.stats().total_table_bytes();

        store.compact_range(b"", b"\xff\xff\xff\xff").await?;
        let after = store.stats().total_table_bytes();

        assert!(
            after * 2 < before,
            "compaction should reclaim most duplicate bytes ({before} -> {after})"
        );

        for i in 0..1000 {
            let key = format!("key_{i:04}");
            assert_eq!(
                store.get(key.as_bytes())?,
                Some(format!("value_9_{i}").into_bytes())
            );
        }

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_bottommost_compaction_drops_tombstones() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(manual_config(&dir))?;

        for i in 0..100 {
            store.set(format!("key_{i:04}").as_bytes(), b"v".to_vec())?;
        }
        store.flush().await?;
        for i in 0..100 {
            store.delete(format!("key_{i:04}").as_bytes())?;
        }
        store.flush().await?;

        store.compact_range(b"", b"\xff\xff\xff\xff").await?;
        // Everything was deleted and the compaction reached the bottom, so
        // no table should survive.
        let stats = store.stats();
        assert_eq!(stats.total_table_count(), 0, "tombstones fully collapsed");

        for i in 0..100 {
            assert_eq!(store.get(format!("key_{i:04}").as_bytes())?, None);
        }

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_preserves_old_versions_through_compaction() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(manual_config(&dir))?;

        store.set(b"k", b"old".to_vec())?;
        let snap = store.snapshot()?;
        store.set(b"k", b"new".to_vec())?;
        store.flush().await?;
        store.compact_range(b"", b"\xff\xff\xff\xff").await?;

        assert_eq!(store.get_at(b"k", Some(&snap))?, Some(b"old".to_vec()));
        assert_eq!(store.get(b"k")?, Some(b"new".to_vec()));

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_compact_range_is_idempotent() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let store = LsmTree::open_with_config(manual_config(&dir))?;

        fill_and_flush(&store, 0, 200).await?;
        store.compact_range(b"", b"\xff\xff\xff\xff").await?;
        let first = store.stats().total_table_bytes();
        store.compact_range(b"", b"\xff\xff\xff\xff").await?;
        let second = store.stats().total_table_bytes();
        assert_eq!(first, second);

        for i in 0..200 {
            let key = format!("key_{i:04}");
            assert_eq!(
                store.get(key.as_bytes())?,
                Some(format!("value_0_{i}").into_bytes())
            );
        }

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_level_scores_trigger_deeper_compaction() -> Result<()> {
        let dir = TempDir::new().unwrap();
        // Tiny level targets force deep movement quickly.
        let config = manual_config(&dir).level0_size(16 * 1024).size_ratio(2);
        let store = LsmTree::open_with_config(config)?;

        // Disjoint keys per round so level 1 actually accumulates bytes.
        for round in 0..8 {
            for i in 0..500 {
                let key = format!("key_{round}_{i:04}");
                store.set(key.as_bytes(), format!("value_{round}_{i}").into_bytes())?;
            }
            store.flush().await?;
            while super::needs_compaction(&store.state, store.config()) {
                super::compact(&store.state, store.config()).await?;
            }
        }

        let stats = store.stats();
        let deeper_tables: usize = stats.levels[2..].iter().map(|(c, _)| c).sum();
        assert!(
            deeper_tables > 0,
            "size scoring should have pushed tables past level 1: {:?}",
            stats.levels
        );

        for round in 0..8 {
            for i in (0..500).step_by(53) {
                let key = format!("key_{round}_{i:04}");
                assert_eq!(
                    store.get(key.as_bytes())?,
                    Some(format!("value_{round}_{i}").into_bytes())
                );
            }
        }

        store.close().await?;
        Ok(())
    }
}
