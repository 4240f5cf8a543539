//! Memtable flush: oldest frozen memtable -> level-0 SSTable.
//!
//! On completion a single manifest edit atomically adds the new table to
//! L0, records the flushed sequence range, and advances the live-WAL floor;
//! only then is the memtable's WAL segment removed.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::store::lsm::manifest::meta::TableMeta;
use crate::store::lsm::manifest::TableHandle;
use crate::store::lsm::memtable::FrozenMemtable;
use crate::store::lsm::metrics::Counters;
use crate::store::lsm::sstable::{table_file_name, Table, TableBuilder};
use crate::store::lsm::state::LsmState;
use crate::store::lsm::wal::segment_file_name;

/// Flushes the oldest frozen memtable, if any. Returns whether one was
/// flushed.
pub async fn flush_memtable(state: &LsmState, config: &Config) -> Result<bool> {
    if !state.needs_flush() || !state.try_mark_flush_pending() {
        return Ok(false);
    }

    let result = flush_oldest(state, config);
    state.mark_flush_completed();
    result
}

fn flush_oldest(state: &LsmState, config: &Config) -> Result<bool> {
    let Some(memtable) = state.frozen.read().unwrap().front().cloned() else {
        return Ok(false);
    };

    // The WAL floor after this memtable is gone: the next frozen segment,
    // or the active one. Locks are taken in rotation order (active before
    // frozen) to avoid an ordering inversion with the writer.
    let new_log_number = {
        let active = state.active.read().unwrap();
        let frozen = state.frozen.read().unwrap();
        frozen
            .iter()
            .nth(1)
            .map(|m| m.log_number())
            .unwrap_or_else(|| active.log_number())
    };

    if memtable.is_empty() {
        commit_flush(state, config, None, new_log_number)?;
    } else {
        let handle = write_table(state, config, &memtable)?;
        commit_flush(state, config, Some(handle), new_log_number)?;
    }

    // The memtable and its segment are no longer needed.
    state.frozen.write().unwrap().pop_front();
    let wal_path = config.dir.join(segment_file_name(memtable.log_number()));
    if let Err(e) = std::fs::remove_file(&wal_path) {
        tracing::warn!(path = %wal_path.display(), error = %e, "failed to delete flushed WAL segment");
    }

    #[cfg(debug_assertions)]
    state.current_version().validate()?;

    Ok(true)
}

/// Writes the memtable's records into a new L0 table, omitting duplicate
/// versions no pinned snapshot can still see.
fn write_table(
    state: &LsmState,
    config: &Config,
    memtable: &FrozenMemtable,
) -> Result<Arc<TableHandle>> {
    let number = state.next_file_number();
    let path = config.dir.join(table_file_name(number));

    let mut builder = TableBuilder::create(&path, config.block_size, config.bloom_filter_bits)?;
    let visibility_floor = state.compaction_visibility_floor();
    let mut current_key: Option<Vec<u8>> = None;
    let mut key_resolved = false;

    for record in memtable.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                builder.abandon();
                return Err(e);
            }
        };
        // Records arrive newest-first per key; once a version at or below
        // the visibility floor is kept, everything older is dead.
        if current_key.as_deref() != Some(record.key.as_slice()) {
            current_key = Some(record.key.clone());
            key_resolved = false;
        } else if key_resolved {
            continue;
        }
        if record.seq <= visibility_floor {
            key_resolved = true;
        }
        if let Err(e) = builder.add(&record) {
            builder.abandon();
            return Err(e);
        }
    }

    let summary = builder.finish()?;
    let meta = TableMeta {
        number,
        level: 0,
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
        state.block_cache.clone(),
        state.counters.clone(),
    )?;

    Counters::bump(&state.counters.memtable_flushes);
    Counters::add(&state.counters.bytes_flushed, meta.size);
    tracing::info!(
        table = number,
        entries = meta.entry_count,
        bytes = meta.size,
        "flushed memtable to level 0"
    );

    Ok(Arc::new(TableHandle::new(meta, table, path)))
}

/// Durably records the flush in the manifest, then installs the new
/// version.
fn commit_flush(
    state: &LsmState,
    config: &Config,
    handle: Option<Arc<TableHandle>>,
    new_log_number: u64,
) -> Result<()> {
    use crate::store::lsm::manifest::edit::VersionEdit;
    use std::sync::atomic::Ordering;

    let edit = VersionEdit {
        added: handle.iter().map(|h| h.meta.clone()).collect(),
        removed: Vec::new(),
        next_file_number: state.next_file_number.load(Ordering::SeqCst),
        last_sequence: state.last_sequence(),
        log_number: new_log_number,
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

    if let Some(handle) = handle {
        let version = state
            .current_version()
            .apply(vec![handle], &[], config.max_level);
        state.install_version(version);
    }
    state.log_number.store(new_log_number, Ordering::SeqCst);

    Ok(())
}
