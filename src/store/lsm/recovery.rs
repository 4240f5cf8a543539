//! Open-time state reconstruction.
//!
//! Order matters: the manifest names the live tables and the floor of WAL
//! segments still holding unflushed data; segments at or past that floor
//! are replayed (ascending) into memtables, skipping records already
//! covered by flushed tables. The newest segment becomes the active
//! memtable, the rest re-enter the flush queue.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::{Config, SyncMode};
use crate::error::Result;
use crate::store::lsm::cache::BlockCache;
use crate::store::lsm::manifest::edit::VersionEdit;
use crate::store::lsm::manifest::{Manifest, ManifestState, TableHandle, Version};
use crate::store::lsm::memtable::{ActiveMemtable, FrozenMemtable};
use crate::store::lsm::metrics::Counters;
use crate::store::lsm::sstable::{table_file_name, Table};
use crate::store::lsm::state::LsmState;
use crate::store::lsm::wal::{self, segment_file_name, Wal};
use crate::Error;

pub(crate) fn recover_state(
    config: &Config,
    counters: Arc<Counters>,
    block_cache: Option<Arc<BlockCache>>,
) -> Result<LsmState> {
    let dir = &config.dir;

    // Manifest first: it defines the table set and the WAL floor.
    let (mut manifest, manifest_state) = match Manifest::open_current(dir)? {
        Some(manifest) => {
            let state = manifest.replay()?;
            (manifest, state)
        }
        None => {
            if config.read_only {
                return Err(Error::InvalidArgument(
                    "cannot open a missing store read-only".to_string(),
                ));
            }
            let first_edit = VersionEdit {
                next_file_number: 2,
                ..Default::default()
            };
            let manifest = Manifest::create(dir, 1, &first_edit)?;
            let state = ManifestState {
                next_file_number: 2,
                ..Default::default()
            };
            (manifest, state)
        }
    };

    let version = load_version(config, &manifest_state, &counters, &block_cache)?;
    version.validate()?;

    // WAL segments past the floor feed the memtables.
    let mut next_file_number = manifest_state.next_file_number.max(2);
    let mut last_sequence = manifest_state.last_sequence;
    let sync_every_frame = matches!(config.wal_sync, SyncMode::Always);

    let segments = wal::discover_segments(dir)?;
    let mut stale = Vec::new();
    let mut live = Vec::new();
    for (number, path) in segments {
        next_file_number = next_file_number.max(number + 1);
        if number < manifest_state.log_number {
            stale.push(path);
        } else {
            live.push((number, path));
        }
    }

    let mut frozen = VecDeque::new();
    let mut active: Option<ActiveMemtable> = None;

    for (i, (number, path)) in live.iter().enumerate() {
        let segment = Wal::open(path, *number, sync_every_frame)?;
        if i + 1 == live.len() {
            let (memtable, max_seq) =
                ActiveMemtable::from_wal(segment, manifest_state.last_sequence)?;
            last_sequence = last_sequence.max(max_seq);
            active = Some(memtable);
        } else {
            let (memtable, max_seq) =
                FrozenMemtable::from_wal(segment, manifest_state.last_sequence)?;
            last_sequence = last_sequence.max(max_seq);
            frozen.push_back(Arc::new(memtable));
        }
    }

    let active = match active {
        Some(active) => active,
        None => {
            let number = next_file_number;
            next_file_number += 1;
            let path = dir.join(segment_file_name(number));
            ActiveMemtable::new(Wal::open(path, number, sync_every_frame)?)
        }
    };

    let log_number = frozen
        .front()
        .map(|m: &Arc<FrozenMemtable>| m.log_number())
        .unwrap_or_else(|| active.log_number());

    if !config.read_only {
        for path in stale {
            tracing::debug!(path = %path.display(), "removing stale WAL segment");
            let _ = std::fs::remove_file(path);
        }

        // Persist the recovered counters so a crash before the next flush
        // cannot reuse file numbers or sequences.
        manifest.append(&VersionEdit {
            next_file_number,
            last_sequence,
            log_number,
            ..Default::default()
        })?;
    }

    tracing::info!(
        tables = version.table_count(),
        frozen = frozen.len(),
        last_sequence,
        next_file_number,
        "recovery complete"
    );

    Ok(LsmState::new(
        active,
        frozen,
        version,
        manifest,
        next_file_number,
        last_sequence,
        log_number,
        counters,
        block_cache,
        config,
    ))
}

fn load_version(
    config: &Config,
    state: &ManifestState,
    counters: &Arc<Counters>,
    block_cache: &Option<Arc<BlockCache>>,
) -> Result<Version> {
    let max_level = config.max_level.max(state.levels.len());
    let mut handles = Vec::new();

    for metas in &state.levels {
        for meta in metas {
            let path = config.dir.join(table_file_name(meta.number));
            if !path.exists() {
                return Err(Error::Corruption(format!(
                    "manifest references missing table {}",
                    path.display()
                )));
            }
            let table = Table::open(&path, meta.number, block_cache.clone(), counters.clone())?;
            handles.push(Arc::new(TableHandle::new(meta.clone(), table, path)));
        }
    }

    Ok(Version::new(max_level).apply(handles, &[], max_level))
}
