//! In-memory view of the live file set.
//!
//! A [`Version`] is an immutable snapshot of `{level -> tables}`. Installing
//! a manifest edit builds a new `Version`; readers that hold an `Arc` to an
//! older one keep seeing its file set until they drop it. Table files are
//! unlinked only when the last handle drops (deferred deletion), so an open
//! iterator can outlive the compaction that replaced its inputs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::meta::TableMeta;
use crate::error::Result;
use crate::store::lsm::record::Record;
use crate::store::lsm::sstable::Table;

/// A live table: manifest metadata plus the open reader.
pub struct TableHandle {
    pub meta: TableMeta,
    pub table: Table,
    pub path: PathBuf,
    obsolete: AtomicBool,
}

impl TableHandle {
    pub fn new(meta: TableMeta, table: Table, path: PathBuf) -> Self {
        Self {
            meta,
            table,
            path,
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn number(&self) -> u64 {
        self.meta.number
    }

    /// Marks the file for deletion once every reader has released it.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to unlink obsolete table");
                }
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct Level {
    pub tables: Vec<Arc<TableHandle>>,
}

impl Level {
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn size(&self) -> u64 {
        self.tables.iter().map(|t| t.meta.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Tables whose key range intersects `[smallest, largest]`.
    pub fn overlapping(&self, smallest: &[u8], largest: &[u8]) -> Vec<Arc<TableHandle>> {
        self.tables
            .iter()
            .filter(|t| t.meta.overlaps(smallest, largest))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct Version {
    /// `levels[0]` is L0 with newest table first; levels >= 1 hold disjoint
    /// tables sorted by smallest key.
    pub levels: Vec<Level>,
}

impl Version {
    pub fn new(max_level: usize) -> Self {
        Self {
            levels: vec![Level::default(); max_level],
        }
    }

    pub fn level(&self, level: usize) -> &Level {
        &self.levels[level]
    }

    pub fn max_level(&self) -> usize {
        self.levels.len()
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(|l| l.table_count()).sum()
    }

    /// Point lookup across all levels: L0 newest-first, then each deeper
    /// level. The first record found is the newest visible one because
    /// deeper sources only hold older sequences for any given key.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Result<Option<Record>> {
        for table in &self.levels[0].tables {
            if !table.meta.overlaps(key, key) {
                continue;
            }
            if let Some(record) = table.table.get(key, snapshot)? {
                return Ok(Some(record));
            }
        }

        for level in &self.levels[1..] {
            // Disjoint ranges: at most one table can hold the key.
            let idx = level
                .tables
                .partition_point(|t| t.meta.largest_key.as_slice() < key);
            if let Some(table) = level.tables.get(idx) {
                if table.meta.overlaps(key, key) {
                    if let Some(record) = table.table.get(key, snapshot)? {
                        return Ok(Some(record));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Builds the successor version with `removed` tables dropped and
    /// `added` handles inserted at their levels.
    pub fn apply(
        &self,
        added: Vec<Arc<TableHandle>>,
        removed: &[(u32, u64)],
        max_level: usize,
    ) -> Version {
        let mut levels: Vec<Level> = self.levels.clone();
        while levels.len() < max_level {
            levels.push(Level::default());
        }

        for (level, number) in removed {
            if let Some(level) = levels.get_mut(*level as usize) {
                level.tables.retain(|t| t.number() != *number);
            }
        }

        for handle in added {
            let level = handle.meta.level as usize;
            while levels.len() <= level {
                levels.push(Level::default());
            }
            let tables = &mut levels[level].tables;
            if level == 0 {
                // Newest file first.
                let idx = tables.partition_point(|t| t.number() > handle.number());
                tables.insert(idx, handle);
            } else {
                let idx = tables
                    .partition_point(|t| t.meta.smallest_key < handle.meta.smallest_key);
                tables.insert(idx, handle);
            }
        }

        Version { levels }
    }

    /// Checks the structural invariants: unique file numbers, ordered key
    /// ranges per table, and pairwise-disjoint tables on levels >= 1.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();

        for (level_idx, level) in self.levels.iter().enumerate() {
            let mut prev_largest: Option<&[u8]> = None;

            for table in &level.tables {
                if !seen.insert(table.number()) {
                    return Err(crate::Error::Corruption(format!(
                        "table {:06} appears in two levels",
                        table.number()
                    )));
                }
                if table.meta.smallest_key > table.meta.largest_key {
                    return Err(crate::Error::Corruption(format!(
                        "table {:06} has smallest_key > largest_key",
                        table.number()
                    )));
                }
                if level_idx > 0 {
                    if let Some(prev) = prev_largest {
                        if table.meta.smallest_key.as_slice() <= prev {
                            return Err(crate::Error::Corruption(format!(
                                "level {} tables overlap at table {:06}",
                                level_idx,
                                table.number()
                            )));
                        }
                    }
                    prev_largest = Some(&table.meta.largest_key);
                }
            }
        }

        Ok(())
    }
}
