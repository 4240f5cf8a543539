use std::ops::RangeBounds;
use std::sync::Arc;

use super::core::{Memtable, MemtableIterator};
use crate::error::Result;
use crate::store::lsm::record::Record;
use crate::store::lsm::wal::Wal;

/// A sealed memtable queued for flushing to level 0.
pub struct FrozenMemtable {
    memtable: Arc<Memtable>,
    log_number: u64,
}

impl FrozenMemtable {
    pub fn new(memtable: Arc<Memtable>, log_number: u64) -> Self {
        Self {
            memtable,
            log_number,
        }
    }

    /// Rebuilds a frozen memtable from a recovered WAL segment.
    pub fn from_wal(wal: Wal, skip_seq: u64) -> Result<(Self, u64)> {
        let log_number = wal.number();
        let (memtable, max_seq) = Memtable::from_wal(wal, skip_seq)?;
        memtable.freeze()?;
        Ok((
            Self {
                memtable: Arc::new(memtable),
                log_number,
            },
            max_seq,
        ))
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn get(&self, key: &[u8], snapshot: u64) -> Option<Option<Vec<u8>>> {
        self.memtable.get(key, snapshot)
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    pub fn iter(&self, range: impl RangeBounds<Vec<u8>>) -> MemtableIterator {
        self.memtable.iter(range)
    }

    /// All records, for flushing. The flush path deduplicates user keys.
    pub fn records(&self) -> impl Iterator<Item = Result<Record>> {
        self.memtable.iter(..)
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }
}
