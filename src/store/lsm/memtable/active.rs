use std::ops::RangeBounds;
use std::sync::Arc;

use super::{core::Memtable, core::MemtableIterator, frozen::FrozenMemtable};
use crate::error::Result;
use crate::store::lsm::record::Record;
use crate::store::lsm::wal::Wal;

/// The one memtable currently accepting writes.
pub struct ActiveMemtable {
    memtable: Arc<Memtable>,
    log_number: u64,
}

impl ActiveMemtable {
    pub fn new(wal: Wal) -> Self {
        let log_number = wal.number();
        Self {
            memtable: Arc::new(Memtable::new(wal)),
            log_number,
        }
    }

    /// Rebuilds the active memtable from a recovered WAL segment.
    pub fn from_wal(wal: Wal, skip_seq: u64) -> Result<(Self, u64)> {
        let log_number = wal.number();
        let (memtable, max_seq) = Memtable::from_wal(wal, skip_seq)?;
        Ok((
            Self {
                memtable: Arc::new(memtable),
                log_number,
            },
            max_seq,
        ))
    }

    pub fn put(&self, record: Record) -> Result<()> {
        self.memtable.put(record)
    }

    pub fn get(&self, key: &[u8], snapshot: u64) -> Option<Option<Vec<u8>>> {
        self.memtable.get(key, snapshot)
    }

    pub fn size(&self) -> usize {
        self.memtable.size()
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    pub fn sync(&self) -> Result<()> {
        self.memtable.sync()
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn iter(&self, range: impl RangeBounds<Vec<u8>>) -> MemtableIterator {
        self.memtable.iter(range)
    }

    /// Seals this memtable and hands it over to the flush queue.
    pub fn freeze(&self) -> Result<FrozenMemtable> {
        self.memtable.freeze()?;
        Ok(FrozenMemtable::new(self.memtable.clone(), self.log_number))
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }
}
