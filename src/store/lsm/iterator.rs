//! K-way merge over heterogeneous record sources.
//!
//! Scans pull from N ordered sources at once: the active memtable, any
//! frozen memtables, and every table the pinned version exposes for the
//! range. A min-heap keyed by `(user key asc, seq desc, source asc)` yields
//! a single globally ordered stream in which the newest version of each key
//! comes first.
//!
//! [`MergeIterator`] is the raw merged stream (every version, tombstones
//! included) and is what compaction consumes. [`LsmScanIterator`] layers the
//! read semantics on top: records above the snapshot are invisible, only the
//! newest visible version of each key is emitted, and tombstones mask older
//! versions without being emitted themselves.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::store::lsm::record::Record;

/// A boxed, owned record source. Sources own their underlying Arcs so an
/// iterator stays valid after memtable rotation or compaction.
pub type RecordSource = Box<dyn Iterator<Item = Result<Record>> + Send>;

struct HeapEntry {
    record: Record,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the std max-heap behaves as a min-heap over
    // (key asc, seq desc, source asc).
    fn cmp(&self, other: &Self) -> Ordering {
        self.record
            .key
            .cmp(&other.record.key)
            .then_with(|| other.record.seq.cmp(&self.record.seq))
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

/// Merges N ordered sources into one ordered stream of every record.
///
/// Each `next()` refills the heap by reading one step ahead in the source
/// it just drained. A failure on that look-ahead belongs to a *future*
/// position, so it is parked in `pending` and surfaced on the following
/// call; the record already popped is still returned.
pub struct MergeIterator {
    sources: Vec<RecordSource>,
    heap: BinaryHeap<HeapEntry>,
    pending: Option<crate::Error>,
}

impl MergeIterator {
    pub fn new(mut sources: Vec<RecordSource>) -> Self {
        let mut heap = BinaryHeap::new();
        let mut pending = None;

        for (source, iter) in sources.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok(record)) => heap.push(HeapEntry { record, source }),
                Some(Err(e)) => {
                    if pending.is_none() {
                        pending = Some(e);
                    }
                }
                None => {}
            }
        }

        Self {
            sources,
            heap,
            pending,
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending.take() {
            return Some(Err(e));
        }

        let entry = self.heap.pop()?;

        match self.sources[entry.source].next() {
            Some(Ok(record)) => self.heap.push(HeapEntry {
                record,
                source: entry.source,
            }),
            Some(Err(e)) => self.pending = Some(e),
            None => {}
        }

        Some(Ok(entry.record))
    }
}

/// The user-visible scan: resolves versions against a snapshot and hides
/// tombstones.
pub struct LsmScanIterator {
    merged: MergeIterator,
    snapshot: u64,
    last_key: Option<Vec<u8>>,
}

impl LsmScanIterator {
    pub fn new(sources: Vec<RecordSource>, snapshot: u64) -> Self {
        Self {
            merged: MergeIterator::new(sources),
            snapshot,
            last_key: None,
        }
    }
}

impl Iterator for LsmScanIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.merged.next()? {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };

            // Not yet visible at this snapshot; an older version of the
            // same key may still be.
            if record.seq > self.snapshot {
                continue;
            }

            // Older version of a key already resolved.
            if self.last_key.as_deref() == Some(record.key.as_slice()) {
                continue;
            }
            self.last_key = Some(record.key.clone());

            if record.is_tombstone() {
                continue;
            }

            return Some(Ok((record.key, record.value)));
        }
    }
}
