//! In-memory sorted table over a concurrent skip list.
//!
//! The memtable is the first stop for every write and the newest source on
//! the read path. Entries are keyed by [`InternalKey`] (user key ascending,
//! sequence descending), so multiple versions of one user key coexist until
//! flush and a scan meets the newest version first.
//!
//! `crossbeam_skiplist::SkipMap` gives lock-free concurrent readers, ordered
//! traversal and range queries without any unsafe code, which is exactly the
//! access pattern the engine needs: many concurrent point reads and scans
//! against a structure that a single serialized writer appends to.
//!
//! Each memtable is paired with one WAL segment: a record is appended to the
//! segment before it is inserted, and the segment is removed after the
//! memtable has been flushed into an SSTable.

use crossbeam_skiplist::SkipMap;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::store::lsm::record::{InternalKey, Op, Record, MAX_SEQ};
use crate::store::lsm::wal::Wal;
use crate::Error;

/// Stored value: `None` marks a tombstone.
type StoredValue = Option<Vec<u8>>;

#[derive(Debug)]
pub struct Memtable {
    data: Arc<SkipMap<InternalKey, StoredValue>>,
    wal: Arc<Wal>,
    size: AtomicUsize,
    frozen: AtomicBool,
}

impl Memtable {
    /// Creates an empty memtable backed by the given WAL segment.
    pub fn new(wal: Wal) -> Self {
        Self {
            data: Arc::new(SkipMap::new()),
            wal: Arc::new(wal),
            size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Rebuilds a memtable by replaying its WAL segment, skipping records
    /// already covered by flushed tables (`seq <= skip_seq`). Returns the
    /// memtable and the largest sequence seen in the segment.
    pub fn from_wal(wal: Wal, skip_seq: u64) -> Result<(Self, u64)> {
        let data: Arc<SkipMap<InternalKey, StoredValue>> = Arc::new(SkipMap::new());
        let size = AtomicUsize::new(0);
        let mut max_seq = 0;

        for record in wal.replay()? {
            max_seq = max_seq.max(record.seq);
            if record.seq <= skip_seq {
                continue;
            }
            size.fetch_add(record.encoded_len(), Ordering::SeqCst);
            let value = match record.op {
                Op::Set => Some(record.value),
                Op::Delete => None,
            };
            data.insert(InternalKey::new(record.key, record.seq), value);
        }

        Ok((
            Self {
                data,
                wal: Arc::new(wal),
                size,
                frozen: AtomicBool::new(false),
            },
            max_seq,
        ))
    }

    /// Appends the record to the WAL and inserts it. Fails with `ReadOnly`
    /// once the memtable has been frozen.
    pub fn put(&self, record: Record) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }

        self.wal.append(&record)?;

        let entry_size = record.encoded_len();
        let value = match record.op {
            Op::Set => Some(record.value),
            Op::Delete => None,
        };
        self.data.insert(InternalKey::new(record.key, record.seq), value);
        self.size.fetch_add(entry_size, Ordering::SeqCst);

        Ok(())
    }

    /// Returns the newest version of `key` with `seq <= snapshot`.
    /// `Some(None)` is a tombstone hit: the key is known deleted and older
    /// sources must not be consulted.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Option<StoredValue> {
        let target = InternalKey::lookup(key, snapshot);
        let entry = self.data.lower_bound(Bound::Included(&target))?;
        if entry.key().user_key == key {
            Some(entry.value().clone())
        } else {
            None
        }
    }

    /// Approximate size of the memtable in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Seals the memtable against further writes.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Fsyncs the backing WAL segment.
    pub fn sync(&self) -> Result<()> {
        self.wal.sync()
    }

    /// All versioned records within the user-key range, newest version of
    /// each key first.
    pub fn iter(&self, range: impl RangeBounds<Vec<u8>>) -> MemtableIterator {
        MemtableIterator {
            data: self.data.clone(),
            upper: internal_upper_bound(&range),
            cursor: match internal_lower_bound(&range) {
                Bound::Included(key) => Cursor::Start(key),
                Bound::Unbounded => Cursor::Begin,
                // Lower bounds are always inclusive or unbounded here.
                Bound::Excluded(key) => Cursor::After(key),
            },
        }
    }
}

/// Maps a user-key lower bound onto the internal key space. The smallest
/// internal key for user key `k` is `(k, MAX_SEQ)`, the largest `(k, 0)`.
fn internal_lower_bound(range: &impl RangeBounds<Vec<u8>>) -> Bound<InternalKey> {
    match range.start_bound() {
        Bound::Included(key) => Bound::Included(InternalKey::new(key.clone(), MAX_SEQ)),
        Bound::Excluded(key) => Bound::Excluded(InternalKey::new(key.clone(), 0)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn internal_upper_bound(range: &impl RangeBounds<Vec<u8>>) -> Bound<InternalKey> {
    match range.end_bound() {
        Bound::Included(key) => Bound::Included(InternalKey::new(key.clone(), 0)),
        Bound::Excluded(key) => Bound::Excluded(InternalKey::new(key.clone(), MAX_SEQ)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

enum Cursor {
    Begin,
    Start(InternalKey),
    After(InternalKey),
}

/// Lazy iterator that re-seeks the skip list for each step, so it stays
/// valid while concurrent inserts land in the same memtable.
pub struct MemtableIterator {
    data: Arc<SkipMap<InternalKey, StoredValue>>,
    upper: Bound<InternalKey>,
    cursor: Cursor,
}

impl Iterator for MemtableIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let lower = match &self.cursor {
            Cursor::Begin => Bound::Unbounded,
            Cursor::Start(key) => Bound::Included(key.clone()),
            Cursor::After(key) => Bound::Excluded(key.clone()),
        };

        let entry = self.data.range((lower, self.upper.clone())).next()?;
        let internal = entry.key().clone();
        let record = match entry.value() {
            Some(value) => Record::set(internal.user_key.clone(), internal.seq, value.clone()),
            None => Record::tombstone(internal.user_key.clone(), internal.seq),
        };
        self.cursor = Cursor::After(internal);
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lsm::wal::segment_file_name;
    use crate::tmpfs::TempDir;

    fn temp_memtable(dir: &TempDir) -> Memtable {
        let path = dir.path().join(segment_file_name(1));
        Memtable::new(Wal::open(path, 1, false).unwrap())
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let memtable = temp_memtable(&dir);

        memtable
            .put(Record::set(b"key1".to_vec(), 1, b"value1".to_vec()))
            .unwrap();
        memtable
            .put(Record::set(b"key2".to_vec(), 2, b"value2".to_vec()))
            .unwrap();
        memtable.put(Record::tombstone(b"key3".to_vec(), 3)).unwrap();

        assert_eq!(
            memtable.get(b"key1", MAX_SEQ),
            Some(Some(b"value1".to_vec()))
        );
        assert_eq!(
            memtable.get(b"key2", MAX_SEQ),
            Some(Some(b"value2".to_vec()))
        );
        assert_eq!(memtable.get(b"key3", MAX_SEQ), Some(None));
        assert_eq!(memtable.get(b"key4", MAX_SEQ), None);
    }

    #[test]
    fn test_get_respects_snapshot() {
        let dir = TempDir::new().unwrap();
        let memtable = temp_memtable(&dir);

        memtable
            .put(Record::set(b"k".to_vec(), 5, b"v5".to_vec()))
            .unwrap();
        memtable
            .put(Record::set(b"k".to_vec(), 9, b"v9".to_vec()))
            .unwrap();

        assert_eq!(memtable.get(b"k", MAX_SEQ), Some(Some(b"v9".to_vec())));
        assert_eq!(memtable.get(b"k", 9), Some(Some(b"v9".to_vec())));
        assert_eq!(memtable.get(b"k", 8), Some(Some(b"v5".to_vec())));
        assert_eq!(memtable.get(b"k", 4), None);
    }

    #[test]
    fn test_newest_version_first_in_scans() {
        let dir = TempDir::new().unwrap();
        let memtable = temp_memtable(&dir);

        memtable
            .put(Record::set(b"a".to_vec(), 1, b"old".to_vec()))
            .unwrap();
        memtable
            .put(Record::set(b"a".to_vec(), 4, b"new".to_vec()))
            .unwrap();
        memtable
            .put(Record::set(b"b".to_vec(), 2, b"vb".to_vec()))
            .unwrap();

        let records: Vec<Record> = memtable.iter(..).map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        assert_eq!((records[0].key.as_slice(), records[0].seq), (&b"a"[..], 4));
        assert_eq!((records[1].key.as_slice(), records[1].seq), (&b"a"[..], 1));
        assert_eq!((records[2].key.as_slice(), records[2].seq), (&b"b"[..], 2));
    }

    #[test]
    fn test_iter_end_exclusive() {
        let dir = TempDir::new().unwrap();
        let memtable = temp_memtable(&dir);

        for (i, key) in [b"a", b"b", b"c"].iter().enumerate() {
            memtable
                .put(Record::set(key.to_vec(), i as u64 + 1, b"v".to_vec()))
                .unwrap();
        }

        let keys: Vec<Vec<u8>> = memtable
            .iter(b"a".to_vec()..b"c".to_vec())
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        // An empty range yields nothing even when the bound key exists.
        assert_eq!(memtable.iter(b"a".to_vec()..b"a".to_vec()).count(), 0);
    }

    #[test]
    fn test_put_to_frozen_memtable() {
        let dir = TempDir::new().unwrap();
        let memtable = temp_memtable(&dir);

        memtable.freeze().unwrap();
        assert!(matches!(
            memtable.put(Record::set(b"k".to_vec(), 1, b"v".to_vec())),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(memtable.freeze(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_from_wal_skips_flushed_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(7));
        let wal = Wal::open(&path, 7, false).unwrap();
        wal.append(&Record::set(b"old".to_vec(), 3, b"v".to_vec()))
            .unwrap();
        wal.append(&Record::set(b"new".to_vec(), 8, b"v".to_vec()))
            .unwrap();
        wal.sync().unwrap();
        drop(wal);

        let wal = Wal::open(&path, 7, false).unwrap();
        let (memtable, max_seq) = Memtable::from_wal(wal, 5).unwrap();
        assert_eq!(max_seq, 8);
        assert_eq!(memtable.get(b"old", MAX_SEQ), None);
        assert_eq!(memtable.get(b"new", MAX_SEQ), Some(Some(b"v".to_vec())));
    }
}
