//! SSTable files: building, opening and reading.
//!
//! # File layout
//!
//! ```text
//! +--------------------+
//! | data block 0..k    |
//! +--------------------+
//! | bloom block (opt.) |
//! +--------------------+
//! | index block        |
//! +--------------------+
//! | footer (40 bytes)  |
//! +--------------------+
//! ```
//!
//! Footer: `index_off:u64 | index_len:u32 | filter_off:u64 |
//! filter_len:u32 | reserved:[u8;8] | magic:u64`. A zero `filter_len`
//! means the table was written without a bloom filter.
//!
//! A table is written once through [`TableBuilder`] (records arrive in
//! internal-key order, blocks are cut at the configured size, the file is
//! fsync'd and renamed into place) and then only ever read through
//! [`Table`].

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::block::{self, load_block, MultiBlockIterator};
use super::bloom::{BloomBuilder, BloomFilter};
use super::index::Index;
use crate::error::Result;
use crate::store::lsm::cache::BlockCache;
use crate::store::lsm::filter::RangeFilter;
use crate::store::lsm::metrics::Counters;
use crate::store::lsm::record::Record;
use crate::Error;

pub const FOOTER_SIZE: u64 = 40;
pub const TABLE_MAGIC: u64 = 0xDB4D_15C0_FFEE_5000;

/// File name for a table with the given file number.
pub fn table_file_name(number: u64) -> String {
    format!("{:06}.sst", number)
}

/// Everything the manifest needs to know about a freshly written table.
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub file_size: u64,
    pub entry_count: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub smallest_seq: u64,
    pub largest_seq: u64,
}

/// Writes a table to `<path>.tmp`, then renames it into place on finish.
pub struct TableBuilder {
    file: File,
    tmp_path: PathBuf,
    path: PathBuf,
    block_size: usize,
    offset: u64,

    block: block::Builder,
    first_key_in_block: Option<Vec<u8>>,
    index: Index,
    bloom: Option<BloomBuilder>,

    entry_count: u64,
    smallest_key: Option<Vec<u8>>,
    largest_key: Vec<u8>,
    smallest_seq: u64,
    largest_seq: u64,
}

impl TableBuilder {
    /// `bloom_bits_per_key == 0` disables the filter block.
    pub fn create(path: impl Into<PathBuf>, block_size: usize, bloom_bits_per_key: usize) -> Result<Self> {
        let path = path.into();
        let tmp_path = path.with_extension("sst.tmp");
        let file = File::create(&tmp_path)?;

        Ok(Self {
            file,
            tmp_path,
            path,
            block_size,
            offset: 0,
            block: block::Builder::new(),
            first_key_in_block: None,
            index: Index::new(),
            bloom: (bloom_bits_per_key > 0).then(|| BloomBuilder::new(bloom_bits_per_key)),
            entry_count: 0,
            smallest_key: None,
            largest_key: Vec::new(),
            smallest_seq: u64::MAX,
            largest_seq: 0,
        })
    }

    /// Appends a record. Records must arrive in `(key asc, seq desc)` order.
    pub fn add(&mut self, record: &Record) -> Result<()> {
        let new_user_key = self.smallest_key.is_none() || self.largest_key != record.key;

        // Cut only between user keys, so every version of a key lands in
        // one block and a point lookup never has to cross blocks.
        if new_user_key && self.block.len() >= self.block_size {
            self.cut_block()?;
        }

        if self.smallest_key.is_none() {
            self.smallest_key = Some(record.key.clone());
        }
        if new_user_key {
            if let Some(bloom) = &mut self.bloom {
                bloom.add_key(&record.key);
            }
        }
        self.largest_key.clear();
        self.largest_key.extend_from_slice(&record.key);
        self.smallest_seq = self.smallest_seq.min(record.seq);
        self.largest_seq = self.largest_seq.max(record.seq);

        if self.first_key_in_block.is_none() {
            self.first_key_in_block = Some(record.key.clone());
        }
        self.block.add(record);
        self.entry_count += 1;
        Ok(())
    }

    /// The user key of the most recently added record.
    pub fn last_key(&self) -> &[u8] {
        &self.largest_key
    }

    /// Bytes written plus the pending block, used for output rolling.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    fn cut_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.block).finish();
        let first_key = self
            .first_key_in_block
            .take()
            .ok_or_else(|| Error::InvalidOperation("data block without first key".to_string()))?;

        self.file.write_all(&data)?;
        self.index.push(first_key, self.offset, data.len() as u64);
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Writes filter, index and footer, fsyncs and renames into place.
    pub fn finish(mut self) -> Result<BuildSummary> {
        if self.entry_count == 0 {
            return Err(Error::InvalidOperation(
                "cannot finish an empty table".to_string(),
            ));
        }
        self.cut_block()?;

        let (filter_off, filter_len) = match self.bloom.take() {
            Some(builder) => {
                let data = builder.finish().encode();
                self.file.write_all(&data)?;
                let extent = (self.offset, data.len() as u32);
                self.offset += data.len() as u64;
                extent
            }
            None => (0, 0),
        };

        let index_data = self.index.encode();
        self.file.write_all(&index_data)?;
        let index_off = self.offset;
        let index_len = index_data.len() as u32;
        self.offset += index_data.len() as u64;

        self.file.write_u64::<BigEndian>(index_off)?;
        self.file.write_u32::<BigEndian>(index_len)?;
        self.file.write_u64::<BigEndian>(filter_off)?;
        self.file.write_u32::<BigEndian>(filter_len)?;
        self.file.write_all(&[0u8; 8])?;
        self.file.write_u64::<BigEndian>(TABLE_MAGIC)?;

        self.file.sync_all()?;
        std::fs::rename(&self.tmp_path, &self.path)?;

        Ok(BuildSummary {
            file_size: self.offset + FOOTER_SIZE,
            entry_count: self.entry_count,
            smallest_key: self.smallest_key.unwrap_or_default(),
            largest_key: self.largest_key,
            smallest_seq: self.smallest_seq,
            largest_seq: self.largest_seq,
        })
    }

    /// Abandons the build and removes the temporary file.
    pub fn abandon(self) {
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

/// An open, immutable table.
pub struct Table {
    file: File,
    file_number: u64,
    index: Index,
    filter: Option<BloomFilter>,
    cache: Option<Arc<BlockCache>>,
    counters: Arc<Counters>,
}

impl Table {
    pub fn open(
        path: &Path,
        file_number: u64,
        cache: Option<Arc<BlockCache>>,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "table {} shorter than footer",
                path.display()
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let index_off = file.read_u64::<BigEndian>()?;
        let index_len = file.read_u32::<BigEndian>()?;
        let filter_off = file.read_u64::<BigEndian>()?;
        let filter_len = file.read_u32::<BigEndian>()?;
        let mut reserved = [0u8; 8];
        file.read_exact(&mut reserved)?;
        let magic = file.read_u64::<BigEndian>()?;

        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic {:#x} in {}",
                magic,
                path.display()
            )));
        }
        if index_off + index_len as u64 + FOOTER_SIZE > file_size {
            return Err(Error::Corruption(format!(
                "table index extent out of bounds in {}",
                path.display()
            )));
        }

        let mut index_data = vec![0u8; index_len as usize];
        file.seek(SeekFrom::Start(index_off))?;
        file.read_exact(&mut index_data)?;
        let index = Index::decode(&index_data)?;

        let filter = if filter_len > 0 {
            let mut filter_data = vec![0u8; filter_len as usize];
            file.seek(SeekFrom::Start(filter_off))?;
            file.read_exact(&mut filter_data)?;
            Some(BloomFilter::decode(&filter_data)?)
        } else {
            None
        };

        Ok(Self {
            file,
            file_number,
            index,
            filter,
            cache,
            counters,
        })
    }

    /// Newest record for `key` visible at `snapshot`, consulting the bloom
    /// filter before any block is touched.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Result<Option<Record>> {
        if let Some(filter) = &self.filter {
            if !filter.may_contain(key) {
                Counters::bump(&self.counters.bloom_negatives);
                return Ok(None);
            }
        }

        let Some((offset, size)) = self.index.find(key) else {
            return Ok(None);
        };

        let mut file = self.file.try_clone()?;
        let block = load_block(
            &mut file,
            self.file_number,
            offset,
            size,
            self.cache.as_deref(),
            &self.counters,
        )?;
        block.get(key, snapshot)
    }

    /// Forward scan over the user-key range, yielding every stored version.
    pub fn scan<R>(&self, range: R) -> Result<ScanIterator<R>>
    where
        R: RangeBounds<Vec<u8>> + Clone + Send + Sync,
    {
        let blocks = self.index.range(range.clone());
        let mut iter = MultiBlockIterator::new(
            self.file.try_clone()?,
            self.file_number,
            blocks,
            self.cache.clone(),
            self.counters.clone(),
        );

        if let std::ops::Bound::Included(start) | std::ops::Bound::Excluded(start) =
            range.start_bound()
        {
            iter.seek_first_block(start)?;
        }

        Ok(RangeFilter::new(iter, range))
    }
}

/// Range-bounded table scan.
pub type ScanIterator<R> = RangeFilter<MultiBlockIterator, R>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn build_table(dir: &TempDir, records: &[Record]) -> (PathBuf, BuildSummary) {
        let path = dir.path().join(table_file_name(1));
        let mut builder = TableBuilder::create(&path, 4096, 10).unwrap();
        for record in records {
            builder.add(record).unwrap();
        }
        let summary = builder.finish().unwrap();
        (path, summary)
    }

    fn open_table(path: &Path) -> Table {
        Table::open(path, 1, None, Arc::new(Counters::default())).unwrap()
    }

    fn numbered_records(count: u32) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Record::set(
                    format!("key_{i:04}").into_bytes(),
                    i as u64 + 1,
                    format!("value_{i:04}").into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_build_and_get() {
        let dir = TempDir::new().unwrap();
        let records = numbered_records(500);
        let (path, summary) = build_table(&dir, &records);

        assert_eq!(summary.entry_count, 500);
        assert_eq!(summary.smallest_key, b"key_0000");
        assert_eq!(summary.largest_key, b"key_0499");
        assert_eq!(summary.smallest_seq, 1);
        assert_eq!(summary.largest_seq, 500);

        let table = open_table(&path);
        for record in &records {
            let found = table.get(&record.key, u64::MAX).unwrap().unwrap();
            assert_eq!(found.value, record.value);
        }
        assert!(table.get(b"missing", u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_versions_and_snapshots() {
        let dir = TempDir::new().unwrap();
        let records = vec![
            Record::set(b"k".to_vec(), 9, b"new".to_vec()),
            Record::set(b"k".to_vec(), 4, b"old".to_vec()),
            Record::tombstone(b"z".to_vec(), 7),
        ];
        let (path, _) = build_table(&dir, &records);
        let table = open_table(&path);

        assert_eq!(table.get(b"k", u64::MAX).unwrap().unwrap().value, b"new");
        assert_eq!(table.get(b"k", 8).unwrap().unwrap().value, b"old");
        assert!(table.get(b"k", 3).unwrap().is_none());
        assert!(table.get(b"z", u64::MAX).unwrap().unwrap().is_tombstone());
    }

    #[test]
    fn test_scan_range() {
        let dir = TempDir::new().unwrap();
        let records = numbered_records(100);
        let (path, _) = build_table(&dir, &records);
        let table = open_table(&path);

        let scanned: Vec<Record> = table
            .scan(b"key_0010".to_vec()..b"key_0015".to_vec())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let keys: Vec<&[u8]> = scanned.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(
            keys,
            vec![
                &b"key_0010"[..],
                b"key_0011",
                b"key_0012",
                b"key_0013",
                b"key_0014"
            ]
        );
    }

    #[test]
    fn test_multi_block_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(table_file_name(2));
        // Tiny blocks force many index entries.
        let mut builder = TableBuilder::create(&path, 128, 10).unwrap();
        let records = numbered_records(300);
        for record in &records {
            builder.add(record).unwrap();
        }
        builder.finish().unwrap();

        let table = open_table(&path);
        assert!(table.index.len() > 10, "expected many data blocks");

        for record in records.iter().step_by(17) {
            let found = table.get(&record.key, u64::MAX).unwrap().unwrap();
            assert_eq!(found.value, record.value);
        }

        let all: Vec<Record> = table.scan(..).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(all.len(), 300);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let (path, _) = build_table(&dir, &numbered_records(10));

        let mut file = File::options().write(true).open(&path).unwrap();
        file.seek(SeekFrom::End(-8)).unwrap();
        file.write_u64::<BigEndian>(0xDEAD_BEEF).unwrap();
        file.sync_all().unwrap();

        let result = Table::open(&path, 1, None, Arc::new(Counters::default()));
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_empty_builder_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(table_file_name(3));
        let builder = TableBuilder::create(&path, 4096, 10).unwrap();
        assert!(matches!(
            builder.finish(),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_no_bloom_filter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(table_file_name(4));
        let mut builder = TableBuilder::create(&path, 4096, 0).unwrap();
        builder
            .add(&Record::set(b"k".to_vec(), 1, b"v".to_vec()))
            .unwrap();
        builder.finish().unwrap();

        let table = open_table(&path);
        assert!(table.filter.is_none());
        assert_eq!(table.get(b"k", u64::MAX).unwrap().unwrap().value, b"v");
    }

    #[test]
    fn test_block_cache_serves_repeat_reads() {
        let dir = TempDir::new().unwrap();
        let (path, _) = build_table(&dir, &numbered_records(100));

        let counters = Arc::new(Counters::default());
        let cache = Arc::new(BlockCache::new(64 * 4096, 4096));
        let table = Table::open(&path, 1, Some(cache.clone()), counters.clone()).unwrap();

        table.get(b"key_0005", u64::MAX).unwrap().unwrap();
        let reads_after_first = counters
            .block_reads
            .load(std::sync::atomic::Ordering::Relaxed);
        table.get(b"key_0005", u64::MAX).unwrap().unwrap();
        assert_eq!(
            reads_after_first,
            counters
                .block_reads
                .load(std::sync::atomic::Ordering::Relaxed),
            "second lookup must be served from the cache"
        );
    }
}
