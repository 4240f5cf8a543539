//! Sparse first-key index over a table's data blocks.

use std::io::Read;
use std::ops::RangeBounds;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// One entry per data block: the block's first user key plus its file
/// extent. Entries are appended in key order while the table is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: Vec<(Vec<u8>, u64, u64)>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, first_key: Vec<u8>, offset: u64, size: u64) {
        self.entries.push((first_key, offset, size));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The block that may contain `key`: the last block whose first key is
    /// <= `key`. Returns `None` when `key` sorts before every block.
    pub fn find(&self, key: &[u8]) -> Option<(u64, u64)> {
        let idx = match self
            .entries
            .binary_search_by(|entry| entry.0.as_slice().cmp(key))
        {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (_, offset, size) = &self.entries[idx];
        Some((*offset, *size))
    }

    /// Extents of every block that may hold keys in `range`, in file order.
    pub fn range(&self, range: impl RangeBounds<Vec<u8>>) -> Vec<(u64, u64)> {
        use std::ops::Bound;

        let start = match range.start_bound() {
            Bound::Included(key) | Bound::Excluded(key) => {
                match self
                    .entries
                    .binary_search_by(|entry| entry.0.as_slice().cmp(key))
                {
                    Ok(idx) => idx,
                    // The preceding block may still contain the start key.
                    Err(idx) => idx.saturating_sub(1),
                }
            }
            Bound::Unbounded => 0,
        };

        let end = match range.end_bound() {
            Bound::Included(key) => {
                match self
                    .entries
                    .binary_search_by(|entry| entry.0.as_slice().cmp(key))
                {
                    Ok(idx) => idx + 1,
                    Err(idx) => idx,
                }
            }
            Bound::Excluded(key) => {
                match self
                    .entries
                    .binary_search_by(|entry| entry.0.as_slice().cmp(key))
                {
                    Ok(idx) => idx,
                    Err(idx) => idx,
                }
            }
            Bound::Unbounded => self.entries.len(),
        };

        if start >= end {
            return Vec::new();
        }
        self.entries[start..end]
            .iter()
            .map(|(_, offset, size)| (*offset, *size))
            .collect()
    }

    /// Serializes the index as `key_len:u32 | key | offset:u64 | size:u64`
    /// per entry.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (key, offset, size) in &self.entries {
            buf.write_u32::<BigEndian>(key.len() as u32).unwrap();
            buf.extend_from_slice(key);
            buf.write_u64::<BigEndian>(*offset).unwrap();
            buf.write_u64::<BigEndian>(*size).unwrap();
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let mut entries = Vec::new();

        while (cursor.position() as usize) < data.len() {
            let key_len = cursor.read_u32::<BigEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            cursor.read_exact(&mut key)?;
            let offset = cursor.read_u64::<BigEndian>()?;
            let size = cursor.read_u64::<BigEndian>()?;
            entries.push((key, offset, size));
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> Index {
        let mut index = Index::new();
        index.push(b"apple".to_vec(), 0, 100);
        index.push(b"banana".to_vec(), 100, 100);
        index.push(b"cherry".to_vec(), 200, 100);
        index
    }

    #[test]
    fn test_find_exact_match() {
        let index = sample_index();
        assert_eq!(index.find(b"banana"), Some((100, 100)));
    }

    #[test]
    fn test_find_between_entries() {
        let index = sample_index();
        assert_eq!(index.find(b"apricot"), Some((0, 100)));
    }

    #[test]
    fn test_find_outside_bounds() {
        let index = sample_index();
        assert_eq!(index.find(b"ant"), None);
        assert_eq!(index.find(b"date"), Some((200, 100)));
    }

    #[test]
    fn test_find_empty_index() {
        assert_eq!(Index::new().find(b"any"), None);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let index = sample_index();
        let decoded = Index::decode(&index.encode()).expect("Failed to decode");
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_empty_roundtrip() {
        let index = Index::new();
        let decoded = Index::decode(&index.encode()).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_range_full() {
        let index = sample_index();
        assert_eq!(index.range(..), vec![(0, 100), (100, 100), (200, 100)]);
    }

    #[test]
    fn test_range_partial() {
        let index = sample_index();
        assert_eq!(
            index.range(b"banana".to_vec()..=b"cherry".to_vec()),
            vec![(100, 100), (200, 100)]
        );
        assert_eq!(
            index.range(b"apple".to_vec()..b"cherry".to_vec()),
            vec![(0, 100), (100, 100)]
        );
        // A start between first keys includes the preceding block.
        assert_eq!(
            index.range(b"blueberry".to_vec()..b"cherry".to_vec()),
            vec![(100, 100)]
        );
    }
}
