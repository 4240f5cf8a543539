//! Data blocks: the unit of storage and caching inside an SSTable.
//!
//! A block holds records in `(user key asc, seq desc)` order with shared
//! key-prefix compression. Every `RESTART_INTERVAL` records a restart point
//! stores the full key; the restart offsets are appended at the end of the
//! block so a reader can binary-search them.
//!
//! ```text
//! +----------+----------+-----+---------------+----------------+
//! | record_0 | record_1 | ... | restarts:u32[]| n_restarts:u32 |
//! +----------+----------+-----+---------------+----------------+
//! ```
//!
//! Record: `shared:varint | key_delta_len:varint | value_len:varint |
//! seq:u64 | op:u8 | key_delta | value`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::error::Result;
use crate::store::lsm::cache::BlockCache;
use crate::store::lsm::metrics::Counters;
use crate::store::lsm::record::{Op, Record};
use crate::Error;

const RESTART_INTERVAL: usize = 16;

/// LEB128 varint encoding for the record prefix fields.
pub fn write_varint32(buf: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

pub fn read_varint32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let mut value: u32 = 0;
    let mut shift = 0;
    loop {
        if shift > 28 || *pos >= data.len() {
            return Err(Error::Corruption("bad varint in block".to_string()));
        }
        let byte = data[*pos];
        *pos += 1;
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub struct Builder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restarts: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends a record. Callers must add records in internal-key order.
    pub fn add(&mut self, record: &Record) {
        let shared = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restarts.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, &record.key)
        };

        write_varint32(&mut self.buffer, shared as u32);
        write_varint32(&mut self.buffer, (record.key.len() - shared) as u32);
        write_varint32(&mut self.buffer, record.value.len() as u32);
        self.buffer.write_u64::<BigEndian>(record.seq).unwrap();
        self.buffer.write_u8(record.op as u8).unwrap();
        self.buffer.extend_from_slice(&record.key[shared..]);
        self.buffer.extend_from_slice(&record.value);

        self.last_key.clear();
        self.last_key.extend_from_slice(&record.key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restarts {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restarts.len() as u32)
            .unwrap();
        self.buffer
    }

    /// Current encoded size, used to decide when to cut the block.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}

/// A decoded, immutable block.
pub struct Block {
    data: Vec<u8>,
    restarts: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block shorter than trailer".to_string()));
        }

        let n_restarts_offset = data.len() - 4;
        let n_restarts = (&data[n_restarts_offset..]).read_u32::<BigEndian>()? as usize;

        let restart_array_len = n_restarts * 4;
        if n_restarts_offset < restart_array_len {
            return Err(Error::Corruption(
                "block restart array out of bounds".to_string(),
            ));
        }

        let restart_array_offset = n_restarts_offset - restart_array_len;
        let mut cursor = &data[restart_array_offset..n_restarts_offset];
        let mut restarts = Vec::with_capacity(n_restarts);
        for _ in 0..n_restarts {
            restarts.push(cursor.read_u32::<BigEndian>()?);
        }

        Ok(Self {
            data: data[..restart_array_offset].to_vec(),
            restarts,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_raw(data: Vec<u8>, restarts: Vec<u32>) -> Self {
        Self { data, restarts }
    }

    /// Newest record for `key` with `seq <= snapshot`, or `None` if the
    /// block has no visible version of the key.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Result<Option<Record>> {
        let mut iter = BlockIterator::new(Arc::new(Self {
            data: self.data.clone(),
            restarts: self.restarts.clone(),
        }));
        iter.seek(key)?;
        for item in iter {
            let record = item?;
            if record.key.as_slice() != key {
                return Ok(None);
            }
            if record.seq <= snapshot {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    pub fn iter(self: Arc<Self>) -> BlockIterator {
        BlockIterator::new(self)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    offset: usize,
    last_key: Vec<u8>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            offset: 0,
            last_key: Vec::new(),
        }
    }

    /// Reads the full key stored at a restart point without moving the
    /// iterator.
    fn restart_key(&self, restart: usize) -> Result<Vec<u8>> {
        let data = &self.block.data;
        let mut pos = self.block.restarts[restart] as usize;

        let shared = read_varint32(data, &mut pos)? as usize;
        let key_delta_len = read_varint32(data, &mut pos)? as usize;
        let _value_len = read_varint32(data, &mut pos)?;
        pos += 8 + 1; // seq + op

        if shared != 0 {
            return Err(Error::Corruption(
                "restart point key has a shared prefix".to_string(),
            ));
        }
        if pos + key_delta_len > data.len() {
            return Err(Error::Corruption("restart key out of bounds".to_string()));
        }
        Ok(data[pos..pos + key_delta_len].to_vec())
    }

    /// Positions the iterator so that the next record is the first with
    /// user key >= `target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Binary search restart points for the last one whose key < target.
        let mut left = 0;
        let mut right = self.block.restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            if self.restart_key(mid)?.as_slice() < target {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        let restart = left.saturating_sub(1);

        self.offset = self.block.restarts.get(restart).copied().unwrap_or(0) as usize;
        self.last_key.clear();

        // Linear scan to the first record at or past the target.
        loop {
            let saved_offset = self.offset;
            let saved_key = self.last_key.clone();
            match self.next() {
                Some(Ok(record)) => {
                    if record.key.as_slice() >= target {
                        self.offset = saved_offset;
                        self.last_key = saved_key;
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}

impl Iterator for BlockIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = &self.block.data;
        if self.offset >= data.len() {
            return None;
        }

        let mut pos = self.offset;
        let shared = match read_varint32(data, &mut pos) {
            Ok(v) => v as usize,
            Err(e) => return Some(Err(e)),
        };
        let key_delta_len = match read_varint32(data, &mut pos) {
            Ok(v) => v as usize,
            Err(e) => return Some(Err(e)),
        };
        let value_len = match read_varint32(data, &mut pos) {
            Ok(v) => v as usize,
            Err(e) => return Some(Err(e)),
        };

        if pos + 9 + key_delta_len + value_len > data.len() || shared > self.last_key.len() {
            return Some(Err(Error::Corruption(
                "block record out of bounds".to_string(),
            )));
        }

        let seq = (&data[pos..]).read_u64::<BigEndian>().unwrap();
        pos += 8;
        let op = match Op::from_u8(data[pos]) {
            Some(op) => op,
            None => {
                return Some(Err(Error::Corruption(format!(
                    "unknown record op {}",
                    data[pos]
                ))))
            }
        };
        pos += 1;

        let mut key = Vec::with_capacity(shared + key_delta_len);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&data[pos..pos + key_delta_len]);
        pos += key_delta_len;

        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        self.offset = pos;
        self.last_key = key.clone();

        Some(Ok(Record { key, seq, op, value }))
    }
}

/// Chains the data blocks of one table into a single record stream, loading
/// blocks through the cache as the scan advances.
pub struct MultiBlockIterator {
    file: std::fs::File,
    file_number: u64,
    blocks: Vec<(u64, u64)>,
    cache: Option<Arc<BlockCache>>,
    counters: Arc<Counters>,
    current: Option<BlockIterator>,
    next_block: usize,
}

impl MultiBlockIterator {
    pub fn new(
        file: std::fs::File,
        file_number: u64,
        blocks: Vec<(u64, u64)>,
        cache: Option<Arc<BlockCache>>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            file,
            file_number,
            blocks,
            cache,
            counters,
            current: None,
            next_block: 0,
        }
    }

    /// Seeks within the first block so the scan starts at `target`.
    pub fn seek_first_block(&mut self, target: &[u8]) -> Result<()> {
        if !self.blocks.is_empty() && self.next_block == 0 {
            self.load_next_block()?;
            if let Some(iter) = &mut self.current {
                iter.seek(target)?;
            }
        }
        Ok(())
    }

    fn load_next_block(&mut self) -> Result<()> {
        if self.next_block >= self.blocks.len() {
            self.current = None;
            return Ok(());
        }

        let (offset, size) = self.blocks[self.next_block];
        self.next_block += 1;

        let block = load_block(
            &mut self.file,
            self.file_number,
            offset,
            size,
            self.cache.as_deref(),
            &self.counters,
        )?;
        self.current = Some(block.iter());
        Ok(())
    }
}

impl Iterator for MultiBlockIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if let Some(item) = iter.next() {
                    return Some(item);
                }
            }

            if let Err(e) = self.load_next_block() {
                return Some(Err(e));
            }
            self.current.as_ref()?;
        }
    }
}

/// Reads one block, going through the cache when one is attached.
pub fn load_block(
    file: &mut std::fs::File,
    file_number: u64,
    offset: u64,
    size: u64,
    cache: Option<&BlockCache>,
    counters: &Counters,
) -> Result<Arc<Block>> {
    if let Some(cache) = cache {
        if let Some(block) = cache.get(file_number, offset) {
            return Ok(block);
        }
    }

    let mut data = vec![0u8; size as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut data)?;
    Counters::bump(&counters.block_reads);

    let block = Arc::new(Block::new(data)?);
    if let Some(cache) = cache {
        cache.insert(file_number, offset, block.clone());
    }
    Ok(block)
}
