use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::Result;

/// Metadata for one live SSTable as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub number: u64,
    pub level: u32,
    pub size: u64,
    pub entry_count: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub smallest_seq: u64,
    pub largest_seq: u64,
}

impl TableMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.number).unwrap();
        buf.write_u32::<BigEndian>(self.level).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_u64::<BigEndian>(self.entry_count).unwrap();
        buf.write_u64::<BigEndian>(self.smallest_seq).unwrap();
        buf.write_u64::<BigEndian>(self.largest_seq).unwrap();

        buf.write_u32::<BigEndian>(self.smallest_key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.smallest_key);

        buf.write_u32::<BigEndian>(self.largest_key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.largest_key);
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let number = cursor.read_u64::<BigEndian>()?;
        let level = cursor.read_u32::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        let entry_count = cursor.read_u64::<BigEndian>()?;
        let smallest_seq = cursor.read_u64::<BigEndian>()?;
        let largest_seq = cursor.read_u64::<BigEndian>()?;

        let smallest_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut smallest_key = vec![0u8; smallest_key_len];
        cursor.read_exact(&mut smallest_key)?;

        let largest_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut largest_key = vec![0u8; largest_key_len];
        cursor.read_exact(&mut largest_key)?;

        Ok(TableMeta {
            number,
            level,
            size,
            entry_count,
            smallest_key,
            largest_key,
            smallest_seq,
            largest_seq,
        })
    }

    /// Whether this table's key range intersects `[smallest, largest]`.
    pub fn overlaps(&self, smallest: &[u8], largest: &[u8]) -> bool {
        self.smallest_key.as_slice() <= largest && self.largest_key.as_slice() >= smallest
    }
}
