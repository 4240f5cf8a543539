use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::meta::TableMeta;
use crate::error::Result;

/// One atomic change to the live-file set.
///
/// An edit both mutates the level structure (`added`/`removed`) and carries
/// the persistent counters so that replaying the log from the start
/// reconstructs the full state: the next file number, the highest assigned
/// sequence, and the lowest WAL number still holding unflushed data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub added: Vec<TableMeta>,
    pub removed: Vec<(u32, u64)>,
    pub next_file_number: u64,
    pub last_sequence: u64,
    pub log_number: u64,
}

impl VersionEdit {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.write_u64::<BigEndian>(self.next_file_number).unwrap();
        buf.write_u64::<BigEndian>(self.last_sequence).unwrap();
        buf.write_u64::<BigEndian>(self.log_number).unwrap();

        buf.write_u32::<BigEndian>(self.added.len() as u32).unwrap();
        for table in &self.added {
            table.encode_into(&mut buf);
        }

        buf.write_u32::<BigEndian>(self.removed.len() as u32)
            .unwrap();
        for (level, number) in &self.removed {
            buf.write_u32::<BigEndian>(*level).unwrap();
            buf.write_u64::<BigEndian>(*number).unwrap();
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);

        let next_file_number = cursor.read_u64::<BigEndian>()?;
        let last_sequence = cursor.read_u64::<BigEndian>()?;
        let log_number = cursor.read_u64::<BigEndian>()?;

        let added_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut added = Vec::with_capacity(added_count);
        for _ in 0..added_count {
            added.push(TableMeta::decode_from(&mut cursor)?);
        }

        let removed_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut removed = Vec::with_capacity(removed_count);
        for _ in 0..removed_count {
            let level = cursor.read_u32::<BigEndian>()?;
            let number = cursor.read_u64::<BigEndian>()?;
            removed.push((level, number));
        }

        Ok(VersionEdit {
            added,
            removed,
            next_file_number,
            last_sequence,
            log_number,
        })
    }
}
