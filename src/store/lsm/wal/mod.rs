//! Write-Ahead Log segments.
//!
//! Every mutation is appended to the active segment before it is applied to
//! the memtable, so that acknowledged writes survive a crash. One segment
//! exists per memtable; the segment is deleted once its memtable has been
//! flushed to an SSTable and the manifest update is durable.
//!
//! # File format
//!
//! A segment is a bare sequence of frames (no file header); the segment's
//! log number is encoded in its file name (`<n:06>.wal`).
//!
//! ```text
//! +---------+-----------+---------------------------------------------+
//! | len:u32 | crc32:u32 | payload                                     |
//! +---------+-----------+---------------------------------------------+
//! ```
//!
//! Payload: `op:u8 | key_len:u32 | key | value_len:u32 | value | seq:u64`.
//! All integers are big-endian; the CRC covers the payload only.
//!
//! # Replay
//!
//! Frames are replayed in order. A truncated or CRC-bad frame terminates
//! replay of that segment; earlier frames are kept. This makes a torn tail
//! write after a crash indistinguishable from a clean end of log, which is
//! exactly the recovery semantics the engine wants.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::store::lsm::record::{Op, Record, MAX_KEY_LEN, MAX_VALUE_LEN};

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

// op + key_len + value_len + seq around the variable parts.
const FRAME_OVERHEAD: usize = 1 + 4 + 4 + 8;
const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_KEY_LEN + MAX_VALUE_LEN;

pub struct Wal {
    file: File,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
    number: u64,
    sync_every_frame: bool,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("number", &self.number)
            .finish()
    }
}

impl Wal {
    /// Opens or creates the segment at `path`. `sync_every_frame` makes every
    /// append durable on its own (the `Always` sync mode).
    pub fn open(path: impl Into<PathBuf>, number: u64, sync_every_frame: bool) -> Result<Self> {
        let path = path.into();
        let file = File::options()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let writer = BufWriter::new(file.try_clone()?);

        Ok(Self {
            file,
            writer: Mutex::new(writer),
            path,
            number,
            sync_every_frame,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The log number encoded in the segment's file name.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    /// Appends one record frame.
    pub fn append(&self, record: &Record) -> Result<()> {
        let mut payload = Vec::with_capacity(FRAME_OVERHEAD + record.key.len() + record.value.len());
        payload.write_u8(record.op as u8)?;
        payload.write_u32::<BigEndian>(record.key.len() as u32)?;
        payload.extend_from_slice(&record.key);
        payload.write_u32::<BigEndian>(record.value.len() as u32)?;
        payload.extend_from_slice(&record.value);
        payload.write_u64::<BigEndian>(record.seq)?;

        let checksum = CRC32.checksum(&payload);

        let mut writer = self.writer.lock()?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_u32::<BigEndian>(checksum)?;
        writer.write_all(&payload)?;

        if self.sync_every_frame {
            writer.flush()?;
            self.file.sync_data()?;
        }

        Ok(())
    }

    /// Flushes buffered frames and fsyncs the segment.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock()?.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays the segment from the beginning.
    pub fn replay(&self) -> Result<ReplayIterator> {
        ReplayIterator::open(&self.path)
    }

    /// Drops the handles and unlinks the segment file.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        Ok(std::fs::remove_file(path)?)
    }
}

/// Forward iterator over a segment's frames. Stops at the first frame that
/// is truncated or fails its checksum.
pub struct ReplayIterator {
    reader: BufReader<File>,
    path: PathBuf,
    done: bool,
}

impl ReplayIterator {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(ReplayIterator {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            done: false,
        })
    }

    fn read_frame(&mut self) -> Option<Record> {
        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(_) => return None,
        };
        if len < FRAME_OVERHEAD || len > MAX_FRAME_LEN {
            tracing::warn!(path = %self.path.display(), len, "bad frame length, truncating replay");
            return None;
        }

        let stored_crc = match self.reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(_) => return None,
        };

        let mut payload = vec![0u8; len];
        if self.reader.read_exact(&mut payload).is_err() {
            tracing::warn!(path = %self.path.display(), "torn frame, truncating replay");
            return None;
        }

        if CRC32.checksum(&payload) != stored_crc {
            tracing::warn!(path = %self.path.display(), "frame checksum mismatch, truncating replay");
            return None;
        }

        let mut cursor = Cursor::new(payload.as_slice());
        let op = Op::from_u8(cursor.read_u8().ok()?)?;
        let key_len = cursor.read_u32::<BigEndian>().ok()? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key).ok()?;
        let value_len = cursor.read_u32::<BigEndian>().ok()? as usize;
        let mut value = vec![0u8; value_len];
        cursor.read_exact(&mut value).ok()?;
        let seq = cursor.read_u64::<BigEndian>().ok()?;

        Some(Record { key, seq, op, value })
    }
}

impl Iterator for ReplayIterator {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Some(record) => Some(record),
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Parses a `<n:06>.wal` file name into its log number.
pub fn parse_segment_number(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != "wal" {
        return None;
    }
    path.file_stem()?.to_str()?.parse::<u64>().ok()
}

/// Lists the WAL segments in `dir`, sorted by log number.
pub fn discover_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            parse_segment_number(&path).map(|n| (n, path))
        })
        .collect();
    segments.sort_by_key(|(n, _)| *n);
    Ok(segments)
}

/// File name for a segment with the given log number.
pub fn segment_file_name(number: u64) -> String {
    format!("{:06}.wal", number)
}
