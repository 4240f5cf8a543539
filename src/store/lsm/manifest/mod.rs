//! Manifest log: the durable record of the LSM-tree's structure.
//!
//! The manifest is a WAL for metadata instead of user data. Where the WAL
//! tracks key-value mutations, the manifest tracks which SSTables exist,
//! at which levels, and the persistent counters (next file number, last
//! sequence, live WAL floor). Replaying it from the start reconstructs the
//! exact live-file set after a crash.
//!
//! # File format
//!
//! `MANIFEST-<n>` is a sequence of frames, each an encoded [`VersionEdit`]:
//!
//! ```text
//! +---------+-----------+------------------+
//! | len:u32 | crc32:u32 | edit             |
//! +---------+-----------+------------------+
//! ```
//!
//! The small `CURRENT` file names the active manifest. Every
//! `SNAPSHOT_INTERVAL` edits the full state is rewritten as a single edit
//! into a fresh manifest and `CURRENT` is swapped via write-temp + rename,
//! which keeps the log bounded and the swap atomic. The new manifest is
//! always fsync'd with its snapshot edit before the swap; `CURRENT` never
//! names a manifest without durable content, so a crash anywhere in the
//! rotation leaves a manifest that replays to the full pre-crash state.

pub mod edit;
pub mod meta;
pub mod version;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use edit::VersionEdit;
use meta::TableMeta;

use crate::error::Result;
use crate::Error;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub use version::{Level, TableHandle, Version};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const CURRENT_FILE: &str = "CURRENT";
const SNAPSHOT_INTERVAL: u32 = 100;

pub fn manifest_file_name(number: u64) -> String {
    format!("MANIFEST-{:06}", number)
}

/// Append handle for the active manifest file.
pub struct Manifest {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    number: u64,
    edit_count: u32,
}

impl Manifest {
    /// Creates `MANIFEST-<number>`, writes and fsyncs `first_edit`, and
    /// only then points `CURRENT` at it. `CURRENT` must never name a
    /// manifest that does not durably hold at least one edit: a crash
    /// between the two steps leaves the previous manifest authoritative
    /// instead of resurrecting an empty state. A leftover file with the
    /// same number (crash before the `CURRENT` swap) is overwritten.
    pub fn create(dir: &Path, number: u64, first_edit: &VersionEdit) -> Result<Self> {
        let path = dir.join(manifest_file_name(number));
        let file = File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let writer = BufWriter::new(file.try_clone()?);

        let mut manifest = Self {
            file,
            writer,
            path,
            number,
            edit_count: 0,
        };
        manifest.append(first_edit)?;
        set_current(dir, number)?;
        Ok(manifest)
    }

    /// Opens the manifest named by `CURRENT`, or `None` for a fresh store.
    pub fn open_current(dir: &Path) -> Result<Option<Self>> {
        let Some(number) = read_current(dir)? else {
            return Ok(None);
        };

        let path = dir.join(manifest_file_name(number));
        let file = File::options().read(true).append(true).open(&path)?;
        // Every manifest is fsync'd with its first edit before CURRENT
        // names it, so an empty file here is damage, not a fresh store.
        if file.metadata()?.len() == 0 {
            return Err(Error::Corruption(format!(
                "CURRENT names empty manifest {}",
                path.display()
            )));
        }
        let writer = BufWriter::new(file.try_clone()?);

        Ok(Some(Self {
            file,
            writer,
            path,
            number,
            edit_count: 0,
        }))
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one edit and fsyncs it.
    pub fn append(&mut self, edit: &VersionEdit) -> Result<()> {
        let payload = edit.encode();
        let checksum = CRC32.checksum(&payload);

        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_u32::<BigEndian>(checksum)?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        self.file.sync_data()?;

        self.edit_count += 1;
        Ok(())
    }

    /// Whether the log has grown enough to deserve a snapshot rewrite.
    pub fn should_snapshot(&self) -> bool {
        self.edit_count >= SNAPSHOT_INTERVAL
    }

    /// Replays every edit in this manifest into a [`ManifestState`].
    pub fn replay(&self) -> Result<ManifestState> {
        replay_path(&self.path)
    }

    /// Rewrites the full `state` as the single fsync'd edit of a new
    /// manifest, then swaps `CURRENT`, deletes the old file, and replaces
    /// `self` with the new handle.
    pub fn rewrite(&mut self, dir: &Path, new_number: u64, state: &ManifestState) -> Result<()> {
        let next = Manifest::create(dir, new_number, &state.snapshot_edit())?;

        let old_path = std::mem::replace(&mut self.path, PathBuf::new());
        let old_number = self.number;
        *self = next;

        if let Err(e) = std::fs::remove_file(&old_path) {
            tracing::warn!(path = %old_path.display(), error = %e, "failed to delete old manifest");
        }
        tracing::info!(
            old = old_number,
            new = new_number,
            "rewrote manifest snapshot"
        );
        Ok(())
    }
}

/// Accumulated result of replaying a manifest log.
#[derive(Debug, Clone, Default)]
pub struct ManifestState {
    /// `levels[l]` holds the metadata of the live tables at level `l`.
    pub levels: Vec<Vec<TableMeta>>,
    pub next_file_number: u64,
    pub last_sequence: u64,
    pub log_number: u64,
}

impl ManifestState {
    pub fn apply(&mut self, edit: VersionEdit) {
        for (level, number) in &edit.removed {
            if let Some(tables) = self.levels.get_mut(*level as usize) {
                tables.retain(|t| t.number != *number);
            }
        }
        for table in edit.added {
            let level = table.level as usize;
            while self.levels.len() <= level {
                self.levels.push(Vec::new());
            }
            self.levels[level].push(table);
        }
        self.next_file_number = self.next_file_number.max(edit.next_file_number);
        self.last_sequence = self.last_sequence.max(edit.last_sequence);
        self.log_number = self.log_number.max(edit.log_number);
    }

    /// The whole state as one edit, for snapshot rewrites.
    pub fn snapshot_edit(&self) -> VersionEdit {
        VersionEdit {
            added: self.levels.iter().flatten().cloned().collect(),
            removed: Vec::new(),
            next_file_number: self.next_file_number,
            last_sequence: self.last_sequence,
            log_number: self.log_number,
        }
    }

    pub fn live_file_numbers(&self) -> Vec<u64> {
        self.levels.iter().flatten().map(|t| t.number).collect()
    }
}

/// Replays the manifest at `path`. A truncated or CRC-bad frame ends the
/// replay; earlier edits are kept.
pub fn replay_path(path: &Path) -> Result<ManifestState> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut state = ManifestState::default();

    loop {
        let len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        let stored_crc = match reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(_) => break,
        };

        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            tracing::warn!(path = %path.display(), "torn manifest frame, truncating replay");
            break;
        }
        if CRC32.checksum(&payload) != stored_crc {
            tracing::warn!(path = %path.display(), "manifest frame checksum mismatch, truncating replay");
            break;
        }

        state.apply(VersionEdit::decode(&payload)?);
    }

    Ok(state)
}

/// Reads the manifest number out of `CURRENT`, or `None` if absent.
pub fn read_current(dir: &Path) -> Result<Option<u64>> {
    let path = dir.join(CURRENT_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let name = content.trim();
    let number = name
        .strip_prefix("MANIFEST-")
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| Error::Corruption(format!("malformed CURRENT content: {name:?}")))?;
    Ok(Some(number))
}

/// Atomically points `CURRENT` at `MANIFEST-<number>`.
pub fn set_current(dir: &Path, number: u64) -> Result<()> {
    let tmp = dir.join("CURRENT.tmp");
    {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{}", manifest_file_name(number))?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, dir.join(CURRENT_FILE))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn sample_meta(number: u64, level: u32) -> TableMeta {
        TableMeta {
            number,
            level,
            size: 1000,
            entry_count: 10,
            smallest_key: b"a".to_vec(),
            largest_key: b"z".to_vec(),
            smallest_seq: 1,
            largest_seq: 10,
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();

        let manifest = Manifest::create(
            dir.path(),
            1,
            &VersionEdit {
                added: vec![sample_meta(5, 0)],
                next_file_number: 6,
                last_sequence: 42,
                log_number: 3,
                ..Default::default()
            },
        )
        .unwrap();
        drop(manifest);

        let manifest = Manifest::open_current(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.number(), 1);

        let state = manifest.replay().unwrap();
        assert_eq!(state.levels[0].len(), 1);
        assert_eq!(state.levels[0][0].number, 5);
        assert_eq!(state.next_file_number, 6);
        assert_eq!(state.last_sequence, 42);
        assert_eq!(state.log_number, 3);
    }

    #[test]
    fn test_fresh_dir_has_no_current() {
        let dir = TempDir::new().unwrap();
        assert!(Manifest::open_current(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_removed_tables_disappear_on_replay() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::create(
            dir.path(),
            1,
            &VersionEdit {
                added: vec![sample_meta(2, 0), sample_meta(3, 0)],
                next_file_number: 4,
                ..Default::default()
            },
        )
        .unwrap();

        manifest
            .append(&VersionEdit {
                added: vec![sample_meta(4, 1)],
                removed: vec![(0, 2), (0, 3)],
                next_file_number: 5,
                ..Default::default()
            })
            .unwrap();

        let state = manifest.replay().unwrap();
        assert!(state.levels[0].is_empty());
        assert_eq!(state.levels[1].len(), 1);
        assert_eq!(state.levels[1][0].number, 4);
        assert_eq!(state.live_file_numbers(), vec![4]);
    }

    #[test]
    fn test_snapshot_rewrite() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::create(
            dir.path(),
            1,
            &VersionEdit {
                added: vec![sample_meta(2, 0)],
                next_file_number: 3,
                last_sequence: 9,
                log_number: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let state = manifest.replay().unwrap();

        let old_path = manifest.path().to_path_buf();
        manifest.rewrite(dir.path(), 7, &state).unwrap();
        assert!(!old_path.exists());
        assert_eq!(read_current(dir.path()).unwrap(), Some(7));

        let replayed = manifest.replay().unwrap();
        assert_eq!(replayed.levels[0].len(), 1);
        assert_eq!(replayed.last_sequence, 9);
        assert_eq!(replayed.next_file_number, 3);
    }

    #[test]
    fn test_torn_frame_keeps_earlier_edits() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::create(
            dir.path(),
            1,
            &VersionEdit {
                added: vec![sample_meta(2, 0)],
                next_file_number: 3,
                ..Default::default()
            },
        )
        .unwrap();

        manifest
            .append(&VersionEdit {
                added: vec![sample_meta(3, 0)],
                next_file_number: 4,
                ..Default::default()
            })
            .unwrap();

        // Chop the tail of the last frame off.
        let path = manifest.path().to_path_buf();
        drop(manifest);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        file.sync_all().unwrap();

        let state = replay_path(&path).unwrap();
        assert_eq!(state.levels[0].len(), 1);
        assert_eq!(state.levels[0][0].number, 2);
    }

    #[test]
    fn test_created_manifest_holds_its_edit_when_current_names_it() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::create(
            dir.path(),
            1,
            &VersionEdit {
                added: vec![sample_meta(9, 0)],
                next_file_number: 10,
                last_sequence: 5,
                log_number: 2,
                ..Default::default()
            },
        )
        .unwrap();

        // By the time CURRENT names the file, replaying it must yield the
        // first edit, never an empty default state.
        assert_eq!(read_current(dir.path()).unwrap(), Some(1));
        let state = replay_path(manifest.path()).unwrap();
        assert_eq!(state.live_file_numbers(), vec![9]);
        assert_eq!(state.next_file_number, 10);
        assert_eq!(state.last_sequence, 5);
    }

    #[test]
    fn test_current_naming_empty_manifest_is_corruption() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(manifest_file_name(3)), b"").unwrap();
        set_current(dir.path(), 3).unwrap();

        assert!(matches!(
            Manifest::open_current(dir.path()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_malformed_current_is_corruption() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CURRENT_FILE), b"garbage\n").unwrap();
        assert!(matches!(
            read_current(dir.path()),
            Err(Error::Corruption(_))
        ));
    }
}
