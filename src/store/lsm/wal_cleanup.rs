//! Removal of WAL segments below the live floor.
//!
//! Flush deletes its own segment on success; this sweep catches segments
//! orphaned by a crash between the manifest update and the unlink.

use std::sync::atomic::Ordering;

use crate::config::Config;
use crate::error::Result;
use crate::store::lsm::state::LsmState;
use crate::store::lsm::wal;

pub fn cleanup_wals(state: &LsmState, config: &Config) -> Result<()> {
    let floor = state.log_number.load(Ordering::SeqCst);

    for (number, path) in wal::discover_segments(&config.dir)? {
        if number >= floor {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(_) => tracing::info!(segment = number, "deleted obsolete WAL segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(segment = number, error = %e, "failed to delete WAL segment")
            }
        }
    }

    Ok(())
}
