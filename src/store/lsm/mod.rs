//! LSM-tree storage engine.
//!
//! Data is organized in levels of sorted runs:
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐
//! │ active memtable │───▶│ frozen memtables │
//! │   (skip list)   │    │   (flush queue)  │
//! └─────────────────┘    └──────────────────┘
//!          │                      │ flush
//!          ▼                      ▼
//!     ┌─────────┐          ┌─────────────┐
//!     │ WAL per │          │   level 0   │  overlapping tables
//!     │ memtable│          └─────────────┘
//!     └─────────┘                 │ compaction
//!                                 ▼
//!                          ┌─────────────┐
//!                          │  level 1..N │  disjoint, sorted tables
//!                          └─────────────┘
//! ```
//!
//! # Write path
//!
//! A mutation is framed into the active memtable's WAL segment, inserted
//! into the memtable, and becomes visible when the store publishes its
//! sequence. A full memtable is sealed and queued; the background flush
//! turns it into a level-0 table and drops its segment.
//!
//! # Read path
//!
//! `get` consults the active memtable, frozen memtables newest first, the
//! level-0 tables newest first, then one table per deeper level (their
//! ranges are disjoint), stopping at the first version visible at the read
//! sequence. Bloom filters short-circuit tables that cannot hold the key.
//!
//! # Durability
//!
//! Recovery replays the manifest to rebuild the live-file set, then replays
//! WAL segments past the manifest's floor into memtables. Acknowledged
//! writes survive a crash under `SyncMode::Always`; under the other modes
//! the tail since the last fsync may be lost, never a torn prefix.

pub mod batch;
pub mod cache;
pub mod compaction;
pub mod filter;
pub mod flush;
pub mod iterator;
pub mod manifest;
pub mod memtable;
pub mod metrics;
pub mod record;
pub mod recovery;
pub mod snapshot;
pub mod sstable;
pub mod state;
pub mod store;
pub mod tasks;
pub mod wal;
pub mod wal_cleanup;

pub use batch::WriteBatch;
pub use iterator::LsmScanIterator;
pub use metrics::Stats;
pub use snapshot::Snapshot;
pub use store::LsmTree;
