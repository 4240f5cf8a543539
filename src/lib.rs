//! emberdb: an embedded, ordered, persistent key-value store built on an
//! LSM-tree.
//!
//! ```no_run
//! use emberdb::{Config, LsmTree};
//!
//! # async fn demo() -> emberdb::Result<()> {
//! let db = LsmTree::open_with_config(Config::new("/tmp/mydb"))?;
//! db.set(b"hello", b"world".to_vec())?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod flock;
pub mod scheduler;
pub mod store;
pub mod tmpfs;

pub use config::{Config, SchedulerConfig, SyncMode};
pub use error::{Error, Result};
pub use store::lsm::{LsmScanIterator, LsmTree, Snapshot, Stats, WriteBatch};
pub use store::Store;
