pub mod lsm;

use std::ops::Bound;

use crate::error::Result;

/// The minimal key-value surface an engine exposes. The LSM tree adds
/// batches, snapshots and manual compaction as inherent methods.
pub trait Store: Send + Sync {
    /// The iterator returned by `scan()`.
    type ScanIterator: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send;

    /// Inserts or updates a key-value pair.
    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Retrieves the value for a key, or `None` if absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Removes a key if present.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Iterates over an ordered range of key-value pairs.
    fn scan(&self, range: (Bound<Vec<u8>>, Bound<Vec<u8>>)) -> Result<Self::ScanIterator>;

    /// Forces buffered writes to disk. Writes are not guaranteed durable
    /// under relaxed sync modes until this returns.
    fn sync(&self) -> Result<()>;
}
