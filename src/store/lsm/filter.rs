//! Range filtering for record streams.

use std::ops::{Bound, RangeBounds};

use crate::error::Result;
use crate::store::lsm::record::Record;

/// Restricts any record iterator to a user-key range. Sources that can only
/// over-approximate a range (block scans start at a block boundary) wrap
/// themselves in this adapter; it also terminates the scan early once the
/// end bound is passed.
pub struct RangeFilter<I, R>
where
    I: Iterator<Item = Result<Record>>,
    R: RangeBounds<Vec<u8>> + Send + Sync,
{
    inner: I,
    range: R,
}

impl<I, R> RangeFilter<I, R>
where
    I: Iterator<Item = Result<Record>>,
    R: RangeBounds<Vec<u8>> + Send + Sync,
{
    pub fn new(inner: I, range: R) -> Self {
        Self { inner, range }
    }

    fn before_start(&self, key: &[u8]) -> bool {
        match self.range.start_bound() {
            Bound::Included(start) => key < start.as_slice(),
            Bound::Excluded(start) => key <= start.as_slice(),
            Bound::Unbounded => false,
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match self.range.end_bound() {
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }
}

impl<I, R> Iterator for RangeFilter<I, R>
where
    I: Iterator<Item = Result<Record>>,
    R: RangeBounds<Vec<u8>> + Send + Sync,
{
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(record) => {
                    if self.past_end(&record.key) {
                        return None;
                    }
                    if !self.before_start(&record.key) {
                        return Some(Ok(record));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
