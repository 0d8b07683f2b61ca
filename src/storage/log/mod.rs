mod memory;

pub use memory::Memory;

use crate::error::Result;

use std::ops::{Bound, RangeBounds};

/// A log store. Entry indexes are 1-based and contiguous between
/// first_index() and last_index(). The store is the durability collaborator
/// for the consensus log: the actual on-disk layout (segment files, index
/// files, tail recovery) is behind this contract.
///
/// Supports compaction: a prefix of committed entries may be discarded once a
/// snapshot covers it, advancing first_index(). Metadata keys persist small
/// values such as the current term, vote, and snapshots.
pub trait Store: std::fmt::Display + Send {
    /// Appends a log entry, returning its index.
    fn append(&mut self, entry: Vec<u8>) -> Result<u64>;

    /// Commits log entries up to and including the given index, making them
    /// immutable. Commits are monotonic.
    fn commit(&mut self, index: u64) -> Result<()>;

    /// Returns the committed index, or 0 if none.
    fn committed(&self) -> u64;

    /// Fetches a log entry, if it exists. Compacted entries return None.
    fn get(&self, index: u64) -> Result<Option<Vec<u8>>>;

    /// Returns the index of the first stored entry, i.e. the index just past
    /// the compacted prefix. This is 1 for a log that has never been
    /// compacted, and may exceed last_index() when the store is empty.
    fn first_index(&self) -> u64;

    /// Returns the index of the last stored entry, or the compaction point if
    /// the store is empty.
    fn last_index(&self) -> u64;

    /// Scans the log over the given bounds, in index order.
    fn scan(&self, range: (Bound<u64>, Bound<u64>)) -> Scan<'_>;

    /// Truncates the log by removing any entries strictly after the given
    /// index, and returns the new last index. Errors if asked to truncate any
    /// committed entries.
    fn truncate(&mut self, index: u64) -> Result<u64>;

    /// Compacts the log by removing any entries at or below the given index,
    /// and returns the new first index. Errors if asked to compact beyond the
    /// committed index.
    fn compact(&mut self, index: u64) -> Result<u64>;

    /// Resets the store to an installed snapshot position: discards all
    /// entries, and moves both the compaction point and the commit index to
    /// the given index.
    fn reset(&mut self, index: u64) -> Result<()>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> Result<()>;

    /// Gets a metadata value.
    fn get_metadata(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Sets a metadata value.
    fn set_metadata(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Returns the number of stored entries.
    fn len(&self) -> u64 {
        self.last_index() - self.first_index() + 1
    }

    /// Returns true if the store has no entries.
    fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }
}

/// Iterator over a log range.
pub type Scan<'a> = Box<dyn Iterator<Item = Result<Vec<u8>>> + 'a>;

/// Converts any range bounds into owned (start, end) bounds.
pub fn to_bounds(range: impl RangeBounds<u64>) -> (Bound<u64>, Bound<u64>) {
    (range.start_bound().cloned(), range.end_bound().cloned())
}

#[cfg(test)]
trait TestSuite<S: Store> {
    fn setup() -> Result<S>;

    fn test() -> Result<()> {
        Self::test_append()?;
        Self::test_commit_truncate()?;
        Self::test_compact()?;
        Self::test_get()?;
        Self::test_metadata()?;
        Self::test_scan()?;
        Ok(())
    }

    fn test_append() -> Result<()> {
        let mut s = Self::setup()?;
        assert_eq!(0, s.len());
        assert!(s.is_empty());
        assert_eq!(1, s.append(vec![0x01])?);
        assert_eq!(2, s.append(vec![0x02])?);
        assert_eq!(3, s.append(vec![0x03])?);
        assert_eq!(3, s.len());
        assert_eq!(1, s.first_index());
        assert_eq!(3, s.last_index());
        assert_eq!(
            vec![vec![1], vec![2], vec![3]],
            s.scan(to_bounds(..)).collect::<Result<Vec<_>>>()?
        );
        Ok(())
    }

    fn test_commit_truncate() -> Result<()> {
        let mut s = Self::setup()?;

        assert_eq!(0, s.committed());

        // Truncating an empty store should be fine.
        assert_eq!(0, s.truncate(0)?);

        s.append(vec![0x01])?;
        s.append(vec![0x02])?;
        s.append(vec![0x03])?;
        s.commit(1)?;
        assert_eq!(1, s.committed());

        // Truncating beyond the end should be fine.
        assert_eq!(3, s.truncate(4)?);
        assert_eq!(
            vec![vec![1], vec![2], vec![3]],
            s.scan(to_bounds(..)).collect::<Result<Vec<_>>>()?
        );

        // Truncating a committed entry should error.
        assert!(s.truncate(0).is_err());

        // Truncating above should work.
        assert_eq!(1, s.truncate(1)?);
        assert_eq!(vec![vec![1]], s.scan(to_bounds(..)).collect::<Result<Vec<_>>>()?);

        Ok(())
    }

    fn test_compact() -> Result<()> {
        let mut s = Self::setup()?;
        s.append(vec![0x01])?;
        s.append(vec![0x02])?;
        s.append(vec![0x03])?;
        s.commit(2)?;

        // Compacting beyond the committed index should error.
        assert!(s.compact(3).is_err());

        // Compacting the committed prefix advances the first index.
        assert_eq!(3, s.compact(2)?);
        assert_eq!(3, s.first_index());
        assert_eq!(3, s.last_index());
        assert_eq!(None, s.get(1)?);
        assert_eq!(None, s.get(2)?);
        assert_eq!(Some(vec![0x03]), s.get(3)?);
        assert_eq!(vec![vec![3]], s.scan(to_bounds(..)).collect::<Result<Vec<_>>>()?);

        // Appends continue from the same index space.
        assert_eq!(4, s.append(vec![0x04])?);
        assert_eq!(4, s.last_index());

        // Compacting everything leaves an empty store at the right offset.
        s.commit(4)?;
        assert_eq!(5, s.compact(4)?);
        assert!(s.is_empty());
        assert_eq!(5, s.first_index());
        assert_eq!(4, s.last_index());
        assert_eq!(5, s.append(vec![0x05])?);

        // Resetting to a snapshot position discards everything.
        s.reset(9)?;
        assert!(s.is_empty());
        assert_eq!(10, s.first_index());
        assert_eq!(9, s.last_index());
        assert_eq!(9, s.committed());
        assert_eq!(10, s.append(vec![0x0a])?);
        Ok(())
    }

    fn test_get() -> Result<()> {
        let mut s = Self::setup()?;
        s.append(vec![0x01])?;
        s.append(vec![0x02])?;
        s.append(vec![0x03])?;
        assert_eq!(None, s.get(0)?);
        assert_eq!(Some(vec![0x01]), s.get(1)?);
        assert_eq!(None, s.get(4)?);
        Ok(())
    }

    fn test_metadata() -> Result<()> {
        let mut s = Self::setup()?;
        s.set_metadata(b"a", vec![0x01])?;
        assert_eq!(Some(vec![0x01]), s.get_metadata(b"a")?);
        assert_eq!(None, s.get_metadata(b"b")?);
        Ok(())
    }

    fn test_scan() -> Result<()> {
        let mut s = Self::setup()?;
        s.append(vec![0x01])?;
        s.append(vec![0x02])?;
        s.append(vec![0x03])?;
        s.commit(2)?;

        assert_eq!(
            vec![vec![1], vec![2], vec![3]],
            s.scan(to_bounds(..)).collect::<Result<Vec<_>>>()?
        );

        assert_eq!(vec![vec![1]], s.scan(to_bounds(0..2)).collect::<Result<Vec<_>>>()?);
        assert_eq!(vec![vec![1], vec![2]], s.scan(to_bounds(1..3)).collect::<Result<Vec<_>>>()?);
        assert_eq!(
            vec![vec![1], vec![2], vec![3]],
            s.scan(to_bounds(1..=3)).collect::<Result<Vec<_>>>()?
        );
        assert!(s.scan(to_bounds(3..1)).collect::<Result<Vec<_>>>()?.is_empty());
        assert!(s.scan(to_bounds(1..1)).collect::<Result<Vec<_>>>()?.is_empty());
        assert_eq!(vec![vec![2]], s.scan(to_bounds(2..=2)).collect::<Result<Vec<_>>>()?);
        assert_eq!(vec![vec![2], vec![3]], s.scan(to_bounds(2..5)).collect::<Result<Vec<_>>>()?);

        assert!(s.scan(to_bounds(..0)).collect::<Result<Vec<_>>>()?.is_empty());
        assert_eq!(vec![vec![1]], s.scan(to_bounds(..=1)).collect::<Result<Vec<_>>>()?);
        assert_eq!(vec![vec![1], vec![2]], s.scan(to_bounds(..3)).collect::<Result<Vec<_>>>()?);

        assert!(s.scan(to_bounds(4..)).collect::<Result<Vec<_>>>()?.is_empty());
        assert_eq!(vec![vec![3]], s.scan(to_bounds(3..)).collect::<Result<Vec<_>>>()?);
        assert_eq!(vec![vec![2], vec![3]], s.scan(to_bounds(2..)).collect::<Result<Vec<_>>>()?);

        Ok(())
    }
}
