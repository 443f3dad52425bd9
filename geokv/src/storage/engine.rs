use crate::error::CResult;
use crate::storage::{ScanIteratorT, Status};

/// An ordered key/value storage engine, where both keys and values are
/// arbitrary byte strings. Keys are stored in the store order defined by
/// [`super::compare_keys`]: lock records first, then data records by prefix
/// and descending timestamp. Writes are durable once set() or delete()
/// returns; the engines sync to stable storage before acknowledging, since
/// the replication layer treats every acknowledged write as committed.
///
/// Only supports single-threaded use since all methods (including reads) take
/// a mutable reference -- serialized access can't be avoided anyway, since
/// both replication and file access is serial. Callers wrap the engine in a
/// mutex.
pub trait Engine: std::fmt::Display + Send + Sync {
    /// The iterator returned by scan().
    type ScanIterator<'a>: ScanIteratorT + 'a
    where
        Self: Sized + 'a; // omit in trait objects, for object safety

    /// Deletes a key, or does nothing if it does not exist.
    fn delete(&mut self, key: &[u8]) -> CResult<()>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> CResult<()>;

    /// Gets a value for a key, if it exists.
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    /// Iterates over an ordered range of key/value pairs.
    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized; // omit in trait objects, for object safety

    /// Like scan, but can be used from trait objects. The iterator will use
    /// dynamic dispatch, which has a minor performance penalty.
    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIteratorT + '_>;

    /// Sets a value for a key, replacing the existing value if any.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()>;

    /// Returns engine status.
    fn status(&mut self) -> CResult<Status>;
}
