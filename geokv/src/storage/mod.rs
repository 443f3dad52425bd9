pub mod cask;
pub mod engine;
pub mod log;
pub mod memory;

use std::cmp::Ordering;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

/// The reserved marker prefixing every lock record's physical key. The
/// comparator sorts any key carrying this prefix strictly before all data
/// records, so the entire lock state sits in one cheap range at the front of
/// the store.
pub const LOCK_TABLE_PREFIX: &[u8] = b"\x0bconsus.lock";

/// The store's key order.
///
/// Lock-prefixed keys sort before everything else (lexicographically among
/// themselves). Data keys carry a trailing big-endian 64-bit timestamp; they
/// order lexicographically on everything before it, shorter prefixes first,
/// and then by timestamp DESCENDING, so a seek to (table, key, T) lands on
/// the greatest version with timestamp <= T.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    let a_lock = a.starts_with(LOCK_TABLE_PREFIX);
    let b_lock = b.starts_with(LOCK_TABLE_PREFIX);
    match (a_lock, b_lock) {
        (true, true) => return a.cmp(b),
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }

    let (a_prefix, a_ts) = split_data_key(a);
    let (b_prefix, b_ts) = split_data_key(b);
    // The final full-key comparison only matters for keys shorter than a
    // timestamp, which the datalayer never writes; it keeps the order total.
    a_prefix.cmp(b_prefix).then(b_ts.cmp(&a_ts)).then(a.cmp(b))
}

fn split_data_key(key: &[u8]) -> (&[u8], u64) {
    if key.len() < 8 {
        return (key, 0);
    }
    let (prefix, suffix) = key.split_at(key.len() - 8);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(suffix);
    (prefix, u64::from_be_bytes(ts))
}

/// A raw key wrapped so that ordered containers sort it with [`compare_keys`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreKey(pub Vec<u8>);

impl Ord for StoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.0, &other.0)
    }
}

impl PartialOrd for StoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The in-memory index of the log-structured engine: raw key (in store
/// order) to the value's position and length in the log file.
pub type KeyDir = std::collections::BTreeMap<StoreKey, (u64, u32)>;

/// Maps raw byte bounds into store-ordered bounds.
pub(crate) fn store_bounds(
    range: impl std::ops::RangeBounds<Vec<u8>>,
) -> (std::ops::Bound<StoreKey>, std::ops::Bound<StoreKey>) {
    use std::ops::Bound;
    let map = |b: Bound<&Vec<u8>>| match b {
        Bound::Included(v) => Bound::Included(StoreKey(v.clone())),
        Bound::Excluded(v) => Bound::Excluded(StoreKey(v.clone())),
        Bound::Unbounded => Bound::Unbounded,
    };
    (map(range.start_bound()), map(range.end_bound()))
}

/// Engine status report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of live keys in the engine.
    pub keys: u64,

    /// The logical size of live key/value pairs.
    pub size: u64,

    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,

    /// The on-disk size of live data.
    pub live_disk_size: u64,

    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}

/// A scan iterator, with a blanket implementation (in lieu of trait aliases).
pub trait ScanIteratorT: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>> {}

impl<I: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>>> ScanIteratorT for I {}
