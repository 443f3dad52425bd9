//! The durable data layer: multi-version values and lock records over an
//! ordered storage engine.
//!
//! A value's physical key is the length-prefixed table, the length-prefixed
//! key, and a big-endian 64-bit timestamp. The store order puts higher
//! timestamps first within a (table, key) prefix, so a single seek to
//! (table, key, T) lands on the greatest version with timestamp <= T. An
//! empty value is a tombstone: it marks a deletion at its timestamp and reads
//! as NOT_FOUND.
//!
//! A lock record's physical key is the length-prefixed reserved name
//! "consus.lock" followed by the table and key; its value is the serialized
//! holder. The store order puts all lock records before all data records,
//! which keeps the whole lock state in one range scan. The table name
//! "consus.lock" is reserved; no user table may use it.

use std::sync::Mutex;

use crate::encoding::{strescape, Packer, Unpacker};
use crate::error::{CResult, Error};
use crate::ids::TransactionGroup;
use crate::storage::engine::Engine;
use crate::storage::Status;

const LOCK_TABLE: &[u8] = b"consus.lock";

/// The outcome of a versioned read.
#[derive(Clone, Debug, PartialEq)]
pub enum Read {
    /// A live version at or below the requested timestamp.
    Found { timestamp: u64, value: Vec<u8> },

    /// No live version at or below the requested timestamp. The timestamp is
    /// the tombstone's when one shadows the read, and 0 when the (table, key)
    /// has no version at all.
    NotFound { timestamp: u64 },
}

/// A key decoded back out of its physical form, for migration and debugging.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedKey {
    Data { table: Vec<u8>, key: Vec<u8>, timestamp: u64 },
    Lock { table: Vec<u8>, key: Vec<u8> },
}

impl DecodedKey {
    pub fn table(&self) -> &[u8] {
        match self {
            DecodedKey::Data { table, .. } => table,
            DecodedKey::Lock { table, .. } => table,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            DecodedKey::Data { key, .. } => key,
            DecodedKey::Lock { key, .. } => key,
        }
    }
}

/// Builds the physical key of a versioned value.
pub fn data_key(table: &[u8], key: &[u8], timestamp: u64) -> Vec<u8> {
    let mut p = Packer::with_capacity(table.len() + key.len() + 24);
    p.slice(table).slice(key).u64(timestamp);
    p.take()
}

/// Builds the physical key of a lock record.
pub fn lock_key(table: &[u8], key: &[u8]) -> Vec<u8> {
    let mut p = Packer::with_capacity(table.len() + key.len() + 16);
    p.slice(LOCK_TABLE).slice(table).slice(key);
    p.take()
}

/// Decodes a physical key.
pub fn decode_key(raw: &[u8]) -> CResult<DecodedKey> {
    let mut u = Unpacker::new(raw);
    let first = u.slice()?;
    if first == LOCK_TABLE {
        let table = u.slice()?;
        let key = u.slice()?;
        return Ok(DecodedKey::Lock { table, key });
    }
    let key = u.slice()?;
    if u.remaining() != 8 {
        return Err(Error::Parse(format!(
            "data key (\"{}\", \"{}\") has a malformed timestamp",
            strescape(&first),
            strescape(&key)
        )));
    }
    Ok(DecodedKey::Data { table: first, key, timestamp: u.u64()? })
}

/// The durable data layer. Thin on purpose: it owns the engine mutex and the
/// physical layout, nothing else. All writes are synchronous; the engine does
/// not acknowledge until the bytes are on stable storage.
pub struct Datalayer<E: Engine> {
    engine: Mutex<E>,
}

impl<E: Engine> Datalayer<E> {
    pub fn new(engine: E) -> Self {
        Datalayer { engine: Mutex::new(engine) }
    }

    /// Returns the greatest version of (table, key) with timestamp <=
    /// timestamp_le, a tombstone's timestamp if one shadows the read, or
    /// NotFound with timestamp 0 if there is no such version.
    pub fn get(&self, table: &[u8], key: &[u8], timestamp_le: u64) -> CResult<Read> {
        let seek = data_key(table, key, timestamp_le);
        let mut engine = self.engine.lock()?;
        let mut iter = engine.scan(seek.clone()..);
        let (found_key, value) = match iter.next().transpose()? {
            Some(entry) => entry,
            None => return Ok(Read::NotFound { timestamp: 0 }),
        };
        drop(iter);

        // The hit must be a version of the same (table, key): same length,
        // same bytes up to the timestamp.
        if found_key.len() != seek.len() || found_key[..seek.len() - 8] != seek[..seek.len() - 8] {
            return Ok(Read::NotFound { timestamp: 0 });
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&found_key[found_key.len() - 8..]);
        let timestamp = u64::from_be_bytes(ts);

        if value.is_empty() {
            Ok(Read::NotFound { timestamp })
        } else {
            Ok(Read::Found { timestamp, value })
        }
    }

    /// Writes a version durably. Zero-length values are forbidden; a
    /// tombstone is only ever written through del().
    pub fn put(&self, table: &[u8], key: &[u8], timestamp: u64, value: &[u8]) -> CResult<()> {
        if value.is_empty() {
            return Err(Error::Invalid(format!(
                "refusing zero-length value for (\"{}\", \"{}\")",
                strescape(table),
                strescape(key)
            )));
        }
        let mut engine = self.engine.lock()?;
        engine.set(&data_key(table, key, timestamp), value.to_vec())
    }

    /// Writes a tombstone durably.
    pub fn del(&self, table: &[u8], key: &[u8], timestamp: u64) -> CResult<()> {
        let mut engine = self.engine.lock()?;
        engine.set(&data_key(table, key, timestamp), Vec::new())
    }

    /// Reads the lock record for (table, key): the holder, or None when
    /// unlocked.
    pub fn read_lock(&self, table: &[u8], key: &[u8]) -> CResult<Option<TransactionGroup>> {
        let mut engine = self.engine.lock()?;
        let raw = match engine.get(&lock_key(table, key))? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        drop(engine);
        match bincode::deserialize::<TransactionGroup>(&raw) {
            Ok(tg) => Ok(Some(tg)),
            Err(err) => {
                log::error!(
                    "corrupt lock (\"{}\", \"{}\"): {}",
                    strescape(table),
                    strescape(key),
                    err
                );
                Err(Error::Parse(format!("corrupt lock record: {}", err)))
            }
        }
    }

    /// Durably records tg as the holder of (table, key).
    pub fn write_lock(&self, table: &[u8], key: &[u8], tg: &TransactionGroup) -> CResult<()> {
        let raw = bincode::serialize(tg)?;
        let mut engine = self.engine.lock()?;
        engine.set(&lock_key(table, key), raw)
    }

    /// Durably removes the lock record for (table, key).
    pub fn clear_lock(&self, table: &[u8], key: &[u8]) -> CResult<()> {
        let mut engine = self.engine.lock()?;
        engine.delete(&lock_key(table, key))
    }

    /// The greatest committed timestamp for (table, key), tombstones
    /// included, or 0 if the key has never been written.
    pub fn max_timestamp(&self, table: &[u8], key: &[u8]) -> CResult<u64> {
        match self.get(table, key, u64::MAX)? {
            Read::Found { timestamp, .. } => Ok(timestamp),
            Read::NotFound { timestamp } => Ok(timestamp),
        }
    }

    /// Scans all lock records. The store order puts them in one contiguous
    /// range at the front, so this stops at the first data record.
    pub fn locks(&self) -> CResult<Vec<(Vec<u8>, Vec<u8>, TransactionGroup)>> {
        let mut engine = self.engine.lock()?;
        let mut out = Vec::new();
        for entry in engine.scan(..) {
            let (raw_key, raw_value) = entry?;
            match decode_key(&raw_key)? {
                DecodedKey::Lock { table, key } => {
                    let tg = bincode::deserialize::<TransactionGroup>(&raw_value)?;
                    out.push((table, key, tg));
                }
                DecodedKey::Data { .. } => break,
            }
        }
        Ok(out)
    }

    /// Collects every record (lock records first, then versions in store
    /// order) whose decoded (table, key) satisfies the predicate. Used to
    /// snapshot a partition for migration.
    pub fn snapshot(
        &self,
        mut belongs: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut engine = self.engine.lock()?;
        let mut out = Vec::new();
        for entry in engine.scan(..) {
            let (raw_key, raw_value) = entry?;
            let decoded = decode_key(&raw_key)?;
            if belongs(decoded.table(), decoded.key()) {
                out.push((raw_key, raw_value));
            }
        }
        Ok(out)
    }

    /// Applies a raw record as-is. Re-applying a record that is already
    /// present is a no-op, which makes migration batches idempotent.
    pub fn apply_raw(&self, raw_key: &[u8], raw_value: &[u8]) -> CResult<()> {
        decode_key(raw_key)?; // reject garbage before it hits the store
        let mut engine = self.engine.lock()?;
        engine.set(raw_key, raw_value.to_vec())
    }

    pub fn status(&self) -> CResult<Status> {
        let mut engine = self.engine.lock()?;
        engine.status()
    }
}
