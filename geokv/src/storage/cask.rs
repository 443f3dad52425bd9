use std::path::PathBuf;

use crate::error::CResult;
use crate::storage::engine::Engine;
use crate::storage::log::Log;
use crate::storage::{store_bounds, KeyDir, ScanIteratorT, Status, StoreKey};

/// A log-structured engine: key/value pairs go to an append-only log file,
/// and an in-memory keydir (in store order) maps keys to file positions. All
/// live keys must fit in memory. Deletes write a tombstone entry. Replaced
/// values and tombstones are garbage that compaction removes by rewriting
/// the log with only live data.
///
/// Simplifications over the usual design: a single log file of arbitrary
/// size rather than fixed-size segments, and no hint files -- the log is
/// scanned on open to rebuild the keydir.
pub struct Cask {
    /// The active append-only log file.
    log: Log,

    /// Maps keys to a value position and length in the log file.
    keydir: KeyDir,
}

impl Cask {
    /// Opens or creates a Cask in the given file.
    pub fn new(path: PathBuf) -> CResult<Self> {
        let mut log = Log::new(path)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir })
    }

    /// Opens a Cask, and compacts it if the amount of garbage exceeds the
    /// given ratio when opened.
    pub fn new_compact(path: PathBuf, garbage_ratio_threshold: f64) -> CResult<Self> {
        let mut s = Self::new(path)?;

        let status = s.status()?;
        if status.garbage_disk_size > 0 {
            let garbage_ratio = status.garbage_disk_size as f64 / status.total_disk_size as f64;
            if garbage_ratio >= garbage_ratio_threshold {
                log::info!(
                    "compacting {} to remove {:.3}MB garbage ({:.0}% of {:.3}MB)",
                    s.log.path.display(),
                    status.garbage_disk_size / 1024 / 1024,
                    garbage_ratio * 100.0,
                    status.total_disk_size / 1024 / 1024
                );
                s.compact()?;
            }
        }

        Ok(s)
    }

    /// Rewrites the log to a sibling file with only live entries, then
    /// atomically swaps it in.
    pub fn compact(&mut self) -> CResult<()> {
        let mut tmp_path = self.log.path.clone();
        tmp_path.set_extension("new");
        let (mut new_log, new_keydir) = self.write_log(tmp_path)?;

        std::fs::rename(&new_log.path, &self.log.path)?;
        new_log.path = self.log.path.clone();

        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    /// Writes a new log file with the live entries of the current log.
    fn write_log(&mut self, path: PathBuf) -> CResult<(Log, KeyDir)> {
        let mut new_keydir = KeyDir::new();
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?; // in case an old new file exists

        for (key, (value_pos, value_len)) in self.keydir.iter() {
            let value = self.log.read_value(*value_pos, *value_len)?;
            let (pos, len) = new_log.write_entry(&key.0, Some(&value))?;
            new_keydir.insert(key.clone(), (pos + len as u64 - *value_len as u64, *value_len));
        }

        Ok((new_log, new_keydir))
    }
}

impl std::fmt::Display for Cask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cask")
    }
}

impl Engine for Cask {
    type ScanIterator<'a> = CaskScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.log.write_entry(key, None)?;
        self.keydir.remove(&StoreKey(key.to_vec()));
        Ok(())
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(self.log.file.sync_all()?)
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some((value_pos, value_len)) = self.keydir.get(&StoreKey(key.to_vec())) {
            Ok(Some(self.log.read_value(*value_pos, *value_len)?))
        } else {
            Ok(None)
        }
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized,
    {
        CaskScanIterator { inner: self.keydir.range(store_bounds(range)), log: &mut self.log }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIteratorT + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let (pos, len) = self.log.write_entry(key, Some(&value))?;
        let value_len = value.len() as u32;
        self.keydir
            .insert(StoreKey(key.to_vec()), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .fold(0, |size, (key, (_, value_len))| size + key.0.len() as u64 + *value_len as u64);
        let total_disk_size = self.log.file.metadata()?.len();
        let live_disk_size = size + 8 * keys; // account for length prefixes
        let garbage_disk_size = total_disk_size - live_disk_size;
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }
}

pub struct CaskScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, StoreKey, (u64, u32)>,
    log: &'a mut Log,
}

impl<'a> CaskScanIterator<'a> {
    fn map(&mut self, item: (&StoreKey, &(u64, u32))) -> <Self as Iterator>::Item {
        let (key, (value_pos, value_len)) = item;
        Ok((key.0.clone(), self.log.read_value(*value_pos, *value_len)?))
    }
}

impl<'a> Iterator for CaskScanIterator<'a> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map(item))
    }
}

impl<'a> DoubleEndedIterator for CaskScanIterator<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    super::super::tests::test_engine!(
        Cask::new(tempdir::TempDir::new("geokv")?.path().join("cask"))?
    );

    #[test]
    fn compaction_drops_garbage_and_keeps_live_data() -> CResult<()> {
        let dir = tempdir::TempDir::new("geokv")?;
        let path = dir.path().join("cask");

        let mut cask = Cask::new(path.clone())?;
        cask.set(b"alpha", vec![1])?;
        cask.set(b"alpha", vec![2])?;
        cask.set(b"beta", vec![3])?;
        cask.delete(b"beta")?;
        cask.set(b"gamma", vec![4])?;

        let before = cask.status()?;
        assert!(before.garbage_disk_size > 0);

        cask.compact()?;

        let after = cask.status()?;
        assert_eq!(after.garbage_disk_size, 0);
        assert_eq!(cask.get(b"alpha")?, Some(vec![2]));
        assert_eq!(cask.get(b"beta")?, None);
        assert_eq!(cask.get(b"gamma")?, Some(vec![4]));

        // The data survives a reopen of the compacted log.
        drop(cask);
        let mut cask = Cask::new(path)?;
        assert_eq!(cask.get(b"alpha")?, Some(vec![2]));
        assert_eq!(cask.get(b"gamma")?, Some(vec![4]));
        Ok(())
    }
}
