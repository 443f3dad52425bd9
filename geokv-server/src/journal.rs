//! The transaction manager's durable group log: every committed slot of
//! every hosted transaction is appended (synchronously) before the daemon
//! acts on it, and replayed into the daemon at startup.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use geokv::encoding::{Packer, Unpacker};
use geokv::error::CResult;
use geokv::ids::TransactionGroup;
use geokv::storage::log::Log;
use geokv::txman::daemon::{Journal, TxmanDaemon};

pub struct FileJournal {
    log: Mutex<Log>,
}

impl FileJournal {
    pub fn open(path: PathBuf) -> CResult<Self> {
        Ok(FileJournal { log: Mutex::new(Log::new(path)?) })
    }

    fn record_key(tg: TransactionGroup, slot: u64) -> Vec<u8> {
        let mut p = Packer::with_capacity(32);
        tg.pack(&mut p);
        p.u64(slot);
        p.take()
    }

    /// Feeds every journaled slot back into the daemon. Slot order within a
    /// transaction is restored by the group log's in-order apply, so the
    /// file's physical order does not matter.
    pub fn replay(&self, daemon: &TxmanDaemon, now: Instant) -> CResult<usize> {
        let mut log = self.log.lock()?;
        let keydir = log.build_keydir()?;
        let mut restored = 0;
        for (key, (value_pos, value_len)) in keydir.iter() {
            let mut u = Unpacker::new(&key.0);
            let tg = TransactionGroup::unpack(&mut u)?;
            let slot = u.u64()?;
            let entry = log.read_value(*value_pos, *value_len)?;
            daemon.restore(tg, slot, entry, now)?;
            restored += 1;
        }
        Ok(restored)
    }
}

impl Journal for FileJournal {
    fn record(&self, tg: TransactionGroup, slot: u64, entry: &[u8]) -> CResult<()> {
        let mut log = self.log.lock()?;
        log.write_entry(&Self::record_key(tg, slot), Some(entry))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geokv::ids::{PaxosGroupId, TransactionId};

    #[test]
    fn record_keys_are_unique_per_slot() {
        let tg = TransactionGroup::new(TransactionId::new(PaxosGroupId(1), 7, 100));
        let a = FileJournal::record_key(tg, 0);
        let b = FileJournal::record_key(tg, 1);
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn journal_survives_reopen() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("group.log");
        let tg = TransactionGroup::new(TransactionId::new(PaxosGroupId(1), 7, 100));

        let journal = FileJournal::open(path.clone())?;
        journal.record(tg, 0, b"begin")?;
        journal.record(tg, 1, b"write")?;
        drop(journal);

        let journal = FileJournal::open(path)?;
        let mut log = journal.log.lock()?;
        assert_eq!(log.build_keydir()?.len(), 2);
        Ok(())
    }
}
