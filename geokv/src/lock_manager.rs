//! The per-replica lock manager. Each (table, key) has at most one holder
//! and a FIFO list of waiters. Conflicts resolve by wound-wait: an older
//! requester (lower start timestamp) wounds a younger holder and jumps the
//! queue; a younger requester waits. Grants persist through the data layer
//! before they are visible, so the durable lock record always names the
//! current holder.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::datalayer::Datalayer;
use crate::encoding::strescape;
use crate::error::CResult;
use crate::ids::{CommId, TransactionGroup};
use crate::storage::engine::Engine;

const SHARDS: usize = 16;

/// A queued lock request: who wants the lock and where to send the grant
/// when it arrives.
#[derive(Clone, Debug, PartialEq)]
pub struct Waiter {
    pub tg: TransactionGroup,
    pub priority: u64,
    pub coord: CommId,
    pub state_key: u64,
}

/// What happened to a lock request.
#[derive(Clone, Debug, PartialEq)]
pub enum LockOutcome {
    /// The caller holds the lock, durably.
    Granted,

    /// The caller waits behind the holder.
    Queued,

    /// The caller outranks the holder: it waits at the head of the queue and
    /// the holder must be told to abort.
    Wound { victim: TransactionGroup },
}

struct LockState {
    holder: TransactionGroup,
    waiters: VecDeque<Waiter>,
}

pub struct LockManager {
    shards: Vec<Mutex<HashMap<(Vec<u8>, Vec<u8>), LockState>>>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager { shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    fn shard(&self, table: &[u8], key: &[u8]) -> &Mutex<HashMap<(Vec<u8>, Vec<u8>), LockState>> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        table.hash(&mut hasher);
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % SHARDS as u64) as usize]
    }

    /// Rebuilds in-memory holders from the durable lock records, e.g. after
    /// a restart. Waiters are not durable; their coordinators resend.
    pub fn recover<E: Engine>(&self, data: &Datalayer<E>) -> CResult<usize> {
        let locks = data.locks()?;
        let count = locks.len();
        for (table, key, tg) in locks {
            let mut shard = self.shard(&table, &key).lock()?;
            shard.insert((table, key), LockState { holder: tg, waiters: VecDeque::new() });
        }
        Ok(count)
    }

    /// Requests the lock on (table, key) for the waiter's transaction.
    pub fn lock<E: Engine>(
        &self,
        data: &Datalayer<E>,
        table: &[u8],
        key: &[u8],
        waiter: Waiter,
    ) -> CResult<LockOutcome> {
        let mut shard = self.shard(table, key).lock()?;
        let state = match shard.get_mut(&(table.to_vec(), key.to_vec())) {
            None => {
                data.write_lock(table, key, &waiter.tg)?;
                log::debug!(
                    "lock (\"{}\", \"{}\") granted to {}",
                    strescape(table),
                    strescape(key),
                    waiter.tg
                );
                shard.insert(
                    (table.to_vec(), key.to_vec()),
                    LockState { holder: waiter.tg, waiters: VecDeque::new() },
                );
                return Ok(LockOutcome::Granted);
            }
            Some(state) => state,
        };

        if state.holder == waiter.tg {
            return Ok(LockOutcome::Granted);
        }
        if state.waiters.iter().any(|w| w.tg == waiter.tg) {
            return Ok(LockOutcome::Queued);
        }

        if waiter.priority < state.holder.priority() {
            // The requester is older than the holder. Wound the holder and
            // put the requester first in line for the handoff.
            let victim = state.holder;
            log::info!(
                "lock (\"{}\", \"{}\"): {} wounds {}",
                strescape(table),
                strescape(key),
                waiter.tg,
                victim
            );
            state.waiters.push_front(waiter);
            return Ok(LockOutcome::Wound { victim });
        }

        state.waiters.push_back(waiter);
        Ok(LockOutcome::Queued)
    }

    /// Releases the lock if tg is the holder. Returns the next waiter, now
    /// the durable holder, so the caller can notify its coordinator.
    pub fn unlock<E: Engine>(
        &self,
        data: &Datalayer<E>,
        table: &[u8],
        key: &[u8],
        tg: &TransactionGroup,
    ) -> CResult<Option<Waiter>> {
        let mut shard = self.shard(table, key).lock()?;
        let state = match shard.get_mut(&(table.to_vec(), key.to_vec())) {
            Some(state) => state,
            None => return Ok(None),
        };
        if state.holder != *tg {
            // Not the holder: either a stale duplicate release, or an
            // aborting transaction cancelling its place in line.
            if let Some(at) = state.waiters.iter().position(|w| w.tg == *tg) {
                state.waiters.remove(at);
                log::debug!(
                    "lock (\"{}\", \"{}\"): dequeued {}",
                    strescape(table),
                    strescape(key),
                    tg
                );
            }
            return Ok(None);
        }

        match state.waiters.pop_front() {
            Some(next) => {
                data.write_lock(table, key, &next.tg)?;
                log::debug!(
                    "lock (\"{}\", \"{}\") handed off from {} to {}",
                    strescape(table),
                    strescape(key),
                    tg,
                    next.tg
                );
                state.holder = next.tg;
                Ok(Some(next))
            }
            None => {
                data.clear_lock(table, key)?;
                shard.remove(&(table.to_vec(), key.to_vec()));
                Ok(None)
            }
        }
    }

    /// The current holder, if any. For introspection and tests.
    pub fn holder(&self, table: &[u8], key: &[u8]) -> Option<TransactionGroup> {
        let shard = self.shard(table, key).lock().ok()?;
        shard.get(&(table.to_vec(), key.to_vec())).map(|s| s.holder)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{PaxosGroupId, TransactionId};
    use crate::storage::memory::Memory;

    fn datalayer() -> Datalayer<Memory> {
        Datalayer::new(Memory::new())
    }

    fn waiter(number: u64, start_ts: u64) -> Waiter {
        let tg = TransactionGroup::new(TransactionId::new(PaxosGroupId(1), number, start_ts));
        Waiter { tg, priority: start_ts, coord: CommId(100 + number), state_key: number }
    }

    #[test]
    fn grant_is_durable_and_idempotent() -> CResult<()> {
        let data = datalayer();
        let locks = LockManager::new();
        let w = waiter(1, 100);

        assert_eq!(locks.lock(&data, b"t", b"k", w.clone())?, LockOutcome::Granted);
        assert_eq!(data.read_lock(b"t", b"k")?, Some(w.tg));
        // Re-requesting an already-held lock grants again.
        assert_eq!(locks.lock(&data, b"t", b"k", w.clone())?, LockOutcome::Granted);
        Ok(())
    }

    #[test]
    fn younger_requester_queues_behind_older_holder() -> CResult<()> {
        let data = datalayer();
        let locks = LockManager::new();
        let older = waiter(1, 100);
        let younger = waiter(2, 200);

        assert_eq!(locks.lock(&data, b"t", b"k", older.clone())?, LockOutcome::Granted);
        assert_eq!(locks.lock(&data, b"t", b"k", younger.clone())?, LockOutcome::Queued);
        // Queueing is idempotent under resends.
        assert_eq!(locks.lock(&data, b"t", b"k", younger.clone())?, LockOutcome::Queued);
        // The holder is unchanged, in memory and on disk.
        assert_eq!(locks.holder(b"t", b"k"), Some(older.tg));
        assert_eq!(data.read_lock(b"t", b"k")?, Some(older.tg));
        Ok(())
    }

    #[test]
    fn older_requester_wounds_younger_holder() -> CResult<()> {
        let data = datalayer();
        let locks = LockManager::new();
        let older = waiter(1, 100);
        let younger = waiter(2, 200);

        assert_eq!(locks.lock(&data, b"t", b"k", younger.clone())?, LockOutcome::Granted);
        assert_eq!(
            locks.lock(&data, b"t", b"k", older.clone())?,
            LockOutcome::Wound { victim: younger.tg }
        );
        // The victim holds until its abort releases; the aggressor is next.
        assert_eq!(locks.holder(b"t", b"k"), Some(younger.tg));
        let next = locks.unlock(&data, b"t", b"k", &younger.tg)?;
        assert_eq!(next, Some(older.clone()));
        assert_eq!(data.read_lock(b"t", b"k")?, Some(older.tg));
        Ok(())
    }

    #[test]
    fn wound_jumps_ahead_of_fifo_waiters() -> CResult<()> {
        let data = datalayer();
        let locks = LockManager::new();
        let holder = waiter(1, 150);
        let queued = waiter(2, 300);
        let aggressor = waiter(3, 100);

        locks.lock(&data, b"t", b"k", holder.clone())?;
        assert_eq!(locks.lock(&data, b"t", b"k", queued.clone())?, LockOutcome::Queued);
        assert_eq!(
            locks.lock(&data, b"t", b"k", aggressor.clone())?,
            LockOutcome::Wound { victim: holder.tg }
        );

        // Handoff order: the aggressor first, then the FIFO waiter.
        assert_eq!(locks.unlock(&data, b"t", b"k", &holder.tg)?, Some(aggressor.clone()));
        assert_eq!(locks.unlock(&data, b"t", b"k", &aggressor.tg)?, Some(queued.clone()));
        Ok(())
    }

    #[test]
    fn release_without_waiters_clears_the_record() -> CResult<()> {
        let data = datalayer();
        let locks = LockManager::new();
        let w = waiter(1, 100);

        locks.lock(&data, b"t", b"k", w.clone())?;
        assert_eq!(locks.unlock(&data, b"t", b"k", &w.tg)?, None);
        assert_eq!(locks.holder(b"t", b"k"), None);
        assert_eq!(data.read_lock(b"t", b"k")?, None);
        Ok(())
    }

    #[test]
    fn release_by_a_waiter_cancels_its_queue_slot() -> CResult<()> {
        let data = datalayer();
        let locks = LockManager::new();
        let holder = waiter(1, 100);
        let queued = waiter(2, 200);

        locks.lock(&data, b"t", b"k", holder.clone())?;
        assert_eq!(locks.lock(&data, b"t", b"k", queued.clone())?, LockOutcome::Queued);
        // The queued transaction aborts; its unlock removes it from the line
        // so the eventual release does not grant it a zombie lock.
        assert_eq!(locks.unlock(&data, b"t", b"k", &queued.tg)?, None);
        assert_eq!(locks.unlock(&data, b"t", b"k", &holder.tg)?, None);
        assert_eq!(locks.holder(b"t", b"k"), None);
        Ok(())
    }

    #[test]
    fn stale_release_is_ignored() -> CResult<()> {
        let data = datalayer();
        let locks = LockManager::new();
        let holder = waiter(1, 100);
        let other = waiter(2, 200);

        locks.lock(&data, b"t", b"k", holder.clone())?;
        assert_eq!(locks.unlock(&data, b"t", b"k", &other.tg)?, None);
        assert_eq!(locks.holder(b"t", b"k"), Some(holder.tg));
        Ok(())
    }

    #[test]
    fn recovery_rebuilds_holders_from_durable_records() -> CResult<()> {
        let data = datalayer();
        let locks = LockManager::new();
        let a = waiter(1, 100);
        let b = waiter(2, 200);
        locks.lock(&data, b"t", b"k1", a.clone())?;
        locks.lock(&data, b"t", b"k2", b.clone())?;

        // A fresh manager over the same data layer sees both holders.
        let recovered = LockManager::new();
        assert_eq!(recovered.recover(&data)?, 2);
        assert_eq!(recovered.holder(b"t", b"k1"), Some(a.tg));
        assert_eq!(recovered.holder(b"t", b"k2"), Some(b.tg));
        Ok(())
    }
}
