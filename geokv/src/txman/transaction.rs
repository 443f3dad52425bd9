//! The per-transaction coordinator. A transaction lives inside its paxos
//! group: every state-changing step is first replicated as a slot in the
//! group's log, and only the committed slot drives the state machine. The
//! machine itself performs no I/O; each input returns the actions (proposals,
//! kvs operations, client responses) for the daemon to carry out, so a
//! surviving group member can rebuild the same state from the log and
//! resume the same actions.
//!
//! ```text
//! BEGIN ──► EXECUTING ──► PREPARING ──► COMMITTED
//!                 │              │
//!                 │              └──► ABORTED
//!                 └──► ABORTED
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use serde_derive::{Deserialize, Serialize};

use crate::encoding::Packer;
use crate::error::CResult;
use crate::ids::{CommId, TransactionGroup};
use crate::state_table::Finished;
use crate::wire::ReturnCode;

/// One replicated slot of a transaction's log. A write records the client's
/// own operation number alongside the data, so a rebuilt coordinator still
/// rejects reuse of a spent number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    Begin,
    Read { table: Vec<u8>, key: Vec<u8> },
    Write { slot: u64, table: Vec<u8>, key: Vec<u8>, value: Vec<u8> },
    Commit,
    Abort,
    Outcome { committed: bool, commit_ts: u64 },
}

impl LogEntry {
    pub fn encode(&self) -> CResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Executing,
    Preparing,
    Committed,
    Aborted,
}

/// Work the daemon must perform on the state machine's behalf.
#[derive(Clone, Debug, PartialEq)]
pub enum TxAction {
    /// Replicate an entry into the group log at the given slot.
    Propose { slot: u64, entry: LogEntry },

    /// Issue a replicated read; the answer comes back via read_done(seqno).
    KvsRead { seqno: u64, table: Vec<u8>, key: Vec<u8>, timestamp_le: u64 },

    /// Issue a replicated write at the chosen timestamp (empty value is a
    /// tombstone); the answer comes back via write_done.
    KvsWrite { table: Vec<u8>, key: Vec<u8>, value: Vec<u8>, timestamp: u64 },

    /// Acquire the replicated lock; the answer comes back via lock_done.
    KvsLock { table: Vec<u8>, key: Vec<u8> },

    /// Release the replicated lock; the answer comes back via unlock_done.
    KvsUnlock { table: Vec<u8>, key: Vec<u8> },

    /// Answer a client, exactly once per nonce.
    Respond { client: CommId, nonce: u64, rc: ReturnCode, timestamp: u64, value: Vec<u8> },
}

type TableKey = (Vec<u8>, Vec<u8>);

struct Inner {
    state: TxState,
    /// Log slots proposed or applied so far; the next proposal uses
    /// next_slot.
    next_slot: u64,
    /// Client-assigned write numbers already spent.
    client_slots: BTreeSet<u64>,
    /// Clients awaiting the commit of their log slot.
    slot_clients: HashMap<u64, (CommId, u64)>,
    /// The client awaiting the final outcome.
    outcome_client: Option<(CommId, u64)>,
    /// Slots of reads whose replicated read is still in flight.
    reads_outstanding: BTreeSet<u64>,
    /// The greatest version timestamp any read observed.
    read_max_ts: u64,
    /// The replicated write set, ordered by (table, key) so lock
    /// acquisition follows one global order.
    writes: BTreeMap<TableKey, Vec<u8>>,
    locks_outstanding: BTreeSet<TableKey>,
    locks_held: BTreeSet<TableKey>,
    writes_outstanding: BTreeSet<TableKey>,
    /// Final per-key timestamps reported by the write replicators.
    write_ts: BTreeMap<TableKey, u64>,
    /// An outcome slot has been proposed; the decision is no longer ours.
    outcome_proposed: bool,
    /// The outcome slot has committed in the group log.
    outcome_replicated: bool,
    /// The decided outcome, kept for answering retried commit/abort calls.
    final_outcome: Option<(bool, u64)>,
}

pub struct Transaction {
    tg: TransactionGroup,
    inner: Mutex<Inner>,
}

impl Transaction {
    pub fn new(tg: TransactionGroup) -> Self {
        Transaction {
            tg,
            inner: Mutex::new(Inner {
                state: TxState::Executing,
                next_slot: 0,
                client_slots: BTreeSet::new(),
                slot_clients: HashMap::new(),
                outcome_client: None,
                reads_outstanding: BTreeSet::new(),
                read_max_ts: 0,
                writes: BTreeMap::new(),
                locks_outstanding: BTreeSet::new(),
                locks_held: BTreeSet::new(),
                writes_outstanding: BTreeSet::new(),
                write_ts: BTreeMap::new(),
                outcome_proposed: false,
                outcome_replicated: false,
                final_outcome: None,
            }),
        }
    }

    pub fn tg(&self) -> TransactionGroup {
        self.tg
    }

    pub fn state(&self) -> TxState {
        self.inner.lock().expect("transaction poisoned").state
    }

    fn start_ts(&self) -> u64 {
        self.tg.txid.start_ts
    }

    /// The begin record, slot 0. The client learns its transaction id from
    /// the response value once the slot commits.
    pub fn client_begin(&self, client: CommId, nonce: u64) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        let slot = Self::alloc_slot(&mut inner);
        inner.slot_clients.insert(slot, (client, nonce));
        vec![TxAction::Propose { slot, entry: LogEntry::Begin }]
    }

    pub fn client_read(
        &self,
        client: CommId,
        nonce: u64,
        table: Vec<u8>,
        key: Vec<u8>,
    ) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        if let Some(action) = Self::reject_if_not_executing(&inner, client, nonce) {
            return vec![action];
        }
        let slot = Self::alloc_slot(&mut inner);
        inner.slot_clients.insert(slot, (client, nonce));
        vec![TxAction::Propose { slot, entry: LogEntry::Read { table, key } }]
    }

    pub fn client_write(
        &self,
        client: CommId,
        nonce: u64,
        slot: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        if let Some(action) = Self::reject_if_not_executing(&inner, client, nonce) {
            return vec![action];
        }
        if inner.client_slots.contains(&slot) {
            // Write numbers are single-use; reuse is a client bug, not a
            // resend.
            return vec![TxAction::Respond {
                client,
                nonce,
                rc: ReturnCode::Invalid,
                timestamp: 0,
                value: Vec::new(),
            }];
        }
        inner.client_slots.insert(slot);
        let log_slot = Self::alloc_slot(&mut inner);
        inner.slot_clients.insert(log_slot, (client, nonce));
        vec![TxAction::Propose {
            slot: log_slot,
            entry: LogEntry::Write { slot, table, key, value },
        }]
    }

    pub fn client_commit(&self, client: CommId, nonce: u64) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        match inner.state {
            TxState::Committed | TxState::Aborted => {
                return Self::respond_outcome(&inner, client, nonce);
            }
            TxState::Preparing => {
                // Already committing, e.g. a retry after a coordinator
                // failover; answer when the outcome commits.
                inner.outcome_client = Some((client, nonce));
                return Vec::new();
            }
            TxState::Executing if inner.outcome_proposed => {
                inner.outcome_client = Some((client, nonce));
                return Vec::new();
            }
            TxState::Executing => {}
        }
        inner.outcome_client = Some((client, nonce));
        let slot = Self::alloc_slot(&mut inner);
        vec![TxAction::Propose { slot, entry: LogEntry::Commit }]
    }

    pub fn client_abort(&self, client: CommId, nonce: u64) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        match inner.state {
            TxState::Committed | TxState::Aborted => {
                return Self::respond_outcome(&inner, client, nonce);
            }
            TxState::Preparing => {
                // Too late to abort unilaterally; the commit pipeline owns
                // the decision now.
                inner.outcome_client = Some((client, nonce));
                return Vec::new();
            }
            TxState::Executing => {}
        }
        inner.outcome_client = Some((client, nonce));
        if inner.outcome_proposed {
            return Vec::new(); // an abort is already on its way
        }
        let slot = Self::alloc_slot(&mut inner);
        vec![TxAction::Propose { slot, entry: LogEntry::Abort }]
    }

    fn respond_outcome(inner: &Inner, client: CommId, nonce: u64) -> Vec<TxAction> {
        let (committed, commit_ts) = inner.final_outcome.unwrap_or((false, 0));
        let rc = if committed { ReturnCode::Committed } else { ReturnCode::Aborted };
        vec![TxAction::Respond { client, nonce, rc, timestamp: commit_ts, value: Vec::new() }]
    }

    /// A slot committed in the group log, in order. This is the only place
    /// the state machine advances.
    pub fn applied(&self, slot: u64, entry: &LogEntry) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        if slot >= inner.next_slot {
            inner.next_slot = slot + 1;
        }

        match entry {
            LogEntry::Begin => {
                let mut value = Packer::new();
                self.tg.txid.pack(&mut value);
                Self::respond_slot(&mut inner, slot, ReturnCode::Success, 0, value.take())
            }
            LogEntry::Read { table, key } => {
                if inner.outcome_proposed {
                    // The slot replicated, but the transaction is dying.
                    return Self::respond_slot(&mut inner, slot, ReturnCode::Aborted, 0, Vec::new());
                }
                inner.reads_outstanding.insert(slot);
                vec![TxAction::KvsRead {
                    seqno: slot,
                    table: table.clone(),
                    key: key.clone(),
                    timestamp_le: self.start_ts(),
                }]
            }
            LogEntry::Write { slot: client_slot, table, key, value } => {
                inner.client_slots.insert(*client_slot);
                if inner.outcome_proposed {
                    return Self::respond_slot(&mut inner, slot, ReturnCode::Aborted, 0, Vec::new());
                }
                inner.writes.insert((table.clone(), key.clone()), value.clone());
                Self::respond_slot(&mut inner, slot, ReturnCode::Success, 0, Vec::new())
            }
            LogEntry::Commit => {
                if inner.state != TxState::Executing || inner.outcome_proposed {
                    return Vec::new();
                }
                inner.state = TxState::Preparing;
                if inner.writes.is_empty() {
                    // Nothing to lock or write; the outcome is immediate.
                    return self.propose_outcome(&mut inner, true, self.start_ts());
                }
                inner.locks_outstanding = inner.writes.keys().cloned().collect();
                inner
                    .locks_outstanding
                    .iter()
                    .map(|(table, key)| TxAction::KvsLock {
                        table: table.clone(),
                        key: key.clone(),
                    })
                    .collect()
            }
            LogEntry::Abort => {
                // Only an executing transaction can still abort unilaterally;
                // once the commit pipeline started, it owns the decision.
                if inner.state != TxState::Executing {
                    return Vec::new();
                }
                self.abort(&mut inner)
            }
            LogEntry::Outcome { committed, commit_ts } => {
                inner.outcome_replicated = true;
                inner.final_outcome = Some((*committed, *commit_ts));
                inner.state = if *committed { TxState::Committed } else { TxState::Aborted };
                let rc = if *committed { ReturnCode::Committed } else { ReturnCode::Aborted };
                let mut actions = Vec::new();
                if let Some((client, nonce)) = inner.outcome_client.take() {
                    actions.push(TxAction::Respond {
                        client,
                        nonce,
                        rc,
                        timestamp: *commit_ts,
                        value: Vec::new(),
                    });
                }
                // Locks release only after the outcome is durable in the
                // group; a crash before this point must not lose them.
                for (table, key) in inner.locks_held.clone() {
                    actions.push(TxAction::KvsUnlock { table, key });
                }
                actions
            }
        }
    }

    /// The replicated read for the given slot finished.
    pub fn read_done(
        &self,
        seqno: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Vec<u8>,
    ) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        if !inner.reads_outstanding.remove(&seqno) {
            return Vec::new();
        }
        inner.read_max_ts = inner.read_max_ts.max(timestamp);
        let mut actions = Self::respond_slot(&mut inner, seqno, rc, timestamp, value);
        if rc == ReturnCode::ServerError {
            // The partition stayed unreachable past the replicator's
            // deadline; fail-stop.
            actions.extend(self.abort(&mut inner));
        }
        actions
    }

    /// A replicated lock acquisition finished.
    pub fn lock_done(&self, table: Vec<u8>, key: Vec<u8>, rc: ReturnCode) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        if inner.state != TxState::Preparing || inner.outcome_proposed {
            return Vec::new();
        }
        if rc != ReturnCode::Success {
            return self.abort(&mut inner);
        }
        let tk = (table, key);
        inner.locks_outstanding.remove(&tk);
        inner.locks_held.insert(tk);
        if !inner.locks_outstanding.is_empty() {
            return Vec::new();
        }

        // All locks held: fix a tentative commit timestamp above everything
        // this transaction observed; each write replicator bumps further
        // past its key's committed maximum.
        let tentative = self.start_ts().max(inner.read_max_ts) + 1;
        inner.writes_outstanding = inner.writes.keys().cloned().collect();
        inner
            .writes
            .iter()
            .map(|((table, key), value)| TxAction::KvsWrite {
                table: table.clone(),
                key: key.clone(),
                value: value.clone(),
                timestamp: tentative,
            })
            .collect()
    }

    /// A replicated write finished at its final timestamp.
    pub fn write_done(
        &self,
        table: Vec<u8>,
        key: Vec<u8>,
        rc: ReturnCode,
        timestamp: u64,
    ) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        if inner.state != TxState::Preparing || inner.outcome_proposed {
            return Vec::new();
        }
        if rc != ReturnCode::Success {
            return self.abort(&mut inner);
        }
        let tk = (table, key);
        if !inner.writes_outstanding.remove(&tk) {
            return Vec::new();
        }
        inner.write_ts.insert(tk, timestamp);
        if !inner.writes_outstanding.is_empty() {
            return Vec::new();
        }
        let commit_ts = inner.write_ts.values().copied().max().unwrap_or(self.start_ts());
        self.propose_outcome(&mut inner, true, commit_ts)
    }

    /// A replicated unlock finished.
    pub fn unlock_done(&self, table: Vec<u8>, key: Vec<u8>) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        inner.locks_held.remove(&(table, key));
        Vec::new()
    }

    /// A wound arrived from a kvs: some older transaction wants a lock this
    /// one holds. While the transaction is executing or still waiting for
    /// locks it fail-stops to ABORTED. Once every lock is held it is
    /// effectively prepared: its writes may already be landing durably, so
    /// the wound is discarded and the older transaction waits out the
    /// release -- a prepared transaction acquires nothing further, so no
    /// deadlock can form through it.
    pub fn wound(&self) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        let woundable = match inner.state {
            TxState::Executing => true,
            TxState::Preparing => !inner.locks_outstanding.is_empty(),
            TxState::Committed | TxState::Aborted => false,
        };
        if !woundable || inner.outcome_proposed {
            return Vec::new();
        }
        log::info!("{} wounded, aborting", self.tg);
        self.abort(&mut inner)
    }

    /// Re-drives the machine after this group member took over as leader
    /// and replayed the committed log through applied(). Every re-issued
    /// operation is idempotent at the kvs tier.
    pub fn resume(&self) -> Vec<TxAction> {
        let mut inner = self.inner.lock().expect("transaction poisoned");
        match inner.state {
            TxState::Executing => Vec::new(),
            TxState::Preparing => {
                inner.locks_outstanding = inner.writes.keys().cloned().collect();
                inner.locks_held.clear();
                inner.writes_outstanding.clear();
                inner.write_ts.clear();
                inner
                    .locks_outstanding
                    .iter()
                    .map(|(table, key)| TxAction::KvsLock {
                        table: table.clone(),
                        key: key.clone(),
                    })
                    .collect()
            }
            TxState::Committed | TxState::Aborted => inner
                .writes
                .keys()
                .map(|(table, key)| TxAction::KvsUnlock {
                    table: table.clone(),
                    key: key.clone(),
                })
                .collect(),
        }
    }

    fn abort(&self, inner: &mut Inner) -> Vec<TxAction> {
        if inner.outcome_proposed {
            return Vec::new();
        }
        let mut actions = Vec::new();
        // Answer anyone still waiting on a read; the commit caller is
        // answered when the outcome commits.
        let waiting: Vec<u64> = inner.reads_outstanding.iter().copied().collect();
        for slot in waiting {
            inner.reads_outstanding.remove(&slot);
            actions.extend(Self::respond_slot(
                inner,
                slot,
                ReturnCode::Aborted,
                0,
                Vec::new(),
            ));
        }
        // Release every write key, held or merely queued-for; the lock
        // manager dequeues waiters it has not granted.
        for (table, key) in inner.writes.keys().cloned().collect::<Vec<TableKey>>() {
            actions.push(TxAction::KvsUnlock { table, key });
        }
        inner.locks_held.clear();
        inner.locks_outstanding.clear();
        actions.extend(self.propose_outcome(inner, false, 0));
        actions
    }

    fn propose_outcome(&self, inner: &mut Inner, committed: bool, commit_ts: u64) -> Vec<TxAction> {
        if inner.outcome_proposed {
            return Vec::new();
        }
        inner.outcome_proposed = true;
        let slot = Self::alloc_slot(inner);
        vec![TxAction::Propose { slot, entry: LogEntry::Outcome { committed, commit_ts } }]
    }

    fn alloc_slot(inner: &mut Inner) -> u64 {
        let slot = inner.next_slot;
        inner.next_slot += 1;
        slot
    }

    fn respond_slot(
        inner: &mut Inner,
        slot: u64,
        rc: ReturnCode,
        timestamp: u64,
        value: Vec<u8>,
    ) -> Vec<TxAction> {
        match inner.slot_clients.remove(&slot) {
            Some((client, nonce)) => {
                vec![TxAction::Respond { client, nonce, rc, timestamp, value }]
            }
            None => Vec::new(),
        }
    }

    fn reject_if_not_executing(inner: &Inner, client: CommId, nonce: u64) -> Option<TxAction> {
        let rc = match inner.state {
            TxState::Executing if !inner.outcome_proposed => return None,
            TxState::Executing | TxState::Aborted => ReturnCode::Aborted,
            TxState::Preparing => ReturnCode::Invalid,
            TxState::Committed => ReturnCode::Committed,
        };
        Some(TxAction::Respond { client, nonce, rc, timestamp: 0, value: Vec::new() })
    }
}

impl Finished for Transaction {
    fn finished(&self) -> bool {
        let inner = self.inner.lock().expect("transaction poisoned");
        matches!(inner.state, TxState::Committed | TxState::Aborted)
            && inner.outcome_replicated
            && inner.locks_held.is_empty()
            && inner.slot_clients.is_empty()
            && inner.reads_outstanding.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{PaxosGroupId, TransactionId};

    const CLIENT: CommId = CommId(500);

    fn tx() -> Transaction {
        Transaction::new(TransactionGroup::new(TransactionId::new(PaxosGroupId(1), 7, 1000)))
    }

    /// Feeds every Propose action straight back into applied(), as a
    /// single-member group would, returning the remaining actions.
    fn drive(tx: &Transaction, actions: Vec<TxAction>) -> Vec<TxAction> {
        let mut rest = Vec::new();
        let mut queue = actions;
        while let Some(action) = queue.pop() {
            match action {
                TxAction::Propose { slot, entry } => queue.extend(tx.applied(slot, &entry)),
                other => rest.push(other),
            }
        }
        rest.reverse();
        rest
    }

    fn respond_of(actions: &[TxAction]) -> Option<&TxAction> {
        actions.iter().find(|a| matches!(a, TxAction::Respond { .. }))
    }

    #[test]
    fn begin_answers_with_the_transaction_id() {
        let tx = tx();
        let actions = drive(&tx, tx.client_begin(CLIENT, 1));
        match respond_of(&actions) {
            Some(TxAction::Respond { rc, value, .. }) => {
                assert_eq!(*rc, ReturnCode::Success);
                assert_eq!(value.len(), 24);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tx.state(), TxState::Executing);
    }

    #[test]
    fn read_flows_through_the_log_and_the_kvs() {
        let tx = tx();
        drive(&tx, tx.client_begin(CLIENT, 1));
        let actions = drive(&tx, tx.client_read(CLIENT, 2, b"t".to_vec(), b"k".to_vec()));
        match &actions[..] {
            [TxAction::KvsRead { seqno, timestamp_le, .. }] => {
                // Reads observe the snapshot at the start timestamp.
                assert_eq!(*timestamp_le, 1000);
                let done = tx.read_done(*seqno, ReturnCode::Success, 900, b"v".to_vec());
                match respond_of(&done) {
                    Some(TxAction::Respond { rc, timestamp, value, nonce, .. }) => {
                        assert_eq!(*rc, ReturnCode::Success);
                        assert_eq!(*timestamp, 900);
                        assert_eq!(value, b"v");
                        assert_eq!(*nonce, 2);
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn commit_locks_in_key_order_then_writes_then_decides() {
        let tx = tx();
        drive(&tx, tx.client_begin(CLIENT, 1));
        drive(&tx, tx.client_write(CLIENT, 2, 1, b"t".to_vec(), b"kb".to_vec(), b"vb".to_vec()));
        drive(&tx, tx.client_write(CLIENT, 3, 2, b"t".to_vec(), b"ka".to_vec(), b"va".to_vec()));

        let locks = drive(&tx, tx.client_commit(CLIENT, 4));
        assert_eq!(tx.state(), TxState::Preparing);
        // Lock order is (table, key) order, not arrival order.
        assert_eq!(
            locks,
            vec![
                TxAction::KvsLock { table: b"t".to_vec(), key: b"ka".to_vec() },
                TxAction::KvsLock { table: b"t".to_vec(), key: b"kb".to_vec() },
            ]
        );

        assert!(tx.lock_done(b"t".to_vec(), b"ka".to_vec(), ReturnCode::Success).is_empty());
        let writes = tx.lock_done(b"t".to_vec(), b"kb".to_vec(), ReturnCode::Success);
        // All locks held: both writes go out at a timestamp above start_ts.
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|a| matches!(
            a,
            TxAction::KvsWrite { timestamp, .. } if *timestamp == 1001
        )));

        assert!(tx
            .write_done(b"t".to_vec(), b"ka".to_vec(), ReturnCode::Success, 1001)
            .is_empty());
        let outcome = drive(
            &tx,
            tx.write_done(b"t".to_vec(), b"kb".to_vec(), ReturnCode::Success, 1005),
        );
        assert_eq!(tx.state(), TxState::Committed);

        // The client learns COMMITTED at the greatest write timestamp, and
        // both locks release after the outcome replicates.
        match respond_of(&outcome) {
            Some(TxAction::Respond { rc, timestamp, .. }) => {
                assert_eq!(*rc, ReturnCode::Committed);
                assert_eq!(*timestamp, 1005);
            }
            other => panic!("unexpected {:?}", other),
        }
        let unlocks =
            outcome.iter().filter(|a| matches!(a, TxAction::KvsUnlock { .. })).count();
        assert_eq!(unlocks, 2);

        tx.unlock_done(b"t".to_vec(), b"ka".to_vec());
        tx.unlock_done(b"t".to_vec(), b"kb".to_vec());
        assert!(tx.finished());
    }

    #[test]
    fn read_only_commit_needs_no_locks() {
        let tx = tx();
        drive(&tx, tx.client_begin(CLIENT, 1));
        let actions = drive(&tx, tx.client_commit(CLIENT, 2));
        assert_eq!(tx.state(), TxState::Committed);
        match respond_of(&actions) {
            Some(TxAction::Respond { rc, .. }) => assert_eq!(*rc, ReturnCode::Committed),
            other => panic!("unexpected {:?}", other),
        }
        assert!(tx.finished());
    }

    #[test]
    fn abort_releases_held_locks_and_answers_aborted() {
        let tx = tx();
        drive(&tx, tx.client_begin(CLIENT, 1));
        drive(&tx, tx.client_write(CLIENT, 2, 1, b"t".to_vec(), b"k".to_vec(), b"v".to_vec()));
        drive(&tx, tx.client_commit(CLIENT, 3));
        tx.lock_done(b"t".to_vec(), b"k".to_vec(), ReturnCode::Success);

        // The lock replicator timed out on a second key... or in this case,
        // the write failed; either way the machine fail-stops.
        let actions =
            drive(&tx, tx.write_done(b"t".to_vec(), b"k".to_vec(), ReturnCode::ServerError, 0));
        assert_eq!(tx.state(), TxState::Aborted);
        assert!(actions.contains(&TxAction::KvsUnlock { table: b"t".to_vec(), key: b"k".to_vec() }));
        match respond_of(&actions) {
            Some(TxAction::Respond { rc, .. }) => assert_eq!(*rc, ReturnCode::Aborted),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wound_while_waiting_for_locks_aborts_once() {
        let tx = tx();
        drive(&tx, tx.client_begin(CLIENT, 1));
        drive(&tx, tx.client_write(CLIENT, 2, 1, b"t".to_vec(), b"ka".to_vec(), b"v".to_vec()));
        drive(&tx, tx.client_write(CLIENT, 3, 2, b"t".to_vec(), b"kb".to_vec(), b"v".to_vec()));
        drive(&tx, tx.client_commit(CLIENT, 4));
        tx.lock_done(b"t".to_vec(), b"ka".to_vec(), ReturnCode::Success);

        // Still waiting on kb: the wound lands, the held lock releases.
        let actions = drive(&tx, tx.wound());
        assert_eq!(tx.state(), TxState::Aborted);
        assert!(actions
            .contains(&TxAction::KvsUnlock { table: b"t".to_vec(), key: b"ka".to_vec() }));
        match respond_of(&actions) {
            Some(TxAction::Respond { rc, .. }) => assert_eq!(*rc, ReturnCode::Aborted),
            other => panic!("unexpected {:?}", other),
        }
        // A duplicate wound is a no-op.
        assert!(tx.wound().is_empty());
    }

    #[test]
    fn wound_after_all_locks_held_is_discarded() {
        let tx = tx();
        drive(&tx, tx.client_begin(CLIENT, 1));
        drive(&tx, tx.client_write(CLIENT, 2, 1, b"t".to_vec(), b"k".to_vec(), b"v".to_vec()));
        drive(&tx, tx.client_commit(CLIENT, 3));
        tx.lock_done(b"t".to_vec(), b"k".to_vec(), ReturnCode::Success);

        // Effectively prepared: writes may already be landing durably, so
        // the wound is too late and the commit pipeline runs to completion.
        assert!(tx.wound().is_empty());
        assert_eq!(tx.state(), TxState::Preparing);

        let outcome =
            drive(&tx, tx.write_done(b"t".to_vec(), b"k".to_vec(), ReturnCode::Success, 1001));
        assert_eq!(tx.state(), TxState::Committed);
        match respond_of(&outcome) {
            Some(TxAction::Respond { rc, .. }) => assert_eq!(*rc, ReturnCode::Committed),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn commit_retry_after_failover_answers_the_final_outcome() {
        let tx = tx();
        drive(&tx, tx.client_begin(CLIENT, 1));
        drive(&tx, tx.client_write(CLIENT, 2, 1, b"t".to_vec(), b"k".to_vec(), b"v".to_vec()));
        drive(&tx, tx.client_commit(CLIENT, 3));
        // A retried commit while preparing parks the client on the outcome.
        assert!(tx.client_commit(CLIENT, 4).is_empty());

        tx.lock_done(b"t".to_vec(), b"k".to_vec(), ReturnCode::Success);
        let outcome =
            drive(&tx, tx.write_done(b"t".to_vec(), b"k".to_vec(), ReturnCode::Success, 1002));
        match respond_of(&outcome) {
            Some(TxAction::Respond { nonce, rc, .. }) => {
                assert_eq!(*nonce, 4);
                assert_eq!(*rc, ReturnCode::Committed);
            }
            other => panic!("unexpected {:?}", other),
        }

        // And a commit after the fact answers directly.
        let again = tx.client_commit(CLIENT, 5);
        match respond_of(&again) {
            Some(TxAction::Respond { rc, timestamp, .. }) => {
                assert_eq!(*rc, ReturnCode::Committed);
                assert_eq!(*timestamp, 1002);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wound_after_commit_is_discarded() {
        let tx = tx();
        drive(&tx, tx.client_begin(CLIENT, 1));
        drive(&tx, tx.client_commit(CLIENT, 2));
        assert_eq!(tx.state(), TxState::Committed);
        assert!(tx.wound().is_empty());
        assert_eq!(tx.state(), TxState::Committed);
    }

    #[test]
    fn operations_after_the_outcome_are_rejected() {
        let tx1 = tx();
        drive(&tx1, tx1.client_begin(CLIENT, 1));
        drive(&tx1, tx1.client_commit(CLIENT, 2));

        let actions = tx1.client_write(CLIENT, 3, 5, b"t".to_vec(), b"k".to_vec(), b"v".to_vec());
        match respond_of(&actions) {
            Some(TxAction::Respond { rc, .. }) => assert_eq!(*rc, ReturnCode::Committed),
            other => panic!("unexpected {:?}", other),
        }

        let tx2 = tx();
        drive(&tx2, tx2.client_begin(CLIENT, 1));
        drive(&tx2, tx2.wound());
        let actions = tx2.client_read(CLIENT, 2, b"t".to_vec(), b"k".to_vec());
        match respond_of(&actions) {
            Some(TxAction::Respond { rc, .. }) => assert_eq!(*rc, ReturnCode::Aborted),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn duplicate_write_slots_are_invalid() {
        let tx = tx();
        drive(&tx, tx.client_begin(CLIENT, 1));
        drive(&tx, tx.client_write(CLIENT, 2, 1, b"t".to_vec(), b"k".to_vec(), b"v".to_vec()));
        let actions =
            tx.client_write(CLIENT, 3, 1, b"t".to_vec(), b"k2".to_vec(), b"v2".to_vec());
        match respond_of(&actions) {
            Some(TxAction::Respond { rc, .. }) => assert_eq!(*rc, ReturnCode::Invalid),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn recovery_replays_the_log_and_resumes_preparing() {
        // A new leader rebuilds the machine from the committed log of a
        // transaction that crashed between lock acquisition and outcome.
        let tx = tx();
        tx.applied(0, &LogEntry::Begin);
        tx.applied(1, &LogEntry::Write { slot: 1, table: b"t".to_vec(), key: b"k".to_vec(), value: b"v".to_vec() });
        tx.applied(2, &LogEntry::Commit);
        assert_eq!(tx.state(), TxState::Preparing);

        let actions = tx.resume();
        assert_eq!(
            actions,
            vec![TxAction::KvsLock { table: b"t".to_vec(), key: b"k".to_vec() }]
        );
        // Locks and writes re-run idempotently, then the outcome commits.
        tx.lock_done(b"t".to_vec(), b"k".to_vec(), ReturnCode::Success);
        let outcome = drive(
            &tx,
            tx.write_done(b"t".to_vec(), b"k".to_vec(), ReturnCode::Success, 1001),
        );
        assert_eq!(tx.state(), TxState::Committed);
        assert!(outcome.contains(&TxAction::KvsUnlock { table: b"t".to_vec(), key: b"k".to_vec() }));
    }

    #[test]
    fn recovery_of_a_decided_transaction_rereleases_locks() {
        let tx = tx();
        tx.applied(0, &LogEntry::Begin);
        tx.applied(1, &LogEntry::Write { slot: 1, table: b"t".to_vec(), key: b"k".to_vec(), value: b"v".to_vec() });
        tx.applied(2, &LogEntry::Commit);
        tx.applied(3, &LogEntry::Outcome { committed: true, commit_ts: 1005 });
        assert_eq!(tx.state(), TxState::Committed);

        let actions = tx.resume();
        assert_eq!(
            actions,
            vec![TxAction::KvsUnlock { table: b"t".to_vec(), key: b"k".to_vec() }]
        );
    }

    #[test]
    fn log_entries_round_trip() -> CResult<()> {
        let entries = vec![
            LogEntry::Begin,
            LogEntry::Read { table: b"t".to_vec(), key: b"k".to_vec() },
            LogEntry::Write { slot: 1, table: b"t".to_vec(), key: b"k".to_vec(), value: Vec::new() },
            LogEntry::Commit,
            LogEntry::Abort,
            LogEntry::Outcome { committed: true, commit_ts: 77 },
        ];
        for entry in entries {
            assert_eq!(LogEntry::decode(&entry.encode()?)?, entry);
        }
        Ok(())
    }
}
