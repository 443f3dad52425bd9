//! The transaction-manager daemon core: message-type-keyed dispatch into the
//! transaction state machines and their group logs, plus the table of
//! in-flight operations against the kvs tier. Handlers mutate state under
//! the relevant entry's mutex, enqueue outbound frames, and return; all I/O
//! and timing lives in the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::config::Configuration;
use crate::error::CResult;
use crate::ids::{CommId, DataCenterId, TransactionGroup, TransactionId, TxmanId};
use crate::replicator::RESEND_INTERVAL;
use crate::state_table::{Finished, StateTable};
use crate::txman::group_log::GroupLog;
use crate::txman::transaction::{LogEntry, Transaction, TxAction};
use crate::wire::{Envelope, LockOp, Message, Outbox, ReturnCode};

fn now_micros() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0)
}

/// Durable record of committed group-log slots. The daemon writes every slot
/// it applies; on restart the server replays the journal through restore()
/// before accepting traffic.
pub trait Journal: Send + Sync {
    fn record(&self, tg: TransactionGroup, slot: u64, entry: &[u8]) -> CResult<()>;
}

/// Keeps nothing; for tests and in-memory deployments.
pub struct NoJournal;

impl Journal for NoJournal {
    fn record(&self, _tg: TransactionGroup, _slot: u64, _entry: &[u8]) -> CResult<()> {
        Ok(())
    }
}

/// What to do with a kvs answer: which transaction, which handler.
#[derive(Clone, Debug, PartialEq)]
enum Continuation {
    OnReadDone { seqno: u64 },
    OnWriteDone { table: Vec<u8>, key: Vec<u8> },
    OnLockDone { table: Vec<u8>, key: Vec<u8> },
    OnUnlockDone { table: Vec<u8>, key: Vec<u8> },
}

/// An in-flight request against the kvs tier. Unanswered requests resend on
/// an interval, rotating through the data center's instances so a dead
/// coordinator does not stall the transaction.
struct KvsOp {
    tg: TransactionGroup,
    continuation: Continuation,
    targets: Vec<CommId>,
    request: Message,
    state: Mutex<KvsOpState>,
}

struct KvsOpState {
    target: usize,
    last_send: Instant,
    done: bool,
}

impl Finished for KvsOp {
    fn finished(&self) -> bool {
        self.state.lock().map(|s| s.done).unwrap_or(true)
    }
}

pub struct TxmanDaemon {
    us: TxmanId,
    dc: DataCenterId,
    config: Mutex<Arc<Configuration>>,
    transactions: StateTable<TransactionGroup, Transaction>,
    logs: StateTable<TransactionGroup, GroupLog>,
    kvs_ops: StateTable<u64, KvsOp>,
    journal: Box<dyn Journal>,
    counter: AtomicU64,
    last_start_ts: AtomicU64,
}

impl TxmanDaemon {
    pub fn new(us: TxmanId, dc: DataCenterId, config: Arc<Configuration>) -> Self {
        Self::with_journal(us, dc, config, Box::new(NoJournal))
    }

    pub fn with_journal(
        us: TxmanId,
        dc: DataCenterId,
        config: Arc<Configuration>,
        journal: Box<dyn Journal>,
    ) -> Self {
        TxmanDaemon {
            us,
            dc,
            config: Mutex::new(config),
            transactions: StateTable::new(),
            logs: StateTable::new(),
            kvs_ops: StateTable::new(),
            journal,
            counter: AtomicU64::new(1),
            last_start_ts: AtomicU64::new(0),
        }
    }

    pub fn us(&self) -> TxmanId {
        self.us
    }

    fn comm(&self) -> CommId {
        CommId(self.us.0)
    }

    fn config(&self) -> Arc<Configuration> {
        self.config.lock().expect("config poisoned").clone()
    }

    pub fn reconfigure(&self, config: Arc<Configuration>) {
        *self.config.lock().expect("config poisoned") = config;
    }

    /// Ids carry the daemon id in the high bits so state keys never collide
    /// across transaction managers sharing a kvs coordinator.
    fn generate_id(&self) -> u64 {
        (self.us.0 << 32) | self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Wall-clock microseconds, forced strictly monotone so a transaction
    /// begun right after a commit still sees the committed versions and no
    /// two local transactions share a wound-wait priority.
    fn next_start_ts(&self) -> u64 {
        let now = now_micros();
        loop {
            let last = self.last_start_ts.load(Ordering::SeqCst);
            let ts = now.max(last + 1);
            if self
                .last_start_ts
                .compare_exchange(last, ts, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return ts;
            }
        }
    }

    /// Dispatches one inbound frame.
    pub fn handle(&self, from: CommId, msg: Message, now: Instant, out: &mut Outbox) -> CResult<()> {
        match msg {
            Message::TxmanBegin { nonce, version } => {
                self.client_begin(from, nonce, version, now, out)
            }
            Message::TxmanRead { txid, nonce, table, key } => {
                self.with_transaction(txid, from, nonce, now, out, |tx| {
                    tx.client_read(from, nonce, table, key)
                })
            }
            Message::TxmanWrite { txid, nonce, slot, table, key, value } => {
                self.with_transaction(txid, from, nonce, now, out, |tx| {
                    tx.client_write(from, nonce, slot, table, key, value)
                })
            }
            Message::TxmanCommit { txid, nonce } => {
                self.with_transaction(txid, from, nonce, now, out, |tx| {
                    tx.client_commit(from, nonce)
                })
            }
            Message::TxmanAbort { txid, nonce } => {
                self.with_transaction(txid, from, nonce, now, out, |tx| {
                    tx.client_abort(from, nonce)
                })
            }
            Message::KvsRepRdResp { state_key, rc, timestamp, value } => {
                self.kvs_answer(state_key, now, out, |tx, continuation| match continuation {
                    Continuation::OnReadDone { seqno } => {
                        tx.read_done(*seqno, rc, timestamp, value.clone())
                    }
                    _ => Vec::new(),
                })
            }
            Message::KvsRepWrResp { state_key, rc, timestamp } => {
                self.kvs_answer(state_key, now, out, |tx, continuation| match continuation {
                    Continuation::OnWriteDone { table, key } => {
                        tx.write_done(table.clone(), key.clone(), rc, timestamp)
                    }
                    _ => Vec::new(),
                })
            }
            Message::KvsLockOpResp { state_key, rc } => {
                self.kvs_answer(state_key, now, out, |tx, continuation| match continuation {
                    Continuation::OnLockDone { table, key } => {
                        tx.lock_done(table.clone(), key.clone(), rc)
                    }
                    Continuation::OnUnlockDone { table, key } => {
                        tx.unlock_done(table.clone(), key.clone())
                    }
                    _ => Vec::new(),
                })
            }
            Message::WoundXact { victim } => {
                if let Some(tx) = self.transactions.get(&victim) {
                    let actions = tx.wound();
                    self.run_actions(victim, actions, now, out)?;
                    self.drain_committed(victim, now, out)?;
                }
                Ok(())
            }
            Message::Paxos2A { group, ballot, slot, entry } => {
                let log = self.log_for(group, now);
                log.handle_2a(from, ballot, slot, entry, out);
                self.drain_committed(group, now, out)
            }
            Message::Paxos2B { group, ballot, slot } => {
                if let Some(log) = self.logs.get(&group) {
                    log.handle_2b(from, ballot, slot, out);
                }
                self.drain_committed(group, now, out)
            }
            Message::PaxosLearn { group, slot, entry } => {
                let log = self.log_for(group, now);
                log.handle_learn(slot, entry);
                self.drain_committed(group, now, out)
            }
            other => {
                // Not ours; a mis-routed frame is logged and dropped rather
                // than tearing anything down.
                log::warn!("txman {} dropping unexpected {:?}", self.us, other.message_type());
                Ok(())
            }
        }
    }

    fn client_begin(
        &self,
        client: CommId,
        nonce: u64,
        version: crate::ids::VersionId,
        now: Instant,
        out: &mut Outbox,
    ) -> CResult<()> {
        let config = self.config();
        if config.is_stale(version) {
            out.push(Envelope::new(
                client,
                Message::ClientResponse {
                    nonce,
                    rc: ReturnCode::Unavailable,
                    timestamp: 0,
                    value: Vec::new(),
                },
            ));
            return Ok(());
        }
        let group = match config.group_of(self.us) {
            Some(group) => group,
            None => {
                out.push(Envelope::new(
                    client,
                    Message::ClientResponse {
                        nonce,
                        rc: ReturnCode::Unavailable,
                        timestamp: 0,
                        value: Vec::new(),
                    },
                ));
                return Ok(());
            }
        };
        let txid = TransactionId::new(group.id, self.generate_id(), self.next_start_ts());
        let tg = TransactionGroup::new(txid);
        let tx = self.transactions.get_or_create(tg, || Transaction::new(tg));
        self.log_for(tg, now);
        let actions = tx.client_begin(client, nonce);
        self.run_actions(tg, actions, now, out)?;
        self.drain_committed(tg, now, out)
    }

    fn with_transaction(
        &self,
        txid: TransactionId,
        client: CommId,
        nonce: u64,
        now: Instant,
        out: &mut Outbox,
        f: impl FnOnce(&Transaction) -> Vec<TxAction>,
    ) -> CResult<()> {
        let tg = TransactionGroup::new(txid);
        let tx = match self.transactions.get(&tg) {
            Some(tx) => tx,
            None => {
                out.push(Envelope::new(
                    client,
                    Message::ClientResponse {
                        nonce,
                        rc: ReturnCode::Unavailable,
                        timestamp: 0,
                        value: Vec::new(),
                    },
                ));
                return Ok(());
            }
        };
        let actions = f(&tx);
        self.run_actions(tg, actions, now, out)?;
        self.drain_committed(tg, now, out)
    }

    fn kvs_answer(
        &self,
        state_key: u64,
        now: Instant,
        out: &mut Outbox,
        f: impl FnOnce(&Transaction, &Continuation) -> Vec<TxAction>,
    ) -> CResult<()> {
        let op = match self.kvs_ops.get(&state_key) {
            Some(op) => op,
            None => return Ok(()), // a duplicate answer after completion
        };
        {
            let mut state = op.state.lock().expect("kvs op poisoned");
            if state.done {
                return Ok(());
            }
            state.done = true;
        }
        let tg = op.tg;
        let actions = match self.transactions.get(&tg) {
            Some(tx) => f(&tx, &op.continuation),
            None => Vec::new(),
        };
        self.run_actions(tg, actions, now, out)?;
        self.drain_committed(tg, now, out)
    }

    fn log_for(&self, tg: TransactionGroup, now: Instant) -> Arc<GroupLog> {
        // A follower's first sight of a transaction is a 2A; it needs both
        // the log and the state machine replica.
        self.transactions.get_or_create(tg, || Transaction::new(tg));
        let config = self.config();
        let us = self.comm();
        self.logs.get_or_create(tg, || {
            let members = config
                .group(tg.group())
                .map(|g| g.members.iter().map(|m| CommId(m.0)).collect())
                .unwrap_or_else(|| vec![us]);
            GroupLog::new(tg, us, members, now)
        })
    }

    /// Applies committed slots in order, executing the resulting actions
    /// only on the leader; followers just replicate state. The log's apply
    /// gate serializes whole passes, so concurrent handler threads cannot
    /// interleave applications out of slot order. Actions that propose new
    /// slots commit back into the same pass rather than recursing.
    fn drain_committed(&self, tg: TransactionGroup, now: Instant, out: &mut Outbox) -> CResult<()> {
        let log = self.log_for(tg, now);
        let tx = match self.transactions.get(&tg) {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let _gate = log.begin_apply();
        while let Some((slot, bytes)) = log.next_committed() {
            self.journal.record(tg, slot, &bytes)?;
            let entry = LogEntry::decode(&bytes)?;
            let actions = tx.applied(slot, &entry);
            if log.is_leader() {
                self.run_actions(tg, actions, now, out)?;
            }
            if tx.finished() {
                log.retire();
            }
        }
        Ok(())
    }

    /// Feeds one journaled slot back in at startup. Committed slots apply
    /// in order as they arrive; on a leader, the replayed transactions are
    /// then re-driven with resume().
    pub fn restore(&self, tg: TransactionGroup, slot: u64, entry: Vec<u8>, now: Instant) -> CResult<()> {
        let log = self.log_for(tg, now);
        log.handle_learn(slot, entry);
        // Replay must not re-journal or act; actions come from a later
        // assume_leadership() or resume pass.
        let tx = match self.transactions.get(&tg) {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let _gate = log.begin_apply();
        while let Some((slot, bytes)) = log.next_committed() {
            let entry = LogEntry::decode(&bytes)?;
            tx.applied(slot, &entry);
        }
        Ok(())
    }

    /// Re-drives every restored transaction after a journal replay.
    pub fn resume_all(&self, now: Instant, out: &mut Outbox) -> CResult<()> {
        let mut pending = Vec::new();
        self.transactions.for_each(|tg, _| pending.push(*tg));
        for tg in pending {
            let log = self.log_for(tg, now);
            if !log.is_leader() {
                continue;
            }
            if let Some(tx) = self.transactions.get(&tg) {
                let actions = tx.resume();
                self.run_actions(tg, actions, now, out)?;
                self.drain_committed(tg, now, out)?;
            }
        }
        Ok(())
    }

    fn run_actions(
        &self,
        tg: TransactionGroup,
        actions: Vec<TxAction>,
        now: Instant,
        out: &mut Outbox,
    ) -> CResult<()> {
        for action in actions {
            match action {
                TxAction::Propose { slot, entry } => {
                    // No recursive drain here: the caller flushes newly
                    // committed slots once the current pass finishes.
                    let log = self.log_for(tg, now);
                    log.propose(slot, entry.encode()?, out);
                }
                TxAction::KvsRead { seqno, table, key, timestamp_le } => {
                    let request = |state_key| Message::KvsRepRd {
                        state_key,
                        table: table.clone(),
                        key: key.clone(),
                        timestamp: timestamp_le,
                    };
                    self.issue_kvs_op(tg, Continuation::OnReadDone { seqno }, request, now, out);
                }
                TxAction::KvsWrite { table, key, value, timestamp } => {
                    let request = |state_key| Message::KvsRepWr {
                        state_key,
                        table: table.clone(),
                        key: key.clone(),
                        timestamp,
                        value: value.clone(),
                    };
                    let continuation =
                        Continuation::OnWriteDone { table: table.clone(), key: key.clone() };
                    self.issue_kvs_op(tg, continuation, request, now, out);
                }
                TxAction::KvsLock { table, key } => {
                    let request = |state_key| Message::KvsLockOp {
                        state_key,
                        table: table.clone(),
                        key: key.clone(),
                        tg,
                        priority: tg.priority(),
                        op: LockOp::Lock,
                    };
                    let continuation =
                        Continuation::OnLockDone { table: table.clone(), key: key.clone() };
                    self.issue_kvs_op(tg, continuation, request, now, out);
                }
                TxAction::KvsUnlock { table, key } => {
                    let request = |state_key| Message::KvsLockOp {
                        state_key,
                        table: table.clone(),
                        key: key.clone(),
                        tg,
                        priority: tg.priority(),
                        op: LockOp::Unlock,
                    };
                    let continuation =
                        Continuation::OnUnlockDone { table: table.clone(), key: key.clone() };
                    self.issue_kvs_op(tg, continuation, request, now, out);
                }
                TxAction::Respond { client, nonce, rc, timestamp, value } => {
                    out.push(Envelope::new(
                        client,
                        Message::ClientResponse { nonce, rc, timestamp, value },
                    ));
                }
            }
        }
        Ok(())
    }

    fn issue_kvs_op(
        &self,
        tg: TransactionGroup,
        continuation: Continuation,
        request: impl Fn(u64) -> Message,
        now: Instant,
        out: &mut Outbox,
    ) {
        let config = self.config();
        let state_key = self.generate_id();
        let targets: Vec<CommId> =
            config.kvss.iter().filter(|k| k.dc == self.dc).map(|k| CommId(k.id.0)).collect();
        if targets.is_empty() {
            log::error!("txman {}: no kvs available in {}", self.us, self.dc);
            return;
        }
        // Spread coordinators across instances; retries walk the ring.
        let target = config
            .choose_kvs(self.dc, state_key)
            .and_then(|kvs| targets.iter().position(|c| c.0 == kvs.0))
            .unwrap_or(0);
        let msg = request(state_key);
        let op = self.kvs_ops.get_or_create(state_key, || KvsOp {
            tg,
            continuation,
            targets,
            request: msg.clone(),
            state: Mutex::new(KvsOpState { target, last_send: now, done: false }),
        });
        out.push(Envelope::new(op.targets[target], msg));
    }

    /// This member assumes leadership of a transaction's group, re-proposes
    /// the log, and once the replayed slots commit, re-drives the machine.
    pub fn assume_leadership(
        &self,
        tg: TransactionGroup,
        now: Instant,
        out: &mut Outbox,
    ) -> CResult<()> {
        let log = self.log_for(tg, now);
        log.take_over(out);
        self.drain_committed(tg, now, out)?;
        if let Some(tx) = self.transactions.get(&tg) {
            let actions = tx.resume();
            self.run_actions(tg, actions, now, out)?;
            self.drain_committed(tg, now, out)?;
        }
        Ok(())
    }

    /// Periodic work: resend unanswered kvs operations and uncommitted
    /// slots, then sweep finished state.
    pub fn pump(&self, now: Instant, out: &mut Outbox) {
        self.kvs_ops.for_each(|_, op| {
            let mut state = op.state.lock().expect("kvs op poisoned");
            if state.done || now.duration_since(state.last_send) < RESEND_INTERVAL {
                return;
            }
            state.last_send = now;
            state.target = (state.target + 1) % op.targets.len();
            out.push(Envelope::new(op.targets[state.target], op.request.clone()));
        });
        self.logs.for_each(|_, log| log.pump(now, out));
        self.kvs_ops.collect_garbage();
        self.logs.collect_garbage();
        self.transactions.collect_garbage();
    }

    /// A human-readable dump of the daemon's state, logged on demand.
    pub fn debug_dump(&self) {
        log::info!("txman {} configuration:\n{}", self.us, self.config());
        log::info!(
            "txman {}: {} transactions, {} group logs, {} kvs ops",
            self.us,
            self.transactions.len(),
            self.logs.len(),
            self.kvs_ops.len()
        );
    }
}
