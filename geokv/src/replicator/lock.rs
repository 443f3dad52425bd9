//! The replicated lock coordinator. Broadcasts a lock or unlock to every
//! replica of the partition; each replica's lock manager answers granted,
//! queued, or wound. A lock succeeds once a strict majority has granted it
//! to the caller. A wound answer names a younger holder that must abort:
//! the coordinator reports the victim so the daemon can route a wound to the
//! victim's transaction-manager group, and keeps waiting -- the grant
//! arrives after the victim releases. A lock undecided past the deadline is
//! reported TIMEOUT and the transaction manager aborts.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Instant;

use crate::ids::{CommId, TransactionGroup};
use crate::replicator::{majority, REPLICATE_DEADLINE, RESEND_INTERVAL};
use crate::state_table::Finished;
use crate::wire::{Envelope, LockOp, Message, Outbox, RawLockOutcome, ReturnCode};

struct Inner {
    client: CommId,
    client_state_key: u64,
    table: Vec<u8>,
    key: Vec<u8>,
    tg: TransactionGroup,
    priority: u64,
    op: LockOp,
    replicas: Vec<CommId>,
    granted: HashSet<CommId>,
    wound_routed: bool,
    started: Instant,
    last_send: Instant,
    done: bool,
}

pub struct LockReplicator {
    state_key: u64,
    inner: Mutex<Inner>,
}

impl LockReplicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_key: u64,
        client: CommId,
        client_state_key: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        tg: TransactionGroup,
        priority: u64,
        op: LockOp,
        replicas: Vec<CommId>,
        now: Instant,
    ) -> Self {
        LockReplicator {
            state_key,
            inner: Mutex::new(Inner {
                client,
                client_state_key,
                table,
                key,
                tg,
                priority,
                op,
                replicas,
                granted: HashSet::new(),
                wound_routed: false,
                started: now,
                last_send: now,
                done: false,
            }),
        }
    }

    pub fn state_key(&self) -> u64 {
        self.state_key
    }

    pub fn begin(&self, out: &mut Outbox) {
        let inner = self.inner.lock().expect("lock replicator poisoned");
        for replica in &inner.replicas {
            out.push(Envelope::new(*replica, self.raw_lock(&inner)));
        }
    }

    fn raw_lock(&self, inner: &Inner) -> Message {
        Message::KvsRawLk {
            state_key: self.state_key,
            op: inner.op,
            table: inner.table.clone(),
            key: inner.key.clone(),
            tg: inner.tg,
            priority: inner.priority,
        }
    }

    /// Records one replica's answer. Returns the victim to wound, at most
    /// once per replicated lock; the daemon routes it to the victim's group.
    pub fn response(
        &self,
        from: CommId,
        outcome: RawLockOutcome,
        victim: TransactionGroup,
        out: &mut Outbox,
    ) -> Option<TransactionGroup> {
        let mut inner = self.inner.lock().expect("lock replicator poisoned");
        if inner.done || !inner.replicas.contains(&from) {
            return None;
        }

        let mut wound = None;
        match outcome {
            RawLockOutcome::Granted => {
                inner.granted.insert(from);
                if inner.granted.len() >= majority(inner.replicas.len()) {
                    inner.done = true;
                    out.push(Envelope::new(
                        inner.client,
                        Message::KvsLockOpResp {
                            state_key: inner.client_state_key,
                            rc: ReturnCode::Success,
                        },
                    ));
                }
            }
            RawLockOutcome::Queued => {
                // Nothing to do; the grant arrives when the holder releases.
            }
            RawLockOutcome::Wound => {
                if !inner.wound_routed && !victim.is_nil() {
                    inner.wound_routed = true;
                    wound = Some(victim);
                }
            }
        }
        wound
    }

    /// Resends the raw op to replicas that have not granted, and reports
    /// TIMEOUT once the deadline passes.
    pub fn pump(&self, now: Instant, out: &mut Outbox) {
        let mut inner = self.inner.lock().expect("lock replicator poisoned");
        if inner.done {
            return;
        }
        if now.duration_since(inner.started) >= REPLICATE_DEADLINE {
            inner.done = true;
            out.push(Envelope::new(
                inner.client,
                Message::KvsLockOpResp {
                    state_key: inner.client_state_key,
                    rc: ReturnCode::Timeout,
                },
            ));
            return;
        }
        if now.duration_since(inner.last_send) < RESEND_INTERVAL {
            return;
        }
        inner.last_send = now;
        let silent: Vec<CommId> =
            inner.replicas.iter().filter(|r| !inner.granted.contains(r)).copied().collect();
        for replica in silent {
            out.push(Envelope::new(replica, self.raw_lock(&inner)));
        }
    }
}

impl Finished for LockReplicator {
    fn finished(&self) -> bool {
        self.inner.lock().map(|inner| inner.done).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{PaxosGroupId, TransactionId};

    fn tg(number: u64, start_ts: u64) -> TransactionGroup {
        TransactionGroup::new(TransactionId::new(PaxosGroupId(1), number, start_ts))
    }

    fn replicator(op: LockOp, now: Instant) -> LockReplicator {
        LockReplicator::new(
            9,
            CommId(1),
            99,
            b"t".to_vec(),
            b"k".to_vec(),
            tg(1, 100),
            100,
            op,
            vec![CommId(21), CommId(22), CommId(23)],
            now,
        )
    }

    fn reply(out: &Outbox) -> Option<&Message> {
        out.iter().find(|e| e.to == CommId(1)).map(|e| &e.msg)
    }

    #[test]
    fn majority_of_grants_succeeds() {
        let r = replicator(LockOp::Lock, Instant::now());
        let mut out = Outbox::new();
        r.begin(&mut out);
        assert_eq!(out.len(), 3);
        out.clear();

        assert!(r
            .response(CommId(21), RawLockOutcome::Granted, TransactionGroup::nil(), &mut out)
            .is_none());
        assert!(reply(&out).is_none());
        r.response(CommId(22), RawLockOutcome::Granted, TransactionGroup::nil(), &mut out);
        assert_eq!(
            reply(&out),
            Some(&Message::KvsLockOpResp { state_key: 99, rc: ReturnCode::Success })
        );
        assert!(r.finished());
    }

    #[test]
    fn queued_answers_keep_waiting() {
        let r = replicator(LockOp::Lock, Instant::now());
        let mut out = Outbox::new();
        r.response(CommId(21), RawLockOutcome::Queued, TransactionGroup::nil(), &mut out);
        r.response(CommId(22), RawLockOutcome::Queued, TransactionGroup::nil(), &mut out);
        r.response(CommId(23), RawLockOutcome::Queued, TransactionGroup::nil(), &mut out);
        assert!(out.is_empty());
        assert!(!r.finished());
    }

    #[test]
    fn wound_is_routed_exactly_once() {
        let r = replicator(LockOp::Lock, Instant::now());
        let mut out = Outbox::new();
        let victim = tg(2, 200);
        assert_eq!(
            r.response(CommId(21), RawLockOutcome::Wound, victim, &mut out),
            Some(victim)
        );
        // The other replicas report the same wound; it is not routed again.
        assert_eq!(r.response(CommId(22), RawLockOutcome::Wound, victim, &mut out), None);
        assert!(!r.finished());

        // The grants arrive after the victim aborts and releases.
        r.response(CommId(21), RawLockOutcome::Granted, TransactionGroup::nil(), &mut out);
        r.response(CommId(22), RawLockOutcome::Granted, TransactionGroup::nil(), &mut out);
        assert_eq!(
            reply(&out),
            Some(&Message::KvsLockOpResp { state_key: 99, rc: ReturnCode::Success })
        );
    }

    #[test]
    fn unlock_completes_on_majority_of_acks() {
        let r = replicator(LockOp::Unlock, Instant::now());
        let mut out = Outbox::new();
        r.response(CommId(22), RawLockOutcome::Granted, TransactionGroup::nil(), &mut out);
        r.response(CommId(23), RawLockOutcome::Granted, TransactionGroup::nil(), &mut out);
        assert_eq!(
            reply(&out),
            Some(&Message::KvsLockOpResp { state_key: 99, rc: ReturnCode::Success })
        );
    }

    #[test]
    fn pump_resends_until_granted() {
        let start = Instant::now();
        let r = replicator(LockOp::Lock, start);
        let mut out = Outbox::new();
        r.response(CommId(21), RawLockOutcome::Granted, TransactionGroup::nil(), &mut out);

        let mut resent = Outbox::new();
        r.pump(start + RESEND_INTERVAL, &mut resent);
        let targets: Vec<CommId> = resent.iter().map(|e| e.to).collect();
        assert_eq!(targets, vec![CommId(22), CommId(23)]);
    }

    #[test]
    fn deadline_reports_timeout() {
        let start = Instant::now();
        let r = replicator(LockOp::Lock, start);
        let mut out = Outbox::new();
        r.pump(start + REPLICATE_DEADLINE, &mut out);
        assert_eq!(
            reply(&out),
            Some(&Message::KvsLockOpResp { state_key: 99, rc: ReturnCode::Timeout })
        );
        assert!(r.finished());
    }
}
