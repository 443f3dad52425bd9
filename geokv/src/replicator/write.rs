//! The two-phase replicated write coordinator. Begin reserves a pending slot
//! at every replica and returns each replica's accepted timestamp (bumped
//! past its committed maximum for the key); once a majority has reserved,
//! the coordinator fixes the write at the greatest accepted timestamp and
//! finishes it everywhere. A write that cannot reach a majority is cancelled
//! and reported as SERVER_ERROR, which the transaction manager converts into
//! an abort. An empty value is a tombstone.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use crate::ids::CommId;
use crate::replicator::{majority, REPLICATE_DEADLINE, RESEND_INTERVAL};
use crate::state_table::Finished;
use crate::wire::{Envelope, Message, Outbox, ReturnCode, WritePhase};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    Begin,
    Finish,
}

struct Inner {
    client: CommId,
    client_state_key: u64,
    table: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
    proposed: u64,
    replicas: Vec<CommId>,
    phase: Phase,
    accepted: HashMap<CommId, u64>,
    finished: HashSet<CommId>,
    failed: HashSet<CommId>,
    chosen: u64,
    started: Instant,
    last_send: Instant,
    done: bool,
}

pub struct WriteReplicator {
    state_key: u64,
    inner: Mutex<Inner>,
}

impl WriteReplicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_key: u64,
        client: CommId,
        client_state_key: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
        proposed: u64,
        replicas: Vec<CommId>,
        now: Instant,
    ) -> Self {
        WriteReplicator {
            state_key,
            inner: Mutex::new(Inner {
                client,
                client_state_key,
                table,
                key,
                value,
                proposed,
                replicas,
                phase: Phase::Begin,
                accepted: HashMap::new(),
                finished: HashSet::new(),
                failed: HashSet::new(),
                chosen: 0,
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
        let inner = self.inner.lock().expect("write replicator poisoned");
        for replica in &inner.replicas {
            out.push(Envelope::new(*replica, self.raw_write(&inner)));
        }
    }

    fn raw_write(&self, inner: &Inner) -> Message {
        let (phase, timestamp) = match inner.phase {
            Phase::Begin => (WritePhase::Begin, inner.proposed),
            Phase::Finish => (WritePhase::Finish, inner.chosen),
        };
        Message::KvsRawWr {
            state_key: self.state_key,
            phase,
            table: inner.table.clone(),
            key: inner.key.clone(),
            timestamp,
            value: inner.value.clone(),
        }
    }

    /// Records one replica's answer, advancing begin -> finish -> done.
    pub fn response(
        &self,
        from: CommId,
        phase: WritePhase,
        rc: ReturnCode,
        timestamp: u64,
        out: &mut Outbox,
    ) {
        let mut inner = self.inner.lock().expect("write replicator poisoned");
        if inner.done || !inner.replicas.contains(&from) {
            return;
        }
        let quorum = majority(inner.replicas.len());

        if rc != ReturnCode::Success {
            inner.failed.insert(from);
            if inner.replicas.len() - inner.failed.len() < quorum {
                self.fail(&mut inner, out);
            }
            return;
        }

        match (inner.phase, phase) {
            (Phase::Begin, WritePhase::Begin) => {
                inner.accepted.insert(from, timestamp);
                if inner.accepted.len() >= quorum {
                    // Fix the write at the greatest accepted timestamp and
                    // finish it at every replica.
                    inner.chosen =
                        inner.accepted.values().copied().max().unwrap_or(inner.proposed);
                    inner.phase = Phase::Finish;
                    for replica in inner.replicas.clone() {
                        out.push(Envelope::new(replica, self.raw_write(&inner)));
                    }
                }
            }
            (Phase::Finish, WritePhase::Finish) => {
                inner.finished.insert(from);
                if inner.finished.len() >= quorum {
                    inner.done = true;
                    out.push(Envelope::new(
                        inner.client,
                        Message::KvsRepWrResp {
                            state_key: inner.client_state_key,
                            rc: ReturnCode::Success,
                            timestamp: inner.chosen,
                        },
                    ));
                }
            }
            // A begin ack arriving after the phase moved on is stale; a
            // finish ack before begin completes is impossible.
            _ => {}
        }
    }

    fn fail(&self, inner: &mut Inner, out: &mut Outbox) {
        inner.done = true;
        // Release the pending slots; cancels are fire-and-forget.
        for replica in inner.replicas.clone() {
            out.push(Envelope::new(
                replica,
                Message::KvsRawWr {
                    state_key: self.state_key,
                    phase: WritePhase::Cancel,
                    table: inner.table.clone(),
                    key: inner.key.clone(),
                    timestamp: 0,
                    value: Vec::new(),
                },
            ));
        }
        out.push(Envelope::new(
            inner.client,
            Message::KvsRepWrResp {
                state_key: inner.client_state_key,
                rc: ReturnCode::ServerError,
                timestamp: 0,
            },
        ));
    }

    /// Resends the current phase to replicas that have not answered it, and
    /// fails the write once the deadline passes.
    pub fn pump(&self, now: Instant, out: &mut Outbox) {
        let mut inner = self.inner.lock().expect("write replicator poisoned");
        if inner.done {
            return;
        }
        if now.duration_since(inner.started) >= REPLICATE_DEADLINE {
            self.fail(&mut inner, out);
            return;
        }
        if now.duration_since(inner.last_send) < RESEND_INTERVAL {
            return;
        }
        inner.last_send = now;
        let silent: Vec<CommId> = inner
            .replicas
            .iter()
            .filter(|r| match inner.phase {
                Phase::Begin => !inner.accepted.contains_key(r) && !inner.failed.contains(r),
                Phase::Finish => !inner.finished.contains(r) && !inner.failed.contains(r),
            })
            .copied()
            .collect();
        for replica in silent {
            out.push(Envelope::new(replica, self.raw_write(&inner)));
        }
    }
}

impl Finished for WriteReplicator {
    fn finished(&self) -> bool {
        self.inner.lock().map(|inner| inner.done).unwrap_or(true)
    }
}
