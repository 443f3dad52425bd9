//! The quorum read coordinator. Broadcasts a versioned read to every replica
//! of the owning partition and answers the transaction manager once a
//! majority has spoken: the greatest returned timestamp wins, ties prefer
//! the most common value, and a majority of NOT_FOUND answers NOT_FOUND.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::ids::CommId;
use crate::replicator::{majority, REPLICATE_DEADLINE, RESEND_INTERVAL};
use crate::state_table::Finished;
use crate::wire::{Envelope, Message, Outbox, ReturnCode};

#[derive(Clone, Debug, PartialEq)]
enum ReadVote {
    Found { timestamp: u64, value: Vec<u8> },
    NotFound { timestamp: u64 },
    Failed,
}

struct Inner {
    client: CommId,
    client_state_key: u64,
    table: Vec<u8>,
    key: Vec<u8>,
    timestamp_le: u64,
    replicas: Vec<CommId>,
    votes: HashMap<CommId, ReadVote>,
    started: Instant,
    last_send: Instant,
    done: bool,
}

pub struct ReadReplicator {
    state_key: u64,
    inner: Mutex<Inner>,
}

impl ReadReplicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_key: u64,
        client: CommId,
        client_state_key: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp_le: u64,
        replicas: Vec<CommId>,
        now: Instant,
    ) -> Self {
        ReadReplicator {
            state_key,
            inner: Mutex::new(Inner {
                client,
                client_state_key,
                table,
                key,
                timestamp_le,
                replicas,
                votes: HashMap::new(),
                started: now,
                last_send: now,
                done: false,
            }),
        }
    }

    pub fn state_key(&self) -> u64 {
        self.state_key
    }

    /// Broadcasts the raw read to every replica.
    pub fn begin(&self, out: &mut Outbox) {
        let inner = self.inner.lock().expect("read replicator poisoned");
        for replica in &inner.replicas {
            out.push(Envelope::new(*replica, self.raw_read(&inner)));
        }
    }

    fn raw_read(&self, inner: &Inner) -> Message {
        Message::KvsRawRd {
            state_key: self.state_key,
            table: inner.table.clone(),
            key: inner.key.clone(),
            timestamp: inner.timestamp_le,
        }
    }

    /// Records one replica's answer and replies to the transaction manager
    /// if a decision is now possible.
    pub fn response(
        &self,
        from: CommId,
        rc: ReturnCode,
        timestamp: u64,
        value: Vec<u8>,
        out: &mut Outbox,
    ) {
        let mut inner = self.inner.lock().expect("read replicator poisoned");
        if inner.done || !inner.replicas.contains(&from) {
            return;
        }
        let vote = match rc {
            ReturnCode::Success => ReadVote::Found { timestamp, value },
            ReturnCode::NotFound => ReadVote::NotFound { timestamp },
            _ => ReadVote::Failed,
        };
        inner.votes.insert(from, vote);
        self.try_decide(&mut inner, out);
    }

    fn try_decide(&self, inner: &mut Inner, out: &mut Outbox) {
        let quorum = majority(inner.replicas.len());
        let found: Vec<&ReadVote> =
            inner.votes.values().filter(|v| matches!(v, ReadVote::Found { .. })).collect();
        let not_found =
            inner.votes.values().filter(|v| matches!(v, ReadVote::NotFound { .. })).count();
        let failed = inner.votes.values().filter(|v| matches!(v, ReadVote::Failed)).count();

        let (rc, timestamp, value) = if not_found >= quorum {
            let timestamp = inner
                .votes
                .values()
                .filter_map(|v| match v {
                    ReadVote::NotFound { timestamp } => Some(*timestamp),
                    _ => None,
                })
                .max()
                .unwrap_or(0);
            (ReturnCode::NotFound, timestamp, Vec::new())
        } else if inner.votes.len() >= quorum && !found.is_empty() {
            // Replicas may diverge while a write settles: prefer the
            // greatest timestamp, then the most common value at it.
            let newest = found
                .iter()
                .filter_map(|v| match v {
                    ReadVote::Found { timestamp, .. } => Some(*timestamp),
                    _ => None,
                })
                .max()
                .unwrap_or(0);
            let mut counts: HashMap<&[u8], usize> = HashMap::new();
            for vote in &found {
                if let ReadVote::Found { timestamp, value } = vote {
                    if *timestamp == newest {
                        *counts.entry(value.as_slice()).or_default() += 1;
                    }
                }
            }
            let value = counts
                .into_iter()
                .max_by_key(|(_, n)| *n)
                .map(|(v, _)| v.to_vec())
                .unwrap_or_default();
            (ReturnCode::Success, newest, value)
        } else if inner.replicas.len() - failed < quorum {
            // Too many replicas failed outright for any quorum to form.
            (ReturnCode::ServerError, 0, Vec::new())
        } else {
            return; // keep waiting
        };

        inner.done = true;
        out.push(Envelope::new(
            inner.client,
            Message::KvsRepRdResp {
                state_key: inner.client_state_key,
                rc,
                timestamp,
                value,
            },
        ));
    }

    /// Resends the raw read to replicas that have not answered, and fails
    /// the operation once the deadline passes.
    pub fn pump(&self, now: Instant, out: &mut Outbox) {
        let mut inner = self.inner.lock().expect("read replicator poisoned");
        if inner.done {
            return;
        }
        if now.duration_since(inner.started) >= REPLICATE_DEADLINE {
            inner.done = true;
            let resp = Message::KvsRepRdResp {
                state_key: inner.client_state_key,
                rc: ReturnCode::ServerError,
                timestamp: 0,
                value: Vec::new(),
            };
            out.push(Envelope::new(inner.client, resp));
            return;
        }
        if now.duration_since(inner.last_send) < RESEND_INTERVAL {
            return;
        }
        inner.last_send = now;
        let silent: Vec<CommId> = inner
            .replicas
            .iter()
            .filter(|r| !inner.votes.contains_key(r))
            .copied()
            .collect();
        for replica in silent {
            out.push(Envelope::new(replica, self.raw_read(&inner)));
        }
    }
}

impl Finished for ReadReplicator {
    fn finished(&self) -> bool {
        self.inner.lock().map(|inner| inner.done).unwrap_or(true)
    }
}
