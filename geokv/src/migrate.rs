//! Streaming partition handoff. When a configuration epoch reassigns a
//! partition, the losing replica snapshots the partition's records (lock
//! records first, then versions, in store order) and streams them to the
//! gaining replica in numbered batches. The receiver applies each batch
//! idempotently and acknowledges it; the migration finishes when every
//! batch is acknowledged.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Instant;

use crate::ids::{CommId, PartitionId};
use crate::replicator::RESEND_INTERVAL;
use crate::state_table::Finished;
use crate::wire::{Envelope, Message, Outbox};

/// Records per MIGRATE_SYN frame.
pub const MIGRATE_BATCH: usize = 32;

struct Inner {
    target: CommId,
    batches: Vec<Vec<(Vec<u8>, Vec<u8>)>>,
    acked: HashSet<u64>,
    last_send: Instant,
}

pub struct Migrator {
    partition: PartitionId,
    inner: Mutex<Inner>,
}

impl Migrator {
    /// Chunks a partition snapshot into batches bound for the new replica.
    /// An empty partition still sends one empty batch, so the receiver
    /// learns the migration is complete.
    pub fn new(
        partition: PartitionId,
        target: CommId,
        records: Vec<(Vec<u8>, Vec<u8>)>,
        now: Instant,
    ) -> Self {
        let mut batches: Vec<Vec<(Vec<u8>, Vec<u8>)>> =
            records.chunks(MIGRATE_BATCH).map(|c| c.to_vec()).collect();
        if batches.is_empty() {
            batches.push(Vec::new());
        }
        Migrator {
            partition,
            inner: Mutex::new(Inner {
                target,
                batches,
                acked: HashSet::new(),
                last_send: now,
            }),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    fn syn(&self, inner: &Inner, seqno: usize) -> Message {
        Message::MigrateSyn {
            partition: self.partition,
            seqno: seqno as u64,
            records: inner.batches[seqno].clone(),
            done: seqno + 1 == inner.batches.len(),
        }
    }

    /// Sends every batch. Applies are idempotent, so over-sending is safe.
    pub fn begin(&self, out: &mut Outbox) {
        let inner = self.inner.lock().expect("migrator poisoned");
        for seqno in 0..inner.batches.len() {
            out.push(Envelope::new(inner.target, self.syn(&inner, seqno)));
        }
    }

    /// Records an acknowledged batch.
    pub fn ack(&self, seqno: u64) {
        let mut inner = self.inner.lock().expect("migrator poisoned");
        if (seqno as usize) < inner.batches.len() {
            inner.acked.insert(seqno);
        }
    }

    /// Resends unacknowledged batches.
    pub fn pump(&self, now: Instant, out: &mut Outbox) {
        let mut inner = self.inner.lock().expect("migrator poisoned");
        if inner.acked.len() == inner.batches.len() {
            return;
        }
        if now.duration_since(inner.last_send) < RESEND_INTERVAL {
            return;
        }
        inner.last_send = now;
        let unacked: Vec<usize> =
            (0..inner.batches.len()).filter(|s| !inner.acked.contains(&(*s as u64))).collect();
        for seqno in unacked {
            out.push(Envelope::new(inner.target, self.syn(&inner, seqno)));
        }
    }
}

impl Finished for Migrator {
    fn finished(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.acked.len() == inner.batches.len())
            .unwrap_or(true)
    }
}
