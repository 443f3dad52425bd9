//! The key-value daemon core: the durable data layer, the lock manager, the
//! replicator coordinators, and the raw per-replica handlers, wired together
//! by message-type-keyed dispatch. Any instance in the data center can
//! coordinate a replicated operation; the raw handlers answer for the local
//! replica only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::Configuration;
use crate::datalayer::{Datalayer, Read};
use crate::error::CResult;
use crate::ids::{CommId, DataCenterId, KvsId, PartitionId, TransactionGroup};
use crate::lock_manager::{LockManager, LockOutcome, Waiter};
use crate::migrate::Migrator;
use crate::replicator::lock::LockReplicator;
use crate::replicator::read::ReadReplicator;
use crate::replicator::write::WriteReplicator;
use crate::state_table::StateTable;
use crate::storage::engine::Engine;
use crate::wire::{
    Envelope, LockOp, Message, Outbox, RawLockOutcome, ReturnCode, WritePhase,
};

/// A replica-side slot reserved by a write's begin phase.
struct PendingWrite {
    accepted: u64,
}

pub struct KvsDaemon<E: Engine> {
    us: KvsId,
    dc: DataCenterId,
    config: Mutex<Arc<Configuration>>,
    data: Datalayer<E>,
    locks: LockManager,
    repl_rd: StateTable<u64, ReadReplicator>,
    repl_wr: StateTable<u64, WriteReplicator>,
    repl_lk: StateTable<u64, LockReplicator>,
    migrations: StateTable<u64, Migrator>,
    pending_writes: Mutex<HashMap<u64, PendingWrite>>,
}

impl<E: Engine> KvsDaemon<E> {
    pub fn new(us: KvsId, dc: DataCenterId, config: Arc<Configuration>, engine: E) -> CResult<Self> {
        let data = Datalayer::new(engine);
        let locks = LockManager::new();
        let recovered = locks.recover(&data)?;
        if recovered > 0 {
            log::info!("kvs {}: recovered {} durable locks", us, recovered);
        }
        Ok(KvsDaemon {
            us,
            dc,
            config: Mutex::new(config),
            data,
            locks,
            repl_rd: StateTable::new(),
            repl_wr: StateTable::new(),
            repl_lk: StateTable::new(),
            migrations: StateTable::new(),
            pending_writes: Mutex::new(HashMap::new()),
        })
    }

    pub fn us(&self) -> KvsId {
        self.us
    }

    pub fn data(&self) -> &Datalayer<E> {
        &self.data
    }

    fn config(&self) -> Arc<Configuration> {
        self.config.lock().expect("config poisoned").clone()
    }

    /// Migrations are keyed by (receiving replica, partition): a partition
    /// can stream to more than one gainer at once.
    fn migration_key(target: CommId, partition: PartitionId) -> u64 {
        (target.0 << 16) | partition.0
    }

    fn replicas(&self, table: &[u8], key: &[u8]) -> Vec<CommId> {
        let config = self.config();
        config
            .replicas(self.dc, Configuration::partition(table, key))
            .into_iter()
            .map(|kvs| CommId(kvs.0))
            .collect()
    }

    /// Dispatches one inbound frame.
    pub fn handle(&self, from: CommId, msg: Message, now: Instant, out: &mut Outbox) -> CResult<()> {
        match msg {
            // Coordinator side: a transaction manager asked us to run a
            // replicated operation against the owning partition. The
            // caller's state key keys our table too, so a resent request
            // lands on the existing entry instead of a second broadcast.
            Message::KvsRepRd { state_key, table, key, timestamp } => {
                let replicas = self.replicas(&table, &key);
                let mut created = false;
                let repl = self.repl_rd.get_or_create(state_key, || {
                    created = true;
                    ReadReplicator::new(
                        state_key, from, state_key, table, key, timestamp, replicas, now,
                    )
                });
                if created {
                    repl.begin(out);
                }
                Ok(())
            }
            Message::KvsRepWr { state_key, table, key, timestamp, value } => {
                let replicas = self.replicas(&table, &key);
                let mut created = false;
                let repl = self.repl_wr.get_or_create(state_key, || {
                    created = true;
                    WriteReplicator::new(
                        state_key, from, state_key, table, key, value, timestamp, replicas, now,
                    )
                });
                if created {
                    repl.begin(out);
                }
                Ok(())
            }
            Message::KvsLockOp { state_key, table, key, tg, priority, op } => {
                let replicas = self.replicas(&table, &key);
                let mut created = false;
                let repl = self.repl_lk.get_or_create(state_key, || {
                    created = true;
                    LockReplicator::new(
                        state_key, from, state_key, table, key, tg, priority, op, replicas, now,
                    )
                });
                if created {
                    repl.begin(out);
                }
                Ok(())
            }

            // Replica side: raw operations against the local store.
            Message::KvsRawRd { state_key, table, key, timestamp } => {
                let (rc, timestamp, value) = match self.data.get(&table, &key, timestamp) {
                    Ok(Read::Found { timestamp, value }) => {
                        (ReturnCode::Success, timestamp, value)
                    }
                    Ok(Read::NotFound { timestamp }) => {
                        (ReturnCode::NotFound, timestamp, Vec::new())
                    }
                    Err(err) => {
                        log::error!("kvs {}: raw read failed: {}", self.us, err);
                        (ReturnCode::ServerError, 0, Vec::new())
                    }
                };
                out.push(Envelope::new(
                    from,
                    Message::KvsRawRdResp { state_key, rc, timestamp, value },
                ));
                Ok(())
            }
            Message::KvsRawWr { state_key, phase, table, key, timestamp, value } => {
                self.raw_write(from, state_key, phase, &table, &key, timestamp, value, out)
            }
            Message::KvsRawLk { state_key, op, table, key, tg, priority } => {
                self.raw_lock(from, state_key, op, &table, &key, tg, priority, out)
            }

            // Aggregation: replicas answering our coordinators.
            Message::KvsRawRdResp { state_key, rc, timestamp, value } => {
                if let Some(repl) = self.repl_rd.get(&state_key) {
                    repl.response(from, rc, timestamp, value, out);
                }
                Ok(())
            }
            Message::KvsRawWrResp { state_key, phase, rc, timestamp } => {
                if let Some(repl) = self.repl_wr.get(&state_key) {
                    repl.response(from, phase, rc, timestamp, out);
                }
                Ok(())
            }
            Message::KvsRawLkResp { state_key, outcome, victim } => {
                if let Some(repl) = self.repl_lk.get(&state_key) {
                    if let Some(victim) = repl.response(from, outcome, victim, out) {
                        self.route_wound(victim, out);
                    }
                }
                Ok(())
            }

            // Partition handoff.
            Message::MigrateSyn { partition, seqno, records, done } => {
                for (raw_key, raw_value) in &records {
                    self.data.apply_raw(raw_key, raw_value)?;
                }
                if done {
                    log::info!("kvs {}: {} migration stream complete", self.us, partition);
                }
                out.push(Envelope::new(from, Message::MigrateAck { partition, seqno }));
                Ok(())
            }
            Message::MigrateAck { partition, seqno } => {
                if let Some(migration) = self.migrations.get(&Self::migration_key(from, partition))
                {
                    migration.ack(seqno);
                }
                Ok(())
            }

            other => {
                log::warn!("kvs {} dropping unexpected {:?}", self.us, other.message_type());
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn raw_write(
        &self,
        from: CommId,
        state_key: u64,
        phase: WritePhase,
        table: &[u8],
        key: &[u8],
        timestamp: u64,
        value: Vec<u8>,
        out: &mut Outbox,
    ) -> CResult<()> {
        let (rc, timestamp) = match phase {
            WritePhase::Begin => {
                let mut pending = self.pending_writes.lock()?;
                let accepted = match pending.get(&state_key) {
                    // A resent begin answers the same reservation.
                    Some(p) => p.accepted,
                    None => {
                        let floor = self.data.max_timestamp(table, key)?;
                        let accepted = timestamp.max(floor + 1);
                        pending.insert(state_key, PendingWrite { accepted });
                        accepted
                    }
                };
                (ReturnCode::Success, accepted)
            }
            WritePhase::Finish => {
                // Finish is idempotent: re-applying the same version writes
                // the same record.
                let result = if value.is_empty() {
                    self.data.del(table, key, timestamp)
                } else {
                    self.data.put(table, key, timestamp, &value)
                };
                self.pending_writes.lock()?.remove(&state_key);
                match result {
                    Ok(()) => (ReturnCode::Success, timestamp),
                    Err(err) => {
                        log::error!("kvs {}: raw write failed: {}", self.us, err);
                        (ReturnCode::ServerError, 0)
                    }
                }
            }
            WritePhase::Cancel => {
                self.pending_writes.lock()?.remove(&state_key);
                (ReturnCode::Success, 0)
            }
        };
        out.push(Envelope::new(from, Message::KvsRawWrResp { state_key, phase, rc, timestamp }));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn raw_lock(
        &self,
        from: CommId,
        state_key: u64,
        op: LockOp,
        table: &[u8],
        key: &[u8],
        tg: TransactionGroup,
        priority: u64,
        out: &mut Outbox,
    ) -> CResult<()> {
        match op {
            LockOp::Lock => {
                let waiter = Waiter { tg, priority, coord: from, state_key };
                let (outcome, victim) = match self.locks.lock(&self.data, table, key, waiter)? {
                    LockOutcome::Granted => (RawLockOutcome::Granted, TransactionGroup::nil()),
                    LockOutcome::Queued => (RawLockOutcome::Queued, TransactionGroup::nil()),
                    LockOutcome::Wound { victim } => (RawLockOutcome::Wound, victim),
                };
                out.push(Envelope::new(
                    from,
                    Message::KvsRawLkResp { state_key, outcome, victim },
                ));
            }
            LockOp::Unlock => {
                if let Some(next) = self.locks.unlock(&self.data, table, key, &tg)? {
                    // The handoff grant goes to the waiter's coordinator
                    // under the waiter's own state key.
                    out.push(Envelope::new(
                        next.coord,
                        Message::KvsRawLkResp {
                            state_key: next.state_key,
                            outcome: RawLockOutcome::Granted,
                            victim: TransactionGroup::nil(),
                        },
                    ));
                }
                out.push(Envelope::new(
                    from,
                    Message::KvsRawLkResp {
                        state_key,
                        outcome: RawLockOutcome::Granted,
                        victim: TransactionGroup::nil(),
                    },
                ));
            }
        }
        Ok(())
    }

    /// Routes a wound to every member of the victim's coordinating group;
    /// whichever member hosts the transaction aborts it, the rest discard.
    fn route_wound(&self, victim: TransactionGroup, out: &mut Outbox) {
        let config = self.config();
        match config.group(victim.group()) {
            Some(group) => {
                for member in &group.members {
                    out.push(Envelope::new(CommId(member.0), Message::WoundXact { victim }));
                }
            }
            None => {
                log::error!("kvs {}: cannot route wound for {}: unknown group", self.us, victim)
            }
        }
    }

    /// Installs a new configuration epoch. Partitions this replica stops
    /// owning are streamed to their new owner.
    pub fn reconfigure(
        &self,
        config: Arc<Configuration>,
        now: Instant,
        out: &mut Outbox,
    ) -> CResult<()> {
        let old = self.config();
        if config.version <= old.version {
            return Ok(());
        }
        for p in 0..crate::config::KVS_PARTITIONS {
            let partition = PartitionId(p);
            let old_set = old.replicas(self.dc, partition);
            let new_set = config.replicas(self.dc, partition);
            if !old_set.contains(&self.us) || new_set.contains(&self.us) {
                continue;
            }
            // Stream to the members that gained the partition; if ownership
            // merely rotated, the new head gets the copy.
            let mut gainers: Vec<KvsId> =
                new_set.iter().filter(|k| !old_set.contains(k)).copied().collect();
            if gainers.is_empty() {
                gainers.extend(new_set.first().copied());
            }
            let records = self.data.snapshot(|table, key| {
                Configuration::partition(table, key) == partition
            })?;
            for gainer in gainers {
                let target = CommId(gainer.0);
                log::info!(
                    "kvs {}: migrating {} ({} records) to {}",
                    self.us,
                    partition,
                    records.len(),
                    target
                );
                let migration = self.migrations.get_or_create(
                    Self::migration_key(target, partition),
                    || Migrator::new(partition, target, records.clone(), now),
                );
                migration.begin(out);
            }
        }
        *self.config.lock()? = config;
        Ok(())
    }

    /// Periodic work: resends, deadlines, and state sweeps.
    pub fn pump(&self, now: Instant, out: &mut Outbox) {
        self.repl_rd.for_each(|_, r| r.pump(now, out));
        self.repl_wr.for_each(|_, r| r.pump(now, out));
        self.repl_lk.for_each(|_, r| r.pump(now, out));
        self.migrations.for_each(|_, m| m.pump(now, out));
        self.repl_rd.collect_garbage();
        self.repl_wr.collect_garbage();
        self.repl_lk.collect_garbage();
        self.migrations.collect_garbage();
    }

    /// A human-readable dump of the daemon's state, logged on demand.
    pub fn debug_dump(&self) {
        log::info!("kvs {} configuration:\n{}", self.us, self.config());
        match self.data.status() {
            Ok(status) => log::info!(
                "kvs {}: {} keys, {} bytes live in {}",
                self.us,
                status.keys,
                status.size,
                status.name
            ),
            Err(err) => log::error!("kvs {}: status unavailable: {}", self.us, err),
        }
        log::info!(
            "kvs {}: {} reads, {} writes, {} locks, {} migrations in flight",
            self.us,
            self.repl_rd.len(),
            self.repl_wr.len(),
            self.repl_lk.len(),
            self.migrations.len()
        );
    }
}
