//! Slot replication inside a transaction's paxos group. The group's leader
//! assigns slots and replicates them with ballot-stamped 2A rounds; members
//! accept and answer 2B; a strict majority of accepts commits the slot, and
//! learners catch up via LEARN. Committed slots apply in slot order, and a
//! committed slot never changes: the first commit at a member is final.
//!
//! A surviving member takes over by raising the ballot and re-proposing
//! everything it has accepted; the contract exposed upward is
//! propose(slot, payload) -> eventually committed(slot, payload'), where
//! payload' may differ from payload if leadership changed in between.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use crate::ids::{Ballot, CommId, TransactionGroup};
use crate::replicator::RESEND_INTERVAL;
use crate::state_table::Finished;
use crate::wire::{Envelope, Message, Outbox};

struct SlotState {
    entry: Vec<u8>,
    ballot: Ballot,
    acks: HashSet<CommId>,
    committed: bool,
    applied: bool,
}

struct Inner {
    us: CommId,
    members: Vec<CommId>,
    ballot: Ballot,
    slots: BTreeMap<u64, SlotState>,
    next_apply: u64,
    last_send: Instant,
    retired: bool,
}

pub struct GroupLog {
    group: TransactionGroup,
    inner: Mutex<Inner>,
    /// Serializes whole apply passes: next_committed() hands out one slot at
    /// a time, and concurrent drains could otherwise interleave their
    /// applications out of slot order.
    apply_gate: Mutex<()>,
}

impl GroupLog {
    /// The initial ballot belongs to the group's first member; it stays the
    /// leader until someone takes over with a higher ballot.
    pub fn new(group: TransactionGroup, us: CommId, members: Vec<CommId>, now: Instant) -> Self {
        let leader = members.first().copied().unwrap_or(us);
        GroupLog {
            group,
            inner: Mutex::new(Inner {
                us,
                members,
                ballot: Ballot::new(1, leader),
                slots: BTreeMap::new(),
                next_apply: 0,
                last_send: now,
                retired: false,
            }),
            apply_gate: Mutex::new(()),
        }
    }

    /// Takes the apply gate for the duration of a drain pass.
    pub fn begin_apply(&self) -> std::sync::MutexGuard<'_, ()> {
        self.apply_gate.lock().expect("group log poisoned")
    }

    pub fn group(&self) -> TransactionGroup {
        self.group
    }

    pub fn is_leader(&self) -> bool {
        let inner = self.inner.lock().expect("group log poisoned");
        inner.ballot.leader == inner.us
    }

    fn quorum(members: usize) -> usize {
        members / 2 + 1
    }

    /// Proposes an entry at a slot. Leader only; followers route client
    /// traffic to the leader instead.
    pub fn propose(&self, slot: u64, entry: Vec<u8>, out: &mut Outbox) {
        let mut inner = self.inner.lock().expect("group log poisoned");
        if inner.ballot.leader != inner.us {
            log::warn!("{}: propose on non-leader for slot {}", self.group, slot);
            return;
        }
        let ballot = inner.ballot;
        let us = inner.us;
        let slot_state = inner.slots.entry(slot).or_insert(SlotState {
            entry,
            ballot,
            acks: HashSet::new(),
            committed: false,
            applied: false,
        });
        slot_state.acks.insert(us);
        Self::maybe_commit(&mut inner, slot, out, self.group);

        let msg = self.two_a(&inner, slot);
        for member in inner.members.iter().filter(|m| **m != inner.us) {
            out.push(Envelope::new(*member, msg.clone()));
        }
    }

    fn two_a(&self, inner: &Inner, slot: u64) -> Message {
        Message::Paxos2A {
            group: self.group,
            ballot: inner.ballot,
            slot,
            entry: inner.slots[&slot].entry.clone(),
        }
    }

    /// A member accepts a leader's proposal unless it has seen a higher
    /// ballot, and never re-accepts into a committed slot.
    pub fn handle_2a(
        &self,
        from: CommId,
        ballot: Ballot,
        slot: u64,
        entry: Vec<u8>,
        out: &mut Outbox,
    ) {
        let mut inner = self.inner.lock().expect("group log poisoned");
        if ballot < inner.ballot {
            return;
        }
        inner.ballot = ballot;
        match inner.slots.entry(slot) {
            std::collections::btree_map::Entry::Occupied(mut o) => {
                let state = o.get_mut();
                // Committed is final; still ack so the new leader advances.
                if !state.committed {
                    state.entry = entry;
                    state.ballot = ballot;
                }
            }
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(SlotState {
                    entry,
                    ballot,
                    acks: HashSet::new(),
                    committed: false,
                    applied: false,
                });
            }
        }
        out.push(Envelope::new(
            from,
            Message::Paxos2B { group: self.group, ballot, slot },
        ));
    }

    /// The leader counts accepts; a strict majority commits the slot and
    /// learners are told.
    pub fn handle_2b(&self, from: CommId, ballot: Ballot, slot: u64, out: &mut Outbox) {
        let mut inner = self.inner.lock().expect("group log poisoned");
        if ballot != inner.ballot || inner.ballot.leader != inner.us {
            return;
        }
        if let Some(state) = inner.slots.get_mut(&slot) {
            state.acks.insert(from);
        }
        Self::maybe_commit(&mut inner, slot, out, self.group);
    }

    fn maybe_commit(inner: &mut Inner, slot: u64, out: &mut Outbox, group: TransactionGroup) {
        let quorum = Self::quorum(inner.members.len());
        let us = inner.us;
        let members = inner.members.clone();
        if let Some(state) = inner.slots.get_mut(&slot) {
            if !state.committed && state.acks.len() >= quorum {
                state.committed = true;
                let learn = Message::PaxosLearn { group, slot, entry: state.entry.clone() };
                for member in members.iter().filter(|m| **m != us) {
                    out.push(Envelope::new(*member, learn.clone()));
                }
            }
        }
    }

    /// A member learns a committed slot.
    pub fn handle_learn(&self, slot: u64, entry: Vec<u8>) {
        let mut inner = self.inner.lock().expect("group log poisoned");
        let ballot = inner.ballot;
        match inner.slots.entry(slot) {
            std::collections::btree_map::Entry::Occupied(mut o) => {
                let state = o.get_mut();
                if !state.committed {
                    state.entry = entry;
                    state.committed = true;
                }
            }
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(SlotState {
                    entry,
                    ballot,
                    acks: HashSet::new(),
                    committed: true,
                    applied: false,
                });
            }
        }
    }

    /// Drains the next committed-but-unapplied slot, in slot order. The
    /// caller feeds it to the transaction state machine.
    pub fn next_committed(&self) -> Option<(u64, Vec<u8>)> {
        let mut inner = self.inner.lock().expect("group log poisoned");
        let slot = inner.next_apply;
        match inner.slots.get_mut(&slot) {
            Some(state) if state.committed && !state.applied => {
                state.applied = true;
                let entry = state.entry.clone();
                inner.next_apply += 1;
                Some((slot, entry))
            }
            _ => None,
        }
    }

    /// Takes over leadership: raise the ballot and re-propose every slot we
    /// know about, committed ones included (committed entries win at every
    /// member, so re-proposal converges rather than diverges).
    pub fn take_over(&self, out: &mut Outbox) {
        let mut inner = self.inner.lock().expect("group log poisoned");
        inner.ballot = Ballot::new(inner.ballot.number + 1, inner.us);
        let us = inner.us;
        let ballot = inner.ballot;
        for state in inner.slots.values_mut() {
            state.ballot = ballot;
            state.acks = HashSet::new();
            state.acks.insert(us);
        }
        for slot in inner.slots.keys().copied().collect::<Vec<u64>>() {
            let msg = self.two_a(&inner, slot);
            for member in inner.members.iter().filter(|m| **m != inner.us) {
                out.push(Envelope::new(*member, msg.clone()));
            }
        }
    }

    /// Resends 2A for uncommitted slots; leader only.
    pub fn pump(&self, now: Instant, out: &mut Outbox) {
        let mut inner = self.inner.lock().expect("group log poisoned");
        if inner.ballot.leader != inner.us {
            return;
        }
        if now.duration_since(inner.last_send) < RESEND_INTERVAL {
            return;
        }
        inner.last_send = now;
        let pending: Vec<u64> = inner
            .slots
            .iter()
            .filter(|(_, s)| !s.committed)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in pending {
            let msg = self.two_a(&inner, slot);
            for member in inner.members.iter().filter(|m| **m != inner.us) {
                out.push(Envelope::new(*member, msg.clone()));
            }
        }
    }

    /// Marks the log collectable once its transaction is done with it.
    pub fn retire(&self) {
        self.inner.lock().expect("group log poisoned").retired = true;
    }
}

impl Finished for GroupLog {
    fn finished(&self) -> bool {
        self.inner.lock().map(|inner| inner.retired).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{PaxosGroupId, TransactionId};

    fn group() -> TransactionGroup {
        TransactionGroup::new(TransactionId::new(PaxosGroupId(1), 4, 1000))
    }

    fn members() -> Vec<CommId> {
        vec![CommId(11), CommId(12), CommId(13)]
    }

    #[test]
    fn single_member_groups_commit_immediately() {
        let log = GroupLog::new(group(), CommId(11), vec![CommId(11)], Instant::now());
        let mut out = Outbox::new();
        log.propose(0, b"a".to_vec(), &mut out);
        assert!(out.is_empty());
        assert_eq!(log.next_committed(), Some((0, b"a".to_vec())));
        assert_eq!(log.next_committed(), None);
    }

    #[test]
    fn leader_commits_on_majority_and_tells_learners() {
        let leader = GroupLog::new(group(), CommId(11), members(), Instant::now());
        assert!(leader.is_leader());
        let mut out = Outbox::new();
        leader.propose(0, b"a".to_vec(), &mut out);

        // 2A went to both followers; nothing committed yet.
        assert_eq!(out.len(), 2);
        assert_eq!(leader.next_committed(), None);

        let ballot = Ballot::new(1, CommId(11));
        out.clear();
        leader.handle_2b(CommId(12), ballot, 0, &mut out);

        // Leader + one follower is a majority of three.
        assert_eq!(leader.next_committed(), Some((0, b"a".to_vec())));
        let learns = out
            .iter()
            .filter(|e| matches!(e.msg, Message::PaxosLearn { slot: 0, .. }))
            .count();
        assert_eq!(learns, 2);
    }

    #[test]
    fn followers_accept_ack_and_learn() {
        let follower = GroupLog::new(group(), CommId(12), members(), Instant::now());
        assert!(!follower.is_leader());
        let mut out = Outbox::new();

        let ballot = Ballot::new(1, CommId(11));
        follower.handle_2a(CommId(11), ballot, 0, b"a".to_vec(), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, CommId(11));
        assert!(matches!(out[0].msg, Message::Paxos2B { slot: 0, .. }));

        // Accepted is not committed; learning is.
        assert_eq!(follower.next_committed(), None);
        follower.handle_learn(0, b"a".to_vec());
        assert_eq!(follower.next_committed(), Some((0, b"a".to_vec())));
    }

    #[test]
    fn slots_apply_strictly_in_order() {
        let log = GroupLog::new(group(), CommId(11), vec![CommId(11)], Instant::now());
        let mut out = Outbox::new();
        log.propose(1, b"b".to_vec(), &mut out);
        // Slot 1 is committed but slot 0 is not; nothing applies.
        assert_eq!(log.next_committed(), None);
        log.propose(0, b"a".to_vec(), &mut out);
        assert_eq!(log.next_committed(), Some((0, b"a".to_vec())));
        assert_eq!(log.next_committed(), Some((1, b"b".to_vec())));
    }

    #[test]
    fn stale_ballots_are_ignored() {
        let follower = GroupLog::new(group(), CommId(12), members(), Instant::now());
        let mut out = Outbox::new();
        follower.handle_2a(CommId(13), Ballot::new(5, CommId(13)), 0, b"new".to_vec(), &mut out);
        out.clear();
        // The old leader's ballot 1 no longer lands.
        follower.handle_2a(CommId(11), Ballot::new(1, CommId(11)), 0, b"old".to_vec(), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn committed_slots_never_change() {
        let follower = GroupLog::new(group(), CommId(12), members(), Instant::now());
        follower.handle_learn(0, b"committed".to_vec());
        let mut out = Outbox::new();
        follower.handle_2a(CommId(13), Ballot::new(9, CommId(13)), 0, b"other".to_vec(), &mut out);
        // Still acked, so the new leader advances, but the entry is final.
        assert_eq!(out.len(), 1);
        assert_eq!(follower.next_committed(), Some((0, b"committed".to_vec())));
        follower.handle_learn(0, b"other".to_vec());
        let inner = follower.inner.lock().unwrap();
        assert_eq!(inner.slots[&0].entry, b"committed".to_vec());
    }

    #[test]
    fn take_over_re_proposes_the_whole_log_at_a_higher_ballot() {
        // Member 12 saw slot 0 accepted before the leader died.
        let survivor = GroupLog::new(group(), CommId(12), members(), Instant::now());
        let mut out = Outbox::new();
        survivor.handle_2a(CommId(11), Ballot::new(1, CommId(11)), 0, b"a".to_vec(), &mut out);
        out.clear();

        survivor.take_over(&mut out);
        assert!(survivor.is_leader());
        let two_as: Vec<&Message> = out
            .iter()
            .filter(|e| matches!(e.msg, Message::Paxos2A { .. }))
            .map(|e| &e.msg)
            .collect();
        assert_eq!(two_as.len(), 2); // slot 0 to the two other members
        for msg in two_as {
            match msg {
                Message::Paxos2A { ballot, slot, entry, .. } => {
                    assert_eq!(*ballot, Ballot::new(2, CommId(12)));
                    assert_eq!(*slot, 0);
                    assert_eq!(entry, b"a");
                }
                _ => unreachable!(),
            }
        }

        // The remaining member accepts and the slot commits under the new
        // leader: no split outcome.
        out.clear();
        survivor.handle_2b(CommId(13), Ballot::new(2, CommId(12)), 0, &mut out);
        assert_eq!(survivor.next_committed(), Some((0, b"a".to_vec())));
    }

    #[test]
    fn pump_resends_uncommitted_slots() {
        let start = Instant::now();
        let leader = GroupLog::new(group(), CommId(11), members(), start);
        let mut out = Outbox::new();
        leader.propose(0, b"a".to_vec(), &mut out);
        out.clear();

        leader.pump(start + RESEND_INTERVAL, &mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| matches!(e.msg, Message::Paxos2A { slot: 0, .. })));
    }
}
