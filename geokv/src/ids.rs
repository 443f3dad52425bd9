//! Typed 64-bit identifiers. Every identifier in the system is an opaque
//! integer with equality and ordering; the newtypes keep a cluster id from
//! being handed to a routine expecting a paxos-group id.

use serde_derive::{Deserialize, Serialize};

use crate::encoding::{Packer, Unpacker};
use crate::error::CResult;

macro_rules! id_type {
    ($name:ident, $label:expr) => {
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(&self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }
    };
}

id_type!(ClusterId, "cluster");
id_type!(VersionId, "version");
id_type!(DataCenterId, "data-center");
id_type!(TxmanId, "txman");
id_type!(KvsId, "kvs");
id_type!(PaxosGroupId, "paxos-group");
id_type!(PartitionId, "partition");
id_type!(CommId, "comm");

/// A globally-ordered transaction identifier: the coordinating paxos group,
/// a per-group sequence number, and the start timestamp that doubles as the
/// wound-wait priority (lower = older = higher priority).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransactionId {
    pub group: PaxosGroupId,
    pub number: u64,
    pub start_ts: u64,
}

impl TransactionId {
    pub fn new(group: PaxosGroupId, number: u64, start_ts: u64) -> Self {
        TransactionId { group, number, start_ts }
    }

    pub fn pack(&self, p: &mut Packer) {
        p.u64(self.group.0).u64(self.number).u64(self.start_ts);
    }

    pub fn unpack(u: &mut Unpacker<'_>) -> CResult<Self> {
        Ok(TransactionId {
            group: PaxosGroupId(u.u64()?),
            number: u.u64()?,
            start_ts: u.u64()?,
        })
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txid({}, number={}, start={})", self.group, self.number, self.start_ts)
    }
}

/// The ownership handle for a transaction: the identifier of the transaction
/// as held by its coordinating group. Lock records store one of these, and the
/// transaction table is keyed by it, so locks and transactions refer to each
/// other without owning each other.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransactionGroup {
    pub txid: TransactionId,
}

impl TransactionGroup {
    pub fn new(txid: TransactionId) -> Self {
        TransactionGroup { txid }
    }

    /// The coordinating paxos group.
    pub fn group(&self) -> PaxosGroupId {
        self.txid.group
    }

    /// Wound-wait priority; lower values win conflicts.
    pub fn priority(&self) -> u64 {
        self.txid.start_ts
    }

    /// The null handle, used to mean "no holder".
    pub fn nil() -> Self {
        TransactionGroup::default()
    }

    pub fn is_nil(&self) -> bool {
        *self == TransactionGroup::default()
    }

    pub fn pack(&self, p: &mut Packer) {
        self.txid.pack(p);
    }

    pub fn unpack(u: &mut Unpacker<'_>) -> CResult<Self> {
        Ok(TransactionGroup { txid: TransactionId::unpack(u)? })
    }
}

impl std::fmt::Display for TransactionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "transaction-group({}, number={}, start={})",
            self.txid.group, self.txid.number, self.txid.start_ts
        )
    }
}

/// A ballot for slot replication within a paxos group: a round number and
/// the proposing leader. Ballots order by round, then by leader id, so two
/// would-be leaders never tie.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ballot {
    pub number: u64,
    pub leader: CommId,
}

impl Ballot {
    pub fn new(number: u64, leader: CommId) -> Self {
        Ballot { number, leader }
    }

    pub fn pack(&self, p: &mut Packer) {
        p.u64(self.number).u64(self.leader.0);
    }

    pub fn unpack(u: &mut Unpacker<'_>) -> CResult<Self> {
        Ok(Ballot { number: u.u64()?, leader: CommId(u.u64()?) })
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ballot({}, {})", self.number, self.leader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballot_order_breaks_ties_by_leader() {
        let a = Ballot::new(1, CommId(5));
        let b = Ballot::new(1, CommId(6));
        let c = Ballot::new(2, CommId(1));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn display_forms() {
        assert_eq!(ClusterId(7).to_string(), "cluster(7)");
        assert_eq!(KvsId(3).to_string(), "kvs(3)");
        let tg = TransactionGroup::new(TransactionId::new(PaxosGroupId(2), 9, 100));
        assert_eq!(tg.to_string(), "transaction-group(paxos-group(2), number=9, start=100)");
    }

    #[test]
    fn txid_pack_round_trip() -> crate::error::CResult<()> {
        let id = TransactionId::new(PaxosGroupId(5), 42, 123456789);
        let mut p = Packer::new();
        id.pack(&mut p);
        let buf = p.take();
        assert_eq!(buf.len(), 24);
        let mut u = Unpacker::new(&buf);
        assert_eq!(TransactionId::unpack(&mut u)?, id);
        Ok(())
    }

    #[test]
    fn priority_is_start_timestamp() {
        let older = TransactionGroup::new(TransactionId::new(PaxosGroupId(1), 1, 100));
        let younger = TransactionGroup::new(TransactionId::new(PaxosGroupId(1), 2, 200));
        assert!(older.priority() < younger.priority());
    }

    #[test]
    fn nil_group_is_recognizable() {
        assert!(TransactionGroup::nil().is_nil());
        let tg = TransactionGroup::new(TransactionId::new(PaxosGroupId(0), 0, 1));
        assert!(!tg.is_nil());
    }
}
