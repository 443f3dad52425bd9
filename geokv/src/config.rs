//! The cluster configuration published by the coordinator, and the routing
//! decisions derived from it. A configuration is immutable once published;
//! epochs rotate only by the coordinator bumping the version id.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_derive::{Deserialize, Serialize};

use crate::encoding::{Packer, Unpacker};
use crate::error::{CResult, Error};
use crate::ids::{
    ClusterId, CommId, DataCenterId, KvsId, PartitionId, PaxosGroupId, TxmanId, VersionId,
};

/// Number of keyspace partitions. Partition ownership, not key hashing,
/// moves when the kvs membership changes.
pub const KVS_PARTITIONS: u64 = 257;

/// Replicas per partition, clamped to the data center's instance count.
pub const KVS_REPLICATION: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataCenter {
    pub id: DataCenterId,
    pub name: String,
}

impl std::fmt::Display for DataCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} \"{}\"", self.id, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxmanState {
    pub id: TxmanId,
    pub dc: DataCenterId,
    pub bind_to: String,
}

impl std::fmt::Display for TxmanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {} in {}", self.id, self.bind_to, self.dc)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaxosGroup {
    pub id: PaxosGroupId,
    pub dc: DataCenterId,
    pub members: Vec<TxmanId>,
}

impl PaxosGroup {
    /// A strict majority of the group.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

impl std::fmt::Display for PaxosGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} in {} [", self.id, self.dc)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", m)?;
        }
        write!(f, "]")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KvsState {
    pub id: KvsId,
    pub dc: DataCenterId,
    pub bind_to: String,
}

impl std::fmt::Display for KvsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {} in {}", self.id, self.bind_to, self.dc)
    }
}

/// One configuration epoch. Transaction managers and key-value stores share
/// a single id space, so an id doubles as the logical endpoint address.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub cluster: ClusterId,
    pub version: VersionId,
    pub flags: u64,
    pub data_centers: Vec<DataCenter>,
    pub txmans: Vec<TxmanState>,
    pub paxos_groups: Vec<PaxosGroup>,
    pub kvss: Vec<KvsState>,
}

impl Configuration {
    /// True when the caller's epoch lags this one; such requests are
    /// rejected with UNAVAILABLE until the caller re-fetches.
    pub fn is_stale(&self, version: VersionId) -> bool {
        version < self.version
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = Packer::with_capacity(256);
        p.u64(self.cluster.0).u64(self.version.0).u64(self.flags);
        p.varint(self.data_centers.len() as u64);
        for dc in &self.data_centers {
            p.u64(dc.id.0).slice(dc.name.as_bytes());
        }
        p.varint(self.txmans.len() as u64);
        for t in &self.txmans {
            p.u64(t.id.0).u64(t.dc.0).slice(t.bind_to.as_bytes());
        }
        p.varint(self.paxos_groups.len() as u64);
        for g in &self.paxos_groups {
            p.u64(g.id.0).u64(g.dc.0).varint(g.members.len() as u64);
            for m in &g.members {
                p.u64(m.0);
            }
        }
        p.varint(self.kvss.len() as u64);
        for k in &self.kvss {
            p.u64(k.id.0).u64(k.dc.0).slice(k.bind_to.as_bytes());
        }
        p.take()
    }

    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        let mut u = Unpacker::new(bytes);
        let cluster = ClusterId(u.u64()?);
        let version = VersionId(u.u64()?);
        let flags = u.u64()?;

        let mut data_centers = Vec::new();
        for _ in 0..u.varint()? {
            data_centers.push(DataCenter {
                id: DataCenterId(u.u64()?),
                name: String::from_utf8(u.slice()?)?,
            });
        }
        let mut txmans = Vec::new();
        for _ in 0..u.varint()? {
            txmans.push(TxmanState {
                id: TxmanId(u.u64()?),
                dc: DataCenterId(u.u64()?),
                bind_to: String::from_utf8(u.slice()?)?,
            });
        }
        let mut paxos_groups = Vec::new();
        for _ in 0..u.varint()? {
            let id = PaxosGroupId(u.u64()?);
            let dc = DataCenterId(u.u64()?);
            let mut members = Vec::new();
            for _ in 0..u.varint()? {
                members.push(TxmanId(u.u64()?));
            }
            paxos_groups.push(PaxosGroup { id, dc, members });
        }
        let mut kvss = Vec::new();
        for _ in 0..u.varint()? {
            kvss.push(KvsState {
                id: KvsId(u.u64()?),
                dc: DataCenterId(u.u64()?),
                bind_to: String::from_utf8(u.slice()?)?,
            });
        }

        Ok(Configuration { cluster, version, flags, data_centers, txmans, paxos_groups, kvss })
    }

    /// The partition owning (table, key). Stable across epochs: it depends
    /// only on the bytes.
    pub fn partition(table: &[u8], key: &[u8]) -> PartitionId {
        let mut hasher = DefaultHasher::new();
        table.hash(&mut hasher);
        key.hash(&mut hasher);
        PartitionId(hasher.finish() % KVS_PARTITIONS)
    }

    /// The replica set of a partition within a data center: consecutive
    /// instances of the id-ordered ring, starting at the partition's slot.
    /// Stable across epochs with the same membership.
    pub fn replicas(&self, dc: DataCenterId, partition: PartitionId) -> Vec<KvsId> {
        let mut ring: Vec<KvsId> =
            self.kvss.iter().filter(|k| k.dc == dc).map(|k| k.id).collect();
        ring.sort();
        if ring.is_empty() {
            return ring;
        }
        let start = (partition.0 % ring.len() as u64) as usize;
        let take = KVS_REPLICATION.min(ring.len());
        (0..take).map(|i| ring[(start + i) % ring.len()]).collect()
    }

    /// The head of the partition's replica set for (table, key).
    pub fn owning_kvs(&self, dc: DataCenterId, table: &[u8], key: &[u8]) -> Option<KvsId> {
        self.replicas(dc, Self::partition(table, key)).first().copied()
    }

    /// Picks some kvs in the data center to coordinate a replicated
    /// operation; the seed spreads load across instances.
    pub fn choose_kvs(&self, dc: DataCenterId, seed: u64) -> Option<KvsId> {
        let in_dc: Vec<KvsId> = self.kvss.iter().filter(|k| k.dc == dc).map(|k| k.id).collect();
        if in_dc.is_empty() {
            return None;
        }
        Some(in_dc[(seed % in_dc.len() as u64) as usize])
    }

    pub fn group(&self, id: PaxosGroupId) -> Option<&PaxosGroup> {
        self.paxos_groups.iter().find(|g| g.id == id)
    }

    /// The first group this transaction manager belongs to, i.e. the group
    /// it coordinates transactions in.
    pub fn group_of(&self, txman: TxmanId) -> Option<&PaxosGroup> {
        self.paxos_groups.iter().find(|g| g.members.contains(&txman))
    }

    pub fn txman(&self, id: TxmanId) -> Option<&TxmanState> {
        self.txmans.iter().find(|t| t.id == id)
    }

    pub fn kvs(&self, id: KvsId) -> Option<&KvsState> {
        self.kvss.iter().find(|k| k.id == id)
    }

    /// Resolves a logical endpoint to its published address.
    pub fn address(&self, id: CommId) -> Option<&str> {
        if let Some(t) = self.txmans.iter().find(|t| t.id.0 == id.0) {
            return Some(&t.bind_to);
        }
        self.kvss.iter().find(|k| k.id.0 == id.0).map(|k| k.bind_to.as_str())
    }

    pub fn validate(&self) -> CResult<()> {
        for g in &self.paxos_groups {
            if g.members.is_empty() {
                return Err(Error::Invalid(format!("{} has no members", g.id)));
            }
            for m in &g.members {
                if self.txman(*m).is_none() {
                    return Err(Error::Invalid(format!("{} lists unknown {}", g.id, m)));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.cluster)?;
        writeln!(f, "{}", self.version)?;

        match self.data_centers.len() {
            0 => writeln!(f, "default data center only")?,
            1 => writeln!(f, "1 configured data center:")?,
            n => writeln!(f, "{} configured data centers:", n)?,
        }
        for dc in &self.data_centers {
            writeln!(f, "{}", dc)?;
        }

        match self.txmans.len() {
            0 => writeln!(f, "no transaction managers")?,
            1 => writeln!(f, "1 transaction manager:")?,
            n => writeln!(f, "{} transaction managers:", n)?,
        }
        for t in &self.txmans {
            writeln!(f, "{}", t)?;
        }

        match self.paxos_groups.len() {
            0 => writeln!(f, "no paxos groups")?,
            1 => writeln!(f, "1 paxos group:")?,
            n => writeln!(f, "{} paxos groups:", n)?,
        }
        for g in &self.paxos_groups {
            writeln!(f, "{}", g)?;
        }

        match self.kvss.len() {
            0 => writeln!(f, "no key value stores")?,
            1 => writeln!(f, "1 key value store")?,
            n => writeln!(f, "{} key value stores:", n)?,
        }
        for k in &self.kvss {
            writeln!(f, "{}", k)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_config() -> Configuration {
        Configuration {
            cluster: ClusterId(1),
            version: VersionId(5),
            flags: 0,
            data_centers: vec![
                DataCenter { id: DataCenterId(1), name: "east".to_owned() },
                DataCenter { id: DataCenterId(2), name: "west".to_owned() },
            ],
            txmans: vec![
                TxmanState { id: TxmanId(11), dc: DataCenterId(1), bind_to: "127.0.0.1:2201".to_owned() },
                TxmanState { id: TxmanId(12), dc: DataCenterId(1), bind_to: "127.0.0.1:2202".to_owned() },
                TxmanState { id: TxmanId(13), dc: DataCenterId(1), bind_to: "127.0.0.1:2203".to_owned() },
            ],
            paxos_groups: vec![PaxosGroup {
                id: PaxosGroupId(1),
                dc: DataCenterId(1),
                members: vec![TxmanId(11), TxmanId(12), TxmanId(13)],
            }],
            kvss: vec![
                KvsState { id: KvsId(21), dc: DataCenterId(1), bind_to: "127.0.0.1:2211".to_owned() },
                KvsState { id: KvsId(22), dc: DataCenterId(1), bind_to: "127.0.0.1:2212".to_owned() },
                KvsState { id: KvsId(23), dc: DataCenterId(1), bind_to: "127.0.0.1:2213".to_owned() },
                KvsState { id: KvsId(24), dc: DataCenterId(2), bind_to: "127.0.0.1:2214".to_owned() },
            ],
        }
    }

    #[test]
    fn encode_decode_round_trip() -> CResult<()> {
        let config = test_config();
        assert_eq!(Configuration::decode(&config.encode())?, config);
        Ok(())
    }

    #[test]
    fn routing_is_deterministic_and_epoch_stable() {
        let config = test_config();
        let mut bumped = config.clone();
        bumped.version = VersionId(6);

        let a = config.owning_kvs(DataCenterId(1), b"t", b"k");
        assert!(a.is_some());
        assert_eq!(a, config.owning_kvs(DataCenterId(1), b"t", b"k"));
        // Same membership, new epoch: same owner.
        assert_eq!(a, bumped.owning_kvs(DataCenterId(1), b"t", b"k"));
    }

    #[test]
    fn replica_sets_are_distinct_and_bounded() {
        let config = test_config();
        for p in 0..KVS_PARTITIONS {
            let replicas = config.replicas(DataCenterId(1), PartitionId(p));
            assert_eq!(replicas.len(), 3);
            let mut dedup = replicas.clone();
            dedup.sort();
            dedup.dedup();
            assert_eq!(dedup.len(), replicas.len());
        }
        // The second data center has a single instance; replication clamps.
        assert_eq!(config.replicas(DataCenterId(2), PartitionId(0)).len(), 1);
    }

    #[test]
    fn choose_kvs_stays_in_the_data_center() {
        let config = test_config();
        for seed in 0..32 {
            let id = config.choose_kvs(DataCenterId(1), seed).unwrap();
            assert_eq!(config.kvs(id).unwrap().dc, DataCenterId(1));
        }
        assert_eq!(config.choose_kvs(DataCenterId(2), 9), Some(KvsId(24)));
        assert_eq!(config.choose_kvs(DataCenterId(3), 0), None);
    }

    #[test]
    fn stale_versions_are_detected() {
        let config = test_config();
        assert!(config.is_stale(VersionId(4)));
        assert!(!config.is_stale(VersionId(5)));
        assert!(!config.is_stale(VersionId(6)));
    }

    #[test]
    fn address_resolution_covers_both_tiers() {
        let config = test_config();
        assert_eq!(config.address(CommId(11)), Some("127.0.0.1:2201"));
        assert_eq!(config.address(CommId(23)), Some("127.0.0.1:2213"));
        assert_eq!(config.address(CommId(99)), None);
    }

    #[test]
    fn description_dump_phrasing() {
        let config = test_config();
        let dump = config.to_string();
        assert!(dump.contains("cluster(1)"));
        assert!(dump.contains("2 configured data centers:"));
        assert!(dump.contains("3 transaction managers:"));
        assert!(dump.contains("1 paxos group:"));
        assert!(dump.contains("4 key value stores:"));

        let empty = Configuration::default();
        let dump = empty.to_string();
        assert!(dump.contains("default data center only"));
        assert!(dump.contains("no transaction managers"));
        assert!(dump.contains("no paxos groups"));
        assert!(dump.contains("no key value stores"));
    }

    #[test]
    fn validate_rejects_unknown_members() {
        let mut config = test_config();
        config.paxos_groups[0].members.push(TxmanId(99));
        assert!(config.validate().is_err());
        assert!(test_config().validate().is_ok());
    }
}
