//! The framed wire format. Every message is HEADER_SIZE reserved bytes (the
//! transport's), a big-endian 16-bit message type, and a type-specific
//! payload. Integers that tend to be small (nonces, slots, sequence numbers)
//! are varints; timestamps, identifiers and state keys are fixed 64-bit
//! big-endian; tables, keys and values are varint-length-prefixed slices.

use crate::encoding::{Packer, Unpacker};
use crate::error::{CResult, Error};
use crate::ids::{Ballot, CommId, PartitionId, TransactionGroup, TransactionId, VersionId};

/// Bytes reserved at the front of every frame for the transport substrate.
pub const HEADER_SIZE: usize = 8;

/// Wire-level return codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ReturnCode {
    Success = 1,
    NotFound = 2,
    Aborted = 3,
    Committed = 4,
    Unavailable = 5,
    ServerError = 6,
    Invalid = 7,
    Timeout = 8,
}

impl ReturnCode {
    fn from_u16(v: u16) -> CResult<Self> {
        Ok(match v {
            1 => ReturnCode::Success,
            2 => ReturnCode::NotFound,
            3 => ReturnCode::Aborted,
            4 => ReturnCode::Committed,
            5 => ReturnCode::Unavailable,
            6 => ReturnCode::ServerError,
            7 => ReturnCode::Invalid,
            8 => ReturnCode::Timeout,
            _ => return Err(Error::Parse(format!("unknown return code {}", v))),
        })
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReturnCode::Success => "SUCCESS",
            ReturnCode::NotFound => "NOT_FOUND",
            ReturnCode::Aborted => "ABORTED",
            ReturnCode::Committed => "COMMITTED",
            ReturnCode::Unavailable => "UNAVAILABLE",
            ReturnCode::ServerError => "SERVER_ERROR",
            ReturnCode::Invalid => "INVALID",
            ReturnCode::Timeout => "TIMEOUT",
        };
        write!(f, "{}", name)
    }
}

/// Lock operations carried by KVS_LOCK_OP and KVS_RAW_LK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOp {
    Lock = 1,
    Unlock = 2,
}

impl LockOp {
    fn from_u8(v: u8) -> CResult<Self> {
        match v {
            1 => Ok(LockOp::Lock),
            2 => Ok(LockOp::Unlock),
            _ => Err(Error::Parse(format!("unknown lock op {}", v))),
        }
    }
}

/// Phases of the two-phase replica write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WritePhase {
    Begin = 1,
    Finish = 2,
    Cancel = 3,
}

impl WritePhase {
    fn from_u8(v: u8) -> CResult<Self> {
        match v {
            1 => Ok(WritePhase::Begin),
            2 => Ok(WritePhase::Finish),
            3 => Ok(WritePhase::Cancel),
            _ => Err(Error::Parse(format!("unknown write phase {}", v))),
        }
    }
}

/// A replica's answer to a lock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RawLockOutcome {
    Granted = 1,
    Queued = 2,
    Wound = 3,
}

impl RawLockOutcome {
    fn from_u8(v: u8) -> CResult<Self> {
        match v {
            1 => Ok(RawLockOutcome::Granted),
            2 => Ok(RawLockOutcome::Queued),
            3 => Ok(RawLockOutcome::Wound),
            _ => Err(Error::Parse(format!("unknown lock outcome {}", v))),
        }
    }
}

/// Message types, packed as a big-endian u16 after the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    ClientResponse = 16,

    TxmanBegin = 32,
    TxmanRead = 33,
    TxmanWrite = 34,
    TxmanCommit = 35,
    TxmanAbort = 36,

    KvsRepRd = 64,
    KvsRepRdResp = 65,
    KvsRepWr = 66,
    KvsRepWrResp = 67,
    KvsRawRd = 68,
    KvsRawRdResp = 69,
    KvsRawWr = 70,
    KvsRawWrResp = 71,
    KvsLockOp = 72,
    KvsLockOpResp = 73,
    KvsRawLk = 74,
    KvsRawLkResp = 75,
    WoundXact = 76,
    MigrateSyn = 77,
    MigrateAck = 78,

    Paxos2A = 128,
    Paxos2B = 129,
    PaxosLearn = 130,
}

impl MessageType {
    fn from_u16(v: u16) -> CResult<Self> {
        Ok(match v {
            16 => MessageType::ClientResponse,
            32 => MessageType::TxmanBegin,
            33 => MessageType::TxmanRead,
            34 => MessageType::TxmanWrite,
            35 => MessageType::TxmanCommit,
            36 => MessageType::TxmanAbort,
            64 => MessageType::KvsRepRd,
            65 => MessageType::KvsRepRdResp,
            66 => MessageType::KvsRepWr,
            67 => MessageType::KvsRepWrResp,
            68 => MessageType::KvsRawRd,
            69 => MessageType::KvsRawRdResp,
            70 => MessageType::KvsRawWr,
            71 => MessageType::KvsRawWrResp,
            72 => MessageType::KvsLockOp,
            73 => MessageType::KvsLockOpResp,
            74 => MessageType::KvsRawLk,
            75 => MessageType::KvsRawLkResp,
            76 => MessageType::WoundXact,
            77 => MessageType::MigrateSyn,
            78 => MessageType::MigrateAck,
            128 => MessageType::Paxos2A,
            129 => MessageType::Paxos2B,
            130 => MessageType::PaxosLearn,
            _ => return Err(Error::Parse(format!("unknown message type {}", v))),
        })
    }
}

/// A decoded message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    ClientResponse { nonce: u64, rc: ReturnCode, timestamp: u64, value: Vec<u8> },

    TxmanBegin { nonce: u64, version: VersionId },
    TxmanRead { txid: TransactionId, nonce: u64, table: Vec<u8>, key: Vec<u8> },
    TxmanWrite {
        txid: TransactionId,
        nonce: u64,
        slot: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    TxmanCommit { txid: TransactionId, nonce: u64 },
    TxmanAbort { txid: TransactionId, nonce: u64 },

    KvsRepRd { state_key: u64, table: Vec<u8>, key: Vec<u8>, timestamp: u64 },
    KvsRepRdResp { state_key: u64, rc: ReturnCode, timestamp: u64, value: Vec<u8> },
    KvsRepWr { state_key: u64, table: Vec<u8>, key: Vec<u8>, timestamp: u64, value: Vec<u8> },
    KvsRepWrResp { state_key: u64, rc: ReturnCode, timestamp: u64 },

    KvsRawRd { state_key: u64, table: Vec<u8>, key: Vec<u8>, timestamp: u64 },
    KvsRawRdResp { state_key: u64, rc: ReturnCode, timestamp: u64, value: Vec<u8> },
    KvsRawWr {
        state_key: u64,
        phase: WritePhase,
        table: Vec<u8>,
        key: Vec<u8>,
        timestamp: u64,
        value: Vec<u8>,
    },
    KvsRawWrResp { state_key: u64, phase: WritePhase, rc: ReturnCode, timestamp: u64 },

    KvsLockOp {
        state_key: u64,
        table: Vec<u8>,
        key: Vec<u8>,
        tg: TransactionGroup,
        priority: u64,
        op: LockOp,
    },
    KvsLockOpResp { state_key: u64, rc: ReturnCode },
    KvsRawLk {
        state_key: u64,
        op: LockOp,
        table: Vec<u8>,
        key: Vec<u8>,
        tg: TransactionGroup,
        priority: u64,
    },
    KvsRawLkResp { state_key: u64, outcome: RawLockOutcome, victim: TransactionGroup },

    WoundXact { victim: TransactionGroup },

    MigrateSyn {
        partition: PartitionId,
        seqno: u64,
        records: Vec<(Vec<u8>, Vec<u8>)>,
        done: bool,
    },
    MigrateAck { partition: PartitionId, seqno: u64 },

    Paxos2A { group: TransactionGroup, ballot: Ballot, slot: u64, entry: Vec<u8> },
    Paxos2B { group: TransactionGroup, ballot: Ballot, slot: u64 },
    PaxosLearn { group: TransactionGroup, slot: u64, entry: Vec<u8> },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ClientResponse { .. } => MessageType::ClientResponse,
            Message::TxmanBegin { .. } => MessageType::TxmanBegin,
            Message::TxmanRead { .. } => MessageType::TxmanRead,
            Message::TxmanWrite { .. } => MessageType::TxmanWrite,
            Message::TxmanCommit { .. } => MessageType::TxmanCommit,
            Message::TxmanAbort { .. } => MessageType::TxmanAbort,
            Message::KvsRepRd { .. } => MessageType::KvsRepRd,
            Message::KvsRepRdResp { .. } => MessageType::KvsRepRdResp,
            Message::KvsRepWr { .. } => MessageType::KvsRepWr,
            Message::KvsRepWrResp { .. } => MessageType::KvsRepWrResp,
            Message::KvsRawRd { .. } => MessageType::KvsRawRd,
            Message::KvsRawRdResp { .. } => MessageType::KvsRawRdResp,
            Message::KvsRawWr { .. } => MessageType::KvsRawWr,
            Message::KvsRawWrResp { .. } => MessageType::KvsRawWrResp,
            Message::KvsLockOp { .. } => MessageType::KvsLockOp,
            Message::KvsLockOpResp { .. } => MessageType::KvsLockOpResp,
            Message::KvsRawLk { .. } => MessageType::KvsRawLk,
            Message::KvsRawLkResp { .. } => MessageType::KvsRawLkResp,
            Message::WoundXact { .. } => MessageType::WoundXact,
            Message::MigrateSyn { .. } => MessageType::MigrateSyn,
            Message::MigrateAck { .. } => MessageType::MigrateAck,
            Message::Paxos2A { .. } => MessageType::Paxos2A,
            Message::Paxos2B { .. } => MessageType::Paxos2B,
            Message::PaxosLearn { .. } => MessageType::PaxosLearn,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = Packer::with_capacity(HEADER_SIZE + 64);
        p.raw(&[0u8; HEADER_SIZE]);
        p.u16(self.message_type() as u16);

        match self {
            Message::ClientResponse { nonce, rc, timestamp, value } => {
                p.varint(*nonce).u16(*rc as u16).u64(*timestamp).slice(value);
            }
            Message::TxmanBegin { nonce, version } => {
                p.varint(*nonce).u64(version.0);
            }
            Message::TxmanRead { txid, nonce, table, key } => {
                txid.pack(&mut p);
                p.varint(*nonce).slice(table).slice(key);
            }
            Message::TxmanWrite { txid, nonce, slot, table, key, value } => {
                txid.pack(&mut p);
                p.varint(*nonce).varint(*slot).slice(table).slice(key).slice(value);
            }
            Message::TxmanCommit { txid, nonce } => {
                txid.pack(&mut p);
                p.varint(*nonce);
            }
            Message::TxmanAbort { txid, nonce } => {
                txid.pack(&mut p);
                p.varint(*nonce);
            }
            Message::KvsRepRd { state_key, table, key, timestamp } => {
                p.u64(*state_key).slice(table).slice(key).u64(*timestamp);
            }
            Message::KvsRepRdResp { state_key, rc, timestamp, value } => {
                p.u64(*state_key).u16(*rc as u16).u64(*timestamp).slice(value);
            }
            Message::KvsRepWr { state_key, table, key, timestamp, value } => {
                p.u64(*state_key).slice(table).slice(key).u64(*timestamp).slice(value);
            }
            Message::KvsRepWrResp { state_key, rc, timestamp } => {
                p.u64(*state_key).u16(*rc as u16).u64(*timestamp);
            }
            Message::KvsRawRd { state_key, table, key, timestamp } => {
                p.u64(*state_key).slice(table).slice(key).u64(*timestamp);
            }
            Message::KvsRawRdResp { state_key, rc, timestamp, value } => {
                p.u64(*state_key).u16(*rc as u16).u64(*timestamp).slice(value);
            }
            Message::KvsRawWr { state_key, phase, table, key, timestamp, value } => {
                p.u64(*state_key).u8(*phase as u8).slice(table).slice(key).u64(*timestamp);
                p.slice(value);
            }
            Message::KvsRawWrResp { state_key, phase, rc, timestamp } => {
                p.u64(*state_key).u8(*phase as u8).u16(*rc as u16).u64(*timestamp);
            }
            Message::KvsLockOp { state_key, table, key, tg, priority, op } => {
                p.u64(*state_key).slice(table).slice(key);
                tg.pack(&mut p);
                p.u64(*priority).u8(*op as u8);
            }
            Message::KvsLockOpResp { state_key, rc } => {
                p.u64(*state_key).u16(*rc as u16);
            }
            Message::KvsRawLk { state_key, op, table, key, tg, priority } => {
                p.u64(*state_key).u8(*op as u8).slice(table).slice(key);
                tg.pack(&mut p);
                p.u64(*priority);
            }
            Message::KvsRawLkResp { state_key, outcome, victim } => {
                p.u64(*state_key).u8(*outcome as u8);
                victim.pack(&mut p);
            }
            Message::WoundXact { victim } => {
                victim.pack(&mut p);
            }
            Message::MigrateSyn { partition, seqno, records, done } => {
                p.u64(partition.0).varint(*seqno).u8(*done as u8);
                p.varint(records.len() as u64);
                for (k, v) in records {
                    p.slice(k).slice(v);
                }
            }
            Message::MigrateAck { partition, seqno } => {
                p.u64(partition.0).varint(*seqno);
            }
            Message::Paxos2A { group, ballot, slot, entry } => {
                group.pack(&mut p);
                ballot.pack(&mut p);
                p.varint(*slot).slice(entry);
            }
            Message::Paxos2B { group, ballot, slot } => {
                group.pack(&mut p);
                ballot.pack(&mut p);
                p.varint(*slot);
            }
            Message::PaxosLearn { group, slot, entry } => {
                group.pack(&mut p);
                p.varint(*slot).slice(entry);
            }
        }
        p.take()
    }

    pub fn decode(bytes: &[u8]) -> CResult<Message> {
        let mut u = Unpacker::new(bytes);
        u.skip(HEADER_SIZE)?;
        let msg_type = MessageType::from_u16(u.u16()?)?;

        let msg = match msg_type {
            MessageType::ClientResponse => Message::ClientResponse {
                nonce: u.varint()?,
                rc: ReturnCode::from_u16(u.u16()?)?,
                timestamp: u.u64()?,
                value: u.slice()?,
            },
            MessageType::TxmanBegin => Message::TxmanBegin {
                nonce: u.varint()?,
                version: VersionId(u.u64()?),
            },
            MessageType::TxmanRead => Message::TxmanRead {
                txid: TransactionId::unpack(&mut u)?,
                nonce: u.varint()?,
                table: u.slice()?,
                key: u.slice()?,
            },
            MessageType::TxmanWrite => Message::TxmanWrite {
                txid: TransactionId::unpack(&mut u)?,
                nonce: u.varint()?,
                slot: u.varint()?,
                table: u.slice()?,
                key: u.slice()?,
                value: u.slice()?,
            },
            MessageType::TxmanCommit => {
                Message::TxmanCommit { txid: TransactionId::unpack(&mut u)?, nonce: u.varint()? }
            }
            MessageType::TxmanAbort => {
                Message::TxmanAbort { txid: TransactionId::unpack(&mut u)?, nonce: u.varint()? }
            }
            MessageType::KvsRepRd => Message::KvsRepRd {
                state_key: u.u64()?,
                table: u.slice()?,
                key: u.slice()?,
                timestamp: u.u64()?,
            },
            MessageType::KvsRepRdResp => Message::KvsRepRdResp {
                state_key: u.u64()?,
                rc: ReturnCode::from_u16(u.u16()?)?,
                timestamp: u.u64()?,
                value: u.slice()?,
            },
            MessageType::KvsRepWr => Message::KvsRepWr {
                state_key: u.u64()?,
                table: u.slice()?,
                key: u.slice()?,
                timestamp: u.u64()?,
                value: u.slice()?,
            },
            MessageType::KvsRepWrResp => Message::KvsRepWrResp {
                state_key: u.u64()?,
                rc: ReturnCode::from_u16(u.u16()?)?,
                timestamp: u.u64()?,
            },
            MessageType::KvsRawRd => Message::KvsRawRd {
                state_key: u.u64()?,
                table: u.slice()?,
                key: u.slice()?,
                timestamp: u.u64()?,
            },
            MessageType::KvsRawRdResp => Message::KvsRawRdResp {
                state_key: u.u64()?,
                rc: ReturnCode::from_u16(u.u16()?)?,
                timestamp: u.u64()?,
                value: u.slice()?,
            },
            MessageType::KvsRawWr => Message::KvsRawWr {
                state_key: u.u64()?,
                phase: WritePhase::from_u8(u.u8()?)?,
                table: u.slice()?,
                key: u.slice()?,
                timestamp: u.u64()?,
                value: u.slice()?,
            },
            MessageType::KvsRawWrResp => Message::KvsRawWrResp {
                state_key: u.u64()?,
                phase: WritePhase::from_u8(u.u8()?)?,
                rc: ReturnCode::from_u16(u.u16()?)?,
                timestamp: u.u64()?,
            },
            MessageType::KvsLockOp => Message::KvsLockOp {
                state_key: u.u64()?,
                table: u.slice()?,
                key: u.slice()?,
                tg: TransactionGroup::unpack(&mut u)?,
                priority: u.u64()?,
                op: LockOp::from_u8(u.u8()?)?,
            },
            MessageType::KvsLockOpResp => Message::KvsLockOpResp {
                state_key: u.u64()?,
                rc: ReturnCode::from_u16(u.u16()?)?,
            },
            MessageType::KvsRawLk => Message::KvsRawLk {
                state_key: u.u64()?,
                op: LockOp::from_u8(u.u8()?)?,
                table: u.slice()?,
                key: u.slice()?,
                tg: TransactionGroup::unpack(&mut u)?,
                priority: u.u64()?,
            },
            MessageType::KvsRawLkResp => Message::KvsRawLkResp {
                state_key: u.u64()?,
                outcome: RawLockOutcome::from_u8(u.u8()?)?,
                victim: TransactionGroup::unpack(&mut u)?,
            },
            MessageType::WoundXact => {
                Message::WoundXact { victim: TransactionGroup::unpack(&mut u)? }
            }
            MessageType::MigrateSyn => {
                let partition = PartitionId(u.u64()?);
                let seqno = u.varint()?;
                let done = u.u8()? != 0;
                let count = u.varint()?;
                let mut records = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    records.push((u.slice()?, u.slice()?));
                }
                Message::MigrateSyn { partition, seqno, records, done }
            }
            MessageType::MigrateAck => {
                Message::MigrateAck { partition: PartitionId(u.u64()?), seqno: u.varint()? }
            }
            MessageType::Paxos2A => Message::Paxos2A {
                group: TransactionGroup::unpack(&mut u)?,
                ballot: Ballot::unpack(&mut u)?,
                slot: u.varint()?,
                entry: u.slice()?,
            },
            MessageType::Paxos2B => Message::Paxos2B {
                group: TransactionGroup::unpack(&mut u)?,
                ballot: Ballot::unpack(&mut u)?,
                slot: u.varint()?,
            },
            MessageType::PaxosLearn => Message::PaxosLearn {
                group: TransactionGroup::unpack(&mut u)?,
                slot: u.varint()?,
                entry: u.slice()?,
            },
        };

        if u.remaining() != 0 {
            return Err(Error::Parse(format!(
                "{} trailing bytes after {:?} payload",
                u.remaining(),
                msg_type
            )));
        }
        Ok(msg)
    }
}

/// An outbound frame: where it goes and what it says.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub to: CommId,
    pub msg: Message,
}

impl Envelope {
    pub fn new(to: CommId, msg: Message) -> Self {
        Envelope { to, msg }
    }
}

/// Handlers append their outbound frames here and return; the transport
/// drains it. Handlers never block on I/O.
pub type Outbox = Vec<Envelope>;
