//! Client-side transaction plumbing: a handle carrying the transaction id
//! and slot counter, and one pending operation per outstanding request.
//! A pending operation owns its nonce, its wire message, and a server
//! selector; on a server failure or disruption it re-issues the request to
//! the next member of the coordinating group, and it records exactly one
//! definitive status no matter how many responses straggle in.

use crate::encoding::{strescape, Unpacker};
use crate::error::{CResult, Error};
use crate::ids::{CommId, TransactionId, VersionId};
use crate::wire::{Message, ReturnCode};

/// Rotates through the group's members, each at most once per operation.
struct ServerSelector {
    members: Vec<CommId>,
    next: usize,
}

impl ServerSelector {
    fn new(members: Vec<CommId>) -> Self {
        ServerSelector { members, next: 0 }
    }

    fn next(&mut self) -> Option<CommId> {
        let id = self.members.get(self.next).copied();
        self.next += 1;
        id
    }
}

/// The definitive answer to a pending operation.
#[derive(Clone, Debug, PartialEq)]
pub struct OpStatus {
    pub rc: ReturnCode,
    pub timestamp: u64,
    pub value: Vec<u8>,
}

/// One outstanding client request.
pub struct PendingOp {
    nonce: u64,
    request: Message,
    selector: ServerSelector,
    describe: String,
    status: Option<OpStatus>,
}

impl PendingOp {
    fn new(nonce: u64, request: Message, members: Vec<CommId>, describe: String) -> Self {
        PendingOp { nonce, request, selector: ServerSelector::new(members), describe, status: None }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn describe(&self) -> &str {
        &self.describe
    }

    /// Picks the next server and returns the frame to send, or fails with
    /// UNAVAILABLE once every member has been tried.
    pub fn send_request(&mut self) -> CResult<(CommId, Message)> {
        match self.selector.next() {
            Some(id) => Ok((id, self.request.clone())),
            None => {
                self.status = Some(OpStatus {
                    rc: ReturnCode::Unavailable,
                    timestamp: 0,
                    value: Vec::new(),
                });
                Err(Error::Internal(
                    "insufficient number of servers to ensure durability".to_owned(),
                ))
            }
        }
    }

    /// A server failure or disruption: same request, next server.
    pub fn handle_disruption(&mut self) -> CResult<(CommId, Message)> {
        self.send_request()
    }

    /// Absorbs a CLIENT_RESPONSE. The first matching nonce decides the
    /// status; duplicates and foreign nonces are ignored.
    pub fn handle_response(&mut self, nonce: u64, rc: ReturnCode, timestamp: u64, value: Vec<u8>) {
        if nonce != self.nonce || self.status.is_some() {
            return;
        }
        self.status = Some(OpStatus { rc, timestamp, value });
    }

    pub fn status(&self) -> Option<&OpStatus> {
        self.status.as_ref()
    }
}

/// A client-side transaction handle. It learns its transaction id from the
/// begin response and hands out slot numbers for writes.
pub struct Transaction {
    version: VersionId,
    members: Vec<CommId>,
    txid: Option<TransactionId>,
    next_nonce: u64,
    next_slot: u64,
    aborted: bool,
}

impl Transaction {
    pub fn new(version: VersionId, members: Vec<CommId>) -> Self {
        Transaction { version, members, txid: None, next_nonce: 1, next_slot: 1, aborted: false }
    }

    pub fn txid(&self) -> Option<TransactionId> {
        self.txid
    }

    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn nonce(&mut self) -> u64 {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        nonce
    }

    fn require_txid(&self) -> CResult<TransactionId> {
        if self.aborted {
            return Err(Error::Invalid("transaction already aborted".to_owned()));
        }
        self.txid.ok_or_else(|| Error::Invalid("transaction not begun".to_owned()))
    }

    pub fn begin(&mut self) -> PendingOp {
        let nonce = self.nonce();
        PendingOp::new(
            nonce,
            Message::TxmanBegin { nonce, version: self.version },
            self.members.clone(),
            "transaction-begin".to_owned(),
        )
    }

    /// Decodes the transaction id out of a successful begin response.
    pub fn absorb_begin(&mut self, op: &PendingOp) -> CResult<()> {
        let status = op
            .status()
            .ok_or_else(|| Error::Invalid("begin not yet answered".to_owned()))?;
        if status.rc != ReturnCode::Success {
            self.aborted = true;
            return Err(Error::Internal(format!("begin failed: {}", status.rc)));
        }
        let mut u = Unpacker::new(&status.value);
        self.txid = Some(TransactionId::unpack(&mut u).map_err(|err| {
            self.aborted = true;
            err
        })?);
        Ok(())
    }

    pub fn read(&mut self, table: &[u8], key: &[u8]) -> CResult<PendingOp> {
        let txid = self.require_txid()?;
        let nonce = self.nonce();
        Ok(PendingOp::new(
            nonce,
            Message::TxmanRead {
                txid,
                nonce,
                table: table.to_vec(),
                key: key.to_vec(),
            },
            self.members.clone(),
            format!(
                "transaction-read(id={}, table=\"{}\", key=\"{}\")",
                txid,
                strescape(table),
                strescape(key)
            ),
        ))
    }

    pub fn write(&mut self, table: &[u8], key: &[u8], value: &[u8]) -> CResult<PendingOp> {
        let txid = self.require_txid()?;
        let nonce = self.nonce();
        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(PendingOp::new(
            nonce,
            Message::TxmanWrite {
                txid,
                nonce,
                slot,
                table: table.to_vec(),
                key: key.to_vec(),
                value: value.to_vec(),
            },
            self.members.clone(),
            format!(
                "transaction-write(id={}, table=\"{}\", key=\"{}\", value=\"{}\")",
                txid,
                strescape(table),
                strescape(key),
                strescape(value)
            ),
        ))
    }

    pub fn commit(&mut self) -> CResult<PendingOp> {
        let txid = self.require_txid()?;
        let nonce = self.nonce();
        Ok(PendingOp::new(
            nonce,
            Message::TxmanCommit { txid, nonce },
            self.members.clone(),
            format!("transaction-commit(id={})", txid),
        ))
    }

    pub fn abort(&mut self) -> CResult<PendingOp> {
        let txid = self.require_txid()?;
        self.aborted = true;
        let nonce = self.nonce();
        Ok(PendingOp::new(
            nonce,
            Message::TxmanAbort { txid, nonce },
            self.members.clone(),
            format!("transaction-abort(id={})", txid),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Packer;
    use crate::ids::PaxosGroupId;

    fn members() -> Vec<CommId> {
        vec![CommId(11), CommId(12), CommId(13)]
    }

    fn begun() -> Transaction {
        let mut tx = Transaction::new(VersionId(5), members());
        let mut op = tx.begin();
        let txid = TransactionId::new(PaxosGroupId(1), 9, 1000);
        let mut value = Packer::new();
        txid.pack(&mut value);
        op.handle_response(op.nonce(), ReturnCode::Success, 0, value.take());
        tx.absorb_begin(&op).unwrap();
        tx
    }

    #[test]
    fn begin_learns_the_transaction_id() {
        let tx = begun();
        assert_eq!(tx.txid(), Some(TransactionId::new(PaxosGroupId(1), 9, 1000)));
    }

    #[test]
    fn operations_require_a_begun_transaction() {
        let mut tx = Transaction::new(VersionId(5), members());
        assert!(tx.read(b"t", b"k").is_err());
        assert!(tx.commit().is_err());
    }

    #[test]
    fn writes_carry_distinct_slots() -> CResult<()> {
        let mut tx = begun();
        let w1 = tx.write(b"t", b"k1", b"v1")?;
        let w2 = tx.write(b"t", b"k2", b"v2")?;
        match (&w1.request, &w2.request) {
            (
                Message::TxmanWrite { slot: s1, nonce: n1, .. },
                Message::TxmanWrite { slot: s2, nonce: n2, .. },
            ) => {
                assert_eq!(*s1, 1);
                assert_eq!(*s2, 2);
                assert_ne!(n1, n2);
            }
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn disruption_walks_the_members_then_fails_unavailable() -> CResult<()> {
        let mut tx = begun();
        let mut op = tx.commit()?;
        let (first, _) = op.send_request()?;
        assert_eq!(first, CommId(11));
        let (second, _) = op.handle_disruption()?;
        assert_eq!(second, CommId(12));
        let (third, _) = op.handle_disruption()?;
        assert_eq!(third, CommId(13));

        assert!(op.handle_disruption().is_err());
        assert_eq!(op.status().map(|s| s.rc), Some(ReturnCode::Unavailable));
        Ok(())
    }

    #[test]
    fn only_the_first_matching_response_counts() -> CResult<()> {
        let mut tx = begun();
        let mut op = tx.read(b"t", b"k")?;
        op.handle_response(op.nonce() + 7, ReturnCode::Success, 1, b"wrong".to_vec());
        assert!(op.status().is_none());
        op.handle_response(op.nonce(), ReturnCode::Success, 10, b"v".to_vec());
        op.handle_response(op.nonce(), ReturnCode::Aborted, 0, Vec::new());
        assert_eq!(
            op.status(),
            Some(&OpStatus { rc: ReturnCode::Success, timestamp: 10, value: b"v".to_vec() })
        );
        Ok(())
    }

    #[test]
    fn aborted_transactions_refuse_new_operations() {
        let mut tx = begun();
        tx.mark_aborted();
        assert!(tx.write(b"t", b"k", b"v").is_err());
    }

    #[test]
    fn describe_escapes_bytes() -> CResult<()> {
        let mut tx = begun();
        let op = tx.write(b"t", b"\x00k", b"v")?;
        assert!(op.describe().contains("\\x00k"));
        Ok(())
    }
}
