//! One in-flight ledger being reconciled.

use std::collections::BTreeSet;

use crate::wire::{Hash256, LedgerHeader};

/// Order-independent digest over a transaction set.
///
/// The canonical transaction-tree hash belongs to the binary serialization
/// layer outside this crate; this XOR fold is the pluggable stand-in,
/// applied identically to stream-accumulated and fetched transaction sets
/// so equality against a header's `transaction_hash` is meaningful whenever
/// the server uses the same fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxSetDigest(Hash256);

impl TxSetDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold(hashes: impl IntoIterator<Item = Hash256>) -> Self {
        let mut digest = Self::new();
        for h in hashes {
            digest.add(&h);
        }
        digest
    }

    pub fn add(&mut self, hash: &Hash256) {
        self.0.xor_with(hash);
    }

    pub fn value(&self) -> &Hash256 {
        &self.0
    }

    pub fn matches(&self, expected: &Hash256) -> bool {
        &self.0 == expected
    }
}

/// Reconciliation progress of one ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    /// Accumulating stream transactions, nothing in flight.
    Pending,
    /// Header fetch in flight.
    CheckingHeader,
    /// Expanded ledger fetch in flight.
    FillingIn,
    /// Fully reconciled; entry is about to be dropped.
    Cleared,
    /// A fill-in contradicted its own header. The ledger is unrecoverable
    /// and parked; it is never picked for another fetch.
    Failed,
}

impl LedgerStatus {
    pub fn awaiting_response(&self) -> bool {
        matches!(self, LedgerStatus::CheckingHeader | LedgerStatus::FillingIn)
    }
}

/// A ledger with transactions still unaccounted for.
#[derive(Debug, Clone)]
pub struct PendingLedger {
    pub ledger_index: u64,
    pub status: LedgerStatus,
    /// Transaction count announced by the `ledgerClosed` message; None until
    /// (unless) that message was seen.
    pub expected_txns: Option<u32>,
    pub header: Option<LedgerHeader>,
    digest: TxSetDigest,
    seen: BTreeSet<Hash256>,
}

impl PendingLedger {
    pub fn new(ledger_index: u64) -> Self {
        PendingLedger {
            ledger_index,
            status: LedgerStatus::Pending,
            expected_txns: None,
            header: None,
            digest: TxSetDigest::new(),
            seen: BTreeSet::new(),
        }
    }

    /// Records one validated transaction hash. Returns whether it was new;
    /// duplicates (stream + fill-in overlap) fold in exactly once.
    pub fn record(&mut self, hash: Hash256) -> bool {
        if self.seen.insert(hash) {
            self.digest.add(&hash);
            true
        } else {
            false
        }
    }

    pub fn has_seen(&self, hash: &Hash256) -> bool {
        self.seen.contains(hash)
    }

    pub fn cleared_txns(&self) -> u32 {
        self.seen.len() as u32
    }

    /// Whether the accumulated count matches the announced count.
    pub fn count_complete(&self) -> bool {
        self.expected_txns == Some(self.cleared_txns())
    }

    pub fn digest(&self) -> &TxSetDigest {
        &self.digest
    }

    /// Digest of the current set plus `extra`, without committing.
    pub fn digest_with(&self, extra: impl IntoIterator<Item = Hash256>) -> TxSetDigest {
        let mut digest = self.digest;
        for h in extra {
            if !self.seen.contains(&h) {
                digest.add(&h);
            }
        }
        digest
    }
}
