//! Pending-ledger reconciliation.
//!
//! Validated-transaction streams are lossy across reconnects. This engine
//! tracks, per closed ledger, how many transactions were announced versus
//! observed; complete ledgers get their header verified against the
//! accumulated transaction-set digest, incomplete or mismatching ones are
//! filled in from an expanded ledger fetch. Fully reconciled indices land in
//! a compacted cleared set whose gaps drive backfill of missed ledgers.
//!
//! This module is the decision core: it mutates tracking state and returns
//! what to do (which ledgers to fetch, which transactions to deliver). The
//! client owns the request plumbing.

mod cleared;
mod pending;

pub use cleared::ClearedLedgersSet;
pub use pending::{LedgerStatus, PendingLedger, TxSetDigest};

use std::collections::BTreeMap;

use crate::error::{LedgerLinkError, Result};
use crate::wire::{LedgerHeader, TransactionResult};

/// What to do with an ingested stream transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// First sighting: deliver it to the validated-transaction path.
    pub deliver: bool,
    /// The transaction completed this ledger's announced count; verify its
    /// header now.
    pub check_header: Option<u64>,
}

/// Result of comparing a fetched header against the accumulated digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOutcome {
    /// Digest matched; the ledger is cleared.
    Cleared,
    /// Digest mismatch; an expanded fetch is needed.
    FillIn,
}

/// All ledgers with transactions still unaccounted for.
pub struct PendingLedgers {
    ledgers: BTreeMap<u64, PendingLedger>,
    cleared: ClearedLedgersSet,
}

impl Default for PendingLedgers {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingLedgers {
    pub fn new() -> Self {
        PendingLedgers {
            ledgers: BTreeMap::new(),
            cleared: ClearedLedgersSet::new(),
        }
    }

    /// Panics when asked to re-open an already cleared ledger; callers
    /// guard with the cleared set first.
    fn get_or_add(&mut self, ledger_index: u64) -> &mut PendingLedger {
        assert!(
            !self.cleared.contains(ledger_index),
            "ledger {ledger_index} already cleared; refusing to re-open"
        );
        self.ledgers
            .entry(ledger_index)
            .or_insert_with(|| PendingLedger::new(ledger_index))
    }

    /// Folds one validated stream transaction into its ledger.
    pub fn ingest(&mut self, tr: &TransactionResult) -> IngestOutcome {
        if self.cleared.contains(tr.ledger_index) {
            // Late duplicate of an already reconciled ledger.
            return IngestOutcome {
                deliver: false,
                check_header: None,
            };
        }
        let ledger = self.get_or_add(tr.ledger_index);
        let newly = ledger.record(tr.hash);
        let check_header = (newly
            && ledger.status == LedgerStatus::Pending
            && ledger.count_complete())
        .then_some(tr.ledger_index);
        IngestOutcome {
            deliver: newly,
            check_header,
        }
    }

    /// Handles a ledger close: records the announced transaction count,
    /// opens entries for historical gaps, and picks up to `max_in_flight`
    /// stalled ledgers (minus those already awaiting a response) whose
    /// headers should be fetched now. The just-closed ledger itself is never
    /// picked; its stream transactions are still arriving.
    pub fn on_ledger_closed(
        &mut self,
        current: u64,
        txn_count: u32,
        max_in_flight: usize,
    ) -> Vec<u64> {
        self.get_or_add(current).expected_txns = Some(txn_count);

        for gap in self.cleared.gaps() {
            if !self.ledgers.contains_key(&gap) {
                self.get_or_add(gap);
            }
        }

        let in_flight = self
            .ledgers
            .values()
            .filter(|l| l.status.awaiting_response())
            .count();
        let budget = max_in_flight.saturating_sub(in_flight);
        let picks: Vec<u64> = self
            .ledgers
            .values()
            .filter(|l| l.status == LedgerStatus::Pending && l.ledger_index != current)
            .map(|l| l.ledger_index)
            .take(budget)
            .collect();
        for idx in &picks {
            if let Some(ledger) = self.ledgers.get_mut(idx) {
                ledger.status = LedgerStatus::CheckingHeader;
            }
        }
        picks
    }

    /// Applies a fetched header. `Cleared` means done; `FillIn` means the
    /// caller must fetch the expanded ledger (status is already advanced).
    pub fn on_header(&mut self, ledger_index: u64, header: LedgerHeader) -> Option<HeaderOutcome> {
        let ledger = self.ledgers.get_mut(&ledger_index)?;
        let matches = ledger.digest().matches(&header.transaction_hash);
        ledger.header = Some(header);
        if matches {
            self.clear(ledger_index);
            Some(HeaderOutcome::Cleared)
        } else {
            ledger.status = LedgerStatus::FillingIn;
            Some(HeaderOutcome::FillIn)
        }
    }

    /// Applies an expanded ledger fetch: verifies the combined transaction
    /// set against the header first, then commits and clears. On success
    /// returns the transactions not seen before, for delivery. A digest
    /// mismatch here is unrecoverable: an expanded fetch disagreeing with
    /// its own header cannot be resolved by refetching, so the ledger is
    /// parked as `Failed` and the inconsistency is surfaced.
    pub fn on_fill_in(
        &mut self,
        ledger_index: u64,
        header: LedgerHeader,
        txns: Vec<TransactionResult>,
    ) -> Result<Vec<TransactionResult>> {
        let Some(ledger) = self.ledgers.get_mut(&ledger_index) else {
            return Ok(Vec::new());
        };
        let combined = ledger.digest_with(txns.iter().map(|t| t.hash));
        if !combined.matches(&header.transaction_hash) {
            ledger.status = LedgerStatus::Failed;
            return Err(LedgerLinkError::InconsistentLedger {
                ledger_index,
                expected: header.transaction_hash,
                computed: *combined.value(),
            });
        }
        let newly: Vec<TransactionResult> = txns
            .into_iter()
            .filter(|t| ledger.record(t.hash))
            .collect();
        ledger.header = Some(header);
        self.clear(ledger_index);
        Ok(newly)
    }

    /// A header or fill-in fetch came back unusable; drop the ledger back
    /// to `Pending` so a later close retries it. Only in-flight fetches can
    /// fail; parked ledgers stay parked.
    pub fn fetch_failed(&mut self, ledger_index: u64) {
        if let Some(ledger) = self.ledgers.get_mut(&ledger_index) {
            if ledger.status.awaiting_response() {
                ledger.status = LedgerStatus::Pending;
            }
        }
    }

    fn clear(&mut self, ledger_index: u64) {
        self.ledgers.remove(&ledger_index);
        self.cleared.clear(ledger_index);
        if self.ledgers.is_empty() {
            self.cleared.compact_if_contiguous();
        }
    }

    pub fn is_tracking(&self, ledger_index: u64) -> bool {
        self.ledgers.contains_key(&ledger_index)
    }

    pub fn is_cleared(&self, ledger_index: u64) -> bool {
        self.cleared.contains(ledger_index)
    }

    pub fn tracked_indices(&self) -> Vec<u64> {
        self.ledgers.keys().copied().collect()
    }

    pub fn status_of(&self, ledger_index: u64) -> Option<LedgerStatus> {
        self.ledgers.get(&ledger_index).map(|l| l.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Hash256;
    use serde_json::Value;

    fn h(n: u8) -> Hash256 {
        let mut bytes = [0u8; 32];
        bytes[31] = n;
        Hash256::from_bytes(bytes)
    }

    fn tr(ledger_index: u64, hash: Hash256) -> TransactionResult {
        TransactionResult {
            validated: true,
            hash,
            ledger_index,
            account: None,
            sequence: None,
            engine_result: None,
            raw: Value::Null,
        }
    }

    fn header(ledger_index: u64, txn_hashes: &[Hash256]) -> LedgerHeader {
        LedgerHeader {
            ledger_index,
            transaction_hash: *TxSetDigest::fold(txn_hashes.iter().copied()).value(),
            ledger_hash: None,
        }
    }

    #[test]
    fn complete_ledger_clears_on_matching_header() {
        let mut pl = PendingLedgers::new();
        assert!(pl.on_ledger_closed(100, 2, 1).is_empty());
        let first = pl.ingest(&tr(100, h(1)));
        assert!(first.deliver);
        assert!(first.check_header.is_none());
        let second = pl.ingest(&tr(100, h(2)));
        assert!(second.deliver);
        assert_eq!(second.check_header, Some(100));

        let outcome = pl.on_header(100, header(100, &[h(1), h(2)]));
        assert_eq!(outcome, Some(HeaderOutcome::Cleared));
        assert!(pl.is_cleared(100));
        assert!(!pl.is_tracking(100));
    }

    #[test]
    fn duplicate_stream_transactions_deliver_once() {
        let mut pl = PendingLedgers::new();
        pl.on_ledger_closed(100, 2, 1);
        assert!(pl.ingest(&tr(100, h(1))).deliver);
        assert!(!pl.ingest(&tr(100, h(1))).deliver);
    }

    #[test]
    fn stalled_ledger_advances_on_next_close() {
        let mut pl = PendingLedgers::new();
        assert!(pl.on_ledger_closed(100, 0, 1).is_empty());
        assert_eq!(pl.on_ledger_closed(101, 0, 1), vec![100]);
        // empty set digest is the zero hash
        assert_eq!(pl.on_header(100, header(100, &[])), Some(HeaderOutcome::Cleared));
    }

    #[test]
    fn in_flight_budget_holds_back_further_fetches() {
        let mut pl = PendingLedgers::new();
        assert!(pl.on_ledger_closed(100, 1, 1).is_empty());
        assert_eq!(pl.on_ledger_closed(101, 1, 1), vec![100]);
        // 100 is in flight; 101 must wait until it resolves.
        assert!(pl.on_ledger_closed(102, 0, 1).is_empty());
    }

    #[test]
    fn incomplete_ledger_fills_in() {
        let mut pl = PendingLedgers::new();
        pl.on_ledger_closed(101, 2, 1);
        pl.ingest(&tr(101, h(1)));
        assert_eq!(pl.on_ledger_closed(102, 0, 1), vec![101]);

        let hdr = header(101, &[h(1), h(2)]);
        assert_eq!(pl.on_header(101, hdr.clone()), Some(HeaderOutcome::FillIn));
        assert_eq!(pl.status_of(101), Some(LedgerStatus::FillingIn));

        let newly = pl
            .on_fill_in(101, hdr, vec![tr(101, h(1)), tr(101, h(2))])
            .unwrap();
        assert_eq!(newly.len(), 1);
        assert_eq!(newly[0].hash, h(2));
        assert!(pl.is_cleared(101));
    }

    #[test]
    fn fill_in_mismatch_parks_the_ledger() {
        let mut pl = PendingLedgers::new();
        pl.on_ledger_closed(101, 2, 1);
        pl.on_ledger_closed(102, 0, 1);
        let hdr = header(101, &[h(1), h(2)]);
        pl.on_header(101, hdr.clone());
        // h(9) is XOR-independent of {h(1), h(2)}, so the digests differ
        let err = pl
            .on_fill_in(101, hdr, vec![tr(101, h(9))])
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerLinkError::InconsistentLedger { ledger_index: 101, .. }
        ));
        assert_eq!(pl.status_of(101), Some(LedgerStatus::Failed));
        assert!(!pl.is_cleared(101));
        // unrecoverable: later closes never pick it again
        assert!(!pl.on_ledger_closed(103, 0, 1).contains(&101));
        assert!(!pl.on_ledger_closed(104, 0, 1).contains(&101));
    }

    #[test]
    fn parked_ledger_ignores_fetch_failed() {
        let mut pl = PendingLedgers::new();
        pl.on_ledger_closed(101, 2, 1);
        pl.on_ledger_closed(102, 0, 1);
        let hdr = header(101, &[h(1), h(2)]);
        pl.on_header(101, hdr.clone());
        let _ = pl.on_fill_in(101, hdr, vec![tr(101, h(9))]);
        pl.fetch_failed(101);
        assert_eq!(pl.status_of(101), Some(LedgerStatus::Failed));
    }

    #[test]
    fn cleared_gaps_reopen_as_pending_ledgers() {
        let mut pl = PendingLedgers::new();
        // clear 100 and 102 out of order, leaving 101 as a gap
        pl.on_ledger_closed(100, 0, 1);
        pl.on_ledger_closed(102, 0, 1);
        pl.on_header(100, header(100, &[]));
        pl.on_ledger_closed(103, 0, 1); // picks 102
        pl.on_header(102, header(102, &[]));
        // next close discovers the 101 gap and fetches it
        let picks = pl.on_ledger_closed(104, 0, 1);
        assert!(picks.contains(&101), "picks: {picks:?}");
        pl.on_header(101, header(101, &[]));
        assert!(pl.is_cleared(101));
    }

    #[test]
    fn late_transaction_for_cleared_ledger_is_dropped() {
        let mut pl = PendingLedgers::new();
        pl.on_ledger_closed(100, 1, 1);
        pl.ingest(&tr(100, h(1)));
        pl.on_header(100, header(100, &[h(1)]));
        let outcome = pl.ingest(&tr(100, h(1)));
        assert!(!outcome.deliver);
        assert!(outcome.check_header.is_none());
    }

    #[test]
    #[should_panic(expected = "refusing to re-open")]
    fn closing_an_absorbed_ledger_panics() {
        let mut pl = PendingLedgers::new();
        pl.on_ledger_closed(100, 0, 1);
        pl.on_ledger_closed(101, 0, 1);
        pl.on_header(100, header(100, &[]));
        pl.on_header(101, header(101, &[]));
        // both cleared and compacted; a close below the floor is a bug
        pl.on_ledger_closed(99, 0, 1);
    }
}
