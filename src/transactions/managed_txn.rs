//! One transaction under management: payload, submission history, wait
//! state, and its listeners.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::events::{ListenerToken, Listeners};
use crate::request::{RequestId, Response};
use crate::wire::{AccountId, Hash256, TransactionResult};

/// Identifies a managed transaction within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(pub(crate) u64);

/// Lifecycle notifications for a managed transaction.
#[derive(Debug)]
pub enum TxnEvent {
    /// A submission came back `tesSUCCESS`; not final yet.
    SubmitSuccess { response: Response },
    /// Every submission expired and the last one failed at the RPC level.
    SubmitError { response: Response },
    /// Every submission expired and the last one failed at the engine level.
    SubmitFailure { response: Response },
    /// The transaction appeared in a validated ledger. Terminal.
    Validated { result: TransactionResult },
}

/// One wire submission of the transaction.
#[derive(Debug, Clone)]
pub struct Submission {
    pub request_id: RequestId,
    pub sequence: u32,
    /// Hash of the signed blob as submitted.
    pub hash: Hash256,
    /// Ledger index current when the submission was made.
    pub ledger_index: u64,
    /// Ledger index after which this submission can no longer apply.
    pub last_ledger_sequence: u32,
    pub fee: u64,
}

/// What a queued transaction is waiting for, if anything. Consumed by the
/// manager's dispatchers; at most one wait is armed per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnWait {
    None,
    /// Submission deferred until the client can submit again. Stale once
    /// more submissions happened in the meantime.
    UntilCanSubmit {
        sequence: u32,
        submissions_at_defer: usize,
    },
    /// Our sequence was reported consumed; resubmit under a fresh sequence
    /// once its validation is actually observed.
    SequenceConsumed,
    /// terPRE_SEQ: resubmit with the same sequence once the validated
    /// stream reaches it.
    SequenceReached { sequence: u32 },
}

/// A transaction owned by a [`crate::transactions::TransactionManager`].
pub struct ManagedTxn {
    pub(crate) id: TxnId,
    tx_json: Map<String, Value>,
    sequence: Option<u32>,
    submissions: Vec<Submission>,
    submitted_hashes: BTreeSet<Hash256>,
    finalized: bool,
    sequence_plug: bool,
    pub(crate) wait: TxnWait,
    pub(crate) last_response: Option<Response>,
    listeners: Listeners<TxnEvent>,
}

impl ManagedTxn {
    pub(crate) fn new(id: TxnId, account: &AccountId, mut tx_json: Map<String, Value>) -> Self {
        tx_json.insert("Account".to_owned(), Value::from(account.as_str()));
        ManagedTxn {
            id,
            tx_json,
            sequence: None,
            submissions: Vec::new(),
            submitted_hashes: BTreeSet::new(),
            finalized: false,
            sequence_plug: false,
            wait: TxnWait::None,
            last_response: None,
            listeners: Listeners::default(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Registers a lifecycle listener. Attach before queueing; events can
    /// start flowing as soon as the transaction is queued.
    pub fn on_event(&mut self, cb: impl FnMut(&TxnEvent) + Send + 'static) -> ListenerToken {
        self.listeners.on(cb)
    }

    pub(crate) fn emit(&mut self, event: &TxnEvent) {
        self.listeners.emit(event);
    }

    pub fn sequence(&self) -> Option<u32> {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u32) {
        self.sequence = Some(sequence);
    }

    pub fn transaction_type(&self) -> Option<&str> {
        self.tx_json.get("TransactionType").and_then(Value::as_str)
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    pub fn last_submission(&self) -> Option<&Submission> {
        self.submissions.last()
    }

    pub(crate) fn note_submission(&mut self, submission: Submission) {
        self.submitted_hashes.insert(submission.hash);
        self.submissions.push(submission);
    }

    pub fn was_submitted_with(&self, hash: &Hash256) -> bool {
        self.submitted_hashes.contains(hash)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub(crate) fn finalize(&mut self) {
        self.finalized = true;
        self.wait = TxnWait::None;
    }

    pub fn is_sequence_plug(&self) -> bool {
        self.sequence_plug
    }

    pub(crate) fn set_sequence_plug(&mut self) {
        self.sequence_plug = true;
    }

    /// A response belongs to the latest submission or it is ignored;
    /// earlier submissions were superseded.
    pub(crate) fn response_is_stale(&self, request_id: RequestId) -> bool {
        self.finalized
            || self
                .last_submission()
                .map(|s| s.request_id)
                != Some(request_id)
    }

    /// The payload for one submission attempt, with the fields the manager
    /// controls filled in.
    pub(crate) fn prepared_json(
        &self,
        sequence: u32,
        fee: u64,
        last_ledger_sequence: u32,
    ) -> Map<String, Value> {
        let mut prepared = self.tx_json.clone();
        prepared.insert("Sequence".to_owned(), Value::from(sequence));
        prepared.insert("Fee".to_owned(), Value::from(fee.to_string()));
        prepared.insert(
            "LastLedgerSequence".to_owned(),
            Value::from(last_ledger_sequence),
        );
        prepared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn h(n: u8) -> Hash256 {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        Hash256::from_bytes(bytes)
    }

    fn submission(request_id: RequestId, n: u8) -> Submission {
        Submission {
            request_id,
            sequence: 1,
            hash: h(n),
            ledger_index: 10,
            last_ledger_sequence: 18,
            fee: 12,
        }
    }

    fn txn() -> ManagedTxn {
        let json = json!({"TransactionType": "Payment", "Destination": "rBob"});
        let Value::Object(map) = json else { unreachable!() };
        ManagedTxn::new(TxnId(1), &AccountId::from("rAlice"), map)
    }

    #[test]
    fn tracks_submitted_hashes() {
        let mut t = txn();
        t.note_submission(submission(5, 1));
        t.note_submission(submission(6, 2));
        assert!(t.was_submitted_with(&h(1)));
        assert!(t.was_submitted_with(&h(2)));
        assert!(!t.was_submitted_with(&h(3)));
        assert_eq!(t.last_submission().map(|s| s.request_id), Some(6));
    }

    #[test]
    fn stale_responses_are_detected() {
        let mut t = txn();
        t.note_submission(submission(5, 1));
        t.note_submission(submission(6, 2));
        assert!(t.response_is_stale(5));
        assert!(!t.response_is_stale(6));
        t.finalize();
        assert!(t.response_is_stale(6));
    }

    #[test]
    fn prepared_json_fills_managed_fields() {
        let t = txn();
        let prepared = t.prepared_json(7, 12, 108);
        assert_eq!(prepared["Account"], "rAlice");
        assert_eq!(prepared["Sequence"], 7);
        assert_eq!(prepared["Fee"], "12");
        assert_eq!(prepared["LastLedgerSequence"], 108);
        assert_eq!(prepared["TransactionType"], "Payment");
    }
}
