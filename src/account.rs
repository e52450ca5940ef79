//! Tracked account state and the signing boundary.

use serde_json::{Map, Value};

use crate::wire::{self, AccountId, Hash256, TransactionResult};

/// A signed transaction ready for `submit`.
#[derive(Debug, Clone)]
pub struct SignedTxn {
    /// Hex blob for the `tx_blob` field.
    pub blob: String,
    /// The transaction hash the server will report for it.
    pub hash: Hash256,
}

/// Serialization-and-signing boundary. The canonical binary format lives
/// outside this crate; implementations must produce a deterministic hash so
/// validated-stream transactions can be matched back to submissions.
pub trait TxSigner: Send + Sync + 'static {
    fn sign(&self, tx_json: &Map<String, Value>) -> SignedTxn;
}

/// Owned projection of one account's on-ledger root entry.
///
/// Only the client loop writes it: from the initial `ledger_entry` fetch and
/// from validated transactions initiated by the account.
#[derive(Debug, Clone)]
pub struct TrackedAccountRoot {
    account: AccountId,
    sequence: Option<u32>,
    balance: Option<u64>,
    unfunded: bool,
}

impl TrackedAccountRoot {
    pub fn new(account: AccountId) -> Self {
        TrackedAccountRoot {
            account,
            sequence: None,
            balance: None,
            unfunded: false,
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Whether a sequence is known, i.e. transactions can be assigned one.
    pub fn primed(&self) -> bool {
        self.sequence.is_some()
    }

    pub fn sequence(&self) -> Option<u32> {
        self.sequence
    }

    pub fn balance(&self) -> Option<u64> {
        self.balance
    }

    pub fn is_unfunded(&self) -> bool {
        self.unfunded
    }

    /// Folds in the `node` object of a `ledger_entry account_root` result.
    pub fn set_from_json(&mut self, node: &Value) {
        if let Some(seq) = wire::get_u32(node, "Sequence") {
            self.sequence = Some(seq);
        }
        if let Some(balance) = wire::get_u64(node, "Balance") {
            self.balance = Some(balance);
        }
        self.unfunded = false;
    }

    /// Marks the account as not yet existing on ledger. Sequence 1 is what
    /// the first transaction will carry once the account is funded.
    pub fn set_unfunded(&mut self) {
        self.unfunded = true;
        self.sequence = Some(1);
        self.balance = Some(0);
    }

    /// Advances the cached sequence past a validated transaction initiated
    /// by this account.
    pub fn update_from_transaction(&mut self, tr: &TransactionResult) {
        if !tr.validated || tr.account.as_ref() != Some(&self.account) {
            return;
        }
        if let Some(seq) = tr.sequence {
            let next = seq.saturating_add(1);
            if self.sequence.map_or(true, |cur| next > cur) {
                self.sequence = Some(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tr(account: &str, sequence: u32, validated: bool) -> TransactionResult {
        TransactionResult {
            validated,
            hash: Hash256::ZERO,
            ledger_index: 1,
            account: Some(AccountId::from(account)),
            sequence: Some(sequence),
            engine_result: None,
            raw: Value::Null,
        }
    }

    #[test]
    fn primes_from_ledger_entry_node() {
        let mut root = TrackedAccountRoot::new(AccountId::from("rAlice"));
        assert!(!root.primed());
        root.set_from_json(&json!({"Sequence": 42, "Balance": "1000"}));
        assert!(root.primed());
        assert_eq!(root.sequence(), Some(42));
        assert_eq!(root.balance(), Some(1000));
    }

    #[test]
    fn unfunded_account_primes_at_sequence_one() {
        let mut root = TrackedAccountRoot::new(AccountId::from("rAlice"));
        root.set_unfunded();
        assert!(root.primed());
        assert!(root.is_unfunded());
        assert_eq!(root.sequence(), Some(1));
    }

    #[test]
    fn validated_transactions_only_advance_sequence() {
        let mut root = TrackedAccountRoot::new(AccountId::from("rAlice"));
        root.set_from_json(&json!({"Sequence": 10}));
        root.update_from_transaction(&tr("rAlice", 10, true));
        assert_eq!(root.sequence(), Some(11));
        // stale, unvalidated and foreign transactions are ignored
        root.update_from_transaction(&tr("rAlice", 4, true));
        root.update_from_transaction(&tr("rAlice", 20, false));
        root.update_from_transaction(&tr("rBob", 30, true));
        assert_eq!(root.sequence(), Some(11));
    }
}
