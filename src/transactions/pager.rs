//! Forward-paginated `account_tx` requests for reconciliation sweeps.

use serde_json::{Map, Value};

use crate::wire::{self, AccountId, TransactionResult};

/// One parsed page of an `account_tx` result.
#[derive(Debug)]
pub struct Page {
    pub txns: Vec<TransactionResult>,
    /// A continuation marker was present; request the next page.
    pub has_more: bool,
    /// Upper bound of the ledger range the server actually covered.
    pub ledger_index_max: Option<u64>,
}

/// Walks an account's validated transaction history forward from a start
/// ledger, carrying the server's opaque continuation marker between pages.
/// One pager at most is live per transaction manager; an abandoned run is
/// simply dropped and late pages are filtered by run id.
#[derive(Debug)]
pub struct AccountTxPager {
    account: AccountId,
    run_id: u64,
    ledger_index_min: i64,
    marker: Option<Value>,
}

impl AccountTxPager {
    pub fn new(account: AccountId, run_id: u64, ledger_index_min: i64) -> Self {
        AccountTxPager {
            account,
            run_id,
            ledger_index_min,
            marker: None,
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// The payload for the next page request.
    pub fn request_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("account".to_owned(), Value::from(self.account.as_str()));
        payload.insert(
            "ledger_index_min".to_owned(),
            Value::from(self.ledger_index_min),
        );
        payload.insert("ledger_index_max".to_owned(), Value::from(-1));
        payload.insert("forward".to_owned(), Value::from(true));
        if let Some(marker) = &self.marker {
            payload.insert("marker".to_owned(), marker.clone());
        }
        payload
    }

    /// Parses one result and stores the continuation marker, if any.
    pub fn apply_page(&mut self, result: &Value) -> Page {
        self.marker = result
            .get("marker")
            .filter(|m| !m.is_null())
            .cloned();
        let txns = result
            .get("transactions")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(TransactionResult::from_account_tx)
                    .collect()
            })
            .unwrap_or_default();
        Page {
            txns,
            has_more: self.marker.is_some(),
            ledger_index_max: wire::get_u64(result, "ledger_index_max"),
        }
    }
}
