//! Desired subscription state, re-issued as one combined request on every
//! reconnect. There is no unsubscribe in the protocol; the sets only grow.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::wire::AccountId;

/// Server-side event streams the client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stream {
    Server,
    Ledger,
    Transactions,
    Validations,
}

impl Stream {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Stream::Server => "server",
            Stream::Ledger => "ledger",
            Stream::Transactions => "transactions",
            Stream::Validations => "validations",
        }
    }
}

/// The full set of streams and accounts the client wants subscribed.
#[derive(Debug, Default, Clone)]
pub struct Subscriptions {
    streams: BTreeSet<Stream>,
    accounts: BTreeSet<AccountId>,
}

impl Subscriptions {
    /// Returns true if the stream was not yet tracked.
    pub fn add_stream(&mut self, stream: Stream) -> bool {
        self.streams.insert(stream)
    }

    /// Returns true if the account was not yet tracked.
    pub fn add_account(&mut self, account: AccountId) -> bool {
        self.accounts.insert(account)
    }

    pub fn has_stream(&self, stream: Stream) -> bool {
        self.streams.contains(&stream)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.accounts.is_empty()
    }

    /// Payload subscribing to everything tracked, for (re)connects.
    pub fn combined_payload(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        if !self.streams.is_empty() {
            obj.insert(
                "streams".to_owned(),
                Value::from(
                    self.streams
                        .iter()
                        .map(|s| s.wire_name())
                        .collect::<Vec<_>>(),
                ),
            );
        }
        if !self.accounts.is_empty() {
            obj.insert(
                "accounts".to_owned(),
                Value::from(
                    self.accounts
                        .iter()
                        .map(|a| a.as_str())
                        .collect::<Vec<_>>(),
                ),
            );
        }
        obj
    }

    /// Payload for an incremental subscribe of newly added items.
    pub fn incremental_payload(streams: &[Stream], accounts: &[AccountId]) -> Map<String, Value> {
        let mut obj = Map::new();
        if !streams.is_empty() {
            obj.insert(
                "streams".to_owned(),
                Value::from(streams.iter().map(|s| s.wire_name()).collect::<Vec<_>>()),
            );
        }
        if !accounts.is_empty() {
            obj.insert(
                "accounts".to_owned(),
                Value::from(accounts.iter().map(|a| a.as_str()).collect::<Vec<_>>()),
            );
        }
        obj
    }
}
