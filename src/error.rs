use thiserror::Error;

use crate::wire::Hash256;

/// Errors surfaced by ledger-link.
#[derive(Error, Debug)]
pub enum LedgerLinkError {
    /// Invalid client configuration (bad endpoint URL, zero timeout, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The transport layer failed (socket error, handshake failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// `connect` was called while a connection is already up.
    #[error("already connected")]
    AlreadyConnected,

    /// An operation that requires a live connection ran without one.
    #[error("not connected")]
    NotConnected,

    /// A wire message or payload could not be encoded/decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server answered a request with an RPC-level error.
    #[error("rpc error {code}: {message}")]
    Rpc { code: String, message: String },

    /// A typed response was missing a field the caller relies on.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A filled-in ledger's transaction set does not hash to the header's
    /// transaction hash. The affected ledger is parked and never refetched.
    #[error("ledger {ledger_index} inconsistent: header txn hash {expected}, computed {computed}")]
    InconsistentLedger {
        ledger_index: u64,
        expected: Hash256,
        computed: Hash256,
    },

    /// The account root has not been fetched yet, so no sequence is known.
    #[error("account {0} not primed")]
    AccountNotPrimed(String),

    /// The client task loop is gone (client disposed).
    #[error("client disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, LedgerLinkError>;
