//! Wire-level types: message classification and typed views over the JSON
//! payloads the server pushes.
//!
//! Incoming messages are kept as `serde_json::Value` and viewed through
//! small extractor types rather than fully deserialized; the protocol has a
//! long tail of fields the client never reads.

use std::fmt;

use serde_json::Value;

use crate::engine_result::EngineResult;
use crate::error::{LedgerLinkError, Result};

/// A 256-bit hash, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        // Work on raw bytes; the input is untrusted and slicing a string at
        // fixed offsets panics on multi-byte characters.
        let bytes = s.trim().as_bytes();
        if bytes.len() != 64 {
            return Err(LedgerLinkError::MalformedResponse(format!(
                "hash must be 64 hex chars, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        for (byte, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
            match (hex_nibble(pair[0]), hex_nibble(pair[1])) {
                (Some(hi), Some(lo)) => *byte = hi << 4 | lo,
                _ => {
                    return Err(LedgerLinkError::MalformedResponse(
                        "invalid hex in hash".into(),
                    ))
                }
            }
        }
        Ok(Hash256(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// In-place XOR; used by the order-independent transaction-set digest.
    pub fn xor_with(&mut self, other: &Hash256) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

/// A ledger account identifier in its address encoding.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(address: impl Into<String>) -> Self {
        AccountId(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        AccountId(s.to_owned())
    }
}

/// The `type` discriminator on server-pushed messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    ServerStatus,
    LedgerClosed,
    Response,
    Transaction,
    PathFind,
    ValidationReceived,
    Error,
    Unknown(String),
}

/// Classifies an incoming message by its `type` field.
pub fn classify(msg: &Value) -> MessageType {
    match msg.get("type").and_then(Value::as_str) {
        Some("serverStatus") => MessageType::ServerStatus,
        Some("ledgerClosed") => MessageType::LedgerClosed,
        Some("response") => MessageType::Response,
        Some("transaction") => MessageType::Transaction,
        Some("path_find") => MessageType::PathFind,
        Some("validationReceived") => MessageType::ValidationReceived,
        Some("error") => MessageType::Error,
        Some(other) => MessageType::Unknown(other.to_owned()),
        None => MessageType::Unknown(String::new()),
    }
}

/// Reads a field that some servers send as a number and others as a string.
pub(crate) fn field_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn get_u64(obj: &Value, key: &str) -> Option<u64> {
    obj.get(key).and_then(field_u64)
}

pub(crate) fn get_u32(obj: &Value, key: &str) -> Option<u32> {
    get_u64(obj, key).and_then(|n| u32::try_from(n).ok())
}

fn get_hash(obj: &Value, key: &str) -> Option<Hash256> {
    obj.get(key)
        .and_then(Value::as_str)
        .and_then(|s| Hash256::from_hex(s).ok())
}

/// A transaction as reported by the server, from any of the three sources
/// the client consumes: the `transactions` stream, an `account_tx` page, or
/// an expanded ledger fetch.
#[derive(Clone, Debug)]
pub struct TransactionResult {
    pub validated: bool,
    pub hash: Hash256,
    pub ledger_index: u64,
    pub account: Option<AccountId>,
    pub sequence: Option<u32>,
    pub engine_result: Option<EngineResult>,
    pub raw: Value,
}

impl TransactionResult {
    /// View over a `transactions` stream message.
    pub fn from_stream(msg: &Value) -> Option<Self> {
        let tx = msg.get("transaction")?;
        Some(TransactionResult {
            validated: msg.get("validated").and_then(Value::as_bool).unwrap_or(false),
            hash: get_hash(tx, "hash")?,
            ledger_index: get_u64(msg, "ledger_index")?,
            account: tx
                .get("Account")
                .and_then(Value::as_str)
                .map(AccountId::from),
            sequence: get_u32(tx, "Sequence"),
            engine_result: msg
                .get("engine_result")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
            raw: msg.clone(),
        })
    }

    /// View over one entry of an `account_tx` result page.
    pub fn from_account_tx(entry: &Value) -> Option<Self> {
        let tx = entry.get("tx")?;
        let meta = entry.get("meta");
        Some(TransactionResult {
            validated: entry
                .get("validated")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            hash: get_hash(tx, "hash")?,
            ledger_index: get_u64(tx, "ledger_index")?,
            account: tx
                .get("Account")
                .and_then(Value::as_str)
                .map(AccountId::from),
            sequence: get_u32(tx, "Sequence"),
            engine_result: meta
                .and_then(|m| m.get("TransactionResult"))
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
            raw: entry.clone(),
        })
    }

    /// View over one transaction of an expanded ledger fetch. Such
    /// transactions are validated by construction.
    pub fn from_expanded(ledger_index: u64, tx: &Value) -> Option<Self> {
        Some(TransactionResult {
            validated: true,
            hash: get_hash(tx, "hash")?,
            ledger_index,
            account: tx
                .get("Account")
                .and_then(Value::as_str)
                .map(AccountId::from),
            sequence: get_u32(tx, "Sequence"),
            engine_result: tx
                .get("metaData")
                .and_then(|m| m.get("TransactionResult"))
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
            raw: tx.clone(),
        })
    }
}

/// The header fields of a fetched ledger the reconciler compares against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerHeader {
    pub ledger_index: u64,
    pub transaction_hash: Hash256,
    pub ledger_hash: Option<Hash256>,
}

impl LedgerHeader {
    /// Parses the `ledger` object of a `ledger` command result.
    pub fn from_ledger_result(result: &Value) -> Result<Self> {
        let ledger = result
            .get("ledger")
            .ok_or_else(|| LedgerLinkError::MalformedResponse("missing ledger".into()))?;
        let ledger_index = get_u64(ledger, "ledger_index")
            .ok_or_else(|| LedgerLinkError::MalformedResponse("missing ledger_index".into()))?;
        let transaction_hash = ledger
            .get("transaction_hash")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LedgerLinkError::MalformedResponse("missing transaction_hash".into())
            })
            .and_then(Hash256::from_hex)?;
        Ok(LedgerHeader {
            ledger_index,
            transaction_hash,
            ledger_hash: get_hash(ledger, "ledger_hash"),
        })
    }
}
