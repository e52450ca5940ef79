//! Tracked projection of the server's advertised state.

use serde_json::Value;

use crate::wire::{self, Hash256};

/// Fields accumulated from `serverStatus` / `ledgerClosed` stream messages
/// and from subscribe results. Absent fields keep their previous value, so
/// the projection converges as messages arrive.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    updated: bool,
    pub ledger_index: u64,
    pub ledger_hash: Option<Hash256>,
    pub ledger_time: u64,
    pub txn_count: u32,
    pub fee_base: u64,
    pub fee_ref: u64,
    pub load_base: u64,
    pub load_factor: u64,
    pub reserve_base: u64,
    pub reserve_inc: u64,
    pub server_status: Option<String>,
}

impl ServerInfo {
    /// Folds one stream message or subscribe result into the projection.
    pub fn update(&mut self, msg: &Value) {
        self.updated = true;
        if let Some(v) = wire::get_u64(msg, "ledger_index") {
            self.ledger_index = v;
        }
        if let Some(s) = msg.get("ledger_hash").and_then(Value::as_str) {
            if let Ok(h) = Hash256::from_hex(s) {
                self.ledger_hash = Some(h);
            }
        }
        if let Some(v) = wire::get_u64(msg, "ledger_time") {
            self.ledger_time = v;
        }
        if let Some(v) = wire::get_u32(msg, "txn_count") {
            self.txn_count = v;
        }
        if let Some(v) = wire::get_u64(msg, "fee_base") {
            self.fee_base = v;
        }
        if let Some(v) = wire::get_u64(msg, "fee_ref") {
            self.fee_ref = v;
        }
        if let Some(v) = wire::get_u64(msg, "load_base") {
            self.load_base = v;
        }
        if let Some(v) = wire::get_u64(msg, "load_factor") {
            self.load_factor = v;
        }
        if let Some(v) = wire::get_u64(msg, "reserve_base") {
            self.reserve_base = v;
        }
        if let Some(v) = wire::get_u64(msg, "reserve_inc") {
            self.reserve_inc = v;
        }
        if let Some(s) = msg.get("server_status").and_then(Value::as_str) {
            self.server_status = Some(s.to_owned());
        }
    }

    /// Whether any server state has been observed yet.
    pub fn primed(&self) -> bool {
        self.updated
    }

    /// Whether fee computation inputs have arrived.
    pub fn has_fee_data(&self) -> bool {
        self.fee_base > 0 && self.load_base > 0
    }

    /// Base fee scaled by the current load factor.
    pub fn transaction_fee(&self) -> u64 {
        if self.load_base == 0 {
            return self.fee_base;
        }
        self.fee_base.saturating_mul(self.load_factor) / self.load_base
    }

    pub fn load_below(&self, max: u64) -> bool {
        self.load_factor < max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn starts_unprimed() {
        let info = ServerInfo::default();
        assert!(!info.primed());
        assert!(!info.has_fee_data());
    }

    #[test]
    fn updates_converge_across_messages() {
        let mut info = ServerInfo::default();
        info.update(&json!({"load_base": 256, "load_factor": 256, "server_status": "full"}));
        info.update(&json!({"ledger_index": 88, "txn_count": 3, "fee_base": 10, "fee_ref": 10}));
        assert!(info.primed());
        assert_eq!(info.ledger_index, 88);
        assert_eq!(info.load_base, 256);
        assert_eq!(info.server_status.as_deref(), Some("full"));
    }

    #[test]
    fn fee_scales_with_load() {
        let mut info = ServerInfo::default();
        info.update(&json!({"fee_base": 10, "load_base": 256, "load_factor": 256}));
        assert_eq!(info.transaction_fee(), 10);
        info.update(&json!({"load_factor": 1024}));
        assert_eq!(info.transaction_fee(), 40);
        assert!(info.load_below(768_000));
    }
}
