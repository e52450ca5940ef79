//! Compacted set of fully reconciled ledger indices.

use std::collections::BTreeSet;

/// Tracks which ledger indices have been cleared (every transaction
/// accounted for). Contiguous history is compacted into a floor: once no
/// gaps remain, "everything below X" replaces the explicit set.
#[derive(Debug, Default, Clone)]
pub struct ClearedLedgersSet {
    /// Every index below this is cleared and absorbed.
    floor: u64,
    cleared: BTreeSet<u64>,
}

impl ClearedLedgersSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, ledger_index: u64) -> bool {
        ledger_index < self.floor || self.cleared.contains(&ledger_index)
    }

    /// Marks a ledger cleared.
    ///
    /// Panics if the index was already absorbed into the floor: clearing it
    /// again means some component re-created history that was already
    /// reconciled, which is a programming error.
    pub fn clear(&mut self, ledger_index: u64) {
        assert!(
            ledger_index >= self.floor,
            "ledger {ledger_index} already cleared and compacted (floor {})",
            self.floor
        );
        self.cleared.insert(ledger_index);
    }

    /// Uncleared indices between the tracking start and the highest cleared
    /// index. Empty when nothing or everything in range is cleared.
    pub fn gaps(&self) -> Vec<u64> {
        let (Some(&max), start) = (self.cleared.last(), self.range_start()) else {
            return Vec::new();
        };
        (start..max).filter(|i| !self.contains(*i)).collect()
    }

    fn range_start(&self) -> u64 {
        if self.floor > 0 {
            self.floor
        } else {
            self.cleared.first().copied().unwrap_or(0)
        }
    }

    /// Compacts the explicit set into the floor if no gaps remain.
    pub fn compact_if_contiguous(&mut self) {
        if let Some(&max) = self.cleared.last() {
            if self.gaps().is_empty() {
                self.floor = max + 1;
                self.cleared.clear();
            }
        }
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }
}
