// The waiting-on set: dependencies gating Stable -> Applied.

use serde::{Deserialize, Serialize};

use crate::time::TxnId;

/// Bitset over the dependency ids a stable command must observe applied (or
/// excluded) before it may itself apply. Cross-store references are by id
/// value only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingOn {
    /// Sorted dependency ids.
    ids: Vec<TxnId>,
    /// One bit per id; set while still waiting.
    bits: Vec<u64>,
    pending: usize,
}

impl WaitingOn {
    pub fn new(mut ids: Vec<TxnId>) -> Self {
        ids.sort();
        ids.dedup();
        let words = ids.len().div_ceil(64);
        let mut bits = vec![u64::MAX; words];
        // Clear the unused tail of the last word.
        if let Some(last) = bits.last_mut() {
            let used = ids.len() % 64;
            if used != 0 {
                *last = (1u64 << used) - 1;
            }
        }
        let pending = ids.len();
        Self { ids, bits, pending }
    }

    pub fn empty() -> Self {
        WaitingOn::new(Vec::new())
    }

    pub fn is_done(&self) -> bool {
        self.pending == 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    fn index_of(&self, txn_id: TxnId) -> Option<usize> {
        self.ids.binary_search(&txn_id).ok()
    }

    pub fn is_waiting_on(&self, txn_id: TxnId) -> bool {
        match self.index_of(txn_id) {
            Some(i) => self.bits[i / 64] & (1 << (i % 64)) != 0,
            None => false,
        }
    }

    /// Clear a satisfied dependency. Returns true if it was pending.
    pub fn clear(&mut self, txn_id: TxnId) -> bool {
        let Some(i) = self.index_of(txn_id) else {
            return false;
        };
        let mask = 1u64 << (i % 64);
        if self.bits[i / 64] & mask == 0 {
            return false;
        }
        self.bits[i / 64] &= !mask;
        self.pending -= 1;
        true
    }

    /// Ids still being waited on.
    pub fn pending(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.ids
            .iter()
            .enumerate()
            .filter(|(i, _)| self.bits[i / 64] & (1 << (i % 64)) != 0)
            .map(|(_, id)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{KeyDomain, NodeId, TxnKind};

    fn txn(hlc: u64) -> TxnId {
        TxnId::new(1, hlc, TxnKind::Write, KeyDomain::Key, NodeId(1))
    }

    #[test]
    fn test_empty_is_done() {
        assert!(WaitingOn::empty().is_done());
    }

    #[test]
    fn test_clear_until_done() {
        let mut w = WaitingOn::new(vec![txn(3), txn(1), txn(2), txn(1)]);
        assert_eq!(w.pending_count(), 3);
        assert!(w.clear(txn(2)));
        assert!(!w.clear(txn(2)));
        assert!(!w.clear(txn(9)));
        assert!(w.clear(txn(1)));
        assert!(!w.is_done());
        assert!(w.clear(txn(3)));
        assert!(w.is_done());
    }

    #[test]
    fn test_pending_iterates_unsatisfied() {
        let mut w = WaitingOn::new(vec![txn(1), txn(2), txn(3)]);
        w.clear(txn(2));
        let pending: Vec<_> = w.pending().collect();
        assert_eq!(pending, vec![txn(1), txn(3)]);
    }

    #[test]
    fn test_large_set_crosses_word_boundary() {
        let ids: Vec<TxnId> = (1..=130).map(txn).collect();
        let mut w = WaitingOn::new(ids.clone());
        assert_eq!(w.pending_count(), 130);
        for id in &ids {
            assert!(w.is_waiting_on(*id));
            assert!(w.clear(*id));
        }
        assert!(w.is_done());
    }
}
