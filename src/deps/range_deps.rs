// Range-domain dependency map.

use serde::{Deserialize, Serialize};

use crate::routables::{Ranges, RoutingKey};
use crate::time::TxnId;

/// Dependencies on range transactions: for each depended-on transaction, the
/// ranges through which the dependency was witnessed. Sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDeps {
    entries: Vec<(TxnId, Ranges)>,
}

impl RangeDeps {
    pub const EMPTY: RangeDeps = RangeDeps {
        entries: Vec::new(),
    };

    pub fn add(&mut self, txn_id: TxnId, ranges: Ranges) {
        match self.entries.binary_search_by_key(&txn_id, |(id, _)| *id) {
            Ok(pos) => {
                let merged = self.entries[pos].1.union(&ranges);
                self.entries[pos].1 = merged;
            }
            Err(pos) => self.entries.insert(pos, (txn_id, ranges)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.entries
            .binary_search_by_key(&txn_id, |(id, _)| *id)
            .is_ok()
    }

    pub fn txn_ids(&self) -> Vec<TxnId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn ranges_for(&self, txn_id: TxnId) -> Option<&Ranges> {
        self.entries
            .binary_search_by_key(&txn_id, |(id, _)| *id)
            .ok()
            .map(|pos| &self.entries[pos].1)
    }

    /// Transactions whose ranges cover `key`.
    pub fn intersecting(&self, key: &RoutingKey) -> Vec<TxnId> {
        self.entries
            .iter()
            .filter(|(_, r)| r.contains(key))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn union(&self, other: &RangeDeps) -> RangeDeps {
        let mut out = self.clone();
        for (id, ranges) in &other.entries {
            out.add(*id, ranges.clone());
        }
        out
    }

    pub fn without_if(&self, mut drop: impl FnMut(TxnId) -> bool) -> RangeDeps {
        RangeDeps {
            entries: self
                .entries
                .iter()
                .filter(|(id, _)| !drop(*id))
                .cloned()
                .collect(),
        }
    }

    /// Restrict every entry to `ranges`, dropping entries left empty.
    pub fn slice(&self, ranges: &Ranges) -> RangeDeps {
        RangeDeps {
            entries: self
                .entries
                .iter()
                .filter_map(|(id, r)| {
                    let cut = r.intersect(ranges);
                    if cut.is_empty() {
                        None
                    } else {
                        Some((*id, cut))
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routables::KeyRange;
    use crate::time::{KeyDomain, NodeId, TxnKind};

    fn sync_txn(hlc: u64) -> TxnId {
        TxnId::new(1, hlc, TxnKind::SyncPoint, KeyDomain::Range, NodeId(1))
    }

    fn ranges(a: &str, b: &str) -> Ranges {
        Ranges::single(KeyRange::new(RoutingKey::from(a), RoutingKey::from(b)))
    }

    #[test]
    fn test_add_merges_ranges_for_same_txn() {
        let mut rd = RangeDeps::default();
        rd.add(sync_txn(1), ranges("a", "c"));
        rd.add(sync_txn(1), ranges("c", "e"));
        assert_eq!(rd.len(), 1);
        assert!(rd.ranges_for(sync_txn(1)).unwrap().contains(&RoutingKey::from("d")));
    }

    #[test]
    fn test_intersecting_key() {
        let mut rd = RangeDeps::default();
        rd.add(sync_txn(1), ranges("a", "c"));
        rd.add(sync_txn(2), ranges("b", "z"));
        assert_eq!(rd.intersecting(&RoutingKey::from("b")), vec![sync_txn(1), sync_txn(2)]);
        assert_eq!(rd.intersecting(&RoutingKey::from("x")), vec![sync_txn(2)]);
    }

    #[test]
    fn test_slice_drops_empty_entries() {
        let mut rd = RangeDeps::default();
        rd.add(sync_txn(1), ranges("a", "c"));
        rd.add(sync_txn(2), ranges("x", "z"));
        let sliced = rd.slice(&ranges("a", "d"));
        assert!(sliced.contains(sync_txn(1)));
        assert!(!sliced.contains(sync_txn(2)));
    }
}
