// DurableBefore: per-range durability watermarks.

use serde::{Deserialize, Serialize};

use crate::command::Durability;
use crate::routables::{KeyRange, Ranges, RoutingKey};
use crate::time::TxnId;

/// Durability watermarks for one range: ids strictly below `majority_before`
/// are durable on a majority of every shard; below `universal_before`, on
/// every replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableEntry {
    pub majority_before: TxnId,
    pub universal_before: TxnId,
}

impl DurableEntry {
    pub fn new(majority_before: TxnId, universal_before: TxnId) -> Self {
        debug_assert!(universal_before <= majority_before);
        Self {
            majority_before,
            universal_before,
        }
    }

    fn merge(&self, other: &DurableEntry) -> DurableEntry {
        DurableEntry {
            majority_before: self.majority_before.max(other.majority_before),
            universal_before: self.universal_before.max(other.universal_before),
        }
    }

    fn durability(&self, txn_id: TxnId) -> Durability {
        if txn_id < self.universal_before {
            Durability::Universal
        } else if txn_id < self.majority_before {
            Durability::Majority
        } else {
            Durability::NotDurable
        }
    }
}

/// Interval map of durability watermarks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableBefore {
    entries: Vec<(KeyRange, DurableEntry)>,
}

impl DurableBefore {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(KeyRange, DurableEntry)> {
        self.entries.iter()
    }

    fn entry_covering(&self, key: &RoutingKey) -> Option<&DurableEntry> {
        self.entries
            .iter()
            .find(|(r, _)| r.contains(key))
            .map(|(_, e)| e)
    }

    pub fn merge_entry(&mut self, range: KeyRange, entry: DurableEntry) {
        let addition = DurableBefore {
            entries: vec![(range, entry)],
        };
        *self = DurableBefore::merge(self, &addition);
    }

    /// Pointwise-max merge; commutative and idempotent.
    pub fn merge(a: &DurableBefore, b: &DurableBefore) -> DurableBefore {
        if a.entries.is_empty() {
            return b.clone();
        }
        if b.entries.is_empty() {
            return a.clone();
        }
        let mut bounds: Vec<RoutingKey> = Vec::new();
        for (r, _) in a.entries.iter().chain(b.entries.iter()) {
            bounds.push(r.start().clone());
            bounds.push(r.end().clone());
        }
        bounds.sort();
        bounds.dedup();

        let mut out = Vec::new();
        for pair in bounds.windows(2) {
            let piece = KeyRange::new(pair[0].clone(), pair[1].clone());
            let merged = match (a.entry_covering(piece.start()), b.entry_covering(piece.start())) {
                (Some(x), Some(y)) => Some(x.merge(y)),
                (Some(x), None) | (None, Some(x)) => Some(x.clone()),
                (None, None) => None,
            };
            if let Some(entry) = merged {
                out.push((piece, entry));
            }
        }
        DurableBefore { entries: out }
    }

    /// The weakest durability of `txn_id` across the whole map: Universal
    /// only if every entry (and all uncovered space: there must be none)
    /// has it universally durable.
    pub fn min(&self, txn_id: TxnId) -> Durability {
        self.entries
            .iter()
            .map(|(_, e)| e.durability(txn_id))
            .min()
            .unwrap_or(Durability::NotDurable)
    }

    /// The weakest durability of `txn_id` across `ranges`. Uncovered space
    /// counts as not durable.
    pub fn min_over(&self, txn_id: TxnId, ranges: &Ranges) -> Durability {
        let mut out = Durability::Universal;
        for range in ranges.iter() {
            let mut covered = Ranges::EMPTY;
            for (wrange, entry) in &self.entries {
                if wrange.intersects(range) {
                    out = out.min(entry.durability(txn_id));
                    covered = covered.union(&Ranges::single(wrange.clone()));
                }
            }
            if !covered.covers(&Ranges::single(range.clone())) {
                return Durability::NotDurable;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{KeyDomain, NodeId, TxnKind};

    fn txn(hlc: u64) -> TxnId {
        TxnId::new(1, hlc, TxnKind::Write, KeyDomain::Key, NodeId(1))
    }

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new(RoutingKey::from(a), RoutingKey::from(b))
    }

    #[test]
    fn test_durability_thresholds() {
        let e = DurableEntry::new(txn(20), txn(10));
        assert_eq!(e.durability(txn(5)), Durability::Universal);
        assert_eq!(e.durability(txn(15)), Durability::Majority);
        assert_eq!(e.durability(txn(25)), Durability::NotDurable);
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let mut a = DurableBefore::default();
        a.merge_entry(range("a", "z"), DurableEntry::new(txn(20), txn(10)));
        let mut b = DurableBefore::default();
        b.merge_entry(range("a", "z"), DurableEntry::new(txn(30), txn(5)));

        let merged = DurableBefore::merge(&a, &b);
        assert_eq!(merged, DurableBefore::merge(&b, &a));
        assert_eq!(merged.min(txn(25)), Durability::Majority);
        assert_eq!(merged.min(txn(8)), Durability::Universal);
    }

    #[test]
    fn test_min_over_uncovered_is_not_durable() {
        let mut db = DurableBefore::default();
        db.merge_entry(range("a", "m"), DurableEntry::new(txn(20), txn(20)));
        assert_eq!(
            db.min_over(txn(5), &Ranges::single(range("a", "m"))),
            Durability::Universal
        );
        assert_eq!(
            db.min_over(txn(5), &Ranges::single(range("a", "z"))),
            Durability::NotDurable
        );
    }
}
