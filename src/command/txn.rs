// Transaction payloads: what is read, what is written, what comes back.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::routables::{Keys, Ranges, RouteParts, RoutingKeys};
use crate::time::{KeyDomain, TxnKind};

/// The write set of a transaction: full-value assignments applied at
/// `execute_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub writes: Vec<(crate::routables::Key, Bytes)>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn keys(&self) -> Keys {
        self.writes.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Restrict to the writes whose key routes into `ranges`.
    pub fn slice(&self, ranges: &Ranges) -> Update {
        Update {
            writes: self
                .writes
                .iter()
                .filter(|(k, _)| ranges.contains(&k.routing()))
                .cloned()
                .collect(),
        }
    }
}

/// Values returned by replica reads, keyed by user key. `None` records a
/// read of an absent key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub values: BTreeMap<crate::routables::Key, Option<Bytes>>,
}

impl Data {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn merge(&mut self, other: Data) {
        for (k, v) in other.values {
            self.values.entry(k).or_insert(v);
        }
    }
}

/// The body of a transaction as known to one participant view. Coverage
/// grows as messages supplement it; a view is complete for a set of ranges
/// when its scope covers them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialTxn {
    pub kind: TxnKind,
    /// Participating keys (key domain) or ranges (range domain).
    pub scope: RouteParts,
    /// Keys whose values the transaction reads.
    pub read: Keys,
    /// Writes, absent for reads and sync points.
    pub update: Option<Update>,
}

impl PartialTxn {
    pub fn domain(&self) -> KeyDomain {
        self.scope.domain()
    }

    /// Restrict to one store's or shard's view.
    pub fn slice(&self, ranges: &Ranges) -> PartialTxn {
        PartialTxn {
            kind: self.kind,
            scope: self.scope.intersecting(ranges),
            read: self.read.intersecting(ranges),
            update: self.update.as_ref().map(|u| u.slice(ranges)),
        }
    }

    /// Merge another view of the same transaction.
    pub fn merge(&self, other: &PartialTxn) -> PartialTxn {
        debug_assert_eq!(self.kind, other.kind);
        let update = match (&self.update, &other.update) {
            (Some(a), Some(b)) => {
                let mut writes = a.writes.clone();
                for w in &b.writes {
                    if !writes.contains(w) {
                        writes.push(w.clone());
                    }
                }
                writes.sort();
                Some(Update { writes })
            }
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        PartialTxn {
            kind: self.kind,
            scope: self.scope.union(&other.scope),
            read: self.read.union(&other.read),
            update,
        }
    }

    /// Whether this view covers `ranges`.
    pub fn covers(&self, ranges: &Ranges) -> bool {
        self.scope.to_ranges().covers(ranges)
    }
}

/// The system transaction template: a payload-free transaction used for
/// sync points and barriers.
pub fn empty_system_txn(kind: TxnKind, domain: KeyDomain) -> PartialTxn {
    debug_assert!(kind.is_sync_point() || kind == TxnKind::EphemeralRead);
    PartialTxn {
        kind,
        scope: match domain {
            KeyDomain::Key => RouteParts::Keys(RoutingKeys::EMPTY),
            KeyDomain::Range => RouteParts::Ranges(Ranges::EMPTY),
        },
        read: Keys::EMPTY,
        update: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routables::{Key, KeyRange, RoutingKey};

    fn write_txn(keys: &[&str]) -> PartialTxn {
        let parts: RoutingKeys = keys.iter().map(|k| RoutingKey::from(*k)).collect();
        PartialTxn {
            kind: TxnKind::Write,
            scope: RouteParts::Keys(parts),
            read: Keys::EMPTY,
            update: Some(Update {
                writes: keys
                    .iter()
                    .map(|k| (Key::from(*k), Bytes::from_static(b"v")))
                    .collect(),
            }),
        }
    }

    #[test]
    fn test_slice_then_merge_restores_coverage() {
        let txn = write_txn(&["a", "m", "x"]);
        let left = txn.slice(&Ranges::single(KeyRange::new(
            RoutingKey::from("a"),
            RoutingKey::from("n"),
        )));
        let right = txn.slice(&Ranges::single(KeyRange::new(
            RoutingKey::from("n"),
            RoutingKey::from("z"),
        )));
        let merged = left.merge(&right);
        assert_eq!(merged, txn);
    }

    #[test]
    fn test_empty_system_txn_has_no_payload() {
        let txn = empty_system_txn(TxnKind::SyncPoint, KeyDomain::Range);
        assert!(txn.update.is_none());
        assert!(txn.read.is_empty());
        assert_eq!(txn.domain(), KeyDomain::Range);
    }

    #[test]
    fn test_data_merge_prefers_first_value() {
        let mut a = Data::default();
        a.values.insert(Key::from("k"), Some(Bytes::from_static(b"1")));
        let mut b = Data::default();
        b.values.insert(Key::from("k"), Some(Bytes::from_static(b"2")));
        b.values.insert(Key::from("l"), None);
        a.merge(b);
        assert_eq!(a.values[&Key::from("k")], Some(Bytes::from_static(b"1")));
        assert!(a.values.contains_key(&Key::from("l")));
    }
}
