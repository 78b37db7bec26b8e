// Per-key dependency multimap.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::routables::{Ranges, RoutingKey};
use crate::time::TxnId;

/// Maps each routing key to the sorted set of transactions depended on at
/// that key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDeps {
    entries: BTreeMap<RoutingKey, Vec<TxnId>>,
}

impl KeyDeps {
    pub const EMPTY: KeyDeps = KeyDeps {
        entries: BTreeMap::new(),
    };

    pub fn add(&mut self, key: RoutingKey, txn_id: TxnId) {
        let ids = self.entries.entry(key).or_default();
        if let Err(pos) = ids.binary_search(&txn_id) {
            ids.insert(pos, txn_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RoutingKey> {
        self.entries.keys()
    }

    pub fn deps_on(&self, key: &RoutingKey) -> &[TxnId] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.entries
            .values()
            .any(|ids| ids.binary_search(&txn_id).is_ok())
    }

    pub fn txn_ids(&self) -> Vec<TxnId> {
        let mut out: Vec<TxnId> = self.entries.values().flatten().copied().collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn union(&self, other: &KeyDeps) -> KeyDeps {
        let mut out = self.clone();
        for (key, ids) in &other.entries {
            for id in ids {
                out.add(key.clone(), *id);
            }
        }
        out
    }

    pub fn without_if(&self, mut drop: impl FnMut(TxnId) -> bool) -> KeyDeps {
        let mut out = BTreeMap::new();
        for (key, ids) in &self.entries {
            let kept: Vec<TxnId> = ids.iter().copied().filter(|id| !drop(*id)).collect();
            if !kept.is_empty() {
                out.insert(key.clone(), kept);
            }
        }
        KeyDeps { entries: out }
    }

    /// Entries whose key falls inside `ranges`.
    pub fn slice(&self, ranges: &Ranges) -> KeyDeps {
        KeyDeps {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| ranges.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Iterate `(key, deps)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&RoutingKey, &[TxnId])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }
}
