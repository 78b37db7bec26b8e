// Dependency sets.
//
// A transaction's dependencies are the conflicting transactions that must be
// ordered before it. Key-domain dependencies are tracked per routing key,
// range-domain dependencies per covered range; `Deps` carries both and is
// what travels in messages.

mod key_deps;
mod latest;
mod range_deps;

pub use key_deps::KeyDeps;
pub use latest::{DepsKnownLevel, LatestDeps, LatestEntry};
pub use range_deps::RangeDeps;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::routables::Ranges;
use crate::time::TxnId;

/// The dependency set of one transaction as known to one participant view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deps {
    pub key_deps: KeyDeps,
    pub range_deps: RangeDeps,
}

impl Deps {
    pub const EMPTY: Deps = Deps {
        key_deps: KeyDeps::EMPTY,
        range_deps: RangeDeps::EMPTY,
    };

    pub fn is_empty(&self) -> bool {
        self.key_deps.is_empty() && self.range_deps.is_empty()
    }

    /// All referenced transaction ids, sorted and deduplicated.
    pub fn txn_ids(&self) -> Vec<TxnId> {
        let mut out: BTreeSet<TxnId> = self.key_deps.txn_ids().into_iter().collect();
        out.extend(self.range_deps.txn_ids());
        out.into_iter().collect()
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.key_deps.contains(txn_id) || self.range_deps.contains(txn_id)
    }

    pub fn len(&self) -> usize {
        self.txn_ids().len()
    }

    /// Union with another view of the same transaction's dependencies.
    pub fn with(&self, other: &Deps) -> Deps {
        Deps {
            key_deps: self.key_deps.union(&other.key_deps),
            range_deps: self.range_deps.union(&other.range_deps),
        }
    }

    /// Drop every reference to the given transactions.
    pub fn without(&self, remove: &BTreeSet<TxnId>) -> Deps {
        self.without_if(|id| remove.contains(&id))
    }

    pub fn without_if(&self, mut drop: impl FnMut(TxnId) -> bool) -> Deps {
        Deps {
            key_deps: self.key_deps.without_if(&mut drop),
            range_deps: self.range_deps.without_if(&mut drop),
        }
    }

    /// Restrict to dependencies participating in `ranges`.
    pub fn slice(&self, ranges: &Ranges) -> Deps {
        Deps {
            key_deps: self.key_deps.slice(ranges),
            range_deps: self.range_deps.slice(ranges),
        }
    }

    /// The greatest referenced id, if any.
    pub fn max_txn_id(&self) -> Option<TxnId> {
        self.txn_ids().into_iter().next_back()
    }
}

impl fmt::Display for Deps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deps({} txns)", self.len())
    }
}
