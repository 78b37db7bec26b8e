// RedundantBefore: per-range watermarks below which commands are redundant.

use serde::{Deserialize, Serialize};

use crate::routables::{KeyRange, Ranges, RoutingKey};
use crate::time::TxnId;

/// Where a transaction id stands relative to one range's watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RedundantStatus {
    /// Above every watermark; fully live.
    Live,
    /// Below the bootstrap point: this store never saw the range's history
    /// that far back.
    PreBootstrap,
    /// Applied locally but not yet known applied across the shard.
    LocallyRedundant,
    /// Every replica of the shard has applied it.
    ShardRedundant,
    /// Below the GC line.
    GcBefore,
    /// The range is no longer owned by this store and everything proposable
    /// was applied before retirement.
    WasOwnedRetired,
}

/// Watermarks for one range. All bounds are exclusive: ids strictly below a
/// bound have that property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundantEntry {
    pub bootstrapped_at: TxnId,
    pub locally_applied: TxnId,
    pub shard_applied: TxnId,
    pub gc_before: TxnId,
    /// Set when the range was handed off: the epoch it retired in.
    pub was_owned_until: Option<u64>,
}

impl RedundantEntry {
    pub fn new(
        bootstrapped_at: TxnId,
        locally_applied: TxnId,
        shard_applied: TxnId,
        gc_before: TxnId,
    ) -> Self {
        Self {
            bootstrapped_at,
            locally_applied,
            shard_applied,
            gc_before,
            was_owned_until: None,
        }
    }

    pub fn retired(mut self, epoch: u64) -> Self {
        self.was_owned_until = Some(epoch);
        self
    }

    fn status(&self, txn_id: TxnId) -> RedundantStatus {
        if self.was_owned_until.is_some() {
            return RedundantStatus::WasOwnedRetired;
        }
        if txn_id < self.gc_before {
            RedundantStatus::GcBefore
        } else if txn_id < self.shard_applied {
            RedundantStatus::ShardRedundant
        } else if txn_id < self.locally_applied {
            RedundantStatus::LocallyRedundant
        } else if txn_id < self.bootstrapped_at {
            RedundantStatus::PreBootstrap
        } else {
            RedundantStatus::Live
        }
    }

    /// Pointwise maximum of the watermarks. Commutative and idempotent.
    fn merge(&self, other: &RedundantEntry) -> RedundantEntry {
        RedundantEntry {
            bootstrapped_at: self.bootstrapped_at.max(other.bootstrapped_at),
            locally_applied: self.locally_applied.max(other.locally_applied),
            shard_applied: self.shard_applied.max(other.shard_applied),
            gc_before: self.gc_before.max(other.gc_before),
            was_owned_until: match (self.was_owned_until, other.was_owned_until) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

/// Summary of a transaction's standing across its participating ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedundantSummary {
    pub min: RedundantStatus,
    pub max: RedundantStatus,
    pub any_retired: bool,
}

impl RedundantSummary {
    /// Every participating range has at least this status. Retired ranges
    /// order above every watermark level: they no longer gate cleanup.
    pub fn all_at_least(&self, level: RedundantStatus) -> bool {
        debug_assert!(level < RedundantStatus::WasOwnedRetired);
        self.min >= level
    }

    pub fn all(&self, level: RedundantStatus) -> bool {
        self.min == level && self.max == level
    }
}

/// Interval map of redundancy watermarks, sorted and non-overlapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundantBefore {
    entries: Vec<(KeyRange, RedundantEntry)>,
}

impl RedundantBefore {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(KeyRange, RedundantEntry)> {
        self.entries.iter()
    }

    fn entry_covering(&self, key: &RoutingKey) -> Option<&RedundantEntry> {
        self.entries
            .iter()
            .find(|(r, _)| r.contains(key))
            .map(|(_, e)| e)
    }

    /// Merge an entry for `range`, splitting intervals where needed. The
    /// merge is commutative and idempotent.
    pub fn merge_entry(&mut self, range: KeyRange, entry: RedundantEntry) {
        let addition = RedundantBefore {
            entries: vec![(range, entry)],
        };
        *self = RedundantBefore::merge(self, &addition);
    }

    pub fn merge(a: &RedundantBefore, b: &RedundantBefore) -> RedundantBefore {
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
        RedundantBefore { entries: out }
    }

    /// Classify `txn_id` against every watermark range it participates in.
    pub fn status(&self, txn_id: TxnId, participating: &Ranges) -> RedundantSummary {
        let mut min: Option<RedundantStatus> = None;
        let mut max: Option<RedundantStatus> = None;
        let mut any_retired = false;

        for range in participating.iter() {
            // Collect the statuses of every watermark interval overlapping
            // this participating range; uncovered space is Live.
            let mut covered = Ranges::EMPTY;
            for (wrange, entry) in &self.entries {
                if wrange.intersects(range) {
                    let status = entry.status(txn_id);
                    if status == RedundantStatus::WasOwnedRetired {
                        any_retired = true;
                    }
                    min = Some(min.map_or(status, |m| m.min(status)));
                    max = Some(max.map_or(status, |m| m.max(status)));
                    covered = covered.union(&Ranges::single(wrange.clone()));
                }
            }
            if !covered.covers(&Ranges::single(range.clone())) {
                min = Some(min.map_or(RedundantStatus::Live, |m| m.min(RedundantStatus::Live)));
                max = Some(max.map_or(RedundantStatus::Live, |m| m.max(RedundantStatus::Live)));
            }
        }

        RedundantSummary {
            min: min.unwrap_or(RedundantStatus::Live),
            max: max.unwrap_or(RedundantStatus::Live),
            any_retired,
        }
    }

    /// The highest GC watermark applying to `key`, used by CFK pruning.
    pub fn gc_before(&self, key: &RoutingKey) -> TxnId {
        self.entry_covering(key)
            .map(|e| e.gc_before)
            .unwrap_or(TxnId::min_value())
    }

    /// The highest shard-applied watermark applying to `key`.
    pub fn shard_applied(&self, key: &RoutingKey) -> TxnId {
        self.entry_covering(key)
            .map(|e| e.shard_applied)
            .unwrap_or(TxnId::min_value())
    }
}
