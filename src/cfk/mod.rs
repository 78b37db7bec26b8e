// CommandsForKey: the per-key ordered summary of transactions.
//
// Each command store keeps one of these per routing key it owns. It answers
// the two hot-path questions: which prior transactions must a new arrival
// depend on, and what is the latest conflicting timestamp (which decides the
// fast-path vote). Entries are pruned once the redundancy watermark passes
// them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::routables::RoutingKey;
use crate::time::{Timestamp, TxnId, TxnKind};

/// Compressed per-key view of a transaction's progress.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SummaryStatus {
    PreAccepted,
    Accepted,
    PreCommitted,
    Committed,
    Stable,
    Applied,
    Invalidated,
}

impl SummaryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SummaryStatus::Applied | SummaryStatus::Invalidated)
    }

    /// Whether `execute_at` is decided at this status.
    pub fn has_execute_at(self) -> bool {
        self >= SummaryStatus::PreCommitted && self != SummaryStatus::Invalidated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfkEntry {
    pub txn_id: TxnId,
    pub status: SummaryStatus,
    pub execute_at: Option<Timestamp>,
}

impl CfkEntry {
    /// The latest instant this entry can conflict at.
    fn conflict_bound(&self) -> Timestamp {
        match self.execute_at {
            Some(at) if self.status.has_execute_at() => at.max(self.txn_id.as_timestamp()),
            _ => self.txn_id.as_timestamp(),
        }
    }
}

/// Sorted per-key transaction summaries plus pruning watermarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandsForKey {
    key: RoutingKey,
    /// Sorted by txn id.
    entries: Vec<CfkEntry>,
    /// Ids below this are pruned; their effects are already applied.
    pruned_before: TxnId,
    /// Updates since the last prune pass.
    updates_since_prune: u64,
}

impl CommandsForKey {
    pub fn new(key: RoutingKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
            pruned_before: TxnId::min_value(),
            updates_since_prune: 0,
        }
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CfkEntry> {
        self.entries.iter()
    }

    pub fn get(&self, txn_id: TxnId) -> Option<&CfkEntry> {
        self.position(txn_id).map(|pos| &self.entries[pos])
    }

    fn position(&self, txn_id: TxnId) -> Option<usize> {
        self.entries
            .binary_search_by_key(&txn_id, |e| e.txn_id)
            .ok()
    }

    /// Record or advance a transaction's summary. Regressions are ignored:
    /// the summary is monotone like the command itself.
    pub fn update(&mut self, txn_id: TxnId, status: SummaryStatus, execute_at: Option<Timestamp>) {
        if txn_id < self.pruned_before {
            return;
        }
        self.updates_since_prune += 1;
        match self.entries.binary_search_by_key(&txn_id, |e| e.txn_id) {
            Ok(pos) => {
                let entry = &mut self.entries[pos];
                if status >= entry.status {
                    entry.status = status;
                    if execute_at.is_some() {
                        entry.execute_at = execute_at;
                    }
                }
            }
            Err(pos) => self.entries.insert(
                pos,
                CfkEntry {
                    txn_id,
                    status,
                    execute_at,
                },
            ),
        }
    }

    pub fn remove(&mut self, txn_id: TxnId) {
        if let Some(pos) = self.position(txn_id) {
            self.entries.remove(pos);
        }
    }

    /// Prior transactions a new arrival must depend on at this key: every
    /// entry ordered before `upto` whose kind conflicts, except those
    /// already decided to execute after `upto` (they exclude themselves).
    pub fn deps_for(&self, txn_id: TxnId, kind: TxnKind, upto: Timestamp) -> Vec<TxnId> {
        self.entries
            .iter()
            .filter(|e| e.txn_id != txn_id)
            .filter(|e| e.txn_id.as_timestamp() < upto)
            .filter(|e| e.status != SummaryStatus::Invalidated)
            .filter(|e| kind.conflicts_with(e.txn_id.kind()))
            .filter(|e| match e.execute_at {
                // A decided execute_at past `upto` orders the entry after
                // us; it excludes itself from our deps.
                Some(at) if e.status.has_execute_at() => at < upto,
                _ => true,
            })
            .map(|e| e.txn_id)
            .collect()
    }

    /// The latest timestamp at which anything conflicting with `kind` may
    /// execute. A new transaction votes fast-path only if its own id is
    /// greater.
    pub fn max_conflict(&self, kind: TxnKind) -> Timestamp {
        self.entries
            .iter()
            .filter(|e| e.status != SummaryStatus::Invalidated)
            .filter(|e| kind.conflicts_with(e.txn_id.kind()))
            .map(|e| e.conflict_bound())
            .max()
            .unwrap_or(Timestamp::min_value())
    }

    pub fn mark_applied(&mut self, txn_id: TxnId, execute_at: Timestamp) {
        self.update(txn_id, SummaryStatus::Applied, Some(execute_at));
    }

    pub fn mark_invalidated(&mut self, txn_id: TxnId) {
        if let Some(pos) = self.position(txn_id) {
            self.entries[pos].status = SummaryStatus::Invalidated;
            self.entries[pos].execute_at = None;
        }
    }

    /// Whether a prune pass is due, given the configured cadence.
    pub fn should_prune(&self, prune_interval: u64) -> bool {
        self.updates_since_prune >= prune_interval
    }

    /// Drop terminal entries below the redundancy watermark. A single
    /// synthetic applied entry is retained at the highest pruned id so
    /// pending sync points keep a bound to order against.
    pub fn prune(&mut self, redundant_before: TxnId, hlc_delta: u64) {
        self.updates_since_prune = 0;
        if redundant_before <= self.pruned_before {
            return;
        }
        // Leave a guard band of recent hlc history even below the watermark.
        let guard = redundant_before
            .0
            .hlc
            .saturating_sub(hlc_delta);

        let mut synthetic: Option<CfkEntry> = None;
        let has_pending_sync_point = self
            .entries
            .iter()
            .any(|e| e.txn_id.kind().is_sync_point() && !e.status.is_terminal());

        self.entries.retain(|e| {
            let prunable =
                e.txn_id < redundant_before && e.status.is_terminal() && e.txn_id.0.hlc < guard;
            if prunable && e.status == SummaryStatus::Applied {
                match &synthetic {
                    Some(s) if s.txn_id >= e.txn_id => {}
                    _ => synthetic = Some(e.clone()),
                }
            }
            !prunable
        });

        if has_pending_sync_point {
            if let Some(bound) = synthetic {
                self.update(bound.txn_id, bound.status, bound.execute_at);
            }
        }
        self.pruned_before = redundant_before;
    }

    pub fn pruned_before(&self) -> TxnId {
        self.pruned_before
    }
}

impl fmt::Display for CommandsForKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cfk({}, {} entries)", self.key, self.entries.len())
    }
}
