// Vote trackers over a `Topologies` selection.
//
// A tracker owns one tally per shard per selected epoch and folds replica
// responses into a request status. Responses from nodes outside the
// electorate are silently ignored; nodes marked faulty are pre-counted as
// failures, up to each shard's tolerance.

use std::collections::BTreeSet;

use crate::time::NodeId;
use crate::topology::{Shard, Topologies};

/// Outcome of folding one response into a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Keep waiting.
    NoChange,
    /// The request has the quorums it needs.
    Success,
    /// The request can no longer reach quorum.
    Failed,
}

/// Per-shard vote tally.
#[derive(Debug, Clone)]
struct ShardTally {
    shard: Shard,
    successes: BTreeSet<NodeId>,
    fast_successes: BTreeSet<NodeId>,
    failures: BTreeSet<NodeId>,
}

impl ShardTally {
    fn new(shard: Shard, faulty: &BTreeSet<NodeId>) -> Self {
        let mut tally = Self {
            shard,
            successes: BTreeSet::new(),
            fast_successes: BTreeSet::new(),
            failures: BTreeSet::new(),
        };
        // Deduct faulty members up front, capped at the shard's tolerance so
        // a wholly faulty shard still reports Failed rather than underflow.
        let faulty_members: Vec<NodeId> = tally
            .shard
            .nodes()
            .iter()
            .copied()
            .filter(|n| faulty.contains(n))
            .take(tally.shard.max_failures() + 1)
            .collect();
        tally.failures.extend(faulty_members);
        tally
    }

    fn is_member(&self, node: NodeId) -> bool {
        self.shard.contains_node(node)
    }

    fn record_success(&mut self, node: NodeId, fast: bool) {
        if !self.is_member(node) {
            return;
        }
        self.failures.remove(&node);
        self.successes.insert(node);
        if fast && self.shard.fast_path_electorate().contains(&node) {
            self.fast_successes.insert(node);
        }
    }

    fn record_failure(&mut self, node: NodeId) {
        if !self.is_member(node) || self.successes.contains(&node) {
            return;
        }
        self.failures.insert(node);
    }

    fn has_slow_quorum(&self) -> bool {
        self.successes.len() >= self.shard.slow_quorum_size()
    }

    fn has_fast_quorum(&self) -> bool {
        self.fast_successes.len() >= self.shard.fast_quorum_size()
    }

    fn undecided(&self) -> usize {
        self.shard.replication_factor() - self.successes.len() - self.failures.len()
    }

    /// No sequence of further responses can produce a slow quorum.
    fn slow_quorum_unreachable(&self) -> bool {
        self.successes.len() + self.undecided() < self.shard.slow_quorum_size()
    }

    /// No sequence of further responses can produce a fast quorum: a
    /// member that failed, or already voted without the fast flag, can
    /// never contribute one.
    fn fast_quorum_unreachable(&self) -> bool {
        let possible = self
            .shard
            .fast_path_electorate()
            .iter()
            .filter(|n| {
                !self.failures.contains(n)
                    && (self.fast_successes.contains(n) || !self.successes.contains(n))
            })
            .count();
        possible < self.shard.fast_quorum_size()
    }

    fn all_succeeded(&self) -> bool {
        self.successes.len() == self.shard.replication_factor()
    }
}

fn tallies_for(topologies: &Topologies, faulty: &BTreeSet<NodeId>) -> Vec<ShardTally> {
    let mut out = Vec::new();
    for topology in topologies.iter() {
        for shard in topology.shards() {
            out.push(ShardTally::new(shard.clone(), faulty));
        }
    }
    out
}

/// Requires a slow quorum from every shard of every selected epoch.
pub struct QuorumTracker {
    tallies: Vec<ShardTally>,
}

impl QuorumTracker {
    pub fn new(topologies: &Topologies, faulty: &BTreeSet<NodeId>) -> Self {
        Self {
            tallies: tallies_for(topologies, faulty),
        }
    }

    pub fn record_success(&mut self, node: NodeId) -> RequestStatus {
        for tally in &mut self.tallies {
            tally.record_success(node, false);
        }
        self.status()
    }

    pub fn record_failure(&mut self, node: NodeId) -> RequestStatus {
        for tally in &mut self.tallies {
            tally.record_failure(node);
        }
        self.status()
    }

    fn status(&self) -> RequestStatus {
        if self.tallies.iter().any(ShardTally::slow_quorum_unreachable) {
            return RequestStatus::Failed;
        }
        if self.tallies.iter().all(ShardTally::has_slow_quorum) {
            return RequestStatus::Success;
        }
        RequestStatus::NoChange
    }
}

/// Tracks slow quorums and, independently per shard, fast-path acceptance.
/// The transaction's global fast path holds only if every shard reached its
/// fast threshold with `execute_at == txn_id` votes.
pub struct FastPathTracker {
    tallies: Vec<ShardTally>,
}

impl FastPathTracker {
    pub fn new(topologies: &Topologies, faulty: &BTreeSet<NodeId>) -> Self {
        Self {
            tallies: tallies_for(topologies, faulty),
        }
    }

    /// `fast` records whether the replica voted `execute_at == txn_id`.
    pub fn record_success(&mut self, node: NodeId, fast: bool) -> RequestStatus {
        for tally in &mut self.tallies {
            tally.record_success(node, fast);
        }
        self.status()
    }

    pub fn record_failure(&mut self, node: NodeId) -> RequestStatus {
        for tally in &mut self.tallies {
            tally.record_failure(node);
        }
        self.status()
    }

    pub fn fast_path_accepted(&self) -> bool {
        self.tallies.iter().all(ShardTally::has_fast_quorum)
    }

    fn status(&self) -> RequestStatus {
        if self.tallies.iter().any(ShardTally::slow_quorum_unreachable) {
            return RequestStatus::Failed;
        }
        if self.fast_path_accepted() {
            return RequestStatus::Success;
        }
        // Settle for the slow path only once the fast path is out of reach
        // somewhere; until then keep waiting for stragglers.
        let fast_impossible = self.tallies.iter().any(ShardTally::fast_quorum_unreachable);
        let all_slow = self.tallies.iter().all(ShardTally::has_slow_quorum);
        if all_slow && fast_impossible {
            return RequestStatus::Success;
        }
        // Every response in: nothing more to wait for.
        if all_slow && self.tallies.iter().all(|t| t.undecided() == 0) {
            return RequestStatus::Success;
        }
        RequestStatus::NoChange
    }
}

/// Requires one successful read per shard; on failure nominates replacement
/// replicas to contact.
pub struct ReadTracker {
    tallies: Vec<ShardTally>,
    contacted: BTreeSet<NodeId>,
}

impl ReadTracker {
    pub fn new(topologies: &Topologies, faulty: &BTreeSet<NodeId>) -> Self {
        Self {
            tallies: tallies_for(topologies, faulty),
            contacted: BTreeSet::new(),
        }
    }

    /// Choose the initial contact set: one non-faulty replica per shard.
    /// The replica sort is pluggable in the sense that callers may seed
    /// `preferred` (e.g. self first) ahead of the default order.
    pub fn initial_contacts(&mut self, preferred: &[NodeId]) -> Vec<NodeId> {
        let mut out = BTreeSet::new();
        for tally in &self.tallies {
            let pick = preferred
                .iter()
                .copied()
                .find(|n| tally.is_member(*n) && !tally.failures.contains(n))
                .or_else(|| {
                    tally
                        .shard
                        .nodes()
                        .iter()
                        .copied()
                        .find(|n| !tally.failures.contains(n))
                });
            if let Some(node) = pick {
                out.insert(node);
            }
        }
        self.contacted.extend(out.iter().copied());
        out.into_iter().collect()
    }

    pub fn record_success(&mut self, node: NodeId) -> RequestStatus {
        for tally in &mut self.tallies {
            tally.record_success(node, false);
        }
        self.status()
    }

    /// Returns the follow-up contacts needed to keep every shard covered.
    pub fn record_failure(&mut self, node: NodeId) -> (RequestStatus, Vec<NodeId>) {
        for tally in &mut self.tallies {
            tally.record_failure(node);
        }
        let status = self.status();
        if status != RequestStatus::NoChange {
            return (status, Vec::new());
        }
        let mut redispatch = BTreeSet::new();
        for tally in &self.tallies {
            if tally.successes.is_empty() {
                let next = tally
                    .shard
                    .nodes()
                    .iter()
                    .copied()
                    .find(|n| !tally.failures.contains(n) && !self.contacted.contains(n));
                if let Some(node) = next {
                    redispatch.insert(node);
                }
            }
        }
        self.contacted.extend(redispatch.iter().copied());
        (status, redispatch.into_iter().collect())
    }

    fn status(&self) -> RequestStatus {
        if self
            .tallies
            .iter()
            .all(|t| !t.successes.is_empty())
        {
            return RequestStatus::Success;
        }
        if self
            .tallies
            .iter()
            .any(|t| t.successes.is_empty() && t.undecided() == 0)
        {
            return RequestStatus::Failed;
        }
        RequestStatus::NoChange
    }
}

/// Requires every replica of every shard.
pub struct AllTracker {
    tallies: Vec<ShardTally>,
}

impl AllTracker {
    pub fn new(topologies: &Topologies) -> Self {
        Self {
            tallies: tallies_for(topologies, &BTreeSet::new()),
        }
    }

    pub fn record_success(&mut self, node: NodeId) -> RequestStatus {
        for tally in &mut self.tallies {
            tally.record_success(node, false);
        }
        if self.tallies.iter().all(ShardTally::all_succeeded) {
            RequestStatus::Success
        } else {
            RequestStatus::NoChange
        }
    }

    pub fn record_failure(&mut self, node: NodeId) -> RequestStatus {
        for tally in &mut self.tallies {
            tally.record_failure(node);
        }
        if self.tallies.iter().any(|t| !t.failures.is_empty()) {
            RequestStatus::Failed
        } else {
            RequestStatus::NoChange
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routables::{KeyRange, RoutingKey};
    use crate::topology::Topology;

    fn nodes(ids: &[u32]) -> Vec<NodeId> {
        ids.iter().map(|i| NodeId(*i)).collect()
    }

    fn single_shard_topologies(ids: &[u32]) -> Topologies {
        let range = KeyRange::new(RoutingKey::from("a"), RoutingKey::from("z"));
        Topologies::single(Topology::new(1, vec![Shard::with_all_fast(range, nodes(ids))]))
    }

    fn two_epoch_topologies(old: &[u32], new: &[u32]) -> Topologies {
        let range = KeyRange::new(RoutingKey::from("a"), RoutingKey::from("z"));
        Topologies::new(vec![
            Topology::new(1, vec![Shard::with_all_fast(range.clone(), nodes(old))]),
            Topology::new(2, vec![Shard::with_all_fast(range, nodes(new))]),
        ])
    }

    #[test]
    fn test_quorum_tracker_succeeds_at_majority() {
        let ts = single_shard_topologies(&[1, 2, 3]);
        let mut tracker = QuorumTracker::new(&ts, &BTreeSet::new());
        assert_eq!(tracker.record_success(NodeId(1)), RequestStatus::NoChange);
        assert_eq!(tracker.record_success(NodeId(2)), RequestStatus::Success);
    }

    #[test]
    fn test_quorum_tracker_fails_when_unreachable() {
        let ts = single_shard_topologies(&[1, 2, 3]);
        let mut tracker = QuorumTracker::new(&ts, &BTreeSet::new());
        assert_eq!(tracker.record_failure(NodeId(1)), RequestStatus::NoChange);
        assert_eq!(tracker.record_failure(NodeId(2)), RequestStatus::Failed);
    }

    #[test]
    fn test_quorum_tracker_ignores_non_members() {
        let ts = single_shard_topologies(&[1, 2, 3]);
        let mut tracker = QuorumTracker::new(&ts, &BTreeSet::new());
        assert_eq!(tracker.record_success(NodeId(9)), RequestStatus::NoChange);
        assert_eq!(tracker.record_failure(NodeId(9)), RequestStatus::NoChange);
    }

    #[test]
    fn test_quorum_tracker_spans_epochs() {
        let ts = two_epoch_topologies(&[1, 2, 3], &[3, 4, 5]);
        let mut tracker = QuorumTracker::new(&ts, &BTreeSet::new());
        tracker.record_success(NodeId(1));
        tracker.record_success(NodeId(2));
        // Old epoch has a quorum, new epoch does not yet.
        assert_eq!(tracker.record_success(NodeId(4)), RequestStatus::NoChange);
        assert_eq!(tracker.record_success(NodeId(5)), RequestStatus::Success);
    }

    #[test]
    fn test_faulty_nodes_deducted() {
        let ts = single_shard_topologies(&[1, 2, 3]);
        let faulty = [NodeId(3)].into_iter().collect();
        let mut tracker = QuorumTracker::new(&ts, &faulty);
        tracker.record_success(NodeId(1));
        assert_eq!(tracker.record_success(NodeId(2)), RequestStatus::Success);

        let faulty = [NodeId(2), NodeId(3)].into_iter().collect();
        let mut tracker = QuorumTracker::new(&ts, &faulty);
        assert_eq!(tracker.record_success(NodeId(1)), RequestStatus::Failed);
    }

    #[test]
    fn test_fast_path_all_fast_votes() {
        let ts = single_shard_topologies(&[1, 2, 3]);
        let mut tracker = FastPathTracker::new(&ts, &BTreeSet::new());
        tracker.record_success(NodeId(1), true);
        tracker.record_success(NodeId(2), true);
        assert_eq!(tracker.record_success(NodeId(3), true), RequestStatus::Success);
        assert!(tracker.fast_path_accepted());
    }

    #[test]
    fn test_fast_path_rejected_by_slow_vote() {
        let ts = single_shard_topologies(&[1, 2, 3]);
        let mut tracker = FastPathTracker::new(&ts, &BTreeSet::new());
        tracker.record_success(NodeId(1), true);
        tracker.record_success(NodeId(2), true);
        // One conflicting vote makes the 3-of-3 fast quorum unreachable;
        // the slow path completes instead.
        assert_eq!(tracker.record_success(NodeId(3), false), RequestStatus::Success);
        assert!(!tracker.fast_path_accepted());
    }

    #[test]
    fn test_fast_path_waits_for_possible_fast_quorum() {
        let ts = single_shard_topologies(&[1, 2, 3]);
        let mut tracker = FastPathTracker::new(&ts, &BTreeSet::new());
        tracker.record_success(NodeId(1), true);
        // Slow quorum exists but the fast path is still possible: wait.
        assert_eq!(tracker.record_success(NodeId(2), true), RequestStatus::NoChange);
    }

    #[test]
    fn test_read_tracker_redispatch() {
        let ts = single_shard_topologies(&[1, 2, 3]);
        let mut tracker = ReadTracker::new(&ts, &BTreeSet::new());
        let contacts = tracker.initial_contacts(&[NodeId(1)]);
        assert_eq!(contacts, vec![NodeId(1)]);

        let (status, next) = tracker.record_failure(NodeId(1));
        assert_eq!(status, RequestStatus::NoChange);
        assert_eq!(next.len(), 1);
        assert_ne!(next[0], NodeId(1));

        assert_eq!(tracker.record_success(next[0]), RequestStatus::Success);
    }

    #[test]
    fn test_read_tracker_fails_when_shard_exhausted() {
        let ts = single_shard_topologies(&[1, 2]);
        let mut tracker = ReadTracker::new(&ts, &BTreeSet::new());
        tracker.initial_contacts(&[]);
        let (_, next) = tracker.record_failure(NodeId(1));
        assert_eq!(next, vec![NodeId(2)]);
        let (status, _) = tracker.record_failure(NodeId(2));
        assert_eq!(status, RequestStatus::Failed);
    }

    #[test]
    fn test_all_tracker() {
        let ts = single_shard_topologies(&[1, 2, 3]);
        let mut tracker = AllTracker::new(&ts);
        tracker.record_success(NodeId(1));
        tracker.record_success(NodeId(2));
        assert_eq!(tracker.record_success(NodeId(3)), RequestStatus::Success);

        let mut tracker = AllTracker::new(&ts);
        assert_eq!(tracker.record_failure(NodeId(2)), RequestStatus::Failed);
    }
}
