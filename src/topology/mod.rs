// Epoch-scoped shard topology.
//
// A topology maps the routing space onto shards, each owned by a replica set
// with an optional fast-path electorate. Operations are scoped to the
// contiguous window of epochs (`Topologies`) that own their participants.

mod manager;

pub use manager::{EpochState, TopologyManager};

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::routables::{KeyRange, Ranges, RouteParts, RoutingKey};
use crate::time::NodeId;

/// One shard: a contiguous range of the routing space plus the replica set
/// owning it in a given epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    range: KeyRange,
    /// Sorted replica set.
    nodes: Vec<NodeId>,
    /// Replicas counted toward the fast-path quorum. Must hold at least a
    /// slow quorum of the shard.
    fast_path_electorate: BTreeSet<NodeId>,
    /// Replicas being brought in by an in-flight topology change; they
    /// receive traffic but are not counted toward quorums.
    pending_nodes: Vec<NodeId>,
}

impl Shard {
    pub fn new(range: KeyRange, mut nodes: Vec<NodeId>, fast_path_electorate: BTreeSet<NodeId>) -> Self {
        nodes.sort();
        nodes.dedup();
        let shard = Self {
            range,
            nodes,
            fast_path_electorate,
            pending_nodes: Vec::new(),
        };
        debug_assert!(
            shard.fast_path_electorate.is_empty()
                || shard.fast_path_electorate.len() >= shard.slow_quorum_size(),
            "fast-path electorate smaller than a slow quorum"
        );
        shard
    }

    /// Shard where every replica belongs to the fast-path electorate.
    pub fn with_all_fast(range: KeyRange, nodes: Vec<NodeId>) -> Self {
        let electorate = nodes.iter().copied().collect();
        Shard::new(range, nodes, electorate)
    }

    pub fn with_pending(mut self, pending: Vec<NodeId>) -> Self {
        self.pending_nodes = pending;
        self
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn pending_nodes(&self) -> &[NodeId] {
        &self.pending_nodes
    }

    pub fn fast_path_electorate(&self) -> &BTreeSet<NodeId> {
        &self.fast_path_electorate
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    pub fn replication_factor(&self) -> usize {
        self.nodes.len()
    }

    /// Tolerated failures: `f = (rs - 1) / 2`.
    pub fn max_failures(&self) -> usize {
        (self.replication_factor().saturating_sub(1)) / 2
    }

    /// Slow-path quorum: `rs - f`, a simple majority.
    pub fn slow_quorum_size(&self) -> usize {
        self.replication_factor() - self.max_failures()
    }

    /// Fast-path quorum over the electorate: `ceil((fp + rs) / 2)`, never
    /// below the slow quorum.
    pub fn fast_quorum_size(&self) -> usize {
        let rs = self.replication_factor();
        let fp = self.fast_path_electorate.len();
        ((fp + rs).div_ceil(2)).max(self.slow_quorum_size())
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard({}, rf={})", self.range, self.nodes.len())
    }
}

/// The shard assignment for one epoch. Shards are sorted by range start and
/// do not overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    epoch: u64,
    shards: Vec<Shard>,
}

impl Topology {
    pub fn new(epoch: u64, mut shards: Vec<Shard>) -> Self {
        shards.sort_by(|a, b| a.range.cmp(&b.range));
        Self { epoch, shards }
    }

    pub fn empty(epoch: u64) -> Self {
        Self {
            epoch,
            shards: Vec::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn ranges(&self) -> Ranges {
        Ranges::new(self.shards.iter().map(|s| s.range.clone()).collect())
    }

    pub fn nodes(&self) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        for shard in &self.shards {
            out.extend(shard.nodes.iter().copied());
        }
        out
    }

    pub fn shard_for(&self, key: &RoutingKey) -> Option<&Shard> {
        self.shards.iter().find(|s| s.range.contains(key))
    }

    /// Shards owning any participant of `parts`.
    pub fn shards_for(&self, parts: &RouteParts) -> Vec<&Shard> {
        self.shards
            .iter()
            .filter(|s| parts.intersects(&s.range))
            .collect()
    }

    /// This node's local view: the subset of shards containing it.
    pub fn for_node(&self, node: NodeId) -> Topology {
        Topology {
            epoch: self.epoch,
            shards: self
                .shards
                .iter()
                .filter(|s| s.contains_node(node))
                .cloned()
                .collect(),
        }
    }

    /// Ranges of the shards containing `node`.
    pub fn ranges_for_node(&self, node: NodeId) -> Ranges {
        Ranges::new(
            self.shards
                .iter()
                .filter(|s| s.contains_node(node))
                .map(|s| s.range.clone())
                .collect(),
        )
    }
}

/// A contiguous sequence of epochs, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topologies(Vec<Topology>);

impl Topologies {
    pub fn single(topology: Topology) -> Self {
        Topologies(vec![topology])
    }

    /// Invariant: `topologies` is non-empty with consecutive epochs,
    /// oldest first.
    pub fn new(topologies: Vec<Topology>) -> Self {
        debug_assert!(!topologies.is_empty());
        debug_assert!(topologies
            .windows(2)
            .all(|w| w[1].epoch == w[0].epoch + 1));
        Topologies(topologies)
    }

    pub fn oldest(&self) -> &Topology {
        &self.0[0]
    }

    pub fn current(&self) -> &Topology {
        self.0.last().expect("topologies are non-empty")
    }

    pub fn min_epoch(&self) -> u64 {
        self.oldest().epoch
    }

    pub fn max_epoch(&self) -> u64 {
        self.current().epoch
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topology> {
        self.0.iter()
    }

    pub fn for_epoch(&self, epoch: u64) -> Option<&Topology> {
        if epoch < self.min_epoch() || epoch > self.max_epoch() {
            return None;
        }
        Some(&self.0[(epoch - self.min_epoch()) as usize])
    }

    pub fn contains_epoch(&self, epoch: u64) -> bool {
        self.for_epoch(epoch).is_some()
    }

    /// Every replica appearing in any selected epoch.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        for t in &self.0 {
            out.extend(t.nodes());
        }
        out
    }
}
