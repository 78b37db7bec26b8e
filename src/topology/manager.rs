// Topology manager: the per-node window of epoch states.
//
// Tracks, per epoch, which ranges have been synced from predecessor epochs,
// which are closed to new proposals and which are globally redundant, and
// answers the epoch-selection queries coordinations are scoped by.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, info};

use crate::error::{ProtocolError, Result};
use crate::routables::{Ranges, RouteParts};
use crate::time::NodeId;
use crate::topology::{Topologies, Topology};

/// Callback released once an epoch is acknowledged locally.
pub type EpochWaiter = Box<dyn FnOnce() + Send + Sync>;

/// Per-epoch bookkeeping.
pub struct EpochState {
    global: Topology,
    local: Topology,
    /// Ranges whose data this epoch has received from predecessor epochs.
    /// Ranges first added in this epoch start synced.
    synced: Ranges,
    /// Ranges no longer accepting proposals in this epoch.
    closed: Ranges,
    /// Ranges for which every proposable transaction of this epoch is
    /// globally applied.
    redundant: Ranges,
    /// Ranges added relative to the previous epoch.
    added: Ranges,
    /// Nodes that reported sync completion for this epoch.
    sync_votes: BTreeSet<NodeId>,
    /// Topology of the previous epoch; sync quorums are counted against its
    /// shards.
    previous: Option<Topology>,
    acknowledged: bool,
}

impl EpochState {
    fn new(node: NodeId, global: Topology, previous: Option<Topology>) -> Self {
        let added = match &previous {
            None => global.ranges(),
            Some(prev) => global.ranges().without(&prev.ranges()),
        };
        let local = global.for_node(node);
        Self {
            synced: added.clone(),
            closed: Ranges::EMPTY,
            redundant: Ranges::EMPTY,
            added,
            sync_votes: BTreeSet::new(),
            previous,
            global,
            local,
            acknowledged: false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.global.epoch()
    }

    pub fn global(&self) -> &Topology {
        &self.global
    }

    pub fn local(&self) -> &Topology {
        &self.local
    }

    pub fn synced(&self) -> &Ranges {
        &self.synced
    }

    pub fn closed(&self) -> &Ranges {
        &self.closed
    }

    pub fn redundant(&self) -> &Ranges {
        &self.redundant
    }

    pub fn added(&self) -> &Ranges {
        &self.added
    }

    pub fn is_fully_synced(&self) -> bool {
        self.synced.covers(&self.global.ranges())
    }

    /// Re-derive `synced` from the sync votes: a range carried over from the
    /// previous epoch is synced once a slow quorum of each previous-epoch
    /// shard overlapping it has reported completion.
    fn recompute_synced(&mut self) {
        let Some(previous) = &self.previous else {
            return;
        };
        let mut synced = self.added.clone();
        for shard in previous.shards() {
            let votes = shard
                .nodes()
                .iter()
                .filter(|n| self.sync_votes.contains(n))
                .count();
            if votes >= shard.slow_quorum_size() {
                synced = synced.union(&Ranges::single(shard.range().clone()));
            }
        }
        self.synced = synced.intersect(&self.global.ranges()).union(&self.added);
    }
}

/// The per-node window `[min_epoch, current_epoch]` of epoch states.
pub struct TopologyManager {
    node: NodeId,
    epochs: VecDeque<EpochState>,
    last_acknowledged: u64,
    /// Nodes currently considered faulty; excluded from tracker electorates.
    faulty: BTreeSet<NodeId>,
    waiters: HashMap<u64, Vec<EpochWaiter>>,
}

impl TopologyManager {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            epochs: VecDeque::new(),
            last_acknowledged: 0,
            faulty: BTreeSet::new(),
            waiters: HashMap::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn min_epoch(&self) -> u64 {
        self.epochs.front().map(|e| e.epoch()).unwrap_or(0)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epochs.back().map(|e| e.epoch()).unwrap_or(0)
    }

    pub fn current(&self) -> Option<&Topology> {
        self.epochs.back().map(|e| e.global())
    }

    pub fn epoch_state(&self, epoch: u64) -> Option<&EpochState> {
        let min = self.min_epoch();
        if epoch < min || epoch > self.current_epoch() {
            return None;
        }
        self.epochs.get((epoch - min) as usize)
    }

    fn epoch_state_mut(&mut self, epoch: u64) -> Option<&mut EpochState> {
        let min = self.min_epoch();
        if epoch < min || epoch > self.current_epoch() {
            return None;
        }
        self.epochs.get_mut((epoch - min) as usize)
    }

    pub fn mark_faulty(&mut self, node: NodeId) {
        self.faulty.insert(node);
    }

    pub fn mark_healthy(&mut self, node: NodeId) {
        self.faulty.remove(&node);
    }

    pub fn faulty(&self) -> &BTreeSet<NodeId> {
        &self.faulty
    }

    /// Install the next epoch's topology. Must be `current_epoch + 1`, or
    /// the very first topology this node learns.
    pub fn receive(&mut self, topology: Topology) -> Result<()> {
        let epoch = topology.epoch();
        if !self.epochs.is_empty() && epoch != self.current_epoch() + 1 {
            return Err(ProtocolError::Internal(format!(
                "topology epoch {} does not follow current {}",
                epoch,
                self.current_epoch()
            )));
        }
        let previous = self.epochs.back().map(|e| e.global().clone());
        info!(epoch, node = %self.node, "installing topology");
        self.epochs
            .push_back(EpochState::new(self.node, topology, previous));
        Ok(())
    }

    /// Locally acknowledge an epoch, releasing its waiters. Acknowledgements
    /// arrive strictly in epoch order.
    pub fn acknowledge(&mut self, epoch: u64) -> Result<()> {
        if epoch != self.last_acknowledged + 1 && !(self.last_acknowledged == 0 && epoch == self.min_epoch())
        {
            return Err(ProtocolError::Internal(format!(
                "acknowledge {} out of order (last {})",
                epoch, self.last_acknowledged
            )));
        }
        let state = self
            .epoch_state_mut(epoch)
            .ok_or_else(|| ProtocolError::Internal(format!("unknown epoch {}", epoch)))?;
        state.acknowledged = true;
        self.last_acknowledged = epoch;
        if let Some(waiters) = self.waiters.remove(&epoch) {
            for waiter in waiters {
                waiter();
            }
        }
        Ok(())
    }

    pub fn last_acknowledged(&self) -> u64 {
        self.last_acknowledged
    }

    /// Run `waiter` once `epoch` is acknowledged; immediately when it
    /// already is.
    pub fn await_epoch(&mut self, epoch: u64, waiter: EpochWaiter) {
        if epoch <= self.last_acknowledged {
            waiter();
        } else {
            self.waiters.entry(epoch).or_default().push(waiter);
        }
    }

    /// A replica reports that it has finished syncing `epoch`: it holds all
    /// state from prior epochs for the ranges it owns in `epoch`.
    pub fn sync_complete(&mut self, node: NodeId, epoch: u64) {
        let Some(state) = self.epoch_state_mut(epoch) else {
            return;
        };
        state.sync_votes.insert(node);
        state.recompute_synced();
        debug!(epoch, %node, synced = %state.synced, "sync vote");

        // A fully synced epoch cascades completion forward, but only to
        // shards whose range and replica set are unchanged: a moved shard
        // still needs its own transfer.
        if self
            .epoch_state(epoch)
            .map(|s| s.is_fully_synced())
            .unwrap_or(false)
        {
            let shards = self
                .epoch_state(epoch)
                .map(|s| s.global().shards().to_vec())
                .unwrap_or_default();
            let min = self.min_epoch();
            for state in self.epochs.iter_mut().skip((epoch + 1 - min) as usize) {
                let unchanged: Vec<Ranges> = state
                    .global
                    .shards()
                    .iter()
                    .filter(|s| {
                        shards
                            .iter()
                            .any(|p| p.range() == s.range() && p.nodes() == s.nodes())
                    })
                    .map(|s| Ranges::single(s.range().clone()))
                    .collect();
                for r in unchanged {
                    state.synced = state.synced.union(&r);
                }
            }
        }
    }

    /// No new transactions may be proposed in `epoch` for `ranges`.
    pub fn epoch_closed(&mut self, ranges: Ranges, epoch: u64) {
        if let Some(state) = self.epoch_state_mut(epoch) {
            state.closed = state.closed.union(&ranges);
        }
    }

    /// Every proposable transaction of `epoch` on `ranges` is globally
    /// applied; the epoch may be garbage collected once all its ranges are.
    pub fn epoch_redundant(&mut self, ranges: Ranges, epoch: u64) {
        // Redundancy at epoch e implies redundancy at every earlier epoch.
        let min = self.min_epoch();
        if epoch < min {
            return;
        }
        let upto = (epoch + 1 - min).min(self.epochs.len() as u64) as usize;
        for state in self.epochs.iter_mut().take(upto) {
            let own = state.global.ranges();
            state.redundant = state.redundant.union(&ranges.intersect(&own));
            state.closed = state.closed.union(&state.redundant);
        }
    }

    /// Drop epochs older than `epoch`. Their sync must be complete.
    pub fn truncate_until(&mut self, epoch: u64) -> Result<()> {
        while self.min_epoch() < epoch && self.epochs.len() > 1 {
            let front = self.epochs.front().expect("non-empty");
            if !front.is_fully_synced() {
                return Err(ProtocolError::Internal(format!(
                    "cannot truncate epoch {}: sync incomplete",
                    front.epoch()
                )));
            }
            self.epochs.pop_front();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Epoch selection
    // ------------------------------------------------------------------

    /// The exact epochs `[min, max]`.
    pub fn precise_epochs(&self, min: u64, max: u64) -> Result<Topologies> {
        let lo = min.max(self.min_epoch());
        let hi = max.min(self.current_epoch());
        if lo > hi {
            return Err(ProtocolError::Internal(format!(
                "epoch selection [{min},{max}] outside window [{},{}]",
                self.min_epoch(),
                self.current_epoch()
            )));
        }
        let mut out = Vec::with_capacity((hi - lo + 1) as usize);
        for epoch in lo..=hi {
            out.push(self.epoch_state(epoch).expect("in window").global().clone());
        }
        Ok(Topologies::new(out))
    }

    /// `[min, max]` extended downward through every epoch that still owns a
    /// participant range whose sync has not transferred it forward into the
    /// selection.
    pub fn with_unsynced_epochs(
        &self,
        parts: &RouteParts,
        min: u64,
        max: u64,
    ) -> Result<Topologies> {
        let selection = parts.to_ranges();
        let mut lo = min.max(self.min_epoch());
        let hi = max.min(self.current_epoch());
        loop {
            // Ranges of the selection synced by some epoch in [lo, hi].
            let mut covered = Ranges::EMPTY;
            for epoch in lo..=hi {
                if let Some(state) = self.epoch_state(epoch) {
                    covered = covered.union(&state.synced().intersect(&selection));
                }
            }
            let missing = selection.without(&covered);
            if missing.is_empty() || lo <= self.min_epoch() {
                break;
            }
            // The epoch below is needed only if it owns a missing range.
            let below = self
                .epoch_state(lo - 1)
                .expect("lo > min_epoch implies lo-1 in window");
            if below.global().ranges().intersect(&missing).is_empty() {
                break;
            }
            lo -= 1;
        }
        self.precise_epochs(lo, hi)
    }

    /// Epochs from the oldest one still open for proposals on the
    /// participants, up to the current epoch.
    pub fn with_open_epochs(&self, parts: &RouteParts, min: u64) -> Result<Topologies> {
        self.select_from_watermark(parts, min, |state| state.closed())
    }

    /// As `with_open_epochs`, but at the redundancy watermark.
    pub fn with_uncompleted_epochs(&self, parts: &RouteParts, min: u64) -> Result<Topologies> {
        self.select_from_watermark(parts, min, |state| state.redundant())
    }

    fn select_from_watermark(
        &self,
        parts: &RouteParts,
        min: u64,
        watermark: impl Fn(&EpochState) -> &Ranges,
    ) -> Result<Topologies> {
        let selection = parts.to_ranges();
        let hi = self.current_epoch();
        let mut lo = hi;
        // Walk down while the epoch below still has an open participant
        // range, stopping at `min`.
        while lo > min.max(self.min_epoch()) {
            let below = self.epoch_state(lo - 1).expect("in window");
            let open = below
                .global()
                .ranges()
                .intersect(&selection)
                .without(watermark(below));
            if open.is_empty() {
                break;
            }
            lo -= 1;
        }
        self.precise_epochs(lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routables::{KeyRange, RoutingKey, RoutingKeys};
    use crate::topology::Shard;

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new(RoutingKey::from(a), RoutingKey::from(b))
    }

    fn topology(epoch: u64, shards: Vec<Shard>) -> Topology {
        Topology::new(epoch, shards)
    }

    fn three_node_shard(a: &str, b: &str, ids: &[u32]) -> Shard {
        Shard::with_all_fast(range(a, b), ids.iter().map(|i| NodeId(*i)).collect())
    }

    fn manager_with_epoch1() -> TopologyManager {
        let mut tm = TopologyManager::new(NodeId(1));
        tm.receive(topology(1, vec![three_node_shard("a", "z", &[1, 2, 3])]))
            .unwrap();
        tm
    }

    #[test]
    fn test_receive_requires_consecutive_epochs() {
        let mut tm = manager_with_epoch1();
        let err = tm.receive(topology(3, vec![three_node_shard("a", "z", &[1, 2, 3])]));
        assert!(err.is_err());
        tm.receive(topology(2, vec![three_node_shard("a", "z", &[1, 2, 3])]))
            .unwrap();
        assert_eq!(tm.current_epoch(), 2);
    }

    #[test]
    fn test_first_epoch_starts_synced() {
        let tm = manager_with_epoch1();
        assert!(tm.epoch_state(1).unwrap().is_fully_synced());
    }

    #[test]
    fn test_carried_ranges_need_sync_quorum() {
        let mut tm = manager_with_epoch1();
        tm.receive(topology(2, vec![three_node_shard("a", "z", &[2, 3, 4])]))
            .unwrap();
        assert!(!tm.epoch_state(2).unwrap().is_fully_synced());

        tm.sync_complete(NodeId(1), 2);
        assert!(!tm.epoch_state(2).unwrap().is_fully_synced());
        tm.sync_complete(NodeId(2), 2);
        assert!(tm.epoch_state(2).unwrap().is_fully_synced());
    }

    #[test]
    fn test_added_ranges_start_synced() {
        let mut tm = manager_with_epoch1();
        tm.receive(topology(
            2,
            vec![
                three_node_shard("a", "z", &[1, 2, 3]),
                three_node_shard("z", "zz", &[1, 2, 3]),
            ],
        ))
        .unwrap();
        let state = tm.epoch_state(2).unwrap();
        assert!(state.synced().contains(&RoutingKey::from("za")));
        assert!(!state.synced().contains(&RoutingKey::from("b")));
    }

    #[test]
    fn test_acknowledge_order_and_waiters() {
        let mut tm = manager_with_epoch1();
        tm.receive(topology(2, vec![three_node_shard("a", "z", &[1, 2, 3])]))
            .unwrap();

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        tm.await_epoch(2, Box::new(move || {
            fired2.store(true, std::sync::atomic::Ordering::SeqCst)
        }));

        assert!(tm.acknowledge(2).is_err());
        tm.acknowledge(1).unwrap();
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
        tm.acknowledge(2).unwrap();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_with_unsynced_epochs_extends_down_until_synced() {
        let mut tm = manager_with_epoch1();
        tm.receive(topology(2, vec![three_node_shard("a", "z", &[2, 3, 4])]))
            .unwrap();
        tm.receive(topology(3, vec![three_node_shard("a", "z", &[3, 4, 5])]))
            .unwrap();

        let parts = RouteParts::Keys(RoutingKeys::single(RoutingKey::from("k")));
        // Nothing synced: selection [3,3] must extend down to epoch 1.
        let ts = tm.with_unsynced_epochs(&parts, 3, 3).unwrap();
        assert_eq!(ts.min_epoch(), 1);
        assert_eq!(ts.max_epoch(), 3);

        // Once epoch 2 synced the range, epoch 1 is no longer needed.
        tm.sync_complete(NodeId(1), 2);
        tm.sync_complete(NodeId(2), 2);
        let ts = tm.with_unsynced_epochs(&parts, 3, 3).unwrap();
        assert_eq!(ts.min_epoch(), 2);

        tm.sync_complete(NodeId(2), 3);
        tm.sync_complete(NodeId(3), 3);
        let ts = tm.with_unsynced_epochs(&parts, 3, 3).unwrap();
        assert_eq!(ts.min_epoch(), 3);
    }

    #[test]
    fn test_truncate_requires_sync() {
        let mut tm = manager_with_epoch1();
        tm.receive(topology(2, vec![three_node_shard("a", "z", &[2, 3, 4])]))
            .unwrap();
        assert!(tm.truncate_until(2).is_ok());
        // Epoch 1 is fully synced (first epoch) so it can go; epoch 2 stays.
        assert_eq!(tm.min_epoch(), 2);
        tm.receive(topology(3, vec![three_node_shard("a", "z", &[2, 3, 4])]))
            .unwrap();
        // Epoch 2 never synced: truncating past it must fail.
        assert!(tm.truncate_until(3).is_err());
    }

    #[test]
    fn test_epoch_redundant_cascades_downward() {
        let mut tm = manager_with_epoch1();
        tm.receive(topology(2, vec![three_node_shard("a", "z", &[1, 2, 3])]))
            .unwrap();
        tm.epoch_redundant(Ranges::single(range("a", "m")), 2);
        assert!(tm
            .epoch_state(1)
            .unwrap()
            .redundant()
            .contains(&RoutingKey::from("b")));
        assert!(!tm
            .epoch_state(2)
            .unwrap()
            .redundant()
            .contains(&RoutingKey::from("n")));
    }

    #[test]
    fn test_with_open_epochs_skips_closed() {
        let mut tm = manager_with_epoch1();
        tm.receive(topology(2, vec![three_node_shard("a", "z", &[1, 2, 3])]))
            .unwrap();
        let parts = RouteParts::Keys(RoutingKeys::single(RoutingKey::from("k")));

        let ts = tm.with_open_epochs(&parts, 1).unwrap();
        assert_eq!(ts.min_epoch(), 1);

        tm.epoch_closed(Ranges::single(range("a", "z")), 1);
        let ts = tm.with_open_epochs(&parts, 1).unwrap();
        assert_eq!(ts.min_epoch(), 2);
    }
}
