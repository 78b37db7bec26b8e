// Hybrid logical clock.
//
// Packs wall-clock milliseconds and a logical counter into one u64 so the
// whole sample advances with a single CAS. Outbound messages carry the
// current sample; inbound samples advance the local clock past the remote
// one, keeping the hlc component of freshly minted ids strictly increasing
// per node and consistent with causality across nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::time::{KeyDomain, NodeId, Timestamp, TxnId, TxnKind};

const LOGICAL_BITS: u32 = 16;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Per-node hybrid logical clock. Thread-safe; a single instance is shared by
/// every command store on the node.
#[derive(Debug)]
pub struct Hlc {
    node: NodeId,
    last: AtomicU64,
}

impl Hlc {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            last: AtomicU64::new(wall_sample()),
        }
    }

    /// Clock seeded at a fixed instant; deterministic harnesses advance it
    /// purely through `observe` and the logical counter.
    pub fn at(node: NodeId, initial: u64) -> Self {
        Self {
            node,
            last: AtomicU64::new(initial),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// A strictly increasing raw sample.
    pub fn next(&self) -> u64 {
        let floor = wall_sample();
        loop {
            let last = self.last.load(Ordering::Relaxed);
            let candidate = floor.max(last + 1);
            if self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Advance past a remote sample. Called on every inbound timestamped
    /// message before the local node mints anything ordered after it.
    pub fn observe(&self, remote_hlc: u64) {
        loop {
            let last = self.last.load(Ordering::Relaxed);
            if remote_hlc <= last {
                return;
            }
            if self
                .last
                .compare_exchange_weak(last, remote_hlc, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn observe_timestamp(&self, ts: Timestamp) {
        self.observe(ts.hlc);
    }

    /// Mint a globally unique transaction id in `epoch`.
    pub fn unique_txn_id(&self, epoch: u64, kind: TxnKind, domain: KeyDomain) -> TxnId {
        TxnId::new(epoch, self.next(), kind, domain, self.node)
    }

    /// A timestamp strictly after both a fresh sample and `after`, stamped by
    /// this node. Used for `execute_at` proposals that must dominate a
    /// witnessed conflict.
    pub fn unique_after(&self, epoch: u64, after: Timestamp, flags: u16) -> Timestamp {
        self.observe(after.hlc + 1);
        Timestamp::new(epoch.max(after.epoch), self.next(), flags, self.node)
    }
}

fn wall_sample() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    (millis << LOGICAL_BITS) & !LOGICAL_MASK
}
