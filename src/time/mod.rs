// Hybrid logical clock and protocol identifiers.
//
// Every identifier in the protocol is an HLC sample tagged with flags and the
// origin node: transaction ids, execution timestamps and recovery ballots all
// share the same (epoch, hlc, flags, node) shape and the same total order.
// Including the node id as the final tiebreak makes equal tuples impossible
// across the cluster.

mod hlc;

pub use hlc::Hlc;

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Cluster-unique node identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// What a transaction does to the keys it touches. Determines the conflict
/// relation used when computing dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnKind {
    /// Reads user data; conflicts with writes only.
    Read,
    /// Writes user data; conflicts with reads and writes.
    Write,
    /// Synthetic happens-before barrier without user payload.
    SyncPoint,
    /// Barrier that additionally forbids later-arriving transactions with
    /// earlier ids on its ranges.
    ExclusiveSyncPoint,
    /// Best-effort read driven by an explicit local timeout rather than the
    /// standard cleanup rules.
    EphemeralRead,
}

impl TxnKind {
    fn to_bits(self) -> u16 {
        match self {
            TxnKind::Read => 1,
            TxnKind::Write => 2,
            TxnKind::SyncPoint => 3,
            TxnKind::ExclusiveSyncPoint => 4,
            TxnKind::EphemeralRead => 5,
        }
    }

    fn from_bits(bits: u16) -> TxnKind {
        match bits & KIND_MASK {
            1 => TxnKind::Read,
            2 => TxnKind::Write,
            3 => TxnKind::SyncPoint,
            4 => TxnKind::ExclusiveSyncPoint,
            _ => TxnKind::EphemeralRead,
        }
    }

    /// Whether two transactions touching the same key must be ordered.
    ///
    /// Writes conflict with reads and writes; reads conflict with writes
    /// only; sync points conflict with everything.
    pub fn conflicts_with(self, other: TxnKind) -> bool {
        use TxnKind::*;
        match (self, other) {
            (SyncPoint, _) | (_, SyncPoint) => true,
            (ExclusiveSyncPoint, _) | (_, ExclusiveSyncPoint) => true,
            (Write, _) | (_, Write) => true,
            (Read, Read) | (Read, EphemeralRead) => false,
            (EphemeralRead, Read) | (EphemeralRead, EphemeralRead) => false,
        }
    }

    pub fn is_sync_point(self) -> bool {
        matches!(self, TxnKind::SyncPoint | TxnKind::ExclusiveSyncPoint)
    }

    /// Sync points carry no user payload and produce no read result.
    pub fn has_payload(self) -> bool {
        !self.is_sync_point()
    }
}

/// Whether a transaction addresses individual keys or whole ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyDomain {
    Key,
    Range,
}

const KIND_MASK: u16 = 0x0007;
const DOMAIN_BIT: u16 = 0x0008;

/// Packs a kind and domain into identifier flag bits.
pub fn pack_flags(kind: TxnKind, domain: KeyDomain) -> u16 {
    let mut flags = kind.to_bits();
    if domain == KeyDomain::Range {
        flags |= DOMAIN_BIT;
    }
    flags
}

/// A point in the cluster-wide hybrid logical order.
///
/// Total order is lexicographic over `(epoch, hlc, node, flags)`: ties on the
/// clock components break by node id first, then flags, so two distinct nodes
/// can never mint equal timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub epoch: u64,
    pub hlc: u64,
    pub flags: u16,
    pub node: NodeId,
}

impl Timestamp {
    pub const fn new(epoch: u64, hlc: u64, flags: u16, node: NodeId) -> Self {
        Self {
            epoch,
            hlc,
            flags,
            node,
        }
    }

    pub const fn min_value() -> Self {
        Timestamp::new(0, 0, 0, NodeId(0))
    }

    pub const fn max_value() -> Self {
        Timestamp::new(u64::MAX, u64::MAX, u16::MAX, NodeId(u32::MAX))
    }

    /// The immediately following point in the order, used when a conflict
    /// forces `execute_at` past a witnessed timestamp.
    pub fn next(self) -> Self {
        Timestamp::new(self.epoch, self.hlc + 1, self.flags, self.node)
    }

    /// Same logical instant re-stamped by `node`.
    pub fn with_node(self, node: NodeId) -> Self {
        Timestamp::new(self.epoch, self.hlc, self.flags, node)
    }

    pub fn with_epoch_at_least(self, epoch: u64) -> Self {
        if epoch > self.epoch {
            Timestamp::new(epoch, self.hlc, self.flags, self.node)
        } else {
            self
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.hlc.cmp(&other.hlc))
            .then_with(|| self.node.cmp(&other.node))
            .then_with(|| self.flags.cmp(&other.flags))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{},{}]", self.epoch, self.hlc, self.flags, self.node)
    }
}

/// Globally unique transaction identifier.
///
/// A `TxnId` is its own pre-accepted timestamp: on the fast path the
/// transaction executes exactly at its id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(pub Timestamp);

impl TxnId {
    pub fn new(epoch: u64, hlc: u64, kind: TxnKind, domain: KeyDomain, node: NodeId) -> Self {
        TxnId(Timestamp::new(epoch, hlc, pack_flags(kind, domain), node))
    }

    pub const fn min_value() -> Self {
        TxnId(Timestamp::min_value())
    }

    pub fn kind(self) -> TxnKind {
        TxnKind::from_bits(self.0.flags)
    }

    pub fn domain(self) -> KeyDomain {
        if self.0.flags & DOMAIN_BIT != 0 {
            KeyDomain::Range
        } else {
            KeyDomain::Key
        }
    }

    pub fn epoch(self) -> u64 {
        self.0.epoch
    }

    pub fn node(self) -> NodeId {
        self.0.node
    }

    /// The timestamp the transaction executes at when it takes the fast path.
    pub fn as_timestamp(self) -> Timestamp {
        self.0
    }

    pub fn conflicts_with(self, other: TxnId) -> bool {
        self.kind().conflicts_with(other.kind())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Recovery ballot. The counter lives in the `hlc` slot; a recovery
/// coordinator bumps it past every promise it has seen.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Ballot(pub Timestamp);

impl Ballot {
    pub const ZERO: Ballot = Ballot(Timestamp::min_value());

    pub fn new(epoch: u64, counter: u64, node: NodeId) -> Self {
        Ballot(Timestamp::new(epoch, counter, 0, node))
    }

    pub fn counter(self) -> u64 {
        self.0.hlc
    }

    /// The next ballot for `node`, strictly above `self`.
    pub fn successor(self, epoch: u64, node: NodeId) -> Ballot {
        Ballot::new(epoch.max(self.0.epoch), self.0.hlc + 1, node)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::min_value()
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b({},{},{})", self.0.epoch, self.0.hlc, self.0.node)
    }
}
