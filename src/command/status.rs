// Command status, phase and durability lattices.

use serde::{Deserialize, Serialize};

use crate::cfk::SummaryStatus;

/// Coarse protocol phase. Status transitions never move a command to a lower
/// phase; within the Accept phase, ties break by ballot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Phase {
    None,
    PreAccept,
    Accept,
    Commit,
    Execute,
    Persist,
    Cleanup,
    Invalidate,
}

/// The per-replica status of one transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SaveStatus {
    /// Witnessed only by reference (e.g. as a dependency).
    NotDefined,
    /// PreAccept processed; local execute_at and deps recorded.
    PreAccepted,
    /// A recovery ballot was promised before the transaction itself was
    /// witnessed here.
    PreNotAccepted,
    /// A recovery ballot was promised over a witnessed but undecided
    /// transaction.
    NotAccepted,
    /// An invalidation proposal was accepted under a ballot.
    AcceptedInvalidate,
    /// Accept with coordinator-fixed deps.
    AcceptedMedium,
    /// Accept still open to late-witnessed conflicts.
    AcceptedSlow,
    /// execute_at is known without deps; enough to exclude this command
    /// from later dependency sets, not enough to execute it.
    PreCommitted,
    Committed,
    /// Committed with final deps; the execution set is frozen.
    Stable,
    /// Outcome applied locally but dependencies may still be pending
    /// durability.
    PreApplied,
    Applied,
    /// State partially or wholly garbage collected.
    Truncated,
    /// The transaction will never commit. Terminal.
    Invalidated,
}

impl SaveStatus {
    pub fn phase(self) -> Phase {
        use SaveStatus::*;
        match self {
            NotDefined => Phase::None,
            PreAccepted | PreNotAccepted => Phase::PreAccept,
            NotAccepted | AcceptedInvalidate | AcceptedMedium | AcceptedSlow => Phase::Accept,
            PreCommitted | Committed => Phase::Commit,
            Stable | PreApplied => Phase::Execute,
            Applied => Phase::Persist,
            Truncated => Phase::Cleanup,
            Invalidated => Phase::Invalidate,
        }
    }

    /// Whether `execute_at` is decided at this status.
    pub fn has_execute_at(self) -> bool {
        self >= SaveStatus::PreCommitted && self != SaveStatus::Invalidated
    }

    /// Whether the execution dependency set is final.
    pub fn has_stable_deps(self) -> bool {
        matches!(
            self,
            SaveStatus::Stable | SaveStatus::PreApplied | SaveStatus::Applied
        )
    }

    pub fn is_decided(self) -> bool {
        self.phase() >= Phase::Commit
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SaveStatus::Applied | SaveStatus::Truncated | SaveStatus::Invalidated
        )
    }

    /// The compressed form recorded in CommandsForKey, if this status is
    /// representable there.
    pub fn summary(self) -> Option<SummaryStatus> {
        use SaveStatus::*;
        match self {
            NotDefined | PreNotAccepted | Truncated => None,
            PreAccepted | NotAccepted => Some(SummaryStatus::PreAccepted),
            AcceptedInvalidate | AcceptedMedium | AcceptedSlow => Some(SummaryStatus::Accepted),
            PreCommitted => Some(SummaryStatus::PreCommitted),
            Committed => Some(SummaryStatus::Committed),
            Stable | PreApplied => Some(SummaryStatus::Stable),
            Applied => Some(SummaryStatus::Applied),
            Invalidated => Some(SummaryStatus::Invalidated),
        }
    }
}

/// How durably the outcome is replicated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Durability {
    #[default]
    NotDurable,
    /// Applied locally.
    Local,
    /// Durable on every replica of the local shard.
    ShardUniversal,
    /// Durable on a majority of every shard; or known invalidated.
    MajorityOrInvalidated,
    Majority,
    /// Durable on every replica of every shard; or known invalidated.
    UniversalOrInvalidated,
    Universal,
}

impl Durability {
    pub fn is_durable(self) -> bool {
        self >= Durability::MajorityOrInvalidated
    }

    pub fn is_universal(self) -> bool {
        self >= Durability::UniversalOrInvalidated
    }
}
