use thiserror::Error;

use crate::time::{Ballot, Timestamp, TxnId};

/// Protocol-level failure surfaced to a coordination callback or, when no
/// callback remains, to the embedding agent. Errors are never raised
/// asynchronously across task boundaries; they travel as values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("timed out during {phase} for {txn_id}")]
    Timeout { txn_id: TxnId, phase: &'static str },

    #[error("preempted by ballot {by} for {txn_id}")]
    Preempted { txn_id: TxnId, by: Ballot },

    #[error("transaction {txn_id} was invalidated")]
    Invalidated { txn_id: TxnId },

    #[error("transaction {txn_id} already progressed past the requested phase")]
    Redundant {
        txn_id: TxnId,
        committed_execute_at: Option<Timestamp>,
    },

    #[error("state required for {txn_id} has been truncated")]
    Truncated { txn_id: TxnId },

    #[error("not enough non-faulty replicas to contact for {txn_id}")]
    Exhausted { txn_id: TxnId },

    #[error("topology mismatch: {reason:?}")]
    TopologyMismatch { reason: TopologyMismatchKind },

    #[error("replica lacks the state needed to serve the request")]
    Insufficient,

    #[error("simulated fault injected by the test harness")]
    SimulatedFault,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Why a route no longer fits the current topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyMismatchKind {
    /// The home key moved; retry against a fresh topology.
    HomeKey,
    /// The requested keys or ranges are no longer coordinated together. Fatal.
    KeysOrRanges,
}

impl ProtocolError {
    /// Transient errors are retried with backoff through the timer wheel;
    /// everything else terminates the coordination.
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Timeout { .. }
            | ProtocolError::Preempted { .. }
            | ProtocolError::Insufficient
            | ProtocolError::SimulatedFault => true,
            ProtocolError::Truncated { .. } => true,
            ProtocolError::TopologyMismatch { reason } => {
                *reason != TopologyMismatchKind::KeysOrRanges
            }
            ProtocolError::Invalidated { .. }
            | ProtocolError::Redundant { .. }
            | ProtocolError::Exhausted { .. }
            | ProtocolError::Serialization(_)
            | ProtocolError::Internal(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for ProtocolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ProtocolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::NodeId;

    #[test]
    fn test_transient_classification() {
        let id = TxnId::min_value();
        assert!(ProtocolError::Timeout {
            txn_id: id,
            phase: "preaccept"
        }
        .is_transient());
        assert!(!ProtocolError::Invalidated { txn_id: id }.is_transient());
        assert!(!ProtocolError::Exhausted { txn_id: id }.is_transient());
        assert!(ProtocolError::Truncated { txn_id: id }.is_transient());
        assert!(ProtocolError::TopologyMismatch {
            reason: TopologyMismatchKind::HomeKey
        }
        .is_transient());
        assert!(!ProtocolError::TopologyMismatch {
            reason: TopologyMismatchKind::KeysOrRanges
        }
        .is_transient());
    }

    #[test]
    fn test_preempted_display_names_ballot() {
        let err = ProtocolError::Preempted {
            txn_id: TxnId::min_value(),
            by: Ballot::new(1, 3, NodeId(2)),
        };
        let text = err.to_string();
        assert!(text.contains("preempted"));
    }
}
