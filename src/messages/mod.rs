// Protocol messages.
//
// One enum per direction: `Request` fans out from a coordinator (original or
// recovery), `Reply` comes back through the reply context. Every request
// carries the same header; every reply is either a payload or a `Nack`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cleanup::DurableBefore;
use crate::command::{AcceptKind, Data, PartialTxn, SaveStatus, Update};
use crate::deps::{Deps, LatestDeps};
use crate::error::{ProtocolError, Result};
use crate::routables::{Keys, Ranges, Route};
use crate::time::{Ballot, NodeId, Timestamp, TxnId};

/// Opaque handle a server passes back so the reply finds its way to the
/// requesting coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub request_id: u64,
    pub source: NodeId,
    /// Coordination deadline, in the coordinator's clock domain.
    pub expires_at: Option<u64>,
}

/// Common request header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub txn_id: TxnId,
    /// The recipient must know this epoch before processing.
    pub wait_for_epoch: u64,
    /// Ranges the recipient should apply the request to.
    pub scope: Ranges,
    pub reply: ReplyContext,
}

/// How a commit message is flavoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitKind {
    /// Commit without stabilising; deps may still be incomplete.
    CommitSlowPath,
    /// Fast-path stabilise: `execute_at == txn_id`, deps from PreAccept.
    StableFastPath,
    /// Slow-path stabilise after an Accept round.
    StableSlowPath,
    /// Stabilise carrying the full txn and deps for recipients that lack
    /// them.
    StableWithTxnAndDeps,
    /// Retry of a commit the recipient nacked as Insufficient.
    CommitWithTxn,
}

impl CommitKind {
    pub fn stabilises(self) -> bool {
        !matches!(self, CommitKind::CommitSlowPath | CommitKind::CommitWithTxn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    PreAccept {
        txn: PartialTxn,
        route: Route,
    },
    Accept {
        ballot: Ballot,
        kind: AcceptKind,
        execute_at: Option<Timestamp>,
        deps: Deps,
        route: Route,
    },
    Commit {
        kind: CommitKind,
        ballot: Ballot,
        execute_at: Timestamp,
        deps: Option<Deps>,
        txn: Option<PartialTxn>,
        route: Route,
    },
    /// Issued during Execute to the read set; answered once local
    /// dependencies have applied.
    Read {
        execute_at: Timestamp,
        keys: Keys,
    },
    Apply {
        execute_at: Timestamp,
        deps: Deps,
        update: Option<Update>,
        result: Bytes,
        route: Route,
    },
    BeginRecovery {
        ballot: Ballot,
        route: Route,
    },
    /// Commit the decision that the transaction never happens.
    Invalidate {
        ballot: Ballot,
    },
    /// Ask a replica what it knows; used by the progress log.
    CheckStatus,
    /// Fetch missing state for the given ranges.
    FetchData {
        ranges: Ranges,
    },
    SetShardDurable {
        execute_at: Timestamp,
    },
    SetGloballyDurable {
        durable_before: DurableBefore,
    },
    QueryDurableBefore {
        ranges: Ranges,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::PreAccept { .. } => "preaccept",
            Request::Accept { .. } => "accept",
            Request::Commit { .. } => "commit",
            Request::Read { .. } => "read",
            Request::Apply { .. } => "apply",
            Request::BeginRecovery { .. } => "begin_recovery",
            Request::Invalidate { .. } => "invalidate",
            Request::CheckStatus => "check_status",
            Request::FetchData { .. } => "fetch_data",
            Request::SetShardDurable { .. } => "set_shard_durable",
            Request::SetGloballyDurable { .. } => "set_globally_durable",
            Request::QueryDurableBefore { .. } => "query_durable_before",
        }
    }
}

/// Failure replies; anything else is an `Ok` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Nack {
    /// The replica lacks the state to act; retry with a superset.
    Insufficient,
    /// The transaction already progressed past the requested phase.
    Redundant { execute_at: Option<Timestamp> },
    /// A higher ballot has been promised.
    Rejected { promised: Ballot },
    /// State needed for the request has been garbage collected here.
    Truncated,
    /// Malformed or unserviceable request.
    Invalid,
}

impl Nack {
    /// The error a driver should surface when it receives this nack for
    /// `txn_id`.
    pub fn into_error(self, txn_id: TxnId) -> ProtocolError {
        match self {
            Nack::Insufficient => ProtocolError::Insufficient,
            Nack::Redundant { execute_at } => ProtocolError::Redundant {
                txn_id,
                committed_execute_at: execute_at,
            },
            Nack::Rejected { promised } => ProtocolError::Preempted {
                txn_id,
                by: promised,
            },
            Nack::Truncated => ProtocolError::Truncated { txn_id },
            Nack::Invalid => ProtocolError::Internal("invalid request".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    PreAcceptOk {
        /// The replica's execute_at vote; equals the txn id on a fast-path
        /// vote.
        witnessed_at: Timestamp,
        deps: Deps,
    },
    AcceptOk {
        /// Late-witnessed conflicts (slow path); empty on the medium path.
        deps: Deps,
    },
    CommitOk,
    ReadOk {
        data: Data,
    },
    ApplyOk,
    RecoverOk {
        status: SaveStatus,
        accepted: Ballot,
        execute_at: Option<Timestamp>,
        latest_deps: LatestDeps,
        /// Whether this replica's PreAccept vote was `execute_at == txn_id`.
        voted_fast: bool,
        /// Whether this replica witnessed a conflicting transaction that
        /// rules out the fast path for the transaction being recovered.
        rejects_fast_path: bool,
        route: Option<Route>,
        txn: Option<PartialTxn>,
        result: Option<Bytes>,
    },
    CheckStatusOk {
        status: SaveStatus,
        promised: Ballot,
        execute_at: Option<Timestamp>,
        route: Option<Route>,
    },
    FetchOk {
        status: SaveStatus,
        txn: Option<PartialTxn>,
        deps: Option<Deps>,
        execute_at: Option<Timestamp>,
        result: Option<Bytes>,
    },
    DurableBeforeOk {
        durable_before: DurableBefore,
    },
    Nack(Nack),
}

impl Reply {
    pub fn is_nack(&self) -> bool {
        matches!(self, Reply::Nack(_))
    }
}

/// What travels between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Request {
        header: RequestHeader,
        request: Request,
    },
    Reply {
        request_id: u64,
        txn_id: TxnId,
        reply: Reply,
    },
}

/// A packet plus addressing and the sender's clock sample; receivers feed
/// the sample to their HLC before acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub clock: u64,
    pub packet: Packet,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        let (envelope, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routables::{RouteParts, RoutingKey, RoutingKeys};
    use crate::time::{KeyDomain, TxnKind};

    fn header() -> RequestHeader {
        RequestHeader {
            txn_id: TxnId::new(1, 7, TxnKind::Write, KeyDomain::Key, NodeId(1)),
            wait_for_epoch: 1,
            scope: Ranges::EMPTY,
            reply: ReplyContext {
                request_id: 42,
                source: NodeId(1),
                expires_at: None,
            },
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope {
            from: NodeId(1),
            to: NodeId(2),
            clock: 99,
            packet: Packet::Request {
                header: header(),
                request: Request::PreAccept {
                    txn: crate::command::empty_system_txn(TxnKind::SyncPoint, KeyDomain::Range),
                    route: Route::full(
                        RoutingKey::from("k"),
                        RouteParts::Keys(RoutingKeys::single(RoutingKey::from("k"))),
                    ),
                },
            },
        };
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_nack_error_mapping() {
        let txn_id = TxnId::new(1, 7, TxnKind::Write, KeyDomain::Key, NodeId(1));
        assert!(matches!(
            Nack::Truncated.into_error(txn_id),
            ProtocolError::Truncated { .. }
        ));
        assert!(matches!(
            Nack::Rejected {
                promised: Ballot::new(1, 2, NodeId(2))
            }
            .into_error(txn_id),
            ProtocolError::Preempted { .. }
        ));
        assert!(matches!(
            Nack::Redundant { execute_at: None }.into_error(txn_id),
            ProtocolError::Redundant { .. }
        ));
        assert!(matches!(
            Nack::Insufficient.into_error(txn_id),
            ProtocolError::Insufficient
        ));
    }

    #[test]
    fn test_commit_kind_stabilises() {
        assert!(CommitKind::StableFastPath.stabilises());
        assert!(CommitKind::StableSlowPath.stabilises());
        assert!(CommitKind::StableWithTxnAndDeps.stabilises());
        assert!(!CommitKind::CommitSlowPath.stabilises());
        assert!(!CommitKind::CommitWithTxn.stabilises());
    }
}
