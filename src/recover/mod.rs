// The take-over coordinator.
//
// When the progress log suspects a coordinator, any replica of the home
// shard starts recovery: bump the ballot, gather what a quorum knows, and
// drive the transaction to the same deterministic outcome the original
// coordinator would have produced. Correctness rests on replicas recording
// promises monotonically and on the `LatestDeps` merge being order
// independent.

use bytes::Bytes;
use tracing::{debug, info};

use crate::command::{AcceptKind, Data, PartialTxn, SaveStatus};
use crate::coordinate::{encode_data, CoordinatorContext, Outbound};
use crate::deps::{Deps, DepsKnownLevel, LatestDeps};
use crate::error::{ProtocolError, Result};
use crate::messages::{CommitKind, Nack, Reply, Request};
use crate::routables::Route;
use crate::time::{Ballot, NodeId, Timestamp, TxnId};
use crate::topology::Topologies;
use crate::trackers::{QuorumTracker, ReadTracker, RequestStatus};

/// What one replica reported to `BeginRecovery`.
struct Gathered {
    from: NodeId,
    status: SaveStatus,
    execute_at: Option<Timestamp>,
    voted_fast: bool,
    rejects_fast_path: bool,
    txn: Option<PartialTxn>,
    result: Option<Bytes>,
}

enum RecoverState {
    Start,
    Gathering {
        tracker: QuorumTracker,
        replies: Vec<Gathered>,
        latest: LatestDeps,
    },
    Accepting {
        tracker: QuorumTracker,
        execute_at: Timestamp,
        deps: Deps,
    },
    Invalidating {
        tracker: QuorumTracker,
    },
    Stabilising {
        tracker: QuorumTracker,
        execute_at: Timestamp,
        deps: Deps,
    },
    Reading {
        tracker: ReadTracker,
        execute_at: Timestamp,
        deps: Deps,
        data: Data,
    },
    Applying {
        tracker: QuorumTracker,
        replied: bool,
    },
    Done,
}

pub type RecoveryCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// One recovery attempt at one ballot.
pub struct Recovery {
    txn_id: TxnId,
    route: Route,
    ballot: Ballot,
    topologies: Topologies,
    txn: Option<PartialTxn>,
    state: RecoverState,
    callback: Option<RecoveryCallback>,
    is_done: bool,
}

impl Recovery {
    pub fn new(
        txn_id: TxnId,
        route: Route,
        prior_ballot: Ballot,
        ctx: &impl CoordinatorContext,
        callback: RecoveryCallback,
    ) -> Result<Self> {
        let ballot = prior_ballot.successor(txn_id.epoch(), ctx.node_id());
        let topologies =
            ctx.unsynced_topologies(route.parts(), txn_id.epoch(), txn_id.epoch())?;
        Ok(Self {
            txn_id,
            route,
            ballot,
            topologies,
            txn: None,
            state: RecoverState::Start,
            callback: Some(callback),
            is_done: false,
        })
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn is_done(&self) -> bool {
        self.is_done
    }

    /// The recovery deadline passed; a later attempt will bump the ballot
    /// again.
    pub fn on_expired(&mut self) {
        if !self.is_done {
            self.finish(Err(ProtocolError::Timeout {
                txn_id: self.txn_id,
                phase: "recovery",
            }));
        }
    }

    pub fn start(&mut self, ctx: &mut impl CoordinatorContext) {
        info!(txn_id = %self.txn_id, ballot = %self.ballot, "beginning recovery");
        let tracker = QuorumTracker::new(&self.topologies, &ctx.faulty());
        for node in self.topologies.nodes() {
            ctx.push(Outbound {
                to: node,
                wait_for_epoch: self.txn_id.epoch(),
                scope: self.route.covering(),
                request: Request::BeginRecovery {
                    ballot: self.ballot,
                    route: self.route.clone(),
                },
            });
        }
        self.state = RecoverState::Gathering {
            tracker,
            replies: Vec::new(),
            latest: LatestDeps::EMPTY,
        };
    }

    fn finish(&mut self, outcome: Result<()>) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
        self.is_done = true;
    }

    pub fn on_reply(&mut self, ctx: &mut impl CoordinatorContext, from: NodeId, reply: Reply) {
        if matches!(self.state, RecoverState::Done) {
            return;
        }
        match reply {
            Reply::RecoverOk {
                status,
                accepted: _,
                execute_at,
                latest_deps,
                voted_fast,
                rejects_fast_path,
                route,
                txn,
                result,
            } => {
                if let Some(route) = &route {
                    self.route = self.route.supplement(route);
                }
                if let Some(txn) = &txn {
                    self.txn = Some(match &self.txn {
                        Some(existing) => existing.merge(txn),
                        None => txn.clone(),
                    });
                }
                self.on_recover_ok(
                    ctx,
                    Gathered {
                        from,
                        status,
                        execute_at,
                        voted_fast,
                        rejects_fast_path,
                        txn,
                        result,
                    },
                    latest_deps,
                );
            }
            Reply::AcceptOk { deps } => self.on_accept_ok(ctx, from, deps),
            Reply::CommitOk => self.on_commit_ok(ctx, from),
            Reply::ReadOk { data } => self.on_read_ok(ctx, from, data),
            Reply::ApplyOk => self.on_apply_ok(ctx, from),
            Reply::Nack(Nack::Rejected { promised }) => {
                // A still-higher ballot is out there: yield.
                self.finish(Err(ProtocolError::Preempted {
                    txn_id: self.txn_id,
                    by: promised,
                }));
            }
            Reply::Nack(Nack::Redundant { .. }) => {
                // The transaction finished behind our back; that is the
                // outcome recovery wanted.
                self.finish(Ok(()));
            }
            Reply::Nack(Nack::Truncated) => {
                // The replica garbage collected this transaction's state.
                // Transient: a later attempt consults replicas that still
                // hold it, or finds the watermarks have settled the outcome.
                self.finish(Err(ProtocolError::Truncated {
                    txn_id: self.txn_id,
                }));
            }
            Reply::Nack(Nack::Insufficient) => {
                if let RecoverState::Stabilising {
                    execute_at, deps, ..
                } = &self.state
                {
                    ctx.push(Outbound {
                        to: from,
                        wait_for_epoch: execute_at.epoch,
                        scope: self.route.covering(),
                        request: Request::Commit {
                            kind: CommitKind::StableWithTxnAndDeps,
                            ballot: self.ballot,
                            execute_at: *execute_at,
                            deps: Some(deps.clone()),
                            txn: self.txn.clone(),
                            route: self.route.clone(),
                        },
                    });
                }
            }
            Reply::Nack(Nack::Invalid) => {
                self.finish(Err(ProtocolError::Internal("invalid recovery request".into())));
            }
            _ => {}
        }
    }

    fn on_recover_ok(
        &mut self,
        ctx: &mut impl CoordinatorContext,
        gathered: Gathered,
        latest_deps: LatestDeps,
    ) {
        let RecoverState::Gathering {
            tracker,
            replies,
            latest,
        } = &mut self.state
        else {
            return;
        };
        *latest = LatestDeps::merge(latest, &latest_deps);
        let from = gathered.from;
        replies.push(gathered);
        match tracker.record_success(from) {
            RequestStatus::NoChange => {}
            RequestStatus::Failed => self.finish(Err(ProtocolError::Exhausted {
                txn_id: self.txn_id,
            })),
            RequestStatus::Success => self.decide(ctx),
        }
    }

    /// The decision ladder over a quorum of promises.
    fn decide(&mut self, ctx: &mut impl CoordinatorContext) {
        let RecoverState::Gathering {
            replies, latest, ..
        } = std::mem::replace(&mut self.state, RecoverState::Done)
        else {
            return;
        };

        // An already-decided outcome propagates as-is.
        if replies.iter().any(|r| r.status == SaveStatus::Invalidated) {
            return self.go_invalidate(ctx);
        }
        if let Some(applied) = replies
            .iter()
            .find(|r| r.status >= SaveStatus::PreApplied && r.status < SaveStatus::Truncated)
        {
            let execute_at = applied.execute_at.expect("applied implies execute_at");
            let result = applied.result.clone().unwrap_or_default();
            let deps = latest.merge_proposal();
            debug!(txn_id = %self.txn_id, "recovery found applied outcome; disseminating");
            return self.go_apply(ctx, execute_at, deps, result);
        }
        if let Some(committed) = replies.iter().find(|r| {
            matches!(r.status, SaveStatus::Committed | SaveStatus::Stable)
        }) {
            // Re-commit with the decided timestamp and deps.
            let execute_at = committed.execute_at.expect("committed implies execute_at");
            let deps = latest.merge_proposal();
            debug!(txn_id = %self.txn_id, %execute_at, "recovery re-committing decided txn");
            return self.go_stabilise(ctx, execute_at, deps);
        }

        // A truncated witness is not a live vote: the state needed to
        // reconstruct the transaction was garbage collected there, and with
        // no decided copy in the quorum there is nothing sound to
        // re-propose from.
        if replies.iter().any(|r| r.status == SaveStatus::Truncated) {
            debug!(txn_id = %self.txn_id, "recovery found truncated state; yielding");
            return self.finish(Err(ProtocolError::Truncated {
                txn_id: self.txn_id,
            }));
        }

        // Nobody witnessed the transaction at all: it can never commit.
        if !replies
            .iter()
            .any(|r| r.status >= SaveStatus::PreAccepted && r.status != SaveStatus::PreNotAccepted)
        {
            debug!(txn_id = %self.txn_id, "recovery found no witness; invalidating");
            return self.go_invalidate(ctx);
        }

        let accept_witnessed = latest.max_level() >= DepsKnownLevel::ProposedFixed
            || replies.iter().any(|r| {
                matches!(
                    r.status,
                    SaveStatus::AcceptedMedium
                        | SaveStatus::AcceptedSlow
                        | SaveStatus::AcceptedInvalidate
                )
            });

        if !accept_witnessed && self.fast_path_provable(&replies) {
            // No Accept anywhere, a fast quorum voted `execute_at ==
            // txn_id`, and no witness saw a blocking conflict: complete the
            // fast path with the union of PreAccept deps.
            let deps = latest.merge_proposal();
            debug!(txn_id = %self.txn_id, "recovery completing fast path");
            return self.go_stabilise(ctx, self.txn_id.as_timestamp(), deps);
        }

        // Slow path: the maximum witnessed timestamp dominates every vote.
        // A proposal that was already fixed under a ballot is re-proposed
        // verbatim (medium flavour); otherwise replicas may keep adding
        // late-witnessed conflicts.
        let execute_at = replies
            .iter()
            .filter_map(|r| r.execute_at)
            .max()
            .unwrap_or(self.txn_id.as_timestamp());
        let deps = latest.merge_proposal();
        let kind = if latest.max_level() >= DepsKnownLevel::ProposedFixed {
            AcceptKind::Medium
        } else {
            AcceptKind::Slow
        };
        debug!(txn_id = %self.txn_id, %execute_at, ?kind, "recovery re-proposing");
        self.go_accept(ctx, execute_at, deps, kind);
    }

    /// Whether the original coordinator may have committed on the fast
    /// path, which (strict equality on `execute_at == txn_id`) is also the
    /// condition under which we must complete it.
    fn fast_path_provable(&self, replies: &[Gathered]) -> bool {
        if replies.iter().any(|r| r.rejects_fast_path) {
            return false;
        }
        for topology in self.topologies.iter() {
            for shard in topology.shards_for(self.route.parts()) {
                let members: Vec<&Gathered> = replies
                    .iter()
                    .filter(|r| shard.contains_node(r.from))
                    .collect();
                let fast_votes = members
                    .iter()
                    .filter(|r| {
                        r.voted_fast && shard.fast_path_electorate().contains(&r.from)
                    })
                    .count();
                // Any fast quorum intersects our reply set in at least
                // `fq + |replies| - rs` members; if fewer of ours voted
                // fast, no fast quorum can have existed.
                let rs = shard.replication_factor();
                let min_intersection = (shard.fast_quorum_size() + members.len())
                    .saturating_sub(rs)
                    .max(1);
                if fast_votes < min_intersection {
                    return false;
                }
            }
        }
        true
    }

    fn go_accept(
        &mut self,
        ctx: &mut impl CoordinatorContext,
        execute_at: Timestamp,
        deps: Deps,
        kind: AcceptKind,
    ) {
        let topologies = match ctx.unsynced_topologies(
            self.route.parts(),
            self.txn_id.epoch(),
            execute_at.epoch,
        ) {
            Ok(t) => t,
            Err(e) => return self.finish(Err(e)),
        };
        let tracker = QuorumTracker::new(&topologies, &ctx.faulty());
        for node in topologies.nodes() {
            ctx.push(Outbound {
                to: node,
                wait_for_epoch: execute_at.epoch,
                scope: self.route.covering(),
                request: Request::Accept {
                    ballot: self.ballot,
                    kind,
                    execute_at: Some(execute_at),
                    deps: deps.clone(),
                    route: self.route.clone(),
                },
            });
        }
        self.topologies = topologies;
        self.state = RecoverState::Accepting {
            tracker,
            execute_at,
            deps,
        };
    }

    fn on_accept_ok(&mut self, ctx: &mut impl CoordinatorContext, from: NodeId, reply_deps: Deps) {
        let RecoverState::Accepting {
            tracker,
            execute_at,
            deps,
        } = &mut self.state
        else {
            return;
        };
        *deps = deps.with(&reply_deps);
        match tracker.record_success(from) {
            RequestStatus::NoChange => {}
            RequestStatus::Failed => self.finish(Err(ProtocolError::Exhausted {
                txn_id: self.txn_id,
            })),
            RequestStatus::Success => {
                let execute_at = *execute_at;
                let deps = deps.clone();
                self.go_stabilise(ctx, execute_at, deps);
            }
        }
    }

    fn go_invalidate(&mut self, ctx: &mut impl CoordinatorContext) {
        let tracker = QuorumTracker::new(&self.topologies, &ctx.faulty());
        for node in self.topologies.nodes() {
            ctx.push(Outbound {
                to: node,
                wait_for_epoch: self.txn_id.epoch(),
                scope: self.route.covering(),
                request: Request::Invalidate {
                    ballot: self.ballot,
                },
            });
        }
        self.state = RecoverState::Invalidating { tracker };
    }

    fn go_stabilise(
        &mut self,
        ctx: &mut impl CoordinatorContext,
        execute_at: Timestamp,
        deps: Deps,
    ) {
        let topologies = match ctx.unsynced_topologies(
            self.route.parts(),
            self.txn_id.epoch(),
            execute_at.epoch,
        ) {
            Ok(t) => t,
            Err(e) => return self.finish(Err(e)),
        };
        let tracker = QuorumTracker::new(&topologies, &ctx.faulty());
        for node in topologies.nodes() {
            ctx.push(Outbound {
                to: node,
                wait_for_epoch: execute_at.epoch,
                scope: self.route.covering(),
                request: Request::Commit {
                    kind: CommitKind::StableWithTxnAndDeps,
                    ballot: self.ballot,
                    execute_at,
                    deps: Some(deps.clone()),
                    txn: self.txn.clone(),
                    route: self.route.clone(),
                },
            });
        }
        self.topologies = topologies;
        self.state = RecoverState::Stabilising {
            tracker,
            execute_at,
            deps,
        };
    }

    fn on_commit_ok(&mut self, ctx: &mut impl CoordinatorContext, from: NodeId) {
        match &mut self.state {
            RecoverState::Invalidating { tracker } => match tracker.record_success(from) {
                RequestStatus::NoChange => {}
                RequestStatus::Failed => self.finish(Err(ProtocolError::Exhausted {
                    txn_id: self.txn_id,
                })),
                RequestStatus::Success => {
                    self.state = RecoverState::Done;
                    self.finish(Err(ProtocolError::Invalidated {
                        txn_id: self.txn_id,
                    }));
                }
            },
            RecoverState::Stabilising {
                tracker,
                execute_at,
                deps,
            } => match tracker.record_success(from) {
                RequestStatus::NoChange => {}
                RequestStatus::Failed => self.finish(Err(ProtocolError::Exhausted {
                    txn_id: self.txn_id,
                })),
                RequestStatus::Success => {
                    let execute_at = *execute_at;
                    let deps = deps.clone();
                    self.go_read(ctx, execute_at, deps);
                }
            },
            _ => {}
        }
    }

    fn go_read(&mut self, ctx: &mut impl CoordinatorContext, execute_at: Timestamp, deps: Deps) {
        let read = self
            .txn
            .as_ref()
            .map(|t| t.read.clone())
            .unwrap_or(crate::routables::Keys::EMPTY);
        if read.is_empty() {
            let result = encode_data(&Data::default());
            return self.go_apply(ctx, execute_at, deps, result);
        }
        let topologies = match ctx.epoch_topologies(execute_at.epoch) {
            Ok(t) => t,
            Err(e) => return self.finish(Err(e)),
        };
        let mut tracker = ReadTracker::new(&topologies, &ctx.faulty());
        let contacts = tracker.initial_contacts(&[ctx.node_id()]);
        for node in contacts {
            ctx.push(Outbound {
                to: node,
                wait_for_epoch: execute_at.epoch,
                scope: self.route.covering(),
                request: Request::Read {
                    execute_at,
                    keys: read.clone(),
                },
            });
        }
        self.state = RecoverState::Reading {
            tracker,
            execute_at,
            deps,
            data: Data::default(),
        };
    }

    fn on_read_ok(&mut self, ctx: &mut impl CoordinatorContext, from: NodeId, data: Data) {
        let RecoverState::Reading {
            tracker,
            execute_at,
            deps,
            data: acc,
        } = &mut self.state
        else {
            return;
        };
        acc.merge(data);
        match tracker.record_success(from) {
            RequestStatus::NoChange => {}
            RequestStatus::Failed => self.finish(Err(ProtocolError::Exhausted {
                txn_id: self.txn_id,
            })),
            RequestStatus::Success => {
                let execute_at = *execute_at;
                let deps = deps.clone();
                let result = encode_data(acc);
                self.go_apply(ctx, execute_at, deps, result);
            }
        }
    }

    fn go_apply(
        &mut self,
        ctx: &mut impl CoordinatorContext,
        execute_at: Timestamp,
        deps: Deps,
        result: Bytes,
    ) {
        let topologies = match ctx.epoch_topologies(execute_at.epoch) {
            Ok(t) => t,
            Err(e) => return self.finish(Err(e)),
        };
        let tracker = QuorumTracker::new(&topologies, &ctx.faulty());
        let update = self.txn.as_ref().and_then(|t| t.update.clone());
        for node in topologies.nodes() {
            ctx.push(Outbound {
                to: node,
                wait_for_epoch: execute_at.epoch,
                scope: self.route.covering(),
                request: Request::Apply {
                    execute_at,
                    deps: deps.clone(),
                    update: update.clone(),
                    result: result.clone(),
                    route: self.route.clone(),
                },
            });
        }
        self.topologies = topologies;
        self.state = RecoverState::Applying {
            tracker,
            replied: false,
        };
    }

    fn on_apply_ok(&mut self, _ctx: &mut impl CoordinatorContext, from: NodeId) {
        let RecoverState::Applying { tracker, replied } = &mut self.state else {
            return;
        };
        if tracker.record_success(from) == RequestStatus::Success && !*replied {
            *replied = true;
            info!(txn_id = %self.txn_id, "recovery completed");
            self.finish(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::config::ProtocolConfig;
    use crate::routables::{KeyRange, RouteParts, RoutingKey, RoutingKeys};
    use crate::time::{KeyDomain, TxnKind};
    use crate::topology::{Shard, Topology};

    struct TestCtx {
        node: NodeId,
        config: ProtocolConfig,
        topologies: Topologies,
        sent: Vec<Outbound>,
    }

    impl CoordinatorContext for TestCtx {
        fn node_id(&self) -> NodeId {
            self.node
        }
        fn config(&self) -> &ProtocolConfig {
            &self.config
        }
        fn faulty(&self) -> BTreeSet<NodeId> {
            BTreeSet::new()
        }
        fn unsynced_topologies(
            &self,
            _parts: &RouteParts,
            _min: u64,
            _max: u64,
        ) -> Result<Topologies> {
            Ok(self.topologies.clone())
        }
        fn epoch_topologies(&self, _epoch: u64) -> Result<Topologies> {
            Ok(self.topologies.clone())
        }
        fn push(&mut self, outbound: Outbound) {
            self.sent.push(outbound);
        }
    }

    fn ctx() -> TestCtx {
        let shard = Shard::with_all_fast(
            KeyRange::new(RoutingKey::from("a"), RoutingKey::from("z")),
            vec![NodeId(1), NodeId(2), NodeId(3)],
        );
        TestCtx {
            node: NodeId(2),
            config: ProtocolConfig::default(),
            topologies: Topologies::single(Topology::new(1, vec![shard])),
            sent: Vec::new(),
        }
    }

    fn route() -> Route {
        Route::full(
            RoutingKey::from("k"),
            RouteParts::Keys(RoutingKeys::single(RoutingKey::from("k"))),
        )
    }

    fn txn_id() -> TxnId {
        TxnId::new(1, 100, TxnKind::Write, KeyDomain::Key, NodeId(1))
    }

    fn recover_ok(
        status: SaveStatus,
        execute_at: Option<Timestamp>,
        voted_fast: bool,
    ) -> Reply {
        Reply::RecoverOk {
            status,
            accepted: Ballot::ZERO,
            execute_at,
            latest_deps: LatestDeps::EMPTY,
            voted_fast,
            rejects_fast_path: false,
            route: Some(route()),
            txn: Some(PartialTxn {
                kind: TxnKind::Write,
                scope: RouteParts::Keys(RoutingKeys::single(RoutingKey::from("k"))),
                read: crate::routables::Keys::EMPTY,
                update: None,
            }),
            result: None,
        }
    }

    fn recovery(ctx: &TestCtx) -> Recovery {
        Recovery::new(
            txn_id(),
            route(),
            Ballot::ZERO,
            ctx,
            Box::new(|_| {}),
        )
        .unwrap()
    }

    #[test]
    fn test_ballot_is_bumped() {
        let ctx = ctx();
        let r = recovery(&ctx);
        assert!(r.ballot() > Ballot::ZERO);
        assert_eq!(r.ballot().0.node, NodeId(2));
    }

    #[test]
    fn test_preaccept_only_fast_votes_completes_fast_path() {
        let mut ctx = ctx();
        let mut r = recovery(&ctx);
        r.start(&mut ctx);
        ctx.sent.clear();

        let fast = txn_id().as_timestamp();
        r.on_reply(&mut ctx, NodeId(1), recover_ok(SaveStatus::NotAccepted, Some(fast), true));
        r.on_reply(&mut ctx, NodeId(3), recover_ok(SaveStatus::NotAccepted, Some(fast), true));

        // 3-replica shard: fast quorum is all 3, min intersection with a
        // 2-reply quorum is 2; both voted fast, so the fast path may have
        // committed and must be completed at txn_id.
        let commits: Vec<_> = ctx
            .sent
            .iter()
            .filter(|o| matches!(o.request, Request::Commit { .. }))
            .collect();
        assert_eq!(commits.len(), 3);
        match &commits[0].request {
            Request::Commit { execute_at, .. } => assert_eq!(*execute_at, fast),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_slow_vote_forces_accept_at_max_witnessed() {
        let mut ctx = ctx();
        let mut r = recovery(&ctx);
        r.start(&mut ctx);
        ctx.sent.clear();

        let fast = txn_id().as_timestamp();
        let pushed = fast.next();
        r.on_reply(&mut ctx, NodeId(1), recover_ok(SaveStatus::NotAccepted, Some(fast), true));
        r.on_reply(
            &mut ctx,
            NodeId(3),
            recover_ok(SaveStatus::NotAccepted, Some(pushed), false),
        );

        let accepts: Vec<_> = ctx
            .sent
            .iter()
            .filter(|o| matches!(o.request, Request::Accept { .. }))
            .collect();
        assert_eq!(accepts.len(), 3);
        match &accepts[0].request {
            Request::Accept {
                ballot, execute_at, ..
            } => {
                assert_eq!(*execute_at, Some(pushed));
                assert_eq!(*ballot, r.ballot());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_unwitnessed_txn_invalidates() {
        let mut ctx = ctx();
        let mut r = recovery(&ctx);
        r.start(&mut ctx);
        ctx.sent.clear();

        r.on_reply(&mut ctx, NodeId(1), recover_ok(SaveStatus::PreNotAccepted, None, false));
        r.on_reply(&mut ctx, NodeId(3), recover_ok(SaveStatus::PreNotAccepted, None, false));

        assert!(ctx
            .sent
            .iter()
            .all(|o| matches!(o.request, Request::Invalidate { .. })));
        assert_eq!(ctx.sent.len(), 3);
    }

    #[test]
    fn test_committed_witness_recommits_verbatim() {
        let mut ctx = ctx();
        let mut r = recovery(&ctx);
        r.start(&mut ctx);
        ctx.sent.clear();

        let decided = txn_id().as_timestamp().next();
        r.on_reply(&mut ctx, NodeId(1), recover_ok(SaveStatus::PreAccepted, Some(txn_id().as_timestamp()), true));
        r.on_reply(&mut ctx, NodeId(3), recover_ok(SaveStatus::Committed, Some(decided), false));

        let commits: Vec<_> = ctx
            .sent
            .iter()
            .filter(|o| matches!(o.request, Request::Commit { .. }))
            .collect();
        assert_eq!(commits.len(), 3);
        match &commits[0].request {
            Request::Commit { execute_at, .. } => assert_eq!(*execute_at, decided),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_truncated_witness_yields_truncated_error() {
        let mut ctx = ctx();
        let mut r = Recovery::new(
            txn_id(),
            route(),
            Ballot::ZERO,
            &ctx,
            Box::new(|outcome| {
                assert!(matches!(outcome, Err(ProtocolError::Truncated { .. })));
            }),
        )
        .unwrap();
        r.start(&mut ctx);
        ctx.sent.clear();

        let fast = txn_id().as_timestamp();
        r.on_reply(&mut ctx, NodeId(1), recover_ok(SaveStatus::Truncated, None, false));
        r.on_reply(&mut ctx, NodeId(3), recover_ok(SaveStatus::NotAccepted, Some(fast), true));

        // Garbage-collected state is not a vote to re-propose from.
        assert!(r.is_done());
        assert!(ctx.sent.is_empty(), "no round should go out: {:?}", ctx.sent);
    }

    #[test]
    fn test_truncated_nack_yields_truncated_error() {
        let mut ctx = ctx();
        let mut r = Recovery::new(
            txn_id(),
            route(),
            Ballot::ZERO,
            &ctx,
            Box::new(|outcome| {
                assert!(matches!(outcome, Err(ProtocolError::Truncated { .. })));
            }),
        )
        .unwrap();
        r.start(&mut ctx);
        r.on_reply(&mut ctx, NodeId(1), Reply::Nack(Nack::Truncated));
        assert!(r.is_done());
    }

    #[test]
    fn test_higher_ballot_preempts_recovery() {
        let mut ctx = ctx();
        let mut r = Recovery::new(
            txn_id(),
            route(),
            Ballot::ZERO,
            &ctx,
            Box::new(|outcome| {
                assert!(matches!(outcome, Err(ProtocolError::Preempted { .. })));
            }),
        )
        .unwrap();
        r.start(&mut ctx);
        r.on_reply(
            &mut ctx,
            NodeId(1),
            Reply::Nack(Nack::Rejected {
                promised: Ballot::new(1, 9, NodeId(3)),
            }),
        );
        assert!(r.is_done());
    }

    #[test]
    fn test_rejecting_witness_blocks_fast_path() {
        let mut ctx = ctx();
        let mut r = recovery(&ctx);
        r.start(&mut ctx);
        ctx.sent.clear();

        let fast = txn_id().as_timestamp();
        let mut reply = recover_ok(SaveStatus::NotAccepted, Some(fast), true);
        if let Reply::RecoverOk {
            rejects_fast_path, ..
        } = &mut reply
        {
            *rejects_fast_path = true;
        }
        r.on_reply(&mut ctx, NodeId(1), reply);
        r.on_reply(&mut ctx, NodeId(3), recover_ok(SaveStatus::NotAccepted, Some(fast), true));

        // Fast path ruled out: an Accept round at the recovery ballot.
        assert!(ctx
            .sent
            .iter()
            .any(|o| matches!(o.request, Request::Accept { .. })));
    }
}
