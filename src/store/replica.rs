// Replica-side request handling.
//
// Every protocol request lands here as a store task. Handlers validate
// against the command state machine, update the per-key indexes, and leave
// the reply in the store's outbox.

use tracing::debug;

use crate::cfk::SummaryStatus;
use crate::command::{AcceptKind, PartialTxn, Phase, SaveStatus};
use crate::command::Durability;
use crate::deps::{Deps, DepsKnownLevel, LatestDeps, LatestEntry};
use crate::messages::{CommitKind, Nack, Packet, Reply, Request, RequestHeader};
use crate::routables::{Ranges, Route};
use crate::store::StoreInner;
use crate::time::{Ballot, Timestamp, TxnId, TxnKind};

impl StoreInner {
    /// Entry point for one request. The reply always goes back through the
    /// header's reply context.
    pub fn handle_request(&mut self, header: &RequestHeader, request: Request) {
        let txn_id = header.txn_id;
        let reply = match request {
            Request::PreAccept { txn, route } => self.on_preaccept(txn_id, &txn, &route),
            Request::Accept {
                ballot,
                kind,
                execute_at,
                deps,
                route,
            } => self.on_accept(txn_id, ballot, kind, execute_at, &deps, &route),
            Request::Commit {
                kind,
                ballot,
                execute_at,
                deps,
                txn,
                route,
            } => self.on_commit(txn_id, kind, ballot, execute_at, deps, txn, &route),
            Request::Read { execute_at, keys } => {
                return self.on_read(txn_id, execute_at, keys, header)
            }
            Request::Apply {
                execute_at,
                deps,
                update,
                result,
                route,
            } => {
                return self.on_apply(txn_id, execute_at, deps, update, result, &route, header)
            }
            Request::BeginRecovery { ballot, route } => {
                self.on_begin_recovery(txn_id, ballot, &route)
            }
            Request::Invalidate { ballot: _ } => self.on_invalidate(txn_id),
            Request::CheckStatus => self.on_check_status(txn_id),
            Request::FetchData { ranges } => self.on_fetch_data(txn_id, &ranges),
            Request::SetShardDurable { execute_at } => {
                self.on_set_shard_durable(txn_id, execute_at)
            }
            Request::SetGloballyDurable { durable_before } => {
                self.advance_durable_before(durable_before);
                Reply::CommitOk
            }
            Request::QueryDurableBefore { ranges: _ } => Reply::DurableBeforeOk {
                durable_before: self.durable_before.clone(),
            },
        };
        self.reply(header, txn_id, reply);
    }

    fn reply(&mut self, header: &RequestHeader, txn_id: TxnId, reply: Reply) {
        self.outbox.push((
            header.reply.source,
            Packet::Reply {
                request_id: header.reply.request_id,
                txn_id,
                reply,
            },
        ));
    }

    // ------------------------------------------------------------------
    // PreAccept
    // ------------------------------------------------------------------

    fn on_preaccept(&mut self, txn_id: TxnId, txn: &PartialTxn, route: &Route) -> Reply {
        let owned = self.owned_at(txn_id.epoch());
        self.command_mut(txn_id)
            .participants_mut()
            .supplement(route, &owned);

        let (local_execute_at, local_deps) = self.compute_preaccept_vote(txn_id, txn);
        let result = {
            let command = self.command_mut(txn_id);
            command.preaccept(Ballot::ZERO, txn, local_execute_at, local_deps)
        };
        if let Err(refused) = result {
            return refusal_to_nack(refused);
        }

        // Index the transaction on every owned key it touches.
        for key in self.owned_keys_of(&txn.scope, txn_id.epoch()) {
            self.cfk_mut(&key).update(txn_id, SummaryStatus::PreAccepted, None);
        }
        if txn.scope.domain() == crate::time::KeyDomain::Range {
            let covered = txn.scope.to_ranges().intersect(&owned);
            if !covered.is_empty() {
                self.range_txns.insert(txn_id, covered);
            }
        }

        // Progress monitoring: the home shard stands ready to recover; an
        // ephemeral read instead gets a hard local expiry.
        if txn_id.kind() == TxnKind::EphemeralRead {
            let deadline = self.now_ms + self.config.pre_accept_timeout.as_millis() as u64;
            self.progress.expire_at(txn_id, deadline);
        } else if owned.contains(route.home()) {
            let (now, config) = (self.now_ms, self.config.clone());
            self.progress.await_coordination(txn_id, now, &config);
        }
        self.save(txn_id);

        let command = self.command(txn_id).expect("just created");
        debug!(%txn_id, execute_at = %command.execute_at().expect("preaccepted"), "preaccepted");
        Reply::PreAcceptOk {
            witnessed_at: command.execute_at().expect("preaccepted"),
            deps: command.partial_deps().cloned().unwrap_or(Deps::EMPTY),
        }
    }

    /// The local vote: `execute_at = max(txn_id, latest conflict + 1)` and
    /// the conflicting prior transactions on owned keys.
    fn compute_preaccept_vote(&self, txn_id: TxnId, txn: &PartialTxn) -> (Timestamp, Deps) {
        let kind = txn.kind;
        let mut deps = Deps::EMPTY;
        let mut witnessed = Timestamp::min_value();

        for key in self.owned_keys_of(&txn.scope, txn_id.epoch()) {
            let Some(cfk) = self.cfks.get(&key) else {
                continue;
            };
            witnessed = witnessed.max(cfk.max_conflict(kind));
            for dep in cfk.deps_for(txn_id, kind, txn_id.as_timestamp()) {
                deps.key_deps.add(key.clone(), dep);
            }
        }

        // Range transactions conflict through coverage rather than keys.
        let owned = self.owned_at(txn_id.epoch());
        let scope_ranges = txn.scope.to_ranges().intersect(&owned);
        for (range_txn, covered) in &self.range_txns {
            if *range_txn == txn_id || !range_txn.kind().conflicts_with(kind) {
                continue;
            }
            let overlap = covered.intersect(&scope_ranges);
            if overlap.is_empty() {
                continue;
            }
            let bound = self
                .commands
                .get(range_txn)
                .and_then(|c| c.execute_at())
                .unwrap_or(range_txn.as_timestamp());
            witnessed = witnessed.max(bound.max(range_txn.as_timestamp()));
            if range_txn.as_timestamp() < txn_id.as_timestamp() {
                deps.range_deps.add(*range_txn, overlap);
            }
        }

        let execute_at = if witnessed < txn_id.as_timestamp() {
            txn_id.as_timestamp()
        } else {
            self.hlc
                .unique_after(txn_id.epoch(), witnessed, txn_id.0.flags)
        };
        (execute_at, deps)
    }

    // ------------------------------------------------------------------
    // Accept
    // ------------------------------------------------------------------

    fn on_accept(
        &mut self,
        txn_id: TxnId,
        ballot: Ballot,
        kind: AcceptKind,
        execute_at: Option<Timestamp>,
        deps: &Deps,
        route: &Route,
    ) -> Reply {
        let owned = self.owned_at(txn_id.epoch());
        self.command_mut(txn_id)
            .participants_mut()
            .supplement(route, &owned);

        let result = self
            .command_mut(txn_id)
            .accept(ballot, kind, execute_at, deps);
        if let Err(refused) = result {
            return refusal_to_nack(refused);
        }

        let scope = self
            .command(txn_id)
            .and_then(|c| c.partial_txn().map(|t| t.scope.clone()));
        if let Some(scope) = &scope {
            for key in self.owned_keys_of(scope, txn_id.epoch()) {
                self.cfk_mut(&key)
                    .update(txn_id, SummaryStatus::Accepted, execute_at);
            }
        }
        if owned.contains(route.home()) && txn_id.kind() != TxnKind::EphemeralRead {
            let (now, config) = (self.now_ms, self.config.clone());
            self.progress.await_coordination(txn_id, now, &config);
        }
        self.save(txn_id);

        // On the slow path replicas contribute conflicts witnessed since
        // PreAccept, up to the proposed execute_at.
        let reply_deps = match (kind, execute_at, &scope) {
            (AcceptKind::Slow, Some(at), Some(scope)) => {
                let txn_kind = self
                    .command(txn_id)
                    .and_then(|c| c.partial_txn().map(|t| t.kind))
                    .unwrap_or_else(|| txn_id.kind());
                let mut extra = Deps::EMPTY;
                for key in self.owned_keys_of(scope, txn_id.epoch()) {
                    let Some(cfk) = self.cfks.get(&key) else {
                        continue;
                    };
                    for dep in cfk.deps_for(txn_id, txn_kind, at) {
                        extra.key_deps.add(key.clone(), dep);
                    }
                }
                extra
            }
            _ => Deps::EMPTY,
        };
        Reply::AcceptOk { deps: reply_deps }
    }

    // ------------------------------------------------------------------
    // Commit / Stable
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn on_commit(
        &mut self,
        txn_id: TxnId,
        kind: CommitKind,
        _ballot: Ballot,
        execute_at: Timestamp,
        deps: Option<Deps>,
        txn: Option<PartialTxn>,
        route: &Route,
    ) -> Reply {
        let owned = self.owned_at(txn_id.epoch());
        self.command_mut(txn_id)
            .participants_mut()
            .supplement(route, &owned);

        // Messages flavoured "with txn" supplement payload for recipients
        // that lack it.
        if let Some(txn) = &txn {
            let command = self.command_mut(txn_id);
            let merged = match command.partial_txn() {
                Some(existing) => existing.merge(txn),
                None => txn.clone(),
            };
            let _ = command.preaccept(
                command.promised(),
                &merged,
                command.execute_at().unwrap_or(execute_at),
                command.partial_deps().cloned().unwrap_or(Deps::EMPTY),
            );
        }

        // The commit cannot act without the payload for the owned slice.
        let owned_scope = route.parts().to_ranges().intersect(&owned);
        let covered = self
            .command(txn_id)
            .and_then(|c| c.partial_txn().map(|t| t.covers(&owned_scope)))
            .unwrap_or(false);
        if !covered && !owned_scope.is_empty() {
            return Reply::Nack(Nack::Insufficient);
        }

        let Some(deps) = deps else {
            // Bare execute_at: pre-commit, enough to exclude this txn from
            // later dependency sets.
            let result = self.command_mut(txn_id).pre_commit(execute_at);
            if let Err(refused) = result {
                return refusal_to_nack(refused);
            }
            self.index_commit(txn_id, SummaryStatus::PreCommitted, execute_at);
            self.save(txn_id);
            return Reply::CommitOk;
        };

        let result = self.command_mut(txn_id).commit(execute_at, &deps);
        if let Err(refused) = result {
            return refusal_to_nack(refused);
        }

        if kind.stabilises() {
            let waiting = self.build_waiting_on(txn_id, execute_at, &deps, execute_at.epoch);
            let executes = self.owned_at(execute_at.epoch);
            let command = self.command_mut(txn_id);
            let result = command.stable(execute_at, &deps, waiting);
            if let Err(refused) = result {
                return refusal_to_nack(refused);
            }
            command.participants_mut().set_executes(&executes);
            self.index_commit(txn_id, SummaryStatus::Stable, execute_at);
        } else {
            self.index_commit(txn_id, SummaryStatus::Committed, execute_at);
        }

        self.progress.decided(txn_id);
        self.save(txn_id);
        debug!(%txn_id, %execute_at, ?kind, "committed");
        if let Some(applied) = self.try_execute(txn_id) {
            self.notify_resolved(applied);
        }
        self.monitor_if_blocked(txn_id);
        Reply::CommitOk
    }

    /// A stable command still waiting on dependencies gets a progress
    /// timer so missing state is eventually chased down.
    fn monitor_if_blocked(&mut self, txn_id: TxnId) {
        let blocked = self
            .command(txn_id)
            .and_then(|c| c.waiting_on())
            .map(|w| !w.is_done())
            .unwrap_or(false);
        if blocked {
            let (now, config) = (self.now_ms, self.config.clone());
            self.progress.await_progress(txn_id, now, &config);
        }
    }

    fn index_commit(&mut self, txn_id: TxnId, summary: SummaryStatus, execute_at: Timestamp) {
        let scope = self
            .command(txn_id)
            .and_then(|c| c.partial_txn().map(|t| t.scope.clone()));
        if let Some(scope) = scope {
            for key in self.owned_keys_of(&scope, txn_id.epoch()) {
                self.cfk_mut(&key).update(txn_id, summary, Some(execute_at));
            }
        }
    }

    // ------------------------------------------------------------------
    // Read / Apply
    // ------------------------------------------------------------------

    fn on_read(
        &mut self,
        txn_id: TxnId,
        execute_at: Timestamp,
        keys: crate::routables::Keys,
        header: &RequestHeader,
    ) {
        let owned = self.owned_at(execute_at.epoch);
        let keys = keys.intersecting(&owned);
        let ready = match self.command(txn_id) {
            Some(command) if command.status().has_stable_deps() => command
                .waiting_on()
                .map(|w| w.is_done())
                .unwrap_or(true),
            Some(command)
                if command.status() >= SaveStatus::PreCommitted
                    && command.status() < SaveStatus::Truncated =>
            {
                false
            }
            _ => {
                // Not even (pre)committed here: the coordinator must first
                // deliver a stabilising commit.
                return self.reply(header, txn_id, Reply::Nack(Nack::Insufficient));
            }
        };
        if ready {
            let data = self.data.read(&keys, execute_at);
            self.reply(header, txn_id, Reply::ReadOk { data });
        } else {
            self.queue_pending_read(
                txn_id,
                keys,
                execute_at,
                header.reply.source,
                header.reply.request_id,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_apply(
        &mut self,
        txn_id: TxnId,
        execute_at: Timestamp,
        deps: Deps,
        update: Option<crate::command::Update>,
        result: bytes::Bytes,
        route: &Route,
        header: &RequestHeader,
    ) {
        let owned = self.owned_at(txn_id.epoch());
        self.command_mut(txn_id)
            .participants_mut()
            .supplement(route, &owned);

        // An apply carries everything needed to reach Stable on replicas
        // that missed earlier rounds.
        if self.command(txn_id).map(|c| c.status() < SaveStatus::Stable) == Some(true) {
            if let Some(update) = &update {
                let kind = txn_id.kind();
                let txn = PartialTxn {
                    kind,
                    scope: route.parts().clone(),
                    read: crate::routables::Keys::EMPTY,
                    update: Some(update.clone()),
                };
                let command = self.command_mut(txn_id);
                let merged = match command.partial_txn() {
                    Some(existing) => existing.merge(&txn),
                    None => txn,
                };
                let _ = command.preaccept(
                    command.promised(),
                    &merged,
                    execute_at,
                    Deps::EMPTY,
                );
            }
            let _ = self.command_mut(txn_id).commit(execute_at, &deps);
            let waiting = self.build_waiting_on(txn_id, execute_at, &deps, execute_at.epoch);
            let executes = self.owned_at(execute_at.epoch);
            let command = self.command_mut(txn_id);
            let _ = command.stable(execute_at, &deps, waiting);
            command.participants_mut().set_executes(&executes);
            self.index_commit(txn_id, SummaryStatus::Stable, execute_at);
            self.progress.decided(txn_id);
        }

        let result = {
            let command = self.command_mut(txn_id);
            command.pre_applied(result)
        };
        if let Err(refused) = result {
            let reply = refusal_to_nack(refused);
            return self.reply(header, txn_id, reply);
        }
        self.save(txn_id);

        self.queue_apply_ack(txn_id, header.reply.source, header.reply.request_id);
        if let Some(applied) = self.try_execute(txn_id) {
            self.notify_resolved(applied);
        }
        self.monitor_if_blocked(txn_id);
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn on_begin_recovery(&mut self, txn_id: TxnId, ballot: Ballot, route: &Route) -> Reply {
        let owned = self.owned_at(txn_id.epoch());
        self.command_mut(txn_id)
            .participants_mut()
            .supplement(route, &owned);

        if let Err(refused) = self.command_mut(txn_id).promise(ballot) {
            return refusal_to_nack(refused);
        }
        self.save(txn_id);

        let command = self.command(txn_id).expect("just touched");
        let status = command.status();
        let accepted = command.accepted();
        let execute_at = command.execute_at();
        let deps = command.partial_deps().cloned().unwrap_or(Deps::EMPTY);

        let voted_fast = status.phase() >= Phase::PreAccept
            && execute_at == Some(txn_id.as_timestamp());

        let level = match status {
            s if s >= SaveStatus::Stable && s < SaveStatus::Truncated => DepsKnownLevel::Known,
            SaveStatus::PreCommitted | SaveStatus::Committed => DepsKnownLevel::Committed,
            SaveStatus::AcceptedMedium => DepsKnownLevel::ProposedFixed,
            SaveStatus::AcceptedSlow | SaveStatus::AcceptedInvalidate => DepsKnownLevel::Proposed,
            SaveStatus::PreAccepted | SaveStatus::NotAccepted => DepsKnownLevel::Proposed,
            _ => DepsKnownLevel::Unknown,
        };

        let mut latest_deps = LatestDeps::EMPTY;
        let covered = route.parts().to_ranges().intersect(&owned);
        for range in covered.iter() {
            let entry = match level {
                DepsKnownLevel::Known | DepsKnownLevel::Committed => {
                    LatestEntry::decided(level, deps.clone())
                }
                DepsKnownLevel::ProposedFixed => LatestEntry::fixed(accepted, deps.clone()),
                DepsKnownLevel::Proposed => LatestEntry::proposed(accepted, deps.clone()),
                DepsKnownLevel::Unknown => LatestEntry {
                    level: DepsKnownLevel::Unknown,
                    ballot: Ballot::ZERO,
                    coordinated: None,
                    local: Some(Deps::EMPTY),
                },
            };
            latest_deps.insert(range.clone(), entry);
        }

        let rejects_fast_path = self.witnessed_fast_path_blocker(txn_id, route);
        let command = self.command(txn_id).expect("just touched");
        Reply::RecoverOk {
            status,
            accepted,
            execute_at,
            latest_deps,
            voted_fast,
            rejects_fast_path,
            route: command.participants().route().cloned(),
            txn: command.partial_txn().cloned(),
            result: command.result().cloned(),
        }
    }

    /// A conflicting transaction ordered after `txn_id` that has already
    /// been decided without depending on it implies `txn_id` never reached
    /// a fast quorum; its recovery must take the slow path.
    fn witnessed_fast_path_blocker(&self, txn_id: TxnId, route: &Route) -> bool {
        let kind = txn_id.kind();
        for key in self.owned_keys_of(route.parts(), txn_id.epoch()) {
            let Some(cfk) = self.cfks.get(&key) else {
                continue;
            };
            for entry in cfk.iter() {
                if entry.txn_id == txn_id || !kind.conflicts_with(entry.txn_id.kind()) {
                    continue;
                }
                if entry.txn_id < txn_id
                    && entry.status >= SummaryStatus::Committed
                    && entry.status != SummaryStatus::Invalidated
                    && entry
                        .execute_at
                        .map(|at| at > txn_id.as_timestamp())
                        .unwrap_or(false)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Commit an invalidation decided by a recovery quorum.
    fn on_invalidate(&mut self, txn_id: TxnId) -> Reply {
        let scope = self
            .command(txn_id)
            .and_then(|c| c.partial_txn().map(|t| t.scope.clone()));
        if let Err(refused) = self.command_mut(txn_id).invalidate() {
            return refusal_to_nack(refused);
        }
        if let Some(scope) = scope {
            for key in self.owned_keys_of(&scope, txn_id.epoch()) {
                self.cfk_mut(&key).mark_invalidated(txn_id);
            }
        }
        self.range_txns.remove(&txn_id);
        self.progress.settled(txn_id);
        self.save(txn_id);
        // An invalidated dependency no longer gates anyone.
        self.notify_resolved(txn_id);
        Reply::CommitOk
    }

    // ------------------------------------------------------------------
    // Status, fetch, durability
    // ------------------------------------------------------------------

    fn on_check_status(&mut self, txn_id: TxnId) -> Reply {
        match self.command(txn_id) {
            Some(command) => Reply::CheckStatusOk {
                status: command.status(),
                promised: command.promised(),
                execute_at: command.execute_at(),
                route: command.participants().route().cloned(),
            },
            None => Reply::CheckStatusOk {
                status: SaveStatus::NotDefined,
                promised: Ballot::ZERO,
                execute_at: None,
                route: None,
            },
        }
    }

    fn on_fetch_data(&mut self, txn_id: TxnId, ranges: &Ranges) -> Reply {
        match self.command(txn_id) {
            Some(command) => Reply::FetchOk {
                status: command.status(),
                txn: command.partial_txn().map(|t| t.slice(ranges)),
                deps: command.partial_deps().map(|d| d.slice(ranges)),
                execute_at: command.execute_at(),
                result: command.result().cloned(),
            },
            None => Reply::Nack(Nack::Insufficient),
        }
    }

    fn on_set_shard_durable(&mut self, txn_id: TxnId, _execute_at: Timestamp) -> Reply {
        self.command_mut(txn_id)
            .set_durability(Durability::ShardUniversal);
        self.save(txn_id);
        Reply::ApplyOk
    }

    // ------------------------------------------------------------------
    // Local timers
    // ------------------------------------------------------------------

    /// An ephemeral read outlived its local lifetime: erase its PreAccept
    /// footprint. Ephemeral reads never commit, so there is nothing to keep.
    pub fn expire_ephemeral(&mut self, txn_id: TxnId) {
        let Some(command) = self.commands.get(&txn_id) else {
            return;
        };
        if command.txn_id().kind() != TxnKind::EphemeralRead
            || command.status() >= SaveStatus::PreCommitted
        {
            return;
        }
        let scope = command.partial_txn().map(|t| t.scope.clone());
        self.commands.remove(&txn_id);
        if let Some(scope) = scope {
            for key in self.owned_keys_of(&scope, txn_id.epoch()) {
                self.cfk_mut(&key).remove(txn_id);
            }
        }
        self.progress.settled(txn_id);
    }
}

/// Map a refused transition to the wire-level nack.
fn refusal_to_nack(refused: crate::command::TransitionRefused) -> Reply {
    use crate::command::TransitionRefused::*;
    Reply::Nack(match refused {
        Rejected { promised } => Nack::Rejected { promised },
        Redundant { execute_at, .. } => Nack::Redundant { execute_at },
        Invalidated => Nack::Redundant { execute_at: None },
        Truncated => Nack::Truncated,
    })
}
