// The per-transaction, per-replica command record and its state machine.
//
// Every transition is idempotent for equal payloads and refused, without
// mutating anything, for a strictly lower phase or ballot. Route and
// participant knowledge may be supplemented by any message regardless of
// status.

mod participants;
mod status;
mod txn;
mod waiting;

pub use participants::StoreParticipants;
pub use status::{Durability, Phase, SaveStatus};
pub use txn::{empty_system_txn, Data, PartialTxn, Update};
pub use waiting::WaitingOn;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::deps::Deps;
use crate::time::{Ballot, Timestamp, TxnId};

/// Why a transition was refused. The replica's state is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRefused {
    /// A higher ballot has been promised.
    Rejected { promised: Ballot },
    /// The command is already past the requested phase.
    Redundant {
        status: SaveStatus,
        execute_at: Option<Timestamp>,
    },
    /// The command was invalidated.
    Invalidated,
    /// Required state has been garbage collected.
    Truncated,
}

pub type TransitionResult = Result<(), TransitionRefused>;

/// Which accept variant a coordinator proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptKind {
    /// Deps fixed to the coordinator's proposal.
    Medium,
    /// Replicas add late-witnessed conflicts at or before `execute_at`.
    Slow,
    /// Propose that the transaction never commits.
    Invalidate,
}

/// One transaction's record on one command store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    txn_id: TxnId,
    status: SaveStatus,
    durability: Durability,
    promised: Ballot,
    /// Only meaningful in Accept-phase states.
    accepted: Ballot,
    execute_at: Option<Timestamp>,
    partial_txn: Option<PartialTxn>,
    partial_deps: Option<Deps>,
    participants: StoreParticipants,
    waiting_on: Option<WaitingOn>,
    result: Option<Bytes>,
}

impl Command {
    /// A command springs into existence the first time any message
    /// references its id.
    pub fn uninitialised(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            status: SaveStatus::NotDefined,
            durability: Durability::NotDurable,
            promised: Ballot::ZERO,
            accepted: Ballot::ZERO,
            execute_at: None,
            partial_txn: None,
            partial_deps: None,
            participants: StoreParticipants::empty(),
            waiting_on: None,
            result: None,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn status(&self) -> SaveStatus {
        self.status
    }

    pub fn phase(&self) -> Phase {
        self.status.phase()
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    pub fn promised(&self) -> Ballot {
        self.promised
    }

    pub fn accepted(&self) -> Ballot {
        self.accepted
    }

    pub fn execute_at(&self) -> Option<Timestamp> {
        self.execute_at
    }

    pub fn partial_txn(&self) -> Option<&PartialTxn> {
        self.partial_txn.as_ref()
    }

    pub fn partial_deps(&self) -> Option<&Deps> {
        self.partial_deps.as_ref()
    }

    pub fn participants(&self) -> &StoreParticipants {
        &self.participants
    }

    pub fn participants_mut(&mut self) -> &mut StoreParticipants {
        &mut self.participants
    }

    pub fn waiting_on(&self) -> Option<&WaitingOn> {
        self.waiting_on.as_ref()
    }

    pub fn waiting_on_mut(&mut self) -> Option<&mut WaitingOn> {
        self.waiting_on.as_mut()
    }

    pub fn result(&self) -> Option<&Bytes> {
        self.result.as_ref()
    }

    /// Durability only ever ratchets upward.
    pub fn set_durability(&mut self, durability: Durability) {
        self.durability = self.durability.max(durability);
    }

    fn check_ballot(&self, ballot: Ballot) -> TransitionResult {
        if ballot < self.promised {
            return Err(TransitionRefused::Rejected {
                promised: self.promised,
            });
        }
        Ok(())
    }

    fn redundant(&self) -> TransitionRefused {
        if self.status == SaveStatus::Invalidated {
            TransitionRefused::Invalidated
        } else if self.status == SaveStatus::Truncated {
            TransitionRefused::Truncated
        } else {
            TransitionRefused::Redundant {
                status: self.status,
                execute_at: self.execute_at,
            }
        }
    }

    /// Merge a txn payload view into the record.
    fn supplement_txn(&mut self, partial_txn: &PartialTxn) {
        self.partial_txn = Some(match &self.partial_txn {
            None => partial_txn.clone(),
            Some(existing) => existing.merge(partial_txn),
        });
    }

    fn supplement_deps(&mut self, deps: &Deps) {
        self.partial_deps = Some(match &self.partial_deps {
            None => deps.clone(),
            Some(existing) => existing.with(deps),
        });
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// PreAccept: adopt the local `execute_at` and deps computed against the
    /// store's conflict index.
    pub fn preaccept(
        &mut self,
        ballot: Ballot,
        partial_txn: &PartialTxn,
        execute_at: Timestamp,
        deps: Deps,
    ) -> TransitionResult {
        self.check_ballot(ballot)?;
        match self.status {
            SaveStatus::NotDefined | SaveStatus::PreNotAccepted => {}
            SaveStatus::PreAccepted => {
                // Idempotent re-delivery.
                self.supplement_txn(partial_txn);
                return Ok(());
            }
            _ => return Err(self.redundant()),
        }
        self.supplement_txn(partial_txn);
        self.execute_at = Some(execute_at);
        self.partial_deps = Some(deps);
        self.status = SaveStatus::PreAccepted;
        Ok(())
    }

    /// Promise a recovery ballot. Records the not-accepted marker when the
    /// transaction itself has not progressed past PreAccept. A truncated
    /// record refuses: its state is gone and cannot anchor a recovery.
    pub fn promise(&mut self, ballot: Ballot) -> TransitionResult {
        if self.status == SaveStatus::Truncated {
            return Err(TransitionRefused::Truncated);
        }
        if ballot <= self.promised {
            return Err(TransitionRefused::Rejected {
                promised: self.promised,
            });
        }
        self.promised = ballot;
        match self.status {
            SaveStatus::NotDefined => self.status = SaveStatus::PreNotAccepted,
            SaveStatus::PreAccepted => self.status = SaveStatus::NotAccepted,
            _ => {}
        }
        Ok(())
    }

    /// Accept: adopt a coordinator's `execute_at`/deps proposal under a
    /// ballot.
    pub fn accept(
        &mut self,
        ballot: Ballot,
        kind: AcceptKind,
        execute_at: Option<Timestamp>,
        deps: &Deps,
    ) -> TransitionResult {
        self.check_ballot(ballot)?;
        if self.phase() > Phase::Accept {
            return Err(self.redundant());
        }
        if self.phase() == Phase::Accept && ballot < self.accepted {
            return Err(TransitionRefused::Rejected {
                promised: self.promised,
            });
        }
        self.promised = ballot.max(self.promised);
        self.accepted = ballot;
        match kind {
            AcceptKind::Invalidate => {
                self.status = SaveStatus::AcceptedInvalidate;
            }
            AcceptKind::Medium | AcceptKind::Slow => {
                self.execute_at = execute_at.or(self.execute_at);
                self.supplement_deps(deps);
                self.status = match kind {
                    AcceptKind::Medium => SaveStatus::AcceptedMedium,
                    _ => SaveStatus::AcceptedSlow,
                };
            }
        }
        Ok(())
    }

    /// Learn `execute_at` without deps: enough to exclude this command from
    /// later dependency sets, not enough to execute it.
    pub fn pre_commit(&mut self, execute_at: Timestamp) -> TransitionResult {
        if self.status.has_execute_at() {
            debug_assert_eq!(self.execute_at, Some(execute_at), "execute_at diverged");
            return Ok(());
        }
        if self.phase() > Phase::Commit {
            return Err(self.redundant());
        }
        self.execute_at = Some(execute_at);
        self.status = self.status.max(SaveStatus::PreCommitted);
        Ok(())
    }

    pub fn commit(&mut self, execute_at: Timestamp, deps: &Deps) -> TransitionResult {
        if self.status >= SaveStatus::Committed {
            if self.status.has_execute_at() {
                debug_assert_eq!(self.execute_at, Some(execute_at), "execute_at diverged");
                return Ok(());
            }
            return Err(self.redundant());
        }
        self.execute_at = Some(execute_at);
        self.partial_deps = Some(deps.clone());
        self.status = SaveStatus::Committed;
        Ok(())
    }

    /// Commit with final deps; `waiting_on` is the filtered execution set.
    pub fn stable(
        &mut self,
        execute_at: Timestamp,
        deps: &Deps,
        waiting_on: WaitingOn,
    ) -> TransitionResult {
        if self.status >= SaveStatus::Stable {
            if self.status.has_execute_at() {
                debug_assert_eq!(self.execute_at, Some(execute_at), "execute_at diverged");
                return Ok(());
            }
            return Err(self.redundant());
        }
        self.execute_at = Some(execute_at);
        self.partial_deps = Some(deps.clone());
        self.waiting_on = Some(waiting_on);
        self.status = SaveStatus::Stable;
        Ok(())
    }

    /// The outcome arrived before local execution finished.
    pub fn pre_applied(&mut self, result: Bytes) -> TransitionResult {
        if self.status >= SaveStatus::PreApplied {
            return Ok(());
        }
        if !self.status.has_stable_deps() {
            return Err(TransitionRefused::Redundant {
                status: self.status,
                execute_at: self.execute_at,
            });
        }
        self.result = Some(result);
        self.status = SaveStatus::PreApplied;
        Ok(())
    }

    /// Apply the outcome. Requires a stable command with a drained
    /// waiting-on set; the store enforces that before calling.
    pub fn applied(&mut self, result: Bytes) -> TransitionResult {
        if self.status >= SaveStatus::Applied {
            return Ok(());
        }
        if !self.status.has_stable_deps() {
            return Err(self.redundant());
        }
        debug_assert!(
            self.waiting_on.as_ref().map(WaitingOn::is_done).unwrap_or(true),
            "applied with pending dependencies"
        );
        self.result = Some(result);
        self.durability = self.durability.max(Durability::Local);
        self.status = SaveStatus::Applied;
        Ok(())
    }

    /// Terminal: the transaction will never commit. A truncated record
    /// refuses, matching the cleanup no-regress rule: whatever was garbage
    /// collected had already been decided.
    pub fn invalidate(&mut self) -> TransitionResult {
        if self.status == SaveStatus::Invalidated {
            return Ok(());
        }
        if self.status.is_decided() {
            return Err(self.redundant());
        }
        self.status = SaveStatus::Invalidated;
        self.execute_at = None;
        self.waiting_on = None;
        Ok(())
    }

    /// Applied by a cleanup decision; never by timeout alone.
    pub fn truncate(&mut self, keep_outcome: bool) {
        if !keep_outcome {
            self.result = None;
        }
        self.partial_txn = None;
        self.partial_deps = None;
        self.waiting_on = None;
        if self.status != SaveStatus::Invalidated {
            self.status = SaveStatus::Truncated;
        }
    }
}
