// Garbage-collection decisions.
//
// A command's record is only ever destroyed by an explicit cleanup decision,
// computed from the redundancy and durability watermarks. The decision
// ladder is applied in order, then filtered so the outcome can never move a
// command backwards.

mod durable;
mod redundant;

pub use durable::{DurableBefore, DurableEntry};
pub use redundant::{RedundantBefore, RedundantEntry, RedundantStatus};

use crate::command::{Durability, SaveStatus, StoreParticipants};
use crate::time::{TxnId, TxnKind};

/// What to do with a command's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cleanup {
    /// Keep everything.
    No,
    /// Keep only the outcome; the partial record has no route to act on.
    ExpungePartial,
    /// Drop payload and deps, keep the applied outcome.
    TruncateWithOutcome,
    /// Drop everything but the fact of the decision.
    Truncate,
    /// The command can never commit; record that.
    Invalidate,
    /// The range was retired from this store; the record is a leftover.
    Vestigial,
    /// Universally durable: the whole record may be erased.
    Erase,
    /// Erase even the tombstone.
    Expunge,
}

/// Decide cleanup for one command. Rules apply in order, first match wins,
/// then the no-regress filter clamps the result.
pub fn should_cleanup(
    txn_id: TxnId,
    status: SaveStatus,
    durability: Durability,
    participants: &StoreParticipants,
    redundant_before: &RedundantBefore,
    durable_before: &DurableBefore,
) -> Cleanup {
    let decision = raw_decision(
        txn_id,
        status,
        durability,
        participants,
        redundant_before,
        durable_before,
    );
    no_regress(decision, status)
}

fn raw_decision(
    txn_id: TxnId,
    status: SaveStatus,
    durability: Durability,
    participants: &StoreParticipants,
    redundant_before: &RedundantBefore,
    durable_before: &DurableBefore,
) -> Cleanup {
    let scope = if participants.touches().is_empty() {
        participants.owns().clone()
    } else {
        participants.touches().clone()
    };
    let summary = redundant_before.status(txn_id, &scope);

    // Rule 1: universally durable everywhere, and either invalidated or
    // past the shard redundancy line: nothing anyone could ever ask again.
    if durable_before.min(txn_id) == Durability::Universal
        && (status == SaveStatus::Invalidated || summary.all_at_least(RedundantStatus::ShardRedundant))
    {
        return Cleanup::Expunge;
    }

    // Rule 2: ephemeral reads are erased by their own timeout, never here.
    if txn_id.kind() == TxnKind::EphemeralRead {
        return Cleanup::No;
    }

    // Rule 3: without a full route we cannot reason about the whole
    // transaction; once everything we own is past the GC line, keep at most
    // the outcome.
    if !participants.has_full_route() {
        if !scope.is_empty() && summary.all_at_least(RedundantStatus::GcBefore) {
            return if status >= SaveStatus::PreApplied && status != SaveStatus::Invalidated {
                Cleanup::TruncateWithOutcome
            } else {
                Cleanup::ExpungePartial
            };
        }
        return Cleanup::No;
    }

    // Rule 4: route known; classify against the redundancy watermarks.
    if summary.all(RedundantStatus::WasOwnedRetired) {
        return Cleanup::Vestigial;
    }
    if summary.all_at_least(RedundantStatus::GcBefore) {
        return match durability {
            Durability::NotDurable | Durability::Local | Durability::ShardUniversal => {
                Cleanup::TruncateWithOutcome
            }
            Durability::Majority | Durability::MajorityOrInvalidated => Cleanup::Truncate,
            Durability::Universal | Durability::UniversalOrInvalidated => Cleanup::Erase,
        };
    }
    if summary.all_at_least(RedundantStatus::ShardRedundant) {
        if status.is_decided() {
            if !participants.executes_anything() && durability.is_durable() {
                return Cleanup::Truncate;
            }
            return Cleanup::No;
        }
        // Rule 5: undecided below the shard-redundant watermark while owning
        // at least one key: the transaction can no longer commit here.
        if participants.owns_anything() {
            return Cleanup::Invalidate;
        }
        return Cleanup::No;
    }

    // Live, pre-bootstrap, locally redundant, or mixed: keep.
    Cleanup::No
}

/// A command never "un-applies": clamp decisions that would regress the
/// recorded status.
fn no_regress(decision: Cleanup, status: SaveStatus) -> Cleanup {
    match decision {
        Cleanup::Invalidate
            if status.is_decided() && status != SaveStatus::Invalidated =>
        {
            Cleanup::No
        }
        Cleanup::TruncateWithOutcome if status < SaveStatus::PreApplied => Cleanup::Truncate,
        other => other,
    }
}
