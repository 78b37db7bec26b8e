// Progress driving: noticing stalled transactions and waking them.
//
// Each command store keeps a progress log. Transactions that are witnessed
// but not yet decided get a recovery timer on their home shard; stable
// transactions blocked on dependencies get a progress-seeking timer; and
// ephemeral reads get a hard local expiry. The log only schedules; the node
// acts on the fired timers.

mod timers;

pub use timers::LogGroupTimers;

use std::collections::HashMap;

use crate::config::ProtocolConfig;
use crate::time::TxnId;

/// What a fired timer asks the node to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressTimerKind {
    /// The home shard suspects the coordinator; take over.
    AttemptRecovery,
    /// A stable command is blocked on dependencies; ask peers for them.
    SeekProgress,
    /// An ephemeral read's local lifetime ended; erase its PreAccept state.
    ExpireEphemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressTimer {
    pub txn_id: TxnId,
    pub kind: ProgressTimerKind,
}

/// A fired timer, with the retry count the next attempt should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressFire {
    pub txn_id: TxnId,
    pub kind: ProgressTimerKind,
    pub retry_count: u32,
}

/// Per-store progress log over a log-structured timer wheel.
pub struct ProgressLog {
    timers: LogGroupTimers<ProgressTimer>,
    retries: HashMap<TxnId, u32>,
}

impl Default for ProgressLog {
    fn default() -> Self {
        // Millisecond deadlines; 16ms head granularity.
        Self {
            timers: LogGroupTimers::new(4, 64),
            retries: HashMap::new(),
        }
    }
}

impl ProgressLog {
    /// Monitor an undecided transaction whose home key this store owns.
    pub fn await_coordination(&mut self, txn_id: TxnId, now: u64, config: &ProtocolConfig) {
        let retry = self.retries.get(&txn_id).copied().unwrap_or(0);
        let deadline = now + config.recovery_delay(retry).as_millis() as u64;
        self.timers.add(
            deadline,
            ProgressTimer {
                txn_id,
                kind: ProgressTimerKind::AttemptRecovery,
            },
        );
    }

    /// Monitor a stable transaction that cannot execute yet.
    pub fn await_progress(&mut self, txn_id: TxnId, now: u64, config: &ProtocolConfig) {
        let retry = self.retries.get(&txn_id).copied().unwrap_or(0);
        let deadline = now + config.progress_delay(retry).as_millis() as u64;
        self.timers.add(
            deadline,
            ProgressTimer {
                txn_id,
                kind: ProgressTimerKind::SeekProgress,
            },
        );
    }

    /// Hard local expiry for an ephemeral read.
    pub fn expire_at(&mut self, txn_id: TxnId, deadline: u64) {
        self.timers.add(
            deadline,
            ProgressTimer {
                txn_id,
                kind: ProgressTimerKind::ExpireEphemeral,
            },
        );
    }

    /// The transaction decided; recovery monitoring ends. Progress seeking
    /// may still be re-registered by the caller while execution is blocked.
    pub fn decided(&mut self, txn_id: TxnId) {
        self.timers.remove(&ProgressTimer {
            txn_id,
            kind: ProgressTimerKind::AttemptRecovery,
        });
        self.retries.remove(&txn_id);
    }

    /// The transaction applied (or was invalidated); drop every timer.
    pub fn settled(&mut self, txn_id: TxnId) {
        for kind in [
            ProgressTimerKind::AttemptRecovery,
            ProgressTimerKind::SeekProgress,
            ProgressTimerKind::ExpireEphemeral,
        ] {
            self.timers.remove(&ProgressTimer { txn_id, kind });
        }
        self.retries.remove(&txn_id);
    }

    /// Drain due timers. Retry counts increment as timers fire so the next
    /// registration backs off further.
    pub fn advance(&mut self, now: u64) -> Vec<ProgressFire> {
        let mut fired = Vec::new();
        self.timers.advance(now, &mut |_, timer| {
            fired.push((timer.txn_id, timer.kind));
        });
        let mut out = Vec::with_capacity(fired.len());
        for (txn_id, kind) in fired {
            let retry = self.retries.entry(txn_id).or_insert(0);
            *retry += 1;
            out.push(ProgressFire {
                txn_id,
                kind,
                retry_count: *retry,
            });
        }
        out
    }

    pub fn wake_at(&mut self) -> Option<u64> {
        self.timers.wake_at()
    }

    pub fn is_idle(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{KeyDomain, NodeId, TxnKind};

    fn txn(hlc: u64) -> TxnId {
        TxnId::new(1, hlc, TxnKind::Write, KeyDomain::Key, NodeId(1))
    }

    #[test]
    fn test_fired_recovery_increments_retry() {
        let config = ProtocolConfig::default();
        let mut log = ProgressLog::default();
        log.await_coordination(txn(1), 0, &config);
        assert!(log.advance(10).is_empty());

        let fired = log.advance(60_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, ProgressTimerKind::AttemptRecovery);
        assert_eq!(fired[0].retry_count, 1);

        // Re-registering now backs off further, and fires with count 2.
        log.await_coordination(txn(1), 60_000, &config);
        let fired = log.advance(600_000);
        assert_eq!(fired[0].retry_count, 2);
    }

    #[test]
    fn test_settled_clears_timers() {
        let config = ProtocolConfig::default();
        let mut log = ProgressLog::default();
        log.await_coordination(txn(1), 0, &config);
        log.await_progress(txn(1), 0, &config);
        log.settled(txn(1));
        assert!(log.is_idle());
        assert!(log.advance(u64::MAX / 2).is_empty());
    }

    #[test]
    fn test_decided_keeps_progress_timer() {
        let config = ProtocolConfig::default();
        let mut log = ProgressLog::default();
        log.await_coordination(txn(1), 0, &config);
        log.await_progress(txn(1), 0, &config);
        log.decided(txn(1));
        let fired = log.advance(u64::MAX / 2);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, ProgressTimerKind::SeekProgress);
    }

    #[test]
    fn test_expire_ephemeral() {
        let mut log = ProgressLog::default();
        log.expire_at(txn(1), 500);
        let fired = log.advance(501);
        assert_eq!(fired[0].kind, ProgressTimerKind::ExpireEphemeral);
    }
}
