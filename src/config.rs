// Protocol tuning knobs exposed to the embedding agent.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Timeouts and pruning tuning for one node. All fields have conservative
/// defaults suitable for in-process clusters; real deployments override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// How long a replica retains PreAccept state for an ephemeral read
    /// before erasing it locally.
    pub pre_accept_timeout: Duration,
    /// Deadline applied to a whole coordination attempt.
    pub local_expires_at: Duration,
    /// Base delay before a replica attempts to take over a coordination.
    pub attempt_coordination_delay: Duration,
    /// Base delay before a blocked command asks peers for progress.
    pub seek_progress_delay: Duration,
    /// How long a home shard waits on a silent coordinator before recovering.
    pub retry_await_timeout: Duration,

    /// How far behind the max conflict hlc a CommandsForKey entry must fall
    /// before it is eligible for pruning.
    pub cfk_hlc_prune_delta: u64,
    /// Minimum number of updates between CommandsForKey prune passes.
    pub cfk_prune_interval: u64,
    /// Prune delta for the per-store max-conflicts register.
    pub max_conflicts_hlc_prune_delta: u64,
    /// Minimum number of updates between max-conflicts prune passes.
    pub max_conflicts_prune_interval: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            pre_accept_timeout: Duration::from_millis(2_000),
            local_expires_at: Duration::from_millis(10_000),
            attempt_coordination_delay: Duration::from_millis(200),
            seek_progress_delay: Duration::from_millis(100),
            retry_await_timeout: Duration::from_millis(500),
            cfk_hlc_prune_delta: 1 << 24,
            cfk_prune_interval: 32,
            max_conflicts_hlc_prune_delta: 1 << 26,
            max_conflicts_prune_interval: 128,
        }
    }
}

impl ProtocolConfig {
    /// Parse a configuration snapshot as produced by `to_json`.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::error::ProtocolError::Serialization(e.to_string()))
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::ProtocolError::Serialization(e.to_string()))
    }

    /// Delay before recovery attempt number `retry_count`, exponentially
    /// backed off and jittered so competing recoverers spread out.
    pub fn recovery_delay(&self, retry_count: u32) -> Duration {
        backoff(self.retry_await_timeout, retry_count)
    }

    /// Delay before progress-seeking attempt number `retry_count`.
    pub fn progress_delay(&self, retry_count: u32) -> Duration {
        backoff(self.seek_progress_delay, retry_count)
    }

    /// Delay before re-attempting a preempted or timed-out coordination.
    pub fn coordination_delay(&self, retry_count: u32) -> Duration {
        backoff(self.attempt_coordination_delay, retry_count)
    }
}

fn backoff(base: Duration, retry_count: u32) -> Duration {
    let shift = retry_count.min(6);
    let scaled = base.saturating_mul(1 << shift);
    // Up to 25% jitter.
    let jitter_span = (scaled.as_millis() as u64 / 4).max(1);
    let jitter = rand::rng().random_range(0..jitter_span);
    scaled + Duration::from_millis(jitter)
}
