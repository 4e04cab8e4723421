use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Tunables of the adaptive reuse threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReusePolicy {
    /// Starting similarity threshold.
    pub threshold: f64,
    /// Amount added each time reuse underperforms.
    pub raise_step: f64,
    /// Ceiling for the threshold.
    pub max_threshold: f64,
    /// Executions of each kind required before adapting.
    pub min_samples: u64,
}

impl Default for ReusePolicy {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            raise_step: 0.02,
            max_threshold: 0.98,
            min_samples: 5,
        }
    }
}

/// Counters comparing reused plans with freshly searched ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReuseStats {
    /// Executions of reused plans.
    pub reused_runs: u64,
    /// Failed executions of reused plans.
    pub reused_failures: u64,
    /// Executions of searched plans.
    pub fresh_runs: u64,
    /// Failed executions of searched plans.
    pub fresh_failures: u64,
}

impl ReuseStats {
    /// Failure rate of reused plans.
    #[must_use]
    pub fn reused_failure_rate(&self) -> f64 {
        rate(self.reused_failures, self.reused_runs)
    }

    /// Failure rate of searched plans.
    #[must_use]
    pub fn fresh_failure_rate(&self) -> f64 {
        rate(self.fresh_failures, self.fresh_runs)
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate(failures: u64, runs: u64) -> f64 {
    if runs == 0 {
        0.0
    } else {
        failures as f64 / runs as f64
    }
}

#[derive(Debug)]
struct TrackerState {
    stats: ReuseStats,
    threshold: f64,
}

/// Tracks reuse outcomes and raises the similarity threshold when reused
/// plans fail more often than searched ones.
///
/// Shared between the planner (reads the threshold) and learning (records
/// outcomes).
#[derive(Debug)]
pub struct ReuseTracker {
    policy: ReusePolicy,
    state: Mutex<TrackerState>,
}

impl Default for ReuseTracker {
    fn default() -> Self {
        Self::new(ReusePolicy::default())
    }
}

impl ReuseTracker {
    /// Tracker starting at `policy.threshold`.
    #[must_use]
    pub fn new(policy: ReusePolicy) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                stats: ReuseStats::default(),
                threshold: policy.threshold.min(policy.max_threshold),
            }),
            policy,
        }
    }

    /// Policy in force.
    #[must_use]
    pub const fn policy(&self) -> ReusePolicy {
        self.policy
    }

    /// Current similarity threshold.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.state.lock().threshold
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ReuseStats {
        self.state.lock().stats
    }

    /// Records one execution outcome; returns the new threshold when it was
    /// raised.
    pub fn record(&self, reused: bool, success: bool) -> Option<f64> {
        let mut state = self.state.lock();
        if reused {
            state.stats.reused_runs += 1;
            state.stats.reused_failures += u64::from(!success);
        } else {
            state.stats.fresh_runs += 1;
            state.stats.fresh_failures += u64::from(!success);
        }
        let stats = state.stats;
        let enough = stats.reused_runs >= self.policy.min_samples
            && stats.fresh_runs >= self.policy.min_samples;
        let underperforming = stats.reused_failure_rate() > stats.fresh_failure_rate();
        if !(reused && !success && enough && underperforming) {
            return None;
        }
        let raised = (state.threshold + self.policy.raise_step).min(self.policy.max_threshold);
        if raised <= state.threshold {
            return None;
        }
        state.threshold = raised;
        Some(raised)
    }
}
