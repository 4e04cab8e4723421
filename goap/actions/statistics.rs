use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::ActionId;

/// Default EMA smoothing factor.
pub const DEFAULT_EMA_ALPHA: f64 = 0.1;

/// Learned statistics for one action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionStats {
    /// Success-rate exponential moving average in `[0, 1]`.
    pub success_rate: f64,
    /// Number of recorded executions.
    pub execution_count: u64,
    /// When the statistics last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for ActionStats {
    fn default() -> Self {
        Self::with_rate(1.0)
    }
}

impl ActionStats {
    /// Fresh statistics starting at `success_rate`.
    #[must_use]
    pub const fn with_rate(success_rate: f64) -> Self {
        Self {
            success_rate,
            execution_count: 0,
            last_updated: None,
        }
    }

    /// Statistics after one more outcome, smoothing with `alpha`.
    #[must_use]
    pub fn updated(self, success: bool, alpha: f64) -> Self {
        Self {
            success_rate: ema(self.success_rate, success, alpha),
            execution_count: self.execution_count + 1,
            last_updated: Some(Utc::now()),
        }
    }
}

/// `alpha * outcome + (1 - alpha) * previous`, clamped to `[0, 1]`.
#[must_use]
pub fn ema(previous: f64, success: bool, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    let outcome = if success { 1.0 } else { 0.0 };
    (alpha.mul_add(outcome, (1.0 - alpha) * previous)).clamp(0.0, 1.0)
}

/// Failures raised by a statistics backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatisticsError {
    /// Backend could not read or write.
    #[error("statistics backend: {0}")]
    Backend(String),
}

/// Shared, concurrently updated per-action statistics.
///
/// Injected into both planner and executor; reads may run concurrently with
/// writes. Execution counts are exact; the EMA tolerates last-writer-wins.
pub trait StatisticsRepository: Send + Sync {
    /// Current statistics, if the action was ever seeded or recorded.
    fn get(&self, action_id: &str) -> Result<Option<ActionStats>, StatisticsError>;

    /// Applies one outcome and returns the updated statistics.
    fn record_outcome(&self, action_id: &str, success: bool)
        -> Result<ActionStats, StatisticsError>;

    /// Seeds statistics for an action that has none yet.
    fn seed(&self, action_id: &str, stats: ActionStats) -> Result<(), StatisticsError>;

    /// All statistics known to the repository.
    fn snapshot(&self) -> Result<IndexMap<ActionId, ActionStats>, StatisticsError>;
}

#[derive(Debug)]
struct StatCell {
    rate_bits: AtomicU64,
    count: AtomicU64,
    updated_ms: AtomicI64,
}

impl StatCell {
    fn new(stats: ActionStats) -> Self {
        Self {
            rate_bits: AtomicU64::new(stats.success_rate.to_bits()),
            count: AtomicU64::new(stats.execution_count),
            updated_ms: AtomicI64::new(
                stats
                    .last_updated
                    .map_or(i64::MIN, |stamp| stamp.timestamp_millis()),
            ),
        }
    }

    fn load(&self) -> ActionStats {
        let updated = self.updated_ms.load(Ordering::Acquire);
        ActionStats {
            success_rate: f64::from_bits(self.rate_bits.load(Ordering::Acquire)),
            execution_count: self.count.load(Ordering::Acquire),
            last_updated: (updated != i64::MIN)
                .then(|| Utc.timestamp_millis_opt(updated).single())
                .flatten(),
        }
    }

    fn record(&self, success: bool, alpha: f64) -> ActionStats {
        self.count.fetch_add(1, Ordering::AcqRel);
        let mut current = self.rate_bits.load(Ordering::Acquire);
        loop {
            let next = ema(f64::from_bits(current), success, alpha).to_bits();
            match self.rate_bits.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.updated_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.load()
    }
}

/// Lock-free (per record) in-memory statistics.
#[derive(Debug)]
pub struct InMemoryStatistics {
    cells: RwLock<IndexMap<ActionId, Arc<StatCell>>>,
    alpha: f64,
    initial_rate: f64,
}

impl Default for InMemoryStatistics {
    fn default() -> Self {
        Self::new(DEFAULT_EMA_ALPHA)
    }
}

impl InMemoryStatistics {
    /// Creates a repository smoothing with `alpha`.
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self {
            cells: RwLock::new(IndexMap::new()),
            alpha: alpha.clamp(0.0, 1.0),
            initial_rate: 1.0,
        }
    }

    /// Success rate assumed for actions never seen before.
    #[must_use]
    pub const fn with_initial_rate(mut self, rate: f64) -> Self {
        self.initial_rate = rate;
        self
    }

    /// Smoothing factor.
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    fn cell(&self, action_id: &str) -> Arc<StatCell> {
        if let Some(cell) = self.cells.read().get(action_id) {
            return Arc::clone(cell);
        }
        let mut cells = self.cells.write();
        Arc::clone(cells.entry(action_id.to_string()).or_insert_with(|| {
            Arc::new(StatCell::new(ActionStats::with_rate(self.initial_rate)))
        }))
    }
}

impl StatisticsRepository for InMemoryStatistics {
    fn get(&self, action_id: &str) -> Result<Option<ActionStats>, StatisticsError> {
        Ok(self.cells.read().get(action_id).map(|cell| cell.load()))
    }

    fn record_outcome(
        &self,
        action_id: &str,
        success: bool,
    ) -> Result<ActionStats, StatisticsError> {
        Ok(self.cell(action_id).record(success, self.alpha))
    }

    fn seed(&self, action_id: &str, stats: ActionStats) -> Result<(), StatisticsError> {
        self.cells
            .write()
            .entry(action_id.to_string())
            .or_insert_with(|| Arc::new(StatCell::new(stats)));
        Ok(())
    }

    fn snapshot(&self) -> Result<IndexMap<ActionId, ActionStats>, StatisticsError> {
        Ok(self
            .cells
            .read()
            .iter()
            .map(|(id, cell)| (id.clone(), cell.load()))
            .collect())
    }
}
