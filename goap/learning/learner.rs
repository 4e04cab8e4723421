use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use goap_actions::{ExecutionStatus, ExecutionTrace, StepStatus};
use goap_memory::{PlanOutcome, PlanRecord, PlanRepository, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{LogLevel, Telemetry};
use thiserror::Error;

use crate::{
    qtable::{QTable, StateBucket},
    reuse::ReuseTracker,
    signature::PlanSignature,
    similarity::PlanSimilarityIndex,
};

/// Tunables of the trace learner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Q-learning rate.
    pub learning_rate: f64,
    /// Q-learning discount.
    pub discount: f64,
    /// Width of numeric state buckets.
    pub bucket_size: f64,
    /// Reward applied to a failed step.
    pub failure_penalty: f64,
    /// Normalization constant for goal distance.
    pub normalization: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount: 0.9,
            bucket_size: 10.0,
            failure_penalty: 0.1,
            normalization: 10.0,
        }
    }
}

/// Errors raised while learning.
#[derive(Debug, Error)]
pub enum LearningError {
    /// Persisting the plan record or signature failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Reading or writing the persisted Q-table failed.
    #[error("q-table file {path}: {source}")]
    QTable {
        /// Table file.
        path: PathBuf,
        /// Underlying I/O or decoding failure.
        #[source]
        source: io::Error,
    },
}

/// What one call to [`PlanLearning::learn_from_execution`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningOutcome {
    /// Share of the original goal distance the run closed, in `[0, 1]`.
    pub reward: f64,
    /// Goal distance of the initial state.
    pub distance_before: f64,
    /// Goal distance of the final state.
    pub distance_after: f64,
    /// Q-table updates applied.
    pub q_updates: usize,
    /// Whether the plan signature entered the similarity index.
    pub signature_stored: bool,
    /// Reuse threshold after this run.
    pub reuse_threshold: f64,
    /// Whether this run raised the threshold.
    pub threshold_raised: bool,
}

/// Learns from execution traces: Q-table, reuse threshold, plan records and
/// the similarity index.
///
/// Per-action success statistics are updated by the executor at step
/// granularity and are not touched here.
pub struct PlanLearning {
    config: LearningConfig,
    q_table: QTable,
    index: Arc<PlanSimilarityIndex>,
    reuse: Arc<ReuseTracker>,
    repository: Option<PlanRepository>,
    q_table_path: Option<PathBuf>,
    telemetry: Option<Telemetry>,
}

impl std::fmt::Debug for PlanLearning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanLearning")
            .field("config", &self.config)
            .field("q_entries", &self.q_table.len())
            .field("indexed_plans", &self.index.len())
            .field("q_table_path", &self.q_table_path)
            .finish_non_exhaustive()
    }
}

impl PlanLearning {
    /// Learner feeding `index` and `reuse`.
    #[must_use]
    pub fn new(
        config: LearningConfig,
        index: Arc<PlanSimilarityIndex>,
        reuse: Arc<ReuseTracker>,
    ) -> Self {
        Self {
            q_table: QTable::new(config.learning_rate, config.discount),
            config,
            index,
            reuse,
            repository: None,
            q_table_path: None,
            telemetry: None,
        }
    }

    /// Persists plan records through `repository`.
    #[must_use]
    pub fn with_repository(mut self, repository: PlanRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Keeps the Q-table in `path`: an existing table is loaded now and the
    /// file is rewritten after every run that updates it.
    pub fn persist_q_table(mut self, path: impl Into<PathBuf>) -> Result<Self, LearningError> {
        let path = path.into();
        self.q_table
            .load(&path)
            .map_err(|source| q_table_error(&path, source))?;
        self.q_table_path = Some(path);
        Ok(self)
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Tabular learner.
    #[must_use]
    pub const fn q_table(&self) -> &QTable {
        &self.q_table
    }

    /// Similarity index fed by successful runs.
    #[must_use]
    pub fn index(&self) -> Arc<PlanSimilarityIndex> {
        Arc::clone(&self.index)
    }

    /// Reuse tracker.
    #[must_use]
    pub fn reuse(&self) -> Arc<ReuseTracker> {
        Arc::clone(&self.reuse)
    }

    /// Learns from one finished run.
    pub fn learn_from_execution(
        &self,
        trace: &ExecutionTrace,
    ) -> Result<LearningOutcome, LearningError> {
        let norm = self.config.normalization;
        let distance_before = trace.goal.distance(&trace.initial_state, norm);
        let distance_after = trace.goal.distance(&trace.final_state, norm);
        let reward = if trace.is_success() {
            1.0
        } else if distance_before > 0.0 {
            ((distance_before - distance_after) / distance_before).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let q_updates = self.update_q_table(trace, distance_before);

        let threshold_raised = match trace.status {
            ExecutionStatus::Canceled => None,
            status => self
                .reuse
                .record(trace.reused_from.is_some(), status == ExecutionStatus::Completed),
        };
        if let Some(threshold) = threshold_raised {
            self.log(
                LogLevel::Warn,
                "goap.learning.reuse_threshold_raised",
                json!({ "threshold": threshold, "stats": self.reuse.stats() }),
            );
        }

        let outcome = PlanOutcome {
            reward,
            distance_before,
            distance_after,
        };
        let record_id = trace
            .root_plan_id()
            .cloned()
            .unwrap_or_else(|| trace.run_id.clone());
        if let Some(repository) = &self.repository {
            repository.save_plan(&PlanRecord::executed(record_id.clone(), trace, outcome))?;
        }

        let executed = trace.executed_action_ids();
        let signature_stored = trace.is_success() && !executed.is_empty();
        if signature_stored {
            let signature = PlanSignature::of_plan(&trace.initial_state, &trace.goal, &executed);
            self.index
                .insert(record_id.clone(), signature, trace.goal.clone(), executed)?;
        }
        if q_updates > 0 {
            self.save_q_table()?;
        }

        let learned = LearningOutcome {
            reward,
            distance_before,
            distance_after,
            q_updates,
            signature_stored,
            reuse_threshold: self.reuse.threshold(),
            threshold_raised: threshold_raised.is_some(),
        };
        self.log(
            LogLevel::Info,
            "goap.learning.recorded",
            json!({ "plan_id": record_id, "reward": reward, "q_updates": q_updates }),
        );
        self.event(
            "goap.learning.recorded",
            json!({
                "plan_id": record_id,
                "run_id": trace.run_id,
                "status": trace.status,
                "outcome": learned,
            }),
        );
        Ok(learned)
    }

    fn save_q_table(&self) -> Result<(), LearningError> {
        let Some(path) = &self.q_table_path else {
            return Ok(());
        };
        self.q_table
            .save(path)
            .map_err(|source| q_table_error(path, source))
    }

    fn update_q_table(&self, trace: &ExecutionTrace, distance_before: f64) -> usize {
        let norm = self.config.normalization;
        let scale = distance_before.max(f64::EPSILON);
        let last = trace.steps.len().saturating_sub(1);
        let mut updates = 0;
        for (position, step) in trace.steps.iter().enumerate() {
            let state = StateBucket::of(&step.before, self.config.bucket_size);
            let reward = match (step.status, &step.after) {
                (StepStatus::Completed, Some(after)) => {
                    let closed = trace.goal.distance(&step.before, norm)
                        - trace.goal.distance(after, norm);
                    let next = StateBucket::of(after, self.config.bucket_size);
                    let terminal = position == last || trace.goal.is_satisfied(after);
                    let reward = closed / scale;
                    self.q_table
                        .update(&state, &step.action_id, reward, (!terminal).then_some(&next));
                    updates += 1;
                    continue;
                }
                (StepStatus::Failed, _) => -self.config.failure_penalty,
                _ => continue,
            };
            self.q_table.update(&state, &step.action_id, reward, None);
            updates += 1;
        }
        updates
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, payload);
        }
    }
}

fn q_table_error(path: &Path, source: io::Error) -> LearningError {
    LearningError::QTable {
        path: path.to_path_buf(),
        source,
    }
}
