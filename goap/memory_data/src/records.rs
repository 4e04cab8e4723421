use std::sync::Arc;

use chrono::{DateTime, Utc};
use goap_actions::{ActionId, ActionStats, ExecutionStatus, ExecutionTrace, Plan, PlanId};
use goap_world::{Goal, WorldState};
use serde::{Deserialize, Serialize};

use crate::store::{Collection, RecordStore, RecordStoreExt, StoreError};

/// Persisted statistics for one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStatsRecord {
    /// Action id.
    pub action_id: ActionId,
    /// Success-rate EMA.
    pub success_rate: f64,
    /// Executions recorded.
    #[serde(default)]
    pub execution_count: u64,
    /// Successful executions.
    #[serde(default)]
    pub successes: u64,
    /// Failed executions.
    #[serde(default)]
    pub failures: u64,
    /// Last change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ActionStatsRecord {
    /// Statistics view.
    #[must_use]
    pub const fn stats(&self) -> ActionStats {
        ActionStats {
            success_rate: self.success_rate,
            execution_count: self.execution_count,
            last_updated: self.last_updated,
        }
    }
}

/// Lifecycle of a stored plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Produced, not yet executed.
    Planned,
    /// Execution reached the goal.
    Completed,
    /// Execution gave up.
    Failed,
    /// Execution was canceled.
    Canceled,
}

impl From<ExecutionStatus> for PlanStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed => Self::Completed,
            ExecutionStatus::Failed => Self::Failed,
            ExecutionStatus::Canceled => Self::Canceled,
        }
    }
}

/// Learning outcome attached to an executed plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// Reward in `[0, 1]`: share of the goal distance the run closed.
    pub reward: f64,
    /// Goal distance of the initial state.
    pub distance_before: f64,
    /// Goal distance of the final state.
    pub distance_after: f64,
}

/// Compact view of an execution trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Run identifier.
    pub run_id: String,
    /// Steps attempted.
    pub steps: usize,
    /// Steps completed.
    pub completed_steps: usize,
    /// Steps failed.
    pub failed_steps: usize,
    /// Replans performed.
    pub replans: usize,
    /// Every plan executed.
    pub plan_ids: Vec<PlanId>,
    /// Canonical hash of the final live state.
    pub final_state_hash: String,
    /// Wall clock duration.
    pub duration_ms: u64,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<&ExecutionTrace> for TraceSummary {
    fn from(trace: &ExecutionTrace) -> Self {
        Self {
            run_id: trace.run_id.clone(),
            steps: trace.steps.len(),
            completed_steps: trace.completed_steps().count(),
            failed_steps: trace.failed_steps(),
            replans: trace.replans,
            plan_ids: trace.plan_ids.clone(),
            final_state_hash: trace.final_state.canonical_hash(),
            duration_ms: trace.duration_ms(),
            failure: trace.failure.as_ref().map(|failure| failure.reason.clone()),
        }
    }
}

/// Stored plan: goal, initial state, action sequence and what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    /// Plan id.
    pub plan_id: PlanId,
    /// Goal.
    pub goal: Goal,
    /// Initial state snapshot.
    pub initial_state: WorldState,
    /// Action sequence (for executed plans, the actions that ran).
    pub action_ids: Vec<ActionId>,
    /// Cost.
    pub total_cost: f64,
    /// Status.
    pub status: PlanStatus,
    /// Learning outcome once executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PlanOutcome>,
    /// Plan this one was reused from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused_from: Option<PlanId>,
    /// Trace summary once executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceSummary>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl PlanRecord {
    /// Record for a plan that has not run yet.
    #[must_use]
    pub fn planned(plan: &Plan, initial_state: WorldState) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan.id.clone(),
            goal: plan.goal.clone(),
            initial_state,
            action_ids: plan.action_ids.clone(),
            total_cost: plan.total_cost,
            status: PlanStatus::Planned,
            outcome: None,
            reused_from: plan.reused_from.clone(),
            trace: None,
            created_at: plan.created_at,
            updated_at: now,
        }
    }

    /// Record for an executed run keyed by its original plan.
    #[must_use]
    pub fn executed(plan_id: impl Into<PlanId>, trace: &ExecutionTrace, outcome: PlanOutcome) -> Self {
        Self {
            plan_id: plan_id.into(),
            goal: trace.goal.clone(),
            initial_state: trace.initial_state.clone(),
            action_ids: trace.executed_action_ids(),
            total_cost: trace.total_cost,
            status: trace.status.into(),
            outcome: Some(outcome),
            reused_from: trace.reused_from.clone(),
            trace: Some(TraceSummary::from(trace)),
            created_at: trace.started_at,
            updated_at: Utc::now(),
        }
    }

    /// Whether the plan reached its goal.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == PlanStatus::Completed
    }
}

/// Stored plan signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Plan the signature belongs to.
    pub plan_id: PlanId,
    /// Feature vector.
    pub vector: Vec<f64>,
    /// When it was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Typed facade over a [`RecordStore`].
#[derive(Clone)]
pub struct PlanRepository {
    store: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for PlanRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanRepository").finish_non_exhaustive()
    }
}

impl PlanRepository {
    /// Wraps a store.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    /// Inserts or replaces a plan record.
    pub fn save_plan(&self, record: &PlanRecord) -> Result<(), StoreError> {
        self.store.put_as(Collection::Plans, &record.plan_id, record)
    }

    /// Loads a plan record.
    pub fn plan(&self, plan_id: &str) -> Result<Option<PlanRecord>, StoreError> {
        self.store.get_as(Collection::Plans, plan_id)
    }

    /// Plan records matching `predicate`, newest first.
    pub fn plans(
        &self,
        predicate: impl Fn(&PlanRecord) -> bool,
    ) -> Result<Vec<PlanRecord>, StoreError> {
        let mut records: Vec<PlanRecord> = self
            .store
            .all_as::<PlanRecord>(Collection::Plans)?
            .into_iter()
            .filter(|record| predicate(record))
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    /// Inserts or replaces a signature.
    pub fn save_signature(&self, record: &SignatureRecord) -> Result<(), StoreError> {
        self.store.put_as(Collection::Signatures, &record.plan_id, record)
    }

    /// Deletes a plan's signature; `false` when none was stored.
    pub fn delete_signature(&self, plan_id: &str) -> Result<bool, StoreError> {
        self.store.delete(Collection::Signatures, plan_id)
    }

    /// Every stored signature.
    pub fn signatures(&self) -> Result<Vec<SignatureRecord>, StoreError> {
        self.store.all_as(Collection::Signatures)
    }

    /// Persisted statistics for an action.
    pub fn action_stats(&self, action_id: &str) -> Result<Option<ActionStatsRecord>, StoreError> {
        self.store.get_as(Collection::ActionStats, action_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryRecordStore;
    use goap_world::GoalCondition;

    fn plan() -> Plan {
        Plan::new(
            Goal::new([GoalCondition::gte("coverage.line", 80.0)]),
            vec!["measure".into(), "increase-coverage".into()],
            4.0,
            "hash",
        )
    }

    #[test]
    fn saves_and_filters_plans() {
        let repository = PlanRepository::new(Arc::new(MemoryRecordStore::new()));
        let planned = PlanRecord::planned(&plan(), WorldState::new().with("coverage.line", 40));
        let mut done = PlanRecord::planned(&plan(), WorldState::new());
        done.status = PlanStatus::Completed;
        repository.save_plan(&planned).unwrap();
        repository.save_plan(&done).unwrap();

        let loaded = repository.plan(&planned.plan_id).unwrap().unwrap();
        assert_eq!(loaded.initial_state.number("coverage.line"), Some(40.0));
        let succeeded = repository.plans(PlanRecord::succeeded).unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].plan_id, done.plan_id);
    }

    #[test]
    fn saves_signatures() {
        let repository = PlanRepository::new(Arc::new(MemoryRecordStore::new()));
        repository
            .save_signature(&SignatureRecord {
                plan_id: "plan-1".into(),
                vector: vec![0.5, -0.5],
                recorded_at: Utc::now(),
            })
            .unwrap();
        assert_eq!(repository.signatures().unwrap()[0].vector, [0.5, -0.5]);
        assert!(repository.delete_signature("plan-1").unwrap());
        assert!(!repository.delete_signature("plan-1").unwrap());
        assert!(repository.signatures().unwrap().is_empty());
    }
}
