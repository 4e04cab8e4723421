use chrono::{DateTime, Utc};
use goap_world::{Goal, WorldState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{actions::ActionId, plan::PlanId};

/// Status of one execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// Capability call in flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Precondition or capability failure.
    Failed,
    /// Not run because execution stopped first.
    Skipped,
}

/// Phase of the executor's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorPhase {
    /// Accepted, nothing run yet.
    Pending,
    /// Walking the current plan.
    Executing,
    /// Looking for a replacement plan.
    Replanning,
    /// Goal reached.
    Completed,
    /// Replan budget exhausted or no plan found.
    Failed,
    /// Stopped by cooperative cancellation.
    Canceled,
}

/// Terminal outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every goal condition holds.
    Completed,
    /// Execution gave up.
    Failed,
    /// Execution was canceled at an action boundary.
    Canceled,
}

/// One action's execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Position in the overall run.
    pub index: usize,
    /// Executed action.
    pub action_id: ActionId,
    /// Plan the action belonged to.
    pub plan_id: PlanId,
    /// Status.
    pub status: StepStatus,
    /// Live state observed before acting.
    pub before: WorldState,
    /// Live state after the step, when it completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<WorldState>,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// When the step finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Capability-reported elapsed time.
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Raw capability output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionStep {
    /// Starts a step in the running state.
    #[must_use]
    pub fn started(
        index: usize,
        action_id: impl Into<ActionId>,
        plan_id: impl Into<PlanId>,
        before: WorldState,
    ) -> Self {
        Self {
            index,
            action_id: action_id.into(),
            plan_id: plan_id.into(),
            status: StepStatus::Running,
            before,
            after: None,
            started_at: Utc::now(),
            finished_at: None,
            elapsed_ms: 0,
            raw_output: None,
            error: None,
        }
    }

    /// Marks the step completed.
    #[must_use]
    pub fn complete(mut self, after: WorldState, raw_output: Value, elapsed_ms: u64) -> Self {
        self.status = StepStatus::Completed;
        self.after = Some(after);
        self.raw_output = Some(raw_output);
        self.elapsed_ms = elapsed_ms;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Marks the step failed.
    #[must_use]
    pub fn fail(mut self, reason: impl Into<String>, raw_output: Option<Value>) -> Self {
        self.status = StepStatus::Failed;
        self.error = Some(reason.into());
        self.raw_output = raw_output;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Skipped step placeholder.
    #[must_use]
    pub fn skipped(
        index: usize,
        action_id: impl Into<ActionId>,
        plan_id: impl Into<PlanId>,
        before: WorldState,
    ) -> Self {
        let mut step = Self::started(index, action_id, plan_id, before);
        step.status = StepStatus::Skipped;
        step
    }
}

/// Why an execution ended without reaching its goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// Last action attempted, if any.
    pub action_id: Option<ActionId>,
    /// Human readable reason.
    pub reason: String,
    /// Steps that completed before the failure.
    pub executed_steps: usize,
}

/// Complete record of one execution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// Run identifier.
    pub run_id: String,
    /// Original goal.
    pub goal: Goal,
    /// Live state when the run started.
    pub initial_state: WorldState,
    /// Live state when the run ended.
    pub final_state: WorldState,
    /// Every plan executed, the original first.
    pub plan_ids: Vec<PlanId>,
    /// Provenance of the original plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused_from: Option<PlanId>,
    /// Steps in order, across replans.
    pub steps: Vec<ExecutionStep>,
    /// Phase transitions.
    pub phases: Vec<ExecutorPhase>,
    /// Replans performed.
    pub replans: usize,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,
    /// Sum of effective costs of completed steps.
    pub total_cost: f64,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
}

impl ExecutionTrace {
    /// Whether the goal was reached.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Original plan id.
    #[must_use]
    pub fn root_plan_id(&self) -> Option<&PlanId> {
        self.plan_ids.first()
    }

    /// Completed steps.
    pub fn completed_steps(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
    }

    /// Ids of completed actions, in order.
    #[must_use]
    pub fn executed_action_ids(&self) -> Vec<ActionId> {
        self.completed_steps()
            .map(|step| step.action_id.clone())
            .collect()
    }

    /// Number of failed steps.
    #[must_use]
    pub fn failed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Failed)
            .count()
    }

    /// Wall clock duration.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from((self.finished_at - self.started_at).num_milliseconds()).unwrap_or(0)
    }
}
