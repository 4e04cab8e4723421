use goap_actions::{ActionId, ExecutionTrace};
use goap_world::{Goal, WorldError, WorldState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enough detail to rebuild a failing request in a test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Goal being pursued.
    pub goal: Goal,
    /// Canonical hash of the state planning or execution started from.
    pub initial_state_hash: String,
    /// Last action attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_id: Option<ActionId>,
    /// Steps that completed before the error.
    pub executed_steps: usize,
}

impl ErrorContext {
    /// Context for a request against `state`.
    #[must_use]
    pub fn new(goal: &Goal, state: &WorldState) -> Self {
        Self {
            goal: goal.clone(),
            initial_state_hash: state.canonical_hash(),
            last_action_id: None,
            executed_steps: 0,
        }
    }

    /// Records the last attempted action.
    #[must_use]
    pub fn with_action(mut self, action_id: Option<ActionId>, executed_steps: usize) -> Self {
        self.last_action_id = action_id;
        self.executed_steps = executed_steps;
        self
    }
}

/// Failures surfaced by the planner, executor and runtime.
#[derive(Debug, Error)]
pub enum PlanningError {
    /// Goal references an unknown key or misuses an operator. Raised before
    /// any search work and never retried.
    #[error("invalid goal: {source}")]
    InvalidGoal {
        /// Schema violation.
        source: WorldError,
        /// Request context.
        context: ErrorContext,
    },
    /// Search exhausted its iteration budget or its open set.
    #[error("no plan found after {iterations} iterations: {reason}")]
    PlanNotFound {
        /// Why the search stopped.
        reason: String,
        /// Nodes popped.
        iterations: usize,
        /// Request context.
        context: ErrorContext,
    },
    /// A capability kept failing after the replan budget was spent.
    #[error("action execution failed at `{}`: {reason}", .context.last_action_id.as_deref().unwrap_or("<none>"))]
    ActionExecution {
        /// Final failure reason.
        reason: String,
        /// Partial trace up to the failure.
        trace: Box<ExecutionTrace>,
        /// Request context.
        context: ErrorContext,
    },
    /// Search ran past its wall clock budget.
    #[error("planning timed out after {timeout_ms} ms ({iterations} iterations)")]
    Timeout {
        /// Budget that was exceeded.
        timeout_ms: u64,
        /// Nodes popped before the deadline.
        iterations: usize,
        /// Request context.
        context: ErrorContext,
    },
    /// Plan records or signatures could not be persisted or read.
    #[error("storage failure: {reason}")]
    Storage {
        /// Backend message.
        reason: String,
        /// Request context.
        context: ErrorContext,
    },
}

impl PlanningError {
    /// Reproduction context.
    #[must_use]
    pub const fn context(&self) -> &ErrorContext {
        match self {
            Self::InvalidGoal { context, .. }
            | Self::PlanNotFound { context, .. }
            | Self::ActionExecution { context, .. }
            | Self::Timeout { context, .. }
            | Self::Storage { context, .. } => context,
        }
    }

    /// Partial trace of a failed execution.
    #[must_use]
    pub fn trace(&self) -> Option<&ExecutionTrace> {
        match self {
            Self::ActionExecution { trace, .. } => Some(trace),
            _ => None,
        }
    }

    /// Stable label used in logs and events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidGoal { .. } => "invalid_goal",
            Self::PlanNotFound { .. } => "plan_not_found",
            Self::ActionExecution { .. } => "action_execution",
            Self::Timeout { .. } => "timeout",
            Self::Storage { .. } => "storage",
        }
    }

    pub(crate) fn storage(err: impl std::fmt::Display, context: ErrorContext) -> Self {
        Self::Storage {
            reason: err.to_string(),
            context,
        }
    }
}
