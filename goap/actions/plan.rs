use chrono::{DateTime, Utc};
use goap_world::Goal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actions::ActionId;

/// Plan identifier (`plan-<uuid>`).
pub type PlanId = String;

/// Counters collected by one search run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStats {
    /// Nodes popped from the open set.
    pub iterations: usize,
    /// Nodes whose successors were generated.
    pub expanded: usize,
    /// Successor nodes pushed.
    pub generated: usize,
    /// Wall clock spent.
    pub elapsed_ms: u64,
}

/// Ordered action sequence moving an initial state toward a goal.
///
/// Plans reference actions by id only; the library owns the actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Identifier.
    pub id: PlanId,
    /// Goal the plan satisfies.
    pub goal: Goal,
    /// Actions in execution order.
    pub action_ids: Vec<ActionId>,
    /// Sum of effective costs at planning time.
    pub total_cost: f64,
    /// Sum of duration estimates.
    pub estimated_duration_ms: u64,
    /// Canonical hash of the state the plan was made for.
    pub initial_state_hash: String,
    /// Stored plan this one was adapted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused_from: Option<PlanId>,
    /// Similarity that justified the reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    /// Search counters; absent for reused plans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchStats>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Creates a freshly identified plan.
    #[must_use]
    pub fn new(
        goal: Goal,
        action_ids: Vec<ActionId>,
        total_cost: f64,
        initial_state_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("plan-{}", Uuid::new_v4()),
            goal,
            action_ids,
            total_cost,
            estimated_duration_ms: 0,
            initial_state_hash: initial_state_hash.into(),
            reused_from: None,
            similarity: None,
            search: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the duration estimate.
    #[must_use]
    pub const fn with_duration(mut self, estimated_duration_ms: u64) -> Self {
        self.estimated_duration_ms = estimated_duration_ms;
        self
    }

    /// Tags reuse provenance.
    #[must_use]
    pub fn reused(mut self, source: impl Into<PlanId>, similarity: f64) -> Self {
        self.reused_from = Some(source.into());
        self.similarity = Some(similarity);
        self
    }

    /// Attaches search counters.
    #[must_use]
    pub const fn with_search(mut self, stats: SearchStats) -> Self {
        self.search = Some(stats);
        self
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.action_ids.len()
    }

    /// Whether the plan has no step (goal already satisfied).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.action_ids.is_empty()
    }

    /// Whether the plan came from the similarity index.
    #[must_use]
    pub const fn is_reused(&self) -> bool {
        self.reused_from.is_some()
    }
}
