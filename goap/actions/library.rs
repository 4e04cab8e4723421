use std::sync::Arc;

use goap_world::{StateSchema, ValueKind, WorldState};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    actions::{Action, ActionCategory, ActionId},
    statistics::{ActionStats, InMemoryStatistics, StatisticsError, StatisticsRepository},
};

/// Errors raised while building or querying the library.
#[derive(Debug, Error)]
pub enum LibraryError {
    /// An action with the same id is already registered.
    #[error("action `{0}` is already registered")]
    DuplicateAction(ActionId),
    /// No action with this id exists.
    #[error("unknown action `{0}`")]
    UnknownAction(ActionId),
    /// Cost must be positive and finite.
    #[error("action `{id}` has invalid cost {cost}")]
    InvalidCost {
        /// Offending action.
        id: ActionId,
        /// Declared cost.
        cost: f64,
    },
    /// Declaration is structurally invalid.
    #[error("action `{id}` is invalid: {reason}")]
    InvalidAction {
        /// Offending action.
        id: ActionId,
        /// What is wrong.
        reason: String,
    },
    /// A simulated action found its preconditions unmet.
    #[error("action `{id}` at position {position} is not applicable")]
    NotApplicable {
        /// Action that could not run.
        id: ActionId,
        /// Index in the simulated sequence.
        position: usize,
    },
    /// Statistics backend failure.
    #[error(transparent)]
    Statistics(#[from] StatisticsError),
    /// Library document could not be read or written.
    #[error("library document: {0}")]
    Document(String),
}

/// Turns a success rate into a cost multiplier.
///
/// `penalty(rate) = 1 + penalty_weight * (1 - rate)`: a perfectly reliable
/// action costs its base cost, an always failing one costs
/// `1 + penalty_weight` times as much. Unreliable actions stay reachable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Weight of the unreliability penalty.
    pub penalty_weight: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            penalty_weight: 1.0,
        }
    }
}

impl CostModel {
    /// Cost multiplier for a success rate.
    #[must_use]
    pub fn penalty(&self, success_rate: f64) -> f64 {
        self.penalty_weight
            .max(0.0)
            .mul_add(1.0 - success_rate.clamp(0.0, 1.0), 1.0)
    }

    /// `base_cost * penalty(success_rate)`.
    #[must_use]
    pub fn effective_cost(&self, base_cost: f64, success_rate: f64) -> f64 {
        base_cost * self.penalty(success_rate)
    }
}

/// Filters applied to every planning request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConstraints {
    /// When set, only actions in these categories are considered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_categories: Option<IndexSet<ActionCategory>>,
    /// Actions never considered (used to avoid a just-failed action).
    #[serde(default)]
    pub excluded_action_ids: IndexSet<ActionId>,
    /// Per-request iteration budget override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    /// Per-request wall clock budget override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether stored plans may be reused.
    #[serde(default = "default_allow_reuse")]
    pub allow_reuse: bool,
}

const fn default_allow_reuse() -> bool {
    true
}

impl Default for PlanConstraints {
    fn default() -> Self {
        Self {
            allowed_categories: None,
            excluded_action_ids: IndexSet::new(),
            max_iterations: None,
            timeout_ms: None,
            allow_reuse: true,
        }
    }
}

impl PlanConstraints {
    /// Whether the action passes the category allow-list and the exclusion set.
    #[must_use]
    pub fn permits(&self, action: &Action) -> bool {
        if self.excluded_action_ids.contains(&action.id) {
            return false;
        }
        self.allowed_categories
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&action.category))
    }

    /// Adds an excluded action id.
    #[must_use]
    pub fn excluding(mut self, action_id: impl Into<ActionId>) -> Self {
        self.excluded_action_ids.insert(action_id.into());
        self
    }

    /// Restricts search to the given categories.
    #[must_use]
    pub fn allow_categories(
        mut self,
        categories: impl IntoIterator<Item = impl Into<ActionCategory>>,
    ) -> Self {
        self.allowed_categories = Some(categories.into_iter().map(Into::into).collect());
        self
    }

    /// Overrides the iteration budget.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Overrides the wall clock budget.
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Forces a fresh search.
    #[must_use]
    pub const fn without_reuse(mut self) -> Self {
        self.allow_reuse = false;
        self
    }
}

/// Effective costs frozen at the start of a search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostSnapshot {
    costs: IndexMap<ActionId, f64>,
}

impl CostSnapshot {
    /// Effective cost of an action.
    #[must_use]
    pub fn cost(&self, action_id: &str) -> Option<f64> {
        self.costs.get(action_id).copied()
    }

    /// Sum of effective costs for a sequence; `None` when an id is unknown.
    #[must_use]
    pub fn total<'a>(&self, action_ids: impl IntoIterator<Item = &'a ActionId>) -> Option<f64> {
        action_ids
            .into_iter()
            .try_fold(0.0, |total, id| self.cost(id).map(|cost| total + cost))
    }

    /// Number of priced actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.costs.len()
    }

    /// Whether no action is priced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.costs.is_empty()
    }
}

/// Queryable registry of actions plus their learned statistics.
///
/// Actions are immutable once registered; everything that changes at runtime
/// lives in the injected [`StatisticsRepository`], which planner and executor
/// share.
pub struct ActionLibrary {
    actions: RwLock<IndexMap<ActionId, Arc<Action>>>,
    declared: RwLock<StateSchema>,
    stats: Arc<dyn StatisticsRepository>,
    cost_model: CostModel,
}

impl std::fmt::Debug for ActionLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionLibrary")
            .field("actions", &self.actions.read().keys().collect::<Vec<_>>())
            .field("cost_model", &self.cost_model)
            .finish_non_exhaustive()
    }
}

impl Default for ActionLibrary {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryStatistics::default()))
    }
}

impl ActionLibrary {
    /// Creates an empty library backed by `stats`.
    #[must_use]
    pub fn new(stats: Arc<dyn StatisticsRepository>) -> Self {
        Self {
            actions: RwLock::new(IndexMap::new()),
            declared: RwLock::new(StateSchema::new()),
            stats,
            cost_model: CostModel::default(),
        }
    }

    /// Overrides the cost model.
    #[must_use]
    pub const fn with_cost_model(mut self, cost_model: CostModel) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// Active cost model.
    #[must_use]
    pub const fn cost_model(&self) -> CostModel {
        self.cost_model
    }

    /// Shared statistics repository.
    #[must_use]
    pub fn statistics(&self) -> Arc<dyn StatisticsRepository> {
        Arc::clone(&self.stats)
    }

    /// Registers an action, seeding its statistics.
    pub fn register(&self, action: Action) -> Result<(), LibraryError> {
        if action.id.trim().is_empty() {
            return Err(LibraryError::InvalidAction {
                id: action.id,
                reason: "empty id".into(),
            });
        }
        if !action.cost.is_finite() || action.cost <= 0.0 {
            return Err(LibraryError::InvalidCost {
                id: action.id,
                cost: action.cost,
            });
        }
        if !(0.0..=1.0).contains(&action.stats.success_rate) {
            return Err(LibraryError::InvalidAction {
                id: action.id,
                reason: format!("success rate {} outside [0, 1]", action.stats.success_rate),
            });
        }
        let mut actions = self.actions.write();
        if actions.contains_key(&action.id) {
            return Err(LibraryError::DuplicateAction(action.id));
        }
        self.stats.seed(&action.id, action.stats)?;
        actions.insert(action.id.clone(), Arc::new(action));
        Ok(())
    }

    /// Registers several actions, stopping at the first error.
    pub fn extend(&self, actions: impl IntoIterator<Item = Action>) -> Result<(), LibraryError> {
        actions.into_iter().try_for_each(|action| self.register(action))
    }

    /// Declares a state key that no action mentions but goals may use.
    pub fn declare_key(&self, key: impl Into<String>, kind: ValueKind) {
        self.declared.write().declare(key, kind);
    }

    /// Looks up an action.
    #[must_use]
    pub fn get(&self, action_id: &str) -> Option<Arc<Action>> {
        self.actions.read().get(action_id).cloned()
    }

    /// Whether the action exists.
    #[must_use]
    pub fn contains(&self, action_id: &str) -> bool {
        self.actions.read().contains_key(action_id)
    }

    /// All actions in registration order.
    #[must_use]
    pub fn actions(&self) -> Vec<Arc<Action>> {
        self.actions.read().values().cloned().collect()
    }

    /// Number of registered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    /// Whether the library is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.read().is_empty()
    }

    /// Keys the planner knows: declared keys plus everything actions touch.
    #[must_use]
    pub fn schema(&self) -> StateSchema {
        let mut schema = self.declared.read().clone();
        for action in self.actions.read().values() {
            for condition in &action.preconditions {
                schema.observe_condition(condition);
            }
            for effect in &action.effects {
                schema.observe_effect(effect);
            }
        }
        schema
    }

    /// Live statistics for an action, falling back to its seed.
    #[must_use]
    pub fn stats(&self, action_id: &str) -> Option<ActionStats> {
        let action = self.get(action_id)?;
        match self.stats.get(action_id) {
            Ok(live) => Some(live.unwrap_or(action.stats)),
            Err(err) => {
                warn!(action = action_id, error = %err, "statistics unavailable, using seed");
                Some(action.stats)
            }
        }
    }

    /// Actions whose preconditions hold and which pass `constraints`.
    #[must_use]
    pub fn applicable_actions(
        &self,
        state: &WorldState,
        constraints: &PlanConstraints,
    ) -> Vec<Arc<Action>> {
        self.actions
            .read()
            .values()
            .filter(|action| constraints.permits(action) && action.preconditions_met(state))
            .cloned()
            .collect()
    }

    /// Applies one outcome to the action's statistics.
    pub fn record_outcome(
        &self,
        action_id: &str,
        success: bool,
    ) -> Result<ActionStats, LibraryError> {
        if !self.contains(action_id) {
            return Err(LibraryError::UnknownAction(action_id.to_string()));
        }
        Ok(self.stats.record_outcome(action_id, success)?)
    }

    /// Base cost scaled by the unreliability penalty.
    #[must_use]
    pub fn effective_cost(&self, action_id: &str) -> Option<f64> {
        let action = self.get(action_id)?;
        let rate = self.stats(action_id).map_or(1.0, |stats| stats.success_rate);
        Some(self.cost_model.effective_cost(action.cost, rate))
    }

    /// Freezes effective costs so a search sees one consistent cost model.
    #[must_use]
    pub fn cost_snapshot(&self) -> CostSnapshot {
        let live = self.stats.snapshot().unwrap_or_else(|err| {
            warn!(error = %err, "statistics snapshot failed, pricing from seeds");
            IndexMap::new()
        });
        let costs = self
            .actions
            .read()
            .values()
            .map(|action| {
                let rate = live
                    .get(&action.id)
                    .map_or(action.stats.success_rate, |stats| stats.success_rate);
                (action.id.clone(), self.cost_model.effective_cost(action.cost, rate))
            })
            .collect();
        CostSnapshot { costs }
    }

    /// Applies a sequence of actions, checking preconditions at each step.
    pub fn simulate(
        &self,
        state: &WorldState,
        action_ids: &[ActionId],
    ) -> Result<WorldState, LibraryError> {
        action_ids
            .iter()
            .enumerate()
            .try_fold(state.clone(), |current, (position, id)| {
                let action = self
                    .get(id)
                    .ok_or_else(|| LibraryError::UnknownAction(id.clone()))?;
                if !action.preconditions_met(&current) {
                    return Err(LibraryError::NotApplicable {
                        id: id.clone(),
                        position,
                    });
                }
                Ok(action.apply(&current))
            })
    }

    /// Clones every action with its live statistics attached.
    #[must_use]
    pub fn export(&self) -> Vec<Action> {
        self.actions()
            .iter()
            .map(|action| {
                let mut exported = Action::clone(action);
                if let Some(stats) = self.stats(&action.id) {
                    exported.stats = stats;
                }
                exported
            })
            .collect()
    }
}
