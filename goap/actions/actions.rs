use std::{fmt, str::FromStr};

use goap_world::{apply_effects, Effect, GoalCondition, WorldState};
use serde::{Deserialize, Serialize};

use crate::statistics::ActionStats;

/// Strongly typed identifier for every action in the library.
pub type ActionId = String;

/// Capability family an action belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub enum ActionCategory {
    /// Static or dynamic analysis.
    Analysis,
    /// Test generation and execution.
    Test,
    /// Coverage measurement and improvement.
    Coverage,
    /// Security scanning and remediation.
    Security,
    /// Performance profiling and tuning.
    Performance,
    /// Quality gates and reviews.
    Quality,
    /// Process and workflow steps.
    Process,
    /// Agent fleet management.
    Fleet,
    /// Operator supplied category.
    Custom(String),
}

impl ActionCategory {
    /// Returns a short human readable label.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Analysis => "analysis",
            Self::Test => "test",
            Self::Coverage => "coverage",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Quality => "quality",
            Self::Process => "process",
            Self::Fleet => "fleet",
            Self::Custom(label) => label,
        }
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<String> for ActionCategory {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "analysis" => Self::Analysis,
            "test" | "testing" => Self::Test,
            "coverage" => Self::Coverage,
            "security" => Self::Security,
            "performance" => Self::Performance,
            "quality" => Self::Quality,
            "process" => Self::Process,
            "fleet" => Self::Fleet,
            _ => Self::Custom(raw),
        }
    }
}

impl From<&str> for ActionCategory {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<ActionCategory> for String {
    fn from(category: ActionCategory) -> Self {
        category.label().to_string()
    }
}

impl FromStr for ActionCategory {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(raw))
    }
}

/// Atomic, capability-bound operation with preconditions, effects and cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Unique identifier.
    pub id: ActionId,
    /// Display name.
    pub name: String,
    /// Category tag used by allow-lists and diversity checks.
    pub category: ActionCategory,
    /// Capability (agent type) that executes the action.
    pub capability: String,
    /// Conditions that must hold before the action may run.
    #[serde(default)]
    pub preconditions: Vec<GoalCondition>,
    /// Effects applied when the action succeeds.
    #[serde(default)]
    pub effects: Vec<Effect>,
    /// Base cost; always positive.
    pub cost: f64,
    /// Expected duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Seed or last persisted statistics; live values are owned by the
    /// library's statistics repository.
    #[serde(default)]
    pub stats: ActionStats,
}

impl Action {
    /// Starts a builder; capability defaults to the category label and name to the id.
    #[must_use]
    pub fn builder(id: impl Into<ActionId>, category: impl Into<ActionCategory>) -> ActionBuilder {
        let id = id.into();
        let category = category.into();
        ActionBuilder {
            action: Self {
                name: id.clone(),
                capability: category.label().to_string(),
                id,
                category,
                preconditions: Vec::new(),
                effects: Vec::new(),
                cost: 1.0,
                duration_ms: None,
                stats: ActionStats::default(),
            },
        }
    }

    /// Whether every precondition holds in `state`.
    #[must_use]
    pub fn preconditions_met(&self, state: &WorldState) -> bool {
        self.preconditions
            .iter()
            .all(|condition| condition.is_met(state))
    }

    /// Preconditions that do not hold in `state`.
    pub fn unmet_preconditions<'a>(
        &'a self,
        state: &'a WorldState,
    ) -> impl Iterator<Item = &'a GoalCondition> {
        self.preconditions
            .iter()
            .filter(move |condition| !condition.is_met(state))
    }

    /// Applies the declared effects, returning a new state.
    #[must_use]
    pub fn apply(&self, state: &WorldState) -> WorldState {
        apply_effects(state, &self.effects)
    }
}

/// Builder used to declare actions fluently.
#[derive(Debug)]
pub struct ActionBuilder {
    action: Action,
}

impl ActionBuilder {
    /// Overrides the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.action.name = name.into();
        self
    }

    /// Overrides the capability.
    #[must_use]
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.action.capability = capability.into();
        self
    }

    /// Adds a precondition.
    #[must_use]
    pub fn precondition(mut self, condition: GoalCondition) -> Self {
        self.action.preconditions.push(condition);
        self
    }

    /// Adds an effect.
    #[must_use]
    pub fn effect(mut self, effect: Effect) -> Self {
        self.action.effects.push(effect);
        self
    }

    /// Sets the base cost.
    #[must_use]
    pub const fn cost(mut self, cost: f64) -> Self {
        self.action.cost = cost;
        self
    }

    /// Sets the duration estimate.
    #[must_use]
    pub const fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.action.duration_ms = Some(duration_ms);
        self
    }

    /// Seeds statistics.
    #[must_use]
    pub const fn stats(mut self, stats: ActionStats) -> Self {
        self.action.stats = stats;
        self
    }

    /// Consumes the builder returning the action.
    #[must_use]
    pub fn build(self) -> Action {
        self.action
    }
}
