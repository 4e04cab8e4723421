use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    effect::Effect,
    error::WorldError,
    goal::{Goal, GoalCondition, Operator},
    value::{StateValue, ValueKind},
};

/// The state keys a planner knows about, with their kind when it is known.
///
/// Built from explicit declarations plus every key that an action's
/// preconditions or effects mention. Goals referencing anything else are
/// rejected before search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSchema {
    keys: BTreeMap<String, Option<ValueKind>>,
}

impl StateSchema {
    /// Empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `key` with a definite kind, overriding any inferred kind.
    pub fn declare(&mut self, key: impl Into<String>, kind: ValueKind) {
        self.keys.insert(key.into(), Some(kind));
    }

    /// Builder form of [`StateSchema::declare`].
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>, kind: ValueKind) -> Self {
        self.declare(key, kind);
        self
    }

    /// Registers a key without a known kind.
    pub fn declare_untyped(&mut self, key: impl Into<String>) {
        self.keys.entry(key.into()).or_insert(None);
    }

    /// Learns the key (and its kind when implied) from a precondition.
    pub fn observe_condition(&mut self, condition: &GoalCondition) {
        let implied = if condition.op.is_inequality() {
            Some(ValueKind::Number)
        } else if matches!(condition.op, Operator::Eq | Operator::Ne) {
            condition.value.as_ref().map(StateValue::kind)
        } else {
            None
        };
        self.infer(&condition.key, implied);
    }

    /// Learns the key and its kind from an effect.
    pub fn observe_effect(&mut self, effect: &Effect) {
        let implied = match effect {
            Effect::Set { value, .. } => value.kind(),
            Effect::IncreaseBy { .. } | Effect::Increment { .. } => ValueKind::Number,
            Effect::MarkFlag { .. } | Effect::Invalidate { .. } => ValueKind::Bool,
        };
        self.infer(effect.key(), Some(implied));
    }

    fn infer(&mut self, key: &str, implied: Option<ValueKind>) {
        let slot = self.keys.entry(key.to_string()).or_insert(None);
        if slot.is_none() {
            *slot = implied;
        }
    }

    /// Whether the key is known.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Known kind for the key.
    #[must_use]
    pub fn kind_of(&self, key: &str) -> Option<ValueKind> {
        self.keys.get(key).copied().flatten()
    }

    /// Number of known keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no key is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Known keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Checks a single condition.
    pub fn validate_condition(&self, condition: &GoalCondition) -> Result<(), WorldError> {
        let key = &condition.key;
        if key.trim().is_empty() {
            return Err(WorldError::Malformed {
                key: key.clone(),
                reason: "empty state key".into(),
            });
        }
        if !self.contains(key) {
            return Err(WorldError::UnknownKey(key.clone()));
        }
        let op = condition.op;
        let value = match (&condition.value, op.requires_value()) {
            (None, true) => {
                return Err(WorldError::MissingValue {
                    key: key.clone(),
                    op,
                })
            }
            (value, _) => value.as_ref(),
        };
        if op.is_inequality() {
            if value.and_then(StateValue::as_f64).is_none() {
                return Err(WorldError::Malformed {
                    key: key.clone(),
                    reason: format!("`{op}` needs a numeric comparison value"),
                });
            }
            if let Some(kind) = self.kind_of(key).filter(|kind| *kind != ValueKind::Number) {
                return Err(WorldError::IncompatibleOperator {
                    key: key.clone(),
                    op,
                    kind,
                });
            }
        }
        if op == Operator::Contains {
            if let Some(kind) = self
                .kind_of(key)
                .filter(|kind| matches!(kind, ValueKind::Number | ValueKind::Bool))
            {
                return Err(WorldError::IncompatibleOperator {
                    key: key.clone(),
                    op,
                    kind,
                });
            }
        }
        if matches!(op, Operator::Eq | Operator::Ne) {
            if let (Some(kind), Some(value)) = (self.kind_of(key), value) {
                if value.kind() != kind {
                    return Err(WorldError::IncompatibleOperator {
                        key: key.clone(),
                        op,
                        kind,
                    });
                }
            }
        }
        Ok(())
    }

    /// Checks every condition of the goal, reporting the first problem.
    pub fn validate_goal(&self, goal: &Goal) -> Result<(), WorldError> {
        goal.conditions()
            .iter()
            .try_for_each(|condition| self.validate_condition(condition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> StateSchema {
        let mut schema = StateSchema::new();
        schema.observe_effect(&Effect::increase_by("coverage.line", 15.0));
        schema.observe_effect(&Effect::mark_flag("testsMeasured"));
        schema.observe_condition(&GoalCondition::exists("report"));
        schema.declare("suites", ValueKind::List);
        schema
    }

    #[test]
    fn infers_kinds_from_effects() {
        let schema = schema();
        assert_eq!(schema.kind_of("coverage.line"), Some(ValueKind::Number));
        assert_eq!(schema.kind_of("testsMeasured"), Some(ValueKind::Bool));
        assert!(schema.contains("report"));
        assert_eq!(schema.kind_of("report"), None);
    }

    #[test]
    fn rejects_unknown_keys() {
        let goal = Goal::new([GoalCondition::gte("coverage.branch", 70.0)]);
        assert_eq!(
            schema().validate_goal(&goal),
            Err(WorldError::UnknownKey("coverage.branch".into()))
        );
    }

    #[test]
    fn rejects_malformed_operators() {
        let schema = schema();
        let missing = GoalCondition::new("coverage.line", Operator::Gte, None);
        assert!(matches!(
            schema.validate_condition(&missing),
            Err(WorldError::MissingValue { .. })
        ));
        let wrong_kind = GoalCondition::gte("testsMeasured", 1.0);
        assert!(matches!(
            schema.validate_condition(&wrong_kind),
            Err(WorldError::IncompatibleOperator { .. })
        ));
        let text_bound = GoalCondition::new("coverage.line", Operator::Lt, Some("high".into()));
        assert!(matches!(
            schema.validate_condition(&text_bound),
            Err(WorldError::Malformed { .. })
        ));
        let eq_kind = GoalCondition::eq("testsMeasured", 1);
        assert!(schema.validate_condition(&eq_kind).is_err());
    }

    #[test]
    fn accepts_well_formed_goals() {
        let goal = Goal::new([
            GoalCondition::gte("coverage.line", 80.0),
            GoalCondition::eq("testsMeasured", true),
            GoalCondition::exists("report"),
            GoalCondition::contains("suites", "e2e"),
        ]);
        assert!(schema().validate_goal(&goal).is_ok());
    }
}
