use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::WorldError, state::WorldState, value::StateValue};

/// Smallest contribution of an unmet inequality to the goal distance.
const UNMET_FLOOR: f64 = 1e-3;

/// Comparison operator of a [`GoalCondition`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Value equals the comparison value.
    Eq,
    /// Value differs from the comparison value (or is absent).
    Ne,
    /// Numeric `>=`.
    Gte,
    /// Numeric `<=`.
    Lte,
    /// Numeric `>`.
    Gt,
    /// Numeric `<`.
    Lt,
    /// Key is present.
    Exists,
    /// List membership or substring.
    Contains,
}

impl Operator {
    /// Canonical short name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Exists => "exists",
            Self::Contains => "contains",
        }
    }

    /// Whether the operator compares numbers.
    #[must_use]
    pub const fn is_inequality(self) -> bool {
        matches!(self, Self::Gte | Self::Lte | Self::Gt | Self::Lt)
    }

    /// Whether a comparison value is mandatory.
    #[must_use]
    pub const fn requires_value(self) -> bool {
        !matches!(self, Self::Exists)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Operator {
    type Err = WorldError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "eq" | "equals" | "==" | "=" => Self::Eq,
            "ne" | "neq" | "not_equals" | "!=" => Self::Ne,
            "gte" | ">=" => Self::Gte,
            "lte" | "<=" => Self::Lte,
            "gt" | ">" => Self::Gt,
            "lt" | "<" => Self::Lt,
            "exists" => Self::Exists,
            "contains" => Self::Contains,
            other => return Err(WorldError::UnknownOperator(other.to_string())),
        })
    }
}

/// Predicate over a single state key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalCondition {
    /// Dotted state key.
    pub key: String,
    /// Operator.
    pub op: Operator,
    /// Comparison value; absent only for `exists`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<StateValue>,
}

impl GoalCondition {
    /// Builds a condition.
    #[must_use]
    pub fn new(key: impl Into<String>, op: Operator, value: Option<StateValue>) -> Self {
        Self {
            key: key.into(),
            op,
            value,
        }
    }

    /// `key == value`.
    #[must_use]
    pub fn eq(key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        Self::new(key, Operator::Eq, Some(value.into()))
    }

    /// `key != value`.
    #[must_use]
    pub fn ne(key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        Self::new(key, Operator::Ne, Some(value.into()))
    }

    /// `key >= value`.
    #[must_use]
    pub fn gte(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, Operator::Gte, Some(StateValue::Number(value)))
    }

    /// `key <= value`.
    #[must_use]
    pub fn lte(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, Operator::Lte, Some(StateValue::Number(value)))
    }

    /// `key > value`.
    #[must_use]
    pub fn gt(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, Operator::Gt, Some(StateValue::Number(value)))
    }

    /// `key < value`.
    #[must_use]
    pub fn lt(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, Operator::Lt, Some(StateValue::Number(value)))
    }

    /// Key is present.
    #[must_use]
    pub fn exists(key: impl Into<String>) -> Self {
        Self::new(key, Operator::Exists, None)
    }

    /// List/text at `key` contains `value`.
    #[must_use]
    pub fn contains(key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        Self::new(key, Operator::Contains, Some(value.into()))
    }

    /// Evaluates the predicate.
    #[must_use]
    pub fn is_met(&self, state: &WorldState) -> bool {
        evaluate(state, self)
    }

    /// Normalized unmet distance: numeric gap over `normalization` for
    /// inequalities, `1.0` for any other unmet condition, `0.0` when met.
    #[must_use]
    pub fn distance(&self, state: &WorldState, normalization: f64) -> f64 {
        if self.is_met(state) {
            return 0.0;
        }
        if !self.op.is_inequality() {
            return 1.0;
        }
        let Some(target) = self.value.as_ref().and_then(StateValue::as_f64) else {
            return 1.0;
        };
        let current = match state.get(&self.key) {
            None => 0.0,
            Some(StateValue::Number(value)) => *value,
            Some(_) => return 1.0,
        };
        let gap = match self.op {
            Operator::Gte | Operator::Gt => target - current,
            _ => current - target,
        };
        (gap.max(0.0) / normalization.max(f64::EPSILON)).max(UNMET_FLOOR)
    }
}

impl fmt::Display for GoalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{} {} {value}", self.key, self.op),
            None => write!(f, "{} {}", self.key, self.op),
        }
    }
}

/// Evaluates `condition` against `state`.
#[must_use]
pub fn evaluate(state: &WorldState, condition: &GoalCondition) -> bool {
    let current = state.get(&condition.key);
    let expected = condition.value.as_ref();
    match condition.op {
        Operator::Exists => current.is_some(),
        Operator::Eq => matches!((current, expected), (Some(a), Some(b)) if a == b),
        Operator::Ne => match (current, expected) {
            (None, Some(_)) => true,
            (Some(a), Some(b)) => a != b,
            (_, None) => false,
        },
        Operator::Contains => {
            matches!((current, expected), (Some(haystack), Some(needle)) if haystack.contains(needle))
        }
        op => {
            let (Some(a), Some(b)) = (
                current.and_then(StateValue::as_f64),
                expected.and_then(StateValue::as_f64),
            ) else {
                return false;
            };
            match op {
                Operator::Gte => a >= b,
                Operator::Lte => a <= b,
                Operator::Gt => a > b,
                Operator::Lt => a < b,
                _ => false,
            }
        }
    }
}

/// Conjunction of goal conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Goal {
    conditions: Vec<GoalCondition>,
}

impl Goal {
    /// Builds a goal from conditions.
    #[must_use]
    pub fn new(conditions: impl IntoIterator<Item = GoalCondition>) -> Self {
        Self {
            conditions: conditions.into_iter().collect(),
        }
    }

    /// Parses the compact JSON form: `{"coverage.line": {"gte": 80}, "deployed": true}`.
    /// A bare value means equality; an object maps operators to values.
    pub fn from_json(document: &serde_json::Value) -> Result<Self, WorldError> {
        let serde_json::Value::Object(map) = document else {
            return Err(WorldError::Malformed {
                key: String::new(),
                reason: "goal must be a JSON object".into(),
            });
        };
        let mut conditions = Vec::new();
        for (key, spec) in map {
            match spec {
                serde_json::Value::Object(ops) => {
                    for (op, raw) in ops {
                        let op: Operator = op.parse()?;
                        let value = StateValue::from_json(raw);
                        if op == Operator::Exists {
                            conditions.push(GoalCondition::exists(key.clone()));
                        } else {
                            conditions.push(GoalCondition::new(key.clone(), op, value));
                        }
                    }
                }
                scalar => {
                    let value =
                        StateValue::from_json(scalar).ok_or_else(|| WorldError::MissingValue {
                            key: key.clone(),
                            op: Operator::Eq,
                        })?;
                    conditions.push(GoalCondition::new(key.clone(), Operator::Eq, Some(value)));
                }
            }
        }
        Ok(Self { conditions })
    }

    /// Conditions in declaration order.
    #[must_use]
    pub fn conditions(&self) -> &[GoalCondition] {
        &self.conditions
    }

    /// Number of conditions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Whether there are no conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether every condition holds.
    #[must_use]
    pub fn is_satisfied(&self, state: &WorldState) -> bool {
        self.conditions.iter().all(|condition| condition.is_met(state))
    }

    /// Conditions that do not hold.
    pub fn unmet<'a>(&'a self, state: &'a WorldState) -> impl Iterator<Item = &'a GoalCondition> {
        self.conditions
            .iter()
            .filter(move |condition| !condition.is_met(state))
    }

    /// The goal minus the conditions already satisfied by `state`.
    #[must_use]
    pub fn remaining(&self, state: &WorldState) -> Self {
        Self::new(self.unmet(state).cloned())
    }

    /// Sum of per-condition distances; zero exactly when satisfied.
    #[must_use]
    pub fn distance(&self, state: &WorldState, normalization: f64) -> f64 {
        self.conditions
            .iter()
            .map(|condition| condition.distance(state, normalization))
            .sum()
    }

    /// Keys referenced by the goal.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(|condition| condition.key.as_str())
    }
}

impl FromIterator<GoalCondition> for Goal {
    fn from_iter<T: IntoIterator<Item = GoalCondition>>(iter: T) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, condition) in self.conditions.iter().enumerate() {
            if idx > 0 {
                f.write_str(" && ")?;
            }
            write!(f, "{condition}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> WorldState {
        WorldState::new()
            .with("coverage.line", 40)
            .with("testsMeasured", false)
            .with("suites", StateValue::List(vec!["unit".into()]))
            .with("branch", "main")
    }

    #[test]
    fn evaluates_every_operator() {
        let s = state();
        assert!(GoalCondition::eq("testsMeasured", false).is_met(&s));
        assert!(GoalCondition::ne("branch", "dev").is_met(&s));
        assert!(GoalCondition::ne("missing", 1).is_met(&s));
        assert!(GoalCondition::gte("coverage.line", 40.0).is_met(&s));
        assert!(!GoalCondition::gt("coverage.line", 40.0).is_met(&s));
        assert!(GoalCondition::lte("coverage.line", 40.0).is_met(&s));
        assert!(GoalCondition::lt("coverage.line", 41.0).is_met(&s));
        assert!(GoalCondition::exists("branch").is_met(&s));
        assert!(!GoalCondition::exists("missing").is_met(&s));
        assert!(GoalCondition::contains("suites", "unit").is_met(&s));
        assert!(GoalCondition::contains("branch", "ai").is_met(&s));
        assert!(!GoalCondition::gte("branch", 1.0).is_met(&s));
    }

    #[test]
    fn distance_normalizes_numeric_gaps() {
        let s = state();
        let goal = Goal::new([
            GoalCondition::gte("coverage.line", 80.0),
            GoalCondition::eq("testsMeasured", true),
        ]);
        assert!((goal.distance(&s, 10.0) - 5.0).abs() < 1e-9);
        let done = s.set("coverage.line", 85).set("testsMeasured", true);
        assert!(goal.distance(&done, 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn strict_inequality_at_boundary_is_still_unmet() {
        let s = state();
        let condition = GoalCondition::gt("coverage.line", 40.0);
        assert!(condition.distance(&s, 10.0) > 0.0);
    }

    #[test]
    fn remaining_drops_satisfied_conditions() {
        let goal = Goal::new([
            GoalCondition::gte("coverage.line", 30.0),
            GoalCondition::eq("testsMeasured", true),
        ]);
        let remaining = goal.remaining(&state());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining.conditions()[0].key, "testsMeasured");
    }

    #[test]
    fn parses_compact_json_goals() {
        let goal = Goal::from_json(&json!({
            "coverage.line": { "gte": 80 },
            "testsMeasured": true,
            "report": { "exists": null }
        }))
        .unwrap();
        assert_eq!(goal.len(), 3);
        assert!(goal
            .conditions()
            .iter()
            .any(|c| c.op == Operator::Exists && c.key == "report"));
        assert!(matches!(
            Goal::from_json(&json!({ "x": { "approx": 1 } })),
            Err(WorldError::UnknownOperator(_))
        ));
    }
}
