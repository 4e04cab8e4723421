use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    state::{Facts, WorldState},
    value::StateValue,
};

/// State mutation declared by an action.
///
/// Effects on a missing key initialize it first: numeric effects start from
/// `0`, flags from `false`. Numeric effects are additive, `set` is an
/// idempotent replacement, and a flag raised by `mark_flag` stays raised until
/// some action applies `invalidate` to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Effect {
    /// Replace the value.
    Set {
        /// Target key.
        key: String,
        /// New value.
        value: StateValue,
    },
    /// Add `amount` to a numeric value.
    IncreaseBy {
        /// Target key.
        key: String,
        /// Amount added (may be negative).
        amount: f64,
    },
    /// Add one to a numeric value.
    Increment {
        /// Target key.
        key: String,
    },
    /// Raise a boolean flag.
    MarkFlag {
        /// Target key.
        key: String,
    },
    /// Lower a boolean flag.
    Invalidate {
        /// Target key.
        key: String,
    },
}

impl Effect {
    /// `key = value`.
    #[must_use]
    pub fn set(key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `key += amount`.
    #[must_use]
    pub fn increase_by(key: impl Into<String>, amount: f64) -> Self {
        Self::IncreaseBy {
            key: key.into(),
            amount,
        }
    }

    /// `key += 1`.
    #[must_use]
    pub fn increment(key: impl Into<String>) -> Self {
        Self::Increment { key: key.into() }
    }

    /// `key = true`.
    #[must_use]
    pub fn mark_flag(key: impl Into<String>) -> Self {
        Self::MarkFlag { key: key.into() }
    }

    /// `key = false`.
    #[must_use]
    pub fn invalidate(key: impl Into<String>) -> Self {
        Self::Invalidate { key: key.into() }
    }

    /// Key the effect writes.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::IncreaseBy { key, .. }
            | Self::Increment { key }
            | Self::MarkFlag { key }
            | Self::Invalidate { key } => key,
        }
    }

    /// Value the key holds after the effect, given its current value.
    #[must_use]
    pub fn resolve(&self, current: Option<&StateValue>) -> StateValue {
        let base = || current.and_then(StateValue::as_f64).unwrap_or(0.0);
        match self {
            Self::Set { value, .. } => value.clone(),
            Self::IncreaseBy { amount, .. } => StateValue::Number(base() + amount),
            Self::Increment { .. } => StateValue::Number(base() + 1.0),
            Self::MarkFlag { .. } => StateValue::Bool(true),
            Self::Invalidate { .. } => StateValue::Bool(false),
        }
    }

    fn apply_in_place(&self, facts: &mut Facts) -> bool {
        let next = self.resolve(facts.get(self.key()));
        if facts.get(self.key()) == Some(&next) {
            return false;
        }
        facts.insert(self.key().to_string(), next);
        true
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set { key, value } => write!(f, "{key} = {value}"),
            Self::IncreaseBy { key, amount } => write!(f, "{key} += {amount}"),
            Self::Increment { key } => write!(f, "{key}++"),
            Self::MarkFlag { key } => write!(f, "{key} = true"),
            Self::Invalidate { key } => write!(f, "{key} = false"),
        }
    }
}

/// Applies `effects` in order, returning a new state. The input is never
/// mutated; when no effect changes a fact the result shares its storage.
#[must_use]
pub fn apply_effects(state: &WorldState, effects: &[Effect]) -> WorldState {
    if effects.is_empty() {
        return state.clone();
    }
    state.derive(|facts| {
        effects
            .iter()
            .fold(false, |changed, effect| effect.apply_in_place(facts) | changed)
    })
}
