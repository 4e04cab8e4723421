use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

/// Tolerance used when comparing numeric facts.
pub const NUMERIC_TOLERANCE: f64 = 1e-9;

/// A single fact stored under a state key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Boolean flag.
    Bool(bool),
    /// Numeric measurement or counter.
    Number(f64),
    /// Free-form text.
    Text(String),
    /// Small array or set of values.
    List(Vec<StateValue>),
}

/// Coarse type of a [`StateValue`], used by the schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Boolean flag.
    Bool,
    /// Number.
    Number,
    /// Text.
    Text,
    /// List.
    List,
}

impl ValueKind {
    /// Short label used in error messages.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Number => "number",
            Self::Text => "text",
            Self::List => "list",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl StateValue {
    /// Kind of the value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::Text,
            Self::List(_) => ValueKind::List,
        }
    }

    /// Numeric view of the value.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Boolean view of the value.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Text view of the value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Membership test: list element equality or substring match for text.
    #[must_use]
    pub fn contains(&self, needle: &Self) -> bool {
        match (self, needle) {
            (Self::List(items), needle) => items.iter().any(|item| item == needle),
            (Self::Text(haystack), Self::Text(needle)) => haystack.contains(needle.as_str()),
            _ => false,
        }
    }

    /// Converts a JSON scalar or array. Objects and nulls have no direct value.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(flag) => Some(Self::Bool(*flag)),
            serde_json::Value::Number(number) => number.as_f64().map(Self::Number),
            serde_json::Value::String(text) => Some(Self::Text(text.clone())),
            serde_json::Value::Array(items) => Some(Self::List(
                items.iter().filter_map(Self::from_json).collect(),
            )),
            serde_json::Value::Null | serde_json::Value::Object(_) => None,
        }
    }

    /// Appends the canonical encoding used for state hashing.
    pub(crate) fn encode_canonical(&self, out: &mut String) {
        match self {
            Self::Bool(flag) => {
                let _ = write!(out, "b:{flag}");
            }
            Self::Number(number) => {
                let _ = write!(out, "n:{}", canonical_number(*number));
            }
            Self::Text(text) => {
                out.push_str("s:");
                out.push_str(&serde_json::Value::String(text.clone()).to_string());
            }
            Self::List(items) => {
                out.push_str("l:[");
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    item.encode_canonical(out);
                }
                out.push(']');
            }
        }
    }
}

/// Rounds to six decimals and folds negative zero so equal facts hash equally.
#[must_use]
pub fn canonical_number(value: f64) -> f64 {
    let rounded = (value * 1e6).round() / 1e6;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => (a - b).abs() <= NUMERIC_TOLERANCE,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Number(number) => write!(f, "{number}"),
            Self::Text(text) => write!(f, "{text:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for StateValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for StateValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<Self>> for StateValue {
    fn from(value: Vec<Self>) -> Self {
        Self::List(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_compare_with_tolerance() {
        assert_eq!(StateValue::from(0.1 + 0.2), StateValue::from(0.3));
        assert_ne!(StateValue::from(1), StateValue::from(true));
    }

    #[test]
    fn contains_handles_lists_and_text() {
        let list = StateValue::List(vec!["unit".into(), "e2e".into()]);
        assert!(list.contains(&"e2e".into()));
        assert!(!list.contains(&"load".into()));
        assert!(StateValue::from("src/lib.rs").contains(&"lib".into()));
        assert!(!StateValue::from(3).contains(&StateValue::from(3)));
    }

    #[test]
    fn untagged_json_round_trip_picks_variants() {
        let value: StateValue = serde_json::from_value(json!([true, 2, "x"])).unwrap();
        assert_eq!(
            value,
            StateValue::List(vec![true.into(), 2.into(), "x".into()])
        );
        assert_eq!(StateValue::from_json(&json!(null)), None);
    }

    #[test]
    fn canonical_number_folds_negative_zero() {
        assert!(canonical_number(-0.0).is_sign_positive());
        assert!((canonical_number(1.000_000_4) - 1.0).abs() < f64::EPSILON);
    }
}
