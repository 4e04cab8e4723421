use goap_world::WorldState;
use serde_json::Value;

/// Turns raw capability output into measured state.
///
/// Measured facts replace whatever the action's effects predicted.
pub trait MeasurementParser: Send + Sync {
    /// Facts measured by one capability call.
    fn parse(&self, raw_output: &Value) -> WorldState;
}

/// Reads a JSON object under a fixed field (`measurements` by default),
/// flattening nested objects into dotted keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonMeasurements {
    field: String,
}

impl Default for JsonMeasurements {
    fn default() -> Self {
        Self::new("measurements")
    }
}

impl JsonMeasurements {
    /// Parser reading `field`.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl MeasurementParser for JsonMeasurements {
    fn parse(&self, raw_output: &Value) -> WorldState {
        match raw_output.get(&self.field) {
            Some(measured @ Value::Object(_)) => WorldState::from_json(measured),
            _ => WorldState::new(),
        }
    }
}
