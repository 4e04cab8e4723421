use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Record kinds the engine persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Per-action statistics keyed by action id.
    ActionStats,
    /// Plan records keyed by plan id.
    Plans,
    /// Plan signatures keyed by plan id.
    Signatures,
}

impl Collection {
    /// Every collection.
    pub const ALL: [Self; 3] = [Self::ActionStats, Self::Plans, Self::Signatures];

    /// Directory / table name.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::ActionStats => "action_stats",
            Self::Plans => "plans",
            Self::Signatures => "signatures",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Errors emitted by record stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Stored record has an unexpected shape.
    #[error("invalid record {collection}/{key}: {reason}")]
    InvalidRecord {
        /// Collection.
        collection: Collection,
        /// Record key.
        key: String,
        /// What is wrong.
        reason: String,
    },
}

/// Storage collaborator: get/put by key, predicate query and atomic
/// increment over JSON records.
///
/// Implementations must make `increment` atomic with respect to other
/// `increment` calls on the same record.
pub trait RecordStore: Send + Sync {
    /// Reads one record.
    fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError>;

    /// Inserts or replaces one record.
    fn put(&self, collection: Collection, key: &str, record: Value) -> Result<(), StoreError>;

    /// Records matching `predicate`, in key order.
    fn query(
        &self,
        collection: Collection,
        predicate: &dyn Fn(&Value) -> bool,
    ) -> Result<Vec<(String, Value)>, StoreError>;

    /// Adds `delta` to a numeric field, creating the record and field at
    /// zero when absent. Returns the new value.
    fn increment(
        &self,
        collection: Collection,
        key: &str,
        field: &str,
        delta: f64,
    ) -> Result<f64, StoreError>;

    /// Removes a record, reporting whether it existed.
    fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError>;
}

/// Typed helpers over any [`RecordStore`].
pub trait RecordStoreExt: RecordStore {
    /// Reads and decodes a record.
    fn get_as<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        self.get(collection, key)?
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .transpose()
    }

    /// Encodes and writes a record.
    fn put_as<T: Serialize>(
        &self,
        collection: Collection,
        key: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        self.put(collection, key, serde_json::to_value(record)?)
    }

    /// Decodes every record of a collection, skipping ones that do not decode.
    fn all_as<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>, StoreError> {
        Ok(self
            .query(collection, &|_| true)?
            .into_iter()
            .filter_map(|(key, value)| {
                serde_json::from_value(value)
                    .map_err(|err| {
                        tracing::warn!(%collection, key = %key, error = %err, "skipping undecodable record");
                    })
                    .ok()
            })
            .collect())
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}

/// Shared increment semantics for stores holding records as JSON objects.
pub(crate) fn increment_field(
    collection: Collection,
    key: &str,
    record: &mut Value,
    field: &str,
    delta: f64,
) -> Result<f64, StoreError> {
    let invalid = |reason: String| StoreError::InvalidRecord {
        collection,
        key: key.to_string(),
        reason,
    };
    let object = record
        .as_object_mut()
        .ok_or_else(|| invalid("record is not an object".into()))?;
    let current = match object.get(field) {
        None | Some(Value::Null) => 0.0,
        Some(value) => value
            .as_f64()
            .ok_or_else(|| invalid(format!("field `{field}` is not numeric")))?,
    };
    let next = current + delta;
    let encoded = if (0.0..9.0e15).contains(&next) && next.fract().abs() < f64::EPSILON {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = next as u64;
        Value::from(whole)
    } else {
        serde_json::Number::from_f64(next)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("field `{field}` overflowed")))?
    };
    object.insert(field.to_string(), encoded);
    Ok(next)
}
