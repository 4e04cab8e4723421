use thiserror::Error;

use crate::{goal::Operator, value::ValueKind};

/// Problems found while validating goals against the state schema.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorldError {
    /// The key is not part of the schema.
    #[error("unknown state key `{0}`")]
    UnknownKey(String),
    /// The operator name could not be parsed.
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),
    /// The operator needs a comparison value.
    #[error("operator `{op}` on `{key}` requires a comparison value")]
    MissingValue {
        /// Offending key.
        key: String,
        /// Operator missing its value.
        op: Operator,
    },
    /// The operator does not fit the key's kind.
    #[error("operator `{op}` cannot be applied to `{key}` of kind {kind}")]
    IncompatibleOperator {
        /// Offending key.
        key: String,
        /// Operator used.
        op: Operator,
        /// Kind recorded by the schema.
        kind: ValueKind,
    },
    /// Any other structural problem.
    #[error("malformed condition on `{key}`: {reason}")]
    Malformed {
        /// Offending key (may be empty).
        key: String,
        /// Human readable detail.
        reason: String,
    },
}
