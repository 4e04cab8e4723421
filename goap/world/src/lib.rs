#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! World model for the planner: immutable states keyed by dotted paths, goal
//! predicates over those paths, and the effects actions apply to them.

/// Effect operations and their pure application.
pub mod effect;
/// Errors raised while validating goals against a schema.
pub mod error;
/// Goal conditions, goal conjunctions and goal distance.
pub mod goal;
/// Known state keys and their value kinds.
pub mod schema;
/// Structurally shared world state snapshots.
pub mod state;
/// Scalar and list values stored in a world state.
pub mod value;

pub use effect::{apply_effects, Effect};
pub use error::WorldError;
pub use goal::{evaluate, Goal, GoalCondition, Operator};
pub use schema::StateSchema;
pub use state::{canonical_hash, Facts, WorldState};
pub use value::{StateValue, ValueKind};
