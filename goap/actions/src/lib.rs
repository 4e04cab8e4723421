#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Actions for goal-oriented planning: declarations, the queryable library
//! with learned statistics, plans, execution traces and capability runners.

/// Action declarations and categories.
#[path = "../actions.rs"]
pub mod actions;

/// Capability runners ("agents") invoked when an action executes.
#[path = "../agents.rs"]
pub mod agents;

/// Structured library documents (TOML / JSON).
#[path = "../document.rs"]
pub mod document;

/// The action library and planning constraints.
#[path = "../library.rs"]
pub mod library;

/// Plans produced by the planner.
#[path = "../plan.rs"]
pub mod plan;

/// Learned per-action statistics.
#[path = "../statistics.rs"]
pub mod statistics;

/// Execution steps and traces.
#[path = "../trace.rs"]
pub mod trace;

pub use actions::{Action, ActionBuilder, ActionCategory, ActionId};
pub use agents::{
    AgentRegistry, CapabilityError, CapabilityOutcome, CapabilityRequest, CapabilityRunner,
    SimulatedRunner,
};
pub use document::LibraryDocument;
pub use library::{ActionLibrary, CostModel, CostSnapshot, LibraryError, PlanConstraints};
pub use plan::{Plan, PlanId, SearchStats};
pub use statistics::{ActionStats, InMemoryStatistics, StatisticsError, StatisticsRepository};
pub use trace::{
    ExecutionFailure, ExecutionStatus, ExecutionStep, ExecutionTrace, ExecutorPhase, StepStatus,
};

/// Prelude exports for crates that plan and execute against the library.
pub mod prelude {
    pub use crate::actions::{Action, ActionCategory, ActionId};
    pub use crate::agents::{CapabilityOutcome, CapabilityRequest, CapabilityRunner};
    pub use crate::library::{ActionLibrary, PlanConstraints};
    pub use crate::plan::Plan;
    pub use goap_world::{Effect, Goal, GoalCondition, Operator, StateValue, WorldState};
}
