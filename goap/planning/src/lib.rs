#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Goal-oriented action planning: A* search over action libraries, plan
//! reuse, OODA execution with replanning, and the runtime tying them to
//! persistence and learning.

/// Engine configuration.
#[path = "../config.rs"]
pub mod config;
/// Planning errors and their context.
#[path = "../error.rs"]
pub mod error;
/// Plan execution (observe, orient, decide, act).
#[path = "../execution/main.rs"]
pub mod execution;
/// Runtime facade.
#[path = "../main.rs"]
pub mod runtime;
/// Plan search.
#[path = "../search/main.rs"]
pub mod search;

pub use config::{
    CostConfig, ExecutionConfig, GoapConfig, LearningSection, ReuseConfig, SearchConfig,
    TelemetryConfig,
};
pub use error::{ErrorContext, PlanningError};
pub use execution::{CancellationFlag, JsonMeasurements, MeasurementParser, PlanExecutor};
pub use runtime::{GoapRuntime, GoapRuntimeBuilder};
pub use search::Planner;
