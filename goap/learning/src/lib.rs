#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Learning for the planning engine: plan signatures and the similarity
//! index used for plan reuse, the adaptive reuse threshold, a tabular
//! Q-learner, and the trace-driven learning loop tying them together.

/// Learning from execution traces.
#[path = "../learner.rs"]
pub mod learner;

/// Tabular Q-learning over discretized states.
#[path = "../qtable.rs"]
pub mod qtable;

/// Adaptive reuse threshold.
#[path = "../reuse.rs"]
pub mod reuse;

/// Plan feature signatures.
#[path = "../signature.rs"]
pub mod signature;

/// Similarity index over stored plan signatures.
#[path = "../similarity.rs"]
pub mod similarity;

pub use learner::{LearningConfig, LearningError, LearningOutcome, PlanLearning};
pub use qtable::{QEntry, QTable, StateBucket};
pub use reuse::{ReusePolicy, ReuseStats, ReuseTracker};
pub use signature::{cosine_similarity, PlanSignature};
pub use similarity::{PlanSimilarityIndex, SimilarPlan};
