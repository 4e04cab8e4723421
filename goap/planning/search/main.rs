use std::{sync::Arc, time::Duration};

use goap_actions::{ActionLibrary, Plan, PlanConstraints};
use goap_learning::{PlanSignature, PlanSimilarityIndex, ReuseTracker};
use goap_world::{Goal, WorldState};
use serde_json::json;
use shared_logging::{LogLevel, Telemetry};
use tracing::debug;

use crate::{
    config::SearchConfig,
    error::{ErrorContext, PlanningError},
};

/// Alternative plan enumeration.
pub mod alternatives;
/// Best-first search.
pub mod astar;
/// Adapting stored plans to new requests.
pub mod reuse;

pub use alternatives::{action_set, ExclusionFrontier};
pub use astar::{Found, SearchBudget, SearchFailure};
pub use reuse::{Adapted, Rejection};

#[derive(Debug, Clone)]
struct ReuseSource {
    index: Arc<PlanSimilarityIndex>,
    tracker: Arc<ReuseTracker>,
}

/// Goal-oriented planner: similarity reuse first, then A* search.
///
/// The planner holds no per-request mutable state, so concurrent requests
/// only share the library statistics and the similarity index.
#[derive(Debug)]
pub struct Planner {
    library: Arc<ActionLibrary>,
    config: SearchConfig,
    reuse: Option<ReuseSource>,
    telemetry: Option<Telemetry>,
}

impl Planner {
    /// Planner over `library` without plan reuse.
    #[must_use]
    pub fn new(library: Arc<ActionLibrary>, config: SearchConfig) -> Self {
        Self {
            library,
            config,
            reuse: None,
            telemetry: None,
        }
    }

    /// Consults `index` before searching, using the tracker's threshold.
    #[must_use]
    pub fn with_reuse(mut self, index: Arc<PlanSimilarityIndex>, tracker: Arc<ReuseTracker>) -> Self {
        self.reuse = Some(ReuseSource { index, tracker });
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Library the planner searches.
    #[must_use]
    pub fn library(&self) -> Arc<ActionLibrary> {
        Arc::clone(&self.library)
    }

    /// Search settings.
    #[must_use]
    pub const fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Finds a plan from `initial` to `goal`.
    ///
    /// Order: goal validation, already-satisfied check, reuse of a stored plan
    /// at or above the similarity threshold, then search. Search failures map
    /// to [`PlanningError::PlanNotFound`] or [`PlanningError::Timeout`].
    pub fn find_plan(
        &self,
        initial: &WorldState,
        goal: &Goal,
        constraints: &PlanConstraints,
    ) -> Result<Plan, PlanningError> {
        self.validate(initial, goal)?;
        let hash = initial.canonical_hash();
        if goal.is_satisfied(initial) {
            self.log(
                LogLevel::Debug,
                "goap.planner.goal_already_met",
                json!({ "state_hash": hash }),
            );
            return Ok(Plan::new(goal.clone(), Vec::new(), 0.0, hash));
        }

        let costs = self.library.cost_snapshot();
        if constraints.allow_reuse {
            if let Some(plan) = self.try_reuse(initial, goal, constraints, &costs, &hash) {
                return Ok(plan);
            }
        }

        let budget = self.budget(constraints);
        match astar::search(&self.library, &costs, initial, goal, constraints, budget) {
            Ok(found) => {
                let plan = Plan::new(goal.clone(), found.action_ids, found.cost, hash)
                    .with_duration(found.duration_ms)
                    .with_search(found.stats);
                self.log(
                    LogLevel::Info,
                    "goap.planner.search_completed",
                    json!({
                        "plan_id": plan.id,
                        "steps": plan.len(),
                        "cost": plan.total_cost,
                        "iterations": found.stats.iterations,
                        "elapsed_ms": found.stats.elapsed_ms,
                    }),
                );
                self.event(
                    "goap.planner.search_completed",
                    json!({ "plan_id": plan.id, "actions": plan.action_ids, "cost": plan.total_cost }),
                );
                Ok(plan)
            }
            Err(failure) => {
                let err = search_error(initial, goal, failure, budget);
                self.log(
                    LogLevel::Warn,
                    "goap.planner.plan_not_found",
                    json!({ "kind": err.kind(), "stats": failure.stats(), "goal": goal.to_string() }),
                );
                self.event(
                    "goap.planner.plan_not_found",
                    json!({ "kind": err.kind(), "state_hash": err.context().initial_state_hash }),
                );
                Err(err)
            }
        }
    }

    /// Up to `count` plans whose action sets differ pairwise.
    ///
    /// Alternatives come from searching again with actions of earlier plans
    /// excluded, breadth first, so the first plan is the one
    /// [`Planner::find_plan`] would search for. Fewer than `count` plans are
    /// returned when the library offers no more distinct routes; none at all
    /// is [`PlanningError::PlanNotFound`].
    pub fn find_alternatives(
        &self,
        initial: &WorldState,
        goal: &Goal,
        count: usize,
        constraints: &PlanConstraints,
    ) -> Result<Vec<Plan>, PlanningError> {
        self.validate(initial, goal)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let hash = initial.canonical_hash();
        if goal.is_satisfied(initial) {
            return Ok(vec![Plan::new(goal.clone(), Vec::new(), 0.0, hash)]);
        }

        let costs = self.library.cost_snapshot();
        let limit = count.saturating_mul(self.library.len().max(1));
        let mut frontier = ExclusionFrontier::new(constraints.clone().without_reuse(), limit);
        let mut plans = Vec::new();
        let mut first_failure = None;
        while plans.len() < count {
            let Some(request) = frontier.next_request() else {
                break;
            };
            let budget = self.budget(&request);
            match astar::search(&self.library, &costs, initial, goal, &request, budget) {
                Ok(found) => {
                    let plan = Plan::new(goal.clone(), found.action_ids, found.cost, hash.clone())
                        .with_duration(found.duration_ms)
                        .with_search(found.stats);
                    if frontier.offer(&request, &plan) {
                        plans.push(plan);
                    }
                }
                Err(failure) => {
                    debug!(excluded = ?request.excluded_action_ids, ?failure, "alternative search failed");
                    first_failure.get_or_insert((failure, budget));
                }
            }
        }

        if plans.is_empty() {
            let (failure, budget) = first_failure.unwrap_or((
                SearchFailure::Exhausted(goap_actions::SearchStats::default()),
                self.budget(constraints),
            ));
            return Err(search_error(initial, goal, failure, budget));
        }
        self.log(
            LogLevel::Info,
            "goap.planner.alternatives",
            json!({ "requested": count, "found": plans.len(), "searches": frontier.searches() }),
        );
        Ok(plans)
    }

    fn validate(&self, initial: &WorldState, goal: &Goal) -> Result<(), PlanningError> {
        self.library
            .schema()
            .validate_goal(goal)
            .map_err(|source| {
                self.log(
                    LogLevel::Warn,
                    "goap.planner.invalid_goal",
                    json!({ "error": source.to_string() }),
                );
                PlanningError::InvalidGoal {
                    source,
                    context: ErrorContext::new(goal, initial),
                }
            })
    }

    fn try_reuse(
        &self,
        initial: &WorldState,
        goal: &Goal,
        constraints: &PlanConstraints,
        costs: &goap_actions::CostSnapshot,
        hash: &str,
    ) -> Option<Plan> {
        let source = self.reuse.as_ref()?;
        let threshold = source.tracker.threshold();
        let request = PlanSignature::of_request(initial, goal);
        for candidate in source.index.nearest(&request, threshold) {
            match reuse::adapt(
                &self.library,
                costs,
                initial,
                goal,
                constraints,
                &candidate.action_ids,
                self.config.max_plan_length,
            ) {
                Ok(adapted) => {
                    let plan = Plan::new(goal.clone(), adapted.action_ids, adapted.cost, hash)
                        .with_duration(adapted.duration_ms)
                        .reused(candidate.plan_id.clone(), candidate.similarity);
                    self.log(
                        LogLevel::Info,
                        "goap.planner.reuse_hit",
                        json!({
                            "plan_id": plan.id,
                            "reused_from": candidate.plan_id,
                            "similarity": candidate.similarity,
                            "threshold": threshold,
                        }),
                    );
                    self.event(
                        "goap.planner.reuse_hit",
                        json!({ "plan_id": plan.id, "reused_from": candidate.plan_id, "similarity": candidate.similarity }),
                    );
                    return Some(plan);
                }
                Err(rejection) => {
                    self.log(
                        LogLevel::Debug,
                        "goap.planner.reuse_rejected",
                        json!({ "candidate": candidate.plan_id, "reason": rejection.to_string() }),
                    );
                }
            }
        }
        None
    }

    fn budget(&self, constraints: &PlanConstraints) -> SearchBudget {
        SearchBudget {
            max_iterations: constraints.max_iterations.unwrap_or(self.config.max_iterations),
            timeout: Duration::from_millis(constraints.timeout_ms.unwrap_or(self.config.timeout_ms)),
            max_plan_length: self.config.max_plan_length,
            normalization: self.config.numeric_normalization,
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, payload);
        }
    }
}

fn search_error(
    initial: &WorldState,
    goal: &Goal,
    failure: SearchFailure,
    budget: SearchBudget,
) -> PlanningError {
    let context = ErrorContext::new(goal, initial);
    let stats = failure.stats();
    match failure {
        SearchFailure::Timeout(_) => PlanningError::Timeout {
            timeout_ms: u64::try_from(budget.timeout.as_millis()).unwrap_or(u64::MAX),
            iterations: stats.iterations,
            context,
        },
        SearchFailure::IterationLimit(_) => PlanningError::PlanNotFound {
            reason: format!("iteration budget of {} exhausted", budget.max_iterations),
            iterations: stats.iterations,
            context,
        },
        SearchFailure::Exhausted(_) => PlanningError::PlanNotFound {
            reason: "no reachable state satisfies the goal".into(),
            iterations: stats.iterations,
            context,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goap_actions::Action;
    use goap_world::{Effect, GoalCondition};
    use shared_logging::MemoryLogger;

    fn library() -> Arc<ActionLibrary> {
        let library = ActionLibrary::default();
        library
            .extend([
                Action::builder("measure", "measurement")
                    .effect(Effect::set("testsMeasured", true))
                    .cost(1.0)
                    .build(),
                Action::builder("increase-coverage", "testing")
                    .precondition(GoalCondition::eq("testsMeasured", true))
                    .effect(Effect::increase_by("coverage.line", 15.0))
                    .cost(3.0)
                    .build(),
                Action::builder("generate-tests", "generation")
                    .precondition(GoalCondition::eq("testsMeasured", true))
                    .effect(Effect::increase_by("coverage.line", 20.0))
                    .cost(5.0)
                    .build(),
            ])
            .unwrap();
        Arc::new(library)
    }

    fn start() -> WorldState {
        WorldState::new()
            .with("coverage.line", 40)
            .with("testsMeasured", false)
    }

    fn goal() -> Goal {
        Goal::new([GoalCondition::gte("coverage.line", 80.0)])
    }

    #[test]
    fn rejects_unknown_goal_keys_before_search() {
        let planner = Planner::new(library(), SearchConfig::default());
        let err = planner
            .find_plan(
                &start(),
                &Goal::new([GoalCondition::eq("deploy.ready", true)]),
                &PlanConstraints::default(),
            )
            .unwrap_err();
        assert!(matches!(err, PlanningError::InvalidGoal { .. }));
        assert_eq!(err.context().initial_state_hash, start().canonical_hash());
    }

    #[test]
    fn satisfied_goal_yields_empty_plan() {
        let planner = Planner::new(library(), SearchConfig::default());
        let state = start().with("coverage.line", 90);
        let plan = planner
            .find_plan(&state, &goal(), &PlanConstraints::default())
            .unwrap();
        assert!(plan.is_empty());
        assert!(plan.total_cost.abs() < f64::EPSILON);
    }

    #[test]
    fn category_allow_list_limits_search() {
        let planner = Planner::new(library(), SearchConfig::default());
        let constraints = PlanConstraints::default().allow_categories(["measurement", "generation"]);
        let plan = planner.find_plan(&start(), &goal(), &constraints).unwrap();
        assert_eq!(plan.action_ids, ["measure", "generate-tests", "generate-tests"]);
        assert!((plan.total_cost - 11.0).abs() < 1e-9);
    }

    #[test]
    fn exhausted_search_is_plan_not_found() {
        let planner = Planner::new(library(), SearchConfig::default());
        let err = planner
            .find_plan(&start(), &goal(), &PlanConstraints::default().excluding("measure"))
            .unwrap_err();
        assert!(matches!(err, PlanningError::PlanNotFound { .. }));
    }

    #[test]
    fn zero_timeout_is_reported_as_timeout() {
        let planner = Planner::new(library(), SearchConfig::default());
        let err = planner
            .find_plan(&start(), &goal(), &PlanConstraints::default().with_timeout_ms(0))
            .unwrap_err();
        assert!(matches!(err, PlanningError::Timeout { timeout_ms: 0, .. }));
    }

    #[test]
    fn alternatives_differ_in_action_sets() {
        let planner = Planner::new(library(), SearchConfig::default());
        let plans = planner
            .find_alternatives(&start(), &goal(), 3, &PlanConstraints::default())
            .unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(
            plans[0].action_ids,
            ["measure", "increase-coverage", "increase-coverage", "increase-coverage"]
        );
        assert_ne!(action_set(&plans[0]), action_set(&plans[1]));
    }

    #[test]
    fn reuse_short_circuits_search() {
        let library = library();
        let index = Arc::new(PlanSimilarityIndex::new());
        let tracker = Arc::new(ReuseTracker::default());
        let stored: Vec<String> = ["measure", "generate-tests", "generate-tests"]
            .map(String::from)
            .to_vec();
        index
            .insert(
                "plan-stored",
                PlanSignature::of_plan(&start(), &goal(), &stored),
                goal(),
                stored,
            )
            .unwrap();
        let sink = Arc::new(MemoryLogger::new(16));
        let telemetry = Telemetry::builder("goap.planner").sink(sink.clone()).build().unwrap();
        let planner = Planner::new(library, SearchConfig::default())
            .with_reuse(index, tracker)
            .with_telemetry(telemetry);

        let plan = planner
            .find_plan(&start(), &goal(), &PlanConstraints::default())
            .unwrap();
        assert_eq!(plan.reused_from.as_deref(), Some("plan-stored"));
        assert!(plan.search.is_none());
        assert_eq!(plan.action_ids, ["measure", "generate-tests", "generate-tests"]);
        assert_eq!(sink.matching("goap.planner.reuse_hit").len(), 1);

        let fresh = planner
            .find_plan(&start(), &goal(), &PlanConstraints::default().without_reuse())
            .unwrap();
        assert!(!fresh.is_reused());
        assert!(fresh.search.is_some());
    }
}
