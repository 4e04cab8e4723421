use std::fmt;

use goap_actions::{ActionId, ActionLibrary, CostSnapshot, PlanConstraints};
use goap_world::{Goal, WorldState};

/// A stored action sequence replayed against a new request.
#[derive(Debug, Clone, PartialEq)]
pub struct Adapted {
    /// Shortest prefix of the stored sequence that meets the goal.
    pub action_ids: Vec<ActionId>,
    /// Cost under current statistics.
    pub cost: f64,
    /// Sum of duration estimates.
    pub duration_ms: u64,
}

/// Why a stored plan cannot serve the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The action no longer exists.
    UnknownAction(ActionId),
    /// The request's constraints forbid the action.
    Disallowed(ActionId),
    /// A precondition fails when replayed from the new state.
    NotApplicable {
        /// Action whose preconditions failed.
        action_id: ActionId,
        /// Position in the stored sequence.
        position: usize,
    },
    /// The whole sequence leaves the goal unmet.
    GoalUnmet,
    /// The sequence is longer than the search would allow.
    TooLong(usize),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAction(id) => write!(f, "unknown action `{id}`"),
            Self::Disallowed(id) => write!(f, "action `{id}` excluded by constraints"),
            Self::NotApplicable { action_id, position } => {
                write!(f, "action `{action_id}` not applicable at step {position}")
            }
            Self::GoalUnmet => f.write_str("goal unmet after replay"),
            Self::TooLong(len) => write!(f, "plan of {len} steps exceeds the length bound"),
        }
    }
}

/// Replays `stored` from `initial`, stopping at the first prefix that meets
/// `goal`. The result is priced with `costs`.
pub fn adapt(
    library: &ActionLibrary,
    costs: &CostSnapshot,
    initial: &WorldState,
    goal: &Goal,
    constraints: &PlanConstraints,
    stored: &[ActionId],
    max_plan_length: usize,
) -> Result<Adapted, Rejection> {
    let mut state = initial.clone();
    let mut action_ids = Vec::new();
    let mut cost = 0.0;
    let mut duration_ms = 0;
    for (position, action_id) in stored.iter().enumerate() {
        if goal.is_satisfied(&state) {
            break;
        }
        if action_ids.len() >= max_plan_length {
            return Err(Rejection::TooLong(stored.len()));
        }
        let action = library
            .get(action_id)
            .ok_or_else(|| Rejection::UnknownAction(action_id.clone()))?;
        if !constraints.permits(&action) {
            return Err(Rejection::Disallowed(action_id.clone()));
        }
        if !action.preconditions_met(&state) {
            return Err(Rejection::NotApplicable {
                action_id: action_id.clone(),
                position,
            });
        }
        state = action.apply(&state);
        cost += costs.cost(action_id).unwrap_or(action.cost);
        duration_ms += action.duration_ms.unwrap_or(0);
        action_ids.push(action_id.clone());
    }
    if !goal.is_satisfied(&state) {
        return Err(Rejection::GoalUnmet);
    }
    Ok(Adapted {
        action_ids,
        cost,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use goap_actions::Action;
    use goap_world::{Effect, GoalCondition};

    fn library() -> ActionLibrary {
        let library = ActionLibrary::default();
        library
            .extend([
                Action::builder("measure", "measurement")
                    .effect(Effect::set("testsMeasured", true))
                    .build(),
                Action::builder("increase-coverage", "testing")
                    .precondition(GoalCondition::eq("testsMeasured", true))
                    .effect(Effect::increase_by("coverage.line", 15.0))
                    .cost(3.0)
                    .build(),
            ])
            .unwrap();
        library
    }

    fn stored() -> Vec<ActionId> {
        ["measure", "increase-coverage", "increase-coverage", "increase-coverage"]
            .map(String::from)
            .to_vec()
    }

    fn goal() -> Goal {
        Goal::new([GoalCondition::gte("coverage.line", 80.0)])
    }

    #[test]
    fn truncates_to_the_shortest_satisfying_prefix() {
        let library = library();
        let initial = WorldState::new()
            .with("coverage.line", 55)
            .with("testsMeasured", false);
        let adapted = adapt(
            &library,
            &library.cost_snapshot(),
            &initial,
            &goal(),
            &PlanConstraints::default(),
            &stored(),
            64,
        )
        .unwrap();
        assert_eq!(adapted.action_ids.len(), 3);
        assert!((adapted.cost - 7.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_excluded_or_inapplicable_actions() {
        let library = library();
        let initial = WorldState::new().with("coverage.line", 40);
        let excluded = PlanConstraints::default().excluding("measure");
        assert_eq!(
            adapt(&library, &library.cost_snapshot(), &initial, &goal(), &excluded, &stored(), 64),
            Err(Rejection::Disallowed("measure".into()))
        );
        let skipped_measure = &stored()[1..];
        assert!(matches!(
            adapt(
                &library,
                &library.cost_snapshot(),
                &initial,
                &goal(),
                &PlanConstraints::default(),
                skipped_measure,
                64
            ),
            Err(Rejection::NotApplicable { position: 0, .. })
        ));
    }

    #[test]
    fn rejects_sequences_that_fall_short() {
        let library = library();
        let initial = WorldState::new().with("coverage.line", 10);
        assert_eq!(
            adapt(
                &library,
                &library.cost_snapshot(),
                &initial,
                &goal(),
                &PlanConstraints::default(),
                &stored(),
                64
            ),
            Err(Rejection::GoalUnmet)
        );
    }
}
