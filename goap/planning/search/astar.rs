use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use goap_actions::{Action, ActionId, ActionLibrary, CostSnapshot, PlanConstraints, SearchStats};
use goap_world::{Goal, WorldState};
use tracing::trace;

/// Limits applied to one search run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchBudget {
    /// Maximum nodes popped.
    pub max_iterations: usize,
    /// Wall clock budget.
    pub timeout: Duration,
    /// Deepest path considered.
    pub max_plan_length: usize,
    /// Divisor for numeric goal gaps in `h`.
    pub normalization: f64,
}

/// Action sequence reaching the goal.
#[derive(Debug, Clone, PartialEq)]
pub struct Found {
    /// Actions in order.
    pub action_ids: Vec<ActionId>,
    /// Sum of effective costs.
    pub cost: f64,
    /// Sum of duration estimates.
    pub duration_ms: u64,
    /// Search counters.
    pub stats: SearchStats,
}

/// Why a search stopped without reaching the goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFailure {
    /// Every reachable state was expanded.
    Exhausted(SearchStats),
    /// `max_iterations` nodes were popped.
    IterationLimit(SearchStats),
    /// The wall clock budget ran out.
    Timeout(SearchStats),
}

impl SearchFailure {
    /// Counters at the moment the search stopped.
    #[must_use]
    pub const fn stats(&self) -> SearchStats {
        match self {
            Self::Exhausted(stats) | Self::IterationLimit(stats) | Self::Timeout(stats) => *stats,
        }
    }
}

struct Node {
    state: WorldState,
    parent: Option<usize>,
    action: Option<Arc<Action>>,
    g: f64,
    depth: usize,
}

/// Open-set entry. `BinaryHeap` is a max-heap, so the ordering is reversed:
/// lower `f`, then lower `h`, then lower `g`, then earlier insertion wins.
#[derive(Debug, Clone, Copy)]
struct OpenEntry {
    f: f64,
    h: f64,
    g: f64,
    seq: u64,
    node: usize,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.h.total_cmp(&self.h))
            .then_with(|| other.g.total_cmp(&self.g))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Best-first search over world states.
///
/// `h` is [`Goal::distance`]: numeric gaps over `normalization` plus one per
/// unmet non-numeric condition. It is a fast greedy estimate and is not
/// admissible, so returned plans are good rather than provably cheapest.
/// States are deduplicated by canonical hash; a child whose hash is closed
/// is dropped, which also rejects effects that make no progress.
pub fn search(
    library: &ActionLibrary,
    costs: &CostSnapshot,
    initial: &WorldState,
    goal: &Goal,
    constraints: &PlanConstraints,
    budget: SearchBudget,
) -> Result<Found, SearchFailure> {
    let started = Instant::now();
    let mut stats = SearchStats::default();
    let heuristic = |state: &WorldState| goal.distance(state, budget.normalization);

    let mut nodes = vec![Node {
        state: initial.clone(),
        parent: None,
        action: None,
        g: 0.0,
        depth: 0,
    }];
    let mut open = BinaryHeap::new();
    let mut seq = 0_u64;
    let h0 = heuristic(initial);
    open.push(OpenEntry {
        f: h0,
        h: h0,
        g: 0.0,
        seq,
        node: 0,
    });
    let mut best_g: HashMap<String, f64> = HashMap::from([(initial.canonical_hash(), 0.0)]);
    let mut closed: HashSet<String> = HashSet::new();

    while let Some(entry) = open.pop() {
        if stats.iterations >= budget.max_iterations {
            stats.elapsed_ms = elapsed_ms(started);
            return Err(SearchFailure::IterationLimit(stats));
        }
        if started.elapsed() >= budget.timeout {
            stats.elapsed_ms = elapsed_ms(started);
            return Err(SearchFailure::Timeout(stats));
        }
        stats.iterations += 1;

        let node = &nodes[entry.node];
        let hash = node.state.canonical_hash();
        if closed.contains(&hash) {
            continue;
        }
        if goal.is_satisfied(&node.state) {
            stats.elapsed_ms = elapsed_ms(started);
            return Ok(reconstruct(&nodes, entry.node, stats));
        }
        closed.insert(hash);
        if node.depth >= budget.max_plan_length {
            continue;
        }
        stats.expanded += 1;

        let (state, g, depth) = (node.state.clone(), node.g, node.depth);
        for action in library.applicable_actions(&state, constraints) {
            let child = action.apply(&state);
            let child_hash = child.canonical_hash();
            if closed.contains(&child_hash) {
                continue;
            }
            let child_g = g + costs.cost(&action.id).unwrap_or(action.cost);
            if best_g
                .get(&child_hash)
                .is_some_and(|known| *known <= child_g)
            {
                continue;
            }
            best_g.insert(child_hash, child_g);
            let h = heuristic(&child);
            seq += 1;
            nodes.push(Node {
                state: child,
                parent: Some(entry.node),
                action: Some(action),
                g: child_g,
                depth: depth + 1,
            });
            open.push(OpenEntry {
                f: child_g + h,
                h,
                g: child_g,
                seq,
                node: nodes.len() - 1,
            });
            stats.generated += 1;
        }
        trace!(
            iteration = stats.iterations,
            open = open.len(),
            g,
            "expanded search node"
        );
    }

    stats.elapsed_ms = elapsed_ms(started);
    Err(SearchFailure::Exhausted(stats))
}

fn reconstruct(nodes: &[Node], goal_node: usize, stats: SearchStats) -> Found {
    let mut actions = Vec::new();
    let mut cursor = Some(goal_node);
    while let Some(index) = cursor {
        let node = &nodes[index];
        if let Some(action) = &node.action {
            actions.push(Arc::clone(action));
        }
        cursor = node.parent;
    }
    actions.reverse();
    Found {
        action_ids: actions.iter().map(|action| action.id.clone()).collect(),
        cost: nodes[goal_node].g,
        duration_ms: actions.iter().filter_map(|action| action.duration_ms).sum(),
        stats,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use goap_actions::ActionLibrary;
    use goap_world::{Effect, GoalCondition};

    fn budget() -> SearchBudget {
        SearchBudget {
            max_iterations: 10_000,
            timeout: Duration::from_secs(5),
            max_plan_length: 64,
            normalization: 10.0,
        }
    }

    fn coverage_library() -> ActionLibrary {
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
            ])
            .unwrap();
        library
    }

    fn start() -> WorldState {
        WorldState::new()
            .with("coverage.line", 40)
            .with("testsMeasured", false)
    }

    #[test]
    fn finds_cheapest_coverage_plan() {
        let library = coverage_library();
        let goal = Goal::new([GoalCondition::gte("coverage.line", 80.0)]);
        let found = search(
            &library,
            &library.cost_snapshot(),
            &start(),
            &goal,
            &PlanConstraints::default(),
            budget(),
        )
        .unwrap();
        assert_eq!(
            found.action_ids,
            ["measure", "increase-coverage", "increase-coverage", "increase-coverage"]
        );
        assert!((found.cost - 10.0).abs() < 1e-9);
        assert!(found.stats.expanded >= 4);
    }

    #[test]
    fn open_entries_break_ties_by_h_then_g_then_fifo() {
        let entry = |f, h, g, seq| OpenEntry {
            f,
            h,
            g,
            seq,
            node: 0,
        };
        let mut heap = BinaryHeap::from([
            entry(5.0, 2.0, 3.0, 0),
            entry(5.0, 1.0, 4.0, 1),
            entry(5.0, 1.0, 4.0, 2),
            entry(4.0, 4.0, 0.0, 3),
        ]);
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.seq)).collect();
        assert_eq!(order, [3, 1, 2, 0]);
    }

    #[test]
    fn non_progressing_effects_terminate() {
        let library = ActionLibrary::default();
        library
            .register(
                Action::builder("flag", "measurement")
                    .effect(Effect::mark_flag("testsMeasured"))
                    .build(),
            )
            .unwrap();
        let goal = Goal::new([GoalCondition::gte("coverage.line", 80.0)]);
        let failure = search(
            &library,
            &library.cost_snapshot(),
            &start(),
            &goal,
            &PlanConstraints::default(),
            budget(),
        )
        .unwrap_err();
        assert!(matches!(failure, SearchFailure::Exhausted(stats) if stats.iterations <= 3));
    }

    #[test]
    fn iteration_budget_is_enforced() {
        let library = coverage_library();
        let goal = Goal::new([GoalCondition::gte("coverage.line", 80.0)]);
        let failure = search(
            &library,
            &library.cost_snapshot(),
            &start(),
            &goal,
            &PlanConstraints::default(),
            SearchBudget {
                max_iterations: 2,
                ..budget()
            },
        )
        .unwrap_err();
        assert!(matches!(failure, SearchFailure::IterationLimit(stats) if stats.iterations == 2));
    }

    #[test]
    fn plan_length_bound_prunes_deep_paths() {
        let library = coverage_library();
        let goal = Goal::new([GoalCondition::gte("coverage.line", 80.0)]);
        let failure = search(
            &library,
            &library.cost_snapshot(),
            &start(),
            &goal,
            &PlanConstraints::default(),
            SearchBudget {
                max_plan_length: 3,
                ..budget()
            },
        )
        .unwrap_err();
        assert!(matches!(failure, SearchFailure::Exhausted(_)));
    }
}
