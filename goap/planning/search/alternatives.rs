use std::collections::VecDeque;

use goap_actions::{ActionId, Plan, PlanConstraints};
use indexmap::IndexSet;

/// Upper bound on searches spent collecting alternatives.
pub const MAX_ALTERNATIVE_SEARCHES: usize = 64;

/// Action-id set of a plan. Two plans are alternatives of each other only
/// when these differ, so reorderings and relabelings never count.
#[must_use]
pub fn action_set(plan: &Plan) -> IndexSet<ActionId> {
    let mut ids: Vec<&ActionId> = plan.action_ids.iter().collect();
    ids.sort();
    ids.into_iter().cloned().collect()
}

/// Breadth-first walk over exclusion sets: every accepted plan spawns one
/// request per distinct action it uses, with that action excluded.
#[derive(Debug)]
pub struct ExclusionFrontier {
    queue: VecDeque<PlanConstraints>,
    seen: Vec<IndexSet<ActionId>>,
    accepted: Vec<IndexSet<ActionId>>,
    searches: usize,
    limit: usize,
}

impl ExclusionFrontier {
    /// Frontier seeded with the caller's constraints.
    #[must_use]
    pub fn new(base: PlanConstraints, limit: usize) -> Self {
        let mut seen = Vec::new();
        seen.push(sorted(&base.excluded_action_ids));
        Self {
            queue: VecDeque::from([base]),
            seen,
            accepted: Vec::new(),
            searches: 0,
            limit: limit.min(MAX_ALTERNATIVE_SEARCHES),
        }
    }

    /// Next constraint set to search under, while the search budget lasts.
    pub fn next_request(&mut self) -> Option<PlanConstraints> {
        if self.searches >= self.limit {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.searches += 1;
        Some(next)
    }

    /// Offers a plan found under `constraints`; returns whether it is a new
    /// alternative. Its actions are queued for exclusion either way.
    pub fn offer(&mut self, constraints: &PlanConstraints, plan: &Plan) -> bool {
        for action_id in action_set(plan) {
            let child = constraints.clone().excluding(action_id);
            let key = sorted(&child.excluded_action_ids);
            if !self.seen.contains(&key) {
                self.seen.push(key);
                self.queue.push_back(child);
            }
        }
        let set = action_set(plan);
        if self.accepted.contains(&set) {
            return false;
        }
        self.accepted.push(set);
        true
    }

    /// Searches run so far.
    #[must_use]
    pub const fn searches(&self) -> usize {
        self.searches
    }
}

fn sorted(ids: &IndexSet<ActionId>) -> IndexSet<ActionId> {
    let mut ids = ids.clone();
    ids.sort();
    ids
}
