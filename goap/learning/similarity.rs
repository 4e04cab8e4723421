use chrono::{DateTime, Utc};
use goap_actions::{ActionId, PlanId};
use goap_memory::{PlanRepository, SignatureRecord, StoreError};
use goap_world::Goal;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::signature::PlanSignature;

#[derive(Debug, Clone)]
struct IndexedPlan {
    signature: PlanSignature,
    goal: Goal,
    action_ids: Vec<ActionId>,
    recorded_at: DateTime<Utc>,
}

impl IndexedPlan {
    fn same_route(&self, goal: &Goal, action_ids: &[ActionId]) -> bool {
        self.action_ids == action_ids && &self.goal == goal
    }
}

/// Stored plan matching a request.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarPlan {
    /// Stored plan id.
    pub plan_id: PlanId,
    /// Context cosine similarity to the request.
    pub similarity: f64,
    /// Goal the stored plan reached.
    pub goal: Goal,
    /// Actions the stored plan ran.
    pub action_ids: Vec<ActionId>,
}

/// Signatures of past successful plans, searched before any A* work.
///
/// Reads run concurrently; inserts take a short write lock and last writer
/// wins per plan id. A plan reaching the same goal with the same actions as
/// an indexed one replaces it, so repeated runs do not grow the index. When
/// backed by a repository, signatures are persisted on insert and loaded
/// (joined with their plan records) on construction.
#[derive(Debug, Default)]
pub struct PlanSimilarityIndex {
    entries: RwLock<IndexMap<PlanId, IndexedPlan>>,
    repository: Option<PlanRepository>,
}

impl PlanSimilarityIndex {
    /// Empty in-memory index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index persisted through `repository`, preloaded with every stored
    /// signature whose plan record still exists.
    pub fn with_repository(repository: PlanRepository) -> Result<Self, StoreError> {
        let mut entries = IndexMap::new();
        for record in repository.signatures()? {
            let signature = match PlanSignature::try_from(record.vector) {
                Ok(signature) => signature,
                Err(reason) => {
                    warn!(plan_id = %record.plan_id, %reason, "skipping malformed signature");
                    continue;
                }
            };
            let Some(plan) = repository.plan(&record.plan_id)? else {
                debug!(plan_id = %record.plan_id, "signature without plan record");
                continue;
            };
            entries.insert(
                record.plan_id,
                IndexedPlan {
                    signature,
                    goal: plan.goal,
                    action_ids: plan.action_ids,
                    recorded_at: record.recorded_at,
                },
            );
        }
        entries.sort_by(|_, a, _, b| a.recorded_at.cmp(&b.recorded_at));
        let mut latest: IndexMap<PlanId, IndexedPlan> = IndexMap::with_capacity(entries.len());
        for (plan_id, entry) in entries {
            latest.retain(|_, kept| !kept.same_route(&entry.goal, &entry.action_ids));
            latest.insert(plan_id, entry);
        }
        let entries = latest;
        Ok(Self {
            entries: RwLock::new(entries),
            repository: Some(repository),
        })
    }

    /// Adds or replaces a plan's signature. Entries of other plans with the
    /// same goal and action sequence are dropped, along with their stored
    /// signatures.
    pub fn insert(
        &self,
        plan_id: impl Into<PlanId>,
        signature: PlanSignature,
        goal: Goal,
        action_ids: Vec<ActionId>,
    ) -> Result<(), StoreError> {
        let plan_id = plan_id.into();
        let recorded_at = Utc::now();
        if let Some(repository) = &self.repository {
            repository.save_signature(&SignatureRecord {
                plan_id: plan_id.clone(),
                vector: signature.clone().into(),
                recorded_at,
            })?;
        }
        let mut entries = self.entries.write();
        let superseded: Vec<PlanId> = entries
            .iter()
            .filter(|(id, entry)| **id != plan_id && entry.same_route(&goal, &action_ids))
            .map(|(id, _)| id.clone())
            .collect();
        for stale in &superseded {
            entries.shift_remove(stale);
            if let Some(repository) = &self.repository {
                repository.delete_signature(stale)?;
            }
            debug!(plan_id = %plan_id, superseded = %stale, "replaced indexed plan with same route");
        }
        entries.insert(
            plan_id,
            IndexedPlan {
                signature,
                goal,
                action_ids,
                recorded_at,
            },
        );
        Ok(())
    }

    /// Drops a plan from the in-memory index.
    pub fn remove(&self, plan_id: &str) -> bool {
        self.entries.write().shift_remove(plan_id).is_some()
    }

    /// Stored plans whose context similarity to `request` is at least
    /// `threshold`, most similar first, ties broken by plan id.
    #[must_use]
    pub fn nearest(&self, request: &PlanSignature, threshold: f64) -> Vec<SimilarPlan> {
        let mut matches: Vec<SimilarPlan> = self
            .entries
            .read()
            .iter()
            .filter_map(|(plan_id, entry)| {
                let similarity = request.context_similarity(&entry.signature);
                (similarity >= threshold).then(|| SimilarPlan {
                    plan_id: plan_id.clone(),
                    similarity,
                    goal: entry.goal.clone(),
                    action_ids: entry.action_ids.clone(),
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.plan_id.cmp(&b.plan_id))
        });
        matches
    }

    /// Number of indexed plans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether the plan is indexed.
    #[must_use]
    pub fn contains(&self, plan_id: &str) -> bool {
        self.entries.read().contains_key(plan_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goap_actions::Plan;
    use goap_memory::{MemoryRecordStore, PlanRecord};
    use goap_world::{GoalCondition, WorldState};
    use std::sync::Arc;

    fn goal() -> Goal {
        Goal::new([GoalCondition::gte("coverage.line", 80.0)])
    }

    fn state(coverage: f64) -> WorldState {
        WorldState::new().with("coverage.line", coverage)
    }

    #[test]
    fn returns_matches_above_threshold_in_order() {
        let index = PlanSimilarityIndex::new();
        let actions = vec!["measure".to_string()];
        index
            .insert(
                "plan-a",
                PlanSignature::of_plan(&state(40.0), &goal(), &actions),
                goal(),
                actions.clone(),
            )
            .unwrap();
        index
            .insert(
                "plan-b",
                PlanSignature::of_plan(&state(70.0), &goal(), &actions),
                goal(),
                actions,
            )
            .unwrap();
        let request = PlanSignature::of_request(&state(41.0), &goal());
        let matches = index.nearest(&request, 0.85);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].plan_id, "plan-a");
        assert!(matches[0].similarity >= matches[1].similarity);
        assert!(index.nearest(&request, 1.1).is_empty());
    }

    #[test]
    fn repeated_routes_keep_one_entry() {
        let repository = PlanRepository::new(Arc::new(MemoryRecordStore::new()));
        let index = PlanSimilarityIndex::with_repository(repository.clone()).unwrap();
        let route = vec!["measure".to_string(), "increase-coverage".to_string()];
        for (run, coverage) in [40.0, 45.0, 50.0].into_iter().enumerate() {
            index
                .insert(
                    format!("plan-{run}"),
                    PlanSignature::of_plan(&state(coverage), &goal(), &route),
                    goal(),
                    route.clone(),
                )
                .unwrap();
        }
        let other = vec!["generate-tests".to_string()];
        index
            .insert(
                "plan-other",
                PlanSignature::of_plan(&state(40.0), &goal(), &other),
                goal(),
                other,
            )
            .unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.contains("plan-2"));
        assert!(!index.contains("plan-0"));
        let stored: Vec<String> = repository
            .signatures()
            .unwrap()
            .into_iter()
            .map(|record| record.plan_id)
            .collect();
        assert_eq!(stored.len(), 2);
        assert!(stored.contains(&"plan-2".to_string()));
        assert!(stored.contains(&"plan-other".to_string()));
    }

    #[test]
    fn reloads_persisted_signatures() {
        let repository = PlanRepository::new(Arc::new(MemoryRecordStore::new()));
        let plan = Plan::new(goal(), vec!["measure".into()], 1.0, "hash");
        repository
            .save_plan(&PlanRecord::planned(&plan, state(40.0)))
            .unwrap();
        let index = PlanSimilarityIndex::with_repository(repository.clone()).unwrap();
        index
            .insert(
                plan.id.clone(),
                PlanSignature::of_plan(&state(40.0), &goal(), &plan.action_ids),
                goal(),
                plan.action_ids.clone(),
            )
            .unwrap();
        index
            .insert("plan-orphan", PlanSignature::of_request(&state(1.0), &goal()), goal(), Vec::new())
            .unwrap();

        let reloaded = PlanSimilarityIndex::with_repository(repository).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains(&plan.id));
    }
}
