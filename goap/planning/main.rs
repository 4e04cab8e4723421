use std::sync::Arc;

use anyhow::{Context, Result};
use goap_actions::{
    Action, ActionLibrary, AgentRegistry, CapabilityRunner, ExecutionTrace, LibraryDocument,
    Plan, PlanConstraints,
};
use goap_learning::{PlanLearning, PlanSimilarityIndex, ReuseTracker};
use goap_memory::{MemoryRecordStore, PlanRecord, PlanRepository, RecordStore, StoreBackedStatistics};
use goap_world::{Goal, ValueKind, WorldState};
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::{LogLevel, Telemetry};

use crate::{
    config::GoapConfig,
    error::{ErrorContext, PlanningError},
    execution::{CancellationFlag, MeasurementParser, PlanExecutor},
    search::Planner,
};

/// Builder wiring a [`GoapRuntime`] from configuration and collaborators.
pub struct GoapRuntimeBuilder {
    config: GoapConfig,
    actions: Vec<Action>,
    schema: Vec<(String, ValueKind)>,
    store: Option<Arc<dyn RecordStore>>,
    runner: Option<Arc<dyn CapabilityRunner>>,
    parser: Option<Arc<dyn MeasurementParser>>,
    telemetry: Option<Telemetry>,
}

impl GoapRuntimeBuilder {
    /// Registers actions.
    #[must_use]
    pub fn actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Registers every action and declared key of a library document.
    #[must_use]
    pub fn document(mut self, document: LibraryDocument) -> Self {
        self.schema.extend(document.schema);
        self.actions.extend(document.actions);
        self
    }

    /// Persists statistics, plans and signatures in `store` (in memory by
    /// default).
    #[must_use]
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Capability runner used by the executor. Defaults to an empty
    /// [`AgentRegistry`], which fails every capability.
    #[must_use]
    pub fn runner(mut self, runner: Arc<dyn CapabilityRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Measurement parser used by the executor.
    #[must_use]
    pub fn parser(mut self, parser: Arc<dyn MeasurementParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Telemetry handle; otherwise one is built from the configured paths.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the runtime, loading persisted signatures from the store.
    pub fn build(self) -> Result<GoapRuntime> {
        let config = self.config;
        config.validate()?;
        let telemetry = match self.telemetry {
            Some(telemetry) => Some(telemetry),
            None => configured_telemetry(&config)?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryRecordStore::new()));

        let statistics = StoreBackedStatistics::new(Arc::clone(&store))
            .with_alpha(config.costs.ema_alpha)
            .with_initial_rate(config.costs.initial_success_rate);
        let library = ActionLibrary::new(Arc::new(statistics)).with_cost_model(config.cost_model());
        for (key, kind) in self.schema {
            library.declare_key(key, kind);
        }
        library
            .extend(self.actions)
            .context("registering actions")?;
        let library = Arc::new(library);

        let repository = PlanRepository::new(store);
        let index = Arc::new(
            PlanSimilarityIndex::with_repository(repository.clone())
                .context("loading plan signatures")?,
        );
        let reuse = Arc::new(ReuseTracker::new(config.reuse_policy()));

        let mut learning = PlanLearning::new(config.learning_config(), Arc::clone(&index), Arc::clone(&reuse))
            .with_repository(repository.clone());
        if let Some(path) = &config.learning.q_table_path {
            learning = learning
                .persist_q_table(path)
                .with_context(|| format!("loading q-table {}", path.display()))?;
        }
        let mut planner = Planner::new(Arc::clone(&library), config.search.clone());
        if config.reuse.enabled {
            planner = planner.with_reuse(Arc::clone(&index), Arc::clone(&reuse));
        }
        if let Some(telemetry) = &telemetry {
            learning = learning.with_telemetry(telemetry.scoped("learning"));
            planner = planner.with_telemetry(telemetry.scoped("planner"));
        }
        let learning = Arc::new(learning);
        let planner = Arc::new(planner);

        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(AgentRegistry::default()));
        let mut executor = PlanExecutor::new(Arc::clone(&planner), runner, config.execution.clone())
            .with_learning(Arc::clone(&learning));
        if let Some(parser) = self.parser {
            executor = executor.with_parser(parser);
        }
        if let Some(telemetry) = &telemetry {
            executor = executor.with_telemetry(telemetry.scoped("executor"));
        }

        let runtime = GoapRuntime {
            config,
            library,
            repository,
            index,
            reuse,
            learning,
            planner,
            executor,
            telemetry,
        };
        runtime.log(
            LogLevel::Info,
            "goap.runtime.ready",
            json!({
                "actions": runtime.library.len(),
                "indexed_plans": runtime.index.len(),
                "reuse_enabled": runtime.config.reuse.enabled,
            }),
        );
        Ok(runtime)
    }
}

fn configured_telemetry(config: &GoapConfig) -> Result<Option<Telemetry>> {
    let paths = &config.telemetry;
    if paths.log_path.is_none() && paths.event_log.is_none() {
        return Ok(None);
    }
    let mut builder = Telemetry::builder("goap");
    if let Some(path) = &paths.log_path {
        builder = builder.log_path(path);
    }
    if let Some(path) = &paths.event_log {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    builder.build().map(Some)
}

/// Planning engine facade: library, planner, executor, learning and
/// persistence wired from one [`GoapConfig`].
pub struct GoapRuntime {
    config: GoapConfig,
    library: Arc<ActionLibrary>,
    repository: PlanRepository,
    index: Arc<PlanSimilarityIndex>,
    reuse: Arc<ReuseTracker>,
    learning: Arc<PlanLearning>,
    planner: Arc<Planner>,
    executor: PlanExecutor,
    telemetry: Option<Telemetry>,
}

impl std::fmt::Debug for GoapRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoapRuntime")
            .field("library", &self.library)
            .field("executor", &self.executor)
            .field("indexed_plans", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl GoapRuntime {
    /// Starts a builder.
    #[must_use]
    pub fn builder(config: GoapConfig) -> GoapRuntimeBuilder {
        GoapRuntimeBuilder {
            config,
            actions: Vec::new(),
            schema: Vec::new(),
            store: None,
            runner: None,
            parser: None,
            telemetry: None,
        }
    }

    /// Configuration in force.
    #[must_use]
    pub const fn config(&self) -> &GoapConfig {
        &self.config
    }

    /// Action library.
    #[must_use]
    pub fn library(&self) -> Arc<ActionLibrary> {
        Arc::clone(&self.library)
    }

    /// Planner.
    #[must_use]
    pub fn planner(&self) -> Arc<Planner> {
        Arc::clone(&self.planner)
    }

    /// Learner.
    #[must_use]
    pub fn learning(&self) -> Arc<PlanLearning> {
        Arc::clone(&self.learning)
    }

    /// Similarity index.
    #[must_use]
    pub fn index(&self) -> Arc<PlanSimilarityIndex> {
        Arc::clone(&self.index)
    }

    /// Adaptive reuse threshold.
    #[must_use]
    pub fn reuse(&self) -> Arc<ReuseTracker> {
        Arc::clone(&self.reuse)
    }

    /// Plans from `state` to `goal` and stores the plan record.
    pub fn plan(
        &self,
        state: &WorldState,
        goal: &Goal,
        constraints: &PlanConstraints,
    ) -> Result<Plan, PlanningError> {
        let plan = self.planner.find_plan(state, goal, constraints)?;
        self.repository
            .save_plan(&PlanRecord::planned(&plan, state.clone()))
            .map_err(|err| PlanningError::storage(err, ErrorContext::new(goal, state)))?;
        Ok(plan)
    }

    /// Up to `count` pairwise distinct plans.
    pub fn alternatives(
        &self,
        state: &WorldState,
        goal: &Goal,
        count: usize,
        constraints: &PlanConstraints,
    ) -> Result<Vec<Plan>, PlanningError> {
        self.planner.find_alternatives(state, goal, count, constraints)
    }

    /// Executes a plan against `state`.
    pub async fn execute(
        &self,
        plan: Plan,
        state: WorldState,
    ) -> Result<ExecutionTrace, PlanningError> {
        self.executor.execute(plan, state).await
    }

    /// Executes a plan with explicit replan constraints and cancellation.
    pub async fn execute_with(
        &self,
        plan: Plan,
        state: WorldState,
        constraints: &PlanConstraints,
        cancel: &CancellationFlag,
    ) -> Result<ExecutionTrace, PlanningError> {
        self.executor
            .execute_with(plan, state, constraints, cancel)
            .await
    }

    /// Plans, then executes the plan.
    pub async fn plan_and_execute(
        &self,
        state: WorldState,
        goal: &Goal,
        constraints: &PlanConstraints,
    ) -> Result<ExecutionTrace, PlanningError> {
        let plan = self.plan(&state, goal, constraints)?;
        self.executor
            .execute_with(plan, state, constraints, &CancellationFlag::new())
            .await
    }

    /// Stored plan records matching `predicate`, newest first.
    pub fn stored_plans(
        &self,
        predicate: impl Fn(&PlanRecord) -> bool,
    ) -> Result<Vec<PlanRecord>, PlanningError> {
        self.repository
            .plans(predicate)
            .map_err(|err| PlanningError::storage(err, ErrorContext::default()))
    }

    /// One stored plan record.
    pub fn plan_record(&self, plan_id: &str) -> Result<Option<PlanRecord>, PlanningError> {
        self.repository
            .plan(plan_id)
            .map_err(|err| PlanningError::storage(err, ErrorContext::default()))
    }

    /// Library document with live statistics, ready to be saved.
    #[must_use]
    pub fn export_library(&self) -> LibraryDocument {
        let known = self.library.schema();
        let schema = known
            .keys()
            .filter_map(|key| Some((key.to_string(), known.kind_of(key)?)))
            .collect();
        LibraryDocument::from_library(&self.library, schema)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goap_actions::{ExecutionStatus, SimulatedRunner};
    use goap_memory::{FileRecordStore, PlanStatus};
    use goap_world::{Effect, GoalCondition};
    use shared_logging::MemoryLogger;
    use tempfile::tempdir;

    fn actions() -> Vec<Action> {
        vec![
            Action::builder("measure", "measurement")
                .effect(Effect::set("testsMeasured", true))
                .cost(1.0)
                .build(),
            Action::builder("increase-coverage", "testing")
                .precondition(GoalCondition::eq("testsMeasured", true))
                .effect(Effect::increase_by("coverage.line", 15.0))
                .cost(3.0)
                .build(),
        ]
    }

    fn start() -> WorldState {
        WorldState::new()
            .with("coverage.line", 40)
            .with("testsMeasured", false)
    }

    fn goal() -> Goal {
        Goal::new([GoalCondition::gte("coverage.line", 80.0)])
    }

    #[tokio::test]
    async fn plan_and_execute_persists_records() {
        let sink = Arc::new(MemoryLogger::new(64));
        let runtime = GoapRuntime::builder(GoapConfig::default())
            .actions(actions())
            .runner(Arc::new(SimulatedRunner::new()))
            .telemetry(Telemetry::builder("goap").sink(sink.clone()).build().unwrap())
            .build()
            .unwrap();
        let trace = runtime
            .plan_and_execute(start(), &goal(), &PlanConstraints::default())
            .await
            .unwrap();
        assert_eq!(trace.status, ExecutionStatus::Completed);

        let root = trace.root_plan_id().unwrap();
        let record = runtime.plan_record(root).unwrap().unwrap();
        assert_eq!(record.status, PlanStatus::Completed);
        assert_eq!(runtime.stored_plans(PlanRecord::succeeded).unwrap().len(), 1);
        assert!(runtime.index().contains(root));
        assert!(!sink.matching("goap.runtime.ready").is_empty());
        assert_eq!(sink.matching("goap.planner.search_completed")[0].module, "goap.planner");
    }

    #[tokio::test]
    async fn file_store_survives_restart_and_enables_reuse() {
        let dir = tempdir().unwrap();
        let build = || {
            GoapRuntime::builder(GoapConfig::default())
                .actions(actions())
                .runner(Arc::new(SimulatedRunner::new()))
                .store(Arc::new(FileRecordStore::open(dir.path()).unwrap()))
                .build()
                .unwrap()
        };
        let first = build();
        first
            .plan_and_execute(start(), &goal(), &PlanConstraints::default())
            .await
            .unwrap();
        let measured = first.library().stats("measure").unwrap().execution_count;
        drop(first);

        let second = build();
        assert_eq!(second.index().len(), 1);
        assert_eq!(second.library().stats("measure").unwrap().execution_count, measured);
        assert_eq!(measured, 1);
        let plan = second
            .plan(&start().with("coverage.line", 41), &goal(), &PlanConstraints::default())
            .unwrap();
        assert!(plan.is_reused());
    }

    #[tokio::test]
    async fn q_table_is_reloaded_from_the_configured_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q-table.json");
        let build = || {
            let mut config = GoapConfig::default();
            config.learning.q_table_path = Some(path.clone());
            GoapRuntime::builder(config)
                .actions(actions())
                .runner(Arc::new(SimulatedRunner::new()))
                .build()
                .unwrap()
        };
        let first = build();
        first
            .plan_and_execute(start(), &goal(), &PlanConstraints::default())
            .await
            .unwrap();
        let learned = first.learning().q_table().entries();
        assert!(!learned.is_empty());
        drop(first);

        let second = build();
        assert_eq!(second.learning().q_table().entries(), learned);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let mut config = GoapConfig::default();
        config.reuse.threshold = 0.0;
        assert!(GoapRuntime::builder(config).build().is_err());
    }

    #[test]
    fn exported_library_keeps_schema_and_actions() {
        let runtime = GoapRuntime::builder(GoapConfig::default())
            .actions(actions())
            .build()
            .unwrap();
        let document = runtime.export_library();
        assert_eq!(document.actions.len(), 2);
        assert_eq!(document.schema.get("coverage.line"), Some(&ValueKind::Number));
    }
}
