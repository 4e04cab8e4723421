use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use goap_actions::{
    Action, ActionLibrary, CapabilityError, CapabilityOutcome, CapabilityRequest,
    CapabilityRunner, ExecutionFailure, ExecutionStatus, ExecutionStep, ExecutionTrace,
    ExecutorPhase, Plan, PlanConstraints,
};
use goap_learning::PlanLearning;
use goap_world::{Goal, WorldState};
use serde_json::{json, Value};
use shared_logging::{LogLevel, Telemetry};
use tokio::runtime::{Handle, RuntimeFlavor};
use uuid::Uuid;

use crate::{
    config::ExecutionConfig,
    error::{ErrorContext, PlanningError},
    search::Planner,
};

/// Cooperative cancellation.
pub mod cancel;
/// Parsing measurements out of capability output.
pub mod measurement;

pub use cancel::CancellationFlag;
pub use measurement::{JsonMeasurements, MeasurementParser};

/// One plan on the execution-context stack.
#[derive(Debug)]
struct Frame {
    plan: Plan,
    cursor: usize,
}

impl Frame {
    const fn new(plan: Plan) -> Self {
        Self { plan, cursor: 0 }
    }
}

enum Ending {
    Completed,
    Canceled,
    Failed(ExecutionFailure),
}

/// Step failure: reason plus whatever the capability returned.
type StepError = (String, Option<Value>);

/// Drives plans against live capabilities: observe preconditions, act
/// through the runner, fold measurements into live state, and replan
/// (bounded) when a step fails or the plan ends short of the goal.
///
/// Each call owns its live state; runs share only the library statistics,
/// the similarity index and the learner.
pub struct PlanExecutor {
    library: Arc<ActionLibrary>,
    planner: Arc<Planner>,
    runner: Arc<dyn CapabilityRunner>,
    parser: Arc<dyn MeasurementParser>,
    learning: Option<Arc<PlanLearning>>,
    config: ExecutionConfig,
    telemetry: Option<Telemetry>,
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("runner", &self.runner.name())
            .field("config", &self.config)
            .field("learning", &self.learning.is_some())
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Executor replanning through `planner` and acting through `runner`.
    #[must_use]
    pub fn new(
        planner: Arc<Planner>,
        runner: Arc<dyn CapabilityRunner>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            library: planner.library(),
            planner,
            runner,
            parser: Arc::new(JsonMeasurements::default()),
            learning: None,
            config,
            telemetry: None,
        }
    }

    /// Replaces the measurement parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn MeasurementParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Hands every finished trace to `learning`.
    #[must_use]
    pub fn with_learning(mut self, learning: Arc<PlanLearning>) -> Self {
        self.learning = Some(learning);
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Executor settings.
    #[must_use]
    pub const fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Executes `plan` from `live_state` with default constraints.
    pub async fn execute(
        &self,
        plan: Plan,
        live_state: WorldState,
    ) -> Result<ExecutionTrace, PlanningError> {
        self.execute_with(plan, live_state, &PlanConstraints::default(), &CancellationFlag::new())
            .await
    }

    /// Executes `plan`; replans honour `constraints` and `cancel` is checked
    /// between steps.
    ///
    /// Completed and canceled runs return their trace. A run that fails after
    /// spending its replan budget returns [`PlanningError::ActionExecution`]
    /// carrying the partial trace. Either way the trace reaches learning.
    pub async fn execute_with(
        &self,
        plan: Plan,
        live_state: WorldState,
        constraints: &PlanConstraints,
        cancel: &CancellationFlag,
    ) -> Result<ExecutionTrace, PlanningError> {
        let goal = plan.goal.clone();
        let now = Utc::now();
        let mut trace = ExecutionTrace {
            run_id: format!("run-{}", Uuid::new_v4()),
            goal: goal.clone(),
            initial_state: live_state.clone(),
            final_state: live_state.clone(),
            plan_ids: vec![plan.id.clone()],
            reused_from: plan.reused_from.clone(),
            steps: Vec::new(),
            phases: vec![ExecutorPhase::Pending],
            replans: 0,
            status: ExecutionStatus::Failed,
            failure: None,
            total_cost: 0.0,
            started_at: now,
            finished_at: now,
        };
        self.log(
            LogLevel::Info,
            "goap.executor.started",
            json!({ "run_id": trace.run_id, "plan_id": plan.id, "steps": plan.len() }),
        );
        self.transition(&mut trace, ExecutorPhase::Executing);

        let mut live = live_state;
        let mut replan_constraints = constraints.clone().without_reuse();
        let mut frames = vec![Frame::new(plan)];
        let ending = loop {
            if cancel.is_cancelled() {
                break Ending::Canceled;
            }
            let Some(frame) = frames.last_mut() else {
                break Ending::Failed(failure(&trace, None, "execution stack empty"));
            };
            if goal.is_satisfied(&live) {
                for action_id in &frame.plan.action_ids[frame.cursor..] {
                    let index = trace.steps.len();
                    trace.steps.push(ExecutionStep::skipped(
                        index,
                        action_id.clone(),
                        frame.plan.id.clone(),
                        live.clone(),
                    ));
                }
                break Ending::Completed;
            }
            let Some(action_id) = frame.plan.action_ids.get(frame.cursor).cloned() else {
                match self.replan(&mut trace, &goal, &live, &mut replan_constraints, None, "plan ended with goal unmet") {
                    Ok(next) => frames.push(Frame::new(next)),
                    Err(failure) => break Ending::Failed(failure),
                }
                continue;
            };
            frame.cursor += 1;
            let plan_id = frame.plan.id.clone();
            match self.step(&mut trace, &action_id, &plan_id, &live).await {
                Ok(after) => live = after,
                Err(reason) => {
                    match self.replan(&mut trace, &goal, &live, &mut replan_constraints, Some(&action_id), &reason) {
                        Ok(next) => frames.push(Frame::new(next)),
                        Err(failure) => break Ending::Failed(failure),
                    }
                }
            }
        };

        trace.final_state = live;
        trace.finished_at = Utc::now();
        let result = match ending {
            Ending::Completed => {
                trace.status = ExecutionStatus::Completed;
                self.transition(&mut trace, ExecutorPhase::Completed);
                None
            }
            Ending::Canceled => {
                trace.status = ExecutionStatus::Canceled;
                let last = trace.steps.last().map(|step| step.action_id.clone());
                trace.failure = Some(failure(&trace, last, "canceled"));
                self.transition(&mut trace, ExecutorPhase::Canceled);
                None
            }
            Ending::Failed(failure) => {
                trace.status = ExecutionStatus::Failed;
                trace.failure = Some(failure.clone());
                self.transition(&mut trace, ExecutorPhase::Failed);
                Some(failure)
            }
        };
        self.log(
            LogLevel::Info,
            "goap.executor.finished",
            json!({
                "run_id": trace.run_id,
                "status": trace.status,
                "steps": trace.steps.len(),
                "replans": trace.replans,
                "total_cost": trace.total_cost,
            }),
        );
        self.event(
            "goap.executor.finished",
            json!({ "run_id": trace.run_id, "status": trace.status, "plan_ids": trace.plan_ids }),
        );
        self.learn(&trace);

        match result {
            None => Ok(trace),
            Some(failure) => Err(PlanningError::ActionExecution {
                reason: failure.reason,
                context: ErrorContext::new(&trace.goal, &trace.initial_state)
                    .with_action(failure.action_id, failure.executed_steps),
                trace: Box::new(trace),
            }),
        }
    }

    /// Observe and act for one action. Returns the new live state.
    async fn step(
        &self,
        trace: &mut ExecutionTrace,
        action_id: &str,
        plan_id: &str,
        live: &WorldState,
    ) -> Result<WorldState, String> {
        let index = trace.steps.len();
        let step = ExecutionStep::started(index, action_id, plan_id, live.clone());
        let Some(action) = self.library.get(action_id) else {
            let reason = format!("unknown action `{action_id}`");
            trace.steps.push(step.fail(reason.clone(), None));
            return Err(reason);
        };

        let unmet: Vec<String> = action
            .unmet_preconditions(live)
            .map(ToString::to_string)
            .collect();
        if !unmet.is_empty() {
            let reason = format!("preconditions no longer hold: {}", unmet.join(", "));
            self.step_failed(trace, step, action_id, (reason.clone(), None));
            return Err(reason);
        }

        let cost = self.library.effective_cost(action_id).unwrap_or(action.cost);
        match self.act(&action, plan_id, index, live).await {
            Ok(outcome) => {
                let measured = self.parser.parse(&outcome.raw_output);
                let after = action.apply(live).overlay(&measured);
                self.record_outcome(action_id, true);
                trace.total_cost += cost;
                trace
                    .steps
                    .push(step.complete(after.clone(), outcome.raw_output, outcome.elapsed_ms));
                self.event(
                    "goap.executor.step_completed",
                    json!({
                        "run_id": trace.run_id,
                        "action_id": action_id,
                        "index": index,
                        "measured": measured.to_json(),
                    }),
                );
                Ok(after)
            }
            Err(failure) => {
                let reason = failure.0.clone();
                self.step_failed(trace, step, action_id, failure);
                Err(reason)
            }
        }
    }

    async fn act(
        &self,
        action: &Action,
        plan_id: &str,
        index: usize,
        live: &WorldState,
    ) -> Result<CapabilityOutcome, StepError> {
        let request = CapabilityRequest::for_action(action, plan_id, index, live.clone());
        let limit = self.step_timeout(action);
        match tokio::time::timeout(limit, self.runner.run(request)).await {
            Ok(Ok(outcome)) if outcome.success => Ok(outcome),
            Ok(Ok(outcome)) => Err((
                format!("capability `{}` reported failure", action.capability),
                Some(outcome.raw_output),
            )),
            Ok(Err(err)) => Err((err.to_string(), None)),
            Err(_) => Err((
                CapabilityError::Timeout {
                    action_id: action.id.clone(),
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }
                .to_string(),
                None,
            )),
        }
    }

    fn step_failed(
        &self,
        trace: &mut ExecutionTrace,
        step: ExecutionStep,
        action_id: &str,
        (reason, raw_output): StepError,
    ) {
        self.record_outcome(action_id, false);
        self.log(
            LogLevel::Warn,
            "goap.executor.step_failed",
            json!({ "run_id": trace.run_id, "action_id": action_id, "reason": reason }),
        );
        self.event(
            "goap.executor.step_failed",
            json!({ "run_id": trace.run_id, "action_id": action_id, "index": step.index, "reason": reason }),
        );
        trace.steps.push(step.fail(reason, raw_output));
    }

    /// Orient and decide: plan again for what is still unmet, excluding the
    /// action that just failed.
    fn replan(
        &self,
        trace: &mut ExecutionTrace,
        goal: &Goal,
        live: &WorldState,
        constraints: &mut PlanConstraints,
        failed_action: Option<&str>,
        reason: &str,
    ) -> Result<Plan, ExecutionFailure> {
        let failed = failed_action.map(str::to_string);
        if trace.replans >= self.config.max_replans {
            return Err(failure(
                trace,
                failed,
                &format!("{reason}; replan budget of {} exhausted", self.config.max_replans),
            ));
        }
        trace.replans += 1;
        self.transition(trace, ExecutorPhase::Replanning);
        if let Some(action_id) = &failed {
            constraints.excluded_action_ids.insert(action_id.clone());
        }
        let remaining = goal.remaining(live);
        let searched = off_reactor(|| self.planner.find_plan(live, &remaining, constraints));
        match searched {
            Ok(plan) => {
                self.log(
                    LogLevel::Info,
                    "goap.executor.replan",
                    json!({
                        "run_id": trace.run_id,
                        "attempt": trace.replans,
                        "reason": reason,
                        "plan_id": plan.id,
                        "actions": plan.action_ids,
                    }),
                );
                self.event(
                    "goap.executor.replan",
                    json!({ "run_id": trace.run_id, "attempt": trace.replans, "plan_id": plan.id }),
                );
                trace.plan_ids.push(plan.id.clone());
                self.transition(trace, ExecutorPhase::Executing);
                Ok(plan)
            }
            Err(err) => Err(failure(trace, failed, &format!("{reason}; replanning failed: {err}"))),
        }
    }

    fn step_timeout(&self, action: &Action) -> Duration {
        let cap = self.config.step_timeout_ms;
        let millis = action
            .duration_ms
            .filter(|estimate| *estimate > 0)
            .map_or(cap, |estimate| estimate.saturating_mul(2).min(cap));
        Duration::from_millis(millis)
    }

    fn record_outcome(&self, action_id: &str, success: bool) {
        if let Err(err) = self.library.record_outcome(action_id, success) {
            self.log(
                LogLevel::Warn,
                "goap.executor.statistics_failed",
                json!({ "action_id": action_id, "error": err.to_string() }),
            );
        }
    }

    fn learn(&self, trace: &ExecutionTrace) {
        let Some(learning) = &self.learning else {
            return;
        };
        if let Err(err) = learning.learn_from_execution(trace) {
            self.log(
                LogLevel::Error,
                "goap.executor.learning_failed",
                json!({ "run_id": trace.run_id, "error": err.to_string() }),
            );
        }
    }

    fn transition(&self, trace: &mut ExecutionTrace, phase: ExecutorPhase) {
        trace.phases.push(phase);
        self.event(
            "goap.executor.phase",
            json!({ "run_id": trace.run_id, "phase": phase }),
        );
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

/// Runs CPU-bound search without stalling other tasks on a multi-threaded
/// runtime. Current-thread runtimes cannot hand off their worker, so the
/// search runs inline there.
fn off_reactor<T>(search: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(search)
        }
        _ => search(),
    }
}

fn failure(trace: &ExecutionTrace, action_id: Option<String>, reason: &str) -> ExecutionFailure {
    ExecutionFailure {
        action_id,
        reason: reason.to_string(),
        executed_steps: trace.completed_steps().count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use goap_actions::{SimulatedRunner, StepStatus};
    use goap_learning::{LearningConfig, PlanSimilarityIndex, ReuseTracker};
    use goap_world::{Effect, GoalCondition};
    use shared_event_bus::MemoryEventBus;

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

    fn executor(runner: SimulatedRunner, config: ExecutionConfig) -> (PlanExecutor, Arc<Planner>) {
        let planner = Arc::new(Planner::new(library(), SearchConfig::default()));
        (
            PlanExecutor::new(Arc::clone(&planner), Arc::new(runner), config),
            planner,
        )
    }

    fn plan_for(planner: &Planner, state: &WorldState) -> Plan {
        planner
            .find_plan(state, &goal(), &PlanConstraints::default())
            .unwrap()
    }

    #[tokio::test]
    async fn executes_plan_and_records_statistics() {
        let (executor, planner) = executor(SimulatedRunner::new(), ExecutionConfig::default());
        let plan = plan_for(&planner, &start());
        let trace = executor.execute(plan, start()).await.unwrap();
        assert_eq!(trace.status, ExecutionStatus::Completed);
        assert_eq!(trace.completed_steps().count(), 4);
        assert_eq!(trace.final_state.number("coverage.line"), Some(85.0));
        assert!((trace.total_cost - 10.0).abs() < 1e-9);
        assert_eq!(trace.replans, 0);
        assert_eq!(
            trace.phases,
            [ExecutorPhase::Pending, ExecutorPhase::Executing, ExecutorPhase::Completed]
        );
        let stats = planner.library().stats("increase-coverage").unwrap();
        assert_eq!(stats.execution_count, 3);
    }

    #[tokio::test]
    async fn measurements_override_predictions_and_finish_early() {
        let runner = SimulatedRunner::new().measuring("increase-coverage", "coverage.line", 95.0);
        let (executor, planner) = executor(runner, ExecutionConfig::default());
        let plan = plan_for(&planner, &start());
        let trace = executor.execute(plan, start()).await.unwrap();
        let statuses: Vec<StepStatus> = trace.steps.iter().map(|step| step.status).collect();
        assert_eq!(
            statuses,
            [
                StepStatus::Completed,
                StepStatus::Completed,
                StepStatus::Skipped,
                StepStatus::Skipped
            ]
        );
        assert_eq!(trace.final_state.number("coverage.line"), Some(95.0));
    }

    #[tokio::test]
    async fn precondition_drift_triggers_one_replan() {
        let (executor, planner) = executor(SimulatedRunner::new(), ExecutionConfig::default());
        let measured = start().with("testsMeasured", true);
        let plan = plan_for(&planner, &measured);
        assert_eq!(plan.action_ids[0], "increase-coverage");

        let trace = executor.execute(plan, start()).await.unwrap();
        assert_eq!(trace.status, ExecutionStatus::Completed);
        assert_eq!(trace.replans, 1);
        assert_eq!(trace.plan_ids.len(), 2);
        assert_eq!(trace.steps[0].status, StepStatus::Failed);
        assert!(trace.steps[0].error.as_deref().unwrap().contains("testsMeasured"));
        assert_eq!(
            trace.executed_action_ids(),
            ["measure", "generate-tests", "generate-tests"]
        );
        assert!(planner.library().stats("increase-coverage").unwrap().success_rate < 1.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replanning_hands_off_the_worker_on_multi_thread_runtimes() {
        let (executor, planner) = executor(SimulatedRunner::new(), ExecutionConfig::default());
        let executor = Arc::new(executor);
        let measured = start().with("testsMeasured", true);
        let runs: Vec<_> = (0..4)
            .map(|_| {
                let executor = Arc::clone(&executor);
                let plan = plan_for(&planner, &measured);
                tokio::spawn(async move { executor.execute(plan, start()).await })
            })
            .collect();
        for run in runs {
            let trace = run.await.unwrap().unwrap();
            assert_eq!(trace.replans, 1);
            assert_eq!(
                trace.executed_action_ids(),
                ["measure", "generate-tests", "generate-tests"]
            );
        }
    }

    #[test]
    fn search_runs_inline_outside_a_runtime() {
        assert!(Handle::try_current().is_err());
        assert_eq!(off_reactor(|| 7), 7);
    }

    #[tokio::test]
    async fn exhausted_replans_surface_action_execution_error() {
        let runner = SimulatedRunner::new()
            .failing("increase-coverage")
            .erroring("generate-tests");
        let (executor, planner) = executor(runner, ExecutionConfig::default());
        let plan = plan_for(&planner, &start());
        let err = executor.execute(plan, start()).await.unwrap_err();
        let PlanningError::ActionExecution { trace, context, .. } = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(trace.status, ExecutionStatus::Failed);
        assert_eq!(trace.replans, 2);
        assert_eq!(context.last_action_id.as_deref(), Some("generate-tests"));
        assert_eq!(context.executed_steps, 1);
        assert_eq!(trace.phases.last(), Some(&ExecutorPhase::Failed));
    }

    #[tokio::test]
    async fn zero_replan_budget_fails_on_first_error() {
        let config = ExecutionConfig {
            max_replans: 0,
            ..ExecutionConfig::default()
        };
        let (executor, planner) = executor(SimulatedRunner::new().failing("measure"), config);
        let plan = plan_for(&planner, &start());
        let err = executor.execute(plan, start()).await.unwrap_err();
        let trace = err.trace().unwrap();
        assert_eq!(trace.replans, 0);
        assert_eq!(trace.steps.len(), 1);
        assert!(err.to_string().contains("replan budget of 0 exhausted"));
    }

    #[tokio::test]
    async fn slow_capabilities_time_out() {
        let config = ExecutionConfig {
            max_replans: 0,
            step_timeout_ms: 10,
        };
        let runner = SimulatedRunner::new().with_delay(Duration::from_millis(200));
        let (executor, planner) = executor(runner, config);
        let plan = plan_for(&planner, &start());
        let err = executor.execute(plan, start()).await.unwrap_err();
        let step = &err.trace().unwrap().steps[0];
        assert!(step.error.as_deref().unwrap().contains("timed out after 10ms"));
    }

    #[tokio::test]
    async fn cancellation_is_honoured_between_steps() {
        let (executor, planner) = executor(SimulatedRunner::new(), ExecutionConfig::default());
        let plan = plan_for(&planner, &start());
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let trace = executor
            .execute_with(plan, start(), &PlanConstraints::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(trace.status, ExecutionStatus::Canceled);
        assert!(trace.steps.is_empty());
        assert_eq!(trace.final_state, start());
    }

    #[tokio::test]
    async fn successful_runs_feed_learning() {
        let index = Arc::new(PlanSimilarityIndex::new());
        let learning = Arc::new(PlanLearning::new(
            LearningConfig::default(),
            Arc::clone(&index),
            Arc::new(ReuseTracker::default()),
        ));
        let bus = Arc::new(MemoryEventBus::new(64));
        let telemetry = Telemetry::builder("goap.executor")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let (executor, planner) = executor(SimulatedRunner::new(), ExecutionConfig::default());
        let executor = executor.with_learning(learning).with_telemetry(telemetry);
        let plan = plan_for(&planner, &start());
        let plan_id = plan.id.clone();
        executor.execute(plan, start()).await.unwrap();
        assert!(index.contains(&plan_id));

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.events_within("goap.executor.step_completed").len(), 4);
    }
}
