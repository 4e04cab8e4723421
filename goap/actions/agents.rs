use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use goap_world::{apply_effects, Effect, StateValue, WorldState};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    actions::{Action, ActionId},
    plan::PlanId,
};

/// Everything a capability needs to perform one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// Action being executed.
    pub action_id: ActionId,
    /// Capability (agent type) responsible for it.
    pub capability: String,
    /// Plan the action belongs to.
    pub plan_id: PlanId,
    /// Position in the run.
    pub step_index: usize,
    /// Live state observed before acting.
    pub state: WorldState,
    /// Effects the planner predicted.
    pub expected_effects: Vec<Effect>,
}

impl CapabilityRequest {
    /// Request for `action` from `state`.
    #[must_use]
    pub fn for_action(
        action: &Action,
        plan_id: impl Into<PlanId>,
        step_index: usize,
        state: WorldState,
    ) -> Self {
        Self {
            action_id: action.id.clone(),
            capability: action.capability.clone(),
            plan_id: plan_id.into(),
            step_index,
            state,
            expected_effects: action.effects.clone(),
        }
    }
}

/// Result reported by a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutcome {
    /// Whether the capability considers the action done.
    pub success: bool,
    /// Structured output, parsed for measurements.
    pub raw_output: Value,
    /// Time the capability spent.
    pub elapsed_ms: u64,
}

/// Capability failures. The executor treats every variant like a returned
/// failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// No runner handles the capability.
    #[error("no runner registered for capability `{0}`")]
    NotFound(String),
    /// Runner raised an error.
    #[error("capability `{capability}` failed: {reason}")]
    Failed {
        /// Capability name.
        capability: String,
        /// Failure reason.
        reason: String,
    },
    /// Runner exceeded its time budget.
    #[error("action `{action_id}` timed out after {timeout_ms}ms")]
    Timeout {
        /// Action that timed out.
        action_id: ActionId,
        /// Budget that was exceeded.
        timeout_ms: u64,
    },
}

/// External collaborator executing actions ("agent runner").
#[async_trait]
pub trait CapabilityRunner: Send + Sync {
    /// Human readable runner identifier.
    fn name(&self) -> &str;

    /// Performs the action and reports its outcome.
    async fn run(&self, request: CapabilityRequest) -> Result<CapabilityOutcome, CapabilityError>;
}

/// Dispatches requests to runners by capability name.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    runners: IndexMap<String, Arc<dyn CapabilityRunner>>,
    fallback: Option<Arc<dyn CapabilityRunner>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("capabilities", &self.runners.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.as_ref().map(|runner| runner.name()))
            .finish()
    }
}

impl AgentRegistry {
    /// Registry sending every capability to `runner`.
    #[must_use]
    pub fn with_fallback(runner: Arc<dyn CapabilityRunner>) -> Self {
        Self {
            runners: IndexMap::new(),
            fallback: Some(runner),
        }
    }

    /// Registers a runner for one capability.
    pub fn register(&mut self, capability: impl Into<String>, runner: Arc<dyn CapabilityRunner>) {
        self.runners.insert(capability.into(), runner);
    }

    /// Sets the runner used when no capability matches.
    pub fn set_fallback(&mut self, runner: Arc<dyn CapabilityRunner>) {
        self.fallback = Some(runner);
    }

    /// Resolves a runner, falling back when necessary.
    #[must_use]
    pub fn resolve(&self, capability: &str) -> Option<Arc<dyn CapabilityRunner>> {
        self.runners
            .get(capability)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    /// Registered capability names.
    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }
}

#[async_trait]
impl CapabilityRunner for AgentRegistry {
    fn name(&self) -> &str {
        "agent-registry"
    }

    async fn run(&self, request: CapabilityRequest) -> Result<CapabilityOutcome, CapabilityError> {
        let runner = self
            .resolve(&request.capability)
            .ok_or_else(|| CapabilityError::NotFound(request.capability.clone()))?;
        runner.run(request).await
    }
}

#[derive(Debug, Default)]
struct SimulationScript {
    failing: IndexSet<ActionId>,
    erroring: IndexSet<ActionId>,
    transient: IndexMap<ActionId, usize>,
    overrides: IndexMap<ActionId, Map<String, Value>>,
    calls: Vec<ActionId>,
}

/// Runner that predicts its own measurements by applying declared effects.
///
/// Used for dry runs and tests. Failures, errors, delays and measurement
/// drift can be scripted per action.
#[derive(Debug, Default)]
pub struct SimulatedRunner {
    script: Mutex<SimulationScript>,
    delay: Option<Duration>,
}

impl SimulatedRunner {
    /// Runner where every action succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps before answering each request.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The action always reports `success: false`.
    #[must_use]
    pub fn failing(self, action_id: impl Into<ActionId>) -> Self {
        self.script.lock().failing.insert(action_id.into());
        self
    }

    /// The action always raises a capability error.
    #[must_use]
    pub fn erroring(self, action_id: impl Into<ActionId>) -> Self {
        self.script.lock().erroring.insert(action_id.into());
        self
    }

    /// The action fails for its first `times` calls.
    #[must_use]
    pub fn failing_times(self, action_id: impl Into<ActionId>, times: usize) -> Self {
        self.script.lock().transient.insert(action_id.into(), times);
        self
    }

    /// Reports `value` for `key` whenever the action runs, overriding the
    /// predicted effect.
    #[must_use]
    pub fn measuring(
        self,
        action_id: impl Into<ActionId>,
        key: impl Into<String>,
        value: impl Into<StateValue>,
    ) -> Self {
        let value = serde_json::to_value(value.into()).unwrap_or(Value::Null);
        self.script
            .lock()
            .overrides
            .entry(action_id.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    /// Actions requested so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ActionId> {
        self.script.lock().calls.clone()
    }
}

#[async_trait]
impl CapabilityRunner for SimulatedRunner {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn run(&self, request: CapabilityRequest) -> Result<CapabilityOutcome, CapabilityError> {
        let started = Instant::now();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let (fail, error, overrides) = {
            let mut script = self.script.lock();
            script.calls.push(request.action_id.clone());
            let transient = script
                .transient
                .get_mut(&request.action_id)
                .filter(|remaining| **remaining > 0)
                .map(|remaining| *remaining -= 1)
                .is_some();
            (
                transient || script.failing.contains(&request.action_id),
                script.erroring.contains(&request.action_id),
                script.overrides.get(&request.action_id).cloned(),
            )
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if error {
            return Err(CapabilityError::Failed {
                capability: request.capability,
                reason: format!("simulated error for `{}`", request.action_id),
            });
        }
        if fail {
            return Ok(CapabilityOutcome {
                success: false,
                raw_output: json!({ "simulated": true, "error": "scripted failure" }),
                elapsed_ms,
            });
        }
        let predicted = apply_effects(&request.state, &request.expected_effects);
        let mut measurements: Map<String, Value> = request
            .expected_effects
            .iter()
            .filter_map(|effect| {
                let value = predicted.get(effect.key())?;
                Some((effect.key().to_string(), serde_json::to_value(value).ok()?))
            })
            .collect();
        if let Some(overrides) = overrides {
            measurements.extend(overrides);
        }
        Ok(CapabilityOutcome {
            success: true,
            raw_output: json!({ "simulated": true, "measurements": measurements }),
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionCategory;

    fn request(action: &Action) -> CapabilityRequest {
        CapabilityRequest::for_action(
            action,
            "plan-test",
            0,
            WorldState::new().with("coverage.line", 40),
        )
    }

    fn increase() -> Action {
        Action::builder("increase-coverage", ActionCategory::Test)
            .effect(Effect::increase_by("coverage.line", 15.0))
            .build()
    }

    #[tokio::test]
    async fn simulated_runner_reports_predicted_measurements() {
        let runner = SimulatedRunner::new();
        let outcome = runner.run(request(&increase())).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.raw_output["measurements"]["coverage.line"], 55.0);
        assert_eq!(runner.calls(), ["increase-coverage"]);
    }

    #[tokio::test]
    async fn scripted_failures_and_drift() {
        let runner = SimulatedRunner::new()
            .failing_times("increase-coverage", 1)
            .measuring("increase-coverage", "coverage.line", 47.0);
        let first = runner.run(request(&increase())).await.unwrap();
        assert!(!first.success);
        let second = runner.run(request(&increase())).await.unwrap();
        assert_eq!(second.raw_output["measurements"]["coverage.line"], 47.0);
    }

    #[tokio::test]
    async fn registry_dispatches_by_capability() {
        let mut registry = AgentRegistry::default();
        registry.register("test", Arc::new(SimulatedRunner::new()));
        assert!(registry.run(request(&increase())).await.is_ok());

        let scan = Action::builder("scan", ActionCategory::Security).build();
        assert_eq!(
            registry.run(request(&scan)).await,
            Err(CapabilityError::NotFound("security".into()))
        );

        let fallback = AgentRegistry::with_fallback(Arc::new(SimulatedRunner::new().erroring("scan")));
        assert!(matches!(
            fallback.run(request(&scan)).await,
            Err(CapabilityError::Failed { .. })
        ));
    }
}
