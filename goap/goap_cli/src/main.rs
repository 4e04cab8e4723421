use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use goap_actions::{ExecutionTrace, LibraryDocument, PlanConstraints, SimulatedRunner};
use goap_memory::{FileRecordStore, PlanRecord, PlanStatus};
use goap_planning::{GoapConfig, GoapRuntime, PlanningError};
use goap_world::{Goal, WorldState};
use serde_json::{json, Value};
use shared_event_bus::{EventRecord, FileEventPublisher};
use tokio::runtime::Runtime;
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "goap", version, about = "Goal-oriented action planner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Plans the goal from the given state.
    Plan(RequestArgs),
    /// Lists distinct plans for the goal, cheapest first.
    Alternatives {
        #[command(flatten)]
        request: RequestArgs,
        /// Number of plans wanted.
        #[arg(long, default_value_t = 3)]
        count: usize,
    },
    /// Plans, then executes with the simulated runner.
    Execute {
        #[command(flatten)]
        request: RequestArgs,
        /// Action the simulated runner should fail (repeatable).
        #[arg(long = "fail")]
        failing: Vec<String>,
    },
    /// Lists stored plan records, newest first.
    Plans {
        #[command(flatten)]
        engine: EngineArgs,
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Only records with this status (planned, completed, failed, canceled).
        #[arg(long)]
        status: Option<String>,
    },
    /// Lists the most recent entries of the event log, oldest first.
    Events {
        /// Engine configuration naming the event log.
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSON-lines event file, overriding the configuration.
        #[arg(long)]
        event_log: Option<PathBuf>,
        /// Only events under this dotted prefix, e.g. `goap.executor`.
        #[arg(long)]
        prefix: Option<String>,
        /// Number of entries to display.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Engine configuration (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Action library document (TOML or JSON).
    #[arg(long)]
    library: Option<PathBuf>,
    /// Directory persisting statistics, plans and signatures.
    #[arg(long)]
    store: Option<PathBuf>,
    /// JSON-lines log file, overriding the configuration.
    #[arg(long)]
    log_path: Option<PathBuf>,
    /// JSON-lines event file, overriding the configuration.
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Writes the library back with learned statistics after the command.
    #[arg(long)]
    save_library: bool,
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[command(flatten)]
    engine: EngineArgs,
    /// Initial state: inline JSON object or a path to one.
    #[arg(long)]
    state: String,
    /// Goal: inline JSON object or a path to one.
    #[arg(long)]
    goal: String,
    /// Allowed action category (repeatable).
    #[arg(long = "category")]
    categories: Vec<String>,
    /// Excluded action id (repeatable).
    #[arg(long = "exclude")]
    excluded: Vec<String>,
    /// Skips plan reuse and always searches.
    #[arg(long)]
    no_reuse: bool,
    #[arg(long)]
    max_iterations: Option<usize>,
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl RequestArgs {
    fn constraints(&self) -> PlanConstraints {
        let mut constraints = PlanConstraints::default();
        if !self.categories.is_empty() {
            constraints = constraints.allow_categories(self.categories.iter().map(String::as_str));
        }
        for action_id in &self.excluded {
            constraints = constraints.excluding(action_id.as_str());
        }
        if self.no_reuse {
            constraints = constraints.without_reuse();
        }
        if let Some(max_iterations) = self.max_iterations {
            constraints = constraints.with_max_iterations(max_iterations);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            constraints = constraints.with_timeout_ms(timeout_ms);
        }
        constraints
    }

    fn request(&self) -> Result<(WorldState, Goal)> {
        let state = read_json(&self.state).context("reading state")?;
        anyhow::ensure!(state.is_object(), "state must be a JSON object");
        let goal = Goal::from_json(&read_json(&self.goal).context("reading goal")?)?;
        Ok((WorldState::from_json(&state), goal))
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Plan(request) => {
            let runtime = open(&request.engine, SimulatedRunner::new())?;
            let (state, goal) = request.request()?;
            let plan = runtime.plan(&state, &goal, &request.constraints())?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            finish(&runtime, &request.engine)
        }
        Commands::Alternatives { request, count } => {
            let runtime = open(&request.engine, SimulatedRunner::new())?;
            let (state, goal) = request.request()?;
            let plans = runtime.alternatives(&state, &goal, count, &request.constraints())?;
            println!("{}", serde_json::to_string_pretty(&plans)?);
            Ok(())
        }
        Commands::Execute { request, failing } => {
            let runner = failing
                .iter()
                .fold(SimulatedRunner::new(), |runner, action_id| runner.failing(action_id.as_str()));
            let runtime = open(&request.engine, runner)?;
            let (state, goal) = request.request()?;
            let executor = Runtime::new()?;
            let result = executor.block_on(runtime.plan_and_execute(state, &goal, &request.constraints()));
            finish(&runtime, &request.engine)?;
            match result {
                Ok(trace) => {
                    println!("{}", serde_json::to_string_pretty(&summary(&trace))?);
                    Ok(())
                }
                Err(PlanningError::ActionExecution { reason, trace, .. }) => {
                    println!("{}", serde_json::to_string_pretty(&summary(&trace))?);
                    bail!("execution failed: {reason}")
                }
                Err(err) => Err(err.into()),
            }
        }
        Commands::Plans {
            engine,
            limit,
            status,
        } => {
            let runtime = open(&engine, SimulatedRunner::new())?;
            let status = status.as_deref().map(parse_status).transpose()?;
            let records = runtime
                .stored_plans(|record| status.map_or(true, |wanted| record.status == wanted))?;
            for record in records.into_iter().take(limit) {
                println!("{}", describe(&record));
            }
            Ok(())
        }
        Commands::Events {
            config,
            event_log,
            prefix,
            limit,
        } => {
            let path = match event_log {
                Some(path) => path,
                None => {
                    let config = match &config {
                        Some(path) => GoapConfig::load(path)?,
                        None => GoapConfig::default(),
                    };
                    let Some(path) = config.telemetry.event_log else {
                        bail!("no event log configured; pass --event-log or set telemetry.event_log");
                    };
                    path
                }
            };
            for event in recent_events(&path, prefix.as_deref(), limit)? {
                println!("{}", describe_event(&event));
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn open(args: &EngineArgs, runner: SimulatedRunner) -> Result<GoapRuntime> {
    let mut config = match &args.config {
        Some(path) => GoapConfig::load(path)?,
        None => GoapConfig::default(),
    };
    if let Some(path) = &args.log_path {
        config.telemetry.log_path = Some(path.clone());
    }
    if let Some(path) = &args.event_log {
        config.telemetry.event_log = Some(path.clone());
    }
    let mut builder = GoapRuntime::builder(config).runner(Arc::new(runner));
    if let Some(path) = &args.library {
        let document = LibraryDocument::load(path)
            .with_context(|| format!("loading action library {}", path.display()))?;
        debug!(actions = document.actions.len(), "loaded action library");
        builder = builder.document(document);
    }
    if let Some(dir) = &args.store {
        builder = builder.store(Arc::new(FileRecordStore::open(dir)?));
    }
    builder.build()
}

fn finish(runtime: &GoapRuntime, args: &EngineArgs) -> Result<()> {
    if !args.save_library {
        return Ok(());
    }
    let Some(path) = &args.library else {
        bail!("--save-library needs --library");
    };
    runtime
        .export_library()
        .save(path)
        .with_context(|| format!("saving action library {}", path.display()))
}

fn read_json(input: &str) -> Result<Value> {
    let trimmed = input.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("parsing inline JSON");
    }
    let raw = fs::read_to_string(input).with_context(|| format!("reading {input}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {input}"))
}

fn parse_status(raw: &str) -> Result<PlanStatus> {
    serde_json::from_value(Value::String(raw.to_ascii_lowercase()))
        .with_context(|| format!("unknown plan status `{raw}`"))
}

fn summary(trace: &ExecutionTrace) -> Value {
    json!({
        "run_id": trace.run_id,
        "status": trace.status,
        "plan_ids": trace.plan_ids,
        "executed": trace.executed_action_ids(),
        "replans": trace.replans,
        "total_cost": trace.total_cost,
        "duration_ms": trace.duration_ms(),
        "failure": trace.failure,
        "final_state": trace.final_state.to_json(),
    })
}

fn recent_events(path: &Path, prefix: Option<&str>, limit: usize) -> Result<Vec<EventRecord>> {
    let mut events = FileEventPublisher::new(path)?.replay()?;
    if let Some(prefix) = prefix {
        events.retain(|event| event.is_within(prefix));
    }
    let skip = events.len().saturating_sub(limit);
    Ok(events.split_off(skip))
}

fn describe_event(event: &EventRecord) -> String {
    format!(
        "{} | {} | {} | {}",
        event.timestamp, event.event_type, event.source, event.payload
    )
}

fn describe(record: &PlanRecord) -> String {
    let status = serde_json::to_value(record.status)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    format!(
        "{} | {} | {:.2} | {} | {:?}",
        record.plan_id,
        status,
        record.total_cost,
        record.updated_at.format("%Y-%m-%d %H:%M:%S"),
        record.action_ids
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use goap_actions::ActionCategory;

    fn request(extra: &[&str]) -> RequestArgs {
        let mut argv = vec![
            "goap",
            "plan",
            "--state",
            r#"{"coverage": {"line": 40}, "testsMeasured": false}"#,
            "--goal",
            r#"{"coverage.line": {"gte": 80}}"#,
        ];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Plan(request) => request,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn inline_request_parses_into_state_and_goal() {
        let (state, goal) = request(&[]).request().unwrap();
        assert_eq!(state.number("coverage.line"), Some(40.0));
        assert_eq!(goal.len(), 1);
        assert!(!goal.is_satisfied(&state));
    }

    #[test]
    fn flags_become_constraints() {
        let constraints = request(&[
            "--category",
            "testing",
            "--exclude",
            "generate-tests",
            "--no-reuse",
            "--timeout-ms",
            "250",
        ])
        .constraints();
        assert!(!constraints.allow_reuse);
        assert_eq!(constraints.timeout_ms, Some(250));
        assert!(constraints.excluded_action_ids.contains("generate-tests"));
        let allowed = constraints.allowed_categories.unwrap();
        assert!(allowed.contains(&ActionCategory::Test));
    }

    #[test]
    fn reads_request_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("goal.json");
        fs::write(&path, r#"{"deployed": true}"#).unwrap();
        let value = read_json(path.to_str().unwrap()).unwrap();
        assert_eq!(value, json!({ "deployed": true }));
        assert!(read_json("missing.json").is_err());
    }

    #[test]
    fn event_listing_filters_by_prefix_and_keeps_the_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let lines: Vec<String> = [
            "goap.planner.search_completed",
            "goap.executor.replan",
            "goap.executor.step_failed",
            "goap.executorx.other",
            "goap.executor.finished",
        ]
        .iter()
        .enumerate()
        .map(|(i, event_type)| {
            serde_json::to_string(&EventRecord {
                id: format!("event-{i}"),
                source: "goap".into(),
                event_type: (*event_type).into(),
                timestamp: format!("2026-10-17T00:00:0{i}Z"),
                payload: json!({ "attempt": i }),
            })
            .unwrap()
        })
        .collect();
        fs::write(&path, lines.join("\n")).unwrap();

        let executor = recent_events(&path, Some("goap.executor"), 2).unwrap();
        let ids: Vec<&str> = executor.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, ["event-2", "event-4"]);
        assert_eq!(recent_events(&path, None, 10).unwrap().len(), 5);
        assert!(recent_events(&dir.path().join("missing.jsonl"), None, 10)
            .unwrap()
            .is_empty());
        assert!(describe_event(&executor[0]).contains("goap.executor.step_failed"));
    }

    #[test]
    fn status_filter_accepts_known_labels() {
        assert_eq!(parse_status("Completed").unwrap(), PlanStatus::Completed);
        assert!(parse_status("finished").is_err());
    }
}
