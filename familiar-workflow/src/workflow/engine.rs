//! Workflow execution.
//!
//! A run proceeds in rounds. Each round launches every ready step (all of its
//! dependencies completed, skipped or condition-skipped) concurrently and
//! waits for all of them before looking at the graph again.

use familiar_common::{Config, EventBus, WorkflowConfig};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::condition::{evaluate, Scope};
use super::definition::{OnError, Step, StepKind, WorkflowDefinition};
use super::task::{interpolate, run_task};
use crate::hands::{execute_hand, HandRegistry, HandRunner, HandStatus, RunOptions};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub project_root: PathBuf,
    pub default_timeout: Duration,
    pub task_timeout: Duration,
    pub max_output_chars: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            default_timeout: Duration::from_secs(7200),
            task_timeout: Duration::from_secs(300),
            max_output_chars: 500,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            project_root: config.project_root.clone(),
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            max_output_chars: config.max_output_chars,
        }
    }
}

/// Final state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Completed,
    /// Failed and aborted the workflow.
    Failed,
    Skipped,
    ConditionSkipped,
    NotReached,
    /// Still in flight when the workflow timed out.
    Pending,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::ConditionSkipped => "condition-skipped",
            Self::NotReached => "not-reached",
            Self::Pending => "pending",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<&'static str>,
    #[serde(skip_serializing_if = "is_zero")]
    pub attempts: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub run_id: String,
    pub workflow: String,
    pub ok: bool,
    pub dry_run: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepSummary>,
    pub context: Map<String, Value>,
}

impl WorkflowSummary {
    pub fn step(&self, id: &str) -> Option<&StepSummary> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn status(&self, id: &str) -> Option<StepStatus> {
        self.step(id).map(|s| s.status)
    }
}

/// What one step produced.
struct StepOutcome {
    id: String,
    result: Result<Value, String>,
    /// Extra fields for the step's entry in the results map.
    detail: Map<String, Value>,
    branch: Option<(&'static str, Option<String>)>,
    attempts: u32,
    duration_ms: u64,
}

/// Bookkeeping for one run.
#[derive(Default)]
struct RunState {
    context: Map<String, Value>,
    results: Map<String, Value>,
    completed: HashSet<String>,
    skipped: HashSet<String>,
    condition_skipped: HashSet<String>,
    failed: Option<String>,
    in_flight: HashSet<String>,
    durations: HashMap<String, u64>,
    errors: HashMap<String, String>,
    branches: HashMap<String, &'static str>,
    attempts: HashMap<String, u32>,
}

impl RunState {
    fn is_resolved(&self, id: &str) -> bool {
        self.completed.contains(id) || self.skipped.contains(id) || self.condition_skipped.contains(id)
    }

    fn status(&self, id: &str) -> StepStatus {
        if self.completed.contains(id) {
            StepStatus::Completed
        } else if self.failed.as_deref() == Some(id) {
            StepStatus::Failed
        } else if self.skipped.contains(id) {
            StepStatus::Skipped
        } else if self.condition_skipped.contains(id) {
            StepStatus::ConditionSkipped
        } else if self.in_flight.contains(id) {
            StepStatus::Pending
        } else {
            StepStatus::NotReached
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub struct WorkflowEngine {
    registry: Arc<HandRegistry>,
    runner: Arc<dyn HandRunner>,
    bus: Arc<EventBus>,
    settings: EngineSettings,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<HandRegistry>,
        runner: Arc<dyn HandRunner>,
        bus: Arc<EventBus>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            runner,
            bus,
            settings,
        }
    }

    pub fn with_config(
        registry: Arc<HandRegistry>,
        runner: Arc<dyn HandRunner>,
        bus: Arc<EventBus>,
        config: &Config,
    ) -> Self {
        Self::new(registry, runner, bus, EngineSettings::from_config(&config.workflow))
    }

    /// Execute a workflow. Failures are reported in the summary, never as a
    /// panic or `Err`.
    pub async fn run(&self, workflow: &WorkflowDefinition, dry_run: bool) -> WorkflowSummary {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let timeout = workflow.timeout().unwrap_or(self.settings.default_timeout);
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + Duration::from_secs(100 * 365 * 24 * 3600));

        tracing::info!(
            workflow = %workflow.name,
            run_id = %run_id,
            steps = workflow.steps.len(),
            dry_run,
            "Starting workflow"
        );

        let mut state = RunState {
            context: workflow.context.clone(),
            ..Default::default()
        };
        let mut error = None;

        loop {
            let unresolved: Vec<&Step> = workflow
                .steps
                .iter()
                .filter(|s| !state.is_resolved(&s.id))
                .collect();
            if unresolved.is_empty() {
                break;
            }

            let ready: Vec<&Step> = unresolved
                .iter()
                .copied()
                .filter(|s| s.depends.iter().all(|d| state.is_resolved(d)))
                .collect();
            if ready.is_empty() {
                let stuck: Vec<&str> = unresolved.iter().map(|s| s.id.as_str()).collect();
                let message = format!("Deadlock: no runnable steps, waiting on [{}]", stuck.join(", "));
                tracing::error!(workflow = %workflow.name, "{message}");
                error = Some(message);
                break;
            }

            // Steps in a round see the context as it stood when the round began
            let context = state.context.clone();
            let results = state.results.clone();
            state.in_flight = ready.iter().map(|s| s.id.clone()).collect();

            let round = join_all(
                ready
                    .iter()
                    .map(|step| self.run_step(step, &context, &results, deadline, dry_run)),
            );
            let outcomes = match tokio::time::timeout_at(deadline, round).await {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    let message = format!("Workflow timed out after {}s", timeout.as_secs_f64());
                    tracing::error!(workflow = %workflow.name, "{message}");
                    error = Some(message);
                    break;
                }
            };
            state.in_flight.clear();

            for outcome in outcomes {
                if let Some(message) = self.settle(workflow, &mut state, outcome) {
                    error.get_or_insert(message);
                }
            }
            if error.is_some() {
                break;
            }
        }

        let steps = workflow
            .steps
            .iter()
            .map(|step| StepSummary {
                id: step.id.clone(),
                kind: step.kind.as_str(),
                status: state.status(&step.id),
                duration_ms: state.durations.get(&step.id).copied().unwrap_or(0),
                error: state.errors.get(&step.id).cloned(),
                branch: state.branches.get(&step.id).copied(),
                attempts: state.attempts.get(&step.id).copied().unwrap_or(0),
            })
            .collect();

        let summary = WorkflowSummary {
            run_id,
            workflow: workflow.name.clone(),
            ok: error.is_none(),
            dry_run,
            duration_ms: elapsed_ms(started),
            error,
            steps,
            context: state.context,
        };

        if summary.ok {
            tracing::info!(workflow = %summary.workflow, duration_ms = summary.duration_ms, "Workflow completed");
        } else {
            tracing::error!(
                workflow = %summary.workflow,
                error = summary.error.as_deref().unwrap_or_default(),
                "Workflow aborted"
            );
        }
        summary
    }

    /// Fold one step outcome into the run. Returns an abort message when the
    /// step's failure stops the workflow.
    fn settle(&self, workflow: &WorkflowDefinition, state: &mut RunState, outcome: StepOutcome) -> Option<String> {
        let StepOutcome {
            id,
            result,
            mut detail,
            branch,
            attempts,
            duration_ms,
        } = outcome;
        state.durations.insert(id.clone(), duration_ms);
        state.attempts.insert(id.clone(), attempts);

        match result {
            Ok(output) => {
                detail.insert("ok".into(), json!(true));
                detail.insert("output".into(), output.clone());
                state.results.insert(id.clone(), Value::Object(detail));
                state.context.insert(id.clone(), output);

                if let Some((taken, not_taken)) = branch {
                    state.branches.insert(id.clone(), taken);
                    if let Some(target) = not_taken {
                        tracing::info!(step = %id, branch = taken, skipped = %target, "Condition selected branch");
                        state.condition_skipped.insert(target);
                    }
                }
                state.completed.insert(id);
                None
            }
            Err(message) => {
                detail.insert("ok".into(), json!(false));
                detail.insert("error".into(), json!(message));
                state.results.insert(id.clone(), Value::Object(detail));
                state.errors.insert(id.clone(), message.clone());

                let policy = workflow.step(&id).map_or(OnError::Abort, |s| s.on_error);
                match policy {
                    OnError::Abort => {
                        tracing::error!(step = %id, error = %message, "Step failed, aborting workflow");
                        state.failed = Some(id.clone());
                        Some(format!("Step '{id}' failed: {message}"))
                    }
                    OnError::Retry | OnError::Skip => {
                        tracing::warn!(step = %id, error = %message, attempts, "Step failed, skipping");
                        state.skipped.insert(id);
                        None
                    }
                }
            }
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        context: &Map<String, Value>,
        results: &Map<String, Value>,
        deadline: Instant,
        dry_run: bool,
    ) -> StepOutcome {
        let started = Instant::now();
        let attempts_allowed = match step.on_error {
            OnError::Retry => step.retries.saturating_add(1),
            _ => 1,
        };

        tracing::info!(step = %step.id, kind = step.kind.as_str(), dry_run, "Running step");

        if let StepKind::Condition { check, then, otherwise } = &step.kind {
            let scope = Scope { results, context };
            let passed = evaluate(check, &scope).unwrap_or_else(|e| {
                tracing::warn!(step = %step.id, check = %check, error = %e, "Condition did not evaluate, taking else");
                false
            });
            let branch = if passed {
                ("then", otherwise.clone())
            } else {
                ("else", Some(then.clone()))
            };
            return StepOutcome {
                id: step.id.clone(),
                result: Ok(json!({"result": passed, "branch": branch.0})),
                detail: Map::from_iter([("branch".to_string(), json!(branch.0))]),
                branch: Some(branch),
                attempts: 1,
                duration_ms: elapsed_ms(started),
            };
        }

        let mut attempt = 0;
        let mut detail = Map::new();
        let result = loop {
            attempt += 1;
            let result = if dry_run {
                Ok(Value::Null)
            } else {
                match &step.kind {
                    StepKind::Hand { hand, input } => {
                        self.run_hand_step(step, hand, input.clone(), deadline, &mut detail).await
                    }
                    StepKind::Task { command, cwd } => {
                        self.run_task_step(step, command, cwd.as_ref(), context, &mut detail).await
                    }
                    StepKind::Condition { .. } => Ok(Value::Null),
                }
            };

            match result {
                Err(e) if attempt < attempts_allowed => {
                    tracing::warn!(step = %step.id, attempt, error = %e, "Step failed, retrying");
                }
                other => break other,
            }
        };

        StepOutcome {
            id: step.id.clone(),
            result,
            detail,
            branch: None,
            attempts: attempt,
            duration_ms: elapsed_ms(started),
        }
    }

    async fn run_hand_step(
        &self,
        step: &Step,
        hand: &str,
        input: Option<Value>,
        deadline: Instant,
        detail: &mut Map<String, Value>,
    ) -> Result<Value, String> {
        match self.registry.status(hand) {
            None => return Err(format!("Hand not found: {hand}")),
            Some(HandStatus::Inactive) => {
                tracing::info!(step = %step.id, hand = %hand, "Activating hand for workflow step");
                self.registry.activate(hand).map_err(|e| e.to_string())?;
            }
            Some(_) => {}
        }

        // Bound the run by the workflow deadline too, so a workflow timeout
        // still ends with the run recorded on the hand
        let remaining = deadline.saturating_duration_since(Instant::now());
        let limit = step.timeout().map_or(remaining, |t| t.min(remaining));
        let mut options = RunOptions::default().with_timeout(limit);
        options.input = input;

        let registry = Arc::clone(&self.registry);
        let runner = Arc::clone(&self.runner);
        let bus = Arc::clone(&self.bus);
        let name = hand.to_string();
        let run = tokio::spawn(async move {
            execute_hand(&registry, runner.as_ref(), &bus, &name, options).await
        });

        let outcome = run
            .await
            .map_err(|e| format!("Hand run task failed: {e}"))?
            .map_err(|e| e.to_string())?;

        detail.insert("durationMs".into(), json!(outcome.duration_ms));
        if !outcome.metrics.is_empty() {
            detail.insert("metrics".into(), json!(outcome.metrics));
        }
        if outcome.ok {
            Ok(outcome.output.map_or(Value::Null, Value::String))
        } else {
            Err(outcome.error.unwrap_or_else(|| "run failed".to_string()))
        }
    }

    async fn run_task_step(
        &self,
        step: &Step,
        command: &str,
        cwd: Option<&PathBuf>,
        context: &Map<String, Value>,
        detail: &mut Map<String, Value>,
    ) -> Result<Value, String> {
        let command = interpolate(command, context);
        let cwd = match cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.settings.project_root.join(dir),
            None => self.settings.project_root.clone(),
        };
        let timeout = step.timeout().unwrap_or(self.settings.task_timeout);

        let output = run_task(&command, &cwd, timeout, self.settings.max_output_chars).await?;
        if !output.stderr.is_empty() {
            detail.insert("stderr".into(), json!(output.stderr));
        }
        Ok(Value::String(output.stdout))
    }
}
