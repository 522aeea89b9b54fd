//! Hand execution boundary.
//!
//! [`HandRunner`] executes a hand's phases; [`execute_hand`] wraps any runner
//! with the registry bookkeeping and bus events every caller (scheduler,
//! triggers, workflows, CLI) needs.

use async_trait::async_trait;
use familiar_common::bus::{EventBus, UNIT_COMPLETE, UNIT_ERROR};
use familiar_common::{Error, Result, RunnerConfig};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use super::manifest::{HandManifest, OnFail, Phase};
use super::registry::{HandRegistry, RunRecord};

/// Options for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Walk the phases without side effects.
    pub dry_run: bool,
    /// Hard limit; the run is cancelled when it elapses.
    pub timeout: Option<Duration>,
    /// Extra input (workflow step input, webhook payload).
    pub input: Option<Value>,
    /// Checkpoint left by the previous run. Filled in by [`execute_hand`].
    pub checkpoint: Option<Value>,
}

impl RunOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// Result of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub ok: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,
}

impl RunOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Executes a hand's phases.
#[async_trait]
pub trait HandRunner: Send + Sync {
    async fn run(&self, hand: &HandManifest, options: RunOptions) -> RunOutcome;
}

/// Run a hand through `runner` with full bookkeeping.
///
/// Marks the hand running, bounds the run by `options.timeout`, records the
/// outcome, then emits `unit.complete` (and `unit.error` on failure). Dry runs
/// skip the registry and the bus. A timeout drops the run future, which
/// cancels in-flight requests and kills child processes spawned with
/// `kill_on_drop`.
///
/// Returns `Err` only when the run could not start (unknown hand, already
/// running). A failed run is `Ok` with `ok: false`.
pub async fn execute_hand(
    registry: &HandRegistry,
    runner: &dyn HandRunner,
    bus: &EventBus,
    name: &str,
    mut options: RunOptions,
) -> Result<RunOutcome> {
    let entry = registry.get(name).ok_or_else(|| Error::hand_not_found(name))?;
    let dry_run = options.dry_run;

    if !dry_run {
        registry.mark_running(name)?;
    }
    options.checkpoint = entry.state.checkpoint.clone();

    tracing::info!(hand = %name, dry_run, "Running hand");
    let started = Instant::now();
    let timeout = options.timeout;
    let run = AssertUnwindSafe(runner.run(&entry.manifest, options)).catch_unwind();

    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .unwrap_or_else(|_| Ok(RunOutcome::failure(Error::Timeout(limit.as_secs()).to_string()))),
        None => run.await,
    };
    let mut outcome = result.unwrap_or_else(|_| RunOutcome::failure("hand runner panicked"));
    outcome.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if !outcome.ok && outcome.error.is_none() {
        outcome.error = Some("run failed".to_string());
    }

    if dry_run {
        return Ok(outcome);
    }

    let record = RunRecord {
        duration_ms: outcome.duration_ms,
        error: if outcome.ok { None } else { outcome.error.clone() },
        metrics: outcome.metrics.clone(),
        checkpoint: outcome.checkpoint.clone(),
    };
    if let Err(e) = registry.record_run(name, record) {
        tracing::error!(hand = %name, error = %e, "Failed to record run");
    }

    if outcome.ok {
        tracing::info!(hand = %name, duration_ms = outcome.duration_ms, "Hand completed");
    } else {
        tracing::error!(
            hand = %name,
            duration_ms = outcome.duration_ms,
            error = outcome.error.as_deref().unwrap_or_default(),
            "Hand failed"
        );
    }

    bus.emit(
        UNIT_COMPLETE,
        &json!({
            "hand": name,
            "ok": outcome.ok,
            "duration_ms": outcome.duration_ms,
            "error": outcome.error,
        }),
    );
    if !outcome.ok {
        bus.emit(UNIT_ERROR, &json!({"hand": name, "error": outcome.error}));
    }

    Ok(outcome)
}

// ============================================================================
// Agent API runner
// ============================================================================

#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    message: &'a str,
    user_id: String,
    channel: &'static str,
    context: PhaseContext<'a>,
}

#[derive(Debug, Serialize)]
struct PhaseContext<'a> {
    hand: &'a str,
    phase: &'a str,
    tools: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_output: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checkpoint: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    #[serde(default)]
    checkpoint: Option<Value>,
}

/// Runs phases by calling the agent API, one request per phase.
pub struct AgentRunner {
    endpoint: String,
    client: reqwest::Client,
}

impl AgentRunner {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn from_config(config: &RunnerConfig) -> anyhow::Result<Self> {
        Self::new(
            config.endpoint.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    async fn call_agent(&self, request: &AgentRequest<'_>) -> anyhow::Result<AgentResponse> {
        let url = format!("{}/api/v1/agent/execute", self.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to call agent API: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Agent API returned {status}: {body}");
        }

        let parsed: AgentResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse agent response: {e}"))?;

        if let Some(error) = &parsed.error {
            anyhow::bail!("Agent error: {error}");
        }
        Ok(parsed)
    }

    async fn run_phase(
        &self,
        hand: &HandManifest,
        phase: &Phase,
        previous_output: Option<&str>,
        options: &RunOptions,
    ) -> anyhow::Result<AgentResponse> {
        let request = AgentRequest {
            message: &phase.prompt,
            user_id: format!("hand-{}", hand.name),
            channel: "hands",
            context: PhaseContext {
                hand: &hand.name,
                phase: &phase.name,
                tools: &hand.tools,
                previous_output,
                checkpoint: options.checkpoint.as_ref(),
                input: options.input.as_ref(),
            },
        };

        match phase.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.call_agent(&request))
                .await
                .map_err(|_| anyhow::anyhow!("timed out after {secs}s"))?,
            None => self.call_agent(&request).await,
        }
    }
}

#[async_trait]
impl HandRunner for AgentRunner {
    async fn run(&self, hand: &HandManifest, options: RunOptions) -> RunOutcome {
        if options.dry_run {
            let plan: Vec<&str> = hand.phases.iter().map(|p| p.name.as_str()).collect();
            return RunOutcome::success(format!("dry run: {}", plan.join(" -> ")));
        }

        let mut output: Option<String> = None;
        let mut metrics = BTreeMap::new();
        let mut checkpoint = None;

        for phase in &hand.phases {
            let attempts = if phase.on_fail == OnFail::Retry { 2 } else { 1 };
            let mut attempt = 1;
            let result = loop {
                let result = self.run_phase(hand, phase, output.as_deref(), &options).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        hand = %hand.name,
                        phase = %phase.name,
                        attempt,
                        error = %e,
                        "Phase failed"
                    );
                    if attempt < attempts {
                        attempt += 1;
                        continue;
                    }
                }
                break result;
            };

            match result {
                Ok(response) => {
                    metrics.extend(response.metrics);
                    if response.checkpoint.is_some() {
                        checkpoint = response.checkpoint;
                    }
                    output = Some(response.content);
                }
                Err(e) if matches!(phase.on_fail, OnFail::Skip | OnFail::Continue) => {
                    tracing::info!(hand = %hand.name, phase = %phase.name, error = %e, "Skipping failed phase");
                }
                Err(e) => {
                    let mut outcome = RunOutcome::failure(format!("phase '{}': {e}", phase.name));
                    outcome.metrics = metrics;
                    outcome.checkpoint = checkpoint;
                    return outcome;
                }
            }
        }

        RunOutcome {
            ok: true,
            output,
            metrics,
            checkpoint,
            ..Default::default()
        }
    }
}
