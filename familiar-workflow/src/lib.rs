//! Familiar Workflow - autonomous task orchestration.
//!
//! This crate provides:
//! - Hands: manifest-defined units of work with persisted lifecycle state
//! - A cron scheduler for hands
//! - Event triggers (file change, webhook, threshold, hand chaining)
//! - A dependency-graph workflow engine
//! - Skill template validation and install

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod cron;
pub mod hands;
pub mod scheduler;
pub mod skills;
pub mod triggers;
pub mod validate;
pub mod workflow;

use familiar_common::{Config, EventBus};
use std::sync::Arc;
use std::time::Duration;

pub use cron::{parse_cron, CronError, CronExpr};
pub use hands::{
    execute_hand, AgentRunner, HandManifest, HandRegistry, HandRunner, HandState, HandStatus,
    RunOptions, RunOutcome,
};
pub use scheduler::{HandsScheduler, TickReport};
pub use skills::{validate_skill_source, SkillInstaller};
pub use triggers::{FireResult, TriggerDef, TriggerKind, TriggerManager, TriggerSettings};
pub use validate::{validate_manifest, validate_trigger, validate_workflow, ValidationReport};
pub use workflow::{StepStatus, WorkflowDefinition, WorkflowEngine, WorkflowSummary};

// ============================================================================
// Hands Service
// ============================================================================

/// Long-running service: cron scheduler plus event triggers.
pub struct HandsService {
    config: Config,
    registry: Arc<HandRegistry>,
    runner: Arc<dyn HandRunner>,
    bus: Arc<EventBus>,
}

impl HandsService {
    pub fn new(config: Config, runner: Arc<dyn HandRunner>) -> Self {
        let registry = Arc::new(HandRegistry::from_config(&config));
        Self {
            config,
            registry,
            runner,
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn registry(&self) -> &Arc<HandRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn start(&self) -> anyhow::Result<()> {
        tracing::info!("Starting Familiar hands service");

        let loaded = self.registry.load()?;
        tracing::info!(hands = loaded, dir = %self.registry.hands_dir().display(), "Hands loaded");
        let interrupted = self.registry.recover_interrupted()?;
        if !interrupted.is_empty() {
            tracing::warn!(hands = ?interrupted, "Recovered hands left running by a previous exit");
        }

        let triggers = TriggerManager::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.runner),
            Arc::clone(&self.bus),
            TriggerSettings::from_config(&self.config),
        );
        triggers.start().await;

        let scheduler = Arc::new(
            HandsScheduler::new(Arc::clone(&self.registry), Arc::clone(&self.runner), Arc::clone(&self.bus))
                .with_config(&self.config),
        );
        let ticking = Arc::clone(&scheduler);
        let scheduler_task = tokio::spawn(async move { ticking.run().await });

        // The scheduler reloads the registry every tick; follow it so hands
        // activated from the CLI get their triggers
        let sync_interval = Duration::from_secs(self.config.hands.tick_interval_secs.max(1));
        let syncing = Arc::clone(&triggers);
        let sync_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sync_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                syncing.sync().await;
            }
        });

        wait_for_shutdown_signal().await?;

        sync_task.abort();
        triggers.stop().await;
        let drained = scheduler.shutdown().await;
        let grace = Duration::from_secs(self.config.hands.shutdown_grace_secs);
        let triggers_drained = triggers.drain(grace).await;
        if let Err(e) = scheduler_task.await {
            tracing::warn!(error = %e, "Scheduler task ended abnormally");
        }

        tracing::info!(drained = drained && triggers_drained, "Familiar hands service stopped");
        Ok(())
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
    }
    Ok(())
}
