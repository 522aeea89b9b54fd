//! Familiar Workflow - command line entry point.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use familiar_common::config::Config;
use familiar_common::logging::init_logging;
use familiar_common::EventBus;
use familiar_workflow::hands::{execute_hand, AgentRunner, HandRegistry, HandRunner, RunOptions};
use familiar_workflow::skills::SkillInstaller;
use familiar_workflow::workflow::{list_templates, load_workflow, resolve_workflow};
use familiar_workflow::{validate_workflow, HandsService, WorkflowEngine};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Familiar Workflow - hands, triggers and workflows.
#[derive(Parser, Debug)]
#[command(name = "familiar-workflow")]
#[command(version)]
#[command(about = "Autonomous task orchestration for Familiar.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage hands
    Hands {
        #[command(subcommand)]
        hands_command: HandsCommands,
    },

    /// Run and inspect workflows
    Workflow {
        #[command(subcommand)]
        workflow_command: WorkflowCommands,
    },

    /// Install and list skill templates
    Skills {
        #[command(subcommand)]
        skill_command: SkillCommands,
    },

    /// Run the scheduler and triggers until interrupted
    Serve,
}

#[derive(Subcommand, Debug)]
enum HandsCommands {
    /// List all hands
    List,
    /// Show one hand's manifest and state
    Status { name: String },
    /// Activate a hand
    Activate { name: String },
    /// Pause an active hand
    Pause { name: String },
    /// Resume a paused hand
    Resume { name: String },
    /// Deactivate a hand
    Deactivate { name: String },
    /// Run a hand now
    Run {
        name: String,
        /// Walk the phases without calling the agent
        #[arg(long)]
        dry_run: bool,
    },
    /// Activate every inactive hand
    ActivateAll,
    /// Print accumulated metrics
    Metrics,
}

#[derive(Subcommand, Debug)]
enum WorkflowCommands {
    /// Run a workflow file or template
    Run {
        file: String,
        /// Follow the dependency order without running step bodies
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate a workflow file or template
    Validate { file: String },
    /// List workflow templates
    List,
}

#[derive(Subcommand, Debug)]
enum SkillCommands {
    /// Validate and install a skill from a JavaScript file
    Install { name: String, file: PathBuf },
    /// List installed skills
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_with_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.observability.log_level, &config.observability.log_format);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Hands { hands_command } => handle_hands(hands_command, &config).await,
        Commands::Workflow { workflow_command } => handle_workflow(workflow_command, &config).await,
        Commands::Skills { skill_command } => handle_skills(skill_command, &config),
        Commands::Serve => {
            let runner: Arc<dyn HandRunner> = Arc::new(AgentRunner::from_config(&config.runner)?);
            HandsService::new(config, runner).start().await
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_registry(config: &Config) -> Result<Arc<HandRegistry>> {
    let registry = Arc::new(HandRegistry::from_config(config));
    registry.load()?;
    Ok(registry)
}

async fn handle_hands(command: HandsCommands, config: &Config) -> Result<()> {
    let registry = load_registry(config)?;

    match command {
        HandsCommands::List => {
            let hands = registry.list();
            if hands.is_empty() {
                println!("No hands found in {}", registry.hands_dir().display());
                return Ok(());
            }
            println!("{:<24} {:<10} {:<16} {:<6} NEXT RUN", "NAME", "STATUS", "SCHEDULE", "RUNS");
            for hand in hands {
                println!(
                    "{:<24} {:<10} {:<16} {:<6} {}",
                    hand.name,
                    hand.status.as_str(),
                    hand.schedule.as_deref().unwrap_or("-"),
                    hand.run_count,
                    hand.next_run.map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
                );
            }
            Ok(())
        }
        HandsCommands::Status { name } => {
            let entry = registry
                .get(&name)
                .ok_or_else(|| familiar_common::Error::hand_not_found(&name))?;
            print_json(&entry)
        }
        HandsCommands::Activate { name } => {
            registry.activate(&name)?;
            println!("Activated {name}");
            Ok(())
        }
        HandsCommands::Pause { name } => {
            registry.pause(&name)?;
            println!("Paused {name}");
            Ok(())
        }
        HandsCommands::Resume { name } => {
            registry.resume(&name)?;
            println!("Resumed {name}");
            Ok(())
        }
        HandsCommands::Deactivate { name } => {
            registry.deactivate(&name)?;
            println!("Deactivated {name}");
            Ok(())
        }
        HandsCommands::ActivateAll => {
            let activated = registry.activate_all()?;
            if activated.is_empty() {
                println!("No inactive hands");
            } else {
                println!("Activated {}", activated.join(", "));
            }
            Ok(())
        }
        HandsCommands::Metrics => print_json(&registry.metrics()),
        HandsCommands::Run { name, dry_run } => {
            let manifest = registry
                .manifest(&name)
                .ok_or_else(|| familiar_common::Error::hand_not_found(&name))?;
            let max_duration = manifest
                .schedule
                .as_ref()
                .and_then(|s| s.max_duration)
                .unwrap_or(config.hands.default_max_duration_secs);

            let mut options = RunOptions::default().with_timeout(Duration::from_secs(max_duration));
            options.dry_run = dry_run;

            let runner = AgentRunner::from_config(&config.runner)?;
            let bus = EventBus::new();
            let outcome = execute_hand(&registry, &runner, &bus, &name, options).await?;
            print_json(&outcome)?;
            if !outcome.ok {
                bail!("{}", outcome.error.unwrap_or_else(|| "run failed".to_string()));
            }
            Ok(())
        }
    }
}

async fn handle_workflow(command: WorkflowCommands, config: &Config) -> Result<()> {
    let templates_dir = &config.workflow.templates_dir;

    match command {
        WorkflowCommands::List => {
            let templates = list_templates(templates_dir)?;
            if templates.is_empty() {
                println!("No workflows in {}", templates_dir.display());
            }
            for t in templates {
                match t.name {
                    Some(name) => println!("{:<28} {:<20} {} steps  {}", t.file, name, t.steps, t.description),
                    None => println!("{:<28} (unreadable)", t.file),
                }
            }
            Ok(())
        }
        WorkflowCommands::Validate { file } => {
            let path = resolve_workflow(&file, templates_dir)?;
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?;

            let report = validate_workflow(&value);
            if report.valid {
                println!("{} is valid", path.display());
                return Ok(());
            }
            for error in &report.errors {
                println!("  - {error}");
            }
            bail!("{} has {} error(s)", path.display(), report.errors.len());
        }
        WorkflowCommands::Run { file, dry_run } => {
            let definition = load_workflow(&file, templates_dir)?;
            let registry = load_registry(config)?;
            let runner: Arc<dyn HandRunner> = Arc::new(AgentRunner::from_config(&config.runner)?);
            let engine = WorkflowEngine::with_config(registry, runner, Arc::new(EventBus::new()), config);

            let summary = engine.run(&definition, dry_run).await;
            for step in &summary.steps {
                match &step.error {
                    Some(e) => println!("{:<20} {:<18} {:>6}ms  {e}", step.id, step.status.as_str(), step.duration_ms),
                    None => println!("{:<20} {:<18} {:>6}ms", step.id, step.status.as_str(), step.duration_ms),
                }
            }
            match summary.error {
                Some(error) => bail!(error),
                None => {
                    println!("Workflow {} completed in {}ms", summary.workflow, summary.duration_ms);
                    Ok(())
                }
            }
        }
    }
}

fn handle_skills(command: SkillCommands, config: &Config) -> Result<()> {
    let installer = SkillInstaller::from_config(&config.runner);

    match command {
        SkillCommands::Install { name, file } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let path = installer.install(&name, &source)?;
            println!("Installed {name} at {}", path.display());
            Ok(())
        }
        SkillCommands::List => {
            let skills = installer.list()?;
            if skills.is_empty() {
                println!("No skills in {}", installer.skills_dir().display());
            }
            for skill in skills {
                println!("{:<24} {}", skill.name, skill.path.display());
            }
            Ok(())
        }
    }
}
