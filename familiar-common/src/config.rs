//! Configuration management for Familiar services.
//!
//! All services share one configuration file at `~/.familiar/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (FAMILIAR_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `FAMILIAR_HOME` → configuration directory (default `~/.familiar`)
//! - `FAMILIAR_WEBHOOK_PORT` → triggers.webhook_port
//! - `FAMILIAR_PROJECT_ROOT` → workflow.project_root
//! - `FAMILIAR_RUNNER_ENDPOINT` → runner.endpoint
//! - `FAMILIAR_LOG_LEVEL` → observability.log_level

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("FAMILIAR_HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".familiar"),
        |dirs| dirs.home_dir().join(".familiar"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Hands
// ============================================================================

/// Hand registry and cron scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandsConfig {
    /// Directory scanned for `<name>/HAND.json` manifests
    #[serde(default = "default_hands_dir")]
    pub dir: PathBuf,

    /// Persisted runtime state (one JSON object keyed by hand name)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Timezone used when a schedule does not name one
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Run timeout used when a schedule does not set `maxDuration`
    #[serde(default = "default_max_duration_secs")]
    pub default_max_duration_secs: u64,

    /// Seconds between scheduler ticks
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Maximum remembered per-minute dedup keys
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// How long shutdown waits for in-flight runs
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for HandsConfig {
    fn default() -> Self {
        Self {
            dir: default_hands_dir(),
            state_file: default_state_file(),
            default_timezone: default_timezone(),
            default_max_duration_secs: default_max_duration_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            dedup_capacity: default_dedup_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_hands_dir() -> PathBuf {
    config_dir().join("hands")
}

fn default_state_file() -> PathBuf {
    config_dir().join("hands-state.json")
}

/// Default timezone for hand schedules.
pub fn default_timezone() -> String {
    "America/Los_Angeles".into()
}

fn default_max_duration_secs() -> u64 {
    3600
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_dedup_capacity() -> usize {
    500
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

// ============================================================================
// Triggers
// ============================================================================

/// Event trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersConfig {
    /// Bind address of the shared webhook server
    #[serde(default = "default_webhook_bind")]
    pub webhook_bind: String,

    /// Port of the shared webhook server
    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,

    /// Minimum seconds between trigger-caused runs of one hand
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Quiet period before a burst of file events fires
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Threshold poll interval when a trigger does not set one
    #[serde(default = "default_threshold_interval_secs")]
    pub threshold_interval_secs: u64,

    /// Seconds after which a fired threshold re-arms
    #[serde(default = "default_threshold_reset_secs")]
    pub threshold_reset_secs: u64,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            webhook_bind: default_webhook_bind(),
            webhook_port: default_webhook_port(),
            cooldown_secs: default_cooldown_secs(),
            debounce_ms: default_debounce_ms(),
            threshold_interval_secs: default_threshold_interval_secs(),
            threshold_reset_secs: default_threshold_reset_secs(),
        }
    }
}

fn default_webhook_bind() -> String {
    "127.0.0.1".into()
}

fn default_webhook_port() -> u16 {
    18795
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_debounce_ms() -> u64 {
    5000
}

fn default_threshold_interval_secs() -> u64 {
    300
}

fn default_threshold_reset_secs() -> u64 {
    300
}

// ============================================================================
// Workflow
// ============================================================================

/// Workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Directory searched when a workflow is referenced by name
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,

    /// Working directory for shell task steps
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Whole-workflow timeout when the definition does not set one
    #[serde(default = "default_workflow_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Shell task timeout when the step does not set one
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Characters of stderr/stdout kept in a failed task's error
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            templates_dir: default_templates_dir(),
            project_root: default_project_root(),
            default_timeout_secs: default_workflow_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

fn default_templates_dir() -> PathBuf {
    config_dir().join("workflows")
}

fn default_project_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_workflow_timeout_secs() -> u64 {
    7200
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_max_output_chars() -> usize {
    500
}

// ============================================================================
// Runner
// ============================================================================

/// Agent runner configuration (the service that executes hand phases).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Agent API base URL
    #[serde(default = "default_runner_endpoint")]
    pub endpoint: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Installed skill templates
    #[serde(default = "default_skills_dir")]
    pub skills_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_runner_endpoint(),
            request_timeout_secs: default_request_timeout_secs(),
            skills_dir: default_skills_dir(),
        }
    }
}

fn default_runner_endpoint() -> String {
    "http://127.0.0.1:4400".into()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_skills_dir() -> PathBuf {
    config_dir().join("skills")
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hands: HandsConfig,

    #[serde(default)]
    pub triggers: TriggersConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("FAMILIAR_WEBHOOK_PORT") {
            match port.parse() {
                Ok(p) => self.triggers.webhook_port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid FAMILIAR_WEBHOOK_PORT"),
            }
        }

        if let Ok(root) = std::env::var("FAMILIAR_PROJECT_ROOT") {
            if !root.trim().is_empty() {
                self.workflow.project_root = PathBuf::from(root);
            }
        }

        if let Ok(endpoint) = std::env::var("FAMILIAR_RUNNER_ENDPOINT") {
            self.runner.endpoint = endpoint;
        }

        if let Ok(level) = std::env::var("FAMILIAR_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut errors = Vec::new();

        if self.triggers.webhook_port == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "triggers.webhook_port".into(),
                reason: "must be between 1 and 65535".into(),
            });
        }

        if self.hands.tick_interval_secs == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "hands.tick_interval_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }

        if self.hands.dedup_capacity == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "hands.dedup_capacity".into(),
                reason: "must be greater than zero".into(),
            });
        }

        if self.hands.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            errors.push(ValidationError::InvalidValue {
                field: "hands.default_timezone".into(),
                reason: format!("unknown timezone '{}'", self.hands.default_timezone),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.triggers.webhook_port, 18795);
        assert_eq!(config.triggers.cooldown_secs, 60);
        assert_eq!(config.triggers.debounce_ms, 5000);
        assert_eq!(config.hands.default_timezone, "America/Los_Angeles");
        assert_eq!(config.hands.default_max_duration_secs, 3600);
        assert_eq!(config.hands.dedup_capacity, 500);
        assert_eq!(config.workflow.default_timeout_secs, 7200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{"triggers": {"webhook_port": 9000}}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.triggers.webhook_port, 9000);
        assert_eq!(config.triggers.cooldown_secs, 60);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.triggers.webhook_port = 0;
        config.hands.default_timezone = "Mars/Olympus".into();

        match config.validate() {
            Err(ValidationError::Multiple(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }
}
