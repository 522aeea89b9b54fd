//! Trigger declarations.
//!
//! Triggers are declared in a hand's `HAND.json` under `triggers`, or
//! registered at runtime through the trigger manager:
//!
//! ```json
//! [
//!   {"type": "file_change", "paths": ["~/notes"], "recursive": true, "debounce": 5000},
//!   {"type": "webhook", "route": "/hooks/research", "secret": "s3cret"},
//!   {"type": "threshold", "metric": "forge-trainer.loss", "below": 0.2, "interval": 300},
//!   {"type": "hand_complete", "hand": "forge-trainer", "onlyOnSuccess": true},
//!   {"type": "schedule", "cron": "0 9 * * 1-5"}
//! ]
//! ```
//!
//! `debounce` is in milliseconds, `interval` in seconds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::validate::validate_trigger;

/// A validated trigger declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDef {
    /// Fire when anything under `paths` changes.
    FileChange {
        paths: Vec<String>,
        #[serde(default)]
        recursive: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        debounce: Option<u64>,
    },

    /// Fire on `POST <route>` to the shared webhook server.
    Webhook {
        route: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },

    /// Fire when a metric crosses a bound.
    Threshold {
        metric: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        above: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        below: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<u64>,
        #[serde(rename = "autoReset", default = "default_true")]
        auto_reset: bool,
    },

    /// Fire when another hand finishes.
    HandComplete {
        hand: String,
        #[serde(rename = "onlyOnSuccess", default = "default_true")]
        only_on_success: bool,
    },

    /// Cron schedule, handled by the scheduler rather than the trigger manager.
    Schedule { cron: String },
}

fn default_true() -> bool {
    true
}

impl TriggerDef {
    /// Validate and parse a raw trigger declaration.
    pub fn parse(value: &Value) -> Result<Self, String> {
        validate_trigger(value)?;
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::FileChange { .. } => TriggerKind::FileChange,
            Self::Webhook { .. } => TriggerKind::Webhook,
            Self::Threshold { .. } => TriggerKind::Threshold,
            Self::HandComplete { .. } => TriggerKind::HandComplete,
            Self::Schedule { .. } => TriggerKind::Schedule,
        }
    }
}

/// The five trigger types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    FileChange,
    Webhook,
    Threshold,
    HandComplete,
    Schedule,
}

impl TriggerKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FileChange => "file_change",
            Self::Webhook => "webhook",
            Self::Threshold => "threshold",
            Self::HandComplete => "hand_complete",
            Self::Schedule => "schedule",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_change" => Ok(Self::FileChange),
            "webhook" => Ok(Self::Webhook),
            "threshold" => Ok(Self::Threshold),
            "hand_complete" => Ok(Self::HandComplete),
            "schedule" => Ok(Self::Schedule),
            other => Err(format!("unknown trigger type '{other}'")),
        }
    }
}
