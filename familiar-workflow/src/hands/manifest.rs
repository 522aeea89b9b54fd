//! Hand manifest parsing from HAND.json files.
//!
//! Each hand lives in its own directory under the hands dir:
//!
//! ```json
//! {
//!   "name": "researcher",
//!   "version": "1.2.0",
//!   "description": "Collects and summarises new papers",
//!   "schedule": {"cron": "0 9 * * 1-5", "timezone": "Europe/Berlin", "maxDuration": 1800},
//!   "phases": [
//!     {"name": "gather", "prompt": "Search for ...", "timeout": 600, "onFail": "retry"},
//!     {"name": "summarise", "prompt": "Write ..."}
//!   ],
//!   "tools": ["web_search", "kb_search"],
//!   "metrics": {"papers_read": {"type": "counter"}, "backlog": {"type": "gauge"}},
//!   "guardrails": {"readOnly": true, "networkAccess": true, "maxConcurrent": 1},
//!   "triggers": [{"type": "hand_complete", "hand": "forge-trainer"}]
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::triggers::TriggerDef;
use crate::validate::validate_manifest;

/// Manifest file name inside each hand directory.
pub const MANIFEST_FILE: &str = "HAND.json";

/// Cron schedule attached to a hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Hard run limit in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<u64>,
}

/// What to do when a phase fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFail {
    #[default]
    Abort,
    Skip,
    /// Same as `Skip`.
    Continue,
    Retry,
}

/// One step of a hand's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub name: String,
    pub prompt: String,
    /// Phase timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub on_fail: OnFail,
}

/// How a metric accumulates across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDecl {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guardrails {
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub network_access: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub approval_required: bool,
}

/// A hand definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandManifest {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,

    pub phases: Vec<Phase>,

    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default)]
    pub metrics: BTreeMap<String, MetricDecl>,

    #[serde(default)]
    pub guardrails: Guardrails,

    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl HandManifest {
    /// Validate a raw manifest document and convert it.
    pub fn from_value(value: Value) -> familiar_common::Result<Self> {
        validate_manifest(&value).into_result()?;
        Ok(serde_json::from_value(value)?)
    }

    /// Parse a HAND.json file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?;
        Self::from_value(value).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    /// Declared kind of a metric, if any.
    pub fn metric_kind(&self, key: &str) -> Option<MetricKind> {
        self.metrics.get(key).map(|m| m.kind)
    }

    pub fn cron(&self) -> Option<&str> {
        self.schedule.as_ref().map(|s| s.cron.as_str())
    }
}

/// Discover every valid hand in `dir`.
///
/// Looks for `<dir>/<name>/HAND.json`. Invalid manifests are logged and
/// skipped; a missing directory yields an empty list.
pub fn discover_hands(dir: &Path) -> Result<Vec<HandManifest>> {
    let mut hands = Vec::new();

    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "Hands directory does not exist");
        return Ok(hands);
    }

    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read hands directory: {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .map(|p| p.join(MANIFEST_FILE))
        .filter(|p| p.exists())
        .collect();
    paths.sort();

    for path in paths {
        match HandManifest::from_path(&path) {
            Ok(hand) => {
                tracing::debug!(hand = %hand.name, "Loaded hand from {}", path.display());
                if hands.iter().any(|h: &HandManifest| h.name == hand.name) {
                    tracing::warn!(hand = %hand.name, path = %path.display(), "Duplicate hand name, skipping");
                    continue;
                }
                hands.push(hand);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "Failed to load hand");
            }
        }
    }

    Ok(hands)
}
