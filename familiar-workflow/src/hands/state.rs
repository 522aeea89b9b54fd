//! Persisted runtime state for Hands.
//!
//! All hand state lives in one JSON object keyed by hand name:
//!
//! ```json
//! {
//!   "researcher": {
//!     "status": "active",
//!     "lastRun": "2026-03-01T09:00:04Z",
//!     "lastDuration": 41250,
//!     "runCount": 12,
//!     "metrics": {"papers_read": 87},
//!     "activatedAt": "2026-02-20T18:11:00Z"
//!   }
//! }
//! ```
//!
//! The file is rewritten wholesale on every mutation through a temp file and
//! rename, so readers never observe a partial write.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Lifecycle status of a hand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandStatus {
    #[default]
    Inactive,
    Active,
    Paused,
    Running,
    Error,
}

impl HandStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for HandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state for a hand (persistent across runs).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandState {
    #[serde(default)]
    pub status: HandStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,

    /// Duration of the last run in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default)]
    pub run_count: u64,

    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,

    /// Opaque, hand-defined resume data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

/// JSON state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every hand's state.
    ///
    /// A missing file is an empty state. A corrupt file is logged and treated
    /// as empty so one bad write cannot stop the scheduler.
    pub fn load(&self) -> Result<BTreeMap<String, HandState>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        match serde_json::from_str(&content) {
            Ok(states) => Ok(states),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Corrupt hand state file, starting empty");
                Ok(BTreeMap::new())
            }
        }
    }

    /// Atomically replace the state file.
    pub fn save(&self, states: &BTreeMap<String, HandState>) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;

        let json = serde_json::to_string_pretty(states).context("Failed to serialize hand state")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        tmp.write_all(json.as_bytes())
            .context("Failed to write hand state")?;
        tmp.as_file().sync_all().context("Failed to flush hand state")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;

        tracing::trace!(path = %self.path.display(), hands = states.len(), "Hand state saved");
        Ok(())
    }
}
