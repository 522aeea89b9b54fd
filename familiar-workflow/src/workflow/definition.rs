//! Workflow definitions.
//!
//! A workflow is a JSON file describing a dependency graph of steps:
//!
//! ```json
//! {
//!   "name": "nightly",
//!   "timeout": 3600,
//!   "context": {"branch": "main"},
//!   "steps": [
//!     {"id": "fetch", "type": "task", "command": "git pull origin ${branch}"},
//!     {"id": "research", "type": "hand", "hand": "researcher", "depends": ["fetch"]},
//!     {"id": "gate", "type": "condition", "check": "research.ok", "then": "publish", "else": "report", "depends": ["research"]},
//!     {"id": "publish", "type": "task", "command": "make publish", "depends": ["gate"]},
//!     {"id": "report", "type": "task", "command": "make report", "depends": ["gate"]}
//!   ]
//! }
//! ```

use anyhow::Context as _;
use familiar_common::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::validate::validate_workflow;

/// Step failure policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Abort,
    Retry,
    Skip,
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepKind {
    /// Run a hand through the runner.
    Hand {
        hand: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// Run a shell command.
    Task {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Evaluate a check and pick a branch.
    Condition {
        check: String,
        then: String,
        #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
        otherwise: Option<String>,
    },
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hand { .. } => "hand",
            Self::Task { .. } => "task",
            Self::Condition { .. } => "condition",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub retries: u32,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl Step {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Seconds. Falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Initial shared context.
    #[serde(default)]
    pub context: Map<String, Value>,
    pub steps: Vec<Step>,
}

/// Convert fractional seconds to a duration, saturating on overflow.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl WorkflowDefinition {
    /// Validate, then deserialize.
    pub fn from_value(value: &Value) -> familiar_common::Result<Self> {
        validate_workflow(value).into_result()?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse workflow {}", path.display()))?;
        Self::from_value(&value).with_context(|| format!("Invalid workflow {}", path.display()))
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(secs)
    }
}

/// Resolve a workflow reference: an existing path, otherwise a basename in
/// `templates_dir` (with or without `.json`).
pub fn resolve_workflow(reference: &str, templates_dir: &Path) -> familiar_common::Result<PathBuf> {
    let direct = PathBuf::from(reference);
    if direct.is_file() {
        return Ok(direct);
    }

    let base = Path::new(reference)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| reference.to_string());
    let candidates = [templates_dir.join(&base), templates_dir.join(format!("{base}.json"))];
    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| Error::NotFound(format!("Workflow not found: {reference}")))
}

/// Load a workflow by path or template name.
pub fn load_workflow(reference: &str, templates_dir: &Path) -> anyhow::Result<WorkflowDefinition> {
    let path = resolve_workflow(reference, templates_dir)?;
    WorkflowDefinition::from_path(&path)
}

/// A template found in the templates directory.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
    pub file: String,
    pub name: Option<String>,
    pub steps: usize,
    pub description: String,
}

/// List `*.json` files in the templates directory, sorted by file name.
/// Files that fail to parse are listed without a name.
pub fn list_templates(templates_dir: &Path) -> anyhow::Result<Vec<TemplateInfo>> {
    if !templates_dir.exists() {
        return Ok(Vec::new());
    }

    let mut templates = Vec::new();
    for entry in std::fs::read_dir(templates_dir)
        .with_context(|| format!("Failed to read {}", templates_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parsed: Option<Value> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());

        templates.push(match parsed {
            Some(v) => TemplateInfo {
                file,
                name: v.get("name").and_then(Value::as_str).map(str::to_string),
                steps: v.get("steps").and_then(Value::as_array).map_or(0, Vec::len),
                description: v
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            None => TemplateInfo {
                file,
                name: None,
                steps: 0,
                description: String::new(),
            },
        });
    }
    templates.sort_by(|a, b| a.file.cmp(&b.file));
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Value {
        json!({
            "name": "nightly",
            "timeout": 60,
            "context": {"branch": "main"},
            "steps": [
                {"id": "a", "type": "task", "command": "echo hi", "cwd": "/tmp"},
                {"id": "b", "type": "hand", "hand": "researcher", "depends": ["a"], "onError": "retry", "retries": 2},
                {"id": "c", "type": "condition", "check": "b.ok", "then": "d", "else": "e", "depends": ["b"]},
                {"id": "d", "type": "task", "command": "true", "depends": ["c"], "timeout": 1.5},
                {"id": "e", "type": "task", "command": "false", "depends": ["c"], "onError": "skip"}
            ]
        })
    }

    #[test]
    fn test_parse_steps() {
        let wf = WorkflowDefinition::from_value(&sample()).unwrap();
        assert_eq!(wf.name, "nightly");
        assert_eq!(wf.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(wf.context["branch"], "main");

        let b = wf.step("b").unwrap();
        assert_eq!(b.on_error, OnError::Retry);
        assert_eq!(b.retries, 2);
        assert_eq!(b.depends, vec!["a"]);

        match &wf.step("c").unwrap().kind {
            StepKind::Condition { check, then, otherwise } => {
                assert_eq!(check, "b.ok");
                assert_eq!(then, "d");
                assert_eq!(otherwise.as_deref(), Some("e"));
            }
            other => panic!("expected condition, got {other:?}"),
        }
        assert_eq!(wf.step("d").unwrap().timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(wf.step("a").unwrap().on_error, OnError::Abort);
    }

    #[test]
    fn test_invalid_definition_is_rejected() {
        let mut bad = sample();
        bad["steps"][0]["depends"] = json!(["e"]);
        bad["steps"][4]["depends"] = json!(["a", "c"]);
        // a -> e -> a
        let err = WorkflowDefinition::from_value(&bad).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_resolve_by_basename() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("nightly.json"), sample().to_string()).unwrap();

        let by_name = load_workflow("nightly", tmp.path()).unwrap();
        assert_eq!(by_name.steps.len(), 5);
        let by_file = load_workflow("nightly.json", tmp.path()).unwrap();
        assert_eq!(by_file.name, "nightly");
        let by_path = tmp.path().join("nightly.json");
        assert!(load_workflow(by_path.to_str().unwrap(), Path::new("/nonexistent")).is_ok());

        assert!(resolve_workflow("missing", tmp.path()).is_err());
    }

    #[test]
    fn test_list_templates() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("b.json"), sample().to_string()).unwrap();
        std::fs::write(tmp.path().join("a.json"), "not json").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let templates = list_templates(tmp.path()).unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].file, "a.json");
        assert!(templates[0].name.is_none());
        assert_eq!(templates[1].name.as_deref(), Some("nightly"));
        assert_eq!(templates[1].steps, 5);

        assert!(list_templates(&tmp.path().join("missing")).unwrap().is_empty());
    }
}
