//! Shape validation for hand manifests, trigger declarations and workflow
//! definitions.
//!
//! Validators work on raw JSON so that every problem in a document is
//! reported at once, instead of stopping at the first deserialization error.
//! They are pure: no I/O, no state.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::triggers::webhook::HEALTH_ROUTE;

/// Allowed hand and skill names.
pub const NAME_PATTERN: &str = r"^[a-z0-9][a-z0-9_-]*$";

const PHASE_ON_FAIL: &[&str] = &["abort", "skip", "continue", "retry"];
const METRIC_TYPES: &[&str] = &["counter", "gauge", "histogram"];
const TRIGGER_TYPES: &[&str] = &["file_change", "webhook", "threshold", "hand_complete", "schedule"];
const STEP_TYPES: &[&str] = &["hand", "task", "condition"];
const STEP_ON_ERROR: &[&str] = &["retry", "skip", "abort"];

/// Outcome of validating a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Convert into a `Result`, folding all errors into one.
    pub fn into_result(self) -> familiar_common::Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(familiar_common::Error::Validation(self.errors))
        }
    }
}

/// Check a hand/skill name against [`NAME_PATTERN`].
pub fn is_valid_name(name: &str) -> bool {
    static NAME_RE: OnceLock<Option<Regex>> = OnceLock::new();
    NAME_RE
        .get_or_init(|| Regex::new(NAME_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn check_optional_number(obj: &Map<String, Value>, key: &str, ctx: &str, errors: &mut Vec<String>) {
    if let Some(v) = obj.get(key) {
        if !v.is_null() && !v.is_number() {
            errors.push(format!("{ctx}{key} must be a number"));
        }
    }
}

fn check_optional_bool(obj: &Map<String, Value>, key: &str, ctx: &str, errors: &mut Vec<String>) {
    if let Some(v) = obj.get(key) {
        if !v.is_null() && !v.is_boolean() {
            errors.push(format!("{ctx}{key} must be a boolean"));
        }
    }
}

// ============================================================================
// Hand manifests
// ============================================================================

/// Validate a hand manifest document.
pub fn validate_manifest(manifest: &Value) -> ValidationReport {
    let Some(obj) = manifest.as_object() else {
        return ValidationReport::from_errors(vec!["manifest must be a JSON object".into()]);
    };
    let mut errors = Vec::new();

    match obj.get("name").and_then(Value::as_str) {
        None => errors.push("name is required".into()),
        Some(name) if !is_valid_name(name) => errors.push(format!(
            "name '{name}' is invalid (lowercase letters, digits, '-' and '_' only)"
        )),
        Some(_) => {}
    }

    for key in ["version", "description"] {
        if let Some(v) = obj.get(key) {
            if !v.is_string() {
                errors.push(format!("{key} must be a string"));
            }
        }
    }

    match obj.get("schedule") {
        None | Some(Value::Null) => {}
        Some(Value::Object(schedule)) => {
            if non_empty_str(schedule, "cron").is_none() {
                errors.push("schedule.cron is required when schedule is set".into());
            }
            if let Some(tz) = schedule.get("timezone") {
                if !tz.is_null() && !tz.is_string() {
                    errors.push("schedule.timezone must be a string".into());
                }
            }
            check_optional_number(schedule, "maxDuration", "schedule.", &mut errors);
        }
        Some(_) => errors.push("schedule must be an object or null".into()),
    }

    match obj.get("phases").and_then(Value::as_array) {
        None => errors.push("phases is required and must be an array".into()),
        Some(phases) if phases.is_empty() => errors.push("phases must not be empty".into()),
        Some(phases) => {
            for (i, phase) in phases.iter().enumerate() {
                let ctx = format!("phases[{i}].");
                let Some(phase) = phase.as_object() else {
                    errors.push(format!("phases[{i}] must be an object"));
                    continue;
                };
                if non_empty_str(phase, "name").is_none() {
                    errors.push(format!("{ctx}name is required"));
                }
                if non_empty_str(phase, "prompt").is_none() {
                    errors.push(format!("{ctx}prompt is required"));
                }
                check_optional_number(phase, "timeout", &ctx, &mut errors);
                if let Some(on_fail) = phase.get("onFail") {
                    match on_fail.as_str() {
                        Some(s) if PHASE_ON_FAIL.contains(&s) => {}
                        _ => errors.push(format!(
                            "{ctx}onFail must be one of {}",
                            PHASE_ON_FAIL.join(", ")
                        )),
                    }
                }
            }
        }
    }

    if let Some(tools) = obj.get("tools") {
        let all_strings = tools
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !all_strings {
            errors.push("tools must be an array of strings".into());
        }
    }

    match obj.get("metrics") {
        None | Some(Value::Null) => {}
        Some(Value::Object(metrics)) => {
            for (key, decl) in metrics {
                let kind = decl.get("type").and_then(Value::as_str);
                if !kind.is_some_and(|k| METRIC_TYPES.contains(&k)) {
                    errors.push(format!(
                        "metrics.{key}.type must be one of {}",
                        METRIC_TYPES.join(", ")
                    ));
                }
            }
        }
        Some(_) => errors.push("metrics must be an object keyed by metric name".into()),
    }

    match obj.get("guardrails") {
        None | Some(Value::Null) => {}
        Some(Value::Object(guardrails)) => {
            for key in ["readOnly", "networkAccess", "approvalRequired"] {
                check_optional_bool(guardrails, key, "guardrails.", &mut errors);
            }
            if let Some(v) = guardrails.get("maxConcurrent") {
                if !v.is_null() && v.as_u64().is_none() {
                    errors.push("guardrails.maxConcurrent must be a non-negative integer".into());
                }
            }
        }
        Some(_) => errors.push("guardrails must be an object".into()),
    }

    match obj.get("triggers") {
        None | Some(Value::Null) => {}
        Some(Value::Array(triggers)) => {
            for (i, trigger) in triggers.iter().enumerate() {
                if let Err(e) = validate_trigger(trigger) {
                    errors.push(format!("triggers[{i}]: {e}"));
                }
            }
        }
        Some(_) => errors.push("triggers must be an array".into()),
    }

    ValidationReport::from_errors(errors)
}

// ============================================================================
// Triggers
// ============================================================================

/// Validate a single trigger declaration.
pub fn validate_trigger(trigger: &Value) -> Result<(), String> {
    let obj = trigger
        .as_object()
        .ok_or_else(|| "trigger must be a JSON object".to_string())?;

    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "trigger type is required".to_string())?;

    match kind {
        "file_change" => {
            let paths = obj
                .get("paths")
                .and_then(Value::as_array)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| "file_change trigger requires a non-empty paths array".to_string())?;
            if !paths.iter().all(|p| p.as_str().is_some_and(|s| !s.is_empty())) {
                return Err("file_change paths must be non-empty strings".into());
            }
            let mut errors = Vec::new();
            check_optional_bool(obj, "recursive", "", &mut errors);
            check_optional_number(obj, "debounce", "", &mut errors);
            errors.into_iter().next().map_or(Ok(()), Err)
        }
        "webhook" => {
            let route = non_empty_str(obj, "route")
                .ok_or_else(|| "webhook trigger requires a route".to_string())?;
            if !route.starts_with('/') {
                return Err(format!("webhook route '{route}' must start with '/'"));
            }
            if route == HEALTH_ROUTE {
                return Err(format!("webhook route '{route}' is reserved"));
            }
            match obj.get("secret") {
                None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
                Some(_) => Err("webhook secret must be a string".into()),
            }
        }
        "threshold" => {
            non_empty_str(obj, "metric")
                .ok_or_else(|| "threshold trigger requires a metric".to_string())?;
            let above = obj.get("above").filter(|v| !v.is_null());
            let below = obj.get("below").filter(|v| !v.is_null());
            if above.is_none() && below.is_none() {
                return Err("threshold trigger requires above or below".into());
            }
            if above.is_some_and(|v| !v.is_number()) || below.is_some_and(|v| !v.is_number()) {
                return Err("threshold above/below must be numbers".into());
            }
            let mut errors = Vec::new();
            check_optional_number(obj, "interval", "", &mut errors);
            check_optional_bool(obj, "autoReset", "", &mut errors);
            errors.into_iter().next().map_or(Ok(()), Err)
        }
        "hand_complete" => {
            non_empty_str(obj, "hand")
                .ok_or_else(|| "hand_complete trigger requires a hand".to_string())?;
            let mut errors = Vec::new();
            check_optional_bool(obj, "onlyOnSuccess", "", &mut errors);
            errors.into_iter().next().map_or(Ok(()), Err)
        }
        "schedule" => {
            non_empty_str(obj, "cron")
                .ok_or_else(|| "schedule trigger requires a cron expression".to_string())?;
            Ok(())
        }
        other => Err(format!(
            "unknown trigger type '{other}' (expected one of {})",
            TRIGGER_TYPES.join(", ")
        )),
    }
}

// ============================================================================
// Workflows
// ============================================================================

/// Validate a workflow definition, including its dependency graph.
pub fn validate_workflow(definition: &Value) -> ValidationReport {
    let Some(obj) = definition.as_object() else {
        return ValidationReport::from_errors(vec!["workflow must be a JSON object".into()]);
    };
    let mut errors = Vec::new();

    if non_empty_str(obj, "name").is_none() {
        errors.push("name is required".into());
    }
    check_optional_number(obj, "timeout", "", &mut errors);
    if let Some(ctx) = obj.get("context") {
        if !ctx.is_null() && !ctx.is_object() {
            errors.push("context must be an object".into());
        }
    }

    let steps = match obj.get("steps").and_then(Value::as_array) {
        Some(steps) if !steps.is_empty() => steps,
        Some(_) => {
            errors.push("steps must not be empty".into());
            return ValidationReport::from_errors(errors);
        }
        None => {
            errors.push("steps is required and must be an array".into());
            return ValidationReport::from_errors(errors);
        }
    };

    // Pass 1: ids and per-step shape
    let mut ids: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for (i, step) in steps.iter().enumerate() {
        let Some(step) = step.as_object() else {
            errors.push(format!("steps[{i}] must be an object"));
            continue;
        };
        let Some(id) = non_empty_str(step, "id") else {
            errors.push(format!("steps[{i}].id is required"));
            continue;
        };
        if !seen.insert(id) {
            errors.push(format!("duplicate step id '{id}'"));
        } else {
            ids.push(id);
        }

        match step.get("type").and_then(Value::as_str) {
            Some("hand") => {
                if non_empty_str(step, "hand").is_none() {
                    errors.push(format!("step '{id}': hand steps require a hand name"));
                }
            }
            Some("task") => {
                if non_empty_str(step, "command").is_none() {
                    errors.push(format!("step '{id}': task steps require a command"));
                }
            }
            Some("condition") => {
                if non_empty_str(step, "check").is_none() {
                    errors.push(format!("step '{id}': condition steps require a check expression"));
                }
                if non_empty_str(step, "then").is_none() {
                    errors.push(format!("step '{id}': condition steps require a then target"));
                }
            }
            Some(other) => errors.push(format!(
                "step '{id}': unknown type '{other}' (expected one of {})",
                STEP_TYPES.join(", ")
            )),
            None => errors.push(format!("step '{id}': type is required")),
        }

        if let Some(on_error) = step.get("onError") {
            if !on_error.as_str().is_some_and(|s| STEP_ON_ERROR.contains(&s)) {
                errors.push(format!(
                    "step '{id}': onError must be one of {}",
                    STEP_ON_ERROR.join(", ")
                ));
            }
        }
        if let Some(retries) = step.get("retries") {
            if retries.as_u64().is_none() {
                errors.push(format!("step '{id}': retries must be a non-negative integer"));
            }
        }
        check_optional_number(step, "timeout", &format!("step '{id}': "), &mut errors);
        if let Some(depends) = step.get("depends") {
            let all_strings = depends
                .as_array()
                .is_some_and(|d| d.iter().all(Value::is_string));
            if !all_strings {
                errors.push(format!("step '{id}': depends must be an array of step ids"));
            }
        }
    }

    // Pass 2: references
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut dangling = false;
    for step in steps.iter().filter_map(Value::as_object) {
        let Some(id) = non_empty_str(step, "id") else {
            continue;
        };
        let deps: Vec<&str> = step
            .get("depends")
            .and_then(Value::as_array)
            .map(|d| d.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        for dep in &deps {
            if !seen.contains(dep) {
                errors.push(format!("step '{id}' depends on unknown step '{dep}'"));
                dangling = true;
            }
        }
        for key in ["then", "else"] {
            if let Some(target) = step.get(key).and_then(Value::as_str) {
                if !seen.contains(target) {
                    errors.push(format!("step '{id}': {key} target '{target}' does not exist"));
                }
            }
        }
        graph.entry(id).or_insert(deps);
    }

    // Pass 3: cycles
    if !dangling {
        if let Some(at) = find_cycle(&ids, &graph) {
            errors.push(format!("dependency cycle detected at step '{at}'"));
        }
    }

    ValidationReport::from_errors(errors)
}

/// Depth-first search with a recursion stack. Returns the first step found
/// while it is still on the stack.
fn find_cycle<'a>(ids: &[&'a str], graph: &HashMap<&'a str, Vec<&'a str>>) -> Option<&'a str> {
    fn visit<'a>(
        id: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> Option<&'a str> {
        if stack.contains(id) {
            return Some(id);
        }
        if !visited.insert(id) {
            return None;
        }
        stack.insert(id);
        for dep in graph.get(id).into_iter().flatten() {
            if let Some(at) = visit(dep, graph, visited, stack) {
                return Some(at);
            }
        }
        stack.remove(id);
        None
    }

    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    ids.iter()
        .find_map(|id| visit(id, graph, &mut visited, &mut stack))
}
