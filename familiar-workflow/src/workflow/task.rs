//! Shell task steps.

use familiar_common::util::truncate_with_ellipsis;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

/// Captured output of a task that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}").ok())
        .as_ref()
}

/// Replace `${key}` with values from the context. Dotted keys reach into
/// nested objects; unknown keys are left as written.
pub fn interpolate(template: &str, context: &Map<String, Value>) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        let mut parts = key.split('.');
        let found = parts.next().and_then(|head| context.get(head)).and_then(|root| {
            parts.try_fold(root, |v, part| match v {
                Value::Object(map) => map.get(part),
                Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
        });
        match found {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Run `command` with `sh -c` in `cwd`.
///
/// The child is killed when the timeout elapses. A non-zero exit is an error
/// carrying the (truncated) stderr, or stdout when stderr is empty.
pub async fn run_task(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    max_output_chars: usize,
) -> Result<TaskOutput, String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| format!("Failed to start command: {e}"))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| format!("Failed to run command: {e}"))?,
        Err(_) => return Err(format!("Command timed out after {}s", timeout.as_secs_f64())),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

    if output.status.success() {
        return Ok(TaskOutput {
            stdout,
            stderr,
            exit_code: 0,
        });
    }

    let exit_code = output.status.code().unwrap_or(-1);
    let detail = if stderr.is_empty() { &stdout } else { &stderr };
    let message = if detail.is_empty() {
        format!("Command failed with exit code {exit_code}")
    } else {
        truncate_with_ellipsis(detail, max_output_chars)
    };
    Err(message)
}
