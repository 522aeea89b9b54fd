//! Condition step expressions.
//!
//! Grammar:
//! - `path == literal`
//! - `path != literal`
//! - `path` (truthy check)
//!
//! `path` is dotted (`build.output.status`, `items.0`) and resolves against
//! step results first, then the shared context. The literal is `true`,
//! `false`, `null`, an integer, a float, a quoted string, or anything else
//! taken verbatim as a string.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("Empty condition")]
    Empty,
    #[error("Missing operand in condition: {0}")]
    MissingOperand(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
}

/// Where condition paths are looked up.
pub struct Scope<'a> {
    pub results: &'a Map<String, Value>,
    pub context: &'a Map<String, Value>,
}

impl Scope<'_> {
    /// Resolve a dotted path; `Null` when nothing matches.
    pub fn resolve(&self, path: &str) -> Value {
        let mut parts = path.split('.');
        let Some(head) = parts.next() else {
            return Value::Null;
        };
        let rest: Vec<&str> = parts.collect();

        for root in [self.results, self.context] {
            if let Some(value) = root.get(head) {
                if let Some(found) = traverse(value, &rest) {
                    return found.clone();
                }
            }
        }
        Value::Null
    }
}

fn traverse<'v>(value: &'v Value, parts: &[&str]) -> Option<&'v Value> {
    parts.iter().try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(*part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Parse the right-hand side of a comparison.
pub fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
    }
    Value::String(raw.to_string())
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Equality with numbers compared by value, so `1 == 1.0`.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn split_operator(expr: &str) -> Option<(&str, Op, &str)> {
    let eq = expr.find("==").map(|i| (i, Op::Eq));
    let ne = expr.find("!=").map(|i| (i, Op::Ne));
    let (at, op) = match (eq, ne) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (a, b) => a.or(b)?,
    };
    Some((&expr[..at], op, &expr[at + 2..]))
}

/// Evaluate a condition expression.
pub fn evaluate(expr: &str, scope: &Scope<'_>) -> Result<bool, ConditionError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ConditionError::Empty);
    }

    match split_operator(expr) {
        Some((path, op, literal)) => {
            let path = path.trim();
            if path.is_empty() || literal.trim().is_empty() {
                return Err(ConditionError::MissingOperand(expr.to_string()));
            }
            let equal = loosely_equal(&scope.resolve(path), &parse_literal(literal));
            Ok(match op {
                Op::Eq => equal,
                Op::Ne => !equal,
            })
        }
        None => Ok(is_truthy(&scope.resolve(expr))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn maps(results: Value, context: Value) -> (Map<String, Value>, Map<String, Value>) {
        let as_map = |v: Value| match v {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        (as_map(results), as_map(context))
    }

    fn eval(expr: &str, results: &Map<String, Value>, context: &Map<String, Value>) -> bool {
        evaluate(expr, &Scope { results, context }).unwrap()
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(parse_literal("true"), json!(true));
        assert_eq!(parse_literal(" null "), Value::Null);
        assert_eq!(parse_literal("42"), json!(42));
        assert_eq!(parse_literal("-1.5"), json!(-1.5));
        assert_eq!(parse_literal("\"quoted text\""), json!("quoted text"));
        assert_eq!(parse_literal("'single'"), json!("single"));
        assert_eq!(parse_literal("bare"), json!("bare"));
        assert_eq!(parse_literal("\""), json!("\""));
    }

    #[test]
    fn test_equality_against_step_results() {
        let (results, context) = maps(json!({"stepA": {"ok": true, "output": "done"}}), json!({}));
        assert!(eval("stepA.ok == true", &results, &context));
        assert!(!eval("stepA.ok != true", &results, &context));
        assert!(eval("stepA.output == done", &results, &context));
        assert!(eval("stepA.output == \"done\"", &results, &context));
        assert!(eval("stepA.missing == null", &results, &context));
    }

    #[test]
    fn test_results_shadow_context() {
        let (results, context) = maps(
            json!({"env": {"name": "from-results"}}),
            json!({"env": {"name": "from-context", "region": "eu"}, "count": 3}),
        );
        assert!(eval("env.name == from-results", &results, &context));
        // Falls through to context when the results path is missing
        assert!(eval("env.region == eu", &results, &context));
        assert!(eval("count == 3.0", &results, &context));
        assert!(eval("count != 4", &results, &context));
    }

    #[test]
    fn test_truthy_checks() {
        let (results, context) = maps(
            json!({"a": {"ok": false, "items": [0, 1], "n": 0, "s": ""}}),
            json!({"flag": "yes"}),
        );
        assert!(!eval("a.ok", &results, &context));
        assert!(eval("a.items", &results, &context));
        assert!(!eval("a.items.0", &results, &context));
        assert!(eval("a.items.1", &results, &context));
        assert!(!eval("a.n", &results, &context));
        assert!(!eval("a.s", &results, &context));
        assert!(eval("flag", &results, &context));
        assert!(!eval("nowhere.at.all", &results, &context));
    }

    #[test]
    fn test_malformed_expressions() {
        let (results, context) = maps(json!({}), json!({}));
        let scope = Scope { results: &results, context: &context };
        assert_eq!(evaluate("   ", &scope), Err(ConditionError::Empty));
        assert!(matches!(evaluate("== true", &scope), Err(ConditionError::MissingOperand(_))));
        assert!(matches!(evaluate("a.ok ==", &scope), Err(ConditionError::MissingOperand(_))));
    }
}
