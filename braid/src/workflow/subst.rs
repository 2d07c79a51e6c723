//! Variable substitution
//!
//! A single syntax `{{expr}}` is recognised in any string-typed field.
//! `expr` is a dotted path, optionally piped through transforms:
//! `{{step | json}}`, `{{value | trim}}`, `{{value | default:"x"}}`.
//! Substitution is one level deep: the result of a substitution is not
//! re-scanned. Unknown paths render as the empty string unless strict
//! mode is on.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::{Scope, WorkflowError};

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap())
}

/// Substitute every `{{expr}}` in `template`.
pub fn substitute(template: &str, scope: &Scope, strict: bool) -> Result<String, WorkflowError> {
    let re = pattern();
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in re.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let expr = caps.get(1).unwrap().as_str().trim();
        out.push_str(&template[last..whole.start()]);

        let value = eval_expr(expr, scope, strict)?;
        out.push_str(&value_to_string(&value));
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Resolve a template to a [`Value`]. When the template is exactly one
/// `{{expr}}` the underlying value is returned unrendered (so arrays and
/// objects survive); otherwise this is string substitution.
pub fn resolve_value(template: &str, scope: &Scope, strict: bool) -> Result<Value, WorkflowError> {
    let trimmed = template.trim();
    let re = pattern();
    if let Some(caps) = re.captures(trimmed) {
        if caps.get(0).unwrap().as_str() == trimmed {
            let expr = caps.get(1).unwrap().as_str().trim();
            return eval_expr(expr, scope, strict);
        }
    }
    substitute(template, scope, strict).map(Value::String)
}

/// Evaluate `path | transform | ...` against the scope.
fn eval_expr(expr: &str, scope: &Scope, strict: bool) -> Result<Value, WorkflowError> {
    let mut segments = expr.split('|').map(str::trim);
    let path = segments
        .next()
        .ok_or_else(|| WorkflowError::VariableNotFound(expr.to_string()))?;

    let mut value = match scope.lookup(path) {
        Some(v) => v,
        None if strict => return Err(WorkflowError::VariableNotFound(path.to_string())),
        None => Value::Null,
    };

    for transform in segments {
        value = apply_transform(transform, value)?;
    }

    Ok(value)
}

fn apply_transform(transform: &str, value: Value) -> Result<Value, WorkflowError> {
    if let Some(arg) = transform.strip_prefix("default:") {
        let fallback = unquote(arg.trim());
        let is_empty = match &value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        return Ok(if is_empty {
            Value::String(fallback)
        } else {
            value
        });
    }

    match transform {
        "json" => Ok(Value::String(
            serde_json::to_string_pretty(&value).unwrap_or_default(),
        )),
        "compact" => Ok(Value::String(
            serde_json::to_string(&value).unwrap_or_default(),
        )),
        "trim" => Ok(Value::String(value_to_string(&value).trim().to_string())),
        "upper" => Ok(Value::String(value_to_string(&value).to_uppercase())),
        "lower" => Ok(Value::String(value_to_string(&value).to_lowercase())),
        other => Err(WorkflowError::Condition {
            expr: other.to_string(),
            message: "unknown transform".to_string(),
        }),
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && (s.starts_with('"') && s.ends_with('"') || s.starts_with('\'') && s.ends_with('\'')) {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Render a value into prompt text: strings verbatim, null empty,
/// everything else compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn scope() -> Scope {
        let mut env = HashMap::new();
        env.insert("NAME".to_string(), "braid".to_string());
        let mut s = Scope::new(env);
        s.set_input(json!("seed"));
        s.bind("a", json!("say hi")).unwrap();
        s.bind("rows", json!([1, 2, 3])).unwrap();
        s.bind("obj", json!({"k": "  padded  "})).unwrap();
        s
    }

    #[test]
    fn test_basic_substitution() {
        let out = substitute("echo {{a}}", &scope(), false).unwrap();
        assert_eq!(out, "echo say hi");
    }

    #[test]
    fn test_env_and_input() {
        let out = substitute("{{env.NAME}}:{{input}}", &scope(), false).unwrap();
        assert_eq!(out, "braid:seed");
    }

    #[test]
    fn test_unknown_renders_empty() {
        let out = substitute("[{{nope}}]", &scope(), false).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_unknown_strict_errors() {
        let err = substitute("{{nope}}", &scope(), true).unwrap_err();
        assert!(matches!(err, WorkflowError::VariableNotFound(_)));
    }

    #[test]
    fn test_json_transform() {
        let out = substitute("{{rows | compact}}", &scope(), false).unwrap();
        assert_eq!(out, "[1,2,3]");
    }

    #[test]
    fn test_trim_and_default() {
        let out = substitute("{{obj.k | trim}}", &scope(), false).unwrap();
        assert_eq!(out, "padded");
        let out = substitute("{{nope | default:\"fallback\"}}", &scope(), false).unwrap();
        assert_eq!(out, "fallback");
    }

    #[test]
    fn test_result_not_rescanned() {
        let mut s = scope();
        s.bind("tpl", json!("{{a}}")).unwrap();
        let out = substitute("{{tpl}}", &s, false).unwrap();
        assert_eq!(out, "{{a}}");
    }

    #[test]
    fn test_resolve_value_keeps_arrays() {
        let v = resolve_value("{{rows}}", &scope(), false).unwrap();
        assert_eq!(v, json!([1, 2, 3]));
        let v = resolve_value("n={{rows.0}}", &scope(), false).unwrap();
        assert_eq!(v, json!("n=1"));
    }
}
