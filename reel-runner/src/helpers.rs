use crate::expression_eval::{display_string, evaluate_value, get_value, is_parseable, strip_delimiters};
use once_cell::sync::Lazy;
use reel::Backend;
use regex::{Captures, Regex};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

static EXPRESSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("expression pattern is valid"));

static CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\s*\(").expect("call pattern is valid"));

/// Render one string that may contain `{{ expr }}` blocks.
///
/// A string that is exactly one block becomes the expression's value with its own
/// type. Otherwise each block is replaced by the text form of its value. A block
/// that fails to evaluate is left as written.
pub fn render_template(text: &str, scope: &Value) -> Value {
    if let Some(inner) = strip_delimiters(text) {
        return match evaluate_value(inner, scope) {
            Ok(value) => value,
            Err(e) => {
                warn!("Leaving '{}' unevaluated: {}", text, e);
                Value::String(text.to_string())
            }
        };
    }

    if !text.contains("{{") {
        return Value::String(text.to_string());
    }

    let rendered = EXPRESSION_RE.replace_all(text, |caps: &Captures| {
        match evaluate_value(caps[1].trim(), scope) {
            Ok(value) => display_string(&value),
            Err(e) => {
                warn!("Leaving '{}' unevaluated: {}", &caps[0], e);
                caps[0].to_string()
            }
        }
    });
    Value::String(rendered.into_owned())
}

/// Substitutes `{{ expression }}` placeholders in a JSON value.
pub fn substitute_variables(args: &mut Value, variables: &Value) {
    match args {
        Value::Object(map) => {
            for (_, value) in map {
                substitute_variables(value, variables);
            }
        }
        Value::Array(arr) => {
            for value in arr {
                substitute_variables(value, variables);
            }
        }
        Value::String(s) => {
            if s.contains("{{") {
                *args = render_template(s, variables);
            }
        }
        _ => {} // Other types are left as is
    }
}

/// True when the right-hand side of an assignment should be evaluated rather than
/// stored as text: it has an operator, is a literal, names something in scope, or
/// calls a function.
pub fn looks_like_expression(text: &str, scope: &Value) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return false;
    }
    if text.chars().any(|c| "+-*/%<>=!".contains(c)) {
        return true;
    }
    if text.parse::<f64>().is_ok() || matches!(text, "true" | "false" | "null") {
        return true;
    }
    let quoted = text.len() >= 2
        && ((text.starts_with('\'') && text.ends_with('\''))
            || (text.starts_with('"') && text.ends_with('"')));
    if quoted || (text.starts_with('[') && text.ends_with(']')) {
        return is_parseable(text);
    }
    if get_value(text, scope).is_some() {
        return true;
    }
    CALL_RE.is_match(text)
}

/// Value produced by the right-hand side of a `set` step.
pub fn assignment_value(rhs: &Value, scope: &Value) -> Value {
    let text = match rhs {
        Value::String(s) => s.trim(),
        other => {
            let mut value = other.clone();
            substitute_variables(&mut value, scope);
            return value;
        }
    };

    if text.contains("{{") {
        return render_template(text, scope);
    }

    if looks_like_expression(text, scope) {
        match evaluate_value(text, scope) {
            Ok(value) => return value,
            Err(e) => debug!("Storing '{}' as text: {}", text, e),
        }
    }
    Value::String(text.to_string())
}

/// Polls the backend until the surface reports ready or `timeout` elapses.
/// Returns whether readiness was observed. Probe errors end the wait early.
pub async fn wait_for_surface_ready(
    backend: &dyn Backend,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        match backend.surface_ready().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                debug!("Readiness probe unavailable: {}", e);
                return false;
            }
        }
        if start.elapsed() >= timeout {
            warn!(
                "Surface not ready after {}ms; continuing",
                timeout.as_millis()
            );
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_looks_like_expression() {
        let scope = json!({"n": 1, "user": {"name": "Ada"}});
        assert!(looks_like_expression("n + 1", &scope));
        assert!(looks_like_expression("42", &scope));
        assert!(looks_like_expression("'quoted'", &scope));
        assert!(looks_like_expression("user.name", &scope));
        assert!(looks_like_expression("len(items)", &scope));
        assert!(!looks_like_expression("John Smith", &scope));
        assert!(!looks_like_expression("pending", &scope));
    }

    #[test]
    fn test_assignment_falls_back_to_text() {
        let scope = json!({"n": 1});
        assert_eq!(assignment_value(&json!("n + 1"), &scope), json!(2));
        assert_eq!(assignment_value(&json!("John Smith"), &scope), json!("John Smith"));
        assert_eq!(
            assignment_value(&json!("https://a.test/x"), &scope),
            json!("https://a.test/x")
        );
        assert_eq!(assignment_value(&json!(5), &scope), json!(5));
    }
}
