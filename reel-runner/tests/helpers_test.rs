use reel_runner::helpers::{assignment_value, render_template, substitute_variables};
use serde_json::json;

#[test]
fn test_substitute_no_variables() {
    let mut args = json!({"key": "value"});
    substitute_variables(&mut args, &json!({}));
    assert_eq!(args, json!({"key": "value"}));
}

#[test]
fn test_substitute_full_replacement_keeps_type() {
    let mut args = json!({"count": "{{ n }}", "items": "{{ list }}", "flag": "{{ ok }}"});
    let variables = json!({"n": 3, "list": [1, 2], "ok": false});
    substitute_variables(&mut args, &variables);
    assert_eq!(args, json!({"count": 3, "items": [1, 2], "flag": false}));
}

#[test]
fn test_substitute_partial_string() {
    let mut args = json!({"key": "The value is {{ var }} ({{ n + 1 }})"});
    substitute_variables(&mut args, &json!({"var": "test", "n": 1}));
    assert_eq!(args, json!({"key": "The value is test (2)"}));
}

#[test]
fn test_substitute_nested_structures() {
    let mut args = json!({
        "outer": {"inner": ["{{ user.name }}", "fixed", 7]}
    });
    substitute_variables(&mut args, &json!({"user": {"name": "Ada"}}));
    assert_eq!(args, json!({"outer": {"inner": ["Ada", "fixed", 7]}}));
}

#[test]
fn test_failed_expression_stays_literal() {
    let scope = json!({});
    assert_eq!(render_template("{{ 1/0 }}", &scope), json!("{{ 1/0 }}"));
    assert_eq!(
        render_template("total: {{ missing + 1 }} of {{ 2 * 2 }}", &scope),
        json!("total: {{ missing + 1 }} of 4")
    );
}

#[test]
fn test_assignment_literal_versus_expression() {
    let scope = json!({"count": 2, "name": "Ada"});
    assert_eq!(assignment_value(&json!("hello world"), &scope), json!("hello world"));
    assert_eq!(assignment_value(&json!("count + 1"), &scope), json!(3));
    assert_eq!(assignment_value(&json!("name"), &scope), json!("Ada"));
    assert_eq!(assignment_value(&json!("true"), &scope), json!(true));
    assert_eq!(assignment_value(&json!("len([1, 2, 3])"), &scope), json!(3));
    assert_eq!(assignment_value(&json!(42), &scope), json!(42));
    assert_eq!(
        assignment_value(&json!({"who": "{{ name }}"}), &scope),
        json!({"who": "Ada"})
    );
}
