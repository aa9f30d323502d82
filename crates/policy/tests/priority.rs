use gateway_core::tool_call::ToolCall;
use policy::{DecisionKind, PolicyBundle};
use serde_json::json;

fn bundle(yaml: &str) -> PolicyBundle {
    PolicyBundle::load(yaml.as_bytes(), None, None, false).unwrap()
}

#[test]
fn first_declared_rule_wins_on_equal_specificity() {
    let yaml = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: "first deny"
    match: "net.http"
    action: deny
  - name: "second allow"
    match: "net.http"
    action: allow
"#;
    let decision = policy::evaluate(
        &bundle(yaml),
        &ToolCall::new("acme", "agent-1", "net.http", json!({}), "req-1"),
    );
    assert!(matches!(decision.decision, DecisionKind::Deny));
    assert_eq!(decision.rule_name.as_deref(), Some("first deny"));
}

#[test]
fn exact_match_declared_before_glob_wins_over_it() {
    let yaml = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: "exact allow"
    match: "fs.read"
    action: allow
  - name: "glob deny"
    match: "fs.*"
    action: deny
"#;
    let b = bundle(yaml);
    let allowed = policy::evaluate(&b, &ToolCall::new("t", "s", "fs.read", json!({}), "r1"));
    assert_eq!(allowed.rule_name.as_deref(), Some("exact allow"));
    let denied = policy::evaluate(&b, &ToolCall::new("t", "s", "fs.write", json!({}), "r2"));
    assert_eq!(denied.rule_name.as_deref(), Some("glob deny"));
}

#[test]
fn glob_declared_before_exact_still_wins_by_declaration_order() {
    let yaml = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: "glob deny first"
    match: "fs.*"
    action: deny
  - name: "exact allow second"
    match: "fs.read"
    action: allow
"#;
    let decision = policy::evaluate(
        &bundle(yaml),
        &ToolCall::new("t", "s", "fs.read", json!({}), "r1"),
    );
    assert_eq!(decision.rule_name.as_deref(), Some("glob deny first"));
}

#[test]
fn predicate_mismatch_falls_through_to_next_rule() {
    let yaml = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: "allow intranet only"
    match: "net.http"
    where:
      host_in: ["intranet.api"]
    action: allow
  - name: "deny everything else"
    match: "net.http"
    action: deny
"#;
    let b = bundle(yaml);
    let outside = policy::evaluate(
        &b,
        &ToolCall::new("t", "s", "net.http", json!({"url": "https://evil.example/"}), "r1"),
    );
    assert_eq!(outside.rule_name.as_deref(), Some("deny everything else"));
}
