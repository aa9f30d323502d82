use ed25519_dalek::SigningKey;
use gateway_core::tool_call::ToolCall;
use policy::{sign_bundle, PolicyBundle};
use serde_json::json;

fn call(tool: &str, args: serde_json::Value) -> ToolCall {
    ToolCall::new("acme", "agent-1", tool, args, "req-1")
}

#[test]
fn malformed_yaml_fails_to_load() {
    let yaml = b"rules: [";
    let err = PolicyBundle::load(yaml, None, None, false).unwrap_err();
    assert!(matches!(err, policy::PolicyError::Malformed(_)));
}

#[test]
fn non_deny_default_is_rejected_at_load() {
    let yaml = b"version: v1\ndefaults:\n  decision: allow\nrules: []\n";
    let err = PolicyBundle::load(yaml, None, None, false).unwrap_err();
    assert!(matches!(err, policy::PolicyError::Malformed(_)));
}

#[test]
fn no_matching_rule_falls_through_to_default_deny() {
    let yaml = b"version: v1\ndefaults:\n  decision: deny\nrules: []\n";
    let bundle = PolicyBundle::load(yaml, None, None, false).unwrap();
    let decision = policy::evaluate(&bundle, &call("fs.write", json!({"path": "/etc/hosts"})));
    assert!(matches!(decision.decision, policy::DecisionKind::Deny));
    assert!(decision.rule_name.is_none());
}

#[test]
fn tampered_bundle_bytes_fail_signature_verification() {
    let yaml = b"version: v1\ndefaults:\n  decision: deny\nrules: []\n";
    let mut csprng = rand::rngs::OsRng;
    let signing_key = SigningKey::generate(&mut csprng);
    let sig = sign_bundle(yaml, &signing_key, "test".into(), "0".into());

    let tampered = b"version: v1\ndefaults:\n  decision: deny\nrules: [ ]  \n";
    let err =
        PolicyBundle::load(tampered, Some(&sig), Some(&signing_key.verifying_key()), true)
            .unwrap_err();
    assert!(err.is_signature_invalid());
}

#[test]
fn missing_signature_rejected_when_required() {
    let yaml = b"version: v1\ndefaults:\n  decision: deny\nrules: []\n";
    let err = PolicyBundle::load(yaml, None, None, true).unwrap_err();
    assert!(err.is_signature_invalid());
}
