//! The Decision Pipeline (§4.5, C5): authenticate -> rate-limit -> select
//! bundle -> evaluate -> branch on allow/deny/approval -> debit/audit.
//!
//! Mirrors the teacher's `OrchestratorService::submit_task` call sequence
//! (auth check, then state lookups, then a single terminal branch) generalized
//! from one RPC method to the gateway's tool-call contract.

use audit::{AuditEvent, NewAuditEntry};
use gateway_core::error::GatewayError;
use gateway_core::ids::{new_pending_id, now_ms};
use gateway_core::tool_call::ToolCall;
use identity::Principal;
use policy::DecisionKind;
use serde_json::{json, Value as JsonValue};
use tracing::info_span;

use crate::state::GatewayState;
use crate::tools;

/// Successful pipeline outcome: every non-allow path (deny, rate-limited,
/// budget-exceeded, still-pending-approval) is surfaced as a [`GatewayError`]
/// instead, so the transport layer has one error-mapping code path.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Tool reply content.
    pub content: JsonValue,
    /// Winning rule name, if policy was evaluated (absent for `cloud.estimate`).
    pub rule_name: Option<String>,
}

/// Run one [`ToolCall`] through the full pipeline on behalf of `principal`.
///
/// # Errors
/// Returns [`GatewayError::RateLimited`], [`GatewayError::PolicyDenied`],
/// [`GatewayError::NeedsApproval`], [`GatewayError::BudgetExceeded`], or
/// [`GatewayError::StoreUnavailable`] per §7's fail-closed taxonomy — every
/// error variant here means the call did not proceed.
pub async fn handle_call(
    state: &GatewayState,
    principal: &Principal,
    call: ToolCall,
) -> Result<CallOutcome, GatewayError> {
    let _call_span = info_span!(
        "gateway.decide",
        tenant = %principal.tenant,
        subject = %principal.subject,
        tool = %call.tool,
        request_id = %call.request_id,
    )
    .entered();
    let now = now_ms();

    {
        let _span = info_span!("gateway.rate_limit.admit", tenant = %principal.tenant).entered();
        if state.ledger.admit(&principal.tenant, now).await.is_err() {
            record(state, &call, AuditEvent::RateLimited, None, JsonValue::Null)?;
            state.metrics.policy_decisions_total.with_label_values(&["rate_limited"]).inc();
            return Err(GatewayError::RateLimited);
        }
    }

    if tools::is_estimate_only(&call.tool) {
        let estimate = state.prices.estimate_call(&call).ok_or_else(|| {
            GatewayError::MalformedRequest("unknown provider/action for cloud.estimate".into())
        })?;
        return Ok(CallOutcome { content: serde_json::to_value(estimate).unwrap_or(JsonValue::Null), rule_name: None });
    }

    let decision = {
        let _span = info_span!("gateway.policy.evaluate", tool = %call.tool).entered();
        let bundle = state
            .policy
            .select_for_tenant(&principal.tenant)
            .map_err(|e| GatewayError::PolicyInvalid(e.to_string()))?;
        policy::evaluate(&bundle, &call)
    };

    match decision.decision {
        DecisionKind::Allow => {
            let _span = info_span!("gateway.budget.debit", tool = %call.tool).entered();
            debit_for_tool(state, principal, &call, now).await?;
            let trace = json!({"trace": policy::decision_to_json(&decision)});
            if let Err(e) = record(state, &call, AuditEvent::Allow, decision.rule_name.clone(), trace) {
                let amount = call.estimated_cost_usd().unwrap_or(0.0);
                let budget_name = tools::budget_name_for_tool(&call.tool);
                state.ledger.refund(&principal.tenant, &budget_name, amount, now).await;
                return Err(e);
            }
            state.metrics.policy_decisions_total.with_label_values(&["allow"]).inc();
            Ok(allow_outcome(&call, decision.rule_name))
        }
        DecisionKind::Deny => {
            record(state, &call, AuditEvent::Deny, decision.rule_name.clone(), json!({"trace": policy::decision_to_json(&decision)}))?;
            state.metrics.policy_decisions_total.with_label_values(&["deny"]).inc();
            Err(GatewayError::PolicyDenied(decision.reason.unwrap_or_else(|| "denied by policy".into())))
        }
        DecisionKind::Approval => {
            run_approval(state, principal, call, decision, now).await
        }
    }
}

async fn debit_for_tool(
    state: &GatewayState,
    principal: &Principal,
    call: &ToolCall,
    now: u64,
) -> Result<(), GatewayError> {
    let amount = call.estimated_cost_usd().unwrap_or(0.0);
    let budget_name = tools::budget_name_for_tool(&call.tool);
    if state.ledger.debit(&principal.tenant, &budget_name, amount, now).await.is_err() {
        record(state, call, AuditEvent::BudgetExceeded, None, json!({"budget": budget_name}))?;
        state.metrics.policy_decisions_total.with_label_values(&["budget_exceeded"]).inc();
        return Err(GatewayError::BudgetExceeded);
    }
    Ok(())
}

async fn run_approval(
    state: &GatewayState,
    principal: &Principal,
    call: ToolCall,
    decision: policy::Decision,
    now: u64,
) -> Result<CallOutcome, GatewayError> {
    let pending_id = new_pending_id();
    let req = approval::NewApproval {
        pending_id,
        tenant: principal.tenant.clone(),
        requester: principal.subject.clone(),
        tool: call.tool.clone(),
        arguments: call.arguments.clone(),
        summary: decision.reason.clone().unwrap_or_else(|| format!("approval required for {}", call.tool)),
        required_approvals: decision.required_approvals,
        approver_group: decision.approver_group.clone(),
        ttl_seconds: state.config.approval.ttl_seconds,
        estimated_cost_usd: call.estimated_cost_usd(),
    };
    state.approvals.create(req, now).await;
    state.metrics.approvals_pending.inc();
    if let Err(e) = record(
        state,
        &call,
        AuditEvent::ApprovalRequested,
        decision.rule_name.clone(),
        json!({"pending_id": pending_id.to_string(), "required_approvals": decision.required_approvals}),
    ) {
        state.metrics.approvals_pending.dec();
        return Err(e);
    }

    let status = {
        let _span = info_span!("gateway.approval.wait", pending_id = %pending_id).entered();
        state
            .approvals
            .wait_for_resolution(pending_id, state.config.approval.sync_wait_ms, now)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?
    };

    match status {
        approval::ApprovalStatus::Allow => {
            state.metrics.approvals_pending.dec();
            record(state, &call, AuditEvent::ApprovalResolved, decision.rule_name.clone(), json!({"pending_id": pending_id.to_string(), "status": "allow"}))?;
            debit_for_tool(state, principal, &call, now).await?;
            state.metrics.policy_decisions_total.with_label_values(&["allow"]).inc();
            Ok(allow_outcome(&call, decision.rule_name))
        }
        approval::ApprovalStatus::Deny => {
            state.metrics.approvals_pending.dec();
            record(state, &call, AuditEvent::ApprovalResolved, decision.rule_name, json!({"pending_id": pending_id.to_string(), "status": "deny"}))?;
            state.metrics.policy_decisions_total.with_label_values(&["deny"]).inc();
            Err(GatewayError::PolicyDenied("approval denied".into()))
        }
        approval::ApprovalStatus::Expired => {
            state.metrics.approvals_pending.dec();
            record(state, &call, AuditEvent::ApprovalResolved, decision.rule_name, json!({"pending_id": pending_id.to_string(), "status": "expired"}))?;
            state.metrics.policy_decisions_total.with_label_values(&["deny"]).inc();
            Err(GatewayError::PolicyDenied("approval expired".into()))
        }
        approval::ApprovalStatus::Pending => {
            state.metrics.policy_decisions_total.with_label_values(&["needs_approval"]).inc();
            Err(GatewayError::NeedsApproval(pending_id.to_string()))
        }
    }
}

fn allow_outcome(call: &ToolCall, rule_name: Option<String>) -> CallOutcome {
    let text = match &rule_name {
        Some(name) => format!("{} authorized by rule \"{name}\"", call.tool),
        None => format!("{} authorized", call.tool),
    };
    CallOutcome {
        content: json!({"content": [{"type": "text", "text": text}], "isError": false}),
        rule_name,
    }
}

/// Append one audit entry. Per spec.md's "audit log is best-effort-never-dropped"
/// guarantee, a failed write is surfaced as [`GatewayError::StoreUnavailable`]
/// so the caller fails the request closed instead of proceeding unaudited.
fn record(
    state: &GatewayState,
    call: &ToolCall,
    event: AuditEvent,
    rule: Option<String>,
    meta: JsonValue,
) -> Result<(), GatewayError> {
    let entry = NewAuditEntry {
        tenant: call.tenant.clone(),
        subject: call.subject.clone(),
        tool: call.tool.clone(),
        event,
        rule,
        args: Some(call.arguments.clone()),
        result_meta: meta,
        request_id: Some(call.request_id.clone()),
    };
    state.audit.append(entry, now_ms()).map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
    state.metrics.audit_writes_total.with_label_values(&[label_for(event)]).inc();
    Ok(())
}

fn label_for(event: AuditEvent) -> &'static str {
    match event {
        AuditEvent::Allow => "allow",
        AuditEvent::Deny => "deny",
        AuditEvent::ApprovalRequested => "approval_requested",
        AuditEvent::RateLimited => "rate_limited",
        AuditEvent::BudgetExceeded => "budget_exceeded",
        AuditEvent::ApprovalDecisionRecorded => "approval_decision_recorded",
        AuditEvent::ApprovalResolved => "approval_resolved",
        AuditEvent::BundleApplied => "bundle_applied",
        AuditEvent::BundleApplyFailed => "bundle_apply_failed",
        AuditEvent::RbacChanged => "rbac_changed",
        AuditEvent::QuotaChanged => "quota_changed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn principal() -> Principal {
        Principal { tenant: "acme".into(), subject: "agent-1".into(), roles: HashSet::new() }
    }

    fn state_with_bundle(yaml: &str) -> GatewayState {
        let identity: Arc<dyn identity::TokenVerifier> =
            Arc::new(identity::DevHmacVerifier::new("shh", "gateway-dev"));
        let state = GatewayState::build(GatewayConfig::from_env(), identity).unwrap();
        state.policy.apply(yaml.as_bytes(), None, policy::ApplyStrategy::Active).unwrap();
        state
    }

    const ALLOW_YAML: &str = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: "Allow intranet HTTP"
    match: "net.http"
    where:
      host_in: ["intranet.api"]
    action: allow
"#;

    #[tokio::test]
    async fn s1_allow_flows_through_pipeline() {
        let state = state_with_bundle(ALLOW_YAML);
        let call = ToolCall::new(
            "acme",
            "agent-1",
            "net.http",
            json!({"method": "GET", "url": "https://intranet.api/status"}),
            "req-1",
        );
        let outcome = handle_call(&state, &principal(), call).await.unwrap();
        assert_eq!(outcome.rule_name.as_deref(), Some("Allow intranet HTTP"));
    }

    #[tokio::test]
    async fn default_deny_surfaces_policy_denied() {
        let state = state_with_bundle(ALLOW_YAML);
        let call = ToolCall::new("acme", "agent-1", "fs.write", json!({"path": "/etc/hosts"}), "req-2");
        let err = handle_call(&state, &principal(), call).await.unwrap_err();
        assert!(matches!(err, GatewayError::PolicyDenied(_)));
    }

    #[tokio::test]
    async fn cloud_estimate_bypasses_policy_entirely() {
        let state = state_with_bundle(ALLOW_YAML);
        let call = ToolCall::new(
            "acme",
            "agent-1",
            "cloud.estimate",
            json!({"provider": "aws", "action": "ec2.run_instances", "quantity": 2.0}),
            "req-3",
        );
        let outcome = handle_call(&state, &principal(), call).await.unwrap();
        assert!(outcome.content.get("estimated_cost_usd").is_some());
        assert!(outcome.rule_name.is_none());
    }

    #[tokio::test]
    async fn s4_budget_exceeded_after_allow() {
        let state = state_with_bundle(
            r#"
version: v1
defaults:
  decision: deny
rules:
  - name: "allow cloud ops"
    match: "cloud.ops"
    action: allow
"#,
        );
        state.tenant_config.set_budget(
            "acme",
            budget::BudgetConfig { name: "cloud_usd".into(), period: budget::Period::Day, limit_usd: 10.0 },
        );
        let call1 =
            ToolCall::new("acme", "agent-1", "cloud.ops", json!({"estimated_cost_usd": 8.0}), "req-4");
        handle_call(&state, &principal(), call1).await.unwrap();
        let call2 =
            ToolCall::new("acme", "agent-1", "cloud.ops", json!({"estimated_cost_usd": 5.0}), "req-5");
        let err = handle_call(&state, &principal(), call2).await.unwrap_err();
        assert!(matches!(err, GatewayError::BudgetExceeded));
    }

    #[tokio::test]
    async fn approval_rule_with_zero_wait_surfaces_needs_approval() {
        let state = state_with_bundle(
            r#"
version: v1
defaults:
  decision: deny
rules:
  - name: "gate mail"
    match: "mail.send"
    action: approval
    required_approvals: 1
"#,
        );
        let call = ToolCall::new("acme", "agent-1", "mail.send", json!({"to": "x@example.com"}), "req-6");
        let err = handle_call(&state, &principal(), call).await.unwrap_err();
        match err {
            GatewayError::NeedsApproval(_) => {}
            other => panic!("expected NeedsApproval, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn audit_write_failure_fails_closed_and_refunds_budget() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        std::fs::write(&audit_path, "").unwrap();

        let identity: Arc<dyn identity::TokenVerifier> =
            Arc::new(identity::DevHmacVerifier::new("shh", "gateway-dev"));
        let mut config = GatewayConfig::from_env();
        config.audit_url = Some(audit_path.to_string_lossy().into_owned());
        let state = GatewayState::build(config, identity).unwrap();
        state
            .policy
            .apply(
                br#"
version: v1
defaults:
  decision: deny
rules:
  - name: "allow cloud ops"
    match: "cloud.ops"
    action: allow
"#,
                None,
                policy::ApplyStrategy::Active,
            )
            .unwrap();
        state.tenant_config.set_budget(
            "acme",
            budget::BudgetConfig { name: "cloud_usd".into(), period: budget::Period::Day, limit_usd: 10.0 },
        );

        // Replace the audit file with a directory so every subsequent append
        // fails to open, simulating a store outage mid-request.
        std::fs::remove_file(&audit_path).unwrap();
        std::fs::create_dir(&audit_path).unwrap();

        let call =
            ToolCall::new("acme", "agent-1", "cloud.ops", json!({"estimated_cost_usd": 8.0}), "req-audit-fail");
        let err = handle_call(&state, &principal(), call).await.unwrap_err();
        assert!(matches!(err, GatewayError::StoreUnavailable(_)));

        // The debit from the failed call must have been refunded: restoring
        // the audit sink, an equal-sized second call against the same $10
        // budget still succeeds instead of tripping BudgetExceeded.
        std::fs::remove_dir(&audit_path).unwrap();
        std::fs::write(&audit_path, "").unwrap();
        let call2 =
            ToolCall::new("acme", "agent-1", "cloud.ops", json!({"estimated_cost_usd": 8.0}), "req-audit-ok");
        handle_call(&state, &principal(), call2).await.unwrap();
    }
}
