//! HTTP transport (§6, C9): one JSON-RPC endpoint for tool calls plus the
//! admin/simulator/audit/metrics surface. Authentication is checked inline
//! per handler rather than through one global middleware layer, because the
//! required role varies by route (viewer for simulate/metrics, approver for
//! the callback, admin for policy apply and tenant config) — `tandem-server`
//! uses a single `from_fn_with_state` gate for a single role; this surface
//! has several, so each handler extracts and checks its own.

use std::collections::HashSet;
use std::sync::Arc;

use audit::{AuditEvent, NewAuditEntry};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use gateway_core::error::GatewayError;
use gateway_core::ids::now_ms;
use gateway_core::tool_call::ToolCall;
use identity::{Principal, Role};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::pipeline;
use crate::state::GatewayState;
use crate::tools::BUILTIN_TOOLS;

/// Build the full axum router over `state`.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/approvals/callback", get(callback_handler))
        .route("/admin/tenants/:tenant/rate-limit", put(set_rate_limit))
        .route("/admin/tenants/:tenant/quota", put(set_quota))
        .route("/admin/rbac/:tenant/users/:subject", put(set_rbac).get(get_rbac))
        .route("/admin/rbac/groups/:group/members", put(set_group_members).get(get_group_members))
        .route("/v1/policy/simulate", post(simulate))
        .route("/v1/policy/diff", post(diff))
        .route("/v1/policy/apply", post(apply))
        .route("/v1/audit", get(read_audit))
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Verify the bearer token, then widen the principal's role set with any
/// roles assigned server-side via `PUT /admin/rbac/{tenant}/users/{subject}`
/// (§4.10) — a token's own claims and the admin-assigned roster are both
/// honored, so an OIDC token lacking a custom `roles` claim can still be
/// granted `approver`/`admin` by an operator.
async fn authenticate(state: &GatewayState, headers: &HeaderMap) -> Result<Principal, GatewayError> {
    let header = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or("");
    let token = identity::strip_bearer(header).map_err(|_| GatewayError::Unauthorized)?;
    let mut principal = state.identity.verify(token).await.map_err(|_| GatewayError::Unauthorized)?;
    principal.roles.extend(state.rbac.roles(&principal.tenant, &principal.subject));
    Ok(principal)
}

fn require_role(principal: &Principal, role: Role) -> Result<(), GatewayError> {
    if principal.has_role(role) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden)
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
        GatewayError::Forbidden => StatusCode::FORBIDDEN,
        GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::PolicyDenied(_) | GatewayError::BudgetExceeded => StatusCode::FORBIDDEN,
        GatewayError::NeedsApproval(_) => StatusCode::ACCEPTED,
        GatewayError::PolicyInvalid(_) | GatewayError::SignatureInvalid(_) | GatewayError::MalformedRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn mcp_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(req): Json<JsonRpcRequest>,
) -> Response {
    let id = req.id.clone().unwrap_or(JsonValue::Null);
    let started = std::time::Instant::now();
    let result = dispatch_mcp(&state, &headers, req).await;
    state
        .metrics
        .http_request_duration
        .with_label_values(&["POST", "/mcp"])
        .observe(started.elapsed().as_secs_f64());
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(err) => status_for(err),
    };
    state
        .metrics
        .http_requests_total
        .with_label_values(&["POST", "/mcp", status.as_str()])
        .inc();
    match result {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))).into_response(),
        Err(err) => (status_for(&err), Json(JsonRpcResponse::from_gateway_error(id, &err, None))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: JsonValue,
}

/// Dispatch one JSON-RPC method. `tools/call`'s deny and pending-approval
/// outcomes are folded into a success `result` carrying `isError: true`
/// (§6) rather than a JSON-RPC error — only failures that never produced a
/// policy decision (auth, rate limit, budget, malformed request, store
/// outage) surface as JSON-RPC `error` objects.
pub(crate) async fn dispatch_mcp(state: &GatewayState, headers: &HeaderMap, req: JsonRpcRequest) -> Result<JsonValue, GatewayError> {
    match req.method.as_str() {
        "initialize" => Ok(json!({"protocolVersion": "2025-03-26", "serverInfo": {"name": "gateway", "version": gateway_core::VERSION}})),
        "tools/list" => Ok(json!({"tools": BUILTIN_TOOLS})),
        "tools/call" => {
            let principal = authenticate(state, headers).await?;
            let params: ToolCallParams = serde_json::from_value(req.params)
                .map_err(|e| GatewayError::MalformedRequest(e.to_string()))?;
            let call = ToolCall::new(
                principal.tenant.clone(),
                principal.subject.clone(),
                params.name,
                params.arguments,
                req.id.map(|v| v.to_string()).unwrap_or_else(gateway_core::ids::new_request_id),
            );
            match pipeline::handle_call(state, &principal, call).await {
                Ok(outcome) => Ok(outcome.content),
                Err(GatewayError::PolicyDenied(reason)) => Ok(json!({
                    "content": [{"type": "text", "text": format!("denied: {reason}")}],
                    "isError": true,
                })),
                Err(GatewayError::NeedsApproval(pending_id)) => Ok(json!({
                    "decision": "approval",
                    "pendingId": pending_id,
                    "isError": true,
                    "content": [{"type": "text", "text": format!("approval required; pending_id={pending_id}")}],
                })),
                Err(other) => Err(other),
            }
        }
        other => Err(GatewayError::MalformedRequest(format!("unknown method '{other}'"))),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    t: String,
}

async fn callback_handler(
    State(state): State<Arc<GatewayState>>,
    Query(q): Query<CallbackQuery>,
) -> Response {
    let now = now_ms();
    let verified = match crate::callback::verify(&state.config.callback_signing_secret, &q.t, now) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, Html(format!("<p>invalid callback: {e}</p>"))).into_response(),
    };
    if let Ok(pending) = state.approvals.get(verified.pending_id, now).await {
        if let Some(group) = &pending.approver_group {
            if !state.rbac.is_member(group, &verified.approver_id) {
                return (StatusCode::FORBIDDEN, Html("<p>not a member of the required approver group</p>")).into_response();
            }
        }
    }
    let result = state
        .approvals
        .record_decision(verified.pending_id, &verified.approver_id, verified.action, now)
        .await;
    match result {
        Ok(status) => {
            let audit_result = state.audit.append(
                NewAuditEntry {
                    tenant: String::new(),
                    subject: verified.approver_id,
                    tool: String::new(),
                    event: AuditEvent::ApprovalDecisionRecorded,
                    rule: None,
                    args: None,
                    result_meta: json!({"pending_id": verified.pending_id.to_string(), "status": format!("{status:?}")}),
                    request_id: None,
                },
                now,
            );
            match audit_result {
                Ok(_) => (StatusCode::OK, Html(format!("<p>recorded: {status:?}</p>"))).into_response(),
                Err(e) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Html(format!("<p>decision recorded but audit store unavailable: {e}</p>")),
                )
                    .into_response(),
            }
        }
        Err(e) => (StatusCode::NOT_FOUND, Html(format!("<p>{e}</p>"))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    capacity_qps: f64,
}

async fn set_rate_limit(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(tenant): Path<String>,
    Json(body): Json<RateLimitBody>,
) -> Response {
    match authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Admin)) {
        Ok(()) => {
            state.tenant_config.set_rate_limit(&tenant, body.capacity_qps);
            match audit_quota_change(&state, &tenant, "rate_limit").await {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => (status_for(&e), Json(json!({"error": e.to_string()}))).into_response(),
            }
        }
        Err(e) => (status_for(&e), Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct QuotaBody {
    name: String,
    period: String,
    limit_usd: f64,
}

async fn set_quota(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(tenant): Path<String>,
    Json(body): Json<QuotaBody>,
) -> Response {
    match authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Admin)) {
        Ok(()) => {
            let period = match body.period.as_str() {
                "day" => budget::Period::Day,
                "week" => budget::Period::Week,
                other => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": format!("period must be day|week, got '{other}'")})),
                    )
                        .into_response()
                }
            };
            state.tenant_config.set_budget(
                &tenant,
                budget::BudgetConfig { name: body.name, period, limit_usd: body.limit_usd },
            );
            match audit_quota_change(&state, &tenant, "budget").await {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => (status_for(&e), Json(json!({"error": e.to_string()}))).into_response(),
            }
        }
        Err(e) => (status_for(&e), Json(json!({"error": e.to_string()}))).into_response(),
    }
}

/// Record a `QuotaChanged` audit entry. Per spec.md's fail-closed audit
/// guarantee the caller must surface [`GatewayError::StoreUnavailable`]
/// instead of returning success for a change that was never audited.
async fn audit_quota_change(state: &GatewayState, tenant: &str, what: &str) -> Result<(), GatewayError> {
    state
        .audit
        .append(
            NewAuditEntry {
                tenant: tenant.to_string(),
                subject: String::new(),
                tool: String::new(),
                event: AuditEvent::QuotaChanged,
                rule: None,
                args: None,
                result_meta: json!({"changed": what}),
                request_id: None,
            },
            now_ms(),
        )
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RbacBody {
    roles: Vec<String>,
}

async fn set_rbac(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path((tenant, subject)): Path<(String, String)>,
    Json(body): Json<RbacBody>,
) -> Response {
    match authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Admin)) {
        Ok(()) => {
            let roles: HashSet<Role> = body
                .roles
                .iter()
                .filter_map(|r| match r.as_str() {
                    "admin" => Some(Role::Admin),
                    "approver" => Some(Role::Approver),
                    "viewer" => Some(Role::Viewer),
                    _ => None,
                })
                .collect();
            state.rbac.set_roles(&tenant, &subject, roles);
            let audit_result = state.audit.append(
                NewAuditEntry {
                    tenant: tenant.clone(),
                    subject: subject.clone(),
                    tool: String::new(),
                    event: AuditEvent::RbacChanged,
                    rule: None,
                    args: None,
                    result_meta: json!({"roles": body.roles}),
                    request_id: None,
                },
                now_ms(),
            );
            match audit_result {
                Ok(_) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => {
                    let e = GatewayError::StoreUnavailable(e.to_string());
                    (status_for(&e), Json(json!({"error": e.to_string()}))).into_response()
                }
            }
        }
        Err(e) => (status_for(&e), Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn get_rbac(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path((tenant, subject)): Path<(String, String)>,
) -> Response {
    match authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Admin)) {
        Ok(()) => Json(json!({"roles": state.rbac.roles(&tenant, &subject)})).into_response(),
        Err(e) => (status_for(&e), Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct GroupMembersBody {
    members: Vec<String>,
}

/// Replace an `approver_group` roster (§4.4) so a rule's `required_approvals`
/// can actually be satisfied by named approvers instead of staying permanently
/// unresolvable.
async fn set_group_members(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(group): Path<String>,
    Json(body): Json<GroupMembersBody>,
) -> Response {
    match authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Admin)) {
        Ok(()) => {
            let members: HashSet<String> = body.members.iter().cloned().collect();
            state.rbac.set_group(&group, members);
            let audit_result = state.audit.append(
                NewAuditEntry {
                    tenant: String::new(),
                    subject: String::new(),
                    tool: String::new(),
                    event: AuditEvent::RbacChanged,
                    rule: None,
                    args: None,
                    result_meta: json!({"group": group, "members": body.members}),
                    request_id: None,
                },
                now_ms(),
            );
            match audit_result {
                Ok(_) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => {
                    let e = GatewayError::StoreUnavailable(e.to_string());
                    (status_for(&e), Json(json!({"error": e.to_string()}))).into_response()
                }
            }
        }
        Err(e) => (status_for(&e), Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn get_group_members(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(group): Path<String>,
) -> Response {
    match authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Admin)) {
        Ok(()) => Json(json!({"members": state.rbac.members(&group)})).into_response(),
        Err(e) => (status_for(&e), Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SimulateBody {
    tenant: String,
    tool: String,
    #[serde(default)]
    arguments: JsonValue,
    /// Simulate against a specific bundle version instead of the tenant's resolved one.
    #[serde(default)]
    bundle_version: Option<String>,
}

async fn simulate(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<SimulateBody>,
) -> Response {
    if let Err(e) = authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Viewer)) {
        return (status_for(&e), Json(json!({"error": e.to_string()}))).into_response();
    }
    let bundle = match &body.bundle_version {
        Some(v) => state.policy.get_version(v),
        None => state.policy.select_for_tenant(&body.tenant).ok(),
    };
    let Some(bundle) = bundle else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "no matching bundle version"}))).into_response();
    };
    let call = ToolCall::new(body.tenant, "simulator", body.tool, body.arguments, "simulate");
    let decision = policy::evaluate(&bundle, &call);
    Json(policy::decision_to_json(&decision)).into_response()
}

#[derive(Debug, Deserialize)]
struct DiffBody {
    from: policy::BundleFile,
    to: policy::BundleFile,
}

async fn diff(State(state): State<Arc<GatewayState>>, headers: HeaderMap, Json(body): Json<DiffBody>) -> Response {
    if let Err(e) = authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Viewer)) {
        return (status_for(&e), Json(json!({"error": e.to_string()}))).into_response();
    }
    let changes = policy::diff_bundles(&body.from, &body.to);
    Json(json!({"changes": changes})).into_response()
}

#[derive(Debug, Deserialize)]
struct ApplyBody {
    yaml: String,
    #[serde(default)]
    signature: Option<policy::SignatureFile>,
    strategy: ApplyStrategyBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ApplyStrategyBody {
    Active,
    Canary { percent: u8 },
    Explicit { tenants: Vec<String> },
}

async fn apply(State(state): State<Arc<GatewayState>>, headers: HeaderMap, Json(body): Json<ApplyBody>) -> Response {
    if let Err(e) = authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Admin)) {
        return (status_for(&e), Json(json!({"error": e.to_string()}))).into_response();
    }
    let strategy = match body.strategy {
        ApplyStrategyBody::Active => policy::ApplyStrategy::Active,
        ApplyStrategyBody::Canary { percent } => policy::ApplyStrategy::Canary(percent),
        ApplyStrategyBody::Explicit { tenants } => policy::ApplyStrategy::Explicit(tenants),
    };
    match state.policy.apply(body.yaml.as_bytes(), body.signature.as_ref(), strategy) {
        Ok(version) => {
            let audit_result = state.audit.append(
                NewAuditEntry {
                    tenant: String::new(),
                    subject: String::new(),
                    tool: String::new(),
                    event: AuditEvent::BundleApplied,
                    rule: None,
                    args: None,
                    result_meta: json!({"version": version}),
                    request_id: None,
                },
                now_ms(),
            );
            match audit_result {
                Ok(_) => Json(json!({"version": version})).into_response(),
                Err(e) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": format!("bundle applied but audit store unavailable: {e}")})),
                )
                    .into_response(),
            }
        }
        Err(e) => {
            let audit_result = state.audit.append(
                NewAuditEntry {
                    tenant: String::new(),
                    subject: String::new(),
                    tool: String::new(),
                    event: AuditEvent::BundleApplyFailed,
                    rule: None,
                    args: None,
                    result_meta: json!({"error": e.to_string()}),
                    request_id: None,
                },
                now_ms(),
            );
            if let Err(audit_err) = audit_result {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": format!("bundle apply failed ({e}); audit store also unavailable: {audit_err}")})),
                )
                    .into_response();
            }
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuditRangeQuery {
    #[serde(default, alias = "frm")]
    from: Option<u64>,
    #[serde(default)]
    to: Option<u64>,
}

async fn read_audit(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<AuditRangeQuery>,
) -> Response {
    if let Err(e) = authenticate(&state, &headers).await.and_then(|p| require_role(&p, Role::Viewer)) {
        return (status_for(&e), Json(json!({"error": e.to_string()}))).into_response();
    }
    let from = q.from.unwrap_or(0);
    let to = q.to.unwrap_or(u64::MAX);
    match state.audit.read_range(from, to) {
        Ok(entries) => Json(json!({"entries": entries})).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn metrics(State(state): State<Arc<GatewayState>>) -> Response {
    match state.metrics.encode() {
        Ok(text) => ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<GatewayState>>) -> StatusCode {
    if state.policy.rollout_snapshot().active_version.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}
