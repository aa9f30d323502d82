//! Durable pending-approval store, dual-control tally, and pub/sub
//! resolution (§4.4, C4).
//!
//! A [`PendingApproval`] moves through the state machine described in §4.4:
//! `pending -> allow` once enough distinct approvers recorded `approve`,
//! `pending -> deny` immediately on any `deny` (deny precedence), or
//! `pending -> expired` once the TTL has elapsed with no terminal decision.
//! Terminal states are sticky: once reached, later decisions are no-ops.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gateway_core::store::CoordinatingStore;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while creating or recording a decision on an approval.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    /// The referenced `pending_id` has no record.
    #[error("no pending approval with id {0}")]
    NotFound(String),
}

/// Action an approver recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverAction {
    /// Counts toward `required_approvals`.
    Approve,
    /// Immediately terminal (deny precedence, §4.4).
    Deny,
}

/// One approver's recorded decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproverDecision {
    /// What the approver recorded.
    pub action: ApproverAction,
    /// When it was recorded, ms since epoch.
    pub ts: u64,
}

/// Terminal/non-terminal status of a [`PendingApproval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting enough approvals or a deny.
    Pending,
    /// Terminal: enough approvers recorded `approve` and nobody denied.
    Allow,
    /// Terminal: at least one approver recorded `deny`.
    Deny,
    /// Terminal: TTL elapsed with no terminal decision.
    Expired,
}

impl ApprovalStatus {
    /// Terminal states are sticky; only `Pending` transitions further.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// A durable record of an `approval` decision awaiting human input (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Unique identifier, also the coordinating-store key suffix.
    pub pending_id: Uuid,
    /// Tenant the originating tool call belongs to.
    pub tenant: String,
    /// Subject that issued the original tool call.
    pub requester: String,
    /// Tool name being gated.
    pub tool: String,
    /// Original call arguments, echoed back for operator review.
    pub arguments: JsonValue,
    /// Human-readable summary shown in chat callbacks.
    pub summary: String,
    /// Number of distinct `approve` decisions required.
    pub required_approvals: u32,
    /// Named approver group, if the rule declared one.
    pub approver_group: Option<String>,
    /// At most one decision per approver id.
    pub decisions: HashMap<String, ApproverDecision>,
    /// Current (possibly terminal) status.
    pub status: ApprovalStatus,
    /// Creation time, ms since epoch.
    pub created_ts: u64,
    /// Time-to-live in seconds from `created_ts`.
    pub ttl_seconds: u64,
    /// Estimated cost, if the tool declared one (carried for the pipeline's
    /// deferred budget debit on eventual `allow`).
    pub estimated_cost_usd: Option<f64>,
}

impl PendingApproval {
    fn deadline_ms(&self) -> u64 {
        self.created_ts.saturating_add(self.ttl_seconds.saturating_mul(1000))
    }

    fn recompute(&mut self, now_ms: u64) {
        if self.status.is_terminal() {
            return;
        }
        if self.decisions.values().any(|d| d.action == ApproverAction::Deny) {
            self.status = ApprovalStatus::Deny;
        } else if self
            .decisions
            .values()
            .filter(|d| d.action == ApproverAction::Approve)
            .count() as u32
            >= self.required_approvals
        {
            self.status = ApprovalStatus::Allow;
        } else if now_ms > self.deadline_ms() {
            self.status = ApprovalStatus::Expired;
        }
    }
}

/// Request to create a new pending approval (§4.5 step 5 "approval" branch).
#[derive(Debug, Clone)]
pub struct NewApproval {
    /// Caller-chosen id; creation is idempotent on this id.
    pub pending_id: Uuid,
    /// Tenant.
    pub tenant: String,
    /// Requesting subject.
    pub requester: String,
    /// Tool name.
    pub tool: String,
    /// Call arguments.
    pub arguments: JsonValue,
    /// Human summary.
    pub summary: String,
    /// Required approver count.
    pub required_approvals: u32,
    /// Approver group, if any.
    pub approver_group: Option<String>,
    /// TTL in seconds.
    pub ttl_seconds: u64,
    /// Estimated cost, if any.
    pub estimated_cost_usd: Option<f64>,
}

/// Durable pending-approval store (§4.4, C4). Built on the same
/// [`CoordinatingStore`] the budget ledger uses, so both share storage and
/// pub/sub semantics in the single-process test configuration.
#[derive(Clone)]
pub struct ApprovalStore {
    store: Arc<CoordinatingStore>,
}

fn record_key(pending_id: Uuid) -> String {
    format!("approval:{pending_id}")
}

fn channel_name(pending_id: Uuid) -> String {
    format!("approval-resolved:{pending_id}")
}

impl ApprovalStore {
    /// Construct a store backed by `store`.
    #[must_use]
    pub fn new(store: Arc<CoordinatingStore>) -> Self {
        Self { store }
    }

    /// Create a pending approval, idempotently: a second `create` for the
    /// same `pending_id` returns the already-stored record unchanged.
    pub async fn create(&self, req: NewApproval, now_ms: u64) -> PendingApproval {
        let key = record_key(req.pending_id);
        self.store
            .transact(&key, |current| {
                if let Some(bytes) = current {
                    if let Ok(existing) = serde_json::from_slice::<PendingApproval>(bytes) {
                        let encoded = serde_json::to_vec(&existing).unwrap_or_default();
                        return (encoded, existing);
                    }
                }
                let record = PendingApproval {
                    pending_id: req.pending_id,
                    tenant: req.tenant,
                    requester: req.requester,
                    tool: req.tool,
                    arguments: req.arguments,
                    summary: req.summary,
                    required_approvals: req.required_approvals.max(1),
                    approver_group: req.approver_group,
                    decisions: HashMap::new(),
                    status: ApprovalStatus::Pending,
                    created_ts: now_ms,
                    ttl_seconds: req.ttl_seconds,
                    estimated_cost_usd: req.estimated_cost_usd,
                };
                let encoded = serde_json::to_vec(&record).unwrap_or_default();
                (encoded, record)
            })
            .await
    }

    /// Read the current record, lazily applying the TTL-expiry transition if
    /// the deadline has passed and no terminal decision was yet taken.
    pub async fn get(&self, pending_id: Uuid, now_ms: u64) -> Result<PendingApproval, ApprovalError> {
        let key = record_key(pending_id);
        let result = self
            .store
            .transact(&key, |current| match current.and_then(|b| serde_json::from_slice::<PendingApproval>(b).ok()) {
                Some(mut record) => {
                    record.recompute(now_ms);
                    let encoded = serde_json::to_vec(&record).unwrap_or_default();
                    (encoded, Some(record))
                }
                None => (Vec::new(), None),
            })
            .await;
        result.ok_or_else(|| ApprovalError::NotFound(pending_id.to_string()))
    }

    /// Record one approver's decision, atomically: "at most one decision per
    /// approver; last write for that approver wins before terminal state"
    /// (§4.4). A decision arriving after the TTL deadline is rejected (the
    /// record transitions to `expired` instead of applying it). Publishes on
    /// the resolution channel if this call causes a terminal transition.
    pub async fn record_decision(
        &self,
        pending_id: Uuid,
        approver_id: &str,
        action: ApproverAction,
        now_ms: u64,
    ) -> Result<ApprovalStatus, ApprovalError> {
        let key = record_key(pending_id);
        let outcome = self
            .store
            .transact(&key, |current| match current.and_then(|b| serde_json::from_slice::<PendingApproval>(b).ok()) {
                Some(mut record) => {
                    let was_terminal = record.status.is_terminal();
                    if !was_terminal {
                        if now_ms > record.deadline_ms() {
                            record.status = ApprovalStatus::Expired;
                        } else {
                            record
                                .decisions
                                .insert(approver_id.to_string(), ApproverDecision { action, ts: now_ms });
                            record.recompute(now_ms);
                        }
                    }
                    let became_terminal = !was_terminal && record.status.is_terminal();
                    let encoded = serde_json::to_vec(&record).unwrap_or_default();
                    (encoded, Some((record.status, became_terminal)))
                }
                None => (Vec::new(), None),
            })
            .await;
        let (status, became_terminal) =
            outcome.ok_or_else(|| ApprovalError::NotFound(pending_id.to_string()))?;
        if became_terminal {
            self.store.publish(&channel_name(pending_id), &format!("{status:?}")).await;
        }
        Ok(status)
    }

    /// Bounded wait for a terminal resolution (§4.4 "Wait API"). Subscribes
    /// to the resolution channel *before* re-reading state, so a resolution
    /// published between the initial read and the subscribe call can never
    /// be missed (design note §9 "Approval wait without lost wakeups").
    /// Returns the status observed at the end of the wait: terminal if
    /// resolved or expired within `timeout_ms`, otherwise whatever the
    /// record held at that point (ordinarily still `pending`, surfaced by
    /// the caller as `needs_approval`).
    pub async fn wait_for_resolution(
        &self,
        pending_id: Uuid,
        timeout_ms: u64,
        now_ms: u64,
    ) -> Result<ApprovalStatus, ApprovalError> {
        let mut rx = self.store.subscribe(&channel_name(pending_id));
        let initial = self.get(pending_id, now_ms).await?;
        if initial.status.is_terminal() {
            return Ok(initial.status);
        }
        if timeout_ms == 0 {
            return Ok(initial.status);
        }
        let _ = tokio::time::timeout(Duration::from_millis(timeout_ms), rx.recv()).await;
        let latest = self.get(pending_id, now_ms.saturating_add(timeout_ms)).await?;
        Ok(latest.status)
    }
}
