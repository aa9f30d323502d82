//! Per-tenant token-bucket admission and atomic daily/weekly cost-budget
//! debit (§4.3). Both are built on [`gateway_core::store::CoordinatingStore`]
//! so a single-process test run and a horizontally scaled deployment share
//! the same ledger semantics.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use gateway_core::store::CoordinatingStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure modes of the rate/budget ledger.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Token-bucket admission failed; no tokens available.
    #[error("rate limited")]
    RateLimited,
    /// A debit would exceed the budget's `limit_usd` for its period.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    /// No QPS configured for the tenant (treated as unlimited, never returned
    /// by `admit`, kept for completeness of the error taxonomy).
    #[error("no rate limit configured for tenant")]
    Unconfigured,
}

/// One tenant's rate-limit configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Refill rate in tokens/sec, also the bucket capacity.
    pub capacity_qps: f64,
}

/// One named budget's configuration (§4.3 "Configurability").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Budget name, e.g. `cloud_usd`.
    pub name: String,
    /// Reset cadence.
    pub period: Period,
    /// Ceiling in USD for the period.
    pub limit_usd: f64,
}

/// Reset cadence for a named budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Resets at UTC midnight.
    Day,
    /// Resets at the start of the ISO week.
    Week,
}

impl Period {
    /// The period key for `now` (a UTC day or ISO-week string), used as part
    /// of the `(tenant, budget, period_key)` ledger key (§3 "BudgetCounter").
    #[must_use]
    pub fn period_key(self, now_ms: u64) -> String {
        let secs = (now_ms / 1000) as i64;
        let dt = time::OffsetDateTime::from_unix_timestamp(secs).unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
        match self {
            Period::Day => format!("{:04}-{:02}-{:02}", dt.year(), u8::from(dt.month()), dt.day()),
            Period::Week => {
                let iso = dt.to_iso_week_date();
                format!("{:04}-W{:02}", iso.0, iso.1)
            }
        }
    }
}

const USD_SCALE: f64 = 1_000_000.0;

fn to_micros(usd: f64) -> i64 {
    (usd * USD_SCALE).round() as i64
}

fn from_micros(micros: i64) -> f64 {
    micros as f64 / USD_SCALE
}

/// Per-tenant configuration registry, mutated by the admin API (§4.10) and
/// read by [`Ledger`] on every call. Missing QPS/budget entries mean
/// unlimited, per §4.3.
#[derive(Default)]
pub struct TenantConfig {
    rate_limits: RwLock<HashMap<String, RateLimitConfig>>,
    budgets: RwLock<HashMap<(String, String), BudgetConfig>>,
}

impl TenantConfig {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) a tenant's QPS.
    pub fn set_rate_limit(&self, tenant: &str, capacity_qps: f64) {
        self.rate_limits
            .write()
            .expect("tenant config lock poisoned")
            .insert(tenant.to_string(), RateLimitConfig { capacity_qps });
    }

    /// Read a tenant's QPS, if configured.
    #[must_use]
    pub fn rate_limit(&self, tenant: &str) -> Option<RateLimitConfig> {
        self.rate_limits.read().expect("tenant config lock poisoned").get(tenant).copied()
    }

    /// Create or replace a named budget for a tenant.
    pub fn set_budget(&self, tenant: &str, budget: BudgetConfig) {
        self.budgets
            .write()
            .expect("tenant config lock poisoned")
            .insert((tenant.to_string(), budget.name.clone()), budget);
    }

    /// Read a tenant's named budget, if configured.
    #[must_use]
    pub fn budget(&self, tenant: &str, name: &str) -> Option<BudgetConfig> {
        self.budgets
            .read()
            .expect("tenant config lock poisoned")
            .get(&(tenant.to_string(), name.to_string()))
            .cloned()
    }
}

/// The rate-limit and budget ledger (§4.3 "Rate & Budget Ledger", C3).
pub struct Ledger {
    store: Arc<CoordinatingStore>,
    config: Arc<TenantConfig>,
}

impl Ledger {
    /// Construct a ledger backed by the given coordinating store and tenant
    /// configuration registry.
    #[must_use]
    pub fn new(store: Arc<CoordinatingStore>, config: Arc<TenantConfig>) -> Self {
        Self { store, config }
    }

    fn bucket_key(tenant: &str) -> String {
        format!("ratebucket:{tenant}")
    }

    /// Admit or reject one call for `tenant` at `now_ms`. Refills the bucket
    /// by `(now - last_refill) * qps` capped at capacity, then consumes one
    /// token if available (§4.3 "Token bucket"). A tenant with no configured
    /// QPS is unlimited and always admitted.
    pub async fn admit(&self, tenant: &str, now_ms: u64) -> Result<(), LedgerError> {
        let Some(cfg) = self.config.rate_limit(tenant) else {
            return Ok(());
        };
        let key = Self::bucket_key(tenant);
        let admitted = self
            .store
            .transact(&key, |current| {
                let (tokens, last_refill_ms) = match current {
                    Some(bytes) => decode_bucket(bytes),
                    None => (cfg.capacity_qps, now_ms),
                };
                let elapsed_s = now_ms.saturating_sub(last_refill_ms) as f64 / 1000.0;
                let refilled = (tokens + elapsed_s * cfg.capacity_qps).min(cfg.capacity_qps);
                if refilled >= 1.0 {
                    let remaining = refilled - 1.0;
                    (encode_bucket(remaining, now_ms), true)
                } else {
                    (encode_bucket(refilled, now_ms), false)
                }
            })
            .await;
        if admitted {
            Ok(())
        } else {
            Err(LedgerError::RateLimited)
        }
    }

    fn budget_key(tenant: &str, budget: &str, period_key: &str) -> String {
        format!("budget:{tenant}:{budget}:{period_key}")
    }

    /// Atomically debit `amount_usd` from `(tenant, budget, now)`'s current
    /// period counter, succeeding iff `used + amount <= limit` (§4.3 "Budget
    /// debit"). A tenant with no configured budget of that name is unlimited.
    pub async fn debit(
        &self,
        tenant: &str,
        budget_name: &str,
        amount_usd: f64,
        now_ms: u64,
    ) -> Result<(), LedgerError> {
        let Some(cfg) = self.config.budget(tenant, budget_name) else {
            return Ok(());
        };
        let period_key = cfg.period.period_key(now_ms);
        let key = Self::budget_key(tenant, budget_name, &period_key);
        let limit_micros = to_micros(cfg.limit_usd);
        let delta = to_micros(amount_usd);
        match self.store.incr_bounded(&key, delta, limit_micros).await {
            Some(_) => Ok(()),
            None => Err(LedgerError::BudgetExceeded(format!(
                "{budget_name} limit {:.2} exceeded for period {period_key}",
                cfg.limit_usd
            ))),
        }
    }

    /// Refund `amount_usd` previously debited, clamped so `used_usd` never
    /// goes below zero (§4.3 "On downstream failure ... the amount is
    /// refunded").
    pub async fn refund(&self, tenant: &str, budget_name: &str, amount_usd: f64, now_ms: u64) {
        let Some(cfg) = self.config.budget(tenant, budget_name) else {
            return;
        };
        let period_key = cfg.period.period_key(now_ms);
        let key = Self::budget_key(tenant, budget_name, &period_key);
        let delta = to_micros(amount_usd);
        let limit_micros = to_micros(cfg.limit_usd);
        // Refund is a negative, bounded debit; clamp to 0 by retrying against
        // the floor if the naive subtraction would go negative.
        if self.store.incr_bounded(&key, -delta, limit_micros).await.is_none() {
            let current = self.store.read_int(&key).await;
            let _ = self.store.cas_int(&key, current, 0).await;
        }
    }

    /// Current `used_usd` for `(tenant, budget, now)`'s period, for
    /// diagnostics and tests.
    pub async fn used_usd(&self, tenant: &str, budget_name: &str, now_ms: u64) -> f64 {
        let Some(cfg) = self.config.budget(tenant, budget_name) else {
            return 0.0;
        };
        let period_key = cfg.period.period_key(now_ms);
        let key = Self::budget_key(tenant, budget_name, &period_key);
        from_micros(self.store.read_int(&key).await)
    }
}

fn encode_bucket(tokens: f64, last_refill_ms: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&tokens.to_le_bytes());
    buf.extend_from_slice(&last_refill_ms.to_le_bytes());
    buf
}

fn decode_bucket(bytes: &[u8]) -> (f64, u64) {
    let tokens = f64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
    let last_refill_ms = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default());
    (tokens, last_refill_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (Ledger, Arc<TenantConfig>) {
        let config = Arc::new(TenantConfig::new());
        let store = Arc::new(CoordinatingStore::new());
        (Ledger::new(store, config.clone()), config)
    }

    #[tokio::test]
    async fn unconfigured_tenant_is_unlimited() {
        let (ledger, _cfg) = ledger();
        for _ in 0..50 {
            assert!(ledger.admit("nobody", 0).await.is_ok());
        }
    }

    #[tokio::test]
    async fn token_bucket_boundary_zero_with_no_elapsed_time_rejects() {
        let (ledger, cfg) = ledger();
        cfg.set_rate_limit("acme", 1.0);
        assert!(ledger.admit("acme", 0).await.is_ok());
        assert!(matches!(ledger.admit("acme", 0).await, Err(LedgerError::RateLimited)));
    }

    #[tokio::test]
    async fn token_bucket_admits_again_after_one_over_qps_seconds() {
        let (ledger, cfg) = ledger();
        cfg.set_rate_limit("acme", 2.0);
        assert!(ledger.admit("acme", 0).await.is_ok());
        assert!(ledger.admit("acme", 0).await.is_ok());
        assert!(matches!(ledger.admit("acme", 0).await, Err(LedgerError::RateLimited)));
        assert!(ledger.admit("acme", 500).await.is_ok());
    }

    #[tokio::test]
    async fn burst_tolerance_is_capacity_plus_one() {
        let (ledger, cfg) = ledger();
        cfg.set_rate_limit("acme", 5.0);
        let mut admitted = 0;
        for _ in 0..10 {
            if ledger.admit("acme", 0).await.is_ok() {
                admitted += 1;
            }
        }
        assert!(admitted as f64 <= 5.0 + 1.0);
    }

    #[tokio::test]
    async fn s4_budget_debit_then_exceeded() {
        let (ledger, cfg) = ledger();
        cfg.set_budget("acme", BudgetConfig { name: "cloud_usd".into(), period: Period::Day, limit_usd: 15.0 });
        ledger.debit("acme", "cloud_usd", 12.0, 0).await.unwrap();
        assert_eq!(ledger.used_usd("acme", "cloud_usd", 0).await, 12.0);
        let err = ledger.debit("acme", "cloud_usd", 9.0, 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::BudgetExceeded(_)));
        assert_eq!(ledger.used_usd("acme", "cloud_usd", 0).await, 12.0);
    }

    #[tokio::test]
    async fn boundary_exact_remaining_succeeds_one_cent_more_fails() {
        let (ledger, cfg) = ledger();
        cfg.set_budget("acme", BudgetConfig { name: "b".into(), period: Period::Day, limit_usd: 10.0 });
        ledger.debit("acme", "b", 7.0, 0).await.unwrap();
        ledger.debit("acme", "b", 3.0, 0).await.unwrap();
        let err = ledger.debit("acme", "b", 0.01, 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::BudgetExceeded(_)));
    }

    #[tokio::test]
    async fn refund_clamps_to_zero() {
        let (ledger, cfg) = ledger();
        cfg.set_budget("acme", BudgetConfig { name: "b".into(), period: Period::Day, limit_usd: 10.0 });
        ledger.debit("acme", "b", 4.0, 0).await.unwrap();
        ledger.refund("acme", "b", 10.0, 0).await;
        assert_eq!(ledger.used_usd("acme", "b", 0).await, 0.0);
    }

    #[tokio::test]
    async fn isolation_between_tenants() {
        let (ledger, cfg) = ledger();
        cfg.set_budget("acme", BudgetConfig { name: "b".into(), period: Period::Day, limit_usd: 1.0 });
        cfg.set_budget("other", BudgetConfig { name: "b".into(), period: Period::Day, limit_usd: 1.0 });
        ledger.debit("acme", "b", 1.0, 0).await.unwrap();
        assert!(ledger.debit("acme", "b", 0.01, 0).await.is_err());
        assert!(ledger.debit("other", "b", 1.0, 0).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_debits_never_exceed_limit() {
        let (ledger, cfg) = ledger();
        cfg.set_budget("acme", BudgetConfig { name: "b".into(), period: Period::Day, limit_usd: 10.0 });
        let ledger = Arc::new(ledger);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let l = ledger.clone();
            handles.push(tokio::spawn(async move { l.debit("acme", "b", 1.0, 0).await.is_ok() }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert!(successes as f64 <= 10.0);
        assert_eq!(ledger.used_usd("acme", "b", 0).await, successes as f64);
    }
}
