//! Built-in tool catalog (§6 "Built-in tools") and the `cloud.estimate`
//! static price book.
//!
//! The gateway mediates tool calls; it never executes them (§1 non-goal).
//! `cloud.estimate` is the one exception worth modeling here: §6 specifies
//! its reply shape directly (`{estimated_cost_usd, unit, usd_per_unit,
//! source}`), so answering it is itself the "tool call" — there is no
//! downstream executor to hand off to.

use std::collections::HashMap;

use gateway_core::tool_call::ToolCall;
use serde::Serialize;

/// Every tool name the gateway recognizes for `tools/list` (§6).
pub const BUILTIN_TOOLS: &[&str] =
    &["net.http", "fs.read", "fs.write", "mail.send", "cloud.ops", "cloud.estimate"];

/// `cloud.estimate` is never gated for approval (§6): the pipeline special-
/// cases this tool name and answers it directly from the price book,
/// bypassing policy evaluation entirely.
#[must_use]
pub fn is_estimate_only(tool: &str) -> bool {
    tool == "cloud.estimate"
}

/// One price-book row: cost per unit for a `(provider, action)` pair.
#[derive(Debug, Clone, Copy)]
pub struct PriceEntry {
    /// Cost of a single unit, in USD.
    pub usd_per_unit: f64,
    /// Unit name surfaced in the reply (`"hour"`, `"gb"`, `"request"`, ...).
    pub unit: &'static str,
}

/// Result of a `cloud.estimate` lookup (§6 reply shape).
#[derive(Debug, Clone, Serialize)]
pub struct EstimateResult {
    /// `usd_per_unit * quantity`.
    pub estimated_cost_usd: f64,
    /// Unit the price book prices in.
    pub unit: String,
    /// Per-unit price used.
    pub usd_per_unit: f64,
    /// Provenance tag for the price, for operator trust.
    pub source: String,
}

/// A static `(provider, action) -> price` table, loaded once at startup. A
/// production deployment would source this from a pricing feed; the gateway
/// only needs a stable lookup to honor the predicate DSL's
/// `estimated_cost_usd_over` and the `cloud.estimate` reply contract.
pub struct PriceBook {
    entries: HashMap<(String, String), PriceEntry>,
    source: String,
}

impl PriceBook {
    /// Build the default, built-in price book.
    #[must_use]
    pub fn default_book() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ("aws".to_string(), "ec2.run_instances".to_string()),
            PriceEntry { usd_per_unit: 0.096, unit: "hour" },
        );
        entries.insert(
            ("aws".to_string(), "s3.put_object".to_string()),
            PriceEntry { usd_per_unit: 0.023, unit: "gb" },
        );
        entries.insert(
            ("gcp".to_string(), "compute.instances.insert".to_string()),
            PriceEntry { usd_per_unit: 0.085, unit: "hour" },
        );
        entries.insert(
            ("azure".to_string(), "vm.create".to_string()),
            PriceEntry { usd_per_unit: 0.104, unit: "hour" },
        );
        Self { entries, source: "static-book-v1".to_string() }
    }

    /// Look up a price and multiply by `quantity` (default `1.0` when the
    /// call does not declare one).
    #[must_use]
    pub fn estimate(&self, provider: &str, action: &str, quantity: f64) -> Option<EstimateResult> {
        let entry = self.entries.get(&(provider.to_string(), action.to_string()))?;
        Some(EstimateResult {
            estimated_cost_usd: entry.usd_per_unit * quantity,
            unit: entry.unit.to_string(),
            usd_per_unit: entry.usd_per_unit,
            source: self.source.clone(),
        })
    }

    /// Answer a `cloud.estimate` [`ToolCall`] directly from `arguments.provider`
    /// / `arguments.action` / `arguments.quantity` (default `1.0`).
    #[must_use]
    pub fn estimate_call(&self, call: &ToolCall) -> Option<EstimateResult> {
        let provider = call.arg_str("provider")?;
        let action = call.arg_str("action")?;
        let quantity = call.arguments.get("quantity").and_then(serde_json::Value::as_f64).unwrap_or(1.0);
        self.estimate(provider, action, quantity)
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::default_book()
    }
}

/// Convention mapping a tool name to the named budget it debits on `allow`
/// (§4.3 "Budget debit" names a budget per `(tenant, budget_name, period)`
/// but spec.md does not say which `budget_name` a given tool uses; S4 gates
/// `cloud.ops` against a `cloud_usd` budget, so the gateway derives the name
/// from the tool's leading segment — `cloud.ops` / `cloud.estimate` share
/// `cloud_usd`, `net.http` debits `net_usd`, and so on. Recorded as an open
/// decision in DESIGN.md.
#[must_use]
pub fn budget_name_for_tool(tool: &str) -> String {
    format!("{}_usd", tool.split('.').next().unwrap_or(tool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn estimate_known_pair() {
        let book = PriceBook::default_book();
        let r = book.estimate("aws", "ec2.run_instances", 3.0).unwrap();
        assert!((r.estimated_cost_usd - 0.288).abs() < 1e-9);
        assert_eq!(r.unit, "hour");
    }

    #[test]
    fn unknown_pair_is_none() {
        let book = PriceBook::default_book();
        assert!(book.estimate("oracle", "nonexistent", 1.0).is_none());
    }

    #[test]
    fn estimate_call_defaults_quantity_to_one() {
        let book = PriceBook::default_book();
        let call = ToolCall::new(
            "acme",
            "agent-1",
            "cloud.estimate",
            json!({"provider": "aws", "action": "s3.put_object"}),
            "r1",
        );
        let r = book.estimate_call(&call).unwrap();
        assert!((r.estimated_cost_usd - 0.023).abs() < 1e-9);
    }

    #[test]
    fn budget_name_derivation() {
        assert_eq!(budget_name_for_tool("cloud.ops"), "cloud_usd");
        assert_eq!(budget_name_for_tool("cloud.estimate"), "cloud_usd");
        assert_eq!(budget_name_for_tool("net.http"), "net_usd");
    }

    #[test]
    fn is_estimate_only_exempts_cloud_estimate() {
        assert!(is_estimate_only("cloud.estimate"));
        assert!(!is_estimate_only("cloud.ops"));
    }
}
