//! The closed predicate DSL evaluated inside a rule's `where` clause.
//!
//! Each predicate is compiled once, at bundle load, into a tagged [`Predicate`]
//! variant. Evaluation never fails: a predicate whose argument is missing or
//! of the wrong shape explains itself with `ok: false` rather than raising an
//! error, so a single malformed tool call can never crash the evaluator.

use gateway_core::tool_call::ToolCall;
use serde::Serialize;
use serde_yaml::Value as YamlValue;

use crate::error::PolicyError;

/// One compiled predicate from a rule's `where` clause.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// `host_in: [...]` — host of `arguments.url` must be one of these.
    HostIn(Vec<String>),
    /// `host_not_in: [...]` — host of `arguments.url` must not be one of these.
    HostNotIn(Vec<String>),
    /// `method: <VERB>` — HTTP method equality.
    Method(String),
    /// `body_bytes_over: N` — `arguments.body` byte length exceeds N.
    BodyBytesOver(u64),
    /// `path_under: [...]` — `arguments.path` has one of these prefixes.
    PathUnder(Vec<String>),
    /// `path_not_under: [...]` — `arguments.path` has none of these prefixes.
    PathNotUnder(Vec<String>),
    /// `estimated_cost_usd_over: N` — `arguments.estimated_cost_usd` exceeds N.
    EstimatedCostUsdOver(f64),
    /// `provider: <NAME>` — equality for `cloud.ops`/`cloud.estimate` calls.
    Provider(String),
    /// `resource: <NAME>` — equality for `cloud.ops`/`cloud.estimate` calls.
    Resource(String),
    /// `action: <NAME>` — equality for `cloud.ops`/`cloud.estimate` calls.
    Action(String),
}

/// One `{ok, msg}` explanation for a single predicate, part of a rule's trace.
#[derive(Debug, Clone, Serialize)]
pub struct PredicateExplain {
    /// Whether the predicate held for this call.
    pub ok: bool,
    /// Human-readable explanation, safe to return from the simulator.
    pub msg: String,
}

fn url_host(call: &ToolCall) -> Option<String> {
    let url = call.arg_str("url")?;
    // A minimal host extractor: strip scheme, take up to the next '/', ':', '?', or '#'.
    let rest = url.split("://").nth(1).unwrap_or(url);
    let end = rest
        .find(|c| matches!(c, '/' | ':' | '?' | '#'))
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

impl Predicate {
    /// Compile one `(key, value)` pair from a raw `where` mapping into a
    /// [`Predicate`]. Returns [`PolicyError::Malformed`] for unknown keys or
    /// mistyped values — this is the only point at which the DSL can fail;
    /// once compiled, evaluation is infallible.
    pub fn compile(key: &str, value: &YamlValue) -> Result<Self, PolicyError> {
        fn string_list(key: &str, value: &YamlValue) -> Result<Vec<String>, PolicyError> {
            value
                .as_sequence()
                .ok_or_else(|| PolicyError::Malformed(format!("{key} must be a list of strings")))?
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        PolicyError::Malformed(format!("{key} entries must be strings"))
                    })
                })
                .collect()
        }
        fn string_val(key: &str, value: &YamlValue) -> Result<String, PolicyError> {
            value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| PolicyError::Malformed(format!("{key} must be a string")))
        }
        fn num_val(key: &str, value: &YamlValue) -> Result<f64, PolicyError> {
            value
                .as_f64()
                .ok_or_else(|| PolicyError::Malformed(format!("{key} must be a number")))
        }

        match key {
            "host_in" => Ok(Self::HostIn(string_list(key, value)?)),
            "host_not_in" => Ok(Self::HostNotIn(string_list(key, value)?)),
            "method" => Ok(Self::Method(string_val(key, value)?)),
            "body_bytes_over" => Ok(Self::BodyBytesOver(num_val(key, value)? as u64)),
            "path_under" => Ok(Self::PathUnder(string_list(key, value)?)),
            "path_not_under" => Ok(Self::PathNotUnder(string_list(key, value)?)),
            "estimated_cost_usd_over" => Ok(Self::EstimatedCostUsdOver(num_val(key, value)?)),
            "provider" => Ok(Self::Provider(string_val(key, value)?)),
            "resource" => Ok(Self::Resource(string_val(key, value)?)),
            "action" => Ok(Self::Action(string_val(key, value)?)),
            other => Err(PolicyError::Malformed(format!("unknown predicate '{other}'"))),
        }
    }

    /// Evaluate against a tool call, producing an explanation that never panics.
    #[must_use]
    pub fn evaluate(&self, call: &ToolCall) -> PredicateExplain {
        match self {
            Self::HostIn(hosts) => match url_host(call) {
                Some(h) if hosts.iter().any(|allowed| allowed == &h) => {
                    PredicateExplain { ok: true, msg: format!("host '{h}' allowed") }
                }
                Some(h) => PredicateExplain { ok: false, msg: format!("host '{h}' not in allowlist") },
                None => PredicateExplain { ok: false, msg: "arguments.url missing or unparsable".into() },
            },
            Self::HostNotIn(hosts) => match url_host(call) {
                Some(h) if hosts.iter().any(|blocked| blocked == &h) => {
                    PredicateExplain { ok: false, msg: format!("host '{h}' is blocked") }
                }
                Some(h) => PredicateExplain { ok: true, msg: format!("host '{h}' not blocked") },
                None => PredicateExplain { ok: false, msg: "arguments.url missing or unparsable".into() },
            },
            Self::Method(expected) => match call.arg_str("method") {
                Some(m) if m.eq_ignore_ascii_case(expected) => {
                    PredicateExplain { ok: true, msg: format!("method '{m}' matches") }
                }
                Some(m) => PredicateExplain { ok: false, msg: format!("method '{m}' != '{expected}'") },
                None => PredicateExplain { ok: false, msg: "arguments.method missing".into() },
            },
            Self::BodyBytesOver(n) => match call.arguments.get("body").and_then(serde_json::Value::as_str) {
                Some(body) => {
                    let len = body.len() as u64;
                    if len > *n {
                        PredicateExplain { ok: true, msg: format!("body {len} bytes > {n}") }
                    } else {
                        PredicateExplain { ok: false, msg: format!("body {len} bytes <= {n}") }
                    }
                }
                None => PredicateExplain { ok: false, msg: "arguments.body missing".into() },
            },
            Self::PathUnder(prefixes) => match call.arg_str("path") {
                Some(p) if prefixes.iter().any(|pre| p.starts_with(pre.as_str())) => {
                    PredicateExplain { ok: true, msg: format!("path '{p}' is under an allowed prefix") }
                }
                Some(p) => PredicateExplain { ok: false, msg: format!("path '{p}' not under any listed prefix") },
                None => PredicateExplain { ok: false, msg: "arguments.path missing".into() },
            },
            Self::PathNotUnder(prefixes) => match call.arg_str("path") {
                Some(p) if prefixes.iter().any(|pre| p.starts_with(pre.as_str())) => {
                    PredicateExplain { ok: false, msg: format!("path '{p}' is under a listed prefix") }
                }
                Some(p) => PredicateExplain { ok: true, msg: format!("path '{p}' outside listed prefixes") },
                None => PredicateExplain { ok: false, msg: "arguments.path missing".into() },
            },
            Self::EstimatedCostUsdOver(threshold) => match call.estimated_cost_usd() {
                Some(cost) if cost > *threshold => {
                    PredicateExplain { ok: true, msg: format!("estimated cost {cost} > {threshold}") }
                }
                Some(cost) => PredicateExplain { ok: false, msg: format!("estimated cost {cost} <= {threshold}") },
                None => PredicateExplain { ok: false, msg: "arguments.estimated_cost_usd missing".into() },
            },
            Self::Provider(expected) => eq_field(call, "provider", expected),
            Self::Resource(expected) => eq_field(call, "resource", expected),
            Self::Action(expected) => eq_field(call, "action", expected),
        }
    }
}

fn eq_field(call: &ToolCall, field: &str, expected: &str) -> PredicateExplain {
    match call.arg_str(field) {
        Some(v) if v == expected => PredicateExplain { ok: true, msg: format!("{field} '{v}' matches") },
        Some(v) => PredicateExplain { ok: false, msg: format!("{field} '{v}' != '{expected}'") },
        None => PredicateExplain { ok: false, msg: format!("arguments.{field} missing") },
    }
}
