//! Signed policy bundle store and first-match evaluator (§4.1, §4.2).
//!
//! A [`PolicyBundle`] is an ordered list of compiled [`CompiledRule`]s plus a
//! fail-closed default. Bundles are immutable once loaded; the [`BundleStore`]
//! installs a new version behind an atomic pointer swap, and resolves a
//! tenant to a version via an explicit pin, a deterministic canary hash, or
//! the active version (§4.1 "Rollout resolution").

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod predicate;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use gateway_core::tool_call::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub use error::PolicyError;
pub use predicate::{Predicate, PredicateExplain};

/// The final verdict of evaluating a [`ToolCall`] against a [`PolicyBundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Proceed; the pipeline may still owe a budget debit.
    Allow,
    /// Block the call.
    Deny,
    /// Pause for human approval (§4.4).
    Approval,
}

/// One attempted rule during evaluation, recorded whether or not it matched.
#[derive(Debug, Clone, Serialize)]
pub struct RuleTrace {
    /// Rule name, in file order.
    pub rule: String,
    /// Whether this rule's `match` and `where` both held.
    pub matched: bool,
    /// Per-predicate explanations, in `where` declaration order.
    pub explain: Vec<PredicateExplain>,
}

/// Pure output of the evaluator: a [`DecisionKind`] plus the trail that
/// produced it (§3 "Decision").
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    /// The verdict.
    pub decision: DecisionKind,
    /// Name of the winning rule; `None` when the bundle default applied.
    pub rule_name: Option<String>,
    /// Human-readable reason, surfaced in deny/approval replies.
    pub reason: Option<String>,
    /// Required approver count, carried from the winning rule (default `1`).
    pub required_approvals: u32,
    /// Approver group name, carried from the winning rule, if any.
    pub approver_group: Option<String>,
    /// Every rule attempted up to and including the match.
    pub trace: Vec<RuleTrace>,
}

/// One rule as written in a bundle's YAML, before glob/predicate compilation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawRule {
    /// Rule name, used for `rule_name` and dedup in the trace.
    pub name: String,
    /// Exact tool name or glob pattern (`fs.*`) matched against `ToolCall.tool`.
    #[serde(rename = "match")]
    pub match_: String,
    /// Predicate set; all must hold (implicit AND). Empty means "always".
    #[serde(default, rename = "where")]
    pub where_: HashMap<String, serde_yaml::Value>,
    /// `allow`, `deny`, or `approval`.
    pub action: String,
    /// Reason surfaced to the caller and recorded on the audit entry.
    #[serde(default)]
    pub reason: Option<String>,
    /// Required approver count for `action: approval` (default `1`).
    #[serde(default)]
    pub required_approvals: Option<u32>,
    /// Named approver group for `action: approval`.
    #[serde(default)]
    pub approver_group: Option<String>,
}

/// A rule compiled once at bundle load: predicates parsed, glob compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Rule name.
    pub name: String,
    /// Whether `match` names a tool exactly (`false`) or is a glob (`true`).
    pub is_glob: bool,
    /// The raw match pattern, kept for glob construction and diagnostics.
    pub match_pattern: String,
    compiled_glob: Option<globset::GlobMatcher>,
    /// Compiled predicate set (implicit AND).
    pub predicates: Vec<(String, Predicate)>,
    /// Resulting action.
    pub action: DecisionKind,
    /// Reason text.
    pub reason: Option<String>,
    /// Required approvals (default `1`).
    pub required_approvals: u32,
    /// Approver group, if any.
    pub approver_group: Option<String>,
}

impl CompiledRule {
    fn compile(raw: &RawRule) -> Result<Self, PolicyError> {
        let action = match raw.action.as_str() {
            "allow" => DecisionKind::Allow,
            "deny" => DecisionKind::Deny,
            "approval" => DecisionKind::Approval,
            other => {
                return Err(PolicyError::Malformed(format!(
                    "rule '{}': action '{other}' must be allow|deny|approval",
                    raw.name
                )))
            }
        };
        if raw.name.trim().is_empty() {
            return Err(PolicyError::Malformed("rule name must not be empty".into()));
        }
        // §12 open-question resolution: exact match always takes precedence
        // over glob; a pattern containing a glob metacharacter compiles as a
        // glob, otherwise it is matched by plain string equality.
        let is_glob = raw.match_.contains(['*', '?', '[']);
        let compiled_glob = if is_glob {
            Some(
                globset::Glob::new(&raw.match_)
                    .map_err(|e| {
                        PolicyError::Malformed(format!(
                            "rule '{}': invalid glob '{}': {e}",
                            raw.name, raw.match_
                        ))
                    })?
                    .compile_matcher(),
            )
        } else {
            None
        };
        let mut predicates = Vec::with_capacity(raw.where_.len());
        for (key, value) in &raw.where_ {
            predicates.push((key.clone(), Predicate::compile(key, value)?));
        }
        // Deterministic predicate evaluation order regardless of map iteration.
        predicates.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            name: raw.name.clone(),
            is_glob,
            match_pattern: raw.match_.clone(),
            compiled_glob,
            predicates,
            action,
            reason: raw.reason.clone(),
            required_approvals: raw.required_approvals.unwrap_or(1),
            approver_group: raw.approver_group.clone(),
        })
    }

    fn name_matches(&self, tool: &str) -> bool {
        if self.is_glob {
            self.compiled_glob.as_ref().is_some_and(|g| g.is_match(tool))
        } else {
            self.match_pattern == tool
        }
    }
}

/// Bundle-level default, applied when no rule matches (§3 "fail-closed = deny").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    /// Must be `"deny"` to honor invariant 1 (fail-closed); any other value
    /// is rejected at load time by [`PolicyBundle::compile`].
    pub decision: String,
}

/// A bundle as written to YAML: version, defaults, and ordered rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BundleFile {
    /// Stable version identifier (e.g. `"v3"`, a date, a content hash).
    pub version: String,
    /// Bundle-level default decision.
    pub defaults: Defaults,
    /// Rules, evaluated first-match in this order.
    pub rules: Vec<RawRule>,
}

/// Companion `.sig` file shape (§6 "Policy bundle on disk").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignatureFile {
    /// Signature algorithm; always `"Ed25519"`.
    pub alg: String,
    /// Lowercase-hex SHA-256 of the canonicalized bundle bytes.
    pub sha256: String,
    /// Lowercase-hex Ed25519 signature over the raw bundle bytes.
    pub sig: String,
    /// Fingerprint of the public key used, for operator diagnostics.
    pub pubkey_fingerprint: String,
    /// RFC 3339 signing timestamp.
    pub created: String,
}

/// An immutable, loaded, signature-verified policy bundle.
#[derive(Debug, Clone)]
pub struct PolicyBundle {
    /// Stable version identifier.
    pub version: String,
    /// SHA-256 of the canonical bundle bytes, lowercase hex.
    pub sha256: String,
    /// Whether the signature was present and verified at load time.
    pub signature_verified: bool,
    defaults_deny: bool,
    /// Compiled rules, evaluated in file order.
    pub rules: Vec<CompiledRule>,
}

impl PolicyBundle {
    /// Canonicalize, hash, optionally verify, and compile a bundle from raw
    /// YAML bytes. `signature` is the parsed `.sig` companion, if any;
    /// `public_key` is required when `require_signature` is set.
    pub fn load(
        yaml_bytes: &[u8],
        signature: Option<&SignatureFile>,
        public_key: Option<&VerifyingKey>,
        require_signature: bool,
    ) -> Result<Self, PolicyError> {
        let file: BundleFile = serde_yaml::from_slice(yaml_bytes)
            .map_err(|e| PolicyError::Malformed(format!("invalid bundle YAML: {e}")))?;
        if file.defaults.decision != "deny" {
            return Err(PolicyError::Malformed(
                "defaults.decision must be 'deny' (fail-closed)".into(),
            ));
        }

        let digest = Sha256::digest(yaml_bytes);
        let sha256 = hex::encode(digest);

        let signature_verified = match (signature, public_key) {
            (Some(sig_file), Some(key)) => {
                if sig_file.sha256 != sha256 {
                    return Err(PolicyError::SignatureInvalid(
                        "signature sha256 does not match bundle bytes".into(),
                    ));
                }
                let sig_bytes = hex::decode(&sig_file.sig)
                    .map_err(|e| PolicyError::SignatureInvalid(format!("bad signature hex: {e}")))?;
                let sig_bytes: [u8; 64] = sig_bytes
                    .try_into()
                    .map_err(|_| PolicyError::SignatureInvalid("signature must be 64 bytes".into()))?;
                let sig = Signature::from_bytes(&sig_bytes);
                key.verify(yaml_bytes, &sig)
                    .map_err(|e| PolicyError::SignatureInvalid(format!("verification failed: {e}")))?;
                true
            }
            (None, _) if require_signature => {
                return Err(PolicyError::SignatureInvalid("signature required but missing".into()))
            }
            (Some(_), None) if require_signature => {
                return Err(PolicyError::SignatureInvalid(
                    "signature present but no public key configured".into(),
                ))
            }
            _ => false,
        };

        if require_signature && !signature_verified {
            return Err(PolicyError::SignatureInvalid("signature did not verify".into()));
        }

        let mut rules = Vec::with_capacity(file.rules.len());
        for raw in &file.rules {
            rules.push(CompiledRule::compile(raw)?);
        }

        Ok(Self { version: file.version, sha256, signature_verified, defaults_deny: true, rules })
    }
}

/// Sign bundle bytes with an Ed25519 key, producing the `.sig` companion.
/// Used by the offline signing tool (`gateway-cli policy sign`); the
/// pure-function form lets that CLI and tests share one code path.
pub fn sign_bundle(
    yaml_bytes: &[u8],
    signing_key: &ed25519_dalek::SigningKey,
    pubkey_fingerprint: String,
    created: String,
) -> SignatureFile {
    use ed25519_dalek::Signer;
    let sha256 = hex::encode(Sha256::digest(yaml_bytes));
    let sig = signing_key.sign(yaml_bytes);
    SignatureFile {
        alg: "Ed25519".into(),
        sha256,
        sig: hex::encode(sig.to_bytes()),
        pubkey_fingerprint,
        created,
    }
}

/// Evaluate a [`ToolCall`] against a [`PolicyBundle`] with first-match
/// semantics (§4.2, invariant 2).
#[must_use]
pub fn evaluate(bundle: &PolicyBundle, call: &ToolCall) -> Decision {
    let mut trace = Vec::new();
    for rule in &bundle.rules {
        if !rule.name_matches(&call.tool) {
            continue;
        }
        let explain: Vec<PredicateExplain> =
            rule.predicates.iter().map(|(_, p)| p.evaluate(call)).collect();
        let matched = explain.iter().all(|e| e.ok);
        trace.push(RuleTrace { rule: rule.name.clone(), matched, explain });
        if matched {
            return Decision {
                decision: rule.action,
                rule_name: Some(rule.name.clone()),
                reason: rule.reason.clone(),
                required_approvals: rule.required_approvals,
                approver_group: rule.approver_group.clone(),
                trace,
            };
        }
    }
    debug_assert!(bundle.defaults_deny, "bundle loader only accepts defaults.decision = deny");
    Decision {
        decision: DecisionKind::Deny,
        rule_name: None,
        reason: Some("no rule matched; fail-closed default".into()),
        required_approvals: 1,
        approver_group: None,
        trace,
    }
}

/// Single-row rollout state (§3 "Rollout").
#[derive(Debug, Clone, Default)]
pub struct Rollout {
    /// Always-installed bundle version.
    pub active_version: String,
    /// Optional canary version, tested per-tenant by hash.
    pub canary_version: Option<String>,
    /// Percentage `[0, 100)` of tenants routed to the canary.
    pub canary_percent: u8,
    /// Seed for the stable tenant hash; fixed per rollout for determinism.
    pub seed: u64,
    /// Explicit tenant -> version pins, which win over canary/active.
    pub pins: HashMap<String, String>,
}

/// A stable, process-independent 64-bit hash (FNV-1a) used to assign tenants
/// to the canary bucket deterministically (invariant 8 "Rollout determinism").
/// FNV-1a rather than a language-default hasher: it has no per-process
/// randomization, so the same `(seed, tenant)` hashes identically everywhere.
#[must_use]
pub fn stable_hash(seed: u64, tenant: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;
    let mut hash = FNV_OFFSET ^ seed;
    for byte in tenant.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl Rollout {
    /// Resolve which bundle version a tenant should see: explicit pin, then
    /// canary (if the tenant's hash falls under `canary_percent`), then active.
    #[must_use]
    pub fn resolve(&self, tenant: &str) -> &str {
        if let Some(pinned) = self.pins.get(tenant) {
            return pinned;
        }
        if let Some(canary) = &self.canary_version {
            let bucket = stable_hash(self.seed, tenant) % 100;
            if u64::from(self.canary_percent) > bucket {
                return canary;
            }
        }
        &self.active_version
    }
}

/// Strategy accepted by the Apply API (§4.1 "Apply API").
#[derive(Debug, Clone)]
pub enum ApplyStrategy {
    /// Install as the active version immediately.
    Active,
    /// Install as canary at the given percentage.
    Canary(u8),
    /// Pin specific tenants to this version without touching active/canary.
    Explicit(Vec<String>),
}

/// Versioned, signature-verifying bundle store with atomic pointer swap
/// (§4.1). Readers take a cheap `Arc` snapshot; the writer never mutates a
/// bundle in place.
pub struct BundleStore {
    bundles: RwLock<HashMap<String, Arc<PolicyBundle>>>,
    rollout: RwLock<Rollout>,
    public_key: Option<VerifyingKey>,
    require_signature: bool,
}

impl BundleStore {
    /// Construct an empty store. `public_key` and `require_signature` mirror
    /// `POLICY_PUBLIC_KEY_B64` / `POLICY_REQUIRE_SIGNATURE` (§6).
    #[must_use]
    pub fn new(public_key: Option<VerifyingKey>, require_signature: bool) -> Self {
        Self {
            bundles: RwLock::new(HashMap::new()),
            rollout: RwLock::new(Rollout::default()),
            public_key,
            require_signature,
        }
    }

    /// Load, verify, and register a bundle, then apply it per `strategy`.
    /// This is the Apply API (§4.1): `SignatureInvalid`/`Malformed` propagate
    /// from [`PolicyBundle::load`]; `VersionConflict` when `strategy` names a
    /// version not present in the store and `strategy` is not the load call
    /// that is registering it.
    pub fn apply(
        &self,
        yaml_bytes: &[u8],
        signature: Option<&SignatureFile>,
        strategy: ApplyStrategy,
    ) -> Result<String, PolicyError> {
        let bundle = PolicyBundle::load(yaml_bytes, signature, self.public_key.as_ref(), self.require_signature)?;
        let version = bundle.version.clone();
        {
            let mut bundles = self.bundles.write().expect("bundle store lock poisoned");
            bundles.insert(version.clone(), Arc::new(bundle));
        }
        let mut rollout = self.rollout.write().expect("rollout lock poisoned");
        match strategy {
            ApplyStrategy::Active => rollout.active_version = version.clone(),
            ApplyStrategy::Canary(pct) => {
                rollout.canary_version = Some(version.clone());
                rollout.canary_percent = pct;
            }
            ApplyStrategy::Explicit(tenants) => {
                for t in tenants {
                    rollout.pins.insert(t, version.clone());
                }
            }
        }
        Ok(version)
    }

    /// Snapshot the bundle selected for `tenant` under the current rollout.
    pub fn select_for_tenant(&self, tenant: &str) -> Result<Arc<PolicyBundle>, PolicyError> {
        let version = {
            let rollout = self.rollout.read().expect("rollout lock poisoned");
            rollout.resolve(tenant).to_string()
        };
        let bundles = self.bundles.read().expect("bundle store lock poisoned");
        bundles
            .get(&version)
            .cloned()
            .ok_or_else(|| PolicyError::Malformed(format!("no bundle loaded for version '{version}'")))
    }

    /// Fetch a specific bundle version, for the simulator's "supplied bundle" mode.
    pub fn get_version(&self, version: &str) -> Option<Arc<PolicyBundle>> {
        self.bundles.read().expect("bundle store lock poisoned").get(version).cloned()
    }

    /// Read the current rollout row (for diagnostics / `/admin` reads).
    pub fn rollout_snapshot(&self) -> Rollout {
        self.rollout.read().expect("rollout lock poisoned").clone()
    }
}

/// One categorized change between two bundles, for `/v1/policy/diff` (§4.10).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleChange {
    /// A rule present in `to` but not `from`.
    Added(String),
    /// A rule present in `from` but not `to`.
    Removed(String),
    /// Same name, action became more restrictive (allow -> approval/deny, approval -> deny).
    Tightened(String),
    /// Same name, action became less restrictive.
    Loosened(String),
    /// Same name and action, predicates or approvals changed.
    Modified(String),
}

fn restrictiveness(kind: &str) -> u8 {
    match kind {
        "allow" => 0,
        "approval" => 1,
        "deny" => 2,
        _ => 0,
    }
}

/// Structural diff of two bundle files, categorized as a risk headline
/// (§4.10 `/v1/policy/diff`). Operates on [`BundleFile`] rather than the
/// compiled form so it can run before a bundle is signed or applied.
#[must_use]
pub fn diff_bundles(from: &BundleFile, to: &BundleFile) -> Vec<RuleChange> {
    let mut changes = Vec::new();
    let from_by_name: HashMap<&str, &RawRule> = from.rules.iter().map(|r| (r.name.as_str(), r)).collect();
    let to_by_name: HashMap<&str, &RawRule> = to.rules.iter().map(|r| (r.name.as_str(), r)).collect();

    for rule in &to.rules {
        match from_by_name.get(rule.name.as_str()) {
            None => changes.push(RuleChange::Added(rule.name.clone())),
            Some(prev) => {
                let prev_sev = restrictiveness(&prev.action);
                let next_sev = restrictiveness(&rule.action);
                if next_sev > prev_sev {
                    changes.push(RuleChange::Tightened(rule.name.clone()));
                } else if next_sev < prev_sev {
                    changes.push(RuleChange::Loosened(rule.name.clone()));
                } else if prev.match_ != rule.match_
                    || prev.where_ != rule.where_
                    || prev.required_approvals != rule.required_approvals
                    || prev.approver_group != rule.approver_group
                {
                    changes.push(RuleChange::Modified(rule.name.clone()));
                }
            }
        }
    }
    for rule in &from.rules {
        if !to_by_name.contains_key(rule.name.as_str()) {
            changes.push(RuleChange::Removed(rule.name.clone()));
        }
    }
    changes
}

/// Render a tool call's trace as a plain JSON value, for the simulator's
/// reply body (§4.10 `/v1/policy/simulate`).
#[must_use]
pub fn decision_to_json(decision: &Decision) -> JsonValue {
    serde_json::to_value(decision).unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle_from_yaml(yaml: &str) -> PolicyBundle {
        PolicyBundle::load(yaml.as_bytes(), None, None, false).unwrap()
    }

    const S1_YAML: &str = r#"
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

    #[test]
    fn s1_allow_intranet_http() {
        let bundle = bundle_from_yaml(S1_YAML);
        let call = ToolCall::new(
            "acme",
            "agent-1",
            "net.http",
            json!({"method": "GET", "url": "https://intranet.api/status"}),
            "req-1",
        );
        let decision = evaluate(&bundle, &call);
        assert_eq!(decision.decision, DecisionKind::Allow);
        assert_eq!(decision.rule_name.as_deref(), Some("Allow intranet HTTP"));
        assert!(decision
            .trace
            .iter()
            .flat_map(|t| &t.explain)
            .any(|e| e.ok && e.msg.contains("intranet.api")));
    }

    #[test]
    fn invariant_fail_closed_default_deny() {
        let bundle = bundle_from_yaml(S1_YAML);
        let call = ToolCall::new("acme", "agent-1", "fs.write", json!({"path": "/etc/hosts"}), "req-2");
        let decision = evaluate(&bundle, &call);
        assert_eq!(decision.decision, DecisionKind::Deny);
        assert!(decision.rule_name.is_none());
    }

    #[test]
    fn invariant_first_match_wins() {
        let yaml = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: "catch all deny"
    match: "net.http"
    action: deny
  - name: "never reached allow"
    match: "net.http"
    action: allow
"#;
        let bundle = bundle_from_yaml(yaml);
        let call = ToolCall::new("acme", "a", "net.http", json!({"url": "https://x/"}), "r1");
        let decision = evaluate(&bundle, &call);
        assert_eq!(decision.rule_name.as_deref(), Some("catch all deny"));
    }

    #[test]
    fn glob_matches_after_exact_rules_are_checked_first() {
        let yaml = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: "exact fs.read allow"
    match: "fs.read"
    action: allow
  - name: "glob fs deny"
    match: "fs.*"
    action: deny
"#;
        let bundle = bundle_from_yaml(yaml);
        let read = evaluate(&bundle, &ToolCall::new("t", "s", "fs.read", json!({}), "r1"));
        assert_eq!(read.rule_name.as_deref(), Some("exact fs.read allow"));
        let write = evaluate(&bundle, &ToolCall::new("t", "s", "fs.write", json!({}), "r2"));
        assert_eq!(write.rule_name.as_deref(), Some("glob fs deny"));
    }

    #[test]
    fn rejects_non_deny_default() {
        let yaml = r#"
version: v1
defaults:
  decision: allow
rules: []
"#;
        let err = PolicyBundle::load(yaml.as_bytes(), None, None, false).unwrap_err();
        assert!(matches!(err, PolicyError::Malformed(_)));
    }

    #[test]
    fn unknown_predicate_fails_at_load_not_eval() {
        let yaml = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: bogus
    match: "net.http"
    where:
      not_a_real_predicate: true
    action: allow
"#;
        let err = PolicyBundle::load(yaml.as_bytes(), None, None, false).unwrap_err();
        assert!(matches!(err, PolicyError::Malformed(_)));
    }

    #[test]
    fn signature_required_rejects_missing_signature() {
        let err = PolicyBundle::load(S1_YAML.as_bytes(), None, None, true).unwrap_err();
        assert!(matches!(err, PolicyError::SignatureInvalid(_)));
    }

    #[test]
    fn signature_roundtrip_verifies() {
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();
        let sig = sign_bundle(S1_YAML.as_bytes(), &signing_key, "fp".into(), "2026-01-01T00:00:00Z".into());
        let bundle = PolicyBundle::load(S1_YAML.as_bytes(), Some(&sig), Some(&verifying_key), true).unwrap();
        assert!(bundle.signature_verified);
    }

    #[test]
    fn signature_tamper_is_rejected() {
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();
        let sig = sign_bundle(S1_YAML.as_bytes(), &signing_key, "fp".into(), "2026-01-01T00:00:00Z".into());
        let mut tampered = S1_YAML.as_bytes().to_vec();
        tampered[10] ^= 0xFF;
        let err = PolicyBundle::load(&tampered, Some(&sig), Some(&verifying_key), true).unwrap_err();
        assert!(matches!(err, PolicyError::SignatureInvalid(_)));
    }

    #[test]
    fn rollout_determinism_s6() {
        let rollout = Rollout {
            active_version: "V1".into(),
            canary_version: Some("V2".into()),
            canary_percent: 10,
            seed: 42,
            pins: HashMap::new(),
        };
        let a = rollout.resolve("tenant-a");
        let b = rollout.resolve("tenant-a");
        assert_eq!(a, b, "same tenant resolves identically across calls/processes");
    }

    #[test]
    fn explicit_pin_wins_over_canary_and_active() {
        let mut pins = HashMap::new();
        pins.insert("acme".to_string(), "V9".to_string());
        let rollout = Rollout {
            active_version: "V1".into(),
            canary_version: Some("V2".into()),
            canary_percent: 100,
            seed: 1,
            pins,
        };
        assert_eq!(rollout.resolve("acme"), "V9");
    }

    #[test]
    fn diff_categorizes_tightened_and_loosened() {
        let from: BundleFile = serde_yaml::from_str(S1_YAML).unwrap();
        let to_yaml = r#"
version: v2
defaults:
  decision: deny
rules:
  - name: "Allow intranet HTTP"
    match: "net.http"
    where:
      host_in: ["intranet.api"]
    action: deny
  - name: "new rule"
    match: "mail.send"
    action: approval
"#;
        let to: BundleFile = serde_yaml::from_str(to_yaml).unwrap();
        let changes = diff_bundles(&from, &to);
        assert!(changes
            .iter()
            .any(|c| matches!(c, RuleChange::Tightened(n) if n == "Allow intranet HTTP")));
        assert!(changes.iter().any(|c| matches!(c, RuleChange::Added(n) if n == "new rule")));
    }
}
