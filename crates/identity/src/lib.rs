//! Bearer token verification and role-set RBAC (§4.7, C7).
//!
//! Two verifier implementations share one [`TokenVerifier`] trait: OIDC
//! (JWKS fetch, signature/`iss`/`aud`/`exp`/`nbf` checks) for production, and
//! a single-secret HMAC verifier for local development (`DEV_JWT_SECRET`).
//! Both resolve a verified token to a [`Principal`] — `{tenant, subject,
//! roles}` — which the Decision Pipeline and admin API authorize against by
//! set membership, not a role hierarchy (design note §9: `admin` is just the
//! role that happens to imply the others, modeled as a superset check).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure modes of bearer token verification (§7 `Unauthorized`/`Forbidden`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// No `Authorization: Bearer ...` header, or it was malformed.
    #[error("missing or malformed bearer token")]
    MissingToken,
    /// Signature, issuer, audience, or time-bound check failed.
    #[error("token verification failed: {0}")]
    InvalidToken(String),
    /// JWKS could not be fetched or contained no usable key.
    #[error("jwks unavailable: {0}")]
    JwksUnavailable(String),
    /// Verified, but the principal lacks the role required for this operation.
    #[error("forbidden: missing role {0}")]
    Forbidden(String),
}

/// A role token (§4.7 "`{admin, approver, viewer}` as a set of role tokens").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Implies every other role for authorization purposes.
    Admin,
    /// May submit approval decisions.
    Approver,
    /// May call the simulator and read metrics.
    Viewer,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "approver" => Some(Role::Approver),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

/// `{tenant, subject, roles}` resolved from a verified bearer token (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Tenant the principal belongs to.
    pub tenant: String,
    /// Subject (agent or user id).
    pub subject: String,
    /// Role set.
    pub roles: HashSet<Role>,
}

impl Principal {
    /// Whether this principal holds `role`, directly or via `admin`.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&Role::Admin) || self.roles.contains(&role)
    }

    /// Membership check for an `approver_group` roster (§12 open-question
    /// decision: "all N must be members"). The roster is a plain set of
    /// subject ids configured by the admin API; this only checks this
    /// principal's membership in it.
    #[must_use]
    pub fn is_group_member(&self, roster: &HashSet<String>) -> bool {
        roster.contains(&self.subject)
    }
}

/// Claims common to both OIDC and dev tokens. Extra standard claims (`iss`,
/// `aud`, `exp`, `nbf`) are validated by `jsonwebtoken` itself via
/// [`Validation`]; `tenant`/`roles` are gateway-specific custom claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    tenant: String,
    #[serde(default)]
    roles: Vec<String>,
}

fn claims_to_principal(claims: Claims) -> Principal {
    Principal {
        tenant: claims.tenant,
        subject: claims.sub,
        roles: claims.roles.iter().filter_map(|r| Role::parse(r)).collect(),
    }
}

/// Strips a leading `"Bearer "` (case-insensitive) from an `Authorization`
/// header value.
pub fn strip_bearer(header_value: &str) -> Result<&str, IdentityError> {
    let trimmed = header_value.trim();
    let rest = trimmed.strip_prefix("Bearer ").or_else(|| trimmed.strip_prefix("bearer "));
    rest.map(str::trim).filter(|s| !s.is_empty()).ok_or(IdentityError::MissingToken)
}

/// Verifies a bearer token string into a [`Principal`] (§4.7).
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `token` (already stripped of the `Bearer ` prefix).
    async fn verify(&self, token: &str) -> Result<Principal, IdentityError>;
}

/// Development verifier: a single shared HMAC secret, no network calls.
/// Configured via `DEV_JWT_SECRET` / `DEV_ISSUER` (§6).
pub struct DevHmacVerifier {
    secret: String,
    issuer: String,
}

impl DevHmacVerifier {
    /// Construct a verifier for tokens signed with `secret`, requiring `iss
    /// == issuer`.
    #[must_use]
    pub fn new(secret: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self { secret: secret.into(), issuer: issuer.into() }
    }

    /// Mint a token for tests and local development; real issuance is out of
    /// scope for the gateway (§1 "OIDC token issuance ... not built"), but a
    /// dev-only signer keeps this verifier independently testable.
    #[must_use]
    pub fn sign(&self, tenant: &str, subject: &str, roles: &[Role], exp_s: u64) -> String {
        #[derive(Serialize)]
        struct SignClaims<'a> {
            sub: &'a str,
            iss: &'a str,
            tenant: &'a str,
            roles: Vec<&'static str>,
            exp: u64,
        }
        let role_strs = roles
            .iter()
            .map(|r| match r {
                Role::Admin => "admin",
                Role::Approver => "approver",
                Role::Viewer => "viewer",
            })
            .collect();
        let claims =
            SignClaims { sub: subject, iss: &self.issuer, tenant, roles: role_strs, exp: exp_s };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .expect("dev token encode")
    }
}

#[async_trait]
impl TokenVerifier for DevHmacVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, IdentityError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_aud = false;
        let data = decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &validation)
            .map_err(|e| IdentityError::InvalidToken(e.to_string()))?;
        Ok(claims_to_principal(data.claims))
    }
}

/// Production verifier: fetches and caches a remote JWKS, verifies
/// signature, `iss`, `aud`, `exp`, `nbf` (§4.7(a)).
pub struct OidcVerifier {
    issuer: String,
    audience: String,
    jwks_url: String,
    client: reqwest::Client,
    cache: Mutex<Option<(JwkSet, Instant)>>,
    cache_ttl: Duration,
}

impl OidcVerifier {
    /// Construct a verifier for `issuer`/`audience`, fetching keys from
    /// `jwks_url` on first use and every `cache_ttl` thereafter.
    #[must_use]
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>, jwks_url: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            jwks_url: jwks_url.into(),
            client: reqwest::Client::new(),
            cache: Mutex::new(None),
            cache_ttl: Duration::from_secs(300),
        }
    }

    async fn jwks(&self) -> Result<JwkSet, IdentityError> {
        {
            let guard = self.cache.lock().expect("jwks cache lock poisoned");
            if let Some((set, fetched_at)) = guard.as_ref() {
                if fetched_at.elapsed() < self.cache_ttl {
                    return Ok(set.clone());
                }
            }
        }
        let set: JwkSet = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| IdentityError::JwksUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| IdentityError::JwksUnavailable(e.to_string()))?;
        *self.cache.lock().expect("jwks cache lock poisoned") = Some((set.clone(), Instant::now()));
        Ok(set)
    }
}

#[async_trait]
impl TokenVerifier for OidcVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, IdentityError> {
        let header = decode_header(token).map_err(|e| IdentityError::InvalidToken(e.to_string()))?;
        let kid = header.kid.ok_or_else(|| IdentityError::InvalidToken("token missing kid".into()))?;
        let jwks = self.jwks().await?;
        let jwk = jwks
            .find(&kid)
            .ok_or_else(|| IdentityError::InvalidToken(format!("no jwk for kid {kid}")))?;
        let decoding_key = DecodingKey::from_jwk(jwk)
            .map_err(|e| IdentityError::InvalidToken(format!("unusable jwk: {e}")))?;
        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        let data = decode::<Claims>(token, &decoding_key, &validation)
            .map_err(|e| IdentityError::InvalidToken(e.to_string()))?;
        Ok(claims_to_principal(data.claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_bearer_prefix_case_insensitively() {
        assert_eq!(strip_bearer("Bearer abc").unwrap(), "abc");
        assert_eq!(strip_bearer("bearer xyz").unwrap(), "xyz");
        assert!(strip_bearer("abc").is_err());
        assert!(strip_bearer("Bearer ").is_err());
    }

    #[tokio::test]
    async fn dev_hmac_roundtrip_and_admin_implies_all() {
        let verifier = DevHmacVerifier::new("shh", "gateway-dev");
        let token = verifier.sign("acme", "agent-1", &[Role::Admin], 9_999_999_999);
        let principal = verifier.verify(&token).await.unwrap();
        assert_eq!(principal.tenant, "acme");
        assert!(principal.has_role(Role::Approver));
        assert!(principal.has_role(Role::Viewer));
    }

    #[tokio::test]
    async fn dev_hmac_rejects_wrong_secret() {
        let signer = DevHmacVerifier::new("shh", "gateway-dev");
        let token = signer.sign("acme", "agent-1", &[Role::Viewer], 9_999_999_999);
        let verifier = DevHmacVerifier::new("different", "gateway-dev");
        assert!(verifier.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn dev_hmac_rejects_expired_token() {
        let verifier = DevHmacVerifier::new("shh", "gateway-dev");
        let token = verifier.sign("acme", "agent-1", &[Role::Viewer], 1);
        assert!(verifier.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn group_membership_checks_subject() {
        let mut roster = HashSet::new();
        roster.insert("alice".to_string());
        let member = Principal { tenant: "t".into(), subject: "alice".into(), roles: HashSet::new() };
        let stranger = Principal { tenant: "t".into(), subject: "mallory".into(), roles: HashSet::new() };
        assert!(member.is_group_member(&roster));
        assert!(!stranger.is_group_member(&roster));
    }
}
