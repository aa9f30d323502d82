//! Signed approval callback tokens (§4.8, C8): the link embedded in a chat
//! notification that lets an approver record `approve`/`deny` with a single
//! `GET`, without a prior login step. An HMAC-SHA256 signature over the
//! decision fields stands in for a session, the same trust model the
//! teacher's `AGENT_AUTH_TOKEN` single-shared-secret header uses elsewhere.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Failure verifying or decoding a callback token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    /// The token was not valid base64 or not valid JSON underneath.
    #[error("malformed callback token")]
    Malformed,
    /// The signature did not match.
    #[error("callback token signature invalid")]
    BadSignature,
    /// The token's `exp` has passed.
    #[error("callback token expired")]
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Payload {
    pending_id: Uuid,
    approver_id: String,
    action: String,
    exp: u64,
}

/// Mint a signed callback token binding `(pending_id, approver_id, action)`,
/// valid until `exp_ms` (epoch milliseconds).
#[must_use]
pub fn sign(secret: &str, pending_id: Uuid, approver_id: &str, action: approval::ApproverAction, exp_ms: u64) -> String {
    let payload = Payload {
        pending_id,
        approver_id: approver_id.to_string(),
        action: action_str(action).to_string(),
        exp: exp_ms,
    };
    let body = serde_json::to_vec(&payload).expect("callback payload always serializes");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(&body);
    let sig = mac.finalize().into_bytes();
    let b64_body = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(body);
    let b64_sig = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig);
    format!("{b64_body}.{b64_sig}")
}

/// Decoded, verified callback token contents.
pub struct Verified {
    /// Pending approval this token decides.
    pub pending_id: Uuid,
    /// Approver id bound into the token.
    pub approver_id: String,
    /// Action the approver chose when the link was minted.
    pub action: approval::ApproverAction,
}

/// Verify a token's signature and expiry, returning its bound fields.
///
/// # Errors
/// [`CallbackError::Malformed`] on bad encoding, [`CallbackError::BadSignature`]
/// on a signature mismatch, [`CallbackError::Expired`] once `now_ms > exp`.
pub fn verify(secret: &str, token: &str, now_ms: u64) -> Result<Verified, CallbackError> {
    let (b64_body, b64_sig) = token.split_once('.').ok_or(CallbackError::Malformed)?;
    let body = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(b64_body)
        .map_err(|_| CallbackError::Malformed)?;
    let sig = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(b64_sig)
        .map_err(|_| CallbackError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(&body);
    mac.verify_slice(&sig).map_err(|_| CallbackError::BadSignature)?;

    let payload: Payload = serde_json::from_slice(&body).map_err(|_| CallbackError::Malformed)?;
    if now_ms > payload.exp {
        return Err(CallbackError::Expired);
    }
    let action = match payload.action.as_str() {
        "approve" => approval::ApproverAction::Approve,
        "deny" => approval::ApproverAction::Deny,
        _ => return Err(CallbackError::Malformed),
    };
    Ok(Verified { pending_id: payload.pending_id, approver_id: payload.approver_id, action })
}

fn action_str(action: approval::ApproverAction) -> &'static str {
    match action {
        approval::ApproverAction::Approve => "approve",
        approval::ApproverAction::Deny => "deny",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let id = Uuid::new_v4();
        let token = sign("s3cret", id, "alice", approval::ApproverAction::Approve, 10_000);
        let verified = verify("s3cret", &token, 5_000).unwrap();
        assert_eq!(verified.pending_id, id);
        assert_eq!(verified.approver_id, "alice");
        assert_eq!(verified.action, approval::ApproverAction::Approve);
    }

    #[test]
    fn expired_token_is_rejected() {
        let id = Uuid::new_v4();
        let token = sign("s3cret", id, "alice", approval::ApproverAction::Deny, 10_000);
        let err = verify("s3cret", &token, 10_001).unwrap_err();
        assert_eq!(err, CallbackError::Expired);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let id = Uuid::new_v4();
        let token = sign("s3cret", id, "alice", approval::ApproverAction::Approve, 10_000);
        let err = verify("other", &token, 0).unwrap_err();
        assert_eq!(err, CallbackError::BadSignature);
    }

    #[test]
    fn tampered_body_is_rejected() {
        let id = Uuid::new_v4();
        let token = sign("s3cret", id, "alice", approval::ApproverAction::Approve, 10_000);
        let (_body, sig) = token.split_once('.').unwrap();
        let tampered = format!("{}.{sig}", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{}"));
        let err = verify("s3cret", &tampered, 0).unwrap_err();
        assert_eq!(err, CallbackError::BadSignature);
    }
}
