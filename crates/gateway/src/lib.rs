//! The policy-driven tool-call gateway (§4.5 Decision Pipeline, §4.9
//! Transport, §4.8 callback, §4.10 Admin & Simulator): wires every component
//! crate together behind one [`state::GatewayState`] and serves it over
//! HTTP and stdio.

#![deny(unsafe_code)]

pub mod callback;
pub mod config;
pub mod http;
pub mod jsonrpc;
pub mod pipeline;
pub mod rbac;
pub mod state;
pub mod stdio;
pub mod tools;

use std::sync::Arc;

use config::GatewayConfig;
use identity::TokenVerifier;
use state::GatewayState;

/// Build the identity verifier the configuration selects: OIDC when
/// `OIDC_ISSUER`/`OIDC_JWKS_URL`/`OIDC_AUDIENCE` are all set, the
/// development HMAC verifier otherwise (§4.7).
#[must_use]
pub fn build_identity_verifier(config: &GatewayConfig) -> Arc<dyn TokenVerifier> {
    let id = &config.identity;
    match (&id.oidc_issuer, &id.oidc_jwks_url, &id.oidc_audience) {
        (Some(issuer), Some(jwks_url), Some(audience)) => {
            Arc::new(identity::OidcVerifier::new(issuer.clone(), audience.clone(), jwks_url.clone()))
        }
        _ => {
            let secret = id.dev_jwt_secret.clone().unwrap_or_else(|| "dev-only-insecure-secret".to_string());
            Arc::new(identity::DevHmacVerifier::new(&secret, &id.dev_issuer))
        }
    }
}

/// Assemble a [`GatewayState`] from the process environment, loading the
/// configured policy bundle (`POLICY_FILE`) into the active slot if one is
/// set, mirroring the teacher's `OrchestratorService::new` + WAL-replay
/// startup sequence generalized from WAL replay to a bundle load.
///
/// # Errors
/// Returns a description if state construction or the initial bundle load
/// fails.
pub fn build_state_from_env() -> Result<Arc<GatewayState>, String> {
    let config = GatewayConfig::from_env();
    let identity = build_identity_verifier(&config);
    let state = Arc::new(GatewayState::build(config, identity)?);
    if let Some(path) = state.config.policy.policy_file.clone() {
        let yaml = std::fs::read(&path).map_err(|e| format!("reading POLICY_FILE {path}: {e}"))?;
        let signature = match &state.config.policy.policy_sig_path {
            Some(sig_path) => {
                let raw = std::fs::read_to_string(sig_path)
                    .map_err(|e| format!("reading POLICY_SIG_PATH {sig_path}: {e}"))?;
                Some(serde_json::from_str(&raw).map_err(|e| format!("parsing {sig_path}: {e}"))?)
            }
            None => None,
        };
        state
            .policy
            .apply(&yaml, signature.as_ref(), policy::ApplyStrategy::Active)
            .map_err(|e| format!("applying POLICY_FILE: {e}"))?;
    }
    Ok(state)
}

/// Serve the HTTP transport on `addr` until a shutdown signal arrives
/// (SIGINT, or SIGTERM on unix — SPEC_FULL §11 graceful shutdown), draining
/// in-flight requests before returning.
///
/// # Errors
/// Returns an I/O error if `addr` cannot be bound.
pub async fn serve_http(state: Arc<GatewayState>, addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
            return;
        };
        sig.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}
