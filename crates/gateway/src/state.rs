//! Shared application state wiring every component crate together (the
//! teacher's `orchestrator` assembles its `Arc<DashMap<...>>`/`Engine` state
//! the same way in its `AppState`; this is that pattern generalized to the
//! gateway's component set).

use std::sync::Arc;

use approval::ApprovalStore;
use audit::{AuditError, AuditLog, AuditSink, JsonlFileSink, MemorySink};
use budget::{Ledger, TenantConfig};
use gateway_core::store::CoordinatingStore;
use identity::TokenVerifier;
use policy::BundleStore;
use telemetry::GatewayMetrics;

use crate::config::GatewayConfig;
use crate::rbac::RbacStore;
use crate::tools::PriceBook;

/// Either audit backend behind one concrete type, so [`AuditLog`] doesn't
/// need a trait object (orphan rules block implementing [`AuditSink`] for
/// `Box<dyn AuditSink>` outside the `audit` crate itself).
pub enum AnySink {
    /// `AUDIT_URL` unset; in-process only, tests and local dev.
    Memory(MemorySink),
    /// `AUDIT_URL` set to a filesystem path.
    File(JsonlFileSink),
}

impl AuditSink for AnySink {
    fn persist_line(&self, line: &str) -> Result<(), AuditError> {
        match self {
            Self::Memory(s) => s.persist_line(line),
            Self::File(s) => s.persist_line(line),
        }
    }

    fn read_all(&self) -> Result<Vec<String>, AuditError> {
        match self {
            Self::Memory(s) => s.read_all(),
            Self::File(s) => s.read_all(),
        }
    }
}

/// Every shared component the Decision Pipeline and HTTP/stdio transports
/// need, assembled once at startup.
pub struct GatewayState {
    /// §4.1 signed bundle store.
    pub policy: Arc<BundleStore>,
    /// §4.3 rate/budget ledger.
    pub ledger: Arc<Ledger>,
    /// §4.3/§4.10 per-tenant rate-limit and budget configuration.
    pub tenant_config: Arc<TenantConfig>,
    /// §4.4 durable pending-approval store.
    pub approvals: Arc<ApprovalStore>,
    /// §4.6 hash-chained audit log.
    pub audit: Arc<AuditLog<AnySink>>,
    /// §4.7 bearer token verifier (dev HMAC or OIDC, chosen at startup).
    pub identity: Arc<dyn TokenVerifier>,
    /// §4.10 server-assigned RBAC and approver-group rosters.
    pub rbac: Arc<RbacStore>,
    /// `cloud.estimate` static price book.
    pub prices: Arc<PriceBook>,
    /// Prometheus metric set backing `/metrics`.
    pub metrics: Arc<GatewayMetrics>,
    /// The process-wide configuration this state was built from.
    pub config: GatewayConfig,
}

impl GatewayState {
    /// Assemble a fresh state from `config`, constructing every component
    /// with a shared in-process [`CoordinatingStore`] (design note §9: a
    /// horizontally scaled deployment swaps this for a networked backend
    /// without the component APIs changing).
    ///
    /// # Errors
    /// Returns an error description if the audit sink (`AUDIT_URL`, when set)
    /// cannot be opened, or if metric registration fails.
    pub fn build(config: GatewayConfig, identity: Arc<dyn TokenVerifier>) -> Result<Self, String> {
        let coordinator = Arc::new(CoordinatingStore::new());
        let public_key = config
            .policy
            .public_key_b64
            .as_deref()
            .map(decode_public_key)
            .transpose()?;
        let policy = Arc::new(BundleStore::new(public_key, config.policy.require_signature));
        let tenant_config = Arc::new(TenantConfig::new());
        let ledger = Arc::new(Ledger::new(coordinator.clone(), tenant_config.clone()));
        let approvals = Arc::new(ApprovalStore::new(coordinator));
        let sink = match &config.audit_url {
            Some(path) => AnySink::File(JsonlFileSink::open(path).map_err(|e| e.to_string())?),
            None => AnySink::Memory(MemorySink::new()),
        };
        let audit = Arc::new(AuditLog::open(sink).map_err(|e| e.to_string())?);
        let rbac = Arc::new(RbacStore::new());
        let prices = Arc::new(PriceBook::default_book());
        let metrics = Arc::new(GatewayMetrics::new().map_err(|e| e.to_string())?);
        Ok(Self { policy, ledger, tenant_config, approvals, audit, identity, rbac, prices, metrics, config })
    }
}

fn decode_public_key(b64: &str) -> Result<ed25519_dalek::VerifyingKey, String> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| format!("POLICY_PUBLIC_KEY_B64 is not valid base64: {e}"))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| "POLICY_PUBLIC_KEY_B64 must decode to 32 bytes".to_string())?;
    ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|e| format!("invalid Ed25519 public key: {e}"))
}
