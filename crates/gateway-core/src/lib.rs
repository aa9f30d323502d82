//! Gateway core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the gateway core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ids {
    //! ID utilities: monotonic event ids and trace/request ids.

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate a new monotonic identifier (starts at 1). Used for audit entry
    /// sequencing, where ordering must be stable within a process.
    pub fn next_monotonic_id() -> u64 {
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Milliseconds since UNIX epoch (for timestamps).
    pub fn now_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
    }

    /// Opaque request/trace identifier (UUID v4 string).
    pub fn new_request_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// A fresh pending-approval identifier (UUID v4).
    pub fn new_pending_id() -> Uuid {
        Uuid::new_v4()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn monotonic_increments() {
            let a = next_monotonic_id();
            let b = next_monotonic_id();
            assert!(b > a);
        }

        #[test]
        fn request_id_format() {
            let t = new_request_id();
            assert_eq!(t.len(), 36);
            assert!(t.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
        }
    }
}

pub mod tool_call {
    //! The [`ToolCall`] envelope: the immutable unit of work decided by the pipeline.

    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;

    /// A tool invocation submitted by an agent, as received by the transport layer.
    ///
    /// Immutable once constructed; the pipeline never mutates a `ToolCall` in
    /// place, it only derives decisions from it.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ToolCall {
        /// Tenant the caller belongs to.
        pub tenant: String,
        /// Agent or user identifier that issued the call.
        pub subject: String,
        /// Tool name, e.g. `net.http`, `fs.write`, `cloud.ops`.
        pub tool: String,
        /// Structured arguments; schema varies per tool.
        pub arguments: JsonValue,
        /// Unique id of the originating JSON-RPC request.
        pub request_id: String,
    }

    impl ToolCall {
        /// Construct a new tool call with a request id already assigned by the transport.
        pub fn new(
            tenant: impl Into<String>,
            subject: impl Into<String>,
            tool: impl Into<String>,
            arguments: JsonValue,
            request_id: impl Into<String>,
        ) -> Self {
            Self {
                tenant: tenant.into(),
                subject: subject.into(),
                tool: tool.into(),
                arguments,
                request_id: request_id.into(),
            }
        }

        /// Read `arguments.estimated_cost_usd` as an `f64`, if present and numeric.
        #[must_use]
        pub fn estimated_cost_usd(&self) -> Option<f64> {
            self.arguments.get("estimated_cost_usd").and_then(JsonValue::as_f64)
        }

        /// Read `arguments.path` as a `&str`, if present.
        #[must_use]
        pub fn arg_str(&self, key: &str) -> Option<&str> {
            self.arguments.get(key).and_then(JsonValue::as_str)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn reads_estimated_cost() {
            let tc = ToolCall::new(
                "acme",
                "agent-1",
                "cloud.ops",
                json!({"estimated_cost_usd": 12.5}),
                "req-1",
            );
            assert_eq!(tc.estimated_cost_usd(), Some(12.5));
        }

        #[test]
        fn missing_cost_is_none() {
            let tc = ToolCall::new("acme", "agent-1", "net.http", json!({}), "req-2");
            assert_eq!(tc.estimated_cost_usd(), None);
        }

        #[test]
        fn reads_string_argument() {
            let tc = ToolCall::new(
                "acme",
                "agent-1",
                "fs.read",
                json!({"path": "/tmp/x"}),
                "req-3",
            );
            assert_eq!(tc.arg_str("path"), Some("/tmp/x"));
            assert_eq!(tc.arg_str("missing"), None);
        }
    }
}

pub mod store {
    //! The coordinating-store capability set (design note §9): a small set of
    //! primitives that rate limiting, budget debit, and approval storage are
    //! built on. Backed by a process-local implementation here; a production
    //! deployment swaps this for a shared store (Redis, etcd, ...) without the
    //! callers changing.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast;

    /// A value that can be stored with a TTL and, for counters, bumped atomically.
    #[derive(Debug, Clone, PartialEq)]
    pub enum StoredValue {
        /// An integer, used by `cas_int`/`incr_bounded`.
        Int(i64),
        /// An opaque blob, used by `put_ttl` for arbitrary records.
        Bytes(Vec<u8>),
    }

    struct Entry {
        value: StoredValue,
        expires_at: Option<Instant>,
    }

    /// `{cas_int, incr_bounded, put_ttl, publish, subscribe}` per design note §9.
    ///
    /// All operations are async so a networked backing store can be substituted
    /// without changing call sites; the in-memory implementation below never
    /// actually suspends.
    #[derive(Clone, Default)]
    pub struct CoordinatingStore {
        entries: Arc<Mutex<HashMap<String, Entry>>>,
        channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    }

    impl CoordinatingStore {
        /// Construct an empty, process-local store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn live_int(&self, guard: &mut HashMap<String, Entry>, key: &str) -> Option<i64> {
            match guard.get(key) {
                Some(e) if e.expires_at.is_some_and(|t| Instant::now() > t) => {
                    guard.remove(key);
                    None
                }
                Some(Entry { value: StoredValue::Int(n), .. }) => Some(*n),
                _ => None,
            }
        }

        /// Compare-and-set an integer: succeeds iff the current value equals
        /// `expect` (absent counts as `0`), storing `new` atomically.
        pub async fn cas_int(&self, key: &str, expect: i64, new: i64) -> bool {
            let mut guard = self.entries.lock().expect("coordinating store lock poisoned");
            let current = self.live_int(&mut guard, key).unwrap_or(0);
            if current == expect {
                guard.insert(key.to_string(), Entry { value: StoredValue::Int(new), expires_at: None });
                true
            } else {
                false
            }
        }

        /// Atomically add `delta` to the counter at `key`, refusing if the
        /// result would exceed `max` (or fall below zero). Returns the new
        /// value on success.
        pub async fn incr_bounded(&self, key: &str, delta: i64, max: i64) -> Option<i64> {
            let mut guard = self.entries.lock().expect("coordinating store lock poisoned");
            let current = self.live_int(&mut guard, key).unwrap_or(0);
            let next = current + delta;
            if next < 0 || next > max {
                return None;
            }
            guard.insert(key.to_string(), Entry { value: StoredValue::Int(next), expires_at: None });
            Some(next)
        }

        /// Read the current integer value at `key`, or `0` if absent/expired.
        pub async fn read_int(&self, key: &str) -> i64 {
            let mut guard = self.entries.lock().expect("coordinating store lock poisoned");
            self.live_int(&mut guard, key).unwrap_or(0)
        }

        /// Store an opaque value with a time-to-live.
        pub async fn put_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) {
            let mut guard = self.entries.lock().expect("coordinating store lock poisoned");
            guard.insert(
                key.to_string(),
                Entry { value: StoredValue::Bytes(value), expires_at: Some(Instant::now() + ttl) },
            );
        }

        /// Read back a value stored with `put_ttl`, or `None` if absent/expired.
        pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
            let mut guard = self.entries.lock().expect("coordinating store lock poisoned");
            match guard.get(key) {
                Some(e) if e.expires_at.is_some_and(|t| Instant::now() > t) => {
                    guard.remove(key);
                    None
                }
                Some(Entry { value: StoredValue::Bytes(b), .. }) => Some(b.clone()),
                _ => None,
            }
        }

        /// Publish `msg` on `channel`; a no-op if nobody is subscribed.
        pub async fn publish(&self, channel: &str, msg: &str) {
            let guard = self.channels.lock().expect("coordinating store lock poisoned");
            if let Some(tx) = guard.get(channel) {
                let _ = tx.send(msg.to_string());
            }
        }

        /// Subscribe to `channel`, returning a receiver that observes every
        /// `publish` from this point forward. Subscribe *before* re-reading
        /// state to avoid the lost-wakeup race described in design note §9.
        pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
            let mut guard = self.channels.lock().expect("coordinating store lock poisoned");
            guard
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe()
        }

        /// Atomic read-modify-write, the "Lua-like script" alternative to
        /// `cas_int` for state that doesn't fit a single integer (e.g. a
        /// token bucket's `{tokens, last_refill}` pair). `f` receives the
        /// current raw bytes (`None` if absent/expired) and returns the new
        /// bytes to store plus an arbitrary result to hand back to the caller.
        pub async fn transact<T, F>(&self, key: &str, f: F) -> T
        where
            F: FnOnce(Option<&[u8]>) -> (Vec<u8>, T),
        {
            let mut guard = self.entries.lock().expect("coordinating store lock poisoned");
            let current = match guard.get(key) {
                Some(e) if e.expires_at.is_some_and(|t| Instant::now() > t) => None,
                Some(Entry { value: StoredValue::Bytes(b), .. }) => Some(b.as_slice()),
                _ => None,
            };
            let (next, result) = f(current);
            guard.insert(key.to_string(), Entry { value: StoredValue::Bytes(next), expires_at: None });
            result
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn incr_bounded_refuses_overflow() {
            let store = CoordinatingStore::new();
            assert_eq!(store.incr_bounded("k", 5, 10).await, Some(5));
            assert_eq!(store.incr_bounded("k", 6, 10).await, None);
            assert_eq!(store.read_int("k").await, 5);
        }

        #[tokio::test]
        async fn cas_int_only_swaps_on_match() {
            let store = CoordinatingStore::new();
            assert!(store.cas_int("k", 0, 1).await);
            assert!(!store.cas_int("k", 0, 2).await);
            assert_eq!(store.read_int("k").await, 1);
        }

        #[tokio::test]
        async fn subscribe_then_publish_is_observed() {
            let store = CoordinatingStore::new();
            let mut rx = store.subscribe("ch");
            store.publish("ch", "hello").await;
            assert_eq!(rx.recv().await.unwrap(), "hello");
        }
    }
}

pub mod error {
    //! Shared error taxonomy, implemented once so every component speaks the
    //! same vocabulary at its boundary.

    use thiserror::Error;

    /// The fail-closed error taxonomy shared by all gateway components.
    ///
    /// Transport layers (HTTP JSON-RPC, stdio) translate these into JSON-RPC
    /// error codes; nothing downstream of a component boundary should panic
    /// on these paths.
    #[derive(Debug, Error, Clone, PartialEq)]
    pub enum GatewayError {
        /// Bearer token missing, malformed, or failed verification.
        #[error("unauthorized")]
        Unauthorized,
        /// Caller lacks the role required for this operation.
        #[error("forbidden")]
        Forbidden,
        /// Token-bucket admission failed.
        #[error("rate limited")]
        RateLimited,
        /// Policy evaluator returned `deny`.
        #[error("policy denied: {0}")]
        PolicyDenied(String),
        /// Policy evaluator returned `approval`; carries the pending id.
        #[error("needs approval: {0}")]
        NeedsApproval(String),
        /// Atomic budget debit failed.
        #[error("budget exceeded")]
        BudgetExceeded,
        /// A policy bundle failed structural/semantic validation.
        #[error("policy invalid: {0}")]
        PolicyInvalid(String),
        /// A policy bundle's signature failed verification.
        #[error("signature invalid: {0}")]
        SignatureInvalid(String),
        /// A coordinating or audit store was unreachable; fail-closed as deny.
        #[error("store unavailable: {0}")]
        StoreUnavailable(String),
        /// The inbound request failed to parse or did not match the expected schema.
        #[error("malformed request: {0}")]
        MalformedRequest(String),
    }

    impl GatewayError {
        /// JSON-RPC 2.0 error code for this error kind (standard codes where
        /// they apply, `-32000..-32099` domain-specific range otherwise).
        #[must_use]
        pub fn json_rpc_code(&self) -> i64 {
            match self {
                Self::MalformedRequest(_) => -32602,
                Self::Unauthorized => -32001,
                Self::Forbidden => -32002,
                Self::RateLimited => -32003,
                Self::PolicyDenied(_) => -32004,
                Self::NeedsApproval(_) => -32005,
                Self::BudgetExceeded => -32006,
                Self::PolicyInvalid(_) => -32007,
                Self::SignatureInvalid(_) => -32008,
                Self::StoreUnavailable(_) => -32009,
            }
        }

        /// Short machine-readable reason slug recorded on audit entries.
        #[must_use]
        pub fn reason_slug(&self) -> &'static str {
            match self {
                Self::Unauthorized => "unauthorized",
                Self::Forbidden => "forbidden",
                Self::RateLimited => "rate_limited",
                Self::PolicyDenied(_) => "policy_denied",
                Self::NeedsApproval(_) => "needs_approval",
                Self::BudgetExceeded => "budget_exceeded",
                Self::PolicyInvalid(_) => "policy_invalid",
                Self::SignatureInvalid(_) => "signature_invalid",
                Self::StoreUnavailable(_) => "store_unavailable",
                Self::MalformedRequest(_) => "malformed_request",
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn codes_are_in_domain_range_or_standard() {
            let e = GatewayError::BudgetExceeded;
            assert_eq!(e.json_rpc_code(), -32006);
            assert_eq!(e.reason_slug(), "budget_exceeded");
        }

        #[test]
        fn malformed_uses_standard_invalid_params_code() {
            let e = GatewayError::MalformedRequest("bad json".into());
            assert_eq!(e.json_rpc_code(), -32602);
        }
    }
}
