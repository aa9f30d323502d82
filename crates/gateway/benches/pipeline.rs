use std::collections::HashSet;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use gateway::config::GatewayConfig;
use gateway::pipeline::handle_call;
use gateway::state::GatewayState;
use gateway_core::tool_call::ToolCall;
use identity::Principal;
use serde_json::json;
use tokio::runtime::Runtime;

const ALLOW_YAML: &str = r#"
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

fn bench_allow_decision(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    c.bench_function("pipeline_allow_decision", |b| {
        b.iter_batched(
            || {
                let identity: Arc<dyn identity::TokenVerifier> =
                    Arc::new(identity::DevHmacVerifier::new("shh", "gateway-dev"));
                let state = GatewayState::build(GatewayConfig::from_env(), identity).unwrap();
                state.policy.apply(ALLOW_YAML.as_bytes(), None, policy::ApplyStrategy::Active).unwrap();
                let principal = Principal { tenant: "acme".into(), subject: "agent-1".into(), roles: HashSet::new() };
                let call = ToolCall::new(
                    "acme",
                    "agent-1",
                    "net.http",
                    json!({"method": "GET", "url": "https://intranet.api/status"}),
                    "bench-req",
                );
                (state, principal, call)
            },
            |(state, principal, call)| {
                rt.block_on(async { handle_call(&state, &principal, call).await })
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_allow_decision);
criterion_main!(benches);
