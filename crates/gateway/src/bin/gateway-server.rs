//! Gateway server entry point: builds [`gateway::state::GatewayState`] from
//! the environment and serves the HTTP transport, or the stdio transport
//! when `GATEWAY_TRANSPORT=stdio` (§6, §9 "single reader").

use std::env;

#[tokio::main]
async fn main() {
    telemetry::init_json_logging();

    let state = match gateway::build_state_from_env() {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "failed to build gateway state");
            std::process::exit(1);
        }
    };

    let transport = env::var("GATEWAY_TRANSPORT").unwrap_or_else(|_| "http".to_string());
    let result = match transport.as_str() {
        "stdio" => gateway::stdio::run(state).await.map_err(|e| e.to_string()),
        "http" => {
            let addr = env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
            gateway::serve_http(state, &addr).await.map_err(|e| e.to_string())
        }
        other => Err(format!("unknown GATEWAY_TRANSPORT '{other}', expected 'http' or 'stdio'")),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "gateway exited with error");
        std::process::exit(1);
    }
}
