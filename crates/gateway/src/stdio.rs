//! Newline-delimited JSON-RPC transport over stdin/stdout (§6, C9): the
//! single-reader loop an agent runtime spawns as a subprocess, mirroring the
//! teacher's `stdin.lines()` replay-input loop in `gateway-cli` shape but
//! driving the same [`pipeline::handle_call`] dispatch the HTTP transport
//! uses, so both transports share one decision path.

use std::sync::Arc;

use axum::http::HeaderMap;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::state::GatewayState;

/// Run the stdio loop until stdin closes. Each line is one JSON-RPC request;
/// each reply is written as one JSON-RPC response line to stdout.
///
/// Authentication over stdio comes from the `GATEWAY_STDIO_BEARER_TOKEN`
/// environment variable (a subprocess has no HTTP headers to carry a bearer
/// token in) rather than a per-line field, since the whole process is
/// launched on behalf of one already-authenticated agent session.
pub async fn run(state: Arc<GatewayState>) -> std::io::Result<()> {
    let token = std::env::var("GATEWAY_STDIO_BEARER_TOKEN").unwrap_or_default();
    let mut headers = HeaderMap::new();
    if !token.is_empty() {
        if let Ok(value) = format!("Bearer {token}").parse() {
            headers.insert(axum::http::header::AUTHORIZATION, value);
        }
    }

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(req) => handle_line(&state, &headers, req).await,
            Err(e) => JsonRpcResponse::parse_error(e.to_string()),
        };
        let encoded = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle_line(state: &GatewayState, headers: &HeaderMap, req: JsonRpcRequest) -> JsonRpcResponse {
    let id = req.id.clone().unwrap_or(JsonValue::Null);
    match crate::http::dispatch_mcp(state, headers, req).await {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(err) => JsonRpcResponse::from_gateway_error(id, &err, None),
    }
}
