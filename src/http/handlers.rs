//! Axum HTTP handlers for the web server
//!
//! `POST /mcp` runs the per-request lifecycle: build a stateless transport and
//! a fresh server, connect them, hand the body over, and let the connection's
//! close guard tear both down when the exchange ends. `GET` and `DELETE` are
//! rejected with a fixed JSON-RPC error.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::error;

use crate::errors::AppError;
use crate::mcp::rpc::{json_rpc_error, PARSE_ERROR};
use crate::mcp::transport::{ResponseMode, StreamableHttpTransport, TransportOptions};
use crate::AppState;

pub async fn mcp_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_exchange(&state, &headers, &body).await {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "error handling MCP request");
            AppError::internal(err.to_string()).into_response()
        }
    }
}

pub async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

async fn handle_exchange(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, AppError> {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => {
            return Ok((
                StatusCode::OK,
                Json(json_rpc_error(None, PARSE_ERROR, "Parse error")),
            )
                .into_response())
        }
    };

    let mut transport = StreamableHttpTransport::new(TransportOptions::stateless(
        ResponseMode::negotiate(headers),
        state.transport,
    ));
    transport.set_error_handler(Arc::new(|err| {
        error!(error = %err, "mcp transport error");
    }));

    let mut server = state.server_factory.create_server()?;
    server.set_error_handler(Arc::new(|err| {
        error!(error = %err, "mcp server error");
    }));

    server.connect(transport).handle_request(payload).await
}
