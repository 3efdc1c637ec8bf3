use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const METHOD_NOT_ALLOWED_CODE: i32 = -32000;
pub const INTERNAL_ERROR_CODE: i32 = -32603;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {message}")]
    BadRequest {
        code: &'static str,
        message: String,
    },
    #[error("not found: {message}")]
    NotFound {
        code: &'static str,
        message: String,
    },
    #[error("capability `{name}` is already registered")]
    DuplicateCapability { name: String },
    #[error("transport closed")]
    TransportClosed,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("internal error: {message}")]
    Internal { code: &'static str, message: String },
}

/// JSON-RPC error envelope used for transport-level failures.
///
/// Field order is part of the wire contract: clients compare the 405 body
/// byte-for-byte.
#[derive(Debug, Serialize)]
pub struct JsonRpcErrorEnvelope {
    pub jsonrpc: &'static str,
    pub error: JsonRpcErrorObject,
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcErrorObject {
    pub code: i32,
    pub message: &'static str,
}

impl JsonRpcErrorEnvelope {
    pub fn new(code: i32, message: &'static str) -> Self {
        Self {
            jsonrpc: "2.0",
            error: JsonRpcErrorObject { code, message },
            id: None,
        }
    }
}

impl AppError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }

    pub fn serialization(err: serde_json::Error) -> Self {
        Self::Internal {
            code: "serialization_failed",
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, envelope) = match self {
            Self::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                JsonRpcErrorEnvelope::new(METHOD_NOT_ALLOWED_CODE, "Method not allowed."),
            ),
            Self::BadRequest { code, message } => {
                tracing::warn!(code, error = %message, "rejected malformed request");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorEnvelope::new(-32600, "Invalid Request"),
                )
            }
            other => {
                tracing::error!(error = %other, "request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorEnvelope::new(INTERNAL_ERROR_CODE, "Internal server error"),
                )
            }
        };

        (status, Json(envelope)).into_response()
    }
}
