//! Interactive tools exposed via Model Context Protocol
//!
//! Provides `start-notification-stream`, which acknowledges immediately and then
//! streams logging notifications over the caller's transport.

use rust_mcp_sdk::{
    macros,
    schema::{CallToolResult, ContentBlock, TextContent},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::domain::notifications::NotificationJob;
use crate::errors::AppError;
use crate::mcp::server::ToolContext;

pub const NOTIFICATION_TOOL_NAME: &str = "start-notification-stream";
pub const DEFAULT_INTERVAL_MS: u32 = 100;
pub const DEFAULT_COUNT: u32 = 10;

#[macros::mcp_tool(
    name = "start-notification-stream",
    description = "Starts sending periodic notifications over the current request stream"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct StartNotificationStreamTool {
    /// Interval in milliseconds between notifications (default 100)
    pub interval: Option<u32>,
    /// Number of notifications to send, 0 for unbounded (default 10)
    pub count: Option<u32>,
}

pub async fn start_notification_stream(
    arguments: Map<String, Value>,
    context: ToolContext,
) -> Result<CallToolResult, AppError> {
    let params: StartNotificationStreamTool = serde_json::from_value(Value::Object(arguments))
        .map_err(|err| AppError::bad_request("invalid_arguments", err.to_string()))?;

    let interval = params.interval.unwrap_or(DEFAULT_INTERVAL_MS);
    let count = params.count.unwrap_or(DEFAULT_COUNT);

    let _detached =
        NotificationJob::new(interval, count, context.notifier, context.cancellation).spawn();
    info!(interval_ms = interval, count, "notification stream started");

    Ok(CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(
            format!("Started sending periodic notifications every {interval}ms"),
            None,
            None,
        ))],
        is_error: None,
        meta: None,
        structured_content: None,
    })
}
