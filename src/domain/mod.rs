//! Demonstration capabilities and the per-request server factory
//!
//! Every request gets a freshly built server carrying the greeting prompt, the
//! notification stream tool and the greeting resource.

pub mod notifications;
pub mod prompts;
pub mod resources;
pub mod tools;

use crate::errors::AppError;
use crate::mcp::server::{McpServer, ServerFactory};

use tools::StartNotificationStreamTool;

pub fn create_server() -> Result<McpServer, AppError> {
    let mut server = McpServer::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    server.register_prompt(prompts::greeting_descriptor(), prompts::greeting_template)?;
    server.register_tool(
        StartNotificationStreamTool::tool(),
        tools::start_notification_stream,
    )?;
    server.register_resource(resources::greeting_resource(), resources::read_greeting)?;

    Ok(server)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DemoServerFactory;

impl ServerFactory for DemoServerFactory {
    fn create_server(&self) -> Result<McpServer, AppError> {
        create_server()
    }
}
