//! Model Context Protocol static resource providers

use rust_mcp_sdk::schema::{ReadResourceContent, ReadResourceResult, Resource, TextResourceContents};

use crate::errors::AppError;

pub const GREETING_RESOURCE_NAME: &str = "greeting-resource";
pub const GREETING_RESOURCE_URI: &str = "https://example.com/greetings/default";
pub const GREETING_TEXT: &str = "Hello, world!";

pub fn greeting_resource() -> Resource {
    Resource {
        annotations: None,
        description: Some("A simple greeting resource".to_string()),
        icons: vec![],
        meta: None,
        mime_type: Some("text/plain".to_string()),
        name: GREETING_RESOURCE_NAME.to_string(),
        size: None,
        title: None,
        uri: GREETING_RESOURCE_URI.to_string(),
    }
}

pub async fn read_greeting(uri: String) -> Result<ReadResourceResult, AppError> {
    Ok(ReadResourceResult {
        contents: vec![ReadResourceContent::from(TextResourceContents {
            meta: None,
            mime_type: Some("text/plain".to_string()),
            text: GREETING_TEXT.to_string(),
            uri,
        })],
        meta: None,
    })
}
