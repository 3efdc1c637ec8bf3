//! Prompt templates exposed via Model Context Protocol

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::errors::AppError;
use crate::mcp::server::{PromptArgumentDescriptor, PromptDescriptor};

pub const GREETING_PROMPT_NAME: &str = "greeting-template";

#[derive(Debug, Deserialize)]
struct GreetingArguments {
    name: String,
}

pub fn greeting_descriptor() -> PromptDescriptor {
    PromptDescriptor {
        name: GREETING_PROMPT_NAME.to_string(),
        title: Some("Greeting Template".to_string()),
        description: Some("A simple greeting prompt template".to_string()),
        arguments: vec![PromptArgumentDescriptor {
            name: "name".to_string(),
            description: Some("Name to include in greeting".to_string()),
            required: true,
        }],
    }
}

pub async fn greeting_template(arguments: Map<String, Value>) -> Result<Value, AppError> {
    let GreetingArguments { name } = serde_json::from_value(Value::Object(arguments))
        .map_err(|err| AppError::bad_request("invalid_arguments", err.to_string()))?;

    Ok(json!({
        "messages": [
            {
                "role": "user",
                "content": {
                    "type": "text",
                    "text": format!("Please greet {name} in a friendly manner."),
                }
            }
        ]
    }))
}
