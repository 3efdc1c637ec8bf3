//! The per-request Model Context Protocol engine
//!
//! Provides the capability registry (prompts, tools, resources keyed by name),
//! JSON-RPC decoding, method routing and capabilities negotiation (`initialize`).
//! A server instance lives for exactly one HTTP exchange and is never shared.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, FutureExt};
use rust_mcp_sdk::schema::{
    CallToolRequest, CallToolRequestParams, CallToolResult, GetPromptRequest, Implementation,
    InitializeRequest, InitializeResult, JsonrpcMessage, JsonrpcRequest, ListPromptsRequest,
    ListResourcesRequest, ListResourcesResult, ListToolsRequest, ListToolsResult, PingRequest,
    ReadResourceRequest, ReadResourceRequestParams, ReadResourceResult, Resource,
    ServerCapabilities, ServerCapabilitiesPrompts, ServerCapabilitiesResources,
    ServerCapabilitiesTools, Tool,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::AppError;
use crate::mcp::rpc::{
    app_error_to_json_rpc, is_json_rpc_error, json_rpc_error, json_rpc_result,
    request_id_to_value, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
};
use crate::mcp::transport::{Connection, NotificationSender, StreamableHttpTransport};

/// Newest first; an unsupported client version is answered with the first entry.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

pub type ErrorCallback = Arc<dyn Fn(&AppError) + Send + Sync>;

pub type PromptHandler =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value, AppError>> + Send + Sync>;

pub type ToolHandler = Arc<
    dyn Fn(Map<String, Value>, ToolContext) -> BoxFuture<'static, Result<CallToolResult, AppError>>
        + Send
        + Sync,
>;

pub type ResourceHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<ReadResourceResult, AppError>> + Send + Sync>;

/// Builds one server instance per incoming request.
pub trait ServerFactory: Send + Sync {
    fn create_server(&self) -> Result<McpServer, AppError>;
}

/// What a tool handler may use besides its arguments.
#[derive(Clone)]
pub struct ToolContext {
    pub notifier: Arc<dyn NotificationSender>,
    /// Cancelled when the owning server is closed.
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub arguments: Vec<PromptArgumentDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptArgumentDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
}

pub enum Capability {
    Prompt {
        descriptor: PromptDescriptor,
        handler: PromptHandler,
    },
    Tool {
        descriptor: Tool,
        handler: ToolHandler,
    },
    Resource {
        descriptor: Resource,
        handler: ResourceHandler,
    },
}

#[derive(Debug, Deserialize)]
struct GetPromptParams {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

pub struct McpServer {
    name: String,
    version: String,
    capabilities: BTreeMap<String, Capability>,
    on_error: Option<ErrorCallback>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities: BTreeMap::new(),
            on_error: None,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn register_prompt<F, Fut>(
        &mut self,
        descriptor: PromptDescriptor,
        handler: F,
    ) -> Result<(), AppError>
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
    {
        let handler: PromptHandler = Arc::new(move |arguments| handler(arguments).boxed());
        self.insert(
            descriptor.name.clone(),
            Capability::Prompt {
                descriptor,
                handler,
            },
        )
    }

    pub fn register_tool<F, Fut>(&mut self, descriptor: Tool, handler: F) -> Result<(), AppError>
    where
        F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, AppError>> + Send + 'static,
    {
        let handler: ToolHandler =
            Arc::new(move |arguments, context| handler(arguments, context).boxed());
        self.insert(
            descriptor.name.clone(),
            Capability::Tool {
                descriptor,
                handler,
            },
        )
    }

    pub fn register_resource<F, Fut>(
        &mut self,
        descriptor: Resource,
        handler: F,
    ) -> Result<(), AppError>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReadResourceResult, AppError>> + Send + 'static,
    {
        let handler: ResourceHandler = Arc::new(move |uri| handler(uri).boxed());
        self.insert(
            descriptor.name.clone(),
            Capability::Resource {
                descriptor,
                handler,
            },
        )
    }

    fn insert(&mut self, name: String, capability: Capability) -> Result<(), AppError> {
        if self.capabilities.contains_key(&name) {
            return Err(AppError::DuplicateCapability { name });
        }

        self.capabilities.insert(name, capability);
        Ok(())
    }

    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    pub fn set_error_handler(&mut self, callback: ErrorCallback) {
        self.on_error = Some(callback);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that actually closed the server.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.shutdown.cancel();
        debug!(server = %self.name, "mcp server closed");
        true
    }

    pub fn connect(self, transport: StreamableHttpTransport) -> Connection {
        Connection::establish(Arc::new(self), transport)
    }

    fn report(&self, err: &AppError) {
        if let Some(callback) = &self.on_error {
            callback(err);
        }
    }

    /// Handles one decoded JSON-RPC message; notifications yield `None`.
    pub async fn handle_message(
        &self,
        notifier: Arc<dyn NotificationSender>,
        payload: Value,
    ) -> Option<Value> {
        if !payload.is_object() {
            return Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request"));
        }

        let request_id = payload.get("id").cloned();
        let parsed: JsonrpcMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(_) => return Some(json_rpc_error(request_id, INVALID_REQUEST, "Invalid Request")),
        };

        match parsed {
            JsonrpcMessage::Request(request) => {
                if let Err(error_response) = validate_request_shape(&request) {
                    return Some(error_response);
                }

                let request_id = request_id_to_value(request.id);
                if request.method.trim().is_empty() {
                    return Some(json_rpc_error(
                        Some(request_id),
                        INVALID_REQUEST,
                        "Invalid Request",
                    ));
                }

                let context = ToolContext {
                    notifier,
                    cancellation: self.shutdown.clone(),
                };

                Some(
                    self.handle_request(
                        context,
                        Some(request_id),
                        &request.method,
                        request.params.map(Value::Object),
                    )
                    .await,
                )
            }
            JsonrpcMessage::Notification(notification) => {
                debug!(method = %notification.method, "client notification received");
                None
            }
            JsonrpcMessage::ResultResponse(_) | JsonrpcMessage::ErrorResponse(_) => None,
        }
    }

    pub async fn handle_request(
        &self,
        context: ToolContext,
        id: Option<Value>,
        method: &str,
        params: Option<Value>,
    ) -> Value {
        let response = match method {
            "initialize" => self.initialize(id, params.as_ref()),
            "ping" => json_rpc_result(id, json!({})),
            "prompts/list" => json_rpc_result(id, json!({ "prompts": self.prompt_descriptors() })),
            "prompts/get" => self.get_prompt(id, params).await,
            "tools/list" => self.serialize_result(
                id,
                ListToolsResult {
                    meta: None,
                    next_cursor: None,
                    tools: self.tool_descriptors(),
                },
            ),
            "tools/call" => self.call_tool(id, params, context).await,
            "resources/list" => self.serialize_result(
                id,
                ListResourcesResult {
                    meta: None,
                    next_cursor: None,
                    resources: self.resource_descriptors(),
                },
            ),
            "resources/read" => self.read_resource(id, params).await,
            _ => json_rpc_error(id, METHOD_NOT_FOUND, "Method not found"),
        };

        info!(
            method = %method,
            outcome = if is_json_rpc_error(&response) { "failure" } else { "success" },
            "mcp action audited"
        );

        response
    }

    fn initialize(&self, id: Option<Value>, params: Option<&Value>) -> Value {
        let protocol_version = match negotiate_protocol_version(params) {
            Ok(version) => version,
            Err(err) => return app_error_to_json_rpc(id, err),
        };

        let initialize_result = InitializeResult {
            server_info: Implementation {
                name: self.name.clone(),
                version: self.version.clone(),
                title: None,
                description: None,
                icons: vec![],
                website_url: None,
            },
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
                resources: Some(ServerCapabilitiesResources {
                    subscribe: Some(false),
                    list_changed: Some(false),
                }),
                prompts: Some(ServerCapabilitiesPrompts {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            protocol_version: protocol_version.to_string(),
            instructions: None,
            meta: None,
        };

        self.serialize_result(id, initialize_result)
    }

    async fn get_prompt(&self, id: Option<Value>, params: Option<Value>) -> Value {
        let Some(raw_params) = params else {
            return json_rpc_error(id, INVALID_PARAMS, "Invalid params");
        };

        let prompt_get: GetPromptParams = match serde_json::from_value(raw_params) {
            Ok(value) => value,
            Err(_) => return json_rpc_error(id, INVALID_PARAMS, "Invalid params"),
        };

        let Some(Capability::Prompt { handler, .. }) = self.capability(&prompt_get.name) else {
            return app_error_to_json_rpc(
                id,
                AppError::not_found(
                    "prompt_not_found",
                    format!("unknown prompt name: {}", prompt_get.name),
                ),
            );
        };

        match handler(prompt_get.arguments.unwrap_or_default()).await {
            Ok(result) => json_rpc_result(id, result),
            Err(err) => self.handler_failure(id, err),
        }
    }

    async fn call_tool(&self, id: Option<Value>, params: Option<Value>, context: ToolContext) -> Value {
        let Some(raw_params) = params else {
            return json_rpc_error(id, INVALID_PARAMS, "Invalid params");
        };

        let tool_call: CallToolRequestParams = match serde_json::from_value(raw_params) {
            Ok(value) => value,
            Err(_) => return json_rpc_error(id, INVALID_PARAMS, "Invalid params"),
        };

        let Some(Capability::Tool { handler, .. }) = self.capability(&tool_call.name) else {
            return app_error_to_json_rpc(
                id,
                AppError::not_found(
                    "tool_not_found",
                    format!("unknown tool name: {}", tool_call.name),
                ),
            );
        };

        match handler(tool_call.arguments.unwrap_or_default(), context).await {
            Ok(result) => self.serialize_result(id, result),
            Err(err) => self.handler_failure(id, err),
        }
    }

    async fn read_resource(&self, id: Option<Value>, params: Option<Value>) -> Value {
        let Some(raw_params) = params else {
            return json_rpc_error(id, INVALID_PARAMS, "Invalid params");
        };

        let resource_read: ReadResourceRequestParams = match serde_json::from_value(raw_params) {
            Ok(value) => value,
            Err(_) => return json_rpc_error(id, INVALID_PARAMS, "Invalid params"),
        };

        let handler = self.capabilities.values().find_map(|capability| match capability {
            Capability::Resource {
                descriptor,
                handler,
            } if descriptor.uri == resource_read.uri => Some(handler),
            _ => None,
        });

        let Some(handler) = handler else {
            return app_error_to_json_rpc(
                id,
                AppError::not_found(
                    "resource_not_found",
                    format!("unknown resource uri: {}", resource_read.uri),
                ),
            );
        };

        match handler(resource_read.uri).await {
            Ok(result) => self.serialize_result(id, result),
            Err(err) => self.handler_failure(id, err),
        }
    }

    fn handler_failure(&self, id: Option<Value>, err: AppError) -> Value {
        if !matches!(err, AppError::BadRequest { .. } | AppError::NotFound { .. }) {
            self.report(&err);
        }
        app_error_to_json_rpc(id, err)
    }

    fn serialize_result<T: Serialize>(&self, id: Option<Value>, result: T) -> Value {
        match serde_json::to_value(result) {
            Ok(value) => json_rpc_result(id, value),
            Err(err) => self.handler_failure(id, AppError::serialization(err)),
        }
    }

    pub fn prompt_descriptors(&self) -> Vec<PromptDescriptor> {
        self.capabilities
            .values()
            .filter_map(|capability| match capability {
                Capability::Prompt { descriptor, .. } => Some(descriptor.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_descriptors(&self) -> Vec<Tool> {
        self.capabilities
            .values()
            .filter_map(|capability| match capability {
                Capability::Tool { descriptor, .. } => Some(descriptor.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn resource_descriptors(&self) -> Vec<Resource> {
        self.capabilities
            .values()
            .filter_map(|capability| match capability {
                Capability::Resource { descriptor, .. } => Some(descriptor.clone()),
                _ => None,
            })
            .collect()
    }
}

pub fn validate_request_shape(request: &JsonrpcRequest) -> Result<(), Value> {
    let request_id = Some(request_id_to_value(request.id.clone()));
    let Ok(payload) = serde_json::to_value(request) else {
        return Err(json_rpc_error(request_id, INVALID_REQUEST, "Invalid Request"));
    };

    let valid = match request.method.as_str() {
        "tools/call" => serde_json::from_value::<CallToolRequest>(payload).is_ok(),
        "resources/read" => serde_json::from_value::<ReadResourceRequest>(payload).is_ok(),
        "prompts/get" => serde_json::from_value::<GetPromptRequest>(payload).is_ok(),
        "tools/list" => serde_json::from_value::<ListToolsRequest>(payload).is_ok(),
        "resources/list" => serde_json::from_value::<ListResourcesRequest>(payload).is_ok(),
        "prompts/list" => serde_json::from_value::<ListPromptsRequest>(payload).is_ok(),
        "ping" => serde_json::from_value::<PingRequest>(payload).is_ok(),
        "initialize" => serde_json::from_value::<InitializeRequest>(payload).is_ok(),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(json_rpc_error(request_id, INVALID_PARAMS, "Invalid params"))
    }
}

pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<&'static str, AppError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            AppError::bad_request(
                "invalid_protocol_version",
                "initialize params.protocolVersion is required",
            )
        })?;

    Ok(SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|version| *version == offered_version)
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use rust_mcp_sdk::{
        macros,
        schema::{ContentBlock, TextContent},
    };

    use super::*;

    #[macros::mcp_tool(name = "echo", description = "Echo the arguments back")]
    #[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
    struct EchoTool {
        message: Option<String>,
    }

    #[macros::mcp_tool(name = "broken", description = "Always fails")]
    #[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
    struct BrokenTool {
        reason: Option<String>,
    }

    struct NullSender;

    #[async_trait]
    impl NotificationSender for NullSender {
        async fn send(&self, _notification: Value) -> Result<(), AppError> {
            Ok(())
        }
    }

    fn server_with_echo_tool() -> McpServer {
        let mut server = McpServer::new("test-server", "0.0.1");
        server
            .register_tool(EchoTool::tool(), |arguments, _context| async move {
                Ok(CallToolResult {
                    content: vec![ContentBlock::from(TextContent::new(
                        Value::Object(arguments).to_string(),
                        None,
                        None,
                    ))],
                    is_error: None,
                    meta: None,
                    structured_content: None,
                })
            })
            .expect("register echo");
        server
    }

    async fn call(server: &McpServer, payload: Value) -> Option<Value> {
        server.handle_message(Arc::new(NullSender), payload).await
    }

    #[test]
    fn negotiate_protocol_version_echoes_supported_version() {
        let params = json!({ "protocolVersion": "2025-03-26" });

        let version = negotiate_protocol_version(Some(&params)).expect("supported version");
        assert_eq!(version, "2025-03-26");
    }

    #[test]
    fn negotiate_protocol_version_falls_back_to_latest() {
        let params = json!({ "protocolVersion": "2099-01-01" });

        let version = negotiate_protocol_version(Some(&params)).expect("fallback version");
        assert_eq!(version, SUPPORTED_PROTOCOL_VERSIONS[0]);
    }

    #[test]
    fn negotiate_protocol_version_requires_version() {
        let error = negotiate_protocol_version(Some(&json!({}))).expect_err("missing version");
        assert!(error.to_string().contains("bad request"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut server = server_with_echo_tool();
        let error = server
            .register_tool(EchoTool::tool(), |_arguments, _context| async move {
                Err(AppError::internal("unreachable"))
            })
            .expect_err("duplicate registration must fail");

        assert!(matches!(error, AppError::DuplicateCapability { name } if name == "echo"));
    }

    #[test]
    fn close_reports_only_the_first_call() {
        let server = McpServer::new("test-server", "0.0.1");
        let token = server.shutdown_token();

        assert!(server.close());
        assert!(!server.close());
        assert!(server.is_closed());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn tools_call_routes_to_registered_handler() {
        let server = server_with_echo_tool();
        let response = call(
            &server,
            json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"a":1}}}),
        )
        .await
        .expect("response");

        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["content"][0]["text"], "{\"a\":1}");
    }

    #[tokio::test]
    async fn unknown_tool_returns_tool_not_found_data() {
        let server = server_with_echo_tool();
        let response = call(
            &server,
            json!({"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"missing","arguments":{}}}),
        )
        .await
        .expect("response");

        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(response["error"]["data"]["code"], "tool_not_found");
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let server = server_with_echo_tool();
        let response = call(
            &server,
            json!({"jsonrpc":"2.0","method":"notifications/initialized"}),
        )
        .await;

        assert!(response.is_none());
    }

    #[tokio::test]
    async fn non_object_message_is_invalid_request() {
        let server = server_with_echo_tool();
        let response = call(&server, json!(42)).await.expect("response");

        assert_eq!(response["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn internal_handler_failures_reach_error_callback() {
        let reported = Arc::new(AtomicUsize::new(0));
        let mut server = McpServer::new("test-server", "0.0.1");
        server
            .register_tool(BrokenTool::tool(), |_arguments, _context| async move {
                Err(AppError::internal("handler exploded"))
            })
            .expect("register broken");
        let counter = Arc::clone(&reported);
        server.set_error_handler(Arc::new(move |_err| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let response = call(
            &server,
            json!({"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"broken","arguments":{}}}),
        )
        .await
        .expect("response");

        assert_eq!(response["error"]["code"], -32603);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }
}
