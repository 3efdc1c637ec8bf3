//! Streamable HTTP transport for a single exchange
//!
//! Wraps one HTTP request/response pair into a duplex message channel: the
//! request body feeds the connected [`McpServer`], and responses plus any
//! server notifications flow back either as one JSON body or as an SSE stream.
//! Session ids are only issued when a generator is configured; the `/mcp`
//! endpoint always runs stateless.

use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Config, DEFAULT_OUTBOUND_BUFFER};
use crate::errors::AppError;
use crate::mcp::rpc::{is_notification, json_rpc_error, INVALID_REQUEST};
use crate::mcp::server::{ErrorCallback, McpServer};

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

const SSE_MESSAGE_EVENT: &str = "message";

/// Something that can deliver one JSON-RPC notification to the client.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: Value) -> Result<(), AppError>;
}

pub type SessionIdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Json,
    EventStream,
}

impl ResponseMode {
    /// SSE when the client accepts `text/event-stream`, plain JSON otherwise.
    pub fn negotiate(headers: &HeaderMap) -> Self {
        let accepts_stream = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.contains("text/event-stream"));

        if accepts_stream {
            Self::EventStream
        } else {
            Self::Json
        }
    }
}

/// Process-wide transport tuning shared by every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub outbound_buffer: usize,
    pub keep_alive: Option<Duration>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            keep_alive: None,
        }
    }
}

impl From<&Config> for TransportSettings {
    fn from(config: &Config) -> Self {
        Self {
            outbound_buffer: config.outbound_buffer,
            keep_alive: config.sse_keep_alive(),
        }
    }
}

#[derive(Clone)]
pub struct TransportOptions {
    pub session_id_generator: Option<SessionIdGenerator>,
    pub response_mode: ResponseMode,
    pub outbound_buffer: usize,
    pub keep_alive: Option<Duration>,
}

impl TransportOptions {
    /// Options with session-id generation disabled.
    pub fn stateless(response_mode: ResponseMode, settings: TransportSettings) -> Self {
        Self {
            session_id_generator: None,
            response_mode,
            outbound_buffer: settings.outbound_buffer,
            keep_alive: settings.keep_alive,
        }
    }
}

pub struct StreamableHttpTransport {
    options: TransportOptions,
    session_id: Option<String>,
    closed: CancellationToken,
    closed_flag: AtomicBool,
    on_error: Option<ErrorCallback>,
}

impl StreamableHttpTransport {
    pub fn new(options: TransportOptions) -> Self {
        let session_id = options
            .session_id_generator
            .as_ref()
            .map(|generate| generate());

        Self {
            options,
            session_id,
            closed: CancellationToken::new(),
            closed_flag: AtomicBool::new(false),
            on_error: None,
        }
    }

    pub fn set_error_handler(&mut self, callback: ErrorCallback) {
        self.on_error = Some(callback);
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn response_mode(&self) -> ResponseMode {
        self.options.response_mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that actually closed the transport.
    pub fn close(&self) -> bool {
        if self.closed_flag.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.closed.cancel();
        true
    }

    fn report(&self, err: &AppError) {
        if let Some(callback) = &self.on_error {
            callback(err);
        }
    }
}

/// Outbound half of a connected transport, handed to the dispatcher and to
/// tools that stream notifications.
#[derive(Clone)]
pub struct TransportPeer {
    outbound: mpsc::Sender<Value>,
    closed: CancellationToken,
}

#[async_trait]
impl NotificationSender for TransportPeer {
    async fn send(&self, notification: Value) -> Result<(), AppError> {
        if self.closed.is_cancelled() {
            return Err(AppError::TransportClosed);
        }

        tokio::select! {
            _ = self.closed.cancelled() => Err(AppError::TransportClosed),
            sent = self.outbound.send(notification) => sent.map_err(|_| AppError::TransportClosed),
        }
    }
}

/// Closes transport and server together when dropped.
///
/// The guard has a single owner (the handler scope or the SSE body), so the
/// teardown runs exactly once whichever way the exchange ends.
pub struct CloseGuard {
    server: Arc<McpServer>,
    transport: StreamableHttpTransport,
}

impl CloseGuard {
    fn report(&self, err: &AppError) {
        self.transport.report(err);
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let transport_closed = self.transport.close();
        let server_closed = self.server.close();
        if transport_closed || server_closed {
            debug!(server = %self.server.name(), "mcp transport closed");
        }
    }
}

/// A server connected to the transport of one HTTP exchange.
pub struct Connection {
    server: Arc<McpServer>,
    peer: TransportPeer,
    outbound: mpsc::Receiver<Value>,
    guard: CloseGuard,
}

impl Connection {
    pub(crate) fn establish(server: Arc<McpServer>, transport: StreamableHttpTransport) -> Self {
        let (sender, outbound) = mpsc::channel(transport.options.outbound_buffer.max(1));
        let peer = TransportPeer {
            outbound: sender,
            closed: transport.closed.clone(),
        };

        debug!(
            server = %server.name(),
            mode = ?transport.response_mode(),
            "mcp transport opened"
        );

        Self {
            guard: CloseGuard {
                server: Arc::clone(&server),
                transport,
            },
            server,
            peer,
            outbound,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.guard.transport.session_id()
    }

    /// Feeds the request payload to the server and builds the HTTP response.
    ///
    /// In JSON mode the connection is torn down when this returns; in SSE mode
    /// teardown is deferred to the end of the response body.
    pub async fn handle_request(self, payload: Value) -> Result<Response, AppError> {
        let is_batch = payload.is_array();
        let messages = match payload {
            Value::Array(items) => items,
            single => vec![single],
        };

        if messages.is_empty() {
            return Ok(self.finish(
                StatusCode::OK,
                Json(vec![json_rpc_error(None, INVALID_REQUEST, "Invalid Request")]).into_response(),
            ));
        }

        if messages.iter().all(is_notification) {
            let notifier: Arc<dyn NotificationSender> = Arc::new(self.peer.clone());
            for message in messages {
                let _ = self
                    .server
                    .handle_message(Arc::clone(&notifier), message)
                    .await;
            }
            return Ok(self.finish(StatusCode::ACCEPTED, StatusCode::ACCEPTED.into_response()));
        }

        match self.guard.transport.response_mode() {
            ResponseMode::Json => self.respond_json(messages, is_batch).await,
            ResponseMode::EventStream => Ok(self.respond_event_stream(messages)),
        }
    }

    async fn respond_json(self, messages: Vec<Value>, is_batch: bool) -> Result<Response, AppError> {
        let notifier: Arc<dyn NotificationSender> = Arc::new(self.peer.clone());
        let mut responses = Vec::with_capacity(messages.len());
        for message in messages {
            if let Some(response) = self
                .server
                .handle_message(Arc::clone(&notifier), message)
                .await
            {
                responses.push(response);
            }
        }

        let body = if is_batch {
            Value::Array(responses)
        } else {
            match responses.into_iter().next() {
                Some(response) => response,
                None => {
                    return Ok(
                        self.finish(StatusCode::ACCEPTED, StatusCode::ACCEPTED.into_response())
                    )
                }
            }
        };

        let encoded = serde_json::to_vec(&body).map_err(AppError::serialization)?;
        let response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            encoded,
        )
            .into_response();

        Ok(self.finish(StatusCode::OK, response))
    }

    fn respond_event_stream(self, messages: Vec<Value>) -> Response {
        let Connection {
            server,
            peer,
            outbound,
            guard,
        } = self;
        let keep_alive = guard.transport.options.keep_alive;
        let session_id = guard.transport.session_id().map(str::to_string);

        tokio::spawn(async move {
            let notifier: Arc<dyn NotificationSender> = Arc::new(peer.clone());
            for message in messages {
                let Some(response) = server.handle_message(Arc::clone(&notifier), message).await
                else {
                    continue;
                };

                if let Err(err) = peer.send(response).await {
                    warn!(error = %err, "dropping response for closed transport");
                    break;
                }
            }
        });

        let events = futures::stream::unfold((outbound, guard), |(mut outbound, guard)| async move {
            let Some(message) = outbound.recv().await else {
                return None;
            };
            let event = match serde_json::to_string(&message) {
                Ok(data) => Event::default().event(SSE_MESSAGE_EVENT).data(data),
                Err(err) => {
                    guard.report(&AppError::serialization(err));
                    Event::default().comment("dropped unencodable message")
                }
            };
            Some((Ok::<Event, Infallible>(event), (outbound, guard)))
        });

        let sse = Sse::new(events);
        let mut response = match keep_alive {
            Some(interval) => sse
                .keep_alive(KeepAlive::new().interval(interval))
                .into_response(),
            None => sse.into_response(),
        };
        attach_session_header(&mut response, session_id.as_deref());
        response
    }

    fn finish(self, status: StatusCode, mut response: Response) -> Response {
        *response.status_mut() = status;
        attach_session_header(&mut response, self.session_id());
        response
    }
}

fn attach_session_header(response: &mut Response, session_id: Option<&str>) {
    let Some(session_id) = session_id else {
        return;
    };

    match HeaderValue::from_str(session_id) {
        Ok(value) => {
            response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
        }
        Err(_) => warn!("generated session id is not a valid header value"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn transport(mode: ResponseMode) -> StreamableHttpTransport {
        StreamableHttpTransport::new(TransportOptions::stateless(
            mode,
            TransportSettings::default(),
        ))
    }

    #[test]
    fn negotiates_event_stream_from_accept_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        assert_eq!(ResponseMode::negotiate(&headers), ResponseMode::EventStream);

        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert_eq!(ResponseMode::negotiate(&headers), ResponseMode::Json);

        assert_eq!(ResponseMode::negotiate(&HeaderMap::new()), ResponseMode::Json);
    }

    #[test]
    fn stateless_transport_has_no_session_id() {
        assert_eq!(transport(ResponseMode::Json).session_id(), None);
    }

    #[test]
    fn configured_generator_issues_session_id() {
        let mut options =
            TransportOptions::stateless(ResponseMode::Json, TransportSettings::default());
        options.session_id_generator = Some(Arc::new(|| "session-1".to_string()));

        assert_eq!(
            StreamableHttpTransport::new(options).session_id(),
            Some("session-1")
        );
    }

    #[test]
    fn transport_close_is_idempotent() {
        let transport = transport(ResponseMode::Json);

        assert!(transport.close());
        assert!(!transport.close());
        assert!(transport.is_closed());
    }

    #[test]
    fn dropping_connection_closes_server_and_transport() {
        let server = McpServer::new("test-server", "0.0.1");
        let shutdown = server.shutdown_token();
        let connection = server.connect(transport(ResponseMode::Json));
        let peer_closed = connection.peer.closed.clone();

        drop(connection);

        assert!(shutdown.is_cancelled());
        assert!(peer_closed.is_cancelled());
    }

    #[tokio::test]
    async fn peer_send_fails_after_close() {
        let server = McpServer::new("test-server", "0.0.1");
        let connection = server.connect(transport(ResponseMode::Json));
        let peer = connection.peer.clone();

        drop(connection);

        let error = peer
            .send(json!({"jsonrpc":"2.0","method":"notifications/message"}))
            .await
            .expect_err("closed transport must reject sends");
        assert!(matches!(error, AppError::TransportClosed));
    }

    #[tokio::test]
    async fn notification_only_payload_is_accepted() {
        let server = McpServer::new("test-server", "0.0.1");
        let connection = server.connect(transport(ResponseMode::EventStream));

        let response = connection
            .handle_request(json!({"jsonrpc":"2.0","method":"notifications/initialized"}))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let server = McpServer::new("test-server", "0.0.1");
        let connection = server.connect(transport(ResponseMode::Json));

        let response = connection
            .handle_request(json!([]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
