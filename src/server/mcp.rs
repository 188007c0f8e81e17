//! MCP protocol implementation for JSON-RPC 2.0 communication.
//!
//! This module provides the core MCP server implementation including:
//! - JSON-RPC 2.0 request/response handling
//! - Tool definitions and schemas
//! - Stdio-based server communication, with tool calls running concurrently
//!   and cancellable through `notifications/cancelled`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{handle_tool_call, SharedState, SECURITY_ASSESS_TOOL, SECURITY_CONFIG_TOOL};

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request identifier (null if notification, always serialized per JSON-RPC 2.0).
    pub id: Value,
    /// The result on success (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    /// Error code (negative for predefined errors).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP server information returned during initialization.
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    /// The server name identifier.
    pub name: String,
    /// The server version string.
    pub version: String,
}

/// MCP server capabilities advertised to clients.
#[derive(Debug, Serialize)]
pub struct Capabilities {
    /// Tool-related capabilities.
    pub tools: ToolCapabilities,
}

/// Tool-specific capabilities.
#[derive(Debug, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change dynamically.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Result of the MCP initialize handshake.
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    /// The MCP protocol version supported.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: Capabilities,
    /// Server identification information.
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// MCP tool definition with JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    /// Unique tool name (used in tool calls).
    pub name: String,
    /// Human-readable description of the tool.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Parameters of a `notifications/cancelled` notification.
#[derive(Debug, Deserialize)]
pub struct CancelledParams {
    /// Id of the request to cancel.
    #[serde(rename = "requestId")]
    pub request_id: Value,
    /// Optional human-readable reason.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Parameters for a tools/call request.
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    /// The name of the tool to invoke.
    pub name: String,
    /// Optional arguments for the tool.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Content item within a tool result.
#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    /// The content type (e.g., "text").
    #[serde(rename = "type")]
    pub content_type: String,
    /// The text content of the result.
    pub text: String,
}

/// Result of a tool invocation.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    /// The result content items.
    pub content: Vec<ToolResultContent>,
    /// Whether the result represents an error.
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// MCP Server running over stdio.
///
/// Handles JSON-RPC 2.0 messages over stdin/stdout. `tools/call` requests
/// run as separate tasks so that a long assessment does not block `ping`
/// or a cancellation notification for it.
#[derive(Clone)]
pub struct McpServer {
    /// Shared application state.
    state: SharedState,
    /// Cancellation handles of running tool calls, keyed by request id.
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl McpServer {
    /// Create a new MCP server
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the server using async stdio
    pub async fn run(&self) -> std::io::Result<()> {
        info!("Vulnerability assessment MCP server starting...");

        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(response) = rx.recv().await {
                let response_json = serde_json::to_string(&response)?;
                debug!(response = %response_json, "Sending response");

                stdout.write_all(response_json.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();
        let mut tasks = JoinSet::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            // EOF reached
            if bytes_read == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(request = %trimmed, "Received request");

            let request = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    let _ = tx.send(JsonRpcResponse::error(
                        None,
                        -32700,
                        format!("Parse error: {}", e),
                    ));
                    continue;
                }
            };

            self.dispatch(request, &mut tasks, &tx).await;

            // Reap finished tool calls so the set does not grow unbounded.
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Tool call task failed");
                }
            }
        }

        self.cancel_all();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Tool call task failed");
            }
        }
        drop(tx);

        match writer.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
    }

    /// Route one message from the read loop.
    ///
    /// Tool calls are registered for cancellation before their task is
    /// spawned, so a cancel on the very next line always finds its token.
    async fn dispatch(
        &self,
        request: JsonRpcRequest,
        tasks: &mut JoinSet<()>,
        tx: &mpsc::UnboundedSender<JsonRpcResponse>,
    ) {
        if request.method == "tools/call" {
            let (key, token) = self.register(&request.id);
            let server = self.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                if let Some(response) = server
                    .run_tool_call(request.id, request.params, key, token)
                    .await
                {
                    let _ = tx.send(response);
                }
            });
        } else if let Some(response) = self.handle_request(request).await {
            let _ = tx.send(response);
        }
    }

    /// Handle a single JSON-RPC request
    /// Returns None for notifications (requests without id) per JSON-RPC 2.0
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        // Check if this is a notification (no id = no response required)
        let is_notification = request.id.is_none();

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id)),
            "initialized" | "notifications/initialized" => {
                debug!("Received initialized notification");
                None
            }
            "notifications/cancelled" => {
                self.handle_cancelled(request.params);
                None
            }
            "tools/list" => Some(self.handle_tools_list(request.id)),
            "tools/call" => {
                let (key, token) = self.register(&request.id);
                self.run_tool_call(request.id, request.params, key, token)
                    .await
            }
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method => {
                // For unknown methods, only respond if it's a request (has id)
                if is_notification {
                    debug!(method = %method, "Unknown notification, ignoring");
                    None
                } else {
                    error!(method = %method, "Unknown method");
                    Some(JsonRpcResponse::error(
                        request.id,
                        -32601,
                        format!("Method not found: {}", method),
                    ))
                }
            }
        }
    }

    /// Handle initialize request
    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling initialize request");

        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: Capabilities {
                tools: ToolCapabilities {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: "vuln-graph-rag".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        match serde_json::to_value(result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize initialize result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        }
    }

    /// Handle tools/list request
    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling tools/list request");

        JsonRpcResponse::success(
            id,
            serde_json::json!({
                "tools": all_tools()
            }),
        )
    }

    /// Fire the cancellation token of a running tool call.
    fn handle_cancelled(&self, params: Option<Value>) {
        let params: CancelledParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            _ => {
                warn!("Ignoring malformed cancelled notification");
                return;
            }
        };

        let key = request_key(&params.request_id);
        let token = self
            .in_flight
            .lock()
            .ok()
            .and_then(|in_flight| in_flight.get(&key).cloned());
        match token {
            Some(token) => {
                info!(
                    request_id = %key,
                    reason = params.reason.as_deref().unwrap_or(""),
                    "Cancelling tool call"
                );
                token.cancel();
            }
            None => debug!(request_id = %key, "Cancel for unknown or finished request"),
        }
    }

    fn register(&self, id: &Option<Value>) -> (Option<String>, CancellationToken) {
        let token = CancellationToken::new();
        let key = id.as_ref().map(request_key);
        if let (Some(key), Ok(mut in_flight)) = (&key, self.in_flight.lock()) {
            in_flight.insert(key.clone(), token.clone());
        }
        (key, token)
    }

    fn unregister(&self, key: &Option<String>) {
        if let (Some(key), Ok(mut in_flight)) = (key, self.in_flight.lock()) {
            in_flight.remove(key);
        }
    }

    fn cancel_all(&self) {
        if let Ok(in_flight) = self.in_flight.lock() {
            for token in in_flight.values() {
                token.cancel();
            }
        }
    }

    /// Run an already registered tools/call and release its token.
    ///
    /// A call cancelled by the client gets no response.
    async fn run_tool_call(
        &self,
        id: Option<Value>,
        params: Option<Value>,
        key: Option<String>,
        token: CancellationToken,
    ) -> Option<JsonRpcResponse> {
        let response = self.handle_tool_call(id, params, &token).await;
        self.unregister(&key);

        if token.is_cancelled() {
            info!(request_id = ?key, "Tool call cancelled by client, dropping response");
            return None;
        }
        response
    }

    async fn handle_tool_call(
        &self,
        id: Option<Value>,
        params: Option<Value>,
        token: &CancellationToken,
    ) -> Option<JsonRpcResponse> {
        let params: ToolCallParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(p) => p,
                Err(e) => {
                    return Some(JsonRpcResponse::error(
                        id,
                        -32602,
                        format!("Invalid params: {}", e),
                    ));
                }
            },
            None => {
                return Some(JsonRpcResponse::error(id, -32602, "Missing params"));
            }
        };

        info!(tool = %params.name, "Handling tool call");

        let result =
            handle_tool_call(&self.state, &params.name, params.arguments, token.clone()).await;

        let (content, is_error) = match result {
            Ok(result) => {
                let failed = result.get("status").and_then(Value::as_str) == Some("failed");
                let text = serde_json::to_string_pretty(&result).unwrap_or_else(|e| {
                    error!(error = %e, "Failed to serialize tool result");
                    format!("{{\"error\": \"Serialization failed: {}\"}}", e)
                });
                (
                    ToolResultContent {
                        content_type: "text".to_string(),
                        text,
                    },
                    failed.then_some(true),
                )
            }
            Err(e) => (
                ToolResultContent {
                    content_type: "text".to_string(),
                    text: format!("Error: {}", e),
                },
                Some(true),
            ),
        };

        let tool_result = ToolCallResult {
            content: vec![content],
            is_error,
        };

        Some(match serde_json::to_value(tool_result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize tool call result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        })
    }
}

/// Stable map key for a JSON-RPC id.
fn request_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Every tool advertised by `tools/list`.
pub fn all_tools() -> Vec<Tool> {
    vec![get_security_assess_tool(), get_security_config_tool()]
}

/// Get the security assessment tool definition
fn get_security_assess_tool() -> Tool {
    Tool {
        name: SECURITY_ASSESS_TOOL.to_string(),
        description: "Answer a vulnerability assessment question. The question is checked for relevance, routed to log analysis (keyword search and generated Cypher over the event graph) or knowledge lookup (SPARQL agent over the CVE/CWE/CAPEC knowledge graph), reviewed for sufficient evidence with bounded rephrasing, and synthesized into a report. Returns session_id, answer, route, iterations, status (answered, degraded, rejected, failed) and an error kind when failed.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "Natural-language security question"
                },
                "max_iterations": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": crate::config::MAX_ITERATIONS_CAP,
                    "description": "Rephrase cycles allowed when evidence is insufficient"
                },
                "timeout_ms": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Session deadline in milliseconds"
                }
            },
            "required": ["question"],
            "additionalProperties": false
        }),
    }
}

/// Get the configuration inspection tool definition
fn get_security_config_tool() -> Tool {
    Tool {
        name: SECURITY_CONFIG_TOOL.to_string(),
        description: "Inspect the pipe names, session limits and retry policy the server is using.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }),
    }
}
