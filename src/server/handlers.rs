use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::SharedState;
use crate::config::MAX_ITERATIONS_CAP;
use crate::error::{McpError, McpResult};
use crate::orchestrator::SubmitOptions;

/// Name of the question-answering tool.
pub const SECURITY_ASSESS_TOOL: &str = "security_assess";
/// Name of the configuration inspection tool.
pub const SECURITY_CONFIG_TOOL: &str = "security_config";

/// Route tool calls to appropriate handlers.
///
/// `cancel` is fired when the client sends `notifications/cancelled` for
/// this call.
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
    cancel: CancellationToken,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        SECURITY_ASSESS_TOOL => handle_security_assess(state, arguments, cancel).await,
        SECURITY_CONFIG_TOOL => handle_security_config(state),
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

/// Arguments of [`SECURITY_ASSESS_TOOL`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityAssessParams {
    /// Natural-language security question.
    pub question: String,
    /// Rephrase cycles allowed for this question.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Session deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl SecurityAssessParams {
    fn validate(&self) -> Result<(), String> {
        if let Some(max_iterations) = self.max_iterations {
            if max_iterations > MAX_ITERATIONS_CAP {
                return Err(format!(
                    "max_iterations must be at most {}, got {}",
                    MAX_ITERATIONS_CAP, max_iterations
                ));
            }
        }
        if self.timeout_ms == Some(0) {
            return Err("timeout_ms must be positive".to_string());
        }
        Ok(())
    }

    fn into_options(self, cancel: CancellationToken) -> SubmitOptions {
        SubmitOptions {
            max_iterations: self.max_iterations,
            timeout: self.timeout_ms.map(Duration::from_millis),
            cancel: Some(cancel),
        }
    }
}

/// Handle security_assess tool call
async fn handle_security_assess(
    state: &SharedState,
    arguments: Option<Value>,
    cancel: CancellationToken,
) -> McpResult<Value> {
    execute_handler(
        SECURITY_ASSESS_TOOL,
        arguments,
        |params: SecurityAssessParams| async move {
            let start = Instant::now();
            let question = params.question.clone();
            let response = state
                .orchestrator
                .submit(&question, params.into_options(cancel))
                .await;
            info!(
                session_id = %response.session_id,
                status = ?response.status,
                latency_ms = start.elapsed().as_millis(),
                "security_assess completed"
            );
            response
        },
    )
    .await
}

/// Effective pipe names and limits.
#[derive(Debug, Serialize)]
pub struct SecurityConfigResponse {
    /// Pipe name per judgment or agent.
    pub pipes: Value,
    /// Session limits.
    pub max_iterations: u32,
    /// Node visits allowed per session.
    pub step_budget: u32,
    /// Default session deadline.
    pub session_timeout_ms: u64,
    /// Attempts per rate-limited call.
    pub max_retries: u32,
    /// Backoff base delay.
    pub retry_delay_ms: u64,
    /// Neo4j database queried for log evidence.
    pub neo4j_database: String,
    /// External knowledge graph endpoint.
    pub sparql_endpoint: String,
}

/// Handle security_config tool call
fn handle_security_config(state: &SharedState) -> McpResult<Value> {
    let config = &state.config;
    let response = SecurityConfigResponse {
        pipes: serde_json::json!({
            "guardrail": config.pipes.guardrail,
            "router": config.pipes.router,
            "review": config.pipes.review,
            "rephrase": config.pipes.rephrase,
            "synthesizer": config.pipes.synthesizer,
            "cypher": config.pipes.cypher,
            "knowledge_agent": config.pipes.knowledge_agent,
        }),
        max_iterations: config.orchestrator.max_iterations,
        step_budget: config.orchestrator.step_budget,
        session_timeout_ms: config.orchestrator.session_timeout_ms,
        max_retries: config.request.max_retries,
        retry_delay_ms: config.request.retry_delay_ms,
        neo4j_database: config.neo4j.database.clone(),
        sparql_endpoint: config.knowledge_graph.sparql_endpoint.clone(),
    };
    serde_json::to_value(response).map_err(McpError::Json)
}

// ============================================================================
// Helper functions
// ============================================================================

/// Helper to parse arguments with consistent error handling
fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Parse and validate arguments, run the operation, serialize its result.
async fn execute_handler<R, F, Fut>(
    tool_name: &str,
    arguments: Option<Value>,
    operation: F,
) -> McpResult<Value>
where
    R: Serialize,
    F: FnOnce(SecurityAssessParams) -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let params: SecurityAssessParams = parse_arguments(tool_name, arguments)?;
    params
        .validate()
        .map_err(|message| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message,
        })?;

    let result = operation(params).await;
    serde_json::to_value(result).map_err(McpError::Json)
}
