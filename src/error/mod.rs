use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),
}

/// Errors raised by external collaborators (Langbase pipes, Neo4j, SPARQL).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request rejected: {message}")]
    Rejected { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure of a call made through the resilient invoker.
#[derive(Debug, Error)]
pub enum InvokeError<E> {
    #[error("{0}")]
    Failed(#[source] E),

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },
}

impl<E> InvokeError<E> {
    /// Whether the call was abandoned because of cancellation or deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InvokeError::Cancelled { .. })
    }
}

/// Fatal or typed failures of an orchestration session.
///
/// Adapter failures never appear here: they are absorbed into the session's
/// evidence as error fragments.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Judgment '{judgment}' failed: {message}")]
    JudgmentFailure { judgment: String, message: String },

    #[error("Orchestration budget exceeded: {visits} node visits (limit {limit})")]
    BudgetExceeded { visits: u32, limit: u32 },

    #[error("Session cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Invalid transition: {message}")]
    InvalidTransition { message: String },
}

/// Stable, serializable error category reported in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    JudgmentFailure,
    BudgetExceeded,
    Cancelled,
    InvalidTransition,
}

impl OrchestrationError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::JudgmentFailure { .. } => ErrorKind::JudgmentFailure,
            OrchestrationError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            OrchestrationError::Cancelled { .. } => ErrorKind::Cancelled,
            OrchestrationError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
        }
    }
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for external service calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");
    }

    #[test]
    fn test_service_error_display() {
        let err = ServiceError::Api {
            status: 429,
            message: "slow down".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 429 - slow down");

        let err = ServiceError::InvalidResponse {
            message: "malformed JSON".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid response: malformed JSON");

        let err = ServiceError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");

        let err = ServiceError::Rejected {
            message: "write clause".to_string(),
        };
        assert_eq!(err.to_string(), "Request rejected: write clause");
    }

    #[test]
    fn test_invoke_error_display() {
        let err: InvokeError<ServiceError> = InvokeError::RetryExhausted {
            attempts: 5,
            source: ServiceError::Api {
                status: 429,
                message: "quota".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "Retries exhausted after 5 attempts: API error: 429 - quota"
        );
        assert!(!err.is_cancelled());

        let err: InvokeError<ServiceError> = InvokeError::Cancelled {
            reason: "token cancelled".to_string(),
        };
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_orchestration_error_kind() {
        let err = OrchestrationError::BudgetExceeded {
            visits: 41,
            limit: 40,
        };
        assert_eq!(err.kind(), ErrorKind::BudgetExceeded);
        assert_eq!(
            err.to_string(),
            "Orchestration budget exceeded: 41 node visits (limit 40)"
        );

        let err = OrchestrationError::Cancelled {
            reason: "deadline".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::JudgmentFailure).unwrap();
        assert_eq!(json, "\"judgment_failure\"");
    }

    #[test]
    fn test_mcp_error_display() {
        let err = McpError::UnknownTool {
            tool_name: "nonexistent".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown tool: nonexistent");

        let err = McpError::InvalidParameters {
            tool_name: "security_assess".to_string(),
            message: "missing question".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid parameters for security_assess: missing question"
        );
    }

    #[test]
    fn test_service_error_conversion_to_app_error() {
        let err = ServiceError::Timeout { timeout_ms: 1000 };
        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::Service(_)));
    }

    #[test]
    fn test_orchestration_error_conversion_to_app_error() {
        let err = OrchestrationError::InvalidTransition {
            message: "answer set twice".to_string(),
        };
        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::Orchestration(_)));
    }
}
