//! Orchestration engine.
//!
//! One question becomes one [`SessionState`] that is driven through the
//! [`Node`] state machine by [`Orchestrator`]: relevance gate, route,
//! retrieval, sufficiency review, a bounded rephrase loop, and synthesis.
//! Every terminal outcome is reported with the same [`SubmitResponse`] shape.

mod engine;
mod machine;
mod state;

pub use engine::*;
pub use machine::*;
pub use state::*;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::judgment::Route;

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Rephrase cycles allowed; defaults to the configured value.
    pub max_iterations: Option<u32>,
    /// Session deadline; defaults to the configured session timeout.
    pub timeout: Option<Duration>,
    /// Caller-owned cancellation token.
    pub cancel: Option<CancellationToken>,
}

impl SubmitOptions {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Synthesized from evidence judged sufficient.
    Answered,
    /// Synthesized without sufficient evidence.
    Degraded,
    /// Stopped at the relevance gate.
    Rejected,
    /// Ended by a typed error.
    Failed,
}

/// Result of one question, whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub session_id: String,
    pub answer: String,
    pub is_relevant: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    pub iterations: u32,
    pub status: ResponseStatus,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_submit_response_serialization() {
        let response = SubmitResponse {
            session_id: "s-1".to_string(),
            answer: "CVSS 9.8".to_string(),
            is_relevant: true,
            route: Some(Route::KnowledgeLookup),
            iterations: 0,
            status: ResponseStatus::Answered,
            degraded: false,
            error: None,
        };

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "session_id": "s-1",
                "answer": "CVSS 9.8",
                "is_relevant": true,
                "route": "knowledge_lookup",
                "iterations": 0,
                "status": "answered",
                "degraded": false
            })
        );
    }

    #[test]
    fn test_failed_response_includes_error_kind() {
        let response = SubmitResponse {
            session_id: "s-2".to_string(),
            answer: String::new(),
            is_relevant: true,
            route: None,
            iterations: 0,
            status: ResponseStatus::Failed,
            degraded: false,
            error: Some(ErrorKind::BudgetExceeded),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "budget_exceeded");
        assert!(value.get("route").is_none());
    }

    #[test]
    fn test_submit_options_builders() {
        let token = CancellationToken::new();
        let options = SubmitOptions::default()
            .with_max_iterations(2)
            .with_timeout(Duration::from_secs(5))
            .with_cancel(token.clone());
        assert_eq!(options.max_iterations, Some(2));
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
        token.cancel();
        assert!(options.cancel.unwrap().is_cancelled());
    }
}
