//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and routing
//! - Shared application state management

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;

use crate::config::Config;
use crate::error::ServiceResult;
use crate::orchestrator::Orchestrator;

/// Application state shared across handlers.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Session engine with its live collaborators.
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Create application state around an existing orchestrator.
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        tracing::info!(
            guardrail_pipe = %config.pipes.guardrail,
            router_pipe = %config.pipes.router,
            max_iterations = config.orchestrator.max_iterations,
            step_budget = config.orchestrator.step_budget,
            "AppState initializing"
        );
        Self {
            config,
            orchestrator,
        }
    }

    /// Build state with live collaborators wired from `config`.
    pub fn from_config(config: Config) -> ServiceResult<Self> {
        let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
        Ok(Self::new(config, orchestrator))
    }
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            orchestrator: Arc::clone(&self.orchestrator),
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{
        KnowledgeGraphConfig, LangbaseConfig, LogFormat, LoggingConfig, Neo4jConfig,
        OrchestratorConfig, PipeConfig, RequestConfig,
    };
    use crate::prompts::DEFAULT_GRAPH_SCHEMA;

    pub fn create_test_config() -> Config {
        Config {
            langbase: LangbaseConfig {
                api_key: "test-key".to_string(),
                base_url: "https://api.langbase.com".to_string(),
            },
            neo4j: Neo4jConfig {
                uri: "http://localhost:7474".to_string(),
                username: "neo4j".to_string(),
                password: "password".to_string(),
                database: "neo4j".to_string(),
                keyword_index: "keyword".to_string(),
                schema: DEFAULT_GRAPH_SCHEMA.to_string(),
            },
            knowledge_graph: KnowledgeGraphConfig {
                sparql_endpoint: "http://localhost:8890/sparql".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            request: RequestConfig::default(),
            pipes: PipeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }

    pub fn create_test_state() -> SharedState {
        Arc::new(AppState::from_config(create_test_config()).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_app_state_from_config() {
        let state = AppState::from_config(create_test_config()).unwrap();
        assert_eq!(state.config.langbase.api_key, "test-key");
        assert_eq!(state.orchestrator.config().max_iterations, 3);
    }

    #[test]
    fn test_app_state_clone_shares_orchestrator() {
        let state1 = AppState::from_config(create_test_config()).unwrap();
        let state2 = state1.clone();

        assert!(Arc::ptr_eq(&state1.orchestrator, &state2.orchestrator));
        assert_eq!(state1.config.neo4j.database, state2.config.neo4j.database);
    }

    #[test]
    fn test_shared_state_type() {
        let shared = create_test_state();
        let shared2 = Arc::clone(&shared);
        assert_eq!(Arc::strong_count(&shared), 2);
        drop(shared2);
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
