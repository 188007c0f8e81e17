use std::env;
use std::time::Duration;

use crate::error::AppError;
use crate::prompts::DEFAULT_GRAPH_SCHEMA;

/// Upper bound accepted for `max_iterations`, globally and per request.
pub const MAX_ITERATIONS_CAP: u32 = 10;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    pub neo4j: Neo4jConfig,
    pub knowledge_graph: KnowledgeGraphConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Neo4j HTTP endpoint configuration
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Full-text index queried by keyword search.
    pub keyword_index: String,
    /// Schema description handed to query generation and rephrasing.
    pub schema: String,
}

/// External knowledge graph (SPARQL) configuration
#[derive(Debug, Clone)]
pub struct KnowledgeGraphConfig {
    pub sparql_endpoint: String,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request and retry configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    /// Total attempts allowed for a rate-limited call.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Langbase pipe name configuration
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub guardrail: String,
    pub router: String,
    pub review: String,
    pub rephrase: String,
    pub synthesizer: String,
    pub cypher: String,
    pub knowledge_agent: String,
}

/// Orchestration engine limits
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Default bound on rephrase-retry cycles.
    pub max_iterations: u32,
    /// Maximum node visits per session.
    pub step_budget: u32,
    /// Default per-session deadline.
    pub session_timeout_ms: u64,
    /// Hits requested from keyword/vector search.
    pub vector_top_k: usize,
    /// Row limit appended to generated Cypher.
    pub cypher_top_k: usize,
    /// Tool-call steps allowed to the knowledge graph agent.
    pub agent_max_steps: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").map_err(|_| AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let neo4j = Neo4jConfig {
            uri: first_env(&["NEO4J_URI", "NEO4J_AURA"]).ok_or_else(|| AppError::Config {
                message: "NEO4J_URI (or NEO4J_AURA) is required".to_string(),
            })?,
            username: first_env(&["NEO4J_USERNAME", "NEO4J_AURA_USERNAME"])
                .unwrap_or_else(|| "neo4j".to_string()),
            password: first_env(&["NEO4J_PASSWORD", "NEO4J_AURA_PASSWORD"]).unwrap_or_default(),
            database: first_env(&["NEO4J_DATABASE", "NEO4J_AURA_DATABASE"])
                .unwrap_or_else(|| "neo4j".to_string()),
            keyword_index: env::var("NEO4J_KEYWORD_INDEX").unwrap_or_else(|_| "keyword".to_string()),
            schema: env::var("NEO4J_SCHEMA").unwrap_or_else(|_| DEFAULT_GRAPH_SCHEMA.to_string()),
        };

        let knowledge_graph = KnowledgeGraphConfig {
            sparql_endpoint: env::var("SPARQL_ENDPOINT")
                .unwrap_or_else(|_| "https://sepses.ifs.tuwien.ac.at/sparql".to_string()),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_env("REQUEST_TIMEOUT_MS", 30000),
            max_retries: parse_env("MAX_RETRIES", 5),
            retry_delay_ms: parse_env("RETRY_DELAY_MS", 1000),
        };

        let pipes = PipeConfig {
            guardrail: env::var("PIPE_GUARDRAIL")
                .unwrap_or_else(|_| "security-guardrail-v1".to_string()),
            router: env::var("PIPE_ROUTER").unwrap_or_else(|_| "security-router-v1".to_string()),
            review: env::var("PIPE_REVIEW").unwrap_or_else(|_| "evidence-review-v1".to_string()),
            rephrase: env::var("PIPE_REPHRASE")
                .unwrap_or_else(|_| "query-rephrase-v1".to_string()),
            synthesizer: env::var("PIPE_SYNTHESIZER")
                .unwrap_or_else(|_| "report-synthesizer-v1".to_string()),
            cypher: env::var("PIPE_CYPHER").unwrap_or_else(|_| "text-to-cypher-v1".to_string()),
            knowledge_agent: env::var("PIPE_KNOWLEDGE_AGENT")
                .unwrap_or_else(|_| "sparql-agent-v1".to_string()),
        };

        let orchestrator = OrchestratorConfig {
            max_iterations: parse_env("MAX_ITERATIONS", 3),
            step_budget: parse_env("STEP_BUDGET", 40),
            session_timeout_ms: parse_env("SESSION_TIMEOUT_MS", 120_000),
            vector_top_k: parse_env("VECTOR_TOP_K", 4),
            cypher_top_k: parse_env("CYPHER_TOP_K", 10),
            agent_max_steps: parse_env("AGENT_MAX_STEPS", 30),
        };
        orchestrator.validate()?;

        Ok(Config {
            langbase,
            neo4j,
            knowledge_graph,
            logging,
            request,
            pipes,
            orchestrator,
        })
    }
}

/// First non-empty value among the given environment variables.
fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl OrchestratorConfig {
    /// Node visits needed by a session that exhausts `max_iterations`:
    /// gate, router, first retrieve + review, one rephrase/retrieve/review
    /// triple per iteration, and synthesis.
    pub fn required_steps(max_iterations: u32) -> u32 {
        5 + 3 * max_iterations
    }

    /// Reject limits under which a well-formed session could not finish.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_iterations > MAX_ITERATIONS_CAP {
            return Err(AppError::Config {
                message: format!(
                    "MAX_ITERATIONS must be at most {}, got {}",
                    MAX_ITERATIONS_CAP, self.max_iterations
                ),
            });
        }
        let required = Self::required_steps(MAX_ITERATIONS_CAP);
        if self.step_budget < required {
            return Err(AppError::Config {
                message: format!(
                    "STEP_BUDGET must be at least {} to fit {} iterations, got {}",
                    required, MAX_ITERATIONS_CAP, self.step_budget
                ),
            });
        }
        if self.vector_top_k == 0 || self.cypher_top_k == 0 || self.agent_max_steps == 0 {
            return Err(AppError::Config {
                message: "VECTOR_TOP_K, CYPHER_TOP_K and AGENT_MAX_STEPS must be positive"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Default session deadline as a duration.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

impl RequestConfig {
    /// Base backoff delay as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 5,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            guardrail: "security-guardrail-v1".to_string(),
            router: "security-router-v1".to_string(),
            review: "evidence-review-v1".to_string(),
            rephrase: "query-rephrase-v1".to_string(),
            synthesizer: "report-synthesizer-v1".to_string(),
            cypher: "text-to-cypher-v1".to_string(),
            knowledge_agent: "sparql-agent-v1".to_string(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            step_budget: 40,
            session_timeout_ms: 120_000,
            vector_top_k: 4,
            cypher_top_k: 10,
            agent_max_steps: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.session_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_required_steps() {
        assert_eq!(OrchestratorConfig::required_steps(0), 5);
        assert_eq!(OrchestratorConfig::required_steps(3), 14);
        assert_eq!(OrchestratorConfig::required_steps(MAX_ITERATIONS_CAP), 35);
    }

    #[test]
    fn test_validate_rejects_small_budget() {
        let config = OrchestratorConfig {
            step_budget: 10,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("STEP_BUDGET"));
    }

    #[test]
    fn test_validate_rejects_excessive_iterations() {
        let config = OrchestratorConfig {
            max_iterations: MAX_ITERATIONS_CAP + 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MAX_ITERATIONS"));
    }

    #[test]
    fn test_validate_rejects_zero_top_k() {
        let config = OrchestratorConfig {
            vector_top_k: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_config_default() {
        let config = RequestConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay(), Duration::from_millis(1000));
    }
}
