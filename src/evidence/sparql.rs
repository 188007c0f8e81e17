use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{truncate_chars, KnowledgeAgent};
use crate::config::{KnowledgeGraphConfig, RequestConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::langbase::{parse_completion, LangbaseClient, Message, PipeRequest};

/// Rows of a result set shown to the agent per observation.
const MAX_OBSERVED_ROWS: usize = 20;
const MAX_OBSERVATION_CHARS: usize = 4000;

/// SPARQL update and management keywords.
const SPARQL_WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "DELETE", "LOAD", "CLEAR", "CREATE", "DROP", "COPY", "MOVE", "ADD",
];

/// Client for a SPARQL 1.1 query endpoint.
#[derive(Clone)]
pub struct SparqlClient {
    client: Client,
    endpoint: String,
    timeout_ms: u64,
}

impl SparqlClient {
    pub fn new(config: &KnowledgeGraphConfig, request_config: &RequestConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(ServiceError::Http)?;

        Ok(Self {
            client,
            endpoint: config.sparql_endpoint.clone(),
            timeout_ms: request_config.timeout_ms,
        })
    }

    /// Run a read-only query and return the SPARQL JSON results document.
    pub async fn select(&self, query: &str) -> ServiceResult<Value> {
        ensure_read_only_sparql(query)?;

        let response = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/sparql-results+json")
            .form(&[("query", query)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    ServiceError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ServiceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse {
                message: format!("Failed to parse SPARQL results: {}", e),
            })
    }
}

/// Only SELECT, ASK, CONSTRUCT and DESCRIBE forms are allowed.
pub fn ensure_read_only_sparql(query: &str) -> ServiceResult<()> {
    let upper = query.to_ascii_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();

    if let Some(keyword) = words.iter().find(|w| SPARQL_WRITE_KEYWORDS.contains(*w)) {
        return Err(ServiceError::Rejected {
            message: format!("SPARQL query is not read-only ({})", keyword),
        });
    }

    let has_query_form = words
        .iter()
        .any(|w| matches!(*w, "SELECT" | "ASK" | "CONSTRUCT" | "DESCRIBE"));
    if !has_query_form {
        return Err(ServiceError::Rejected {
            message: "SPARQL query has no SELECT, ASK, CONSTRUCT or DESCRIBE form".to_string(),
        });
    }
    Ok(())
}

/// Render a SPARQL JSON results document as compact text.
pub fn summarize_results(results: &Value) -> String {
    if let Some(boolean) = results.get("boolean").and_then(Value::as_bool) {
        return format!("ASK result: {}", boolean);
    }

    let bindings = results
        .pointer("/results/bindings")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if bindings.is_empty() {
        return "No results.".to_string();
    }

    let mut lines: Vec<String> = bindings
        .iter()
        .take(MAX_OBSERVED_ROWS)
        .map(|binding| {
            binding
                .as_object()
                .map(|vars| {
                    vars.iter()
                        .map(|(name, cell)| {
                            let value = cell
                                .get("value")
                                .and_then(Value::as_str)
                                .unwrap_or_default();
                            format!("{}={}", name, value)
                        })
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .unwrap_or_default()
        })
        .collect();

    if bindings.len() > MAX_OBSERVED_ROWS {
        lines.push(format!(
            "({} more rows not shown)",
            bindings.len() - MAX_OBSERVED_ROWS
        ));
    }

    truncate_chars(&lines.join("\n"), MAX_OBSERVATION_CHARS)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum AgentAction {
    Query { sparql: String },
    Answer { answer: String },
}

/// [`KnowledgeAgent`] that lets a Langbase pipe drive SPARQL queries
/// step by step until it answers or runs out of steps.
#[derive(Clone)]
pub struct SparqlKnowledgeAgent {
    langbase: LangbaseClient,
    pipe: String,
    sparql: SparqlClient,
    max_steps: u32,
}

impl SparqlKnowledgeAgent {
    pub fn new(
        langbase: LangbaseClient,
        pipe: impl Into<String>,
        sparql: SparqlClient,
        max_steps: u32,
    ) -> Self {
        Self {
            langbase,
            pipe: pipe.into(),
            sparql,
            max_steps,
        }
    }
}

#[async_trait]
impl KnowledgeAgent for SparqlKnowledgeAgent {
    async fn knowledge_graph_agent(&self, question: &str) -> ServiceResult<String> {
        let mut messages = vec![Message::user(format!("Question: {}", question))];
        let mut observations: Vec<String> = Vec::new();

        for step in 1..=self.max_steps {
            let response = self
                .langbase
                .call_pipe(PipeRequest::new(&self.pipe, messages.clone()))
                .await?;
            let action: AgentAction = parse_completion(&self.pipe, &response.completion)?;

            match action {
                AgentAction::Answer { answer } => {
                    info!(steps = step, "Knowledge agent answered");
                    return Ok(answer);
                }
                AgentAction::Query { sparql } => {
                    debug!(step, query = %sparql, "Knowledge agent query");
                    let observation = match self.sparql.select(&sparql).await {
                        Ok(results) => summarize_results(&results),
                        Err(e) => {
                            warn!(step, error = %e, "Knowledge agent query failed");
                            format!("Error: {}", e)
                        }
                    };
                    messages.push(Message::assistant(response.completion));
                    messages.push(Message::user(format!(
                        "Observation {}:\n{}",
                        step, observation
                    )));
                    observations.push(observation);
                }
            }
        }

        warn!(max_steps = self.max_steps, "Knowledge agent reached its step limit");

        let findings: Vec<&String> = observations
            .iter()
            .filter(|o| *o != "No results." && !o.starts_with("Error: "))
            .collect();
        if findings.is_empty() {
            return Err(ServiceError::InvalidResponse {
                message: format!(
                    "knowledge agent produced no answer within {} steps",
                    self.max_steps
                ),
            });
        }

        Ok(format!(
            "Step limit reached before a final answer. Raw observations:\n{}",
            findings
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("\n---\n")
        ))
    }
}
