use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{CreatePipeRequest, CreatePipeResponse, Message, PipeRequest, PipeResponse};
use crate::config::{LangbaseConfig, PipeConfig, RequestConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::prompts::{
    CYPHER_GENERATION_PROMPT, GUARDRAIL_PROMPT, KNOWLEDGE_AGENT_PROMPT, REPHRASE_PROMPT,
    REVIEW_PROMPT, ROUTER_PROMPT, SYNTHESIZER_PROMPT,
};

const DEFAULT_MODEL: &str = "openai:gpt-4o-mini";

/// Client for interacting with Langbase Pipes API
#[derive(Clone)]
pub struct LangbaseClient {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_ms: u64,
}

impl LangbaseClient {
    /// Create a new Langbase client
    pub fn new(config: &LangbaseConfig, request_config: &RequestConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(ServiceError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_ms: request_config.timeout_ms,
        })
    }

    /// Run a pipe once.
    ///
    /// Failures are returned as-is so the caller's invoker can decide
    /// whether they are worth retrying.
    pub async fn call_pipe(&self, request: PipeRequest) -> ServiceResult<PipeResponse> {
        let url = format!("{}/v1/pipes/run", self.base_url);
        let start = Instant::now();

        debug!(
            pipe = %request.name,
            messages = request.messages.len(),
            "Calling Langbase pipe"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
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
            let error_body = response.text().await.unwrap_or_default();
            warn!(
                pipe = %request.name,
                status = status.as_u16(),
                latency_ms = start.elapsed().as_millis(),
                "Langbase pipe call failed"
            );
            return Err(ServiceError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let pipe_response: PipeResponse =
            response
                .json()
                .await
                .map_err(|e| ServiceError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        debug!(
            pipe = %request.name,
            latency_ms = start.elapsed().as_millis(),
            total_tokens = ?pipe_response.total_tokens(),
            "Langbase pipe call succeeded"
        );

        Ok(pipe_response)
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a new pipe
    pub async fn create_pipe(
        &self,
        request: CreatePipeRequest,
    ) -> ServiceResult<CreatePipeResponse> {
        let url = format!("{}/v1/pipes", self.base_url);

        info!(pipe = %request.name, "Creating Langbase pipe");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(ServiceError::Http)?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let pipe_response: CreatePipeResponse =
            response
                .json()
                .await
                .map_err(|e| ServiceError::InvalidResponse {
                    message: format!("Failed to parse create pipe response: {}", e),
                })?;

        info!(
            pipe = %pipe_response.name,
            url = %pipe_response.url,
            "Pipe created successfully"
        );

        Ok(pipe_response)
    }

    /// Ensure a single pipe exists with the given system prompt.
    pub async fn ensure_pipe(
        &self,
        pipe_name: &str,
        description: &str,
        system_prompt: &str,
        json_output: bool,
    ) -> ServiceResult<()> {
        let request = CreatePipeRequest::new(pipe_name)
            .with_description(description)
            .with_model(DEFAULT_MODEL)
            .with_upsert(true)
            .with_json_output(json_output)
            .with_temperature(0.0)
            .with_max_tokens(2000)
            .with_messages(vec![Message::system(system_prompt)]);

        match self.create_pipe(request).await {
            Ok(_) => {
                info!(pipe = %pipe_name, "Pipe ready");
                Ok(())
            }
            Err(ServiceError::Api { status: 409, .. }) => {
                // Pipe already exists, that's fine
                info!(pipe = %pipe_name, "Pipe already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Ensure every judgment and retrieval pipe exists, creating them if needed
    pub async fn ensure_pipes(&self, pipes: &PipeConfig) -> ServiceResult<()> {
        let specs: [(&str, &str, &str, bool); 7] = [
            (pipes.guardrail.as_str(), "Relevance gate", GUARDRAIL_PROMPT, true),
            (pipes.router.as_str(), "Retrieval route classifier", ROUTER_PROMPT, true),
            (pipes.review.as_str(), "Evidence sufficiency review", REVIEW_PROMPT, true),
            (pipes.rephrase.as_str(), "Question rephrasing", REPHRASE_PROMPT, true),
            (pipes.synthesizer.as_str(), "Report synthesis", SYNTHESIZER_PROMPT, false),
            (pipes.cypher.as_str(), "Text to Cypher", CYPHER_GENERATION_PROMPT, true),
            (
                pipes.knowledge_agent.as_str(),
                "SPARQL knowledge graph agent",
                KNOWLEDGE_AGENT_PROMPT,
                true,
            ),
        ];

        for (name, description, prompt, json_output) in specs {
            self.ensure_pipe(name, description, prompt, json_output)
                .await?;
        }
        Ok(())
    }
}
