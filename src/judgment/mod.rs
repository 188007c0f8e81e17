//! Typed judgments made by Langbase pipes.
//!
//! Every decision point of a session (relevance, route, sufficiency,
//! rephrasing, synthesis) goes through [`JudgmentService`]. Completions are
//! parsed strictly into closed types; a malformed completion is an error,
//! never a silently defaulted decision.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipeConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::evidence::{render_evidence, EvidenceMap};
use crate::langbase::{parse_completion, LangbaseClient, Message, PipeRequest};

/// Retrieval strategy chosen for a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Log events in the graph: vector search and Cypher.
    LogAnalysis,
    /// External knowledge graph agent.
    KnowledgeLookup,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::LogAnalysis => "log_analysis",
            Route::KnowledgeLookup => "knowledge_lookup",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "log_analysis" => Ok(Route::LogAnalysis),
            "knowledge_lookup" | "cyber_knowledge" => Ok(Route::KnowledgeLookup),
            other => Err(format!("Unknown route: {}", other)),
        }
    }
}

/// Outcome of the relevance gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevanceDecision {
    pub is_relevant: bool,
    pub reason: String,
}

/// Outcome of an evidence review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SufficiencyVerdict {
    pub is_sufficient: bool,
    pub reasoning: String,
}

/// Input for rewriting the active question after an insufficient pass.
#[derive(Debug, Clone)]
pub struct RephraseRequest<'a> {
    pub original_question: &'a str,
    pub active_question: &'a str,
    pub route: Route,
    pub evidence: &'a EvidenceMap,
    /// Graph schema, supplied only for the log analysis route.
    pub schema: Option<&'a str>,
    pub reasoning: Option<&'a str>,
}

/// Input for the final report.
#[derive(Debug, Clone)]
pub struct SynthesisRequest<'a> {
    pub question: &'a str,
    pub evidence: &'a EvidenceMap,
    /// Set when the session ended without sufficient evidence.
    pub degraded: bool,
}

/// Judgment calls made during a session.
#[async_trait]
pub trait JudgmentService: Send + Sync {
    /// Decide whether the question is in scope.
    async fn classify_relevance(&self, question: &str) -> ServiceResult<RelevanceDecision>;

    /// Pick exactly one retrieval route.
    async fn classify_route(&self, question: &str) -> ServiceResult<Route>;

    /// Decide whether accumulated evidence can support an answer.
    async fn review_sufficiency(
        &self,
        question: &str,
        evidence: &EvidenceMap,
    ) -> ServiceResult<SufficiencyVerdict>;

    /// Produce a new active question.
    async fn rephrase_query(&self, request: &RephraseRequest<'_>) -> ServiceResult<String>;

    /// Write the final answer from evidence.
    async fn synthesize(&self, request: &SynthesisRequest<'_>) -> ServiceResult<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum GuardrailDecision {
    Relevant,
    Irrelevant,
}

#[derive(Debug, Deserialize)]
struct GuardrailResponse {
    decision: GuardrailDecision,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct RouteResponse {
    datasource: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReviewDecision {
    Sufficient,
    Insufficient,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    decision: ReviewDecision,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RephraseResponse {
    rephrased_question: String,
}

/// [`JudgmentService`] backed by one Langbase pipe per judgment.
#[derive(Clone)]
pub struct PipeJudgment {
    langbase: LangbaseClient,
    pipes: PipeConfig,
}

impl PipeJudgment {
    pub fn new(langbase: LangbaseClient, pipes: PipeConfig) -> Self {
        Self { langbase, pipes }
    }

    async fn complete(&self, pipe: &str, content: String) -> ServiceResult<String> {
        let request = PipeRequest::new(pipe, vec![Message::user(content)]);
        let response = self.langbase.call_pipe(request).await?;
        Ok(response.completion)
    }
}

#[async_trait]
impl JudgmentService for PipeJudgment {
    async fn classify_relevance(&self, question: &str) -> ServiceResult<RelevanceDecision> {
        let pipe = &self.pipes.guardrail;
        let completion = self.complete(pipe, format!("Question: {}", question)).await?;
        let parsed: GuardrailResponse = parse_completion(pipe, &completion)?;

        Ok(RelevanceDecision {
            is_relevant: matches!(parsed.decision, GuardrailDecision::Relevant),
            reason: parsed.reason,
        })
    }

    async fn classify_route(&self, question: &str) -> ServiceResult<Route> {
        let pipe = &self.pipes.router;
        let completion = self.complete(pipe, format!("Question: {}", question)).await?;
        let parsed: RouteResponse = parse_completion(pipe, &completion)?;

        let route = parsed
            .datasource
            .parse::<Route>()
            .map_err(|message| ServiceError::InvalidResponse {
                message: format!("{}: {}", pipe, message),
            })?;
        debug!(route = %route, reason = %parsed.reason, "Route classified");
        Ok(route)
    }

    async fn review_sufficiency(
        &self,
        question: &str,
        evidence: &EvidenceMap,
    ) -> ServiceResult<SufficiencyVerdict> {
        let pipe = &self.pipes.review;
        let content = format!(
            "Question: {}\n\nRetrieved context:\n{}",
            question,
            render_evidence(evidence)
        );
        let completion = self.complete(pipe, content).await?;
        let parsed: ReviewResponse = parse_completion(pipe, &completion)?;

        Ok(SufficiencyVerdict {
            is_sufficient: matches!(parsed.decision, ReviewDecision::Sufficient),
            reasoning: parsed.reasoning,
        })
    }

    async fn rephrase_query(&self, request: &RephraseRequest<'_>) -> ServiceResult<String> {
        let pipe = &self.pipes.rephrase;
        let mut content = format!(
            "Original question: {}\nCurrent question: {}\nRetrieval route: {}\n",
            request.original_question, request.active_question, request.route
        );
        if let Some(reasoning) = request.reasoning {
            content.push_str(&format!("Review feedback: {}\n", reasoning));
        }
        if let Some(schema) = request.schema {
            content.push_str(&format!("\nGraph schema:\n{}\n", schema));
        }
        content.push_str(&format!(
            "\nRetrieved context:\n{}",
            render_evidence(request.evidence)
        ));

        let completion = self.complete(pipe, content).await?;
        let parsed: RephraseResponse = parse_completion(pipe, &completion)?;
        Ok(parsed.rephrased_question.trim().to_string())
    }

    async fn synthesize(&self, request: &SynthesisRequest<'_>) -> ServiceResult<String> {
        let pipe = &self.pipes.synthesizer;
        let mut content = format!(
            "Question: {}\n\nEvidence:\n{}",
            request.question,
            render_evidence(request.evidence)
        );
        if request.degraded {
            content.push_str(
                "\n\nThe evidence was judged insufficient. State clearly what could not be determined.",
            );
        }
        let completion = self.complete(pipe, content).await?;
        Ok(completion.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_from_str() {
        assert_eq!("log_analysis".parse::<Route>().unwrap(), Route::LogAnalysis);
        assert_eq!(
            "cyber_knowledge".parse::<Route>().unwrap(),
            Route::KnowledgeLookup
        );
        assert_eq!(
            " Knowledge_Lookup ".parse::<Route>().unwrap(),
            Route::KnowledgeLookup
        );
        assert!("both".parse::<Route>().is_err());
    }

    #[test]
    fn test_route_serialization() {
        assert_eq!(
            serde_json::to_string(&Route::KnowledgeLookup).unwrap(),
            "\"knowledge_lookup\""
        );
        assert_eq!(Route::LogAnalysis.to_string(), "log_analysis");
    }

    #[test]
    fn test_guardrail_response_is_closed() {
        let parsed: GuardrailResponse =
            serde_json::from_str(r#"{"decision": "irrelevant", "reason": "small talk"}"#)
                .unwrap();
        assert!(matches!(parsed.decision, GuardrailDecision::Irrelevant));
        assert!(serde_json::from_str::<GuardrailResponse>(r#"{"decision": "maybe"}"#).is_err());
    }

    #[test]
    fn test_review_response_reasoning_defaults() {
        let parsed: ReviewResponse = serde_json::from_str(r#"{"decision": "sufficient"}"#).unwrap();
        assert!(matches!(parsed.decision, ReviewDecision::Sufficient));
        assert!(parsed.reasoning.is_empty());
    }
}
