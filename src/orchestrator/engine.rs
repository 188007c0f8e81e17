use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument};

use super::{next_node, Node, ResponseStatus, SessionState, SubmitOptions, SubmitResponse};
use crate::config::{Config, OrchestratorConfig, MAX_ITERATIONS_CAP};
use crate::error::{ErrorKind, InvokeError, OrchestrationError, ServiceError, ServiceResult};
use crate::evidence::{
    has_usable_evidence, render_evidence, truncate_chars, EvidenceFragment, EvidenceKey,
    GraphQuery, KnowledgeAgent, Neo4jClient, Neo4jKeywordSearch, PipeCypherQuery, SparqlClient,
    SparqlKnowledgeAgent, VectorSearch,
};
use crate::judgment::{
    JudgmentService, PipeJudgment, RelevanceDecision, RephraseRequest, Route, SufficiencyVerdict,
    SynthesisRequest,
};
use crate::langbase::LangbaseClient;
use crate::prompts::DEFAULT_GRAPH_SCHEMA;
use crate::resilience::{CancelReason, CancelScope, ResilientInvoker, RetryPolicy};

/// Prefix of every answer produced without sufficient evidence.
pub const DEGRADED_NOTE: &str =
    "Note: the retrieved evidence was judged insufficient, so this answer may be incomplete.";

/// Answer for an off-topic question when the gate gave no reason.
pub const DEFAULT_REJECTION: &str =
    "This question is outside the scope of vulnerability assessment, so it was not answered.";

const ROUTE_FAILURE_ANSWER: &str =
    "The question could not be routed to a retrieval strategy, so no answer was produced.";

/// Drives sessions through the node graph.
///
/// Collaborators are shared and stateless per request; every session owns
/// its own [`SessionState`], so concurrent calls are independent.
pub struct Orchestrator {
    judgment: Arc<dyn JudgmentService>,
    vector: Arc<dyn VectorSearch>,
    graph: Arc<dyn GraphQuery>,
    knowledge: Arc<dyn KnowledgeAgent>,
    invoker: ResilientInvoker,
    config: OrchestratorConfig,
    schema: String,
}

impl Orchestrator {
    /// Create an orchestrator with default limits and retry policy.
    pub fn new(
        judgment: Arc<dyn JudgmentService>,
        vector: Arc<dyn VectorSearch>,
        graph: Arc<dyn GraphQuery>,
        knowledge: Arc<dyn KnowledgeAgent>,
    ) -> Self {
        Self {
            judgment,
            vector,
            graph,
            knowledge,
            invoker: ResilientInvoker::default(),
            config: OrchestratorConfig::default(),
            schema: DEFAULT_GRAPH_SCHEMA.to_string(),
        }
    }

    /// Wire live Langbase, Neo4j and SPARQL collaborators from configuration.
    pub fn from_config(config: &Config) -> ServiceResult<Self> {
        let langbase = LangbaseClient::new(&config.langbase, &config.request)?;
        let neo4j = Neo4jClient::new(&config.neo4j, &config.request)?;
        let sparql = SparqlClient::new(&config.knowledge_graph, &config.request)?;

        let judgment = PipeJudgment::new(langbase.clone(), config.pipes.clone());
        let vector = Neo4jKeywordSearch::new(neo4j.clone(), &config.neo4j.keyword_index);
        let graph = PipeCypherQuery::new(
            langbase.clone(),
            &config.pipes.cypher,
            neo4j,
            &config.neo4j.schema,
            config.orchestrator.cypher_top_k,
        );
        let knowledge = SparqlKnowledgeAgent::new(
            langbase,
            &config.pipes.knowledge_agent,
            sparql,
            config.orchestrator.agent_max_steps,
        );

        Ok(Self::new(
            Arc::new(judgment),
            Arc::new(vector),
            Arc::new(graph),
            Arc::new(knowledge),
        )
        .with_invoker(ResilientInvoker::new(RetryPolicy::from_config(
            &config.request,
        )))
        .with_config(config.orchestrator.clone())
        .with_schema(config.neo4j.schema.clone()))
    }

    pub fn with_invoker(mut self, invoker: ResilientInvoker) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Graph schema description handed to the rephraser on the log route.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Answer one question, returning fatal failures as typed errors.
    pub async fn run(
        &self,
        question: &str,
        options: SubmitOptions,
    ) -> Result<SubmitResponse, OrchestrationError> {
        let mut state = SessionState::new(question);
        let status = self.drive(&mut state, options).await?;
        Ok(response_from(&state, status))
    }

    /// Answer one question; every outcome, including fatal errors, is
    /// folded into the response.
    pub async fn submit(&self, question: &str, options: SubmitOptions) -> SubmitResponse {
        let mut state = SessionState::new(question);
        match self.drive(&mut state, options).await {
            Ok(status) => response_from(&state, status),
            Err(e) => {
                let mut response = response_from(&state, ResponseStatus::Failed);
                if response.answer.is_empty() {
                    response.answer = failure_answer(&e);
                }
                response.error = Some(e.kind());
                response
            }
        }
    }

    async fn drive(
        &self,
        state: &mut SessionState,
        options: SubmitOptions,
    ) -> Result<ResponseStatus, OrchestrationError> {
        let max_iterations = self.effective_max_iterations(options.max_iterations);
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.session_timeout());
        let scope = CancelScope::with_timeout(options.cancel.unwrap_or_default(), timeout);

        let span = info_span!("session", session_id = %state.session_id);
        self.execute(state, &scope, max_iterations)
            .instrument(span)
            .await
    }

    fn effective_max_iterations(&self, requested: Option<u32>) -> u32 {
        let requested = requested.unwrap_or(self.config.max_iterations);
        if requested > MAX_ITERATIONS_CAP {
            warn!(
                requested,
                cap = MAX_ITERATIONS_CAP,
                "max_iterations above cap, clamping"
            );
        }
        requested.min(MAX_ITERATIONS_CAP)
    }

    async fn execute(
        &self,
        state: &mut SessionState,
        scope: &CancelScope,
        max_iterations: u32,
    ) -> Result<ResponseStatus, OrchestrationError> {
        info!(
            question = %state.original_question,
            max_iterations,
            "Session started"
        );

        let mut node = Node::Gate;
        let mut visits: u32 = 0;

        while !node.is_terminal() {
            scope.check().map_err(cancelled)?;

            visits += 1;
            if visits > self.config.step_budget {
                warn!(
                    node = %node,
                    visits,
                    limit = self.config.step_budget,
                    "Step budget exceeded"
                );
                return Err(OrchestrationError::BudgetExceeded {
                    visits,
                    limit: self.config.step_budget,
                });
            }

            debug!(node = %node, visits, iteration = state.iteration_count, "Entering node");
            match node {
                Node::Gate => self.gate(state, scope).await?,
                Node::Route => self.route(state, scope).await?,
                Node::Retrieve => self.retrieve(state, scope).await?,
                Node::Review => self.review(state, scope).await?,
                Node::Rephrase => self.rephrase(state, scope).await?,
                Node::Synthesize => self.synthesize(state, scope).await?,
                Node::Done => {}
            }

            node = next_node(node, state, max_iterations);
        }

        if state.answer().is_none() {
            return Err(OrchestrationError::InvalidTransition {
                message: "session ended without an answer".to_string(),
            });
        }

        let status = if !state.is_relevant() {
            ResponseStatus::Rejected
        } else if state.degraded {
            ResponseStatus::Degraded
        } else {
            ResponseStatus::Answered
        };

        info!(
            status = ?status,
            route = ?state.route,
            iterations = state.iteration_count,
            passes = state.retrieval_passes(),
            visits,
            latency_ms = state.elapsed_ms(),
            "Session finished"
        );

        Ok(status)
    }

    async fn gate(
        &self,
        state: &mut SessionState,
        scope: &CancelScope,
    ) -> Result<(), OrchestrationError> {
        let question = state.original_question.trim().to_string();

        let mut decision = if question.is_empty() {
            RelevanceDecision {
                is_relevant: false,
                reason: "The question is empty.".to_string(),
            }
        } else {
            let judgment = &self.judgment;
            let result = self
                .invoker
                .invoke("classify_relevance", scope, || {
                    judgment.classify_relevance(&question)
                })
                .await;

            match result {
                Ok(decision) => decision,
                Err(e) => {
                    let message = absorb(e)?;
                    warn!(error = %message, "Relevance check failed, rejecting");
                    state.error = Some(ErrorKind::JudgmentFailure);
                    RelevanceDecision {
                        is_relevant: false,
                        reason: format!(
                            "The question could not be checked for relevance: {}",
                            message
                        ),
                    }
                }
            }
        };

        if !decision.is_relevant && decision.reason.trim().is_empty() {
            decision.reason = DEFAULT_REJECTION.to_string();
        }

        info!(
            is_relevant = decision.is_relevant,
            reason = %decision.reason,
            "Relevance decided"
        );
        if !decision.is_relevant {
            state.set_answer(decision.reason.clone())?;
        }
        state.relevance = Some(decision);
        Ok(())
    }

    async fn route(
        &self,
        state: &mut SessionState,
        scope: &CancelScope,
    ) -> Result<(), OrchestrationError> {
        let judgment = &self.judgment;
        let question = &state.original_question;
        let result = self
            .invoker
            .invoke("classify_route", scope, || judgment.classify_route(question))
            .await;

        match result {
            Ok(route) => {
                info!(route = %route, "Route chosen");
                state.route = Some(route);
                Ok(())
            }
            Err(e) => {
                let message = absorb(e)?;
                warn!(error = %message, "Routing failed");
                state.error = Some(ErrorKind::JudgmentFailure);
                state.set_answer(ROUTE_FAILURE_ANSWER)?;
                Err(OrchestrationError::JudgmentFailure {
                    judgment: "classify_route".to_string(),
                    message,
                })
            }
        }
    }

    async fn retrieve(
        &self,
        state: &mut SessionState,
        scope: &CancelScope,
    ) -> Result<(), OrchestrationError> {
        let route = state
            .route
            .ok_or_else(|| OrchestrationError::InvalidTransition {
                message: "retrieval reached without a route".to_string(),
            })?;
        let question = state.active_question.clone();
        state.attempted_questions.push(question.clone());

        info!(
            route = %route,
            pass = state.retrieval_passes(),
            question = %question,
            "Retrieving evidence"
        );

        match route {
            Route::LogAnalysis => {
                let k = self.config.vector_top_k;
                let (vector, graph) = tokio::join!(
                    self.invoker.invoke("vector_search", scope, || {
                        self.vector.vector_search(&question, k)
                    }),
                    self.invoker
                        .invoke("cypher_query", scope, || self.graph.cypher_query(&question)),
                );

                let vector = match vector {
                    Ok(hits) => EvidenceFragment::from_hits(&hits),
                    Err(e) => adapter_failure("vector_search", absorb(e)?),
                };
                let graph = match graph {
                    Ok(result) => EvidenceFragment::from_cypher(result),
                    Err(e) => adapter_failure("cypher_query", absorb(e)?),
                };

                debug!(
                    vector_hits = vector.hit_count,
                    graph_rows = graph.hit_count,
                    "Log analysis retrieval joined"
                );
                state.record_evidence(EvidenceKey::Vector, vector)?;
                state.record_evidence(EvidenceKey::Graph, graph)?;
            }
            Route::KnowledgeLookup => {
                let result = self
                    .invoker
                    .invoke("knowledge_graph_agent", scope, || {
                        self.knowledge.knowledge_graph_agent(&question)
                    })
                    .await;

                let fragment = match result {
                    Ok(answer) => EvidenceFragment::from_agent(answer),
                    Err(e) => adapter_failure("knowledge_graph_agent", absorb(e)?),
                };
                state.record_evidence(EvidenceKey::KnowledgeGraph, fragment)?;
            }
        }

        Ok(())
    }

    async fn review(
        &self,
        state: &mut SessionState,
        scope: &CancelScope,
    ) -> Result<(), OrchestrationError> {
        let verdict = if !has_usable_evidence(&state.evidence) {
            SufficiencyVerdict {
                is_sufficient: false,
                reasoning: "No usable evidence was retrieved.".to_string(),
            }
        } else {
            let judgment = &self.judgment;
            let question = &state.original_question;
            let evidence = &state.evidence;
            let result = self
                .invoker
                .invoke("review_sufficiency", scope, || {
                    judgment.review_sufficiency(question, evidence)
                })
                .await;

            match result {
                Ok(verdict) => verdict,
                Err(e) => {
                    let message = absorb(e)?;
                    warn!(error = %message, "Sufficiency review failed, treating as insufficient");
                    SufficiencyVerdict {
                        is_sufficient: false,
                        reasoning: format!("Sufficiency review failed: {}", message),
                    }
                }
            }
        };

        info!(
            is_sufficient = verdict.is_sufficient,
            iteration = state.iteration_count,
            reasoning = %verdict.reasoning,
            "Evidence reviewed"
        );
        state.sufficiency = Some(verdict);
        Ok(())
    }

    async fn rephrase(
        &self,
        state: &mut SessionState,
        scope: &CancelScope,
    ) -> Result<(), OrchestrationError> {
        let route = state
            .route
            .ok_or_else(|| OrchestrationError::InvalidTransition {
                message: "rephrase reached without a route".to_string(),
            })?;

        let request = RephraseRequest {
            original_question: &state.original_question,
            active_question: &state.active_question,
            route,
            evidence: &state.evidence,
            schema: match route {
                Route::LogAnalysis => Some(self.schema.as_str()),
                Route::KnowledgeLookup => None,
            },
            reasoning: state.sufficiency.as_ref().map(|s| s.reasoning.as_str()),
        };
        let judgment = &self.judgment;
        let result = self
            .invoker
            .invoke("rephrase_query", scope, || judgment.rephrase_query(&request))
            .await;

        match result {
            Ok(question)
                if !question.trim().is_empty()
                    && question.trim() != state.active_question.trim() =>
            {
                state.active_question = question.trim().to_string();
                state.iteration_count += 1;
                info!(
                    iteration = state.iteration_count,
                    question = %state.active_question,
                    "Question rephrased"
                );
            }
            Ok(_) => {
                warn!("Rephrase produced no new question, ending reflection loop");
                state.loop_closed = true;
            }
            Err(e) => {
                let message = absorb(e)?;
                warn!(error = %message, "Rephrase failed, ending reflection loop");
                state.loop_closed = true;
            }
        }
        Ok(())
    }

    async fn synthesize(
        &self,
        state: &mut SessionState,
        scope: &CancelScope,
    ) -> Result<(), OrchestrationError> {
        let insufficient = !state.is_sufficient();

        let answer = if !has_usable_evidence(&state.evidence) {
            state.degraded = true;
            insufficient_information_report(state)
        } else {
            let request = SynthesisRequest {
                question: &state.original_question,
                evidence: &state.evidence,
                degraded: insufficient,
            };
            let judgment = &self.judgment;
            let result = self
                .invoker
                .invoke("synthesize", scope, || judgment.synthesize(&request))
                .await;

            match result {
                Ok(text) if !text.trim().is_empty() => {
                    if insufficient {
                        state.degraded = true;
                        format!("{}\n\n{}", DEGRADED_NOTE, text.trim())
                    } else {
                        text.trim().to_string()
                    }
                }
                Ok(_) => {
                    warn!("Synthesis returned blank output, using evidence report");
                    state.degraded = true;
                    evidence_report(state)
                }
                Err(e) => {
                    let message = absorb(e)?;
                    warn!(error = %message, "Synthesis failed, using evidence report");
                    state.degraded = true;
                    state.error = Some(ErrorKind::JudgmentFailure);
                    evidence_report(state)
                }
            }
        };

        state.set_answer(answer)
    }
}

fn cancelled(reason: CancelReason) -> OrchestrationError {
    OrchestrationError::Cancelled {
        reason: reason.to_string(),
    }
}

/// Cancellation aborts the session; any other failure is handed back as text.
fn absorb(error: InvokeError<ServiceError>) -> Result<String, OrchestrationError> {
    match error {
        InvokeError::Cancelled { reason } => Err(OrchestrationError::Cancelled { reason }),
        other => Ok(other.to_string()),
    }
}

fn adapter_failure(adapter: &str, message: String) -> EvidenceFragment {
    warn!(adapter, error = %message, "Adapter failed, recording error fragment");
    EvidenceFragment::failure(format!("{} failed: {}", adapter, message))
}

fn response_from(state: &SessionState, status: ResponseStatus) -> SubmitResponse {
    SubmitResponse {
        session_id: state.session_id.clone(),
        answer: state.answer().unwrap_or_default().to_string(),
        is_relevant: state.is_relevant(),
        route: state.route,
        iterations: state.iteration_count,
        status,
        degraded: state.degraded,
        error: state.error,
    }
}

fn failure_answer(error: &OrchestrationError) -> String {
    match error {
        OrchestrationError::Cancelled { reason } => {
            format!("The assessment was cancelled ({}); no answer was produced.", reason)
        }
        OrchestrationError::BudgetExceeded { .. } => {
            "The assessment exceeded its step budget; no answer was produced.".to_string()
        }
        other => format!("The assessment failed: {}", other),
    }
}

/// Deterministic report when no source returned usable evidence.
fn insufficient_information_report(state: &SessionState) -> String {
    let mut report = format!(
        "Insufficient information: no source returned usable evidence for \"{}\".\n\nTried:",
        state.original_question
    );
    if let Some(route) = state.route {
        report.push_str(&format!(
            "\n- route {} with {} retrieval pass(es)",
            route,
            state.retrieval_passes()
        ));
    }
    for question in &state.attempted_questions {
        report.push_str(&format!("\n- question: {}", question));
    }
    for (key, fragment) in &state.evidence {
        let outcome = if fragment.is_error {
            format!("failed ({})", truncate_chars(fragment.text.trim(), 200))
        } else {
            "no results".to_string()
        };
        report.push_str(&format!("\n- {}: {}", key, outcome));
        if let Some(query) = &fragment.generated_query {
            report.push_str(&format!(" [query: {}]", query));
        }
    }
    report
}

/// Deterministic report listing the evidence when synthesis is unavailable.
fn evidence_report(state: &SessionState) -> String {
    format!(
        "{}\n\nA report could not be generated; the evidence retrieved for \"{}\" follows.\n\n{}",
        DEGRADED_NOTE,
        state.original_question,
        render_evidence(&state.evidence)
    )
}
