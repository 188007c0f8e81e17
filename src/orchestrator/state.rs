use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ErrorKind, OrchestrationError};
use crate::evidence::{EvidenceFragment, EvidenceKey, EvidenceMap};
use crate::judgment::{RelevanceDecision, Route, SufficiencyVerdict};

/// Evidence keys a route is allowed to populate.
pub fn evidence_keys(route: Route) -> &'static [EvidenceKey] {
    match route {
        Route::LogAnalysis => &[EvidenceKey::Vector, EvidenceKey::Graph],
        Route::KnowledgeLookup => &[EvidenceKey::KnowledgeGraph],
    }
}

/// Working state of one question, owned by a single session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub original_question: String,
    pub active_question: String,
    pub relevance: Option<RelevanceDecision>,
    pub route: Option<Route>,
    pub evidence: EvidenceMap,
    pub sufficiency: Option<SufficiencyVerdict>,
    pub iteration_count: u32,
    /// Active question of every retrieval pass, in order.
    pub attempted_questions: Vec<String>,
    /// Set when the reflection loop stops early (rephrase failed or repeated).
    pub loop_closed: bool,
    /// Set when the answer was produced without sufficient evidence.
    pub degraded: bool,
    /// Judgment failure absorbed by a terminal transition.
    pub error: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    answer: Option<String>,
}

impl SessionState {
    pub fn new(question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            session_id: Uuid::new_v4().to_string(),
            active_question: question.clone(),
            original_question: question,
            relevance: None,
            route: None,
            evidence: EvidenceMap::new(),
            sufficiency: None,
            iteration_count: 0,
            attempted_questions: Vec::new(),
            loop_closed: false,
            degraded: false,
            error: None,
            started_at: Utc::now(),
            answer: None,
        }
    }

    /// Final answer, once a terminal transition has set it.
    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    /// Set the final answer. A second call is a control-flow defect.
    pub fn set_answer(&mut self, answer: impl Into<String>) -> Result<(), OrchestrationError> {
        if self.answer.is_some() {
            return Err(OrchestrationError::InvalidTransition {
                message: "answer already set".to_string(),
            });
        }
        self.answer = Some(answer.into());
        Ok(())
    }

    /// Whether the gate let the question through.
    pub fn is_relevant(&self) -> bool {
        self.relevance.as_ref().is_some_and(|r| r.is_relevant)
    }

    /// Whether the last review found the evidence sufficient.
    pub fn is_sufficient(&self) -> bool {
        self.sufficiency.as_ref().is_some_and(|s| s.is_sufficient)
    }

    /// Store a fragment, overwriting the previous pass's fragment for the
    /// same key. Keys outside the session's route are refused.
    pub fn record_evidence(
        &mut self,
        key: EvidenceKey,
        fragment: EvidenceFragment,
    ) -> Result<(), OrchestrationError> {
        let route = self.route.ok_or_else(|| OrchestrationError::InvalidTransition {
            message: "evidence recorded before a route was chosen".to_string(),
        })?;
        if !evidence_keys(route).contains(&key) {
            return Err(OrchestrationError::InvalidTransition {
                message: format!("route {} cannot record '{}' evidence", route, key),
            });
        }
        self.evidence.insert(key, fragment);
        Ok(())
    }

    /// Retrieval passes run so far.
    pub fn retrieval_passes(&self) -> u32 {
        self.attempted_questions.len() as u32
    }

    /// Milliseconds since the session started.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}
