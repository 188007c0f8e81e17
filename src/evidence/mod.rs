//! Evidence store adapters.
//!
//! The orchestrator sees three narrow traits, one per retrieval backend:
//! - [`VectorSearch`]: similarity/keyword search over indexed text chunks
//! - [`GraphQuery`]: natural-language question to read-only Cypher + rows
//! - [`KnowledgeAgent`]: tool-using agent over an external knowledge graph
//!
//! Live implementations talk to Neo4j over HTTP, Langbase pipes, and a
//! SPARQL endpoint. Results are normalized into [`EvidenceFragment`]s keyed
//! by [`EvidenceKey`].

mod cypher;
mod neo4j;
mod sparql;

pub use cypher::*;
pub use neo4j::*;
pub use sparql::*;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ServiceResult;

/// Maximum characters of a single fragment rendered into a prompt.
const MAX_RENDERED_FRAGMENT_CHARS: usize = 6000;

/// One chunk returned by [`VectorSearch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub text: String,
    pub source_id: String,
}

/// Generated query plus the rows it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CypherResult {
    pub generated_query: String,
    pub rows: Vec<serde_json::Value>,
}

/// Semantic or keyword search over indexed chunks.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn vector_search(&self, query: &str, k: usize) -> ServiceResult<Vec<VectorHit>>;
}

/// Structured graph retrieval through a generated, read-only Cypher query.
#[async_trait]
pub trait GraphQuery: Send + Sync {
    async fn cypher_query(&self, question: &str) -> ServiceResult<CypherResult>;
}

/// External knowledge graph agent, bounded to a fixed number of tool calls.
#[async_trait]
pub trait KnowledgeAgent: Send + Sync {
    async fn knowledge_graph_agent(&self, question: &str) -> ServiceResult<String>;
}

/// Stable identifier of the adapter that produced a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EvidenceKey {
    #[serde(rename = "vector")]
    Vector,
    #[serde(rename = "graph")]
    Graph,
    #[serde(rename = "knowledgeGraph")]
    KnowledgeGraph,
}

impl EvidenceKey {
    /// Key name as used in prompts and responses
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKey::Vector => "vector",
            EvidenceKey::Graph => "graph",
            EvidenceKey::KnowledgeGraph => "knowledgeGraph",
        }
    }
}

impl std::fmt::Display for EvidenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of retrieved text plus an error flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceFragment {
    pub text: String,
    pub is_error: bool,
    /// Query text generated for graph retrieval, kept for rephrasing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_query: Option<String>,
    /// Number of hits/rows behind `text`.
    pub hit_count: usize,
}

/// Evidence accumulated by a session, ordered by key.
pub type EvidenceMap = BTreeMap<EvidenceKey, EvidenceFragment>;

impl EvidenceFragment {
    /// Fragment from search hits
    pub fn from_hits(hits: &[VectorHit]) -> Self {
        let text = hits
            .iter()
            .map(|hit| format!("#Resource {}: {}", hit.source_id, hit.text.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            text,
            is_error: false,
            generated_query: None,
            hit_count: hits.len(),
        }
    }

    /// Fragment from a Cypher result; rows are rendered one JSON object per line
    pub fn from_cypher(result: CypherResult) -> Self {
        let text = result
            .rows
            .iter()
            .map(|row| row.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            text,
            is_error: false,
            hit_count: result.rows.len(),
            generated_query: Some(result.generated_query),
        }
    }

    /// Fragment from an agent answer
    pub fn from_agent(answer: String) -> Self {
        let hit_count = usize::from(!answer.trim().is_empty());
        Self {
            text: answer,
            is_error: false,
            generated_query: None,
            hit_count,
        }
    }

    /// Fragment recording a failed adapter call
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            is_error: true,
            generated_query: None,
            hit_count: 0,
        }
    }

    /// Non-error fragment with at least one hit and non-blank text.
    pub fn is_usable(&self) -> bool {
        !self.is_error && self.hit_count > 0 && !self.text.trim().is_empty()
    }
}

/// Whether any fragment in the map is usable.
pub fn has_usable_evidence(evidence: &EvidenceMap) -> bool {
    evidence.values().any(EvidenceFragment::is_usable)
}

/// Render all fragments, including error markers, for a prompt.
pub fn render_evidence(evidence: &EvidenceMap) -> String {
    if evidence.is_empty() {
        return "(no evidence retrieved)".to_string();
    }

    evidence
        .iter()
        .map(|(key, fragment)| {
            let mut section = format!("[{}]", key);
            if fragment.is_error {
                section.push_str(" [ERROR]");
            }
            if let Some(query) = &fragment.generated_query {
                section.push_str(&format!("\nGenerated query: {}", query));
            }
            let body = if fragment.text.trim().is_empty() {
                "(empty result)".to_string()
            } else {
                truncate_chars(&fragment.text, MAX_RENDERED_FRAGMENT_CHARS)
            };
            format!("{}\n{}", section, body)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_evidence_key_serialization() {
        assert_eq!(
            serde_json::to_string(&EvidenceKey::KnowledgeGraph).unwrap(),
            "\"knowledgeGraph\""
        );
        assert_eq!(EvidenceKey::Vector.to_string(), "vector");
    }

    #[test]
    fn test_fragment_from_hits() {
        let fragment = EvidenceFragment::from_hits(&[
            VectorHit {
                text: "Failed login from 10.0.0.5".to_string(),
                source_id: "log-1".to_string(),
            },
            VectorHit {
                text: "sudo su by alice".to_string(),
                source_id: "log-2".to_string(),
            },
        ]);
        assert_eq!(fragment.hit_count, 2);
        assert!(fragment.text.contains("#Resource log-1"));
        assert!(fragment.is_usable());
    }

    #[test]
    fn test_empty_hits_are_not_usable() {
        let fragment = EvidenceFragment::from_hits(&[]);
        assert!(!fragment.is_error);
        assert!(!fragment.is_usable());
    }

    #[test]
    fn test_fragment_from_cypher_keeps_query() {
        let fragment = EvidenceFragment::from_cypher(CypherResult {
            generated_query: "MATCH (u:User) RETURN u.id AS id".to_string(),
            rows: vec![json!({"id": "alice"})],
        });
        assert_eq!(fragment.hit_count, 1);
        assert_eq!(
            fragment.generated_query.as_deref(),
            Some("MATCH (u:User) RETURN u.id AS id")
        );
        assert!(fragment.text.contains("alice"));
    }

    #[test]
    fn test_failure_fragment() {
        let fragment = EvidenceFragment::failure("neo4j unavailable");
        assert!(fragment.is_error);
        assert!(!fragment.is_usable());
    }

    #[test]
    fn test_agent_fragment_blank_answer() {
        assert!(!EvidenceFragment::from_agent("   ".to_string()).is_usable());
        assert!(EvidenceFragment::from_agent("CVSS 9.8".to_string()).is_usable());
    }

    #[test]
    fn test_render_evidence_marks_errors_and_empties() {
        let mut evidence = EvidenceMap::new();
        evidence.insert(EvidenceKey::Vector, EvidenceFragment::failure("timeout"));
        evidence.insert(
            EvidenceKey::Graph,
            EvidenceFragment::from_cypher(CypherResult {
                generated_query: "MATCH (n) RETURN n".to_string(),
                rows: vec![],
            }),
        );

        let rendered = render_evidence(&evidence);
        assert!(rendered.contains("[vector] [ERROR]\ntimeout"));
        assert!(rendered.contains("[graph]\nGenerated query: MATCH (n) RETURN n\n(empty result)"));
        assert!(!has_usable_evidence(&evidence));
    }

    #[test]
    fn test_render_empty_map() {
        assert_eq!(render_evidence(&EvidenceMap::new()), "(no evidence retrieved)");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("abc", 3), "abc");
    }
}
