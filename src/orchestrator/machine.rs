//! Session control flow as a closed set of nodes.
//!
//! - `Gate`: relevant → `Route`, rejected → `Done`
//! - `Route`: routed → `Retrieve`, routing failed → `Done`
//! - `Retrieve` → `Review`
//! - `Review`: sufficient or iterations exhausted → `Synthesize`, otherwise `Rephrase`
//! - `Rephrase`: new question → `Retrieve`, loop closed → `Synthesize`
//! - `Synthesize` → `Done`

use serde::{Deserialize, Serialize};

use super::SessionState;

/// A step of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Gate,
    Route,
    Retrieve,
    Review,
    Rephrase,
    Synthesize,
    Done,
}

impl Node {
    pub fn as_str(&self) -> &'static str {
        match self {
            Node::Gate => "gate",
            Node::Route => "route",
            Node::Retrieve => "retrieve",
            Node::Review => "review",
            Node::Rephrase => "rephrase",
            Node::Synthesize => "synthesize",
            Node::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Node::Done)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Destination after `node` has run against `state`.
///
/// Total over every node and state: a node whose effect left an answer
/// behind (rejection, routing failure) always leads to `Done`.
pub fn next_node(node: Node, state: &SessionState, max_iterations: u32) -> Node {
    if state.answer().is_some() {
        return Node::Done;
    }

    match node {
        Node::Gate if state.is_relevant() => Node::Route,
        Node::Gate => Node::Done,
        Node::Route if state.route.is_some() => Node::Retrieve,
        Node::Route => Node::Done,
        Node::Retrieve => Node::Review,
        Node::Review if state.is_sufficient() => Node::Synthesize,
        Node::Review if state.iteration_count < max_iterations => Node::Rephrase,
        Node::Review => Node::Synthesize,
        Node::Rephrase if state.loop_closed => Node::Synthesize,
        Node::Rephrase => Node::Retrieve,
        Node::Synthesize | Node::Done => Node::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judgment::{RelevanceDecision, Route, SufficiencyVerdict};

    fn relevant_state() -> SessionState {
        let mut state = SessionState::new("Which users logged in from 10.0.0.5?");
        state.relevance = Some(RelevanceDecision {
            is_relevant: true,
            reason: "log question".to_string(),
        });
        state.route = Some(Route::LogAnalysis);
        state
    }

    fn verdict(is_sufficient: bool) -> Option<SufficiencyVerdict> {
        Some(SufficiencyVerdict {
            is_sufficient,
            reasoning: String::new(),
        })
    }

    #[test]
    fn test_gate_transitions() {
        let mut state = SessionState::new("hello");
        assert_eq!(next_node(Node::Gate, &state, 3), Node::Done);

        state.relevance = Some(RelevanceDecision {
            is_relevant: true,
            reason: String::new(),
        });
        assert_eq!(next_node(Node::Gate, &state, 3), Node::Route);
    }

    #[test]
    fn test_rejection_answer_ends_session() {
        let mut state = SessionState::new("hello");
        state.relevance = Some(RelevanceDecision {
            is_relevant: false,
            reason: "small talk".to_string(),
        });
        state.set_answer("small talk").unwrap();
        assert_eq!(next_node(Node::Gate, &state, 3), Node::Done);
    }

    #[test]
    fn test_route_without_decision_ends() {
        let mut state = relevant_state();
        state.route = None;
        assert_eq!(next_node(Node::Route, &state, 3), Node::Done);
        state.route = Some(Route::KnowledgeLookup);
        assert_eq!(next_node(Node::Route, &state, 3), Node::Retrieve);
    }

    #[test]
    fn test_review_branches() {
        let mut state = relevant_state();
        assert_eq!(next_node(Node::Retrieve, &state, 3), Node::Review);

        state.sufficiency = verdict(true);
        assert_eq!(next_node(Node::Review, &state, 3), Node::Synthesize);

        state.sufficiency = verdict(false);
        assert_eq!(next_node(Node::Review, &state, 3), Node::Rephrase);

        state.iteration_count = 3;
        assert_eq!(next_node(Node::Review, &state, 3), Node::Synthesize);
    }

    #[test]
    fn test_zero_iterations_never_rephrases() {
        let mut state = relevant_state();
        state.sufficiency = verdict(false);
        assert_eq!(next_node(Node::Review, &state, 0), Node::Synthesize);
    }

    #[test]
    fn test_rephrase_branches() {
        let mut state = relevant_state();
        assert_eq!(next_node(Node::Rephrase, &state, 3), Node::Retrieve);
        state.loop_closed = true;
        assert_eq!(next_node(Node::Rephrase, &state, 3), Node::Synthesize);
    }

    #[test]
    fn test_terminal_nodes() {
        let state = relevant_state();
        assert_eq!(next_node(Node::Synthesize, &state, 3), Node::Done);
        assert_eq!(next_node(Node::Done, &state, 3), Node::Done);
        assert!(Node::Done.is_terminal());
        assert_eq!(Node::Rephrase.to_string(), "rephrase");
    }
}
