//! # Vuln Graph RAG
//!
//! An agentic retrieval-augmented question answering service for
//! vulnerability assessment, exposed as a Model Context Protocol (MCP)
//! server. Judgments are delegated to Langbase Pipes; evidence comes from a
//! Neo4j event graph and an external SPARQL knowledge graph.
//!
//! ## Session flow
//!
//! - **Gate**: out-of-scope questions are rejected with a reason
//! - **Route**: log analysis or knowledge lookup
//! - **Retrieve**: keyword search plus generated read-only Cypher, or a
//!   SPARQL agent over CVE/CWE/CAPEC data
//! - **Review / Rephrase**: bounded reflection while evidence is insufficient
//! - **Synthesize**: a report, flagged as degraded when evidence stayed thin
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → MCP Server (Rust) → Orchestrator → Langbase Pipes (HTTP)
//!                                       ↓
//!                           Neo4j (HTTP) · SPARQL endpoint
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use vuln_graph_rag::{Config, Orchestrator, SubmitOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let orchestrator = Orchestrator::from_config(&config)?;
//!     let response = orchestrator
//!         .submit("What is the CVSS score of CVE-2021-44228?", SubmitOptions::default())
//!         .await;
//!     println!("{}", response.answer);
//!     Ok(())
//! }
//! ```

/// Configuration loaded from the environment.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Retrieval adapters and the evidence they produce.
pub mod evidence;
/// Typed judgments backed by Langbase pipes.
pub mod judgment;
/// Langbase API client and types for pipe communication.
pub mod langbase;
/// Session state machine and engine.
pub mod orchestrator;
/// System prompts for Langbase pipes.
pub mod prompts;
/// Retry, backoff and cancellation around external calls.
pub mod resilience;
/// MCP server implementation and request handling.
pub mod server;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use orchestrator::{Orchestrator, SubmitOptions, SubmitResponse};
pub use server::{AppState, McpServer, SharedState};
