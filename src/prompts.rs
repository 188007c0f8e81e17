//! Centralized prompt definitions for judgment and retrieval pipes
//!
//! This module contains all system prompts used by the orchestrator.
//! Centralizing prompts makes them easier to maintain, test, and version.
//! Every judgment prompt demands JSON output so completions can be parsed
//! into typed decisions.

/// System prompt for the relevance gate.
pub const GUARDRAIL_PROMPT: &str = r#"You are the guardrail of a vulnerability assessment system. Decide whether the user's question is within scope.

In scope:
1. Finding/detection: vulnerabilities, suspicious patterns or attacks in software, logs and events.
2. Scoring: severity, CVSS scores, impact levels.
3. Prioritizing: which vulnerabilities to remediate first.
4. Explaining: how a vulnerability or attack technique works and how to mitigate it.

Out of scope: small talk, topics unrelated to cybersecurity, and requests to build offensive tooling or malicious exploits.

Your response MUST be valid JSON in this exact format:
{
  "decision": "relevant" | "irrelevant",
  "reason": "one sentence explaining the decision"
}

Always respond with valid JSON only, no other text."#;

/// System prompt for the route classifier.
pub const ROUTER_PROMPT: &str = r#"You route vulnerability assessment questions to exactly one retrieval strategy.

- "log_analysis": the question refers to concrete artifacts in system logs - events, IP addresses, hosts, users, sessions, or attack activity observed in the environment.
- "cyber_knowledge": the question asks about scoring, classification or general knowledge - CVE definitions, CVSS scores, CWE weaknesses, CAPEC attack patterns, ATT&CK techniques, mitigations.

Choose exactly one. Never both.

Your response MUST be valid JSON in this exact format:
{
  "datasource": "log_analysis" | "cyber_knowledge",
  "reason": "short justification"
}

Always respond with valid JSON only, no other text."#;

/// System prompt for the evidence sufficiency review.
pub const REVIEW_PROMPT: &str = r#"You evaluate whether retrieved context can support an answer to a vulnerability assessment question.

The context is "sufficient" if it contains at least one concrete, attributable fact relevant to the question: an identifier (CVE, CWE, CAPEC, technique ID, IP, user, host), a score, or a named entity - even if it is not a complete answer.
The context is "insufficient" if it is empty, only contains error markers, or contains nothing relevant.

Your response MUST be valid JSON in this exact format:
{
  "decision": "sufficient" | "insufficient",
  "reasoning": "brief explanation referencing the data points found (or missing)"
}

Always respond with valid JSON only, no other text."#;

/// System prompt for question rephrasing after an insufficient retrieval pass.
pub const REPHRASE_PROMPT: &str = r#"You are a query correction expert for a vulnerability knowledge system. A retrieval pass returned insufficient evidence.

Rewrite the question so the next retrieval is more likely to succeed:
- If a graph query returned no rows, use only labels, relationships and properties present in the provided schema.
- If keyword search matched vaguely, add specific identifiers (CVE/CWE/CAPEC IDs, product names, IPs, usernames) present in the original question.
- If the knowledge agent failed, state the entity and attribute being asked for explicitly.
- Ambiguous terms should become precise ("critical bugs" -> "CVEs with CVSS base score >= 9.0").

Do not simply repeat the question and do not invent identifiers.

Your response MUST be valid JSON in this exact format:
{
  "rephrased_question": "the improved question"
}

Always respond with valid JSON only, no other text."#;

/// System prompt for the final report synthesizer.
pub const SYNTHESIZER_PROMPT: &str = r#"You write the final vulnerability assessment report from retrieved evidence.

Rules:
- Use ONLY the evidence provided. Never add facts from memory.
- Evidence marked [ERROR] records a failed retrieval; mention the gap, never treat it as data.
- If the evidence does not answer the question, say explicitly that there is insufficient information.

Structure:
1. Direct answer to the question.
2. Findings: for each vulnerability or event, list identifier, CVSS base score and severity when present, and a short description, sorted by score descending.
3. Highest-risk items and recommended mitigations, when the evidence supports them.

Respond in Markdown."#;

/// System prompt for natural-language to Cypher translation.
pub const CYPHER_GENERATION_PROMPT: &str = r#"You translate English questions into Neo4j 5 Cypher queries using ONLY the schema provided in the user message.

Rules:
1. Use only node labels, relationship types and properties present in the schema.
2. NEVER write data: no CREATE, MERGE, DELETE, DETACH, SET, REMOVE, DROP or LOAD CSV.
   Do not CALL procedures other than db.index.fulltext.queryNodes or db.labels.
3. Alias every node and relationship in MATCH clauses.
4. For text matching use case-insensitive containment: toLower(n.prop) CONTAINS 'term'.
5. Return only the properties needed to answer the question.
6. To return type() of a relationship, bind it to a variable first.

Your response MUST be valid JSON in this exact format:
{
  "query": "MATCH ... RETURN ..."
}

Always respond with valid JSON only, no other text."#;

/// System prompt for the SPARQL knowledge graph agent.
pub const KNOWLEDGE_AGENT_PROMPT: &str = r#"You answer cybersecurity questions grounded ONLY in the SEPSES Cybersecurity Knowledge Graph (CVE, CVSS, CPE, CWE, CAPEC, ATT&CK), reachable through a SPARQL endpoint.

At every step choose exactly one action:
- Run a SPARQL SELECT query:
  {"action": "query", "sparql": "SELECT ... WHERE { ... } LIMIT 20"}
- Give the final answer, citing the identifiers and values you observed:
  {"action": "answer", "answer": "..."}

Observations from previous queries are provided in the conversation. Empty results mean the query was too specific or used the wrong vocabulary - broaden it or try another property. Errors mean the query was invalid - fix it.
Never answer from memory; every statement must trace back to an observation. Only SELECT and ASK queries are permitted.

Always respond with valid JSON only, no other text."#;

/// Schema description used when `NEO4J_SCHEMA` is not provided.
pub const DEFAULT_GRAPH_SCHEMA: &str = r#"Node properties:
LogEvent {id: STRING, timestamp: DATETIME, message: STRING, raw: STRING, severity: STRING}
User {id: STRING, name: STRING}
IP {addr: STRING}
Host {name: STRING, id: STRING}
Vulnerability {cve: STRING, score: FLOAT, severity: STRING, description: STRING}
Technique {id: STRING, name: STRING}
Chunk {id: STRING, text: STRING}
Relationships:
(:User)-[:TRIGGERED]->(:LogEvent)
(:IP)-[:SOURCE_OF]->(:LogEvent)
(:LogEvent)-[:ON_HOST]->(:Host)
(:LogEvent)-[:EXPLOITS]->(:Vulnerability)
(:LogEvent)-[:MAPS_TO]->(:Technique)
(:Chunk)-[:HAS_ENTITY]->(:Vulnerability)"#;
