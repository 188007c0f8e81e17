use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{CypherResult, GraphQuery, Neo4jClient};
use crate::error::{ServiceError, ServiceResult};
use crate::langbase::{parse_completion, LangbaseClient, Message, PipeRequest};

/// Clauses that write to the graph or its schema.
const WRITE_CLAUSES: &[&str] = &["CREATE", "MERGE", "DELETE", "DETACH", "SET", "REMOVE", "DROP"];

/// Procedures a generated query may `CALL`. Anything else is refused.
const READ_ONLY_PROCEDURES: &[&str] = &[
    "db.index.fulltext.querynodes",
    "db.index.fulltext.queryrelationships",
    "db.labels",
    "db.relationshiptypes",
    "db.propertykeys",
    "db.schema.visualization",
    "db.schema.nodetypeproperties",
    "db.schema.reltypeproperties",
];

#[derive(Debug, Deserialize)]
struct CypherCompletion {
    query: String,
}

/// [`GraphQuery`] that asks a Langbase pipe to write Cypher for a schema,
/// checks it is read-only, caps its row count, and runs it on Neo4j.
#[derive(Clone)]
pub struct PipeCypherQuery {
    langbase: LangbaseClient,
    pipe: String,
    neo4j: Neo4jClient,
    schema: String,
    top_k: usize,
}

impl PipeCypherQuery {
    pub fn new(
        langbase: LangbaseClient,
        pipe: impl Into<String>,
        neo4j: Neo4jClient,
        schema: impl Into<String>,
        top_k: usize,
    ) -> Self {
        Self {
            langbase,
            pipe: pipe.into(),
            neo4j,
            schema: schema.into(),
            top_k,
        }
    }

    async fn generate(&self, question: &str) -> ServiceResult<String> {
        let messages = vec![Message::user(format!(
            "Schema:\n{}\n\nQuestion: {}",
            self.schema, question
        ))];
        let response = self
            .langbase
            .call_pipe(PipeRequest::new(&self.pipe, messages))
            .await?;
        let completion: CypherCompletion = parse_completion(&self.pipe, &response.completion)?;
        Ok(completion.query)
    }
}

#[async_trait]
impl GraphQuery for PipeCypherQuery {
    async fn cypher_query(&self, question: &str) -> ServiceResult<CypherResult> {
        let generated = self.generate(question).await?;
        ensure_read_only(&generated)?;
        let query = with_row_limit(&generated, self.top_k);

        info!(query = %query, "Running generated Cypher");
        let rows = self.neo4j.run(&query, &HashMap::new()).await?;
        debug!(rows = rows.len(), "Generated Cypher returned");

        Ok(CypherResult {
            generated_query: query,
            rows,
        })
    }
}

/// Reject statements that could modify the graph.
///
/// String literals and comments are ignored so that filters such as
/// `CONTAINS 'delete'` stay legal.
pub fn ensure_read_only(query: &str) -> ServiceResult<()> {
    let code = strip_literals_and_comments(query);
    let tokens = tokenize(&code);
    let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();

    if upper.is_empty() {
        return Err(ServiceError::Rejected {
            message: "generated query is empty".to_string(),
        });
    }

    for (i, token) in upper.iter().enumerate() {
        // Property access such as `n.set` is not a clause.
        if i > 0 && tokens[i - 1].ends_with('.') {
            continue;
        }
        if WRITE_CLAUSES.contains(&token.as_str()) {
            return Err(rejected(token));
        }
        let next = upper.get(i + 1).map(String::as_str);
        if token == "LOAD" && next == Some("CSV") {
            return Err(rejected("LOAD CSV"));
        }
        if token == "IN" && next == Some("TRANSACTIONS") {
            return Err(rejected("IN TRANSACTIONS"));
        }
    }

    for name in called_procedures(&code) {
        if !READ_ONLY_PROCEDURES.contains(&name.as_str()) {
            let what = if name.is_empty() {
                "unnamed procedure".to_string()
            } else {
                format!("procedure {}", name)
            };
            return Err(rejected(&what));
        }
    }

    Ok(())
}

/// Lowercased names of the procedures invoked with `CALL`.
///
/// Subqueries (`CALL {` or `CALL (vars) {`) are skipped since their bodies
/// are checked as ordinary clauses. A name that cannot be read is returned
/// empty.
fn called_procedures(code: &str) -> Vec<String> {
    let lowered = code.to_ascii_lowercase();
    let bytes = lowered.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    let mut names = Vec::new();
    let mut from = 0;
    while let Some(offset) = lowered[from..].find("call") {
        let start = from + offset;
        let end = start + "call".len();
        from = end;

        let left_ok = start == 0 || !(is_word(bytes[start - 1]) || bytes[start - 1] == b'.');
        let right_ok = end == bytes.len() || !is_word(bytes[end]);
        if !left_ok || !right_ok {
            continue;
        }

        let rest = lowered[end..].trim_start();
        let scoped_subquery = rest.strip_prefix('(').is_some_and(|scope| {
            scope
                .split_once(')')
                .is_some_and(|(_, after)| after.trim_start().starts_with('{'))
        });
        if rest.starts_with('{') || scoped_subquery {
            continue;
        }
        names.push(
            rest.chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
                .collect(),
        );
    }
    names
}

fn rejected(what: &str) -> ServiceError {
    ServiceError::Rejected {
        message: format!("generated query is not read-only ({})", what),
    }
}

/// Append `LIMIT top_k` unless the outer query already limits its rows.
///
/// A `LIMIT` inside a `CALL { ... }` subquery does not count.
pub fn with_row_limit(query: &str, top_k: usize) -> String {
    let trimmed = query.trim().trim_end_matches(';').trim_end();
    let has_limit = tokenize(&outside_braces(&strip_literals_and_comments(trimmed)))
        .iter()
        .any(|t| t.eq_ignore_ascii_case("LIMIT"));
    if has_limit {
        trimmed.to_string()
    } else {
        format!("{}\nLIMIT {}", trimmed, top_k)
    }
}

/// Blank out everything nested in `{ }`.
fn outside_braces(code: &str) -> String {
    let mut depth = 0usize;
    code.chars()
        .map(|c| match c {
            '{' => {
                depth += 1;
                ' '
            }
            '}' => {
                depth = depth.saturating_sub(1);
                ' '
            }
            _ if depth > 0 => ' ',
            _ => c,
        })
        .collect()
}

/// Identifier-like tokens; a trailing `.` is kept to mark property access.
fn tokenize(code: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, c) in code.char_indices() {
        let word_char = c.is_alphanumeric() || c == '_';
        match (start, word_char) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                let end = if c == '.' { i + 1 } else { i };
                tokens.push(&code[s..end]);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push(&code[s..]);
    }
    tokens
}

fn strip_literals_and_comments(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                let quote = c;
                // Backticked names are identifiers, keep a placeholder.
                out.push(' ');
                while let Some(inner) = chars.next() {
                    if inner == '\\' {
                        chars.next();
                    } else if inner == quote {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_query_accepted() {
        let query = "MATCH (u:User)-[:LOGGED_IN_FROM]->(ip:IP) \
                     WHERE toLower(ip.addr) CONTAINS '10.0.0' RETURN u.id, ip.addr";
        assert!(ensure_read_only(query).is_ok());
    }

    #[test]
    fn test_write_clauses_rejected() {
        for query in [
            "CREATE (n:User {id: 'x'})",
            "MATCH (n) DETACH DELETE n",
            "MATCH (n:User) SET n.admin = true RETURN n",
            "MERGE (n:Host {name: 'a'})",
            "MATCH (n) REMOVE n.flag",
            "DROP INDEX keyword",
        ] {
            let err = ensure_read_only(query).unwrap_err();
            assert!(
                matches!(err, ServiceError::Rejected { .. }),
                "expected rejection for {}",
                query
            );
        }
    }

    #[test]
    fn test_load_csv_and_batched_writes_rejected() {
        assert!(ensure_read_only("LOAD CSV FROM 'file:///x.csv' AS row RETURN row").is_err());
        assert!(ensure_read_only(
            "MATCH (n) CALL { WITH n RETURN n.id AS id } IN TRANSACTIONS RETURN id"
        )
        .is_err());
        assert!(ensure_read_only("CALL apoc.create.node(['X'], {}) YIELD node RETURN node").is_err());
        for query in [
            "CALL db.index.fulltext.drop('keyword')",
            "MATCH (n:User) CALL apoc.nodes.delete(n, 10) YIELD value RETURN value",
            "CALL db.index.fulltext.createNodeIndex('kw', ['LogEvent'], ['message'])",
            "CALL apoc.atomic.add(n, 'count', 1)",
            "CALL apoc.lock.nodes([n])",
            "CALL dbms.security.createUser('x', 'y', false)",
            "call `db.labels`()",
        ] {
            assert!(ensure_read_only(query).is_err(), "accepted {}", query);
        }
    }

    #[test]
    fn test_read_only_procedures_allowed() {
        assert!(ensure_read_only(
            "CALL db.index.fulltext.queryNodes('keyword', 'admin~2') YIELD node, score \
             RETURN node.text, score"
        )
        .is_ok());
        assert!(ensure_read_only("CALL db.labels() YIELD label RETURN label").is_ok());
        assert!(ensure_read_only(
            "MATCH (u:User) CALL { WITH u MATCH (u)-[:LOGGED_IN]->(h) RETURN count(h) AS n } RETURN u.id, n"
        )
        .is_ok());
        assert!(ensure_read_only(
            "MATCH (u:User) CALL (u) { MATCH (u)-[:LOGGED_IN]->(h) RETURN count(h) AS n } RETURN n"
        )
        .is_ok());
        assert!(ensure_read_only("MATCH (n:Phone) RETURN n.call AS dialed").is_ok());
    }

    #[test]
    fn test_keywords_inside_literals_and_properties_allowed() {
        assert!(ensure_read_only(
            "MATCH (e:LogEvent) WHERE toLower(e.message) CONTAINS 'delete user' RETURN e.id"
        )
        .is_ok());
        assert!(ensure_read_only("MATCH (n:Config) RETURN n.set AS value").is_ok());
        assert!(ensure_read_only("MATCH (n) // create nothing\nRETURN n LIMIT 1").is_ok());
    }

    #[test]
    fn test_empty_query_rejected() {
        assert!(ensure_read_only("   ").is_err());
    }

    #[test]
    fn test_row_limit_appended() {
        assert_eq!(
            with_row_limit("MATCH (n:User) RETURN n.id;", 10),
            "MATCH (n:User) RETURN n.id\nLIMIT 10"
        );
    }

    #[test]
    fn test_existing_limit_kept() {
        assert_eq!(
            with_row_limit("MATCH (n) RETURN n limit 3", 10),
            "MATCH (n) RETURN n limit 3"
        );
    }

    #[test]
    fn test_subquery_limit_does_not_count() {
        assert_eq!(
            with_row_limit(
                "MATCH (u:User) CALL { WITH u MATCH (u)-[:LOGGED_IN]->(h) RETURN h LIMIT 1 } RETURN u.id, h.name",
                10
            ),
            "MATCH (u:User) CALL { WITH u MATCH (u)-[:LOGGED_IN]->(h) RETURN h LIMIT 1 } RETURN u.id, h.name\nLIMIT 10"
        );
    }

    #[test]
    fn test_limit_inside_literal_ignored() {
        assert_eq!(
            with_row_limit("MATCH (n) WHERE n.msg = 'limit' RETURN n", 5),
            "MATCH (n) WHERE n.msg = 'limit' RETURN n\nLIMIT 5"
        );
    }
}
