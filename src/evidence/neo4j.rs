use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{VectorHit, VectorSearch};
use crate::config::{Neo4jConfig, RequestConfig};
use crate::error::{ServiceError, ServiceResult};

/// Characters with special meaning in Lucene query syntax.
const LUCENE_SPECIAL: &[char] = &[
    '+', '-', '&', '|', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~', '*', '?', ':', '\\',
    '/',
];

/// Words too common to help a full-text match.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "what", "which", "who", "whom", "how", "why",
    "when", "where", "with", "from", "that", "this", "these", "those", "there", "any", "all",
    "did", "does", "have", "has", "had", "been", "into", "about", "show", "list", "give", "tell",
    "can", "you", "our", "their", "its",
];

/// Minimal client for the Neo4j HTTP transactional endpoint.
#[derive(Clone)]
pub struct Neo4jClient {
    client: Client,
    endpoint: String,
    username: String,
    password: String,
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
struct TxRequest<'a> {
    statements: [Statement<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Statement<'a> {
    statement: &'a str,
    parameters: &'a HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    columns: Vec<String>,
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

impl Neo4jClient {
    pub fn new(config: &Neo4jConfig, request_config: &RequestConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(ServiceError::Http)?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/db/{}/tx/commit",
                http_base_url(&config.uri),
                config.database
            ),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout_ms: request_config.timeout_ms,
        })
    }

    /// Transaction commit endpoint used by this client
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run one auto-committed statement and return its rows as JSON objects
    /// keyed by column name.
    ///
    /// The transaction is opened with `access-mode: READ`, so Neo4j itself
    /// refuses any write the statement attempts.
    pub async fn run(
        &self,
        statement: &str,
        parameters: &HashMap<String, Value>,
    ) -> ServiceResult<Vec<Value>> {
        let start = Instant::now();
        let body = TxRequest {
            statements: [Statement {
                statement,
                parameters,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .header("access-mode", "READ")
            .json(&body)
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
            warn!(status = status.as_u16(), "Neo4j request failed");
            return Err(ServiceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let tx: TxResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse {
                message: format!("Failed to parse Neo4j response: {}", e),
            })?;

        if let Some(error) = tx.errors.first() {
            warn!(code = %error.code, "Neo4j statement failed");
            return Err(ServiceError::Api {
                status: neo4j_error_status(&error.code),
                message: format!("{}: {}", error.code, error.message),
            });
        }

        let rows: Vec<Value> = tx
            .results
            .into_iter()
            .flat_map(|result| {
                let columns = result.columns;
                result.data.into_iter().map(move |data| {
                    let object: serde_json::Map<String, Value> =
                        columns.iter().cloned().zip(data.row).collect();
                    Value::Object(object)
                })
            })
            .collect();

        debug!(
            rows = rows.len(),
            latency_ms = start.elapsed().as_millis(),
            "Neo4j statement completed"
        );

        Ok(rows)
    }
}

/// Map a driver-style URI onto the HTTP API base URL.
fn http_base_url(uri: &str) -> String {
    let uri = uri.trim().trim_end_matches('/');
    for (scheme, replacement) in [
        ("neo4j+s://", "https://"),
        ("neo4j+ssc://", "https://"),
        ("bolt+s://", "https://"),
        ("bolt+ssc://", "https://"),
        ("neo4j://", "http://"),
        ("bolt://", "http://"),
    ] {
        if let Some(rest) = uri.strip_prefix(scheme) {
            return format!("{}{}", replacement, rest);
        }
    }
    uri.to_string()
}

/// Transient errors surface as 503 so callers can tell them apart from bad queries.
fn neo4j_error_status(code: &str) -> u16 {
    if code.starts_with("Neo.TransientError") {
        503
    } else if code.starts_with("Neo.ClientError.Security") {
        401
    } else {
        400
    }
}

/// Build a Lucene full-text query from free text.
///
/// Special characters are escaped. Alphabetic terms of four or more
/// characters match fuzzily (`term~2`); identifiers such as CVE IDs or
/// IP addresses match exactly. Terms are OR-ed so the index score ranks
/// partial matches. Returns `None` when nothing searchable remains.
pub fn generate_full_text_query(input: &str) -> Option<String> {
    let terms: Vec<String> = input
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '?' | '"' | '\''))
        .map(|word| word.trim_matches(|c: char| matches!(c, '.' | ':' | '!' | '(' | ')')))
        .filter(|word| !word.is_empty())
        .filter(|word| !STOPWORDS.contains(&word.to_lowercase().as_str()))
        .filter(|word| word.chars().count() >= 3 || word.chars().any(|c| c.is_ascii_digit()))
        .map(|word| {
            let escaped = escape_lucene(word);
            if word.chars().all(char::is_alphabetic) && word.chars().count() >= 4 {
                format!("{}~2", escaped)
            } else {
                escaped
            }
        })
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn escape_lucene(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len());
    for c in word.chars() {
        if LUCENE_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

const KEYWORD_SEARCH_QUERY: &str = "CALL db.index.fulltext.queryNodes($index, $query, {limit: $limit}) \
YIELD node, score \
RETURN coalesce(node.text, node.message, node.raw, node.description, node.name) AS text, \
coalesce(toString(node.id), elementId(node)) AS source_id, score \
ORDER BY score DESC";

/// [`VectorSearch`] over a Neo4j full-text index.
#[derive(Clone)]
pub struct Neo4jKeywordSearch {
    neo4j: Neo4jClient,
    index: String,
}

impl Neo4jKeywordSearch {
    pub fn new(neo4j: Neo4jClient, index: impl Into<String>) -> Self {
        Self {
            neo4j,
            index: index.into(),
        }
    }
}

#[async_trait]
impl VectorSearch for Neo4jKeywordSearch {
    async fn vector_search(&self, query: &str, k: usize) -> ServiceResult<Vec<VectorHit>> {
        let Some(lucene) = generate_full_text_query(query) else {
            debug!("No searchable terms in question, skipping keyword search");
            return Ok(Vec::new());
        };

        let parameters = HashMap::from([
            ("index".to_string(), json!(self.index)),
            ("query".to_string(), json!(lucene)),
            ("limit".to_string(), json!(k)),
        ]);

        let rows = self.neo4j.run(KEYWORD_SEARCH_QUERY, &parameters).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let text = row.get("text")?.as_str()?.to_string();
                let source_id = match row.get("source_id") {
                    Some(Value::String(id)) => id.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Some(VectorHit { text, source_id })
            })
            .take(k)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_base_url_rewrites_driver_schemes() {
        assert_eq!(
            http_base_url("neo4j+s://abc.databases.neo4j.io"),
            "https://abc.databases.neo4j.io"
        );
        assert_eq!(http_base_url("bolt://localhost:7474/"), "http://localhost:7474");
        assert_eq!(http_base_url("http://localhost:7474"), "http://localhost:7474");
    }

    #[test]
    fn test_endpoint_includes_database() {
        let config = Neo4jConfig {
            uri: "http://localhost:7474".to_string(),
            username: "neo4j".to_string(),
            password: "secret".to_string(),
            database: "logs".to_string(),
            keyword_index: "keyword".to_string(),
            schema: String::new(),
        };
        let client = Neo4jClient::new(&config, &RequestConfig::default()).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:7474/db/logs/tx/commit");
    }

    #[test]
    fn test_full_text_query_fuzzy_words_and_exact_identifiers() {
        let query = generate_full_text_query("Which users logged in from 10.0.0.5?").unwrap();
        assert_eq!(query, "users~2 OR logged~2 OR 10.0.0.5");
    }

    #[test]
    fn test_full_text_query_escapes_special_characters() {
        let query = generate_full_text_query("score of CVE-2021-44228").unwrap();
        assert_eq!(query, "score~2 OR CVE\\-2021\\-44228");
    }

    #[test]
    fn test_full_text_query_none_for_stopwords() {
        assert!(generate_full_text_query("what is the").is_none());
        assert!(generate_full_text_query("   ").is_none());
    }

    #[test]
    fn test_neo4j_error_status() {
        assert_eq!(
            neo4j_error_status("Neo.TransientError.General.DatabaseUnavailable"),
            503
        );
        assert_eq!(neo4j_error_status("Neo.ClientError.Statement.SyntaxError"), 400);
        assert_eq!(neo4j_error_status("Neo.ClientError.Security.Unauthorized"), 401);
    }
}
