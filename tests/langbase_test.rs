//! Integration tests for the Langbase client and pipe-backed judgments
//!
//! Tests HTTP client behavior using wiremock for request/response mocking.

use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use vuln_graph_rag::config::{LangbaseConfig, PipeConfig, RequestConfig};
use vuln_graph_rag::error::ServiceError;
use vuln_graph_rag::evidence::{EvidenceFragment, EvidenceKey, EvidenceMap, VectorHit};
use vuln_graph_rag::judgment::{
    JudgmentService, PipeJudgment, RephraseRequest, Route, SynthesisRequest,
};
use vuln_graph_rag::langbase::{LangbaseClient, Message, PipeRequest};

/// Create a test client pointing to mock server
fn create_test_client(base_url: &str) -> LangbaseClient {
    let config = LangbaseConfig {
        api_key: "test-api-key".to_string(),
        base_url: base_url.to_string(),
    };

    let request_config = RequestConfig {
        timeout_ms: 5000,
        max_retries: 1,
        retry_delay_ms: 100,
    };

    LangbaseClient::new(&config, &request_config).expect("Failed to create client")
}

/// Mount a pipe that answers every run with `completion`.
async fn mount_pipe(server: &MockServer, pipe: &str, completion: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .and(body_partial_json(json!({"name": pipe})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "completion": completion,
            "threadId": null
        })))
        .mount(server)
        .await;
}

#[cfg(test)]
mod pipe_call_tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_pipe_call() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .and(header("Authorization", "Bearer test-api-key"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "completion": "{\"decision\": \"relevant\"}",
                "threadId": "thread-123",
                "raw": {
                    "model": "gpt-4o-mini",
                    "usage": {
                        "prompt_tokens": 100,
                        "completion_tokens": 50,
                        "total_tokens": 150
                    }
                }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let request = PipeRequest::new("security-guardrail-v1", vec![Message::user("hi")]);
        let response = client.call_pipe(request).await.unwrap();

        assert!(response.success);
        assert_eq!(response.thread_id, Some("thread-123".to_string()));
        assert!(response.completion.contains("relevant"));
    }

    #[tokio::test]
    async fn test_pipe_call_rate_limit_is_classified() {
        use vuln_graph_rag::resilience::RateLimited;

        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client
            .call_pipe(PipeRequest::new("p", vec![Message::user("x")]))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Api { status: 429, .. }));
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_pipe_call_server_error_single_attempt() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client
            .call_pipe(PipeRequest::new("p", vec![Message::user("x")]))
            .await
            .unwrap_err();

        match err {
            ServiceError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pipe_call_malformed_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client
            .call_pipe(PipeRequest::new("p", vec![Message::user("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidResponse { .. }));
    }
}

#[cfg(test)]
mod timeout_tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true, "completion": "{}"}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        let config = LangbaseConfig {
            api_key: "test-api-key".to_string(),
            base_url: mock_server.uri(),
        };
        let request_config = RequestConfig {
            timeout_ms: 200,
            max_retries: 1,
            retry_delay_ms: 10,
        };
        let client = LangbaseClient::new(&config, &request_config).unwrap();

        let err = client
            .call_pipe(PipeRequest::new("p", vec![Message::user("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { timeout_ms: 200 }));
    }
}

#[cfg(test)]
mod ensure_pipes_tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_pipes_upserts_every_pipe() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes"))
            .and(body_partial_json(json!({"upsert": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "pipe",
                "url": "https://langbase.com/pipe"
            })))
            .expect(7)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        client.ensure_pipes(&PipeConfig::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_pipes_accepts_existing() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes"))
            .respond_with(ResponseTemplate::new(409).set_body_string("exists"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        assert!(client.ensure_pipes(&PipeConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_pipes_propagates_auth_failure() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client
            .ensure_pipes(&PipeConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Api { status: 401, .. }));
    }
}

#[cfg(test)]
mod judgment_tests {
    use super::*;

    fn judgment(server: &MockServer) -> PipeJudgment {
        PipeJudgment::new(create_test_client(&server.uri()), PipeConfig::default())
    }

    #[tokio::test]
    async fn test_relevance_from_guardrail_pipe() {
        let mock_server = MockServer::start().await;
        mount_pipe(
            &mock_server,
            "security-guardrail-v1",
            r#"{"decision": "irrelevant", "reason": "Cooking is out of scope."}"#,
        )
        .await;

        let decision = judgment(&mock_server)
            .classify_relevance("Best lasagna recipe?")
            .await
            .unwrap();
        assert!(!decision.is_relevant);
        assert_eq!(decision.reason, "Cooking is out of scope.");
    }

    #[tokio::test]
    async fn test_route_accepts_fenced_json() {
        let mock_server = MockServer::start().await;
        mount_pipe(
            &mock_server,
            "security-router-v1",
            "```json\n{\"datasource\": \"cyber_knowledge\", \"reason\": \"CVE lookup\"}\n```",
        )
        .await;

        let route = judgment(&mock_server)
            .classify_route("What is CVE-2021-44228?")
            .await
            .unwrap();
        assert_eq!(route, Route::KnowledgeLookup);
    }

    #[tokio::test]
    async fn test_route_rejects_unknown_datasource() {
        let mock_server = MockServer::start().await;
        mount_pipe(
            &mock_server,
            "security-router-v1",
            r#"{"datasource": "web_search"}"#,
        )
        .await;

        let err = judgment(&mock_server)
            .classify_route("Latest news?")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_free_text_review_is_an_error() {
        let mock_server = MockServer::start().await;
        mount_pipe(
            &mock_server,
            "evidence-review-v1",
            "The evidence looks sufficient to me.",
        )
        .await;

        let err = judgment(&mock_server)
            .review_sufficiency("q", &EvidenceMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_review_and_rephrase() {
        let mock_server = MockServer::start().await;
        mount_pipe(
            &mock_server,
            "evidence-review-v1",
            r#"{"decision": "insufficient", "reasoning": "No host named."}"#,
        )
        .await;
        mount_pipe(
            &mock_server,
            "query-rephrase-v1",
            r#"{"rephrased_question": "Which hosts logged in from 10.0.0.5?"}"#,
        )
        .await;

        let judgment = judgment(&mock_server);
        let mut evidence = EvidenceMap::new();
        evidence.insert(
            EvidenceKey::Vector,
            EvidenceFragment::from_hits(&[VectorHit {
                text: "login from 10.0.0.5".to_string(),
                source_id: "evt-1".to_string(),
            }]),
        );

        let verdict = judgment
            .review_sufficiency("Who used 10.0.0.5?", &evidence)
            .await
            .unwrap();
        assert!(!verdict.is_sufficient);
        assert_eq!(verdict.reasoning, "No host named.");

        let rephrased = judgment
            .rephrase_query(&RephraseRequest {
                original_question: "Who used 10.0.0.5?",
                active_question: "Who used 10.0.0.5?",
                route: Route::LogAnalysis,
                evidence: &evidence,
                schema: Some("(:User)-[:LOGGED_IN]->(:Host)"),
                reasoning: Some(verdict.reasoning.as_str()),
            })
            .await
            .unwrap();
        assert_eq!(rephrased, "Which hosts logged in from 10.0.0.5?");
    }

    #[tokio::test]
    async fn test_synthesis_returns_plain_text() {
        let mock_server = MockServer::start().await;
        mount_pipe(
            &mock_server,
            "report-synthesizer-v1",
            "  CVE-2021-44228 scores CVSS 10.0.  ",
        )
        .await;

        let evidence = EvidenceMap::new();
        let report = judgment(&mock_server)
            .synthesize(&SynthesisRequest {
                question: "Score of Log4Shell?",
                evidence: &evidence,
                degraded: false,
            })
            .await
            .unwrap();
        assert_eq!(report, "CVE-2021-44228 scores CVSS 10.0.");
    }
}
