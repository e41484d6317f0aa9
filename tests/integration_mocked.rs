/// Integration tests with a mocked CRM
/// Tests the complete dispatch workflow without hitting the real API
use rust_crm_resilience::config::{Budget, Config, ResilienceConfig};
use rust_crm_resilience::errors::ResilienceError;
use rust_crm_resilience::gateway_client::CrmClient;
use rust_crm_resilience::models::{CheckName, CheckStatus, HealthStatus, Limit, RateLimitContext};
use rust_crm_resilience::state_store::{MokaStateStore, StateStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Helper function to create test config
fn create_test_config(crm_base_url: String) -> Config {
    Config {
        port: 8080,
        crm_base_url,
        crm_api_token: "test_token".to_string(),
        crm_system_key: "test_system".to_string(),
        crm_source_domain: "tests.local".to_string(),
        state_store_url: None,
        internal_api_key: None,
        resilience: ResilienceConfig {
            // Mock server is plain HTTP
            enforce_tls: false,
            // Keep backoff sleeps in the millisecond range
            backoff_unit: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
            ..ResilienceConfig::default()
        },
    }
}

fn create_client(config: &Config) -> CrmClient {
    CrmClient::new(config, Arc::new(MokaStateStore::default())).unwrap()
}

#[tokio::test]
async fn test_successful_request_sends_required_headers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/people/123"))
        .and(header("authorization", "Bearer test_token"))
        .and(header("x-system-key", "test_system"))
        .and(header("x-source-domain", "tests.local"))
        .and(header_exists("x-request-id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "123", "name": "Ada"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let data = client.get("/people/123", &[]).await.unwrap();

    assert_eq!(data["name"], "Ada");

    let snapshot = client.analytics().snapshot().await;
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.successful_requests, 1);
    assert_eq!(snapshot.endpoint_stats["GET /people/123"].calls, 1);
}

#[tokio::test]
async fn test_post_sends_json_body() {
    let mock_server = MockServer::start().await;
    let body = json!({"content": "Called, left voicemail", "personId": "123"});

    Mock::given(method("POST"))
        .and(path("/notes"))
        .and(header("content-type", "application/json"))
        .and(body_json(&body))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "n-1"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let data = client.post("/notes", &body).await.unwrap();

    assert_eq!(data["id"], "n-1");
    let notes = client.rate_limiter().bucket(RateLimitContext::Notes).await;
    assert_eq!(notes.used, 1);
}

#[tokio::test]
async fn test_query_params_are_forwarded() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/people"))
        .and(query_param("page", "2"))
        .and(query_param("email", "ada@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let data = client
        .get("/people", &[("page", "2"), ("email", "ada@example.com")])
        .await
        .unwrap();

    assert_eq!(data, json!([]));
}

#[tokio::test]
async fn test_empty_success_body_is_null() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/notes/9"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    assert_eq!(client.delete("/notes/9").await.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_429_with_retry_after_then_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"events": []})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let data = client.get("/events", &[]).await.unwrap();

    assert_eq!(data, json!({"events": []}));

    // One logical request, two transport attempts
    let snapshot = client.analytics().snapshot().await;
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.successful_requests, 1);
    assert_eq!(client.analytics().connection_quality().await.attempts, 2);
}

#[tokio::test]
async fn test_429_exhausts_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(429))
        .expect(4)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let err = client.get("/events", &[]).await.unwrap_err();

    match err {
        ResilienceError::RateLimitExceededAfterRetries {
            attempts,
            ref endpoint,
            ref method,
            ..
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(endpoint, "/events");
            assert_eq!(method, "GET");
        }
        other => panic!("expected RateLimitExceededAfterRetries, got {:?}", other),
    }

    let snapshot = client.analytics().snapshot().await;
    assert_eq!(snapshot.failed_requests, 1);
    assert_eq!(snapshot.error_patterns.get("http_429"), Some(&1));
}

#[tokio::test]
async fn test_retry_after_beyond_cap_fails_immediately() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "86400"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let result = tokio::time::timeout(Duration::from_secs(5), client.get("/events", &[]))
        .await
        .expect("request should give up instead of sleeping");

    match result {
        Err(ResilienceError::RateLimitExceededAfterRetries {
            attempts,
            retry_after,
            ..
        }) => {
            assert_eq!(attempts, 1);
            assert_eq!(retry_after, Some(86_400));
        }
        other => panic!("expected RateLimitExceededAfterRetries, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/people"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let err = client.get("/people", &[]).await.unwrap_err();

    match err {
        ResilienceError::UnexpectedStatus {
            status,
            attempts,
            ref body,
            ..
        } => {
            assert_eq!(status, 500);
            assert_eq!(attempts, 1);
            assert_eq!(body, "upstream exploded");
        }
        other => panic!("expected UnexpectedStatus, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_error_returns_error_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/people/404"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"errorMessage": "person not found"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let err = client.get("/people/404", &[]).await.unwrap_err();

    assert_eq!(err.error_code(), "http_404");
    assert_eq!(err.attempts(), 1);
    match err {
        ResilienceError::ClientError { payload, .. } => {
            assert_eq!(payload, json!({"errorMessage": "person not found"}));
        }
        other => panic!("expected ClientError, got {:?}", other),
    }

    let diagnostics = client.diagnostics().await;
    assert_eq!(diagnostics.recent_errors.len(), 1);
    assert_eq!(diagnostics.recent_errors[0].code, "http_404");
    assert_eq!(diagnostics.recent_errors[0].http_status, Some(404));
}

#[tokio::test]
async fn test_invalid_json_counts_as_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/people"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let err = client.get("/people", &[]).await.unwrap_err();

    assert!(matches!(
        err,
        ResilienceError::InvalidResponse { status: 200, attempts: 1, .. }
    ));

    let snapshot = client.analytics().snapshot().await;
    assert_eq!(snapshot.failed_requests, 1);
    assert_eq!(snapshot.error_patterns.get("invalid_response"), Some(&1));
}

#[tokio::test]
async fn test_local_refusal_never_reaches_network() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/notes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    client
        .rate_limiter()
        .reconcile(RateLimitContext::Notes, 10, 0, 60)
        .await;

    let err = client.post("/notes", &json!({"content": "hi"})).await.unwrap_err();

    match err {
        ResilienceError::RateLimitExceeded { context, wait_seconds } => {
            assert_eq!(context, RateLimitContext::Notes);
            assert!(wait_seconds > 0 && wait_seconds <= 60);
        }
        other => panic!("expected RateLimitExceeded, got {:?}", other),
    }

    let snapshot = client.analytics().snapshot().await;
    assert_eq!(snapshot.total_requests, 0);
    assert_eq!(snapshot.error_patterns.get("local_rate_limit"), Some(&1));
}

#[tokio::test]
async fn test_rate_limit_headers_reconcile_bucket() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"events": []}))
                .insert_header("X-RateLimit-Limit", "20")
                .insert_header("X-RateLimit-Remaining", "5")
                .insert_header("X-RateLimit-Window", "10"),
        )
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    client.get("/events", &[]).await.unwrap();

    let bucket = client.rate_limiter().bucket(RateLimitContext::EventsGet).await;
    assert_eq!(bucket.limit, Limit::Limited(20));
    assert_eq!(bucket.used, 15);
    assert_eq!(bucket.window_seconds, 10);
}

#[tokio::test]
async fn test_oversized_rate_limit_window_falls_back_to_configured() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"events": []}))
                .insert_header("X-RateLimit-Limit", "20")
                .insert_header("X-RateLimit-Remaining", "5")
                .insert_header("X-RateLimit-Window", "18446744073709551615"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let data = client.get("/events", &[]).await.unwrap();
    assert_eq!(data, json!({"events": []}));

    let bucket = client.rate_limiter().bucket(RateLimitContext::EventsGet).await;
    assert_eq!(bucket.limit, Limit::Limited(20));
    assert_eq!(bucket.used, 15);
    assert_eq!(bucket.window_seconds, 10);
}

#[tokio::test]
async fn test_rate_limit_context_header_selects_bucket() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/people"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .insert_header("X-RateLimit-Limit", "10")
                .insert_header("X-RateLimit-Remaining", "0")
                .insert_header("X-RateLimit-Context", "notes"),
        )
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/notes"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    client.get("/people", &[]).await.unwrap();

    // Window falls back to the configured 10s
    let notes = client.rate_limiter().bucket(RateLimitContext::Notes).await;
    assert_eq!(notes.used, 10);
    assert_eq!(notes.window_seconds, 10);

    let err = client.post("/notes", &json!({"content": "x"})).await.unwrap_err();
    assert_eq!(err.error_code(), "local_rate_limit");
}

#[tokio::test]
async fn test_budget_is_shared_across_clients() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/notes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(mock_server.uri());
    config.resilience.budgets.notes = Budget::limited(2, 60);
    let store: Arc<dyn StateStore> = Arc::new(MokaStateStore::default());

    // Each client stands in for one stateless invocation
    for _ in 0..2 {
        let client = CrmClient::new(&config, store.clone()).unwrap();
        client.post("/notes", &json!({"content": "x"})).await.unwrap();
    }

    let client = CrmClient::new(&config, store.clone()).unwrap();
    let err = client.post("/notes", &json!({"content": "x"})).await.unwrap_err();
    assert!(matches!(err, ResilienceError::RateLimitExceeded { .. }));

    let snapshot = client.analytics().snapshot().await;
    assert_eq!(snapshot.successful_requests, 2);
}

#[tokio::test]
async fn test_transport_failure_retries_then_fails() {
    // Nothing listens on port 1
    let config = create_test_config("http://127.0.0.1:1".to_string());
    let client = create_client(&config);

    let err = client.get("/people", &[]).await.unwrap_err();

    match err {
        ResilienceError::TransportError { attempts, ref message, .. } => {
            assert_eq!(attempts, 4);
            assert!(message.contains("connection"));
        }
        other => panic!("expected TransportError, got {:?}", other),
    }

    let quality = client.analytics().connection_quality().await;
    assert_eq!(quality.attempts, 4);
    assert_eq!(quality.drops, 4);
    assert_eq!(quality.stability_score, 0.0);

    let snapshot = client.analytics().snapshot().await;
    assert_eq!(snapshot.error_patterns.get("transport_error"), Some(&1));
}

#[tokio::test]
async fn test_validation_errors_skip_network() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let body = json!({"q": 1});

    for result in [
        client.send("GET", "/people", Some(&body), &[]).await,
        client.send("TRACE", "/people", None, &[]).await,
        client.send("GET", "https://elsewhere.example.com/people", None, &[]).await,
        client.send("GET", "/people/../admin", None, &[]).await,
        client.send("GET", "", None, &[]).await,
    ] {
        assert!(matches!(result, Err(ResilienceError::ValidationError(_))));
    }

    assert_eq!(client.analytics().snapshot().await.total_requests, 0);
}

#[tokio::test]
async fn test_health_check_with_reachable_crm() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/identity"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user": "integration"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let report = client.health_check().await;

    assert_eq!(report.checks[&CheckName::Connectivity].status, CheckStatus::Pass);
    assert_eq!(report.checks[&CheckName::Authentication].status, CheckStatus::Pass);
    assert_eq!(report.checks[&CheckName::RateLimiting].status, CheckStatus::Pass);
    assert_eq!(report.checks[&CheckName::Performance].status, CheckStatus::Pass);
    // Plain HTTP mock server without TLS enforcement
    assert_eq!(report.checks[&CheckName::TransportSecurity].status, CheckStatus::Fail);
    assert_eq!(report.score, 80);
    assert_eq!(report.status, HealthStatus::Warning);
    assert!(!report.recommendations.is_empty());

    let history = client.health_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0], report);
}

#[tokio::test]
async fn test_recent_health_check_reuses_fresh_report() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/identity"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user": "integration"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let first = client.recent_health_check().await;
    let second = client.recent_health_check().await;

    assert_eq!(first, second);
    assert_eq!(client.health_history().await.len(), 1);
    assert_eq!(client.analytics().snapshot().await.total_requests, 1);
}

#[tokio::test]
async fn test_health_check_with_revoked_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/identity"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"errorMessage": "invalid token"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_client(&create_test_config(mock_server.uri()));
    let report = client.health_check().await;

    assert_eq!(report.checks[&CheckName::Connectivity].status, CheckStatus::Warn);
    assert_eq!(report.checks[&CheckName::Authentication].status, CheckStatus::Fail);
    assert_eq!(report.checks[&CheckName::Performance].status, CheckStatus::Fail);
    assert_eq!(report.status, HealthStatus::Critical);

    let diagnostics = client.diagnostics().await;
    assert_eq!(diagnostics.last_health.map(|r| r.score), Some(report.score));
}
