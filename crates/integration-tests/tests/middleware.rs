mod harness;

use harness::config::ConfigBuilder;
use harness::mock_llm::MockLlm;
use harness::server::TestServer;
use prism_config::{AnyOrList, CorsConfig};
use serde_json::json;

#[tokio::test]
async fn cors_allows_configured_origin() {
    let mock = MockLlm::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_openai_provider("mock", &mock.base_url())
        .with_cors(CorsConfig {
            origins: AnyOrList::List(vec!["http://example.com".to_owned()]),
            ..CorsConfig::default()
        })
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .get(server.url("/health"))
        .header("Origin", "http://example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("http://example.com")
    );
}

#[tokio::test]
async fn cors_is_off_without_configuration() {
    let mock = MockLlm::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_openai_provider("mock", &mock.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .get(server.url("/health"))
        .header("Origin", "http://anywhere.example")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn caller_key_is_forwarded_only_when_configured() {
    let mock = MockLlm::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_openai_provider("mock", &mock.base_url())
        .with_forward_authorization("mock")
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1/chat/completions"))
        .header("x-api-key", "sk-caller")
        .json(&json!({"model": "mock-model-1", "messages": [{"role": "user", "content": "Hi"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(mock.last_header("authorization").as_deref(), Some("Bearer sk-caller"));
}

#[tokio::test]
async fn configured_key_is_used_by_default() {
    let mock = MockLlm::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_openai_provider("mock", &mock.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    server
        .client()
        .post(server.url("/v1/chat/completions"))
        .bearer_auth("sk-caller")
        .json(&json!({"model": "mock-model-1", "messages": [{"role": "user", "content": "Hi"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(mock.last_header("authorization").as_deref(), Some("Bearer test-key"));
}
