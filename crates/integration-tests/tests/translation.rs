mod harness;

use harness::config::ConfigBuilder;
use harness::mock_llm::{MockAnthropic, MockGoogle, MockLlm};
use harness::server::TestServer;
use serde_json::json;

#[tokio::test]
async fn anthropic_messages_reach_an_openai_upstream() {
    let mock = MockLlm::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_openai_provider("mock", &mock.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1/messages"))
        .header("anthropic-version", "2023-06-01")
        .json(&json!({
            "model": "mock/gpt-4o-mini",
            "max_tokens": 256,
            "system": "Answer briefly.",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "Hi"}]}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);

    let upstream = mock.last_body().unwrap();
    assert_eq!(upstream["model"], "gpt-4o-mini");
    assert_eq!(upstream["messages"][0]["role"], "system");
    assert_eq!(upstream["messages"][0]["content"], "Answer briefly.");
    assert_eq!(upstream["messages"][1]["role"], "user");

    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["type"], "message");
    assert_eq!(json["role"], "assistant");
    assert_eq!(json["content"][0]["type"], "text");
    assert_eq!(json["content"][0]["text"], "Hello from mock LLM");
    assert_eq!(json["stop_reason"], "end_turn");
    assert_eq!(json["usage"]["input_tokens"], 10);
    assert_eq!(json["usage"]["output_tokens"], 5);
}

#[tokio::test]
async fn openai_chat_reaches_an_anthropic_upstream() {
    let anthropic = MockAnthropic::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_anthropic_provider("claude", &anthropic.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1/chat/completions"))
        .json(&json!({
            "model": "claude/claude-3-5-haiku-latest",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "Hello"}
            ]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);

    assert_eq!(anthropic.last_header("x-api-key").as_deref(), Some("test-key"));
    assert!(anthropic.last_header("anthropic-version").is_some());

    let upstream = anthropic.last_body().unwrap();
    assert_eq!(upstream["model"], "claude-3-5-haiku-latest");
    assert_eq!(upstream["system"], "Be terse.");
    assert_eq!(upstream["max_tokens"], 4096);
    assert_eq!(upstream["messages"].as_array().unwrap().len(), 1);
    assert_eq!(upstream["messages"][0]["role"], "user");

    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["choices"][0]["message"]["content"], "Hello from mock LLM");
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    // Prompt tokens include cache reads
    assert_eq!(json["usage"]["prompt_tokens"], 16);
    assert_eq!(json["usage"]["completion_tokens"], 6);
}

#[tokio::test]
async fn anthropic_tool_use_becomes_openai_tool_calls() {
    let anthropic = MockAnthropic::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_anthropic_provider("claude", &anthropic.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1/chat/completions"))
        .json(&json!({
            "model": "claude/claude-3-5-haiku-latest",
            "messages": [{"role": "user", "content": "Weather in Paris?"}],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "parameters": {"type": "object", "properties": {"location": {"type": "string"}}}
                }
            }]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);

    let upstream = anthropic.last_body().unwrap();
    assert_eq!(upstream["tools"][0]["name"], "get_weather");
    assert_eq!(upstream["tools"][0]["input_schema"]["type"], "object");

    let json: serde_json::Value = resp.json().await.unwrap();
    let call = &json["choices"][0]["message"]["tool_calls"][0];
    assert_eq!(call["id"], "toolu_test_1");
    assert_eq!(call["function"]["name"], "get_weather");

    let arguments: serde_json::Value = serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(arguments["location"], "Paris");
    assert_eq!(json["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn google_generate_content_reaches_an_openai_upstream() {
    let mock = MockLlm::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_openai_provider("mock", &mock.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1beta/models/mock-model-1:generateContent"))
        .json(&json!({
            "systemInstruction": {"parts": [{"text": "Be kind."}]},
            "contents": [{"role": "user", "parts": [{"text": "Hello"}]}],
            "generationConfig": {"maxOutputTokens": 50}
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);

    let upstream = mock.last_body().unwrap();
    assert_eq!(upstream["model"], "mock-model-1");
    assert_eq!(upstream["messages"][0]["role"], "system");

    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["candidates"][0]["content"]["role"], "model");
    assert_eq!(json["candidates"][0]["content"]["parts"][0]["text"], "Hello from mock LLM");
    assert_eq!(json["usageMetadata"]["promptTokenCount"], 10);
    assert_eq!(json["usageMetadata"]["candidatesTokenCount"], 5);
}

#[tokio::test]
async fn google_unknown_method_is_rejected_in_google_shape() {
    let mock = MockLlm::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_openai_provider("mock", &mock.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1beta/models/mock-model-1:countTokens"))
        .json(&json!({"contents": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);

    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"]["code"], 400);
    assert_eq!(json["error"]["status"], "INVALID_ARGUMENT");
    assert_eq!(mock.request_count(), 0);
}

#[tokio::test]
async fn bedrock_converse_reaches_an_anthropic_upstream() {
    let anthropic = MockAnthropic::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_anthropic_provider("claude", &anthropic.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/model/claude-3-5-haiku-latest/converse"))
        .json(&json!({
            "system": [{"text": "Stay calm."}],
            "messages": [{"role": "user", "content": [{"text": "Hello"}]}],
            "inferenceConfig": {"maxTokens": 100}
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);

    let upstream = anthropic.last_body().unwrap();
    assert_eq!(upstream["model"], "claude-3-5-haiku-latest");
    assert_eq!(upstream["system"], "Stay calm.");
    assert_eq!(upstream["max_tokens"], 100);

    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["output"]["message"]["role"], "assistant");
    assert_eq!(json["output"]["message"]["content"][0]["text"], "Hello from mock LLM");
    assert_eq!(json["stopReason"], "end_turn");
    assert_eq!(json["usage"]["outputTokens"], 6);
    assert_eq!(json["usage"]["cacheReadInputTokens"], 4);
}

#[tokio::test]
async fn bedrock_errors_carry_the_aws_error_type() {
    let mock = MockLlm::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_openai_provider("mock", &mock.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/model/anthropic%2Fclaude-3-haiku/converse"))
        .json(&json!({"messages": [{"role": "user", "content": [{"text": "Hello"}]}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    assert_eq!(resp.headers()["x-amzn-errortype"], "ValidationException");

    let json: serde_json::Value = resp.json().await.unwrap();
    assert!(json["message"].as_str().unwrap().contains("anthropic"));
}

#[tokio::test]
async fn openai_chat_reaches_a_google_upstream() {
    let google = MockGoogle::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_google_provider("gemini", &google.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1/chat/completions"))
        .json(&json!({
            "model": "gemini/gemini-2.0-flash",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Hello"}
            ]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(google.last_header("x-goog-api-key").as_deref(), Some("test-key"));

    let upstream = google.last_body().unwrap();
    assert_eq!(upstream["systemInstruction"]["parts"][0]["text"], "Be brief.");
    assert_eq!(upstream["contents"].as_array().unwrap().len(), 1);
    assert_eq!(upstream["contents"][0]["role"], "user");

    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["choices"][0]["message"]["content"], "Hello from mock LLM");
    assert_eq!(json["usage"]["prompt_tokens"], 7);
    assert_eq!(json["usage"]["completion_tokens"], 3);
}

#[tokio::test]
async fn google_tool_schemas_are_normalized() {
    let google = MockGoogle::start().await.unwrap();
    let config = ConfigBuilder::new()
        .with_google_provider("gemini", &google.base_url())
        .build();

    let server = TestServer::start(config).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1/chat/completions"))
        .json(&json!({
            "model": "gemini/gemini-2.0-flash",
            "messages": [{"role": "user", "content": "Weather in Berlin?"}],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "parameters": {
                        "$schema": "http://json-schema.org/draft-07/schema#",
                        "type": "OBJECT",
                        "additionalProperties": false,
                        "properties": {"location": {"type": "STRING"}}
                    }
                }
            }]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);

    let upstream = google.last_body().unwrap();
    let schema = &upstream["tools"][0]["functionDeclarations"][0]["parameters"];
    assert_eq!(schema["type"], "object");
    assert_eq!(schema["properties"]["location"]["type"], "string");
    assert!(schema.get("additionalProperties").is_none());
    assert!(schema.get("$schema").is_none());

    let json: serde_json::Value = resp.json().await.unwrap();
    let call = &json["choices"][0]["message"]["tool_calls"][0];
    assert_eq!(call["function"]["name"], "get_weather");
    assert!(!call["id"].as_str().unwrap().is_empty());

    let arguments: serde_json::Value = serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(arguments["location"], "Berlin");
}
