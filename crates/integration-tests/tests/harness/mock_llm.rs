//! Mock upstream providers for integration tests
//!
//! [`MockLlm`] speaks the `OpenAI` API (chat, models, embeddings, files,
//! batches); [`MockAnthropic`] speaks the Anthropic messages API and
//! [`MockGoogle`] the Gemini `generateContent` API. All of them count
//! requests and keep the last request body for assertions.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const CREATED: u64 = 1_700_000_000;
const DEFAULT_CONTENT: &str = "Hello from mock LLM";

/// Upload id the mock hands out for every file
pub const MOCK_FILE_ID: &str = "file-mock-1";
/// Id of the single batch the mock tracks
pub const MOCK_BATCH_ID: &str = "batch_mock_1";
const OUTPUT_FILE_ID: &str = "file-output-1";

#[derive(Default)]
struct Recorder {
    request_count: AtomicU32,
    completion_count: AtomicU32,
    embedding_count: AtomicU32,
    cancel_count: AtomicU32,
    /// Requests to fail with 500 before succeeding
    fail_count: AtomicU32,
    response_content: Option<String>,
    last_body: Mutex<Option<Value>>,
    last_headers: Mutex<Option<HeaderMap>>,
    batch_status: Mutex<String>,
    uploaded_purpose: Mutex<Option<String>>,
    /// Stall before answering chat and batch polls
    delay: Mutex<Option<Duration>>,
}

impl Recorder {
    fn new(fail_count: u32, response_content: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            fail_count: AtomicU32::new(fail_count),
            response_content,
            batch_status: Mutex::new("validating".to_owned()),
            ..Self::default()
        })
    }

    fn record(&self, headers: &HeaderMap, body: Option<&Value>) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_headers.lock().unwrap() = Some(headers.clone());
        if let Some(body) = body {
            *self.last_body.lock().unwrap() = Some(body.clone());
        }
    }

    /// Consume one scheduled failure, if any remain
    fn should_fail(&self) -> bool {
        self.fail_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn content(&self) -> &str {
        self.response_content.as_deref().unwrap_or(DEFAULT_CONTENT)
    }

    async fn stall(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

async fn serve(app: Router) -> anyhow::Result<Running> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { trigger.cancelled().await })
            .await
            .ok();
    });

    Ok(Running { addr, shutdown })
}

fn sse(events: impl IntoIterator<Item = (Option<&'static str>, Value)>) -> Response {
    let mut body = String::new();
    for (name, data) in events {
        if let Some(name) = name {
            body.push_str(&format!("event: {name}\n"));
        }
        body.push_str(&format!("data: {data}\n\n"));
    }

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

fn server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": {"message": "mock server intentional failure", "type": "server_error"}})),
    )
        .into_response()
}

// -- OpenAI --

/// `OpenAI`-compatible mock backend
pub struct MockLlm {
    running: Running,
    state: Arc<Recorder>,
}

impl MockLlm {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_inner(0, None).await
    }

    /// Fail the first `n` requests with 500
    pub async fn start_failing(n: u32) -> anyhow::Result<Self> {
        Self::start_inner(n, None).await
    }

    pub async fn start_with_response(content: &str) -> anyhow::Result<Self> {
        Self::start_inner(0, Some(content.to_owned())).await
    }

    async fn start_inner(fail_count: u32, response_content: Option<String>) -> anyhow::Result<Self> {
        let state = Recorder::new(fail_count, response_content);

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(openai_chat))
            .route("/v1/models", routing::get(openai_models))
            .route("/v1/embeddings", routing::post(openai_embeddings))
            .route("/v1/files", routing::post(openai_upload))
            .route("/v1/files/{id}", routing::get(openai_file))
            .route("/v1/files/{id}/content", routing::get(openai_file_content))
            .route("/v1/batches", routing::post(openai_create_batch))
            .route("/v1/batches/{id}", routing::get(openai_batch))
            .route("/v1/batches/{id}/cancel", routing::post(openai_cancel_batch))
            .route("/openai/deployments/{deployment}/chat/completions", routing::post(openai_chat))
            .with_state(Arc::clone(&state));

        Ok(Self {
            running: serve(app).await?,
            state,
        })
    }

    /// Base URL including `/v1`, as the provider appends `chat/completions`
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.running.addr)
    }

    /// Root URL without a path, as Azure endpoints are configured
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.running.addr)
    }

    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::Relaxed)
    }

    pub fn completion_count(&self) -> u32 {
        self.state.completion_count.load(Ordering::Relaxed)
    }

    pub fn embedding_count(&self) -> u32 {
        self.state.embedding_count.load(Ordering::Relaxed)
    }

    pub fn cancel_count(&self) -> u32 {
        self.state.cancel_count.load(Ordering::Relaxed)
    }

    /// Body of the most recent JSON request
    pub fn last_body(&self) -> Option<Value> {
        self.state.last_body.lock().unwrap().clone()
    }

    pub fn last_header(&self, name: &str) -> Option<String> {
        self.state
            .last_headers
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|headers| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    pub fn uploaded_purpose(&self) -> Option<String> {
        self.state.uploaded_purpose.lock().unwrap().clone()
    }

    /// Status the next batch retrieval reports
    pub fn set_batch_status(&self, status: &str) {
        *self.state.batch_status.lock().unwrap() = status.to_owned();
    }

    /// Hold every chat completion and batch poll for `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = Some(delay);
    }
}

impl Drop for MockLlm {
    fn drop(&mut self) {
        self.running.shutdown.cancel();
    }
}

async fn openai_chat(State(state): State<Arc<Recorder>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.record(&headers, Some(&body));
    state.completion_count.fetch_add(1, Ordering::Relaxed);
    state.stall().await;

    if state.should_fail() {
        return server_error();
    }

    let model = body["model"].as_str().unwrap_or_default().to_owned();
    let has_tools = body.get("tools").is_some_and(|tools| !tools.is_null());

    if body["stream"].as_bool().unwrap_or(false) {
        return openai_stream(&model, state.content(), has_tools);
    }

    let message = if has_tools {
        json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_test_123",
                "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"location\":\"San Francisco\"}"}
            }]
        })
    } else {
        json!({"role": "assistant", "content": state.content()})
    };

    Json(json!({
        "id": "chatcmpl-test-123",
        "object": "chat.completion",
        "created": CREATED,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": if has_tools { "tool_calls" } else { "stop" }
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    }))
    .into_response()
}

fn openai_stream(model: &str, content: &str, has_tools: bool) -> Response {
    let chunk = |delta: Value, finish_reason: Value| {
        json!({
            "id": "chatcmpl-test-stream",
            "object": "chat.completion.chunk",
            "created": CREATED,
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
        })
    };

    let mut chunks = Vec::new();
    if has_tools {
        // Arguments split across two chunks to exercise accumulation
        chunks.push(chunk(
            json!({"role": "assistant", "tool_calls": [{
                "index": 0,
                "id": "call_test_stream",
                "type": "function",
                "function": {"name": "get_weather", "arguments": ""}
            }]}),
            Value::Null,
        ));
        chunks.push(chunk(
            json!({"tool_calls": [{"index": 0, "function": {"arguments": "{\"location\":"}}]}),
            Value::Null,
        ));
        chunks.push(chunk(
            json!({"tool_calls": [{"index": 0, "function": {"arguments": "\"San Francisco\"}"}}]}),
            Value::Null,
        ));
        chunks.push(chunk(json!({}), json!("tool_calls")));
    } else {
        chunks.push(chunk(json!({"role": "assistant", "content": ""}), Value::Null));
        let words: Vec<&str> = content.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            let text = if i + 1 < words.len() { format!("{word} ") } else { (*word).to_owned() };
            chunks.push(chunk(json!({"content": text}), Value::Null));
        }
        chunks.push(chunk(json!({}), json!("stop")));
    }

    chunks.push(json!({
        "id": "chatcmpl-test-stream",
        "object": "chat.completion.chunk",
        "created": CREATED,
        "model": model,
        "choices": [],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    }));

    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn openai_models(State(state): State<Arc<Recorder>>, headers: HeaderMap) -> Response {
    state.record(&headers, None);

    if state.should_fail() {
        return server_error();
    }

    Json(json!({
        "object": "list",
        "data": [{"id": "mock-model-1", "object": "model", "created": CREATED, "owned_by": "mock"}]
    }))
    .into_response()
}

async fn openai_embeddings(State(state): State<Arc<Recorder>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.record(&headers, Some(&body));
    state.embedding_count.fetch_add(1, Ordering::Relaxed);

    let inputs = match &body["input"] {
        Value::Array(items) => items.len(),
        _ => 1,
    };
    let data: Vec<Value> = (0..inputs)
        .map(|index| json!({"object": "embedding", "index": index, "embedding": [0.1, 0.2, 0.3, 0.4, 0.5]}))
        .collect();

    Json(json!({
        "object": "list",
        "data": data,
        "model": body["model"],
        "usage": {"prompt_tokens": 8, "total_tokens": 8}
    }))
    .into_response()
}

fn file_object(id: &str, purpose: &str) -> Value {
    json!({
        "id": id,
        "object": "file",
        "bytes": 128,
        "created_at": CREATED,
        "filename": "requests.jsonl",
        "purpose": purpose,
        "status": "processed"
    })
}

async fn openai_upload(State(state): State<Arc<Recorder>>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    state.record(&headers, None);

    let mut purpose = String::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("purpose") {
            purpose = field.text().await.unwrap_or_default();
        } else {
            let _ = field.bytes().await;
        }
    }

    *state.uploaded_purpose.lock().unwrap() = Some(purpose.clone());
    Json(file_object(MOCK_FILE_ID, &purpose)).into_response()
}

async fn openai_file(State(state): State<Arc<Recorder>>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    state.record(&headers, None);

    if id == OUTPUT_FILE_ID {
        return Json(file_object(&id, "batch_output")).into_response();
    }

    let purpose = state
        .uploaded_purpose
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| "batch".to_owned());
    Json(file_object(&id, &purpose)).into_response()
}

async fn openai_file_content(State(state): State<Arc<Recorder>>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    state.record(&headers, None);

    if id != OUTPUT_FILE_ID {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": {"message": "file is not downloadable"}}))).into_response();
    }

    let lines = [
        json!({
            "id": "batch_req_1",
            "custom_id": "first",
            "response": {"status_code": 200, "body": {"id": "chatcmpl-1", "object": "chat.completion"}}
        }),
        json!({
            "id": "batch_req_2",
            "custom_id": "second",
            "error": {"code": "invalid_request", "message": "bad model"}
        }),
    ];
    let body: String = lines.iter().map(|line| format!("{line}\n")).collect();

    ([(header::CONTENT_TYPE, "application/jsonl")], body).into_response()
}

fn batch_object(status: &str, input_file_id: &str) -> Value {
    json!({
        "id": MOCK_BATCH_ID,
        "object": "batch",
        "endpoint": "/v1/chat/completions",
        "input_file_id": input_file_id,
        "completion_window": "24h",
        "status": status,
        "output_file_id": (status == "completed").then_some(OUTPUT_FILE_ID),
        "created_at": CREATED,
        "request_counts": {"total": 2, "completed": 1, "failed": 1}
    })
}

async fn openai_create_batch(State(state): State<Arc<Recorder>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.record(&headers, Some(&body));

    let status = state.batch_status.lock().unwrap().clone();
    let input = body["input_file_id"].as_str().unwrap_or_default().to_owned();
    Json(batch_object(&status, &input)).into_response()
}

async fn openai_batch(State(state): State<Arc<Recorder>>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    state.record(&headers, None);
    state.stall().await;

    if id != MOCK_BATCH_ID {
        return (StatusCode::NOT_FOUND, Json(json!({"error": {"message": "No such batch"}}))).into_response();
    }

    let status = state.batch_status.lock().unwrap().clone();
    Json(batch_object(&status, MOCK_FILE_ID)).into_response()
}

async fn openai_cancel_batch(State(state): State<Arc<Recorder>>, headers: HeaderMap) -> Response {
    state.record(&headers, None);
    state.cancel_count.fetch_add(1, Ordering::Relaxed);

    *state.batch_status.lock().unwrap() = "cancelling".to_owned();
    Json(batch_object("cancelling", MOCK_FILE_ID)).into_response()
}

// -- Anthropic --

/// Anthropic messages mock backend
pub struct MockAnthropic {
    running: Running,
    state: Arc<Recorder>,
}

impl MockAnthropic {
    pub async fn start() -> anyhow::Result<Self> {
        let state = Recorder::new(0, None);

        let app = Router::new()
            .route("/v1/messages", routing::post(anthropic_messages))
            .with_state(Arc::clone(&state));

        Ok(Self {
            running: serve(app).await?,
            state,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.running.addr)
    }

    pub fn completion_count(&self) -> u32 {
        self.state.completion_count.load(Ordering::Relaxed)
    }

    pub fn last_body(&self) -> Option<Value> {
        self.state.last_body.lock().unwrap().clone()
    }

    pub fn last_header(&self, name: &str) -> Option<String> {
        self.state
            .last_headers
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|headers| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }
}

impl Drop for MockAnthropic {
    fn drop(&mut self) {
        self.running.shutdown.cancel();
    }
}

async fn anthropic_messages(State(state): State<Arc<Recorder>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.record(&headers, Some(&body));
    state.completion_count.fetch_add(1, Ordering::Relaxed);

    let model = body["model"].as_str().unwrap_or_default().to_owned();
    let has_tools = body.get("tools").is_some_and(|tools| !tools.is_null());

    if body["stream"].as_bool().unwrap_or(false) {
        return anthropic_stream(&model, state.content(), has_tools);
    }

    let (content, stop_reason) = if has_tools {
        (
            json!([
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_test_1", "name": "get_weather", "input": {"location": "Paris"}}
            ]),
            "tool_use",
        )
    } else {
        (json!([{"type": "text", "text": state.content()}]), "end_turn")
    };

    Json(json!({
        "id": "msg_test_123",
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": 12,
            "output_tokens": 6,
            "cache_read_input_tokens": 4,
            "cache_creation_input_tokens": 0
        }
    }))
    .into_response()
}

fn anthropic_stream(model: &str, content: &str, has_tools: bool) -> Response {
    let mut events = vec![
        (
            Some("message_start"),
            json!({"type": "message_start", "message": {
                "id": "msg_test_stream", "type": "message", "role": "assistant", "model": model,
                "content": [], "stop_reason": null,
                "usage": {"input_tokens": 12, "output_tokens": 0}
            }}),
        ),
        (Some("ping"), json!({"type": "ping"})),
    ];

    if has_tools {
        events.push((
            Some("content_block_start"),
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "tool_use", "id": "toolu_stream_1", "name": "get_weather", "input": {}}}),
        ));
        for part in ["{\"location\":", "\"Paris\"}"] {
            events.push((
                Some("content_block_delta"),
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "input_json_delta", "partial_json": part}}),
            ));
        }
    } else {
        events.push((
            Some("content_block_start"),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        ));
        events.push((
            Some("content_block_delta"),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": content}}),
        ));
    }

    events.push((Some("content_block_stop"), json!({"type": "content_block_stop", "index": 0})));
    events.push((
        Some("message_delta"),
        json!({"type": "message_delta",
               "delta": {"stop_reason": if has_tools { "tool_use" } else { "end_turn" }, "stop_sequence": null},
               "usage": {"output_tokens": 6}}),
    ));
    events.push((Some("message_stop"), json!({"type": "message_stop"})));

    sse(events)
}

// -- Google --

/// Gemini `generateContent` mock backend
pub struct MockGoogle {
    running: Running,
    state: Arc<Recorder>,
}

impl MockGoogle {
    pub async fn start() -> anyhow::Result<Self> {
        let state = Recorder::new(0, None);

        let app = Router::new()
            .route("/v1beta/models/{*action}", routing::post(google_action))
            .with_state(Arc::clone(&state));

        Ok(Self {
            running: serve(app).await?,
            state,
        })
    }

    /// Base URL including `/v1beta`
    pub fn base_url(&self) -> String {
        format!("http://{}/v1beta", self.running.addr)
    }

    pub fn completion_count(&self) -> u32 {
        self.state.completion_count.load(Ordering::Relaxed)
    }

    pub fn last_body(&self) -> Option<Value> {
        self.state.last_body.lock().unwrap().clone()
    }

    pub fn last_header(&self, name: &str) -> Option<String> {
        self.state
            .last_headers
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|headers| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }
}

impl Drop for MockGoogle {
    fn drop(&mut self) {
        self.running.shutdown.cancel();
    }
}

async fn google_action(
    State(state): State<Arc<Recorder>>,
    headers: HeaderMap,
    Path(action): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    state.record(&headers, Some(&body));

    let Some((model, method)) = action.rsplit_once(':') else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": {"code": 404, "message": "no method"}}))).into_response();
    };
    if method != "generateContent" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"code": 400, "message": format!("unsupported method {method}"), "status": "INVALID_ARGUMENT"}})),
        )
            .into_response();
    }

    state.completion_count.fetch_add(1, Ordering::Relaxed);
    let has_tools = body.get("tools").is_some_and(|tools| !tools.is_null());

    let parts = if has_tools {
        json!([{"functionCall": {"name": "get_weather", "args": {"location": "Berlin"}}}])
    } else {
        json!([{"text": state.content()}])
    };

    Json(json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": "STOP",
            "index": 0
        }],
        "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3, "totalTokenCount": 10},
        "modelVersion": model
    }))
    .into_response()
}
