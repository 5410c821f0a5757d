//! Conversion between canonical types and the Google `generateContent` format
//!
//! Google identifies tool results by function name, so outbound results look
//! the name up from the matching call earlier in the conversation. Calls from
//! older model versions carry no id; one is generated and responses without
//! an id are paired with the oldest pending call of the same name.

use std::collections::{HashMap, VecDeque};

use eventsource_stream::Event;
use serde_json::{Map, Value, json};

use super::{BlockCursor, DEFAULT_THINKING_BUDGET};
use crate::error::LlmError;
use crate::protocol::google::{
    GoogleBatchEmbedRequest, GoogleBatchEmbedResponse, GoogleCandidate, GoogleContent, GoogleEmbedRequest,
    GoogleEmbedResponse, GoogleEmbedding, GoogleErrorResponse, GoogleFileData, GoogleFunctionCall,
    GoogleFunctionCallingConfig, GoogleFunctionDeclaration, GoogleFunctionResponse, GoogleGenerationConfig,
    GoogleInlineData, GooglePart, GoogleRequest, GoogleResponse, GoogleThinkingConfig, GoogleTool, GoogleToolConfig,
    GoogleUsageMetadata,
};
use crate::reconcile::{ToolCallLedger, reconcile};
use crate::stream::StreamDecoder;
use crate::types::{
    BlockDelta, BlockKind, CompletionParams, CompletionRequest, CompletionResponse, ContentPart, EmbeddingRequest,
    EmbeddingResponse, ImageSource, Message, Role, StopReason, StreamEvent, ThinkingConfig, ToolChoice,
    ToolResultStatus, ToolSpec, Usage,
};

/// Schema keywords the function declaration parser rejects
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties", "$id"];

fn call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Model resource name as used in URLs and embedding requests
pub fn model_resource(model: &str) -> String {
    if model.starts_with("models/") || model.starts_with("tunedModels/") {
        model.to_owned()
    } else {
        format!("models/{model}")
    }
}

pub(crate) const fn finish_reason_str(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::ToolUse | StopReason::StopSequence => "STOP",
        StopReason::MaxTokens => "MAX_TOKENS",
        StopReason::ContentFilter => "SAFETY",
    }
}

fn parse_finish_reason(reason: &str, has_tool_calls: bool) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            StopReason::ContentFilter
        }
        _ if has_tool_calls => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

/// Rewrite a JSON Schema for or from Google's OpenAPI subset
///
/// `type` keywords are lower-cased and `["T", "null"]` becomes `T` with
/// `nullable`. With `strip` set, keywords Google rejects are removed.
fn rewrite_schema(schema: &Value, strip: bool) -> Value {
    match schema {
        Value::Object(object) => {
            let mut out = Map::with_capacity(object.len());

            for (key, value) in object {
                if strip && UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()) {
                    continue;
                }

                let value = match (key.as_str(), value) {
                    ("type", Value::String(kind)) => Value::String(kind.to_lowercase()),
                    ("type", Value::Array(kinds)) => {
                        let mut concrete = kinds.iter().filter_map(Value::as_str).filter(|kind| *kind != "null");
                        if kinds.len() > 1 && kinds.iter().any(|kind| kind == "null") {
                            out.insert("nullable".to_owned(), Value::Bool(true));
                        }
                        concrete
                            .next()
                            .map_or(Value::String("string".to_owned()), |kind| Value::String(kind.to_lowercase()))
                    }
                    ("properties" | "$defs" | "definitions", Value::Object(props)) => Value::Object(
                        props
                            .iter()
                            .map(|(name, prop)| (name.clone(), rewrite_schema(prop, strip)))
                            .collect(),
                    ),
                    ("properties" | "$defs" | "definitions", other) => other.clone(),
                    _ => rewrite_schema(value, strip),
                };

                out.insert(key.clone(), value);
            }

            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| rewrite_schema(item, strip)).collect()),
        other => other.clone(),
    }
}

// -- Inbound: Google wire format -> canonical --

/// Pairs function responses with calls when ids are missing
#[derive(Default)]
struct CallIds {
    pending: HashMap<String, VecDeque<String>>,
}

impl CallIds {
    fn for_call(&mut self, call: &GoogleFunctionCall) -> String {
        let id = call.id.clone().filter(|id| !id.is_empty()).unwrap_or_else(call_id);
        self.pending.entry(call.name.clone()).or_default().push_back(id.clone());
        id
    }

    fn for_response(&mut self, response: &GoogleFunctionResponse) -> String {
        let queue = self.pending.entry(response.name.clone()).or_default();

        match response.id.as_ref().filter(|id| !id.is_empty()) {
            Some(id) => {
                queue.retain(|pending| pending != id);
                id.clone()
            }
            None => queue.pop_front().unwrap_or_else(call_id),
        }
    }
}

/// Convert native parts in order
///
/// A `thoughtSignature` attached to a non-thought part becomes an empty
/// thinking block just before it, so the signature survives a round trip.
fn canonical_parts(parts: Vec<GooglePart>, ids: &mut CallIds) -> Vec<ContentPart> {
    let mut out = Vec::with_capacity(parts.len());

    for part in parts {
        if part.thought == Some(true) {
            out.push(ContentPart::Thinking {
                text: part.text.unwrap_or_default(),
                signature: part.thought_signature,
            });
            continue;
        }

        if let Some(signature) = part.thought_signature {
            out.push(ContentPart::Thinking {
                text: String::new(),
                signature: Some(signature),
            });
        }

        if let Some(text) = part.text {
            out.push(ContentPart::text(text));
        } else if let Some(inline) = part.inline_data {
            out.push(ContentPart::Image {
                source: ImageSource::Base64 {
                    media_type: inline.mime_type,
                    data: inline.data,
                },
                cache_control: None,
            });
        } else if let Some(file) = part.file_data {
            out.push(ContentPart::Image {
                source: ImageSource::Url { url: file.file_uri },
                cache_control: None,
            });
        } else if let Some(call) = part.function_call {
            let id = ids.for_call(&call);
            out.push(ContentPart::ToolUse {
                id,
                name: call.name,
                input: call.args,
            });
        } else if let Some(response) = part.function_response {
            let tool_use_id = ids.for_response(&response);
            let (content, status) = tool_result_content(response.response);
            out.push(ContentPart::ToolResult {
                tool_use_id,
                content: vec![ContentPart::text(content)],
                status,
                cache_control: None,
            });
        } else {
            tracing::warn!("dropping empty or unsupported part");
        }
    }

    out
}

/// Unwrap `{"result": ..}` and `{"error": ..}` envelopes into tool result text
fn tool_result_content(response: Value) -> (String, ToolResultStatus) {
    let Value::Object(mut object) = response else {
        return (super::arguments_string(&response), ToolResultStatus::Success);
    };

    if object.len() == 1 {
        for (key, status) in [
            ("result", ToolResultStatus::Success),
            ("output", ToolResultStatus::Success),
            ("error", ToolResultStatus::Error),
        ] {
            if let Some(value) = object.remove(key) {
                return (super::arguments_string(&value), status);
            }
        }
    }

    (Value::Object(object).to_string(), ToolResultStatus::Success)
}

impl TryFrom<GoogleRequest> for CompletionRequest {
    type Error = LlmError;

    fn try_from(req: GoogleRequest) -> Result<Self, Self::Error> {
        let mut ids = CallIds::default();
        let mut messages = Vec::with_capacity(req.contents.len() + 1);

        if let Some(system) = req.system_instruction {
            messages.push(Message {
                role: Role::System,
                content: canonical_parts(system.parts, &mut ids),
            });
        }

        for content in req.contents {
            let role = match content.role.as_deref() {
                None | Some("user") => Role::User,
                Some("model") => Role::Assistant,
                Some("function" | "tool") => Role::Tool,
                Some(other) => {
                    return Err(LlmError::InvalidRequest(format!(
                        "unsupported content role '{other}', expected 'user' or 'model'"
                    )));
                }
            };

            messages.push(Message {
                role,
                content: canonical_parts(content.parts, &mut ids),
            });
        }

        let config = req.generation_config.unwrap_or_default();

        let thinking = config.thinking_config.map(|thinking| match thinking.thinking_budget {
            Some(0) => ThinkingConfig {
                enabled: false,
                budget_tokens: None,
            },
            budget => ThinkingConfig {
                enabled: budget.is_some() || thinking.include_thoughts == Some(true),
                budget_tokens: budget.and_then(|b| u32::try_from(b).ok()),
            },
        });

        let tools: Vec<ToolSpec> = req
            .tools
            .unwrap_or_default()
            .into_iter()
            .flat_map(|tool| tool.function_declarations)
            .map(|declaration| ToolSpec {
                name: declaration.name,
                description: declaration.description,
                parameters: declaration
                    .parameters
                    .map_or_else(|| json!({"type": "object", "properties": {}}), |p| rewrite_schema(&p, false)),
                cache_control: None,
            })
            .collect();

        let tool_choice = match req.tool_config {
            Some(config) => {
                let calling = config.function_calling_config;
                Some(match calling.mode.to_ascii_uppercase().as_str() {
                    "NONE" => ToolChoice::None,
                    "ANY" => match calling.allowed_function_names.as_deref() {
                        Some([name]) => ToolChoice::Tool { name: name.clone() },
                        _ => ToolChoice::Any,
                    },
                    _ => ToolChoice::Auto,
                })
            }
            None => None,
        };

        Ok(Self {
            model: String::new(),
            messages,
            params: CompletionParams {
                temperature: config.temperature,
                top_p: config.top_p,
                top_k: config.top_k,
                max_tokens: config.max_output_tokens,
                stop: config.stop_sequences,
                seed: config.seed,
            },
            tools,
            tool_choice,
            parallel_tool_calls: None,
            thinking,
            stream: false,
        })
    }
}

// -- Outbound: canonical -> Google wire request --

impl From<&CompletionRequest> for GoogleRequest {
    fn from(req: &CompletionRequest) -> Self {
        let ledger = ToolCallLedger::from_messages(&req.messages);
        let (system, rest) = req.split_system();

        let system_instruction = (!system.is_empty()).then(|| GoogleContent {
            role: None,
            parts: native_parts(&system, &ledger),
        });

        let mut contents: Vec<GoogleContent> = Vec::with_capacity(rest.len());
        for message in rest {
            let role = if message.role == Role::Assistant { "model" } else { "user" };
            let parts = native_parts(&message.content, &ledger);

            if parts.is_empty() {
                continue;
            }

            match contents.last_mut() {
                Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
                _ => contents.push(GoogleContent {
                    role: Some(role.to_owned()),
                    parts,
                }),
            }
        }

        let thinking_config = req.thinking.map(|thinking| {
            if thinking.enabled {
                GoogleThinkingConfig {
                    thinking_budget: Some(
                        i32::try_from(thinking.budget_tokens.unwrap_or(DEFAULT_THINKING_BUDGET)).unwrap_or(i32::MAX),
                    ),
                    include_thoughts: Some(true),
                }
            } else {
                GoogleThinkingConfig {
                    thinking_budget: Some(0),
                    include_thoughts: None,
                }
            }
        });

        let tools = (!req.tools.is_empty()).then(|| {
            vec![GoogleTool {
                function_declarations: req.tools.iter().map(Into::into).collect(),
            }]
        });

        let tool_config = req.tool_choice.as_ref().map(|choice| {
            let (mode, allowed) = match choice {
                ToolChoice::Auto => ("AUTO", None),
                ToolChoice::None => ("NONE", None),
                ToolChoice::Any => ("ANY", None),
                ToolChoice::Tool { name } => ("ANY", Some(vec![name.clone()])),
            };
            GoogleToolConfig {
                function_calling_config: GoogleFunctionCallingConfig {
                    mode: mode.to_owned(),
                    allowed_function_names: allowed,
                },
            }
        });

        Self {
            contents,
            system_instruction,
            generation_config: Some(GoogleGenerationConfig {
                temperature: req.params.temperature,
                top_p: req.params.top_p,
                top_k: req.params.top_k,
                max_output_tokens: req.params.max_tokens,
                stop_sequences: req.params.stop.clone(),
                candidate_count: None,
                seed: req.params.seed,
                thinking_config,
            }),
            tools,
            tool_config,
        }
    }
}

impl From<&ToolSpec> for GoogleFunctionDeclaration {
    fn from(tool: &ToolSpec) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(rewrite_schema(&tool.parameters, true)),
        }
    }
}

fn native_parts(parts: &[ContentPart], ledger: &ToolCallLedger) -> Vec<GooglePart> {
    let mut out = Vec::with_capacity(parts.len());
    let mut signature: Option<String> = None;

    for part in parts {
        let native = match part {
            ContentPart::Thinking { text, signature: sig } if text.is_empty() => {
                signature.clone_from(sig);
                continue;
            }
            ContentPart::Thinking { text, signature: sig } => GooglePart {
                text: Some(text.clone()),
                thought: Some(true),
                thought_signature: sig.clone(),
                ..GooglePart::default()
            },
            ContentPart::Text { text, .. } => GooglePart::text(text.clone()),
            ContentPart::Image { source, .. } => match source {
                ImageSource::Base64 { media_type, data } => GooglePart {
                    inline_data: Some(GoogleInlineData {
                        mime_type: media_type.clone(),
                        data: data.clone(),
                    }),
                    ..GooglePart::default()
                },
                ImageSource::Url { url } => GooglePart {
                    file_data: Some(GoogleFileData {
                        mime_type: None,
                        file_uri: url.clone(),
                    }),
                    ..GooglePart::default()
                },
            },
            ContentPart::ToolUse { id, name, input } => GooglePart {
                function_call: Some(GoogleFunctionCall {
                    id: Some(id.clone()),
                    name: name.clone(),
                    args: if input.is_object() {
                        input.clone()
                    } else {
                        json!({ "input": input })
                    },
                }),
                ..GooglePart::default()
            },
            ContentPart::ToolResult {
                tool_use_id,
                content,
                status,
                ..
            } => {
                let name = ledger.name_of(tool_use_id).map_or_else(
                    || {
                        tracing::warn!(tool_use_id = %tool_use_id, "tool result has no matching call, using its id as name");
                        tool_use_id.clone()
                    },
                    ToOwned::to_owned,
                );
                if content.iter().any(|part| matches!(part, ContentPart::Image { .. })) {
                    tracing::warn!(tool_use_id = %tool_use_id, "dropping images inside tool result");
                }
                let text = ContentPart::text_of(content);
                let parsed = serde_json::from_str::<Value>(&text).ok().filter(Value::is_object);
                let response = match (status, parsed) {
                    (ToolResultStatus::Success, Some(object)) => object,
                    (ToolResultStatus::Success, None) => json!({ "result": text }),
                    (ToolResultStatus::Error, _) => json!({ "error": text }),
                };
                GooglePart {
                    function_response: Some(GoogleFunctionResponse {
                        id: Some(tool_use_id.clone()),
                        name,
                        response,
                    }),
                    ..GooglePart::default()
                }
            }
        };

        out.push(GooglePart {
            thought_signature: native.thought_signature.or_else(|| signature.take()),
            ..native
        });
    }

    out
}

// -- Responses in both directions --

impl From<&GoogleUsageMetadata> for Usage {
    fn from(usage: &GoogleUsageMetadata) -> Self {
        Self {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count + usage.thoughts_token_count.unwrap_or_default(),
            cache_read_tokens: usage.cached_content_token_count.unwrap_or_default(),
            cache_write_tokens: 0,
        }
    }
}

impl From<Usage> for GoogleUsageMetadata {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_token_count: usage.input_tokens,
            candidates_token_count: usage.output_tokens,
            total_token_count: usage.total(),
            thoughts_token_count: None,
            cached_content_token_count: (usage.cache_read_tokens > 0).then_some(usage.cache_read_tokens),
        }
    }
}

impl From<GoogleResponse> for CompletionResponse {
    fn from(resp: GoogleResponse) -> Self {
        let usage = resp.usage_metadata.as_ref().map(Usage::from).unwrap_or_default();
        let candidate = resp.candidates.into_iter().next().unwrap_or_default();
        let content = reconcile(canonical_parts(candidate.content.parts, &mut CallIds::default()));
        let has_tool_calls = content.iter().any(|part| matches!(part, ContentPart::ToolUse { .. }));

        Self {
            id: resp.response_id.unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            model: resp.model_version.unwrap_or_default(),
            content,
            stop_reason: candidate
                .finish_reason
                .as_deref()
                .map(|reason| parse_finish_reason(reason, has_tool_calls)),
            usage,
        }
    }
}

impl From<&CompletionResponse> for GoogleResponse {
    fn from(resp: &CompletionResponse) -> Self {
        let ledger = ToolCallLedger::default();

        Self {
            candidates: vec![GoogleCandidate {
                content: GoogleContent {
                    role: Some("model".to_owned()),
                    parts: native_parts(&resp.content, &ledger),
                },
                finish_reason: resp.stop_reason.map(|reason| finish_reason_str(reason).to_owned()),
                index: Some(0),
            }],
            usage_metadata: Some(resp.usage.into()),
            model_version: Some(resp.model.clone()),
            response_id: Some(resp.id.clone()),
        }
    }
}

// -- Streaming --

/// Decodes `streamGenerateContent?alt=sse` chunks
///
/// Every chunk is a partial response. Text and thoughts arrive as fragments,
/// function calls arrive whole, and the chunk carrying `finishReason` ends
/// the message.
pub struct GoogleStreamDecoder {
    provider: String,
    cursor: BlockCursor,
    usage: Usage,
    started: bool,
    saw_tool_call: bool,
}

impl GoogleStreamDecoder {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            cursor: BlockCursor::default(),
            usage: Usage::default(),
            started: false,
            saw_tool_call: false,
        }
    }

    /// Translate one parsed chunk
    pub fn chunk(&mut self, chunk: GoogleResponse) -> Vec<StreamEvent> {
        let mut out = Vec::new();

        if !self.started {
            self.started = true;
            out.push(StreamEvent::MessageStart {
                id: chunk
                    .response_id
                    .clone()
                    .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
                model: chunk.model_version.clone().unwrap_or_default(),
            });
        }

        if let Some(usage) = &chunk.usage_metadata {
            self.usage = usage.into();
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return out;
        };

        for part in candidate.content.parts {
            self.part(part, &mut out);
        }

        if let Some(reason) = candidate.finish_reason {
            self.cursor.close(&mut out);
            out.push(StreamEvent::MessageStop {
                stop_reason: Some(parse_finish_reason(&reason, self.saw_tool_call)),
                usage: self.usage,
            });
        }

        out
    }

    fn part(&mut self, part: GooglePart, out: &mut Vec<StreamEvent>) {
        if part.thought == Some(true) {
            let index = self.cursor.ensure(&BlockKind::Thinking, out);
            if let Some(text) = part.text.filter(|text| !text.is_empty()) {
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::Thinking(text),
                });
            }
            if let Some(signature) = part.thought_signature {
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::Signature(signature),
                });
            }
            return;
        }

        if let Some(signature) = part.thought_signature {
            let index = self.cursor.start(BlockKind::Thinking, out);
            out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::Signature(signature),
            });
        }

        if let Some(text) = part.text {
            let index = self.cursor.ensure(&BlockKind::Text, out);
            if !text.is_empty() {
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::Text(text),
                });
            }
        } else if let Some(call) = part.function_call {
            self.saw_tool_call = true;
            let id = call.id.filter(|id| !id.is_empty()).unwrap_or_else(call_id);
            let index = self.cursor.start(BlockKind::ToolUse { id, name: call.name }, out);
            out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::ToolArgs(super::arguments_string(&call.args)),
            });
            self.cursor.close(out);
        } else {
            tracing::warn!(provider = %self.provider, "dropping stream part without text or function call");
        }
    }
}

impl StreamDecoder for GoogleStreamDecoder {
    type Chunk = Event;

    fn decode(&mut self, event: Event) -> Result<Vec<StreamEvent>, LlmError> {
        if let Ok(error) = serde_json::from_str::<GoogleErrorResponse>(&event.data) {
            return Err(LlmError::upstream(
                &self.provider,
                Some(error.error.code),
                error.error.message,
            ));
        }

        match serde_json::from_str::<GoogleResponse>(&event.data) {
            Ok(chunk) => Ok(self.chunk(chunk)),
            Err(e) => {
                tracing::warn!(provider = %self.provider, error = %e, "dropping unparsable stream chunk");
                Ok(Vec::new())
            }
        }
    }
}

/// Encodes canonical events as partial `GenerateContentResponse` chunks
///
/// Tool arguments are buffered until their block closes since Google sends
/// function calls whole.
pub struct GoogleStreamEncoder {
    model: String,
    id: Option<String>,
    tools: HashMap<u32, (String, String, String)>,
}

impl GoogleStreamEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: None,
            tools: HashMap::new(),
        }
    }

    fn chunk(&self, parts: Vec<GooglePart>, finish_reason: Option<String>, usage: Option<Usage>) -> GoogleResponse {
        GoogleResponse {
            candidates: vec![GoogleCandidate {
                content: GoogleContent {
                    role: Some("model".to_owned()),
                    parts,
                },
                finish_reason,
                index: Some(0),
            }],
            usage_metadata: usage.map(Into::into),
            model_version: Some(self.model.clone()),
            response_id: self.id.clone(),
        }
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Option<GoogleResponse> {
        let part = match event {
            StreamEvent::MessageStart { id, .. } => {
                self.id = Some(id.clone());
                return None;
            }
            StreamEvent::ContentBlockStart { index, kind } => {
                if let BlockKind::ToolUse { id, name } = kind {
                    self.tools.insert(*index, (id.clone(), name.clone(), String::new()));
                }
                return None;
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::Text(text) => GooglePart::text(text.clone()),
                BlockDelta::Thinking(text) => GooglePart {
                    text: Some(text.clone()),
                    thought: Some(true),
                    ..GooglePart::default()
                },
                BlockDelta::Signature(signature) => GooglePart {
                    thought: Some(true),
                    thought_signature: Some(signature.clone()),
                    ..GooglePart::default()
                },
                BlockDelta::ToolArgs(fragment) => {
                    if let Some((_, _, args)) = self.tools.get_mut(index) {
                        args.push_str(fragment);
                    }
                    return None;
                }
            },
            StreamEvent::ContentBlockStop { index } => {
                let (id, name, args) = self.tools.remove(index)?;
                GooglePart {
                    function_call: Some(GoogleFunctionCall {
                        id: Some(id),
                        name,
                        args: crate::reconcile::parse_tool_arguments(&args),
                    }),
                    ..GooglePart::default()
                }
            }
            StreamEvent::MessageStop { stop_reason, usage } => {
                return Some(self.chunk(
                    Vec::new(),
                    Some(finish_reason_str(stop_reason.unwrap_or(StopReason::EndTurn)).to_owned()),
                    Some(*usage),
                ));
            }
        };

        Some(self.chunk(vec![part], None, None))
    }
}

// -- Embeddings --

fn embed_text(content: GoogleContent) -> String {
    content
        .parts
        .into_iter()
        .filter_map(|part| part.text)
        .collect::<Vec<_>>()
        .join("\n")
}

impl From<GoogleEmbedRequest> for EmbeddingRequest {
    fn from(req: GoogleEmbedRequest) -> Self {
        Self {
            model: req.model.map(|m| m.trim_start_matches("models/").to_owned()).unwrap_or_default(),
            input: vec![embed_text(req.content)],
            dimensions: req.output_dimensionality,
        }
    }
}

impl From<GoogleBatchEmbedRequest> for EmbeddingRequest {
    fn from(req: GoogleBatchEmbedRequest) -> Self {
        let mut model = String::new();
        let mut dimensions = None;
        let mut input = Vec::with_capacity(req.requests.len());

        for request in req.requests {
            if model.is_empty()
                && let Some(m) = &request.model
            {
                m.trim_start_matches("models/").clone_into(&mut model);
            }
            dimensions = dimensions.or(request.output_dimensionality);
            input.push(embed_text(request.content));
        }

        Self {
            model,
            input,
            dimensions,
        }
    }
}

impl From<&EmbeddingRequest> for GoogleBatchEmbedRequest {
    fn from(req: &EmbeddingRequest) -> Self {
        let model = model_resource(&req.model);

        Self {
            requests: req
                .input
                .iter()
                .map(|text| GoogleEmbedRequest {
                    model: Some(model.clone()),
                    content: GoogleContent {
                        role: None,
                        parts: vec![GooglePart::text(text.clone())],
                    },
                    output_dimensionality: req.dimensions,
                })
                .collect(),
        }
    }
}

/// Canonical embeddings from a batch response; Google reports no usage
pub fn embedding_response(model: &str, resp: GoogleBatchEmbedResponse) -> EmbeddingResponse {
    EmbeddingResponse {
        model: model.to_owned(),
        embeddings: resp.embeddings.into_iter().map(|e| e.values).collect(),
        usage: Usage::default(),
    }
}

impl From<&EmbeddingResponse> for GoogleBatchEmbedResponse {
    fn from(resp: &EmbeddingResponse) -> Self {
        Self {
            embeddings: resp
                .embeddings
                .iter()
                .map(|values| GoogleEmbedding { values: values.clone() })
                .collect(),
        }
    }
}

/// Single `embedContent` response; `None` when nothing was embedded
pub fn single_embedding(resp: &EmbeddingResponse) -> Option<GoogleEmbedResponse> {
    resp.embeddings.first().map(|values| GoogleEmbedResponse {
        embedding: GoogleEmbedding { values: values.clone() },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: Value) -> CompletionRequest {
        let wire: GoogleRequest = serde_json::from_value(body).unwrap();
        CompletionRequest::try_from(wire).unwrap()
    }

    #[test]
    fn function_responses_pair_with_calls_by_name() {
        let req = request(json!({
            "systemInstruction": {"parts": [{"text": "Be helpful."}]},
            "contents": [
                {"role": "user", "parts": [{"text": "Weather in Paris?"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "get_weather", "response": {"result": "sunny"}}}]}
            ]
        }));

        assert_eq!(req.messages[0].role, Role::System);
        let ContentPart::ToolUse { id: call_id, .. } = &req.messages[2].content[0] else {
            panic!("expected tool use");
        };
        let ContentPart::ToolResult {
            tool_use_id, content, ..
        } = &req.messages[3].content[0]
        else {
            panic!("expected tool result");
        };
        assert_eq!(call_id, tool_use_id);
        assert_eq!(content, &vec![ContentPart::text("sunny")]);
    }

    #[test]
    fn tool_results_recover_function_names() {
        let req = CompletionRequest::new(
            "gemini-2.5-pro",
            vec![
                Message {
                    role: Role::Assistant,
                    content: vec![ContentPart::ToolUse {
                        id: "toolu_1".to_owned(),
                        name: "lookup".to_owned(),
                        input: json!({"q": "rust"}),
                    }],
                },
                Message {
                    role: Role::Tool,
                    content: vec![ContentPart::ToolResult {
                        tool_use_id: "toolu_1".to_owned(),
                        content: vec![ContentPart::text("not found")],
                        status: ToolResultStatus::Error,
                        cache_control: None,
                    }],
                },
            ],
        );

        let wire = GoogleRequest::from(&req);
        let response = wire.contents[1].parts[0].function_response.as_ref().unwrap();
        assert_eq!(wire.contents[1].role.as_deref(), Some("user"));
        assert_eq!(response.name, "lookup");
        assert_eq!(response.response, json!({"error": "not found"}));
    }

    #[test]
    fn schemas_are_rewritten_for_function_declarations() {
        let tool = ToolSpec {
            name: "f".to_owned(),
            description: None,
            parameters: json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "when": {"type": ["string", "null"]},
                    "tags": {"type": "array", "items": {"type": "STRING"}}
                }
            }),
            cache_control: None,
        };

        let declaration = GoogleFunctionDeclaration::from(&tool);
        assert_eq!(
            declaration.parameters.unwrap(),
            json!({
                "type": "object",
                "properties": {
                    "when": {"type": "string", "nullable": true},
                    "tags": {"type": "array", "items": {"type": "string"}}
                }
            })
        );
    }

    #[test]
    fn thought_signatures_survive_round_trip() {
        let wire: GoogleResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "Planning", "thought": true},
                    {"functionCall": {"name": "search", "args": {}}, "thoughtSignature": "c2ln"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 4, "thoughtsTokenCount": 6, "totalTokenCount": 18}
        }))
        .unwrap();

        let resp = CompletionResponse::from(wire);
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(resp.usage.output_tokens, 10);
        assert!(matches!(&resp.content[1], ContentPart::Thinking { text, signature: Some(s) } if text.is_empty() && s == "c2ln"));

        let back = GoogleResponse::from(&resp);
        let parts = &back.candidates[0].content.parts;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].thought_signature.as_deref(), Some("c2ln"));
        assert!(parts[1].function_call.is_some());
    }

    #[test]
    fn thinking_budget_maps_both_ways() {
        let req = request(json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 0}}
        }));
        assert!(!req.wants_thinking());

        let mut req = CompletionRequest::new("gemini", vec![Message::text(Role::User, "hi")]);
        req.thinking = Some(ThinkingConfig {
            enabled: true,
            budget_tokens: None,
        });
        let thinking = GoogleRequest::from(&req).generation_config.unwrap().thinking_config.unwrap();
        assert_eq!(thinking.thinking_budget, Some(4_096));
        assert_eq!(thinking.include_thoughts, Some(true));
    }

    #[test]
    fn decoder_closes_blocks_and_stops_on_finish_reason() {
        let mut decoder = GoogleStreamDecoder::new("gemini");
        let chunk = |body: Value| Event {
            data: body.to_string(),
            ..Event::default()
        };

        let mut events = decoder
            .decode(chunk(json!({"candidates": [{"content": {"parts": [{"text": "Hel"}]}}]})))
            .unwrap();
        events.extend(
            decoder
                .decode(chunk(json!({"candidates": [{"content": {"parts": [{"text": "lo"}]}}]})))
                .unwrap(),
        );
        events.extend(
            decoder
                .decode(chunk(json!({
                    "candidates": [{"content": {"parts": [{"functionCall": {"name": "f", "args": {"a": 1}}}]}, "finishReason": "STOP"}],
                    "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}
                })))
                .unwrap(),
        );

        let kinds: Vec<_> = events
            .iter()
            .map(|event| match event {
                StreamEvent::MessageStart { .. } => "start",
                StreamEvent::ContentBlockStart { .. } => "block",
                StreamEvent::ContentBlockDelta { .. } => "delta",
                StreamEvent::ContentBlockStop { .. } => "stop",
                StreamEvent::MessageStop { .. } => "end",
            })
            .collect();
        assert_eq!(
            kinds,
            ["start", "block", "delta", "delta", "stop", "block", "delta", "stop", "end"]
        );
        assert!(matches!(
            events.last(),
            Some(StreamEvent::MessageStop { stop_reason: Some(StopReason::ToolUse), usage }) if usage.input_tokens == 3
        ));
    }

    #[test]
    fn decoder_surfaces_error_payloads() {
        let mut decoder = GoogleStreamDecoder::new("gemini");
        let err = decoder
            .decode(Event {
                data: json!({"error": {"code": 429, "message": "quota", "status": "RESOURCE_EXHAUSTED"}}).to_string(),
                ..Event::default()
            })
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn batch_embedding_request_qualifies_model() {
        let req = EmbeddingRequest {
            model: "text-embedding-004".to_owned(),
            input: vec!["a".to_owned(), "b".to_owned()],
            dimensions: Some(256),
        };

        let wire = GoogleBatchEmbedRequest::from(&req);
        assert_eq!(wire.requests.len(), 2);
        assert_eq!(wire.requests[0].model.as_deref(), Some("models/text-embedding-004"));
        assert_eq!(wire.requests[1].output_dimensionality, Some(256));
    }
}
