//! Conversion between canonical types and the `OpenAI` wire format
//!
//! Covers chat completions in every direction, legacy text completions,
//! embeddings, and audio. `OpenAI`-compatible upstreams are spoken to with
//! the same types callers send.

use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use eventsource_stream::Event;
use serde_json::{Value, json};

use super::{BlockCursor, arguments_string, effort_for_budget, thinking_from_effort, unix_now};
use crate::error::LlmError;
use crate::protocol::openai::{
    OpenAiChoice, OpenAiChoiceMessage, OpenAiContent, OpenAiContentPart, OpenAiEmbedding, OpenAiEmbeddingInput,
    OpenAiEmbeddingRequest, OpenAiEmbeddingResponse, OpenAiEmbeddingVector, OpenAiErrorResponse, OpenAiFunction,
    OpenAiFunctionCall, OpenAiImageUrl, OpenAiMessage, OpenAiPrompt, OpenAiPromptTokensDetails, OpenAiRequest,
    OpenAiResponse, OpenAiSpeechRequest, OpenAiStop, OpenAiStreamChoice, OpenAiStreamChunk, OpenAiStreamDelta,
    OpenAiStreamFunctionCall, OpenAiStreamOptions, OpenAiStreamToolCall, OpenAiTextChoice, OpenAiTextRequest,
    OpenAiTextResponse, OpenAiTool, OpenAiToolCall, OpenAiTranscription, OpenAiUsage,
};
use crate::reconcile::{parse_tool_arguments, reconcile};
use crate::stream::StreamDecoder;
use crate::types::{
    BlockDelta, BlockKind, CompletionParams, CompletionRequest, CompletionResponse, ContentPart, EmbeddingRequest,
    EmbeddingResponse, ImageSource, Message, Role, SpeechRequest, StopReason, StreamEvent, ToolChoice,
    ToolResultStatus, ToolSpec, Transcription, Usage,
};

pub(crate) const fn finish_reason(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
        StopReason::ContentFilter => "content_filter",
    }
}

fn parse_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

// -- Inbound: OpenAI wire format -> canonical --

impl TryFrom<OpenAiRequest> for CompletionRequest {
    type Error = LlmError;

    fn try_from(req: OpenAiRequest) -> Result<Self, Self::Error> {
        let messages = req
            .messages
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let tools = req
            .tools
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tool| {
                if tool.tool_type != "function" {
                    tracing::warn!(tool_type = %tool.tool_type, "dropping non-function tool");
                    return None;
                }
                Some(ToolSpec::from(tool.function))
            })
            .collect();

        Ok(Self {
            model: req.model,
            messages,
            params: CompletionParams {
                temperature: req.temperature,
                top_p: req.top_p,
                top_k: None,
                max_tokens: req.max_completion_tokens.or(req.max_tokens),
                stop: req.stop.map(OpenAiStop::into_vec),
                seed: req.seed,
            },
            tools,
            tool_choice: req.tool_choice.as_ref().map(parse_tool_choice).transpose()?,
            parallel_tool_calls: req.parallel_tool_calls,
            thinking: req.reasoning_effort.as_deref().and_then(thinking_from_effort),
            stream: req.stream.unwrap_or(false),
        })
    }
}

impl TryFrom<OpenAiMessage> for Message {
    type Error = LlmError;

    fn try_from(msg: OpenAiMessage) -> Result<Self, Self::Error> {
        let role = match msg.role.as_str() {
            "system" | "developer" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => return Err(LlmError::InvalidRequest(format!("unsupported message role '{other}'"))),
        };

        if role == Role::Tool {
            let Some(tool_use_id) = msg.tool_call_id else {
                return Err(LlmError::InvalidRequest(
                    "message with role 'tool' must carry tool_call_id".to_owned(),
                ));
            };

            let content = content_parts(msg.content)
                .into_iter()
                .filter(|part| matches!(part, ContentPart::Text { .. }))
                .collect();

            return Ok(Self {
                role,
                content: vec![ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    status: ToolResultStatus::Success,
                    cache_control: None,
                }],
            });
        }

        let mut content = Vec::new();

        if let Some(reasoning) = msg.reasoning_content.filter(|r| !r.is_empty()) {
            content.push(ContentPart::Thinking {
                text: reasoning,
                signature: None,
            });
        }

        content.extend(content_parts(msg.content));

        for call in msg.tool_calls.unwrap_or_default() {
            content.push(ContentPart::ToolUse {
                id: call.id,
                name: call.function.name,
                input: parse_tool_arguments(&call.function.arguments),
            });
        }

        Ok(Self { role, content })
    }
}

fn content_parts(content: Option<OpenAiContent>) -> Vec<ContentPart> {
    match content {
        None => Vec::new(),
        Some(OpenAiContent::Text(text)) if text.is_empty() => Vec::new(),
        Some(OpenAiContent::Text(text)) => vec![ContentPart::text(text)],
        Some(OpenAiContent::Parts(parts)) => parts
            .into_iter()
            .filter_map(|part| match part {
                OpenAiContentPart::Text { text } => Some(ContentPart::text(text)),
                OpenAiContentPart::ImageUrl { image_url } => Some(ContentPart::Image {
                    source: ImageSource::parse(&image_url.url),
                    cache_control: None,
                }),
                OpenAiContentPart::Unsupported => {
                    tracing::warn!("dropping unsupported content part");
                    None
                }
            })
            .collect(),
    }
}

impl From<OpenAiFunction> for ToolSpec {
    fn from(function: OpenAiFunction) -> Self {
        Self {
            name: function.name,
            description: function.description,
            parameters: function
                .parameters
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            cache_control: None,
        }
    }
}

/// Parse `OpenAI`'s flexible `tool_choice` field
fn parse_tool_choice(value: &Value) -> Result<ToolChoice, LlmError> {
    match value {
        Value::String(mode) => match mode.as_str() {
            "none" => Ok(ToolChoice::None),
            "auto" => Ok(ToolChoice::Auto),
            "required" => Ok(ToolChoice::Any),
            other => Err(LlmError::InvalidRequest(format!("unsupported tool_choice '{other}'"))),
        },
        Value::Object(object) => object
            .get("function")
            .and_then(|function| function.get("name"))
            .and_then(Value::as_str)
            .map(|name| ToolChoice::Tool { name: name.to_owned() })
            .ok_or_else(|| LlmError::InvalidRequest("tool_choice object must name a function".to_owned())),
        _ => Err(LlmError::InvalidRequest("tool_choice must be a string or object".to_owned())),
    }
}

fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Any => json!("required"),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    }
}

// -- Outbound: canonical -> OpenAI wire request --

impl From<&CompletionRequest> for OpenAiRequest {
    fn from(req: &CompletionRequest) -> Self {
        let reasoning_effort = req
            .thinking
            .filter(|t| t.enabled)
            .map(|t| effort_for_budget(t.budget_tokens).to_owned());

        // Reasoning models reject the legacy field
        let (max_tokens, max_completion_tokens) = if reasoning_effort.is_some() {
            (None, req.params.max_tokens)
        } else {
            (req.params.max_tokens, None)
        };

        Self {
            model: req.model.clone(),
            messages: outbound_messages(&req.messages),
            temperature: req.params.temperature,
            top_p: req.params.top_p,
            max_tokens,
            max_completion_tokens,
            stop: req.params.stop.clone().map(OpenAiStop::Many),
            seed: req.params.seed,
            stream: req.stream.then_some(true),
            tools: (!req.tools.is_empty()).then(|| req.tools.iter().map(Into::into).collect()),
            tool_choice: req.tool_choice.as_ref().map(tool_choice_value),
            parallel_tool_calls: if req.tools.is_empty() { None } else { req.parallel_tool_calls },
            reasoning_effort,
            stream_options: req.stream.then_some(OpenAiStreamOptions { include_usage: true }),
        }
    }
}

impl From<&ToolSpec> for OpenAiTool {
    fn from(tool: &ToolSpec) -> Self {
        Self {
            tool_type: "function".to_owned(),
            function: OpenAiFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: Some(tool.parameters.clone()),
            },
        }
    }
}

/// Tool messages carry text only
fn tool_result_text(tool_use_id: &str, content: &[ContentPart]) -> String {
    if content.iter().any(|part| matches!(part, ContentPart::Image { .. })) {
        tracing::warn!(tool_use_id, "dropping images inside tool result");
    }
    ContentPart::text_of(content)
}

/// Flatten canonical messages into `OpenAI` messages
///
/// Tool results become one `tool` message each, placed before any other
/// content of the same canonical message.
fn outbound_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();

        for part in &message.content {
            match part {
                ContentPart::ToolResult {
                    tool_use_id, content, ..
                } => out.push(OpenAiMessage {
                    role: "tool".to_owned(),
                    content: Some(OpenAiContent::Text(tool_result_text(tool_use_id, content))),
                    reasoning_content: None,
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                }),
                ContentPart::ToolUse { id, name, input } => tool_calls.push(OpenAiToolCall {
                    id: id.clone(),
                    tool_type: "function".to_owned(),
                    function: OpenAiFunctionCall {
                        name: name.clone(),
                        arguments: arguments_string(input),
                    },
                }),
                ContentPart::Text { text, .. } => parts.push(OpenAiContentPart::Text { text: text.clone() }),
                ContentPart::Image { source, .. } => parts.push(OpenAiContentPart::ImageUrl {
                    image_url: OpenAiImageUrl {
                        url: source.to_reference(),
                        detail: None,
                    },
                }),
                ContentPart::Thinking { .. } => {}
            }
        }

        if parts.is_empty() && tool_calls.is_empty() {
            continue;
        }

        let role = match message.role {
            Role::System => "system",
            Role::Assistant => "assistant",
            Role::User | Role::Tool => "user",
        };

        let content = match parts.as_slice() {
            [] => None,
            [OpenAiContentPart::Text { text }] => Some(OpenAiContent::Text(text.clone())),
            _ if message.role != Role::User => Some(OpenAiContent::Text(
                parts
                    .iter()
                    .filter_map(|part| match part {
                        OpenAiContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect(),
            )),
            _ => Some(OpenAiContent::Parts(parts)),
        };

        out.push(OpenAiMessage {
            role: role.to_owned(),
            content,
            reasoning_content: None,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }

    out
}

// -- Responses in both directions --

impl From<OpenAiResponse> for CompletionResponse {
    fn from(resp: OpenAiResponse) -> Self {
        let mut content = Vec::new();
        let mut stop_reason = None;

        if let Some(choice) = resp.choices.into_iter().next() {
            let message = choice.message;

            if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
                content.push(ContentPart::Thinking {
                    text: reasoning,
                    signature: None,
                });
            }

            if let Some(text) = message.content.filter(|t| !t.is_empty()) {
                content.push(ContentPart::text(text));
            }

            for call in message.tool_calls.unwrap_or_default() {
                content.push(ContentPart::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input: Value::String(call.function.arguments),
                });
            }

            stop_reason = choice.finish_reason.as_deref().map(parse_finish_reason);
        }

        Self {
            id: resp.id,
            model: resp.model,
            content: reconcile(content),
            stop_reason,
            usage: resp.usage.as_ref().map(Usage::from).unwrap_or_default(),
        }
    }
}

impl From<&CompletionResponse> for OpenAiResponse {
    fn from(resp: &CompletionResponse) -> Self {
        let text = resp.text();
        let reasoning: String = resp
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Thinking { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        let tool_calls: Vec<_> = resp
            .tool_uses()
            .map(|(id, name, input)| OpenAiToolCall {
                id: id.to_owned(),
                tool_type: "function".to_owned(),
                function: OpenAiFunctionCall {
                    name: name.to_owned(),
                    arguments: arguments_string(input),
                },
            })
            .collect();

        let has_tool_calls = !tool_calls.is_empty();

        Self {
            id: resp.id.clone(),
            object: "chat.completion".to_owned(),
            created: unix_now(),
            model: resp.model.clone(),
            choices: vec![OpenAiChoice {
                index: 0,
                message: OpenAiChoiceMessage {
                    role: "assistant".to_owned(),
                    content: (!text.is_empty() || !has_tool_calls).then_some(text),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls: has_tool_calls.then_some(tool_calls),
                },
                finish_reason: resp.stop_reason.map(|reason| finish_reason(reason).to_owned()),
            }],
            usage: Some(OpenAiUsage::from(resp.usage)),
        }
    }
}

impl From<&OpenAiUsage> for Usage {
    fn from(usage: &OpenAiUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_tokens: usage
                .prompt_tokens_details
                .as_ref()
                .map_or(0, |details| details.cached_tokens),
            cache_write_tokens: 0,
        }
    }
}

impl From<Usage> for OpenAiUsage {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.total(),
            prompt_tokens_details: (usage.cache_read_tokens > 0).then_some(OpenAiPromptTokensDetails {
                cached_tokens: usage.cache_read_tokens,
            }),
        }
    }
}

// -- Streaming --

/// Decodes `OpenAI` chat completion chunks
///
/// `OpenAI` streams flat deltas without block boundaries, so boundaries are
/// synthesized whenever the delta kind changes. Each tool call gets one
/// block that stays open until the finish reason, since parallel calls may
/// interleave their argument deltas.
pub struct OpenAiStreamDecoder {
    provider: String,
    started: bool,
    cursor: BlockCursor,
    /// Tool call index in the chunk -> open block index
    tools: BTreeMap<u32, u32>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    done: bool,
}

impl OpenAiStreamDecoder {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            started: false,
            cursor: BlockCursor::default(),
            tools: BTreeMap::new(),
            stop_reason: None,
            usage: Usage::default(),
            done: false,
        }
    }

    fn chunk(&mut self, chunk: OpenAiStreamChunk) -> Vec<StreamEvent> {
        let mut out = Vec::new();

        if !self.started {
            self.started = true;
            out.push(StreamEvent::MessageStart {
                id: chunk.id.clone(),
                model: chunk.model.clone(),
            });
        }

        if let Some(usage) = &chunk.usage {
            self.usage = Usage::from(usage);
        }

        for choice in chunk.choices.into_iter().filter(|choice| choice.index == 0) {
            let delta = choice.delta;

            if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                let index = self.cursor.ensure(&BlockKind::Thinking, &mut out);
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::Thinking(reasoning),
                });
            }

            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                let index = self.cursor.ensure(&BlockKind::Text, &mut out);
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::Text(text),
                });
            }

            for call in delta.tool_calls.unwrap_or_default() {
                self.tool_call(call, &mut out);
            }

            if let Some(reason) = choice.finish_reason {
                self.stop_reason = Some(parse_finish_reason(&reason));
                self.close_blocks(&mut out);
            }
        }

        out
    }

    fn tool_call(&mut self, call: OpenAiStreamToolCall, out: &mut Vec<StreamEvent>) {
        let function = call.function.unwrap_or(OpenAiStreamFunctionCall {
            name: None,
            arguments: None,
        });

        if let Some(id) = call.id.filter(|id| !id.is_empty())
            && !self.tools.contains_key(&call.index)
        {
            let kind = BlockKind::ToolUse {
                id,
                name: function.name.clone().unwrap_or_default(),
            };
            let index = self.cursor.start_detached(kind, out);
            self.tools.insert(call.index, index);
        }

        let Some(arguments) = function.arguments.filter(|a| !a.is_empty()) else {
            return;
        };

        match self.tools.get(&call.index) {
            Some(&index) => out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::ToolArgs(arguments),
            }),
            None => {
                tracing::warn!(provider = %self.provider, tool_index = call.index, "dropping arguments for unannounced tool call");
            }
        }
    }

    fn close_blocks(&mut self, out: &mut Vec<StreamEvent>) {
        self.cursor.close(out);

        let mut open: Vec<u32> = std::mem::take(&mut self.tools).into_values().collect();
        open.sort_unstable();
        out.extend(open.into_iter().map(|index| StreamEvent::ContentBlockStop { index }));
    }

    fn stop(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut out = Vec::new();
        self.close_blocks(&mut out);
        out.push(StreamEvent::MessageStop {
            stop_reason: self.stop_reason,
            usage: self.usage,
        });
        out
    }
}

impl StreamDecoder for OpenAiStreamDecoder {
    type Chunk = Event;

    fn decode(&mut self, event: Event) -> Result<Vec<StreamEvent>, LlmError> {
        let data = event.data.trim();

        if data == "[DONE]" {
            return Ok(self.stop());
        }

        match serde_json::from_str::<OpenAiStreamChunk>(data) {
            Ok(chunk) => Ok(self.chunk(chunk)),
            Err(e) => {
                if let Ok(error) = serde_json::from_str::<OpenAiErrorResponse>(data) {
                    return Err(LlmError::upstream(&self.provider, None, error.error.message));
                }

                tracing::warn!(provider = %self.provider, error = %e, "dropping unrecognized stream chunk");
                Ok(Vec::new())
            }
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        // Some compatible servers end after the finish chunk without `[DONE]`
        if self.stop_reason.is_some() { self.stop() } else { Vec::new() }
    }
}

/// Encodes canonical events as `OpenAI` chat completion chunks
pub struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: u64,
    include_usage: bool,
    /// Block index -> position in the `tool_calls` array
    tool_calls: HashMap<u32, u32>,
}

impl OpenAiStreamEncoder {
    pub fn new(model: impl Into<String>, include_usage: bool) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: unix_now(),
            include_usage,
            tool_calls: HashMap::new(),
        }
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Vec<OpenAiStreamChunk> {
        match event {
            StreamEvent::MessageStart { id, .. } => {
                if !id.is_empty() {
                    self.id.clone_from(id);
                }
                vec![self.chunk(
                    OpenAiStreamDelta {
                        role: Some("assistant".to_owned()),
                        content: Some(String::new()),
                        ..OpenAiStreamDelta::default()
                    },
                    None,
                )]
            }
            StreamEvent::ContentBlockStart {
                index,
                kind: BlockKind::ToolUse { id, name },
            } => {
                let position = u32::try_from(self.tool_calls.len()).unwrap_or(u32::MAX);
                self.tool_calls.insert(*index, position);
                vec![self.chunk(
                    OpenAiStreamDelta {
                        tool_calls: Some(vec![OpenAiStreamToolCall {
                            index: position,
                            id: Some(id.clone()),
                            tool_type: Some("function".to_owned()),
                            function: Some(OpenAiStreamFunctionCall {
                                name: Some(name.clone()),
                                arguments: Some(String::new()),
                            }),
                        }]),
                        ..OpenAiStreamDelta::default()
                    },
                    None,
                )]
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let delta = match delta {
                    BlockDelta::Text(text) => OpenAiStreamDelta {
                        content: Some(text.clone()),
                        ..OpenAiStreamDelta::default()
                    },
                    BlockDelta::Thinking(text) => OpenAiStreamDelta {
                        reasoning_content: Some(text.clone()),
                        ..OpenAiStreamDelta::default()
                    },
                    BlockDelta::ToolArgs(arguments) => {
                        let Some(&position) = self.tool_calls.get(index) else {
                            return Vec::new();
                        };
                        OpenAiStreamDelta {
                            tool_calls: Some(vec![OpenAiStreamToolCall {
                                index: position,
                                id: None,
                                tool_type: None,
                                function: Some(OpenAiStreamFunctionCall {
                                    name: None,
                                    arguments: Some(arguments.clone()),
                                }),
                            }]),
                            ..OpenAiStreamDelta::default()
                        }
                    }
                    BlockDelta::Signature(_) => return Vec::new(),
                };
                vec![self.chunk(delta, None)]
            }
            StreamEvent::ContentBlockStart { .. } | StreamEvent::ContentBlockStop { .. } => Vec::new(),
            StreamEvent::MessageStop { stop_reason, usage } => {
                let reason = finish_reason(stop_reason.unwrap_or(StopReason::EndTurn));
                let mut chunks = vec![self.chunk(OpenAiStreamDelta::default(), Some(reason))];

                if self.include_usage {
                    let mut tail = self.chunk(OpenAiStreamDelta::default(), None);
                    tail.choices.clear();
                    tail.usage = Some(OpenAiUsage::from(*usage));
                    chunks.push(tail);
                }

                chunks
            }
        }
    }

    fn chunk(&self, delta: OpenAiStreamDelta, finish_reason: Option<&str>) -> OpenAiStreamChunk {
        OpenAiStreamChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_owned(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![OpenAiStreamChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_owned),
            }],
            usage: None,
        }
    }
}

// -- Legacy text completions --

impl From<OpenAiTextRequest> for CompletionRequest {
    fn from(req: OpenAiTextRequest) -> Self {
        let prompt = match req.prompt {
            OpenAiPrompt::One(prompt) => prompt,
            OpenAiPrompt::Many(prompts) => prompts.join("\n"),
        };

        let mut request = Self::new(req.model, vec![Message::text(Role::User, prompt)]);
        request.params = CompletionParams {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: None,
            max_tokens: req.max_tokens,
            stop: req.stop.map(OpenAiStop::into_vec),
            seed: req.seed,
        };
        request.stream = req.stream.unwrap_or(false);
        request
    }
}

/// Render a completion as a legacy `text_completion` object
pub fn text_completion(resp: &CompletionResponse) -> OpenAiTextResponse {
    OpenAiTextResponse {
        id: format!("cmpl-{}", resp.id),
        object: "text_completion",
        created: unix_now(),
        model: resp.model.clone(),
        choices: vec![OpenAiTextChoice {
            text: resp.text(),
            index: 0,
            logprobs: None,
            finish_reason: resp.stop_reason.map(|reason| finish_reason(reason).to_owned()),
        }],
        usage: Some(OpenAiUsage::from(resp.usage)),
    }
}

/// Encodes canonical events as legacy `text_completion` chunks
pub struct TextCompletionEncoder {
    id: String,
    model: String,
    created: u64,
}

impl TextCompletionEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("cmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: unix_now(),
        }
    }

    pub fn encode(&self, event: &StreamEvent) -> Option<OpenAiTextResponse> {
        let (text, finish, usage) = match event {
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::Text(text),
                ..
            } => (text.clone(), None, None),
            StreamEvent::MessageStop { stop_reason, usage } => (
                String::new(),
                Some(finish_reason(stop_reason.unwrap_or(StopReason::EndTurn)).to_owned()),
                Some(OpenAiUsage::from(*usage)),
            ),
            _ => return None,
        };

        Some(OpenAiTextResponse {
            id: self.id.clone(),
            object: "text_completion",
            created: self.created,
            model: self.model.clone(),
            choices: vec![OpenAiTextChoice {
                text,
                index: 0,
                logprobs: None,
                finish_reason: finish,
            }],
            usage,
        })
    }
}

// -- Embeddings --

impl From<OpenAiEmbeddingRequest> for EmbeddingRequest {
    fn from(req: OpenAiEmbeddingRequest) -> Self {
        let input = match req.input {
            OpenAiEmbeddingInput::One(text) => vec![text],
            OpenAiEmbeddingInput::Many(texts) => texts,
        };

        Self {
            model: req.model,
            input,
            dimensions: req.dimensions,
        }
    }
}

impl From<&EmbeddingRequest> for OpenAiEmbeddingRequest {
    fn from(req: &EmbeddingRequest) -> Self {
        Self {
            model: req.model.clone(),
            input: OpenAiEmbeddingInput::Many(req.input.clone()),
            dimensions: req.dimensions,
            encoding_format: Some("float".to_owned()),
        }
    }
}

impl TryFrom<OpenAiEmbeddingResponse> for EmbeddingResponse {
    type Error = LlmError;

    fn try_from(resp: OpenAiEmbeddingResponse) -> Result<Self, Self::Error> {
        let mut data = resp.data;
        data.sort_by_key(|embedding| embedding.index);

        let embeddings = data
            .into_iter()
            .map(|embedding| match embedding.embedding {
                OpenAiEmbeddingVector::Float(values) => Ok(values),
                OpenAiEmbeddingVector::Base64(encoded) => decode_embedding(&encoded),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            model: resp.model,
            embeddings,
            usage: Usage::from(&resp.usage),
        })
    }
}

/// Render embeddings, optionally as base64 little-endian `f32` bytes
pub fn embedding_response(resp: &EmbeddingResponse, base64: bool) -> OpenAiEmbeddingResponse {
    let data = resp
        .embeddings
        .iter()
        .enumerate()
        .map(|(index, values)| OpenAiEmbedding {
            object: "embedding".to_owned(),
            index: u32::try_from(index).unwrap_or(u32::MAX),
            embedding: if base64 {
                OpenAiEmbeddingVector::Base64(encode_embedding(values))
            } else {
                OpenAiEmbeddingVector::Float(values.clone())
            },
        })
        .collect();

    OpenAiEmbeddingResponse {
        object: "list".to_owned(),
        data,
        model: resp.model.clone(),
        usage: OpenAiUsage::from(resp.usage),
    }
}

fn encode_embedding(values: &[f32]) -> String {
    let bytes: Vec<u8> = values.iter().flat_map(|value| value.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_embedding(encoded: &str) -> Result<Vec<f32>, LlmError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| LlmError::Internal(anyhow::anyhow!("invalid base64 embedding: {e}")))?;

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

// -- Audio --

impl From<OpenAiSpeechRequest> for SpeechRequest {
    fn from(req: OpenAiSpeechRequest) -> Self {
        Self {
            model: req.model,
            input: req.input,
            voice: req.voice,
            response_format: req.response_format,
            speed: req.speed,
        }
    }
}

impl From<&SpeechRequest> for OpenAiSpeechRequest {
    fn from(req: &SpeechRequest) -> Self {
        Self {
            model: req.model.clone(),
            input: req.input.clone(),
            voice: req.voice.clone(),
            response_format: req.response_format.clone(),
            speed: req.speed,
        }
    }
}

impl From<OpenAiTranscription> for Transcription {
    fn from(resp: OpenAiTranscription) -> Self {
        Self {
            text: resp.text,
            language: resp.language,
            duration: resp.duration,
        }
    }
}

impl From<&Transcription> for OpenAiTranscription {
    fn from(resp: &Transcription) -> Self {
        Self {
            text: resp.text.clone(),
            language: resp.language.clone(),
            duration: resp.duration,
        }
    }
}
