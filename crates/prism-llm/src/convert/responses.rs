//! Conversion between canonical types and the `OpenAI` Responses API
//!
//! Inbound only: callers may speak the Responses shape, upstreams are
//! always reached through their chat-style endpoints.

use std::collections::HashMap;

use serde_json::{Value, json};

use super::{arguments_string, thinking_from_effort, unix_now};
use crate::error::LlmError;
use crate::protocol::responses::{
    ResponsesContent, ResponsesContentPart, ResponsesInput, ResponsesInputItem, ResponsesInputTokensDetails,
    ResponsesOutputContent, ResponsesOutputItem, ResponsesRequest, ResponsesResponse, ResponsesSummaryPart,
    ResponsesUsage,
};
use crate::reconcile::parse_tool_arguments;
use crate::types::{
    BlockDelta, BlockKind, CompletionParams, CompletionRequest, CompletionResponse, ContentPart, ImageSource, Message,
    Role, StopReason, StreamEvent, ToolChoice, ToolResultStatus, ToolSpec, Usage,
};

impl TryFrom<ResponsesRequest> for CompletionRequest {
    type Error = LlmError;

    fn try_from(req: ResponsesRequest) -> Result<Self, Self::Error> {
        let mut messages = Vec::new();

        if let Some(instructions) = req.instructions.filter(|i| !i.is_empty()) {
            messages.push(Message::text(Role::System, instructions));
        }

        match req.input {
            ResponsesInput::Text(text) => messages.push(Message::text(Role::User, text)),
            ResponsesInput::Items(items) => {
                for item in items {
                    push_item(&mut messages, item)?;
                }
            }
        }

        let tools = req
            .tools
            .into_iter()
            .filter_map(|tool| match (tool.tool_type.as_str(), tool.name) {
                ("function", Some(name)) => Some(ToolSpec {
                    name,
                    description: tool.description,
                    parameters: tool
                        .parameters
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    cache_control: None,
                }),
                (tool_type, _) => {
                    tracing::warn!(tool_type, "dropping non-function tool");
                    None
                }
            })
            .collect();

        Ok(Self {
            model: req.model,
            messages,
            params: CompletionParams {
                temperature: req.temperature,
                top_p: req.top_p,
                max_tokens: req.max_output_tokens,
                ..CompletionParams::default()
            },
            tools,
            tool_choice: req.tool_choice.as_ref().map(parse_tool_choice).transpose()?,
            parallel_tool_calls: req.parallel_tool_calls,
            thinking: req
                .reasoning
                .and_then(|reasoning| reasoning.effort)
                .as_deref()
                .and_then(thinking_from_effort),
            stream: req.stream.unwrap_or(false),
        })
    }
}

/// Append an input item, merging calls and outputs into the adjacent message
fn push_item(messages: &mut Vec<Message>, item: ResponsesInputItem) -> Result<(), LlmError> {
    let (role, part) = match item.item_type.as_deref().unwrap_or("message") {
        "message" => {
            let role = match item.role.as_deref().unwrap_or("user") {
                "system" | "developer" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => return Err(LlmError::InvalidRequest(format!("unsupported message role '{other}'"))),
            };

            messages.push(Message {
                role,
                content: content_parts(item.content),
            });
            return Ok(());
        }
        "function_call" => {
            let (Some(call_id), Some(name)) = (item.call_id, item.name) else {
                return Err(LlmError::InvalidRequest(
                    "function_call items need call_id and name".to_owned(),
                ));
            };
            let input = parse_tool_arguments(item.arguments.as_deref().unwrap_or_default());
            (Role::Assistant, ContentPart::ToolUse { id: call_id, name, input })
        }
        "function_call_output" => {
            let Some(call_id) = item.call_id else {
                return Err(LlmError::InvalidRequest("function_call_output items need call_id".to_owned()));
            };
            (
                Role::Tool,
                ContentPart::ToolResult {
                    tool_use_id: call_id,
                    content: vec![ContentPart::text(item.output.unwrap_or_default())],
                    status: ToolResultStatus::Success,
                    cache_control: None,
                },
            )
        }
        "reasoning" => {
            let text = item.summary.into_iter().map(|part| part.text).collect::<Vec<_>>().join("\n");
            (Role::Assistant, ContentPart::Thinking { text, signature: None })
        }
        other => {
            tracing::warn!(item_type = other, "dropping unsupported input item");
            return Ok(());
        }
    };

    match messages.last_mut() {
        Some(last) if last.role == role => last.content.push(part),
        _ => messages.push(Message {
            role,
            content: vec![part],
        }),
    }

    Ok(())
}

fn content_parts(content: Option<ResponsesContent>) -> Vec<ContentPart> {
    match content {
        None => Vec::new(),
        Some(ResponsesContent::Text(text)) => vec![ContentPart::text(text)],
        Some(ResponsesContent::Parts(parts)) => parts
            .into_iter()
            .filter_map(|part| match part {
                ResponsesContentPart::InputText { text } | ResponsesContentPart::OutputText { text } => {
                    Some(ContentPart::text(text))
                }
                ResponsesContentPart::InputImage { image_url: Some(url) } => Some(ContentPart::Image {
                    source: ImageSource::parse(&url),
                    cache_control: None,
                }),
                ResponsesContentPart::InputImage { image_url: None } | ResponsesContentPart::Unsupported => {
                    tracing::warn!("dropping unsupported content part");
                    None
                }
            })
            .collect(),
    }
}

fn parse_tool_choice(value: &Value) -> Result<ToolChoice, LlmError> {
    match value {
        Value::String(mode) => match mode.as_str() {
            "none" => Ok(ToolChoice::None),
            "auto" => Ok(ToolChoice::Auto),
            "required" => Ok(ToolChoice::Any),
            other => Err(LlmError::InvalidRequest(format!("unsupported tool_choice '{other}'"))),
        },
        Value::Object(object) => object
            .get("name")
            .and_then(Value::as_str)
            .map(|name| ToolChoice::Tool { name: name.to_owned() })
            .ok_or_else(|| LlmError::InvalidRequest("tool_choice object must name a function".to_owned())),
        _ => Err(LlmError::InvalidRequest("tool_choice must be a string or object".to_owned())),
    }
}

fn item_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

fn usage(usage: Usage) -> ResponsesUsage {
    ResponsesUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total(),
        input_tokens_details: ResponsesInputTokensDetails {
            cached_tokens: usage.cache_read_tokens,
        },
    }
}

const fn status_for(stop_reason: Option<StopReason>) -> &'static str {
    match stop_reason {
        Some(StopReason::MaxTokens | StopReason::ContentFilter) => "incomplete",
        _ => "completed",
    }
}

/// Render a completion as a Responses API object
///
/// Each content block becomes one output item, in order.
pub fn response_object(resp: &CompletionResponse) -> ResponsesResponse {
    let output = resp
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text, .. } => Some(ResponsesOutputItem::Message {
                id: item_id("msg"),
                status: "completed",
                role: "assistant",
                content: vec![ResponsesOutputContent::OutputText {
                    text: text.clone(),
                    annotations: Vec::new(),
                }],
            }),
            ContentPart::ToolUse { id, name, input } => Some(ResponsesOutputItem::FunctionCall {
                id: item_id("fc"),
                call_id: id.clone(),
                name: name.clone(),
                arguments: arguments_string(input),
                status: "completed",
            }),
            ContentPart::Thinking { text, .. } => Some(ResponsesOutputItem::Reasoning {
                id: item_id("rs"),
                summary: vec![ResponsesSummaryPart {
                    part_type: "summary_text".to_owned(),
                    text: text.clone(),
                }],
            }),
            ContentPart::Image { .. } | ContentPart::ToolResult { .. } => None,
        })
        .collect();

    ResponsesResponse {
        id: format!("resp_{}", resp.id),
        object: "response",
        created_at: unix_now(),
        status: status_for(resp.stop_reason),
        model: resp.model.clone(),
        output,
        usage: Some(usage(resp.usage)),
    }
}

/// One Responses API server-sent event
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsesEvent {
    /// SSE `event:` name, repeated as `type` in the payload
    pub name: &'static str,
    pub data: Value,
}

struct OpenItem {
    output_index: usize,
    id: String,
    kind: BlockKind,
    buffer: String,
}

/// Encodes canonical events as Responses API stream events
pub struct ResponsesStreamEncoder {
    id: String,
    model: String,
    created_at: u64,
    sequence: u64,
    open: HashMap<u32, OpenItem>,
    output: Vec<ResponsesOutputItem>,
}

impl ResponsesStreamEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: item_id("resp"),
            model: model.into(),
            created_at: unix_now(),
            sequence: 0,
            open: HashMap::new(),
            output: Vec::new(),
        }
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Vec<ResponsesEvent> {
        let mut out = Vec::new();

        match event {
            StreamEvent::MessageStart { .. } => {
                let response = self.snapshot("in_progress", None);
                self.emit(&mut out, "response.created", json!({"response": response}));
                self.emit(&mut out, "response.in_progress", json!({"response": response}));
            }
            StreamEvent::ContentBlockStart { index, kind } => self.start(*index, kind, &mut out),
            StreamEvent::ContentBlockDelta { index, delta } => self.delta(*index, delta, &mut out),
            StreamEvent::ContentBlockStop { index } => self.stop(*index, &mut out),
            StreamEvent::MessageStop { stop_reason, usage } => {
                let mut open: Vec<_> = self.open.keys().copied().collect();
                open.sort_unstable();
                for index in open {
                    self.stop(index, &mut out);
                }

                let response = self.snapshot(status_for(*stop_reason), Some(*usage));
                self.emit(&mut out, "response.completed", json!({"response": response}));
            }
        }

        out
    }

    fn start(&mut self, index: u32, kind: &BlockKind, out: &mut Vec<ResponsesEvent>) {
        let output_index = self.output.len() + self.open.len();

        let (id, item) = match kind {
            BlockKind::Text => {
                let id = item_id("msg");
                let item = json!({"type": "message", "id": id, "status": "in_progress", "role": "assistant", "content": []});
                (id, item)
            }
            BlockKind::ToolUse { id: call_id, name } => {
                let id = item_id("fc");
                let item = json!({"type": "function_call", "id": id, "call_id": call_id, "name": name, "arguments": "", "status": "in_progress"});
                (id, item)
            }
            BlockKind::Thinking => {
                let id = item_id("rs");
                let item = json!({"type": "reasoning", "id": id, "summary": []});
                (id, item)
            }
        };

        self.emit(out, "response.output_item.added", json!({"output_index": output_index, "item": item}));

        match kind {
            BlockKind::Text => self.emit(
                out,
                "response.content_part.added",
                json!({"item_id": id, "output_index": output_index, "content_index": 0, "part": {"type": "output_text", "text": "", "annotations": []}}),
            ),
            BlockKind::Thinking => self.emit(
                out,
                "response.reasoning_summary_part.added",
                json!({"item_id": id, "output_index": output_index, "summary_index": 0, "part": {"type": "summary_text", "text": ""}}),
            ),
            BlockKind::ToolUse { .. } => {}
        }

        self.open.insert(
            index,
            OpenItem {
                output_index,
                id,
                kind: kind.clone(),
                buffer: String::new(),
            },
        );
    }

    fn delta(&mut self, index: u32, delta: &BlockDelta, out: &mut Vec<ResponsesEvent>) {
        let Some(item) = self.open.get_mut(&index) else {
            return;
        };

        let (name, data) = match delta {
            BlockDelta::Text(text) => (
                "response.output_text.delta",
                json!({"item_id": item.id, "output_index": item.output_index, "content_index": 0, "delta": text}),
            ),
            BlockDelta::ToolArgs(arguments) => (
                "response.function_call_arguments.delta",
                json!({"item_id": item.id, "output_index": item.output_index, "delta": arguments}),
            ),
            BlockDelta::Thinking(text) => (
                "response.reasoning_summary_text.delta",
                json!({"item_id": item.id, "output_index": item.output_index, "summary_index": 0, "delta": text}),
            ),
            BlockDelta::Signature(_) => return,
        };

        let (BlockDelta::Text(fragment) | BlockDelta::ToolArgs(fragment) | BlockDelta::Thinking(fragment)) = delta
        else {
            return;
        };
        item.buffer.push_str(fragment);

        self.emit(out, name, data);
    }

    fn stop(&mut self, index: u32, out: &mut Vec<ResponsesEvent>) {
        let Some(item) = self.open.remove(&index) else {
            return;
        };

        let (done, output) = match item.kind {
            BlockKind::Text => {
                self.emit(
                    out,
                    "response.output_text.done",
                    json!({"item_id": item.id, "output_index": item.output_index, "content_index": 0, "text": item.buffer}),
                );
                self.emit(
                    out,
                    "response.content_part.done",
                    json!({"item_id": item.id, "output_index": item.output_index, "content_index": 0, "part": {"type": "output_text", "text": item.buffer, "annotations": []}}),
                );
                let output = ResponsesOutputItem::Message {
                    id: item.id,
                    status: "completed",
                    role: "assistant",
                    content: vec![ResponsesOutputContent::OutputText {
                        text: item.buffer,
                        annotations: Vec::new(),
                    }],
                };
                (item.output_index, output)
            }
            BlockKind::ToolUse { id: call_id, name } => {
                self.emit(
                    out,
                    "response.function_call_arguments.done",
                    json!({"item_id": item.id, "output_index": item.output_index, "arguments": item.buffer}),
                );
                let output = ResponsesOutputItem::FunctionCall {
                    id: item.id,
                    call_id,
                    name,
                    arguments: item.buffer,
                    status: "completed",
                };
                (item.output_index, output)
            }
            BlockKind::Thinking => {
                self.emit(
                    out,
                    "response.reasoning_summary_text.done",
                    json!({"item_id": item.id, "output_index": item.output_index, "summary_index": 0, "text": item.buffer}),
                );
                let output = ResponsesOutputItem::Reasoning {
                    id: item.id,
                    summary: vec![ResponsesSummaryPart {
                        part_type: "summary_text".to_owned(),
                        text: item.buffer,
                    }],
                };
                (item.output_index, output)
            }
        };

        self.emit(out, "response.output_item.done", json!({"output_index": done, "item": output}));
        self.output.push(output);
    }

    fn snapshot(&self, status: &'static str, totals: Option<Usage>) -> ResponsesResponse {
        ResponsesResponse {
            id: self.id.clone(),
            object: "response",
            created_at: self.created_at,
            status,
            model: self.model.clone(),
            output: self.output.clone(),
            usage: totals.map(usage),
        }
    }

    fn emit(&mut self, out: &mut Vec<ResponsesEvent>, name: &'static str, mut data: Value) {
        if let Value::Object(fields) = &mut data {
            fields.insert("type".to_owned(), json!(name));
            fields.insert("sequence_number".to_owned(), json!(self.sequence));
        }
        self.sequence += 1;
        out.push(ResponsesEvent { name, data });
    }
}
