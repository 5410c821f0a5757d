//! Conversion between canonical types and the Anthropic Messages format
//!
//! Anthropic is the closest wire format to the canonical model: ordered
//! typed blocks, a top-level system field, signed thinking, and cache
//! markers on individual blocks.

use std::collections::{HashMap, HashSet};

use eventsource_stream::Event;

use super::DEFAULT_THINKING_BUDGET;
use crate::error::LlmError;
use crate::protocol::anthropic::{
    AnthropicCacheControl, AnthropicContent, AnthropicContentBlock, AnthropicImageSource, AnthropicMessage,
    AnthropicMessageDelta, AnthropicRequest, AnthropicResponse, AnthropicStreamDelta, AnthropicStreamEvent,
    AnthropicSystem, AnthropicThinking, AnthropicTool, AnthropicToolChoice, AnthropicToolResultContent,
    AnthropicUsage,
};
use crate::reconcile::reconcile;
use crate::stream::StreamDecoder;
use crate::types::{
    BlockDelta, BlockKind, CacheControl, CompletionParams, CompletionRequest, CompletionResponse, ContentPart,
    ImageSource, Message, Role, StopReason, StreamEvent, ThinkingConfig, ToolChoice, ToolResultStatus, ToolSpec,
    Usage,
};

/// `max_tokens` is mandatory upstream
pub const DEFAULT_MAX_TOKENS: u32 = 4_096;

/// Smallest thinking budget Anthropic accepts
const MIN_THINKING_BUDGET: u32 = 1_024;

pub(crate) const fn stop_reason_str(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ToolUse => "tool_use",
        StopReason::ContentFilter => "refusal",
    }
}

fn parse_stop_reason(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "tool_use" => StopReason::ToolUse,
        "refusal" => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

impl From<&AnthropicCacheControl> for CacheControl {
    fn from(cache: &AnthropicCacheControl) -> Self {
        Self {
            kind: cache.cache_type.clone(),
            ttl: cache.ttl.clone(),
        }
    }
}

impl From<&CacheControl> for AnthropicCacheControl {
    fn from(cache: &CacheControl) -> Self {
        Self {
            cache_type: cache.kind.clone(),
            ttl: cache.ttl.clone(),
        }
    }
}

// -- Inbound: Anthropic wire format -> canonical --

impl TryFrom<AnthropicRequest> for CompletionRequest {
    type Error = LlmError;

    fn try_from(req: AnthropicRequest) -> Result<Self, Self::Error> {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);

        match req.system {
            Some(AnthropicSystem::Text(text)) if !text.is_empty() => messages.push(Message::text(Role::System, text)),
            Some(AnthropicSystem::Blocks(blocks)) => messages.push(Message {
                role: Role::System,
                content: blocks.into_iter().filter_map(canonical_part).collect(),
            }),
            _ => {}
        }

        for message in req.messages {
            let role = match message.role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    return Err(LlmError::InvalidRequest(format!(
                        "unsupported message role '{other}', expected 'user' or 'assistant'"
                    )));
                }
            };

            let content = match message.content {
                AnthropicContent::Text(text) => vec![ContentPart::text(text)],
                AnthropicContent::Blocks(blocks) => blocks.into_iter().filter_map(canonical_part).collect(),
            };

            messages.push(Message { role, content });
        }

        let (tool_choice, parallel_tool_calls) = match req.tool_choice {
            Some(choice) => {
                let parallel = choice.disable_parallel_tool_use.map(|disable| !disable);
                let choice = match (choice.choice_type.as_str(), choice.name) {
                    ("auto", _) => ToolChoice::Auto,
                    ("any", _) => ToolChoice::Any,
                    ("none", _) => ToolChoice::None,
                    ("tool", Some(name)) => ToolChoice::Tool { name },
                    (other, _) => return Err(LlmError::InvalidRequest(format!("unsupported tool_choice '{other}'"))),
                };
                (Some(choice), parallel)
            }
            None => (None, None),
        };

        Ok(Self {
            model: req.model,
            messages,
            params: CompletionParams {
                temperature: req.temperature,
                top_p: req.top_p,
                top_k: req.top_k,
                max_tokens: Some(req.max_tokens),
                stop: req.stop_sequences,
                seed: None,
            },
            tools: req.tools.unwrap_or_default().into_iter().map(Into::into).collect(),
            tool_choice,
            parallel_tool_calls,
            thinking: req.thinking.map(|thinking| ThinkingConfig {
                enabled: thinking.thinking_type == "enabled",
                budget_tokens: thinking.budget_tokens,
            }),
            stream: req.stream.unwrap_or(false),
        })
    }
}

impl From<AnthropicTool> for ToolSpec {
    fn from(tool: AnthropicTool) -> Self {
        Self {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
            cache_control: tool.cache_control.as_ref().map(Into::into),
        }
    }
}

/// Map one native block to a canonical part, dropping what has no counterpart
fn canonical_part(block: AnthropicContentBlock) -> Option<ContentPart> {
    match block {
        AnthropicContentBlock::Text { text, cache_control } => Some(ContentPart::Text {
            text,
            cache_control: cache_control.as_ref().map(Into::into),
        }),
        AnthropicContentBlock::Image { source, cache_control } => Some(ContentPart::Image {
            source: match source {
                AnthropicImageSource::Base64 { media_type, data } => ImageSource::Base64 { media_type, data },
                AnthropicImageSource::Url { url } => ImageSource::Url { url },
            },
            cache_control: cache_control.as_ref().map(Into::into),
        }),
        AnthropicContentBlock::ToolUse { id, name, input } => Some(ContentPart::ToolUse { id, name, input }),
        AnthropicContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
            cache_control,
        } => Some(ContentPart::ToolResult {
            tool_use_id,
            content: match content {
                None => Vec::new(),
                Some(AnthropicToolResultContent::Text(text)) => vec![ContentPart::text(text)],
                Some(AnthropicToolResultContent::Blocks(blocks)) => blocks
                    .into_iter()
                    .filter_map(|block| match block {
                        AnthropicContentBlock::Text { .. } | AnthropicContentBlock::Image { .. } => {
                            canonical_part(block)
                        }
                        _ => {
                            tracing::warn!("dropping unsupported block inside tool result");
                            None
                        }
                    })
                    .collect(),
            },
            status: if is_error == Some(true) {
                ToolResultStatus::Error
            } else {
                ToolResultStatus::Success
            },
            cache_control: cache_control.as_ref().map(Into::into),
        }),
        AnthropicContentBlock::Thinking { thinking, signature } => Some(ContentPart::Thinking {
            text: thinking,
            signature,
        }),
        AnthropicContentBlock::RedactedThinking { .. } => {
            tracing::warn!("dropping redacted thinking block");
            None
        }
        AnthropicContentBlock::Unsupported => {
            tracing::warn!("dropping unsupported content block");
            None
        }
    }
}

// -- Outbound: canonical -> Anthropic wire request --

impl From<&CompletionRequest> for AnthropicRequest {
    fn from(req: &CompletionRequest) -> Self {
        let (system, rest) = req.split_system();

        let system = match system.as_slice() {
            [] => None,
            [ContentPart::Text {
                text,
                cache_control: None,
            }] => Some(AnthropicSystem::Text(text.clone())),
            blocks => Some(AnthropicSystem::Blocks(blocks.iter().filter_map(native_block).collect())),
        };

        let thinking = req.thinking.filter(|t| t.enabled).map(|t| {
            t.budget_tokens
                .unwrap_or(DEFAULT_THINKING_BUDGET)
                .max(MIN_THINKING_BUDGET)
        });

        let mut max_tokens = req.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if let Some(budget) = thinking
            && max_tokens <= budget
        {
            max_tokens = budget + DEFAULT_MAX_TOKENS;
        }

        // Extended thinking rejects custom temperature and top_k
        let (temperature, top_k) = if thinking.is_some() {
            (None, None)
        } else {
            (req.params.temperature, req.params.top_k)
        };

        let disable_parallel = req.parallel_tool_calls == Some(false) && !req.tools.is_empty();
        let tool_choice = match (&req.tool_choice, disable_parallel) {
            (None, false) => None,
            (choice, _) => {
                let (choice_type, name) = match choice {
                    None | Some(ToolChoice::Auto) => ("auto", None),
                    Some(ToolChoice::Any) => ("any", None),
                    Some(ToolChoice::None) => ("none", None),
                    Some(ToolChoice::Tool { name }) => ("tool", Some(name.clone())),
                };
                Some(AnthropicToolChoice {
                    choice_type: choice_type.to_owned(),
                    name,
                    disable_parallel_tool_use: disable_parallel.then_some(true),
                })
            }
        };

        Self {
            model: req.model.clone(),
            max_tokens,
            system,
            messages: native_messages(&rest),
            temperature,
            top_p: req.params.top_p,
            top_k,
            stop_sequences: req.params.stop.clone(),
            stream: req.stream.then_some(true),
            tools: (!req.tools.is_empty()).then(|| req.tools.iter().map(Into::into).collect()),
            tool_choice,
            thinking: thinking.map(|budget| AnthropicThinking {
                thinking_type: "enabled".to_owned(),
                budget_tokens: Some(budget),
            }),
            anthropic_version: None,
        }
    }
}

impl From<&ToolSpec> for AnthropicTool {
    fn from(tool: &ToolSpec) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.parameters.clone(),
            cache_control: tool.cache_control.as_ref().map(Into::into),
        }
    }
}

/// Build alternating user/assistant messages
///
/// Tool-role messages are sent as `user`; consecutive messages with the same
/// resulting role are merged since Anthropic requires alternation.
fn native_messages(messages: &[&Message]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        let role = if message.role == Role::Assistant { "assistant" } else { "user" };
        let blocks: Vec<_> = message.content.iter().filter_map(native_block).collect();

        if blocks.is_empty() {
            continue;
        }

        match out.last_mut() {
            Some(AnthropicMessage {
                role: last_role,
                content: AnthropicContent::Blocks(existing),
            }) if last_role == role => existing.extend(blocks),
            _ => out.push(AnthropicMessage {
                role: role.to_owned(),
                content: AnthropicContent::Blocks(blocks),
            }),
        }
    }

    out
}

fn native_block(part: &ContentPart) -> Option<AnthropicContentBlock> {
    let block = match part {
        ContentPart::Text { text, cache_control } => {
            if text.is_empty() {
                return None;
            }
            AnthropicContentBlock::Text {
                text: text.clone(),
                cache_control: cache_control.as_ref().map(Into::into),
            }
        }
        ContentPart::Image { source, cache_control } => AnthropicContentBlock::Image {
            source: match source {
                ImageSource::Url { url } => AnthropicImageSource::Url { url: url.clone() },
                ImageSource::Base64 { media_type, data } => AnthropicImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
            },
            cache_control: cache_control.as_ref().map(Into::into),
        },
        ContentPart::ToolUse { id, name, input } => AnthropicContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: if input.is_object() {
                input.clone()
            } else {
                serde_json::json!({ "input": input })
            },
        },
        ContentPart::ToolResult {
            tool_use_id,
            content,
            status,
            cache_control,
        } => AnthropicContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: Some(match content.as_slice() {
                [ContentPart::Text { text, cache_control: None }] => AnthropicToolResultContent::Text(text.clone()),
                parts => AnthropicToolResultContent::Blocks(parts.iter().filter_map(native_block).collect()),
            }),
            is_error: (*status == ToolResultStatus::Error).then_some(true),
            cache_control: cache_control.as_ref().map(Into::into),
        },
        ContentPart::Thinking { text, signature } => AnthropicContentBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        },
    };

    Some(block)
}

// -- Responses in both directions --

impl From<&AnthropicUsage> for Usage {
    fn from(usage: &AnthropicUsage) -> Self {
        let cache_read = usage.cache_read_input_tokens.unwrap_or_default();
        let cache_write = usage.cache_creation_input_tokens.unwrap_or_default();

        Self {
            input_tokens: usage.input_tokens.saturating_add(cache_read).saturating_add(cache_write),
            output_tokens: usage.output_tokens,
            cache_read_tokens: cache_read,
            cache_write_tokens: cache_write,
        }
    }
}

impl From<Usage> for AnthropicUsage {
    fn from(usage: Usage) -> Self {
        Self {
            input_tokens: usage
                .input_tokens
                .saturating_sub(usage.cache_read_tokens)
                .saturating_sub(usage.cache_write_tokens),
            output_tokens: usage.output_tokens,
            cache_creation_input_tokens: (usage.cache_write_tokens > 0).then_some(usage.cache_write_tokens),
            cache_read_input_tokens: (usage.cache_read_tokens > 0).then_some(usage.cache_read_tokens),
        }
    }
}

impl From<AnthropicResponse> for CompletionResponse {
    fn from(resp: AnthropicResponse) -> Self {
        Self {
            id: resp.id,
            model: resp.model,
            content: reconcile(resp.content.into_iter().filter_map(canonical_part).collect()),
            stop_reason: resp.stop_reason.as_deref().map(parse_stop_reason),
            usage: Usage::from(&resp.usage),
        }
    }
}

impl From<&CompletionResponse> for AnthropicResponse {
    fn from(resp: &CompletionResponse) -> Self {
        Self {
            id: resp.id.clone(),
            response_type: "message".to_owned(),
            role: "assistant".to_owned(),
            content: resp.content.iter().filter_map(native_block).collect(),
            model: resp.model.clone(),
            stop_reason: resp.stop_reason.map(|reason| stop_reason_str(reason).to_owned()),
            stop_sequence: None,
            usage: AnthropicUsage::from(resp.usage),
        }
    }
}

// -- Streaming --

/// Decodes Anthropic SSE events through the fixed event table
pub struct AnthropicStreamDecoder {
    provider: String,
    usage: Usage,
    stop_reason: Option<StopReason>,
    /// Blocks with no canonical counterpart; their deltas are ignored
    skipped: HashSet<u32>,
}

impl AnthropicStreamDecoder {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            usage: Usage::default(),
            stop_reason: None,
            skipped: HashSet::new(),
        }
    }

    /// Translate one parsed event
    pub fn event(&mut self, event: AnthropicStreamEvent) -> Result<Vec<StreamEvent>, LlmError> {
        let events = match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.usage = Usage::from(&message.usage);
                vec![StreamEvent::MessageStart {
                    id: message.id,
                    model: message.model,
                }]
            }
            AnthropicStreamEvent::ContentBlockStart { index, content_block } => self.block_start(index, content_block),
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                if self.skipped.contains(&index) {
                    return Ok(Vec::new());
                }

                let delta = match delta {
                    AnthropicStreamDelta::TextDelta { text } => BlockDelta::Text(text),
                    AnthropicStreamDelta::InputJsonDelta { partial_json } => BlockDelta::ToolArgs(partial_json),
                    AnthropicStreamDelta::ThinkingDelta { thinking } => BlockDelta::Thinking(thinking),
                    AnthropicStreamDelta::SignatureDelta { signature } => BlockDelta::Signature(signature),
                    AnthropicStreamDelta::Unknown => {
                        tracing::warn!(provider = %self.provider, index, "dropping unknown delta type");
                        return Ok(Vec::new());
                    }
                };
                vec![StreamEvent::ContentBlockDelta { index, delta }]
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                if self.skipped.remove(&index) {
                    Vec::new()
                } else {
                    vec![StreamEvent::ContentBlockStop { index }]
                }
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(parse_stop_reason(&reason));
                }
                if let Some(usage) = usage {
                    self.usage.output_tokens = usage.output_tokens;
                    if usage.input_tokens > 0 {
                        self.usage = Usage {
                            output_tokens: usage.output_tokens,
                            ..Usage::from(&usage)
                        };
                    }
                }
                Vec::new()
            }
            AnthropicStreamEvent::MessageStop => vec![StreamEvent::MessageStop {
                stop_reason: self.stop_reason,
                usage: self.usage,
            }],
            AnthropicStreamEvent::Ping => Vec::new(),
            AnthropicStreamEvent::Error { error } => {
                return Err(LlmError::upstream(
                    &self.provider,
                    None,
                    format!("{}: {}", error.error_type, error.message),
                ));
            }
            AnthropicStreamEvent::Unknown => {
                tracing::warn!(provider = %self.provider, "dropping unknown stream event");
                Vec::new()
            }
        };

        Ok(events)
    }

    fn block_start(&mut self, index: u32, block: AnthropicContentBlock) -> Vec<StreamEvent> {
        let (kind, initial) = match block {
            AnthropicContentBlock::Text { text, .. } => (BlockKind::Text, Some(BlockDelta::Text(text))),
            AnthropicContentBlock::Thinking { thinking, .. } => {
                (BlockKind::Thinking, Some(BlockDelta::Thinking(thinking)))
            }
            AnthropicContentBlock::ToolUse { id, name, input } => {
                let initial = input
                    .as_object()
                    .filter(|object| !object.is_empty())
                    .map(|_| BlockDelta::ToolArgs(input.to_string()));
                (BlockKind::ToolUse { id, name }, initial)
            }
            _ => {
                tracing::warn!(provider = %self.provider, index, "skipping content block without a canonical form");
                self.skipped.insert(index);
                return Vec::new();
            }
        };

        let mut out = vec![StreamEvent::ContentBlockStart { index, kind }];

        if let Some(delta) = initial.filter(|delta| match delta {
            BlockDelta::Text(s) | BlockDelta::Thinking(s) | BlockDelta::ToolArgs(s) | BlockDelta::Signature(s) => {
                !s.is_empty()
            }
        }) {
            out.push(StreamEvent::ContentBlockDelta { index, delta });
        }

        out
    }
}

impl StreamDecoder for AnthropicStreamDecoder {
    type Chunk = Event;

    fn decode(&mut self, event: Event) -> Result<Vec<StreamEvent>, LlmError> {
        match serde_json::from_str::<AnthropicStreamEvent>(&event.data) {
            Ok(parsed) => self.event(parsed),
            Err(e) => {
                tracing::warn!(provider = %self.provider, event = %event.event, error = %e, "dropping unparsable stream event");
                Ok(Vec::new())
            }
        }
    }
}

/// Encodes canonical events as Anthropic SSE events
///
/// Block indices are renumbered densely from zero, as SDKs index their
/// content arrays by them.
#[derive(Default)]
pub struct AnthropicStreamEncoder {
    model: String,
    indices: HashMap<u32, u32>,
}

impl AnthropicStreamEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            indices: HashMap::new(),
        }
    }

    /// Returns `(event name, payload)` pairs
    pub fn encode(&mut self, event: &StreamEvent) -> Vec<(&'static str, AnthropicStreamEvent)> {
        match event {
            StreamEvent::MessageStart { id, model } => {
                let model = if model.is_empty() { self.model.clone() } else { model.clone() };
                vec![(
                    "message_start",
                    AnthropicStreamEvent::MessageStart {
                        message: AnthropicResponse {
                            id: id.clone(),
                            response_type: "message".to_owned(),
                            role: "assistant".to_owned(),
                            content: Vec::new(),
                            model,
                            stop_reason: None,
                            stop_sequence: None,
                            usage: AnthropicUsage::default(),
                        },
                    },
                )]
            }
            StreamEvent::ContentBlockStart { index, kind } => {
                let dense = u32::try_from(self.indices.len()).unwrap_or(u32::MAX);
                self.indices.insert(*index, dense);

                let content_block = match kind {
                    BlockKind::Text => AnthropicContentBlock::Text {
                        text: String::new(),
                        cache_control: None,
                    },
                    BlockKind::ToolUse { id, name } => AnthropicContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: serde_json::json!({}),
                    },
                    BlockKind::Thinking => AnthropicContentBlock::Thinking {
                        thinking: String::new(),
                        signature: Some(String::new()),
                    },
                };

                vec![(
                    "content_block_start",
                    AnthropicStreamEvent::ContentBlockStart {
                        index: dense,
                        content_block,
                    },
                )]
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let Some(&dense) = self.indices.get(index) else {
                    return Vec::new();
                };
                let delta = match delta {
                    BlockDelta::Text(text) => AnthropicStreamDelta::TextDelta { text: text.clone() },
                    BlockDelta::ToolArgs(partial_json) => AnthropicStreamDelta::InputJsonDelta {
                        partial_json: partial_json.clone(),
                    },
                    BlockDelta::Thinking(thinking) => AnthropicStreamDelta::ThinkingDelta {
                        thinking: thinking.clone(),
                    },
                    BlockDelta::Signature(signature) => AnthropicStreamDelta::SignatureDelta {
                        signature: signature.clone(),
                    },
                };
                vec![(
                    "content_block_delta",
                    AnthropicStreamEvent::ContentBlockDelta { index: dense, delta },
                )]
            }
            StreamEvent::ContentBlockStop { index } => match self.indices.get(index) {
                Some(&dense) => vec![("content_block_stop", AnthropicStreamEvent::ContentBlockStop { index: dense })],
                None => Vec::new(),
            },
            StreamEvent::MessageStop { stop_reason, usage } => vec![
                (
                    "message_delta",
                    AnthropicStreamEvent::MessageDelta {
                        delta: AnthropicMessageDelta {
                            stop_reason: Some(stop_reason_str(stop_reason.unwrap_or(StopReason::EndTurn)).to_owned()),
                            stop_sequence: None,
                        },
                        usage: Some(AnthropicUsage::from(*usage)),
                    },
                ),
                ("message_stop", AnthropicStreamEvent::MessageStop),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn request(body: Value) -> CompletionRequest {
        let wire: AnthropicRequest = serde_json::from_value(body).unwrap();
        CompletionRequest::try_from(wire).unwrap()
    }

    fn event(data: Value) -> Event {
        Event {
            data: data.to_string(),
            ..Event::default()
        }
    }

    #[test]
    fn system_and_cache_markers_survive_round_trip() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 1024,
            "system": [{"type": "text", "text": "You are a lawyer.", "cache_control": {"type": "ephemeral"}}],
            "messages": [{"role": "user", "content": "Summarize the contract."}]
        }));

        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[0].content[0].cache_control(), Some(&CacheControl::ephemeral()));

        let wire = AnthropicRequest::from(&req);
        let Some(AnthropicSystem::Blocks(blocks)) = &wire.system else {
            panic!("expected system blocks");
        };
        assert!(matches!(&blocks[0], AnthropicContentBlock::Text { cache_control: Some(_), .. }));
        assert_eq!(wire.messages.len(), 1);
    }

    #[test]
    fn system_messages_move_to_top_level() {
        let req = CompletionRequest::new(
            "claude",
            vec![Message::text(Role::System, "Be brief."), Message::text(Role::User, "Hi")],
        );

        let wire = AnthropicRequest::from(&req);
        assert!(matches!(wire.system, Some(AnthropicSystem::Text(ref text)) if text == "Be brief."));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn tool_messages_merge_into_one_user_turn() {
        let result = |id: &str| ContentPart::ToolResult {
            tool_use_id: id.to_owned(),
            content: vec![ContentPart::text("ok")],
            status: ToolResultStatus::Error,
            cache_control: None,
        };
        let req = CompletionRequest::new(
            "claude",
            vec![
                Message {
                    role: Role::Assistant,
                    content: vec![
                        ContentPart::ToolUse {
                            id: "a".to_owned(),
                            name: "f".to_owned(),
                            input: json!({}),
                        },
                        ContentPart::ToolUse {
                            id: "b".to_owned(),
                            name: "f".to_owned(),
                            input: json!({}),
                        },
                    ],
                },
                Message {
                    role: Role::Tool,
                    content: vec![result("a")],
                },
                Message {
                    role: Role::Tool,
                    content: vec![result("b")],
                },
            ],
        );

        let wire = AnthropicRequest::from(&req);
        assert_eq!(wire.messages.len(), 2);
        let AnthropicContent::Blocks(blocks) = &wire.messages[1].content else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], AnthropicContentBlock::ToolResult { is_error: Some(true), .. }));
    }

    #[test]
    fn image_tool_results_survive_round_trip() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "Take a screenshot."},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "screenshot", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [
                        {"type": "text", "text": "Captured."},
                        {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "iVBORw0KGgo="}}
                    ]}
                ]}
            ]
        }));

        let ContentPart::ToolResult { content, .. } = &req.messages[2].content[0] else {
            panic!("expected tool result");
        };
        assert_eq!(content.len(), 2);
        assert!(matches!(&content[1], ContentPart::Image { source: ImageSource::Base64 { .. }, .. }));

        let wire = AnthropicRequest::from(&req);
        let AnthropicContent::Blocks(blocks) = &wire.messages[2].content else {
            panic!("expected blocks");
        };
        let AnthropicContentBlock::ToolResult {
            content: Some(AnthropicToolResultContent::Blocks(nested)),
            ..
        } = &blocks[0]
        else {
            panic!("expected nested tool result blocks");
        };
        assert!(matches!(&nested[0], AnthropicContentBlock::Text { text, .. } if text == "Captured."));
        assert!(matches!(
            &nested[1],
            AnthropicContentBlock::Image { source: AnthropicImageSource::Base64 { media_type, .. }, .. } if media_type == "image/png"
        ));
    }

    #[test]
    fn usage_totals_saturate() {
        let usage = Usage::from(&AnthropicUsage {
            input_tokens: u32::MAX,
            output_tokens: 7,
            cache_creation_input_tokens: Some(10),
            cache_read_input_tokens: Some(u32::MAX),
        });

        assert_eq!(usage.input_tokens, u32::MAX);
        assert_eq!(usage.cache_read_tokens, u32::MAX);
        assert_eq!(usage.output_tokens, 7);
    }

    #[test]
    fn thinking_budget_fits_under_max_tokens() {
        let mut req = CompletionRequest::new("claude", vec![Message::text(Role::User, "Prove it.")]);
        req.params.max_tokens = Some(1_000);
        req.params.temperature = Some(0.2);
        req.thinking = Some(ThinkingConfig {
            enabled: true,
            budget_tokens: Some(2_000),
        });

        let wire = AnthropicRequest::from(&req);
        assert_eq!(wire.thinking.as_ref().and_then(|t| t.budget_tokens), Some(2_000));
        assert!(wire.max_tokens > 2_000);
        assert_eq!(wire.temperature, None);
    }

    #[test]
    fn disabling_parallel_calls_sets_tool_choice_flag() {
        let mut req = CompletionRequest::new("claude", vec![Message::text(Role::User, "hi")]);
        req.tools.push(ToolSpec {
            name: "f".to_owned(),
            description: None,
            parameters: json!({"type": "object"}),
            cache_control: None,
        });
        req.parallel_tool_calls = Some(false);

        let choice = AnthropicRequest::from(&req).tool_choice.unwrap();
        assert_eq!(choice.choice_type, "auto");
        assert_eq!(choice.disable_parallel_tool_use, Some(true));
    }

    #[test]
    fn response_preserves_block_order_and_signatures() {
        let wire: AnthropicResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "thinking", "thinking": "User wants weather.", "signature": "EqQB"},
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"location": "Boston"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 20, "cache_read_input_tokens": 5}
        }))
        .unwrap();

        let resp = CompletionResponse::from(wire);
        assert!(matches!(&resp.content[0], ContentPart::Thinking { signature: Some(s), .. } if s == "EqQB"));
        assert_eq!(resp.content[1], ContentPart::text("Checking."));
        assert_eq!(resp.usage.input_tokens, 15);
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));

        let back = AnthropicResponse::from(&resp);
        assert_eq!(back.usage.input_tokens, 10);
        assert_eq!(back.content.len(), 3);
    }

    #[test]
    fn decoder_maps_event_table() {
        let mut decoder = AnthropicStreamDecoder::new("anthropic");
        let inputs = [
            json!({"type": "message_start", "message": {"id": "msg_1", "type": "message", "role": "assistant", "content": [], "model": "claude", "usage": {"input_tokens": 12, "output_tokens": 1}}}),
            json!({"type": "ping"}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {}}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"location\": \"Paris\"}"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "server_tool_use", "id": "x"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "brand_new_event"}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 30}}),
            json!({"type": "message_stop"}),
        ];

        let events: Vec<_> = inputs
            .into_iter()
            .flat_map(|input| decoder.decode(event(input)).unwrap())
            .collect();

        assert_eq!(events.len(), 5);
        assert_eq!(
            events[4],
            StreamEvent::MessageStop {
                stop_reason: Some(StopReason::ToolUse),
                usage: Usage {
                    input_tokens: 12,
                    output_tokens: 30,
                    ..Usage::default()
                },
            }
        );
    }

    #[test]
    fn decoder_surfaces_error_events() {
        let mut decoder = AnthropicStreamDecoder::new("anthropic");
        let err = decoder
            .decode(event(json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})))
            .unwrap_err();
        assert!(err.to_string().contains("overloaded_error: Overloaded"));
    }

    #[test]
    fn encoder_renumbers_indices() {
        let mut encoder = AnthropicStreamEncoder::new("claude");
        let events = encoder.encode(&StreamEvent::ContentBlockStart {
            index: 3,
            kind: BlockKind::Text,
        });
        assert!(matches!(events[0].1, AnthropicStreamEvent::ContentBlockStart { index: 0, .. }));

        let events = encoder.encode(&StreamEvent::ContentBlockDelta {
            index: 3,
            delta: BlockDelta::Text("hi".to_owned()),
        });
        assert!(matches!(events[0].1, AnthropicStreamEvent::ContentBlockDelta { index: 0, .. }));

        let events = encoder.encode(&StreamEvent::MessageStop {
            stop_reason: None,
            usage: Usage::default(),
        });
        let names: Vec<_> = events.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, ["message_delta", "message_stop"]);
    }
}
