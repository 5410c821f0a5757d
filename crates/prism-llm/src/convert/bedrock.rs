//! Conversion between canonical types and Bedrock Converse
//!
//! Upstream calls use the `aws-sdk-bedrockruntime` types; callers that speak
//! Converse JSON to the gateway use the serde types in `protocol::bedrock`.
//! Cache checkpoints are separate `cachePoint` blocks placed right after the
//! block they close.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use aws_sdk_bedrockruntime::types::{
    AnyToolChoice, AutoToolChoice, CachePointBlock, CachePointType, ContentBlock, ContentBlockDelta,
    ContentBlockStart, ConversationRole, ConverseStreamOutput, ImageBlock, ImageFormat, InferenceConfiguration,
    Message as BedrockMessage, ReasoningContentBlock, ReasoningContentBlockDelta, ReasoningTextBlock,
    SpecificToolChoice, StopReason as BedrockStopReason, SystemContentBlock, TokenUsage, Tool,
    ToolChoice as BedrockToolChoice, ToolConfiguration, ToolInputSchema, ToolResultBlock, ToolResultContentBlock,
    ToolResultStatus as BedrockToolResultStatus, ToolSpecification, ToolUseBlock,
};
use aws_smithy_types::{Blob, Document, Number};
use base64::Engine as _;
use serde_json::{Map, Value, json};

use super::DEFAULT_THINKING_BUDGET;
use crate::error::LlmError;
use crate::protocol::bedrock::{
    ConverseContentBlock, ConverseImage, ConverseImageSource, ConverseMessage, ConverseMetrics,
    ConverseOutput, ConverseReasoning, ConverseReasoningText, ConverseRequest, ConverseResponse, ConverseSystemBlock,
    ConverseTool, ConverseToolResult, ConverseToolResultContent, ConverseToolUse, ConverseUsage,
};
use crate::reconcile::reconcile;
use crate::stream::StreamDecoder;
use crate::types::{
    BlockDelta, BlockKind, CacheControl, CompletionParams, CompletionRequest, CompletionResponse, ContentPart,
    ImageSource, Message, Role, StopReason, StreamEvent, ThinkingConfig, ToolChoice, ToolResultStatus, ToolSpec,
    Usage,
};

fn invalid(e: impl fmt::Display) -> LlmError {
    LlmError::InvalidRequest(format!("invalid bedrock request: {e}"))
}

fn image_format(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpeg",
    }
}

fn media_type(format: &str) -> String {
    format!("image/{format}")
}

pub(crate) const fn stop_reason_str(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ToolUse => "tool_use",
        StopReason::ContentFilter => "content_filtered",
    }
}

/// Map an SDK stop reason onto the canonical one
pub fn stop_reason(reason: &BedrockStopReason) -> StopReason {
    match reason {
        BedrockStopReason::MaxTokens => StopReason::MaxTokens,
        BedrockStopReason::StopSequence => StopReason::StopSequence,
        BedrockStopReason::ToolUse => StopReason::ToolUse,
        BedrockStopReason::ContentFiltered | BedrockStopReason::GuardrailIntervened => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

/// Bedrock reports prompt tokens net of cache reads and writes
impl From<&TokenUsage> for Usage {
    fn from(usage: &TokenUsage) -> Self {
        let count = |n: i32| u32::try_from(n).unwrap_or_default();
        let cache_read = usage.cache_read_input_tokens().map_or(0, count);
        let cache_write = usage.cache_write_input_tokens().map_or(0, count);

        Self {
            input_tokens: count(usage.input_tokens()) + cache_read + cache_write,
            output_tokens: count(usage.output_tokens()),
            cache_read_tokens: cache_read,
            cache_write_tokens: cache_write,
        }
    }
}

// -- JSON <-> Document --

pub(crate) fn value_to_document(value: &Value) -> Document {
    match value {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Document::Number(Number::PosInt(u))
            } else if let Some(i) = n.as_i64() {
                Document::Number(Number::NegInt(i))
            } else {
                n.as_f64().map_or(Document::Null, |f| Document::Number(Number::Float(f)))
            }
        }
        Value::String(s) => Document::String(s.clone()),
        Value::Array(items) => Document::Array(items.iter().map(value_to_document).collect()),
        Value::Object(map) => Document::Object(map.iter().map(|(k, v)| (k.clone(), value_to_document(v))).collect()),
    }
}

pub(crate) fn document_to_value(doc: &Document) -> Value {
    match doc {
        Document::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), document_to_value(v))).collect()),
        Document::Array(items) => Value::Array(items.iter().map(document_to_value).collect()),
        Document::Number(Number::PosInt(u)) => Value::from(*u),
        Document::Number(Number::NegInt(i)) => Value::from(*i),
        Document::Number(Number::Float(f)) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Document::String(s) => Value::String(s.clone()),
        Document::Bool(b) => Value::Bool(*b),
        Document::Null => Value::Null,
    }
}

// -- Inbound: Converse JSON -> canonical --

fn cache_control() -> Option<CacheControl> {
    Some(CacheControl::ephemeral())
}

/// Fold `cachePoint` blocks onto the part before them
fn attach_cache_point(parts: &mut [ContentPart]) {
    match parts.last_mut() {
        Some(
            ContentPart::Text { cache_control, .. }
            | ContentPart::Image { cache_control, .. }
            | ContentPart::ToolResult { cache_control, .. },
        ) => *cache_control = self::cache_control(),
        _ => tracing::warn!("dropping cache point that follows no cacheable block"),
    }
}

fn canonical_parts(blocks: Vec<ConverseContentBlock>) -> Vec<ContentPart> {
    let mut parts = Vec::with_capacity(blocks.len());

    for block in blocks {
        let part = match block {
            ConverseContentBlock::Text(text) => ContentPart::text(text),
            ConverseContentBlock::Image(image) => ContentPart::Image {
                source: ImageSource::Base64 {
                    media_type: media_type(&image.format),
                    data: image.source.bytes,
                },
                cache_control: None,
            },
            ConverseContentBlock::ToolUse(tool_use) => ContentPart::ToolUse {
                id: tool_use.tool_use_id,
                name: tool_use.name,
                input: tool_use.input,
            },
            ConverseContentBlock::ToolResult(result) => ContentPart::ToolResult {
                tool_use_id: result.tool_use_id,
                content: result
                    .content
                    .into_iter()
                    .map(|content| match content {
                        ConverseToolResultContent::Text(text) => ContentPart::text(text),
                        ConverseToolResultContent::Json(value) => ContentPart::text(value.to_string()),
                        ConverseToolResultContent::Image(image) => ContentPart::Image {
                            source: ImageSource::Base64 {
                                media_type: media_type(&image.format),
                                data: image.source.bytes,
                            },
                            cache_control: None,
                        },
                    })
                    .collect(),
                status: if result.status.as_deref() == Some("error") {
                    ToolResultStatus::Error
                } else {
                    ToolResultStatus::Success
                },
                cache_control: None,
            },
            ConverseContentBlock::ReasoningContent(reasoning) => match reasoning.reasoning_text {
                Some(text) => ContentPart::Thinking {
                    text: text.text,
                    signature: text.signature,
                },
                None => {
                    tracing::warn!("dropping reasoning block without text");
                    continue;
                }
            },
            ConverseContentBlock::CachePoint(_) => {
                attach_cache_point(&mut parts);
                continue;
            }
        };
        parts.push(part);
    }

    parts
}

impl TryFrom<ConverseRequest> for CompletionRequest {
    type Error = LlmError;

    fn try_from(req: ConverseRequest) -> Result<Self, Self::Error> {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);

        if !req.system.is_empty() {
            let mut system = Vec::new();
            for block in req.system {
                match block {
                    ConverseSystemBlock::Text(text) => system.push(ContentPart::text(text)),
                    ConverseSystemBlock::CachePoint(_) => attach_cache_point(&mut system),
                }
            }
            messages.push(Message {
                role: Role::System,
                content: system,
            });
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
            messages.push(Message {
                role,
                content: canonical_parts(message.content),
            });
        }

        let inference = req.inference_config.unwrap_or_default();
        let tool_config = req.tool_config.unwrap_or_default();

        let mut tools: Vec<ToolSpec> = Vec::with_capacity(tool_config.tools.len());
        for tool in tool_config.tools {
            match tool {
                ConverseTool::ToolSpec(spec) => tools.push(ToolSpec {
                    name: spec.name,
                    description: spec.description,
                    parameters: spec.input_schema.json,
                    cache_control: None,
                }),
                ConverseTool::CachePoint(_) => match tools.last_mut() {
                    Some(last) => last.cache_control = cache_control(),
                    None => tracing::warn!("dropping cache point before any tool"),
                },
            }
        }

        let tool_choice = tool_config.tool_choice.map(|choice| match (choice.tool, choice.any) {
            (Some(tool), _) => ToolChoice::Tool { name: tool.name },
            (None, Some(_)) => ToolChoice::Any,
            (None, None) => ToolChoice::Auto,
        });

        let extra = req.additional_model_request_fields.unwrap_or_default();
        let thinking = extra.get("thinking").map(|thinking| ThinkingConfig {
            enabled: thinking.get("type").and_then(Value::as_str) == Some("enabled"),
            budget_tokens: thinking
                .get("budget_tokens")
                .and_then(Value::as_u64)
                .and_then(|b| u32::try_from(b).ok()),
        });

        Ok(Self {
            model: String::new(),
            messages,
            params: CompletionParams {
                temperature: inference.temperature,
                top_p: inference.top_p,
                top_k: extra
                    .get("top_k")
                    .and_then(Value::as_u64)
                    .and_then(|k| u32::try_from(k).ok()),
                max_tokens: inference.max_tokens,
                stop: inference.stop_sequences,
                seed: None,
            },
            tools,
            tool_choice,
            parallel_tool_calls: None,
            thinking,
            stream: false,
        })
    }
}

/// Converse JSON response for callers of `/model/{id}/converse`
pub fn converse_response(resp: &CompletionResponse, latency_ms: u64) -> ConverseResponse {
    let content = resp
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text, .. } => Some(ConverseContentBlock::Text(text.clone())),
            ContentPart::ToolUse { id, name, input } => Some(ConverseContentBlock::ToolUse(ConverseToolUse {
                tool_use_id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            })),
            ContentPart::Thinking { text, signature } => {
                Some(ConverseContentBlock::ReasoningContent(ConverseReasoning {
                    reasoning_text: Some(ConverseReasoningText {
                        text: text.clone(),
                        signature: signature.clone(),
                    }),
                }))
            }
            ContentPart::Image {
                source: ImageSource::Base64 { media_type, data },
                ..
            } => Some(ConverseContentBlock::Image(ConverseImage {
                format: image_format(media_type).to_owned(),
                source: ConverseImageSource { bytes: data.clone() },
            })),
            ContentPart::ToolResult {
                tool_use_id,
                content,
                status,
                ..
            } => Some(ConverseContentBlock::ToolResult(ConverseToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text, .. } => Some(ConverseToolResultContent::Text(text.clone())),
                        ContentPart::Image {
                            source: ImageSource::Base64 { media_type, data },
                            ..
                        } => Some(ConverseToolResultContent::Image(ConverseImage {
                            format: image_format(media_type).to_owned(),
                            source: ConverseImageSource { bytes: data.clone() },
                        })),
                        _ => None,
                    })
                    .collect(),
                status: (*status == ToolResultStatus::Error).then(|| "error".to_owned()),
            })),
            ContentPart::Image { .. } => None,
        })
        .collect();

    ConverseResponse {
        output: ConverseOutput {
            message: ConverseMessage {
                role: "assistant".to_owned(),
                content,
            },
        },
        stop_reason: stop_reason_str(resp.stop_reason.unwrap_or(StopReason::EndTurn)).to_owned(),
        usage: ConverseUsage::from(&resp.usage),
        metrics: ConverseMetrics { latency_ms },
    }
}

impl From<&Usage> for ConverseUsage {
    fn from(usage: &Usage) -> Self {
        Self {
            input_tokens: usage
                .input_tokens
                .saturating_sub(usage.cache_read_tokens)
                .saturating_sub(usage.cache_write_tokens),
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
            cache_read_input_tokens: (usage.cache_read_tokens > 0).then_some(usage.cache_read_tokens),
            cache_write_input_tokens: (usage.cache_write_tokens > 0).then_some(usage.cache_write_tokens),
        }
    }
}

// -- Outbound: canonical -> SDK types --

/// Everything a `Converse`/`ConverseStream` call needs besides the model id
#[derive(Debug, Clone)]
pub struct ConverseInput {
    pub system: Vec<SystemContentBlock>,
    pub messages: Vec<BedrockMessage>,
    pub inference_config: InferenceConfiguration,
    pub tool_config: Option<ToolConfiguration>,
    /// Model-specific fields such as Anthropic `thinking`
    pub additional_fields: Option<Document>,
}

fn cache_point() -> Result<CachePointBlock, LlmError> {
    CachePointBlock::builder()
        .r#type(CachePointType::Default)
        .build()
        .map_err(invalid)
}

impl TryFrom<&CompletionRequest> for ConverseInput {
    type Error = LlmError;

    fn try_from(req: &CompletionRequest) -> Result<Self, Self::Error> {
        let (system_parts, rest) = req.split_system();

        let mut system = Vec::with_capacity(system_parts.len());
        for part in &system_parts {
            if let ContentPart::Text { text, cache_control } = part {
                system.push(SystemContentBlock::Text(text.clone()));
                if cache_control.is_some() {
                    system.push(SystemContentBlock::CachePoint(cache_point()?));
                }
            }
        }

        let mut messages: Vec<(ConversationRole, Vec<ContentBlock>)> = Vec::with_capacity(rest.len());
        for message in rest {
            let role = if message.role == Role::Assistant {
                ConversationRole::Assistant
            } else {
                ConversationRole::User
            };
            let blocks = native_blocks(&message.content)?;
            if blocks.is_empty() {
                continue;
            }

            match messages.last_mut() {
                Some((last, existing)) if *last == role => existing.extend(blocks),
                _ => messages.push((role, blocks)),
            }
        }

        let messages = messages
            .into_iter()
            .map(|(role, blocks)| {
                BedrockMessage::builder()
                    .role(role)
                    .set_content(Some(blocks))
                    .build()
                    .map_err(invalid)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let thinking = req
            .thinking
            .filter(|t| t.enabled)
            .map(|t| t.budget_tokens.unwrap_or(DEFAULT_THINKING_BUDGET));

        let mut extra = Map::new();
        if let Some(budget) = thinking {
            extra.insert("thinking".to_owned(), json!({"type": "enabled", "budget_tokens": budget}));
        } else if let Some(top_k) = req.params.top_k {
            extra.insert("top_k".to_owned(), json!(top_k));
        }

        #[allow(clippy::cast_possible_truncation)]
        let inference_config = InferenceConfiguration::builder()
            .set_max_tokens(req.params.max_tokens.map(|max| i32::try_from(max).unwrap_or(i32::MAX)))
            .set_temperature(req.params.temperature.filter(|_| thinking.is_none()).map(|t| t as f32))
            .set_top_p(req.params.top_p.map(|p| p as f32))
            .set_stop_sequences(req.params.stop.clone())
            .build();

        Ok(Self {
            system,
            messages,
            inference_config,
            tool_config: tool_config(req)?,
            additional_fields: (!extra.is_empty()).then(|| value_to_document(&Value::Object(extra))),
        })
    }
}

fn native_blocks(parts: &[ContentPart]) -> Result<Vec<ContentBlock>, LlmError> {
    let mut blocks = Vec::with_capacity(parts.len());

    for part in parts {
        let block = match part {
            ContentPart::Text { text, .. } => {
                if text.is_empty() {
                    continue;
                }
                ContentBlock::Text(text.clone())
            }
            ContentPart::Image { source, .. } => ContentBlock::Image(image_block(source)?),
            ContentPart::ToolUse { id, name, input } => ContentBlock::ToolUse(
                ToolUseBlock::builder()
                    .tool_use_id(id)
                    .name(name)
                    .input(value_to_document(input))
                    .build()
                    .map_err(invalid)?,
            ),
            ContentPart::ToolResult {
                tool_use_id,
                content,
                status,
                ..
            } => {
                let content = content.iter().map(tool_result_block).collect::<Result<Vec<_>, _>>()?;
                ContentBlock::ToolResult(
                    ToolResultBlock::builder()
                        .tool_use_id(tool_use_id)
                        .set_content(Some(content.into_iter().flatten().collect()))
                        .set_status((*status == ToolResultStatus::Error).then_some(BedrockToolResultStatus::Error))
                        .build()
                        .map_err(invalid)?,
                )
            }
            ContentPart::Thinking { text, signature } => {
                ContentBlock::ReasoningContent(ReasoningContentBlock::ReasoningText(
                    ReasoningTextBlock::builder()
                        .text(text)
                        .set_signature(signature.clone())
                        .build()
                        .map_err(invalid)?,
                ))
            }
        };

        blocks.push(block);
        if part.cache_control().is_some() {
            blocks.push(ContentBlock::CachePoint(cache_point()?));
        }
    }

    Ok(blocks)
}

fn image_block(source: &ImageSource) -> Result<ImageBlock, LlmError> {
    let ImageSource::Base64 { media_type, data } = source else {
        return Err(LlmError::unsupported("bedrock", "vision_url"));
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| LlmError::InvalidRequest(format!("image data is not valid base64: {e}")))?;

    ImageBlock::builder()
        .format(ImageFormat::from(image_format(media_type)))
        .source(aws_sdk_bedrockruntime::types::ImageSource::Bytes(Blob::new(bytes)))
        .build()
        .map_err(invalid)
}

/// Text that parses as a JSON object is sent as a document
fn tool_result_block(part: &ContentPart) -> Result<Option<ToolResultContentBlock>, LlmError> {
    let block = match part {
        ContentPart::Text { text, .. } => match serde_json::from_str::<Value>(text) {
            Ok(value) if value.is_object() => ToolResultContentBlock::Json(value_to_document(&value)),
            _ => ToolResultContentBlock::Text(text.clone()),
        },
        ContentPart::Image { source, .. } => ToolResultContentBlock::Image(image_block(source)?),
        _ => {
            tracing::warn!("dropping unsupported part inside tool result");
            return Ok(None);
        }
    };

    Ok(Some(block))
}

fn tool_config(req: &CompletionRequest) -> Result<Option<ToolConfiguration>, LlmError> {
    if req.tools.is_empty() {
        return Ok(None);
    }

    let mut builder = ToolConfiguration::builder();
    for tool in &req.tools {
        let spec = ToolSpecification::builder()
            .name(&tool.name)
            .set_description(tool.description.clone())
            .input_schema(ToolInputSchema::Json(value_to_document(&tool.parameters)))
            .build()
            .map_err(invalid)?;
        builder = builder.tools(Tool::ToolSpec(spec));
        if tool.cache_control.is_some() {
            builder = builder.tools(Tool::CachePoint(cache_point()?));
        }
    }

    let choice = match &req.tool_choice {
        None | Some(ToolChoice::Auto | ToolChoice::None) => None,
        Some(ToolChoice::Any) => Some(BedrockToolChoice::Any(AnyToolChoice::builder().build())),
        Some(ToolChoice::Tool { name }) => Some(BedrockToolChoice::Tool(
            SpecificToolChoice::builder().name(name).build().map_err(invalid)?,
        )),
    };
    let choice = choice.or_else(|| {
        req.tool_choice
            .is_some()
            .then(|| BedrockToolChoice::Auto(AutoToolChoice::builder().build()))
    });

    builder.set_tool_choice(choice).build().map(Some).map_err(invalid)
}

/// Canonical parts of a Converse output message, in order
pub fn message_parts(message: &BedrockMessage) -> Vec<ContentPart> {
    let parts = message
        .content()
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(text) => Some(ContentPart::text(text.clone())),
            ContentBlock::ToolUse(tool_use) => Some(ContentPart::ToolUse {
                id: tool_use.tool_use_id().to_owned(),
                name: tool_use.name().to_owned(),
                input: document_to_value(tool_use.input()),
            }),
            ContentBlock::ReasoningContent(ReasoningContentBlock::ReasoningText(reasoning)) => {
                Some(ContentPart::Thinking {
                    text: reasoning.text().to_owned(),
                    signature: reasoning.signature().map(ToOwned::to_owned),
                })
            }
            _ => {
                tracing::warn!("dropping converse output block without a canonical form");
                None
            }
        })
        .collect();

    reconcile(parts)
}

// -- Streaming --

/// SDK stream output reduced to what the decoder acts on
#[derive(Debug, Clone, PartialEq)]
pub enum ConverseChunk {
    MessageStart,
    BlockStart { index: u32, id: String, name: String },
    Delta { index: u32, delta: BlockDelta },
    BlockStop { index: u32 },
    MessageStop { reason: StopReason },
    Metadata { usage: Usage },
    Ignored,
}

fn block_index(index: i32) -> u32 {
    u32::try_from(index).unwrap_or_default()
}

impl From<ConverseStreamOutput> for ConverseChunk {
    fn from(output: ConverseStreamOutput) -> Self {
        match output {
            ConverseStreamOutput::MessageStart(_) => Self::MessageStart,
            ConverseStreamOutput::ContentBlockStart(start) => match start.start() {
                Some(ContentBlockStart::ToolUse(tool)) => Self::BlockStart {
                    index: block_index(start.content_block_index()),
                    id: tool.tool_use_id().to_owned(),
                    name: tool.name().to_owned(),
                },
                _ => Self::Ignored,
            },
            ConverseStreamOutput::ContentBlockDelta(event) => {
                let delta = match event.delta() {
                    Some(ContentBlockDelta::Text(text)) => BlockDelta::Text(text.clone()),
                    Some(ContentBlockDelta::ToolUse(tool)) => BlockDelta::ToolArgs(tool.input().to_owned()),
                    Some(ContentBlockDelta::ReasoningContent(ReasoningContentBlockDelta::Text(text))) => {
                        BlockDelta::Thinking(text.clone())
                    }
                    Some(ContentBlockDelta::ReasoningContent(ReasoningContentBlockDelta::Signature(signature))) => {
                        BlockDelta::Signature(signature.clone())
                    }
                    _ => {
                        tracing::warn!("dropping converse delta without a canonical form");
                        return Self::Ignored;
                    }
                };
                Self::Delta {
                    index: block_index(event.content_block_index()),
                    delta,
                }
            }
            ConverseStreamOutput::ContentBlockStop(stop) => Self::BlockStop {
                index: block_index(stop.content_block_index()),
            },
            ConverseStreamOutput::MessageStop(stop) => Self::MessageStop {
                reason: stop_reason(stop.stop_reason()),
            },
            ConverseStreamOutput::Metadata(metadata) => Self::Metadata {
                usage: metadata.usage().map(Usage::from).unwrap_or_default(),
            },
            _ => {
                tracing::warn!("dropping unknown converse stream event");
                Self::Ignored
            }
        }
    }
}

/// Decodes `ConverseStream` output
///
/// Text and reasoning blocks have no start event, so they are opened by
/// their first delta. Usage arrives in the metadata event after
/// `messageStop`, which is where the canonical `MessageStop` is emitted.
pub struct BedrockStreamDecoder {
    model: String,
    open: HashMap<u32, BlockKind>,
    closed: HashSet<u32>,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl BedrockStreamDecoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            open: HashMap::new(),
            closed: HashSet::new(),
            stop_reason: None,
            finished: false,
        }
    }

    pub fn chunk(&mut self, chunk: ConverseChunk) -> Vec<StreamEvent> {
        match chunk {
            ConverseChunk::MessageStart => vec![StreamEvent::MessageStart {
                id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
                model: self.model.clone(),
            }],
            ConverseChunk::BlockStart { index, id, name } => {
                let kind = BlockKind::ToolUse { id, name };
                self.open.insert(index, kind.clone());
                vec![StreamEvent::ContentBlockStart { index, kind }]
            }
            ConverseChunk::Delta { index, delta } => {
                let mut out = Vec::with_capacity(2);
                if !self.open.contains_key(&index) && !self.closed.contains(&index) {
                    let kind = match delta {
                        BlockDelta::Thinking(_) | BlockDelta::Signature(_) => BlockKind::Thinking,
                        _ => BlockKind::Text,
                    };
                    self.open.insert(index, kind.clone());
                    out.push(StreamEvent::ContentBlockStart { index, kind });
                }
                out.push(StreamEvent::ContentBlockDelta { index, delta });
                out
            }
            ConverseChunk::BlockStop { index } => {
                if self.open.remove(&index).is_some() {
                    self.closed.insert(index);
                    vec![StreamEvent::ContentBlockStop { index }]
                } else {
                    Vec::new()
                }
            }
            ConverseChunk::MessageStop { reason } => {
                self.stop_reason = Some(reason);
                Vec::new()
            }
            ConverseChunk::Metadata { usage } => {
                self.finished = true;
                vec![StreamEvent::MessageStop {
                    stop_reason: self.stop_reason,
                    usage,
                }]
            }
            ConverseChunk::Ignored => Vec::new(),
        }
    }
}

impl StreamDecoder for BedrockStreamDecoder {
    type Chunk = ConverseChunk;

    fn decode(&mut self, chunk: ConverseChunk) -> Result<Vec<StreamEvent>, LlmError> {
        Ok(self.chunk(chunk))
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        match self.stop_reason {
            Some(reason) if !self.finished => {
                self.finished = true;
                vec![StreamEvent::MessageStop {
                    stop_reason: Some(reason),
                    usage: Usage::default(),
                }]
            }
            _ => Vec::new(),
        }
    }
}

/// Encodes canonical events as `ConverseStream` events
///
/// Each output pair is the `:event-type` header value and its JSON payload.
/// Text and reasoning blocks get no start event, matching the upstream
/// service; the stop reason and usage are split across `messageStop` and
/// `metadata`.
pub struct ConverseStreamEncoder {
    started: Instant,
}

impl ConverseStreamEncoder {
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Vec<(&'static str, Value)> {
        match event {
            StreamEvent::MessageStart { .. } => vec![("messageStart", json!({"role": "assistant"}))],
            StreamEvent::ContentBlockStart {
                index,
                kind: BlockKind::ToolUse { id, name },
            } => vec![(
                "contentBlockStart",
                json!({"contentBlockIndex": index, "start": {"toolUse": {"toolUseId": id, "name": name}}}),
            )],
            StreamEvent::ContentBlockStart { .. } => Vec::new(),
            StreamEvent::ContentBlockDelta { index, delta } => {
                let delta = match delta {
                    BlockDelta::Text(text) => json!({"text": text}),
                    BlockDelta::ToolArgs(args) => json!({"toolUse": {"input": args}}),
                    BlockDelta::Thinking(text) => json!({"reasoningContent": {"text": text}}),
                    BlockDelta::Signature(signature) => json!({"reasoningContent": {"signature": signature}}),
                };
                vec![("contentBlockDelta", json!({"contentBlockIndex": index, "delta": delta}))]
            }
            StreamEvent::ContentBlockStop { index } => {
                vec![("contentBlockStop", json!({"contentBlockIndex": index}))]
            }
            StreamEvent::MessageStop { stop_reason, usage } => {
                let latency_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
                vec![
                    (
                        "messageStop",
                        json!({"stopReason": stop_reason_str(stop_reason.unwrap_or(StopReason::EndTurn))}),
                    ),
                    (
                        "metadata",
                        json!({"usage": ConverseUsage::from(usage), "metrics": {"latencyMs": latency_ms}}),
                    ),
                ]
            }
        }
    }
}

impl Default for ConverseStreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: Value) -> CompletionRequest {
        let wire: ConverseRequest = serde_json::from_value(body).unwrap();
        CompletionRequest::try_from(wire).unwrap()
    }

    #[test]
    fn converse_json_maps_system_tools_and_cache_points() {
        let req = request(json!({
            "system": [{"text": "You are terse."}, {"cachePoint": {"type": "default"}}],
            "messages": [
                {"role": "user", "content": [{"text": "Weather?"}]},
                {"role": "assistant", "content": [{"toolUse": {"toolUseId": "t1", "name": "weather", "input": {"city": "Oslo"}}}]},
                {"role": "user", "content": [{"toolResult": {"toolUseId": "t1", "content": [{"json": {"temp": 3}}], "status": "error"}}]}
            ],
            "inferenceConfig": {"maxTokens": 256, "temperature": 0.5},
            "toolConfig": {
                "tools": [{"toolSpec": {"name": "weather", "inputSchema": {"json": {"type": "object"}}}}],
                "toolChoice": {"any": {}}
            },
            "additionalModelRequestFields": {"thinking": {"type": "enabled", "budget_tokens": 2048}}
        }));

        assert_eq!(req.messages[0].content[0].cache_control(), Some(&CacheControl::ephemeral()));
        assert_eq!(req.tool_choice, Some(ToolChoice::Any));
        assert_eq!(req.params.max_tokens, Some(256));
        assert_eq!(req.thinking.and_then(|t| t.budget_tokens), Some(2048));
        assert!(matches!(
            &req.messages[3].content[0],
            ContentPart::ToolResult { content, status: ToolResultStatus::Error, .. } if content == &vec![ContentPart::text(r#"{"temp":3}"#)]
        ));
    }

    #[test]
    fn outbound_merges_tool_results_and_places_cache_points() {
        let req = CompletionRequest::new(
            "anthropic.claude-3-5-sonnet",
            vec![
                Message {
                    role: Role::System,
                    content: vec![ContentPart::Text {
                        text: "Cached prefix".to_owned(),
                        cache_control: Some(CacheControl::ephemeral()),
                    }],
                },
                Message::text(Role::User, "hi"),
                Message {
                    role: Role::Tool,
                    content: vec![ContentPart::ToolResult {
                        tool_use_id: "t1".to_owned(),
                        content: vec![ContentPart::text("plain text")],
                        status: ToolResultStatus::Success,
                        cache_control: None,
                    }],
                },
            ],
        );

        let input = ConverseInput::try_from(&req).unwrap();
        assert_eq!(input.system.len(), 2);
        assert!(matches!(input.system[1], SystemContentBlock::CachePoint(_)));
        assert_eq!(input.messages.len(), 1);
        assert_eq!(input.messages[0].content().len(), 2);
        assert!(input.tool_config.is_none());
    }

    #[test]
    fn tool_result_images_reach_the_sdk() {
        let req = request(json!({
            "messages": [
                {"role": "assistant", "content": [{"toolUse": {"toolUseId": "t1", "name": "screenshot", "input": {}}}]},
                {"role": "user", "content": [{"toolResult": {"toolUseId": "t1", "content": [
                    {"text": "Captured."},
                    {"image": {"format": "png", "source": {"bytes": "iVBORw0KGgo="}}}
                ]}}]}
            ]
        }));

        let ContentPart::ToolResult { content, .. } = &req.messages[1].content[0] else {
            panic!("expected tool result");
        };
        assert!(matches!(
            &content[1],
            ContentPart::Image { source: ImageSource::Base64 { media_type, .. }, .. } if media_type == "image/png"
        ));

        let input = ConverseInput::try_from(&req).unwrap();
        let ContentBlock::ToolResult(result) = &input.messages[1].content()[0] else {
            panic!("expected tool result block");
        };
        assert!(matches!(result.content()[0], ToolResultContentBlock::Text(ref text) if text == "Captured."));
        assert!(matches!(result.content()[1], ToolResultContentBlock::Image(_)));
    }

    #[test]
    fn url_images_are_refused() {
        let req = CompletionRequest::new(
            "m",
            vec![Message {
                role: Role::User,
                content: vec![ContentPart::Image {
                    source: ImageSource::Url {
                        url: "https://example.com/a.png".to_owned(),
                    },
                    cache_control: None,
                }],
            }],
        );

        let err = ConverseInput::try_from(&req).unwrap_err();
        assert!(matches!(err, LlmError::UnsupportedCapability { .. }));
    }

    #[test]
    fn thinking_moves_to_additional_fields() {
        let mut req = CompletionRequest::new("m", vec![Message::text(Role::User, "think")]);
        req.params.temperature = Some(0.3);
        req.thinking = Some(ThinkingConfig {
            enabled: true,
            budget_tokens: Some(2_000),
        });

        let input = ConverseInput::try_from(&req).unwrap();
        assert_eq!(input.inference_config.temperature(), None);
        let extra = document_to_value(&input.additional_fields.unwrap());
        assert_eq!(extra, json!({"thinking": {"type": "enabled", "budget_tokens": 2000}}));
    }

    #[test]
    fn documents_round_trip_numbers() {
        let value = json!({"n": -3, "p": 7, "f": 1.5, "list": [true, null, "x"]});
        assert_eq!(document_to_value(&value_to_document(&value)), value);
    }

    #[test]
    fn decoder_opens_text_blocks_and_waits_for_usage() {
        let mut decoder = BedrockStreamDecoder::new("claude");
        let chunks = [
            ConverseChunk::MessageStart,
            ConverseChunk::Delta {
                index: 0,
                delta: BlockDelta::Text("Hi".to_owned()),
            },
            ConverseChunk::BlockStop { index: 0 },
            ConverseChunk::BlockStart {
                index: 1,
                id: "t1".to_owned(),
                name: "f".to_owned(),
            },
            ConverseChunk::Delta {
                index: 1,
                delta: BlockDelta::ToolArgs("{}".to_owned()),
            },
            ConverseChunk::BlockStop { index: 1 },
            ConverseChunk::MessageStop {
                reason: StopReason::ToolUse,
            },
        ];

        let events: Vec<_> = chunks.into_iter().flat_map(|chunk| decoder.chunk(chunk)).collect();
        assert_eq!(events.len(), 7);
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::MessageStop { .. })));

        let usage = Usage {
            input_tokens: 5,
            output_tokens: 2,
            ..Usage::default()
        };
        let end = decoder.chunk(ConverseChunk::Metadata { usage });
        assert_eq!(
            end,
            vec![StreamEvent::MessageStop {
                stop_reason: Some(StopReason::ToolUse),
                usage,
            }]
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn decoder_finishes_without_metadata() {
        let mut decoder = BedrockStreamDecoder::new("claude");
        decoder.chunk(ConverseChunk::MessageStop {
            reason: StopReason::EndTurn,
        });
        assert_eq!(decoder.finish().len(), 1);
    }

    #[test]
    fn converse_response_subtracts_cached_tokens() {
        let resp = CompletionResponse {
            id: "r".to_owned(),
            model: "m".to_owned(),
            content: vec![ContentPart::text("ok")],
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 5,
                cache_read_tokens: 80,
                cache_write_tokens: 0,
            },
        };

        let wire = converse_response(&resp, 12);
        assert_eq!(wire.usage.input_tokens, 20);
        assert_eq!(wire.usage.cache_read_input_tokens, Some(80));
        assert_eq!(wire.stop_reason, "end_turn");
    }

    #[test]
    fn stream_encoder_splits_stop_and_usage() {
        let mut encoder = ConverseStreamEncoder::new();

        assert!(
            encoder
                .encode(&StreamEvent::ContentBlockStart {
                    index: 0,
                    kind: BlockKind::Text
                })
                .is_empty()
        );

        let delta = encoder.encode(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Text("hi".to_owned()),
        });
        assert_eq!(delta[0].0, "contentBlockDelta");
        assert_eq!(delta[0].1["delta"]["text"], "hi");

        let stop = encoder.encode(&StreamEvent::MessageStop {
            stop_reason: Some(StopReason::ToolUse),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 2,
                ..Usage::default()
            },
        });
        assert_eq!(stop[0].1["stopReason"], "tool_use");
        assert_eq!(stop[1].0, "metadata");
        assert_eq!(stop[1].1["usage"]["totalTokens"], 12);
    }
}
