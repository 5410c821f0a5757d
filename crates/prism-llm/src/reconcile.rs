//! Tool-call and content-block reconciliation
//!
//! Providers model content as flat arrays, typed unions, or separate
//! channels. Translators hand their native blocks over as canonical parts and
//! this module finishes the job: tool inputs become plain JSON values, missing
//! ids are filled in, and block order is kept exactly as received.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::{
    BlockDelta, BlockKind, CompletionResponse, ContentPart, Message, StopReason, StreamEvent, Usage,
};

/// Normalize native content blocks into an ordered canonical list
///
/// Blocks are never merged or reordered; adjacent text blocks stay separate.
pub fn reconcile(parts: Vec<ContentPart>) -> Vec<ContentPart> {
    let mut reconciled = Vec::with_capacity(parts.len());
    let mut generated = 0usize;

    for part in parts {
        let part = match part {
            ContentPart::ToolUse { id, name, input } => {
                let id = if id.trim().is_empty() {
                    generated += 1;
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    id
                };

                ContentPart::ToolUse {
                    id,
                    name,
                    input: normalize_tool_input(input),
                }
            }
            other => other,
        };

        reconciled.push(part);
    }

    if generated > 0 {
        tracing::debug!(count = generated, "assigned ids to tool calls without one");
    }

    reconciled
}

/// Turn a provider's tool arguments into a JSON value
///
/// Blank strings and `null` become an empty object, JSON strings are parsed,
/// and text that is not JSON is kept verbatim as a string value.
pub fn normalize_tool_input(input: Value) -> Value {
    match input {
        Value::Null => Value::Object(serde_json::Map::new()),
        Value::String(raw) => parse_tool_arguments(&raw),
        other => other,
    }
}

/// Parse accumulated argument text from a stream or a string-typed field
pub fn parse_tool_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "tool arguments are not valid JSON, keeping raw text");
            Value::String(raw.to_owned())
        }
    }
}

/// High-level shape of a model turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseShape {
    /// No content blocks at all, a valid (if unhelpful) response
    Empty,
    /// Content present, no tool calls
    NoToolCall,
    /// At least one tool call
    ToolCalls {
        /// Tool names in emission order
        calls: Vec<String>,
        /// Ids of calls whose arguments were an empty object
        empty_arguments: Vec<String>,
    },
}

/// Distinguish an empty turn, a plain answer, and tool calls
pub fn classify(parts: &[ContentPart]) -> ResponseShape {
    let mut calls = Vec::new();
    let mut empty_arguments = Vec::new();

    for part in parts {
        if let ContentPart::ToolUse { id, name, input } = part {
            calls.push(name.clone());

            if input.as_object().is_some_and(serde_json::Map::is_empty) {
                empty_arguments.push(id.clone());
            }
        }
    }

    if !calls.is_empty() {
        return ResponseShape::ToolCalls { calls, empty_arguments };
    }

    let has_content = parts.iter().any(|part| match part {
        ContentPart::Text { text, .. } | ContentPart::Thinking { text, .. } => !text.is_empty(),
        _ => true,
    });

    if has_content {
        ResponseShape::NoToolCall
    } else {
        ResponseShape::Empty
    }
}

/// Tool calls seen in a conversation, keyed by id
///
/// Correlation is by id value only; a tool result is matched to the call whose
/// id string equals its `tool_use_id`.
#[derive(Debug, Default)]
pub struct ToolCallLedger {
    calls: HashMap<String, String>,
}

impl ToolCallLedger {
    /// Index every tool use in the message history
    pub fn from_messages<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Self {
        let calls = messages
            .into_iter()
            .flat_map(|message| message.content.iter())
            .filter_map(|part| match part {
                ContentPart::ToolUse { id, name, .. } => Some((id.clone(), name.clone())),
                _ => None,
            })
            .collect();

        Self { calls }
    }

    /// Tool name for a call id
    pub fn name_of(&self, tool_use_id: &str) -> Option<&str> {
        self.calls.get(tool_use_id).map(String::as_str)
    }

    /// Tool result ids with no matching call in the history
    pub fn orphaned_results<'a>(&self, messages: impl IntoIterator<Item = &'a Message>) -> Vec<String> {
        messages
            .into_iter()
            .flat_map(|message| message.content.iter())
            .filter_map(|part| match part {
                ContentPart::ToolResult { tool_use_id, .. } if !self.calls.contains_key(tool_use_id) => {
                    Some(tool_use_id.clone())
                }
                _ => None,
            })
            .collect()
    }
}

enum OpenBlock {
    Text(String),
    Thinking { text: String, signature: Option<String> },
    ToolUse { id: String, name: String, arguments: String },
}

/// Folds a normalized event stream into a complete response
///
/// Serves non-streaming completions against `stream_only` targets.
#[derive(Default)]
pub struct StreamAccumulator {
    id: String,
    model: String,
    blocks: Vec<(u32, OpenBlock)>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl StreamAccumulator {
    pub fn push(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { id, model } => {
                self.id.clone_from(id);
                self.model.clone_from(model);
            }
            StreamEvent::ContentBlockStart { index, kind } => {
                let block = match kind {
                    BlockKind::Text => OpenBlock::Text(String::new()),
                    BlockKind::Thinking => OpenBlock::Thinking {
                        text: String::new(),
                        signature: None,
                    },
                    BlockKind::ToolUse { id, name } => OpenBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    },
                };
                self.blocks.push((*index, block));
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let Some((_, block)) = self.blocks.iter_mut().rev().find(|(i, _)| i == index) else {
                    return;
                };

                match (block, delta) {
                    (OpenBlock::Text(text), BlockDelta::Text(fragment))
                    | (OpenBlock::Thinking { text, .. }, BlockDelta::Thinking(fragment))
                    | (OpenBlock::ToolUse { arguments: text, .. }, BlockDelta::ToolArgs(fragment)) => {
                        text.push_str(fragment);
                    }
                    (OpenBlock::Thinking { signature, .. }, BlockDelta::Signature(value)) => {
                        *signature = Some(value.clone());
                    }
                    _ => {}
                }
            }
            StreamEvent::ContentBlockStop { .. } => {}
            StreamEvent::MessageStop { stop_reason, usage } => {
                self.stop_reason = *stop_reason;
                self.usage = *usage;
            }
        }
    }

    /// Finish accumulation, reconciling the collected blocks
    pub fn finish(self) -> CompletionResponse {
        let content = self
            .blocks
            .into_iter()
            .map(|(_, block)| match block {
                OpenBlock::Text(text) => ContentPart::text(text),
                OpenBlock::Thinking { text, signature } => ContentPart::Thinking { text, signature },
                OpenBlock::ToolUse { id, name, arguments } => ContentPart::ToolUse {
                    id,
                    name,
                    input: Value::String(arguments),
                },
            })
            .collect();

        CompletionResponse {
            id: self.id,
            model: self.model,
            content: reconcile(content),
            stop_reason: self.stop_reason,
            usage: self.usage,
        }
    }
}
