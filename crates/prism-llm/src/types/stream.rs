use serde::{Deserialize, Serialize};

use super::response::{StopReason, Usage};

/// Normalized streaming event
///
/// Within one stream block indices are introduced in increasing order and
/// every `ContentBlockStart` is matched by a `ContentBlockStop` before
/// `MessageStop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        id: String,
        model: String,
    },
    ContentBlockStart {
        index: u32,
        kind: BlockKind,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageStop {
        stop_reason: Option<StopReason>,
        usage: Usage,
    },
}

/// What a content block carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    ToolUse { id: String, name: String },
    Thinking,
}

/// Incremental payload for an open block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BlockDelta {
    Text(String),
    /// Fragment of the tool input JSON
    ToolArgs(String),
    Thinking(String),
    /// Thinking signature, sent once near the end of a thinking block
    Signature(String),
}

impl BlockDelta {
    /// Block kind this delta may appear in, ignoring tool identity
    pub const fn fits(&self, kind: &BlockKind) -> bool {
        matches!(
            (self, kind),
            (Self::Text(_), BlockKind::Text)
                | (Self::ToolArgs(_), BlockKind::ToolUse { .. })
                | (Self::Thinking(_) | Self::Signature(_), BlockKind::Thinking)
        )
    }
}
