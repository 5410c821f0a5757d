//! Bidirectional conversion between canonical types and wire formats
//!
//! Each submodule handles one protocol: inbound requests from callers,
//! outbound requests to upstreams, responses in both directions, a stream
//! decoder for upstream chunks, and a stream encoder for callers.
//! [`policy`] runs before any of them and fits the request to its target.

pub mod anthropic;
pub mod bedrock;
pub mod google;
pub mod lifecycle;
pub mod openai;
pub mod policy;
pub mod responses;

use serde_json::Value;

use crate::types::{BlockKind, StreamEvent, ThinkingConfig};

/// Budget used when thinking is enabled without an explicit budget
pub const DEFAULT_THINKING_BUDGET: u32 = 4_096;

/// Seconds since the Unix epoch, for `created` fields
pub(crate) fn unix_now() -> u64 {
    u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or_default()
}

/// Unix seconds from an RFC 3339 timestamp, `None` when unparseable
pub(crate) fn unix_seconds(timestamp: &str) -> Option<i64> {
    timestamp.parse::<jiff::Timestamp>().ok().map(jiff::Timestamp::as_second)
}

/// Map an `OpenAI` reasoning effort onto a thinking budget
pub fn thinking_from_effort(effort: &str) -> Option<ThinkingConfig> {
    let budget = match effort {
        "none" => return None,
        "minimal" | "low" => 1_024,
        "high" => 24_576,
        _ => 8_192,
    };

    Some(ThinkingConfig {
        enabled: true,
        budget_tokens: Some(budget),
    })
}

/// Map a thinking budget onto an `OpenAI` reasoning effort
pub fn effort_for_budget(budget: Option<u32>) -> &'static str {
    match budget {
        Some(budget) if budget <= 2_048 => "low",
        Some(budget) if budget > 16_384 => "high",
        _ => "medium",
    }
}

/// Encode a canonical tool input as an argument string
///
/// Raw text that never parsed as JSON is sent back verbatim.
pub(crate) fn arguments_string(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Block boundaries for protocols that stream flat deltas
///
/// Opening a block closes the previous one, and indices are handed out in
/// increasing order.
#[derive(Debug, Default)]
pub(crate) struct BlockCursor {
    next: u32,
    open: Option<(u32, BlockKind)>,
}

impl BlockCursor {
    /// Index of the open block if it has `kind`, opening a new one otherwise
    pub(crate) fn ensure(&mut self, kind: &BlockKind, out: &mut Vec<StreamEvent>) -> u32 {
        if let Some((index, open)) = &self.open
            && open == kind
        {
            return *index;
        }

        self.start(kind.clone(), out)
    }

    /// Always open a new block
    pub(crate) fn start(&mut self, kind: BlockKind, out: &mut Vec<StreamEvent>) -> u32 {
        let index = self.start_detached(kind.clone(), out);
        self.open = Some((index, kind));
        index
    }

    /// Open a new block that the caller closes itself
    ///
    /// The cursor's own block is closed first and the detached block does
    /// not become current, so later `ensure` calls never reuse it.
    pub(crate) fn start_detached(&mut self, kind: BlockKind, out: &mut Vec<StreamEvent>) -> u32 {
        self.close(out);

        let index = self.next;
        self.next += 1;
        out.push(StreamEvent::ContentBlockStart { index, kind });
        index
    }

    pub(crate) fn close(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some((index, _)) = self.open.take() {
            out.push(StreamEvent::ContentBlockStop { index });
        }
    }

    pub(crate) fn current(&self) -> Option<u32> {
        self.open.as_ref().map(|(index, _)| *index)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn effort_and_budget_round_trip() {
        for effort in ["low", "medium", "high"] {
            let thinking = thinking_from_effort(effort).unwrap();
            assert_eq!(effort_for_budget(thinking.budget_tokens), effort);
        }
        assert!(thinking_from_effort("none").is_none());
    }

    #[test]
    fn cursor_reuses_matching_block() {
        let mut cursor = BlockCursor::default();
        let mut out = Vec::new();

        assert_eq!(cursor.ensure(&BlockKind::Text, &mut out), 0);
        assert_eq!(cursor.ensure(&BlockKind::Text, &mut out), 0);
        assert_eq!(cursor.ensure(&BlockKind::Thinking, &mut out), 1);
        cursor.close(&mut out);

        assert_eq!(
            out,
            vec![
                StreamEvent::ContentBlockStart {
                    index: 0,
                    kind: BlockKind::Text
                },
                StreamEvent::ContentBlockStop { index: 0 },
                StreamEvent::ContentBlockStart {
                    index: 1,
                    kind: BlockKind::Thinking
                },
                StreamEvent::ContentBlockStop { index: 1 },
            ]
        );
    }

    #[test]
    fn raw_arguments_are_sent_verbatim() {
        assert_eq!(arguments_string(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(arguments_string(&json!("{broken")), "{broken");
    }
}
