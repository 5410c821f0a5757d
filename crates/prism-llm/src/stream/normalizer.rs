use std::collections::BTreeMap;

use crate::types::{BlockDelta, BlockKind, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Started,
    Ended,
}

/// Per-stream state machine enforcing the normalized event grammar
///
/// `Idle -> MessageStarted -> (block open/close)* -> MessageEnded`. Events
/// that would break the grammar are dropped with a warning; missing starts
/// and stops are synthesized so that callers always see a well-formed
/// sequence.
pub struct Normalizer {
    provider: String,
    model: String,
    phase: Phase,
    open: BTreeMap<u32, BlockKind>,
    highest: Option<u32>,
}

impl Normalizer {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            phase: Phase::Idle,
            open: BTreeMap::new(),
            highest: None,
        }
    }

    /// Whether `MessageStop` has been emitted
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Ended
    }

    /// Feed one decoded event, returning the events to emit in order
    pub fn push(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let mut out = Vec::new();

        if self.phase == Phase::Ended {
            tracing::debug!(provider = %self.provider, "ignoring event after message stop");
            return out;
        }

        if self.phase == Phase::Idle {
            self.phase = Phase::Started;

            if let StreamEvent::MessageStart { .. } = event {
                out.push(event);
                return out;
            }

            out.push(StreamEvent::MessageStart {
                id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
                model: self.model.clone(),
            });
        }

        match event {
            StreamEvent::MessageStart { .. } => {
                tracing::warn!(provider = %self.provider, "dropping duplicate message start");
            }
            StreamEvent::ContentBlockStart { index, kind } => {
                if self.highest.is_some_and(|highest| index <= highest) {
                    tracing::warn!(provider = %self.provider, index, "dropping block start with a reused index");
                } else {
                    self.open_block(index, kind, &mut out);
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => self.delta(index, delta, &mut out),
            StreamEvent::ContentBlockStop { index } => {
                if self.open.remove(&index).is_some() {
                    out.push(StreamEvent::ContentBlockStop { index });
                } else {
                    tracing::warn!(provider = %self.provider, index, "dropping stop for a block that is not open");
                }
            }
            StreamEvent::MessageStop { stop_reason, usage } => {
                self.close_all(&mut out);
                self.phase = Phase::Ended;
                out.push(StreamEvent::MessageStop { stop_reason, usage });
            }
        }

        out
    }

    fn open_block(&mut self, index: u32, kind: BlockKind, out: &mut Vec<StreamEvent>) {
        self.highest = Some(index);
        self.open.insert(index, kind.clone());
        out.push(StreamEvent::ContentBlockStart { index, kind });
    }

    fn delta(&mut self, index: u32, delta: BlockDelta, out: &mut Vec<StreamEvent>) {
        if let Some(kind) = self.open.get(&index) {
            if delta.fits(kind) {
                out.push(StreamEvent::ContentBlockDelta { index, delta });
            } else {
                tracing::warn!(provider = %self.provider, index, "dropping delta that does not match its block kind");
            }
            return;
        }

        if self.highest.is_some_and(|highest| index <= highest) {
            tracing::warn!(provider = %self.provider, index, "dropping delta for a closed block");
            return;
        }

        let kind = match delta {
            BlockDelta::Text(_) => BlockKind::Text,
            BlockDelta::Thinking(_) | BlockDelta::Signature(_) => BlockKind::Thinking,
            BlockDelta::ToolArgs(_) => {
                tracing::warn!(provider = %self.provider, index, "dropping tool arguments for an unannounced tool call");
                return;
            }
        };

        self.open_block(index, kind, out);
        out.push(StreamEvent::ContentBlockDelta { index, delta });
    }

    fn close_all(&mut self, out: &mut Vec<StreamEvent>) {
        for index in std::mem::take(&mut self.open).into_keys() {
            out.push(StreamEvent::ContentBlockStop { index });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StopReason, Usage};

    fn text_delta(index: u32, text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::Text(text.to_owned()),
        }
    }

    fn stop() -> StreamEvent {
        StreamEvent::MessageStop {
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage::default(),
        }
    }

    #[test]
    fn synthesizes_message_and_block_boundaries() {
        let mut normalizer = Normalizer::new("openai", "gpt-4o");
        let mut events = normalizer.push(text_delta(0, "Hi"));
        events.extend(normalizer.push(stop()));

        assert!(matches!(events[0], StreamEvent::MessageStart { ref model, .. } if model == "gpt-4o"));
        assert_eq!(
            events[1..],
            [
                StreamEvent::ContentBlockStart {
                    index: 0,
                    kind: BlockKind::Text
                },
                text_delta(0, "Hi"),
                StreamEvent::ContentBlockStop { index: 0 },
                stop(),
            ]
        );
        assert!(normalizer.is_finished());
    }

    #[test]
    fn reused_index_and_stray_stop_are_dropped() {
        let mut normalizer = Normalizer::new("anthropic", "claude");
        normalizer.push(StreamEvent::MessageStart {
            id: "msg_1".to_owned(),
            model: "claude".to_owned(),
        });
        normalizer.push(StreamEvent::ContentBlockStart {
            index: 0,
            kind: BlockKind::Text,
        });
        normalizer.push(StreamEvent::ContentBlockStop { index: 0 });

        assert!(
            normalizer
                .push(StreamEvent::ContentBlockStart {
                    index: 0,
                    kind: BlockKind::Text
                })
                .is_empty()
        );
        assert!(normalizer.push(StreamEvent::ContentBlockStop { index: 3 }).is_empty());
        assert!(normalizer.push(text_delta(0, "late")).is_empty());
    }

    #[test]
    fn mismatched_delta_is_dropped() {
        let mut normalizer = Normalizer::new("anthropic", "claude");
        normalizer.push(StreamEvent::ContentBlockStart {
            index: 0,
            kind: BlockKind::Thinking,
        });

        assert!(normalizer.push(text_delta(0, "oops")).is_empty());
        assert_eq!(
            normalizer.push(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Signature("sig".to_owned())
            }),
            vec![StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Signature("sig".to_owned())
            }]
        );
    }

    #[test]
    fn orphan_tool_arguments_are_dropped() {
        let mut normalizer = Normalizer::new("openai", "gpt-4o");
        let events = normalizer.push(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::ToolArgs("{}".to_owned()),
        });

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
    }

    #[test]
    fn events_after_stop_are_ignored() {
        let mut normalizer = Normalizer::new("google", "gemini");
        normalizer.push(stop());

        assert!(normalizer.push(text_delta(0, "extra")).is_empty());
        assert!(normalizer.push(stop()).is_empty());
    }
}
