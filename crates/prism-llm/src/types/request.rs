use serde::{Deserialize, Serialize};

use super::message::{ContentPart, Message, Role};
use super::tool::{ToolChoice, ToolSpec};

/// Parameters controlling text generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Extended reasoning settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    pub enabled: bool,
    /// Token budget for reasoning; providers without budgets map it to an effort level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

/// Canonical completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model string as sent by the caller; replaced by the upstream model id after dispatch
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub params: CompletionParams,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// `Some(false)` asks the provider for at most one tool call per turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    /// Request with the given messages and default parameters
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            params: CompletionParams::default(),
            tools: Vec::new(),
            tool_choice: None,
            parallel_tool_calls: None,
            thinking: None,
            stream: false,
        }
    }

    /// Iterate every content part across all messages
    pub fn parts(&self) -> impl Iterator<Item = &ContentPart> {
        self.messages.iter().flat_map(|m| m.content.iter())
    }

    /// Whether thinking was explicitly requested
    pub fn wants_thinking(&self) -> bool {
        self.thinking.is_some_and(|t| t.enabled)
    }

    /// Split leading and interleaved system messages from the conversation
    ///
    /// Returns the system text parts in order and the remaining messages.
    pub fn split_system(&self) -> (Vec<ContentPart>, Vec<&Message>) {
        let mut system = Vec::new();
        let mut rest = Vec::new();

        for message in &self.messages {
            if message.role == Role::System {
                system.extend(message.content.iter().cloned());
            } else {
                rest.push(message);
            }
        }

        (system, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_system_collects_every_system_message() {
        let request = CompletionRequest::new(
            "gpt-4o",
            vec![
                Message::text(Role::System, "Be brief."),
                Message::text(Role::User, "Hi"),
                Message::text(Role::System, "Answer in French."),
            ],
        );

        let (system, rest) = request.split_system();
        assert_eq!(system.len(), 2);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].role, Role::User);
    }
}
