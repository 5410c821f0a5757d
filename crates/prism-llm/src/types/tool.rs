use serde::{Deserialize, Serialize};

/// Definition of a tool the model can call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool input
    pub parameters: serde_json::Value,
    /// Cache checkpoint after this tool definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<super::CacheControl>,
}

/// How the model should select tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides whether to call tools
    Auto,
    /// Model must not call tools
    None,
    /// Model must call at least one tool
    Any,
    /// Model must call the named tool
    Tool { name: String },
}

impl ToolChoice {
    /// Whether this choice forces a tool call
    pub const fn is_forced(&self) -> bool {
        matches!(self, Self::Any | Self::Tool { .. })
    }
}
