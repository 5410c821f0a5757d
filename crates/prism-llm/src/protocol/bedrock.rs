//! Bedrock Converse JSON wire format types
//!
//! Outbound calls go through `aws-sdk-bedrockruntime`; these types only cover
//! callers that speak the Converse REST shape to the gateway. Content blocks
//! are single-key objects, so the enums are externally tagged.

use serde::{Deserialize, Serialize};

/// `POST /model/{modelId}/converse` body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseRequest {
    #[serde(default)]
    pub messages: Vec<ConverseMessage>,
    #[serde(default)]
    pub system: Vec<ConverseSystemBlock>,
    #[serde(default)]
    pub inference_config: Option<ConverseInferenceConfig>,
    #[serde(default)]
    pub tool_config: Option<ConverseToolConfig>,
    /// Model-specific fields such as Anthropic `thinking`
    #[serde(default)]
    pub additional_model_request_fields: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverseMessage {
    /// `user` or `assistant`
    pub role: String,
    pub content: Vec<ConverseContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConverseContentBlock {
    Text(String),
    Image(ConverseImage),
    ToolUse(ConverseToolUse),
    ToolResult(ConverseToolResult),
    ReasoningContent(ConverseReasoning),
    CachePoint(ConverseCachePoint),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverseImage {
    /// `png`, `jpeg`, `gif`, or `webp`
    pub format: String,
    pub source: ConverseImageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverseImageSource {
    /// Base64-encoded image bytes
    pub bytes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseToolResult {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: Vec<ConverseToolResultContent>,
    /// `success` or `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConverseToolResultContent {
    Text(String),
    Json(serde_json::Value),
    Image(ConverseImage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseReasoning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_text: Option<ConverseReasoningText>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverseReasoningText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverseCachePoint {
    /// Always `default`
    #[serde(rename = "type")]
    pub cache_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConverseSystemBlock {
    Text(String),
    CachePoint(ConverseCachePoint),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseInferenceConfig {
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseToolConfig {
    #[serde(default)]
    pub tools: Vec<ConverseTool>,
    #[serde(default)]
    pub tool_choice: Option<ConverseToolChoice>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConverseTool {
    ToolSpec(ConverseToolSpec),
    CachePoint(ConverseCachePoint),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: ConverseInputSchema,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConverseInputSchema {
    pub json: serde_json::Value,
}

/// One of `auto`, `any`, or `tool` is set
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConverseToolChoice {
    #[serde(default)]
    pub auto: Option<serde_json::Value>,
    #[serde(default)]
    pub any: Option<serde_json::Value>,
    #[serde(default)]
    pub tool: Option<ConverseSpecificTool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConverseSpecificTool {
    pub name: String,
}

/// Converse response body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseResponse {
    pub output: ConverseOutput,
    /// `end_turn`, `tool_use`, `max_tokens`, `stop_sequence`, or `content_filtered`
    pub stop_reason: String,
    pub usage: ConverseUsage,
    pub metrics: ConverseMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConverseOutput {
    pub message: ConverseMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_input_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseMetrics {
    pub latency_ms: u64,
}
