//! `OpenAI` Responses API wire format types

use serde::{Deserialize, Serialize};

// -- Request types --

/// `POST /v1/responses` body
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    /// A bare string or a list of input items
    pub input: ResponsesInput,
    /// System-level instructions placed before the input
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<ResponsesTool>,
    #[serde(default)]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<ResponsesReasoning>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Items(Vec<ResponsesInputItem>),
}

/// Input item
///
/// Message items may omit `type`, so this is a flat struct rather than a
/// tagged enum.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesInputItem {
    /// `message`, `function_call`, `function_call_output`, or `reasoning`
    #[serde(rename = "type", default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<ResponsesContent>,
    /// Correlates a `function_call` with its `function_call_output`
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// JSON-encoded function arguments
    #[serde(default)]
    pub arguments: Option<String>,
    /// Function output
    #[serde(default)]
    pub output: Option<String>,
    /// Reasoning summary parts
    #[serde(default)]
    pub summary: Vec<ResponsesSummaryPart>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponsesContent {
    Text(String),
    Parts(Vec<ResponsesContentPart>),
}

/// Content part of an input message
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesContentPart {
    InputText {
        text: String,
    },
    /// Assistant text echoed back from a previous turn
    OutputText {
        text: String,
    },
    InputImage {
        #[serde(default)]
        image_url: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

/// Function tool, flattened compared to chat completions
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesReasoning {
    /// `minimal`, `low`, `medium`, or `high`
    #[serde(default)]
    pub effort: Option<String>,
}

// -- Response types --

/// Response object
#[derive(Debug, Clone, Serialize)]
pub struct ResponsesResponse {
    pub id: String,
    /// Object type (always "response")
    pub object: &'static str,
    pub created_at: u64,
    /// `in_progress`, `completed`, or `incomplete`
    pub status: &'static str,
    pub model: String,
    pub output: Vec<ResponsesOutputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponsesUsage>,
}

/// Output item
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesOutputItem {
    Message {
        id: String,
        status: &'static str,
        role: &'static str,
        content: Vec<ResponsesOutputContent>,
    },
    FunctionCall {
        id: String,
        call_id: String,
        name: String,
        arguments: String,
        status: &'static str,
    },
    Reasoning {
        id: String,
        summary: Vec<ResponsesSummaryPart>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesOutputContent {
    OutputText { text: String, annotations: Vec<serde_json::Value> },
}

/// Reasoning summary text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesSummaryPart {
    /// Always `summary_text`
    #[serde(rename = "type")]
    pub part_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponsesUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub input_tokens_details: ResponsesInputTokensDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponsesInputTokensDetails {
    pub cached_tokens: u32,
}
