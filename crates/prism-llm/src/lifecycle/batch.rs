//! Batch job model and provider status mappings

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::convert::openai::text_completion;
use crate::error::LlmError;
use crate::protocol::anthropic::{AnthropicRequest, AnthropicRequestCounts, AnthropicResponse};
use crate::protocol::openai::{OpenAiRequest, OpenAiResponse, OpenAiTextRequest};
use crate::protocol::responses::ResponsesRequest;
use crate::types::{CompletionRequest, CompletionResponse};

/// Lifecycle of an asynchronous batch job
///
/// `Created -> Validating -> InProgress -> Finalizing -> {Completed | Failed | Expired}`,
/// with `Cancelling -> Cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Created,
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
    Expired,
}

impl BatchStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validating => "validating",
            Self::InProgress => "in_progress",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Expired)
    }

    /// Position along the forward path; cancellation sits after every active state
    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Validating => 1,
            Self::InProgress => 2,
            Self::Finalizing => 3,
            Self::Cancelling => 4,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired => 5,
        }
    }

    /// Whether an observed move from `self` to `next` is legal
    ///
    /// Providers may skip intermediate states but never move backwards, and
    /// a cancelling job can only end.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if self == Self::Cancelling {
            return next.is_terminal();
        }
        if next == Self::Cancelled {
            return true;
        }

        next.rank() > self.rank()
    }

    /// `OpenAI` status strings map one to one
    pub fn from_openai(status: &str) -> Option<Self> {
        Some(match status {
            "validating" => Self::Validating,
            "in_progress" => Self::InProgress,
            "finalizing" => Self::Finalizing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelling" => Self::Cancelling,
            "cancelled" => Self::Cancelled,
            "expired" => Self::Expired,
            _ => return None,
        })
    }

    /// Anthropic reports only three processing states; an ended batch is
    /// classified by its request counts
    pub fn from_anthropic(processing_status: &str, counts: &AnthropicRequestCounts) -> Option<Self> {
        Some(match processing_status {
            "in_progress" => Self::InProgress,
            "canceling" => Self::Cancelling,
            "ended" => {
                let finished = counts.succeeded + counts.errored;
                if finished == 0 && counts.canceled > 0 {
                    Self::Cancelled
                } else if finished == 0 && counts.expired > 0 {
                    Self::Expired
                } else {
                    Self::Completed
                }
            }
            _ => return None,
        })
    }

    pub fn from_gemini(state: &str) -> Option<Self> {
        Some(match state.trim_start_matches("JOB_STATE_").trim_start_matches("BATCH_STATE_") {
            "PENDING" | "QUEUED" => Self::Validating,
            "RUNNING" => Self::InProgress,
            "SUCCEEDED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELLING" => Self::Cancelling,
            "CANCELLED" => Self::Cancelled,
            "EXPIRED" => Self::Expired,
            _ => return None,
        })
    }

    pub fn from_bedrock(status: &str) -> Option<Self> {
        Some(match status {
            "Submitted" | "Validating" => Self::Validating,
            "Scheduled" | "InProgress" => Self::InProgress,
            "Stopping" => Self::Cancelling,
            "Stopped" => Self::Cancelled,
            "Completed" | "PartiallyCompleted" => Self::Completed,
            "Failed" => Self::Failed,
            "Expired" => Self::Expired,
            _ => return None,
        })
    }

    /// Anthropic only distinguishes active, cancelling, and ended
    pub const fn anthropic_processing_status(self) -> &'static str {
        match self {
            Self::Created | Self::Validating | Self::InProgress | Self::Finalizing => "in_progress",
            Self::Cancelling => "canceling",
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired => "ended",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint every request in a batch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchEndpoint {
    #[serde(rename = "/v1/chat/completions")]
    ChatCompletions,
    #[serde(rename = "/v1/embeddings")]
    Embeddings,
    #[serde(rename = "/v1/completions")]
    Completions,
    #[serde(rename = "/v1/responses")]
    Responses,
    #[serde(rename = "/v1/messages")]
    Messages,
}

impl BatchEndpoint {
    pub const fn path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "/v1/chat/completions",
            Self::Embeddings => "/v1/embeddings",
            Self::Completions => "/v1/completions",
            Self::Responses => "/v1/responses",
            Self::Messages => "/v1/messages",
        }
    }

    pub fn parse(path: &str) -> Result<Self, LlmError> {
        Ok(match path {
            "/v1/chat/completions" => Self::ChatCompletions,
            "/v1/embeddings" => Self::Embeddings,
            "/v1/completions" => Self::Completions,
            "/v1/responses" => Self::Responses,
            "/v1/messages" => Self::Messages,
            other => return Err(LlmError::InvalidRequest(format!("unsupported batch endpoint '{other}'"))),
        })
    }
}

/// One request line of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestItem {
    pub custom_id: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    pub body: Value,
}

fn default_method() -> String {
    "POST".to_owned()
}

impl BatchRequestItem {
    /// Canonical form of a generative request line
    ///
    /// The body is read in the wire format of `endpoint`.
    pub fn completion_request(&self, endpoint: BatchEndpoint) -> Result<CompletionRequest, LlmError> {
        let invalid = |e: serde_json::Error| {
            LlmError::InvalidRequest(format!("batch request '{}' has an invalid body: {e}", self.custom_id))
        };
        let body = self.body.clone();

        match endpoint {
            BatchEndpoint::ChatCompletions => {
                CompletionRequest::try_from(serde_json::from_value::<OpenAiRequest>(body).map_err(invalid)?)
            }
            BatchEndpoint::Completions => Ok(CompletionRequest::from(
                serde_json::from_value::<OpenAiTextRequest>(body).map_err(invalid)?,
            )),
            BatchEndpoint::Responses => {
                CompletionRequest::try_from(serde_json::from_value::<ResponsesRequest>(body).map_err(invalid)?)
            }
            BatchEndpoint::Messages => {
                CompletionRequest::try_from(serde_json::from_value::<AnthropicRequest>(body).map_err(invalid)?)
            }
            BatchEndpoint::Embeddings => Err(LlmError::InvalidRequest(
                "embedding batches need a provider with file-backed batches".to_owned(),
            )),
        }
    }
}

/// Response body for a completed generative request, in the endpoint's wire format
pub fn render_completion(endpoint: BatchEndpoint, response: &CompletionResponse) -> Value {
    let rendered = match endpoint {
        BatchEndpoint::Messages => serde_json::to_value(AnthropicResponse::from(response)),
        BatchEndpoint::Completions => serde_json::to_value(text_completion(response)),
        BatchEndpoint::Responses => serde_json::to_value(crate::convert::responses::response_object(response)),
        BatchEndpoint::ChatCompletions | BatchEndpoint::Embeddings => {
            serde_json::to_value(OpenAiResponse::from(response))
        }
    };

    rendered.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to render batch result body");
        Value::Null
    })
}

/// Serialize request lines as JSONL for upload
pub fn to_jsonl(items: &[BatchRequestItem]) -> Result<Vec<u8>, LlmError> {
    let mut out = Vec::new();
    for item in items {
        serde_json::to_writer(&mut out, item).map_err(|e| LlmError::Internal(e.into()))?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Parse JSONL request lines, skipping blank lines
pub fn from_jsonl(data: &[u8]) -> Result<Vec<BatchRequestItem>, LlmError> {
    let text = std::str::from_utf8(data)
        .map_err(|e| LlmError::InvalidRequest(format!("batch input is not UTF-8: {e}")))?;

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line)
                .map_err(|e| LlmError::InvalidRequest(format!("batch input line {} is invalid: {e}", number + 1)))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequestCounts {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

/// Where a new batch's requests come from
#[derive(Debug, Clone)]
pub enum BatchSource {
    /// Previously uploaded JSONL file, or an object store URI for Bedrock
    File(String),
    /// Requests embedded in the create call
    Inline(Vec<BatchRequestItem>),
}

/// Provider-independent batch creation request
#[derive(Debug, Clone)]
pub struct BatchCreate {
    pub endpoint: BatchEndpoint,
    pub source: BatchSource,
    pub completion_window: String,
    pub metadata: Option<Map<String, Value>>,
}

/// A batch job as last observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    /// Configured provider name, filled in by the manager
    #[serde(default)]
    pub provider: String,
    pub endpoint: BatchEndpoint,
    pub status: BatchStatus,
    #[serde(default)]
    pub input_file_id: Option<String>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub request_counts: BatchRequestCounts,
    /// Unix seconds
    pub created_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl BatchJob {
    /// Job that was just submitted and not yet observed upstream
    pub fn created(id: impl Into<String>, endpoint: BatchEndpoint) -> Self {
        Self {
            id: id.into(),
            provider: String::new(),
            endpoint,
            status: BatchStatus::Created,
            input_file_id: None,
            output_file_id: None,
            error_file_id: None,
            request_counts: BatchRequestCounts::default(),
            created_at: jiff::Timestamp::now().as_second(),
            completed_at: None,
            expires_at: None,
            metadata: None,
        }
    }
}

/// Outcome of one request in a finished batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResultItem {
    pub custom_id: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl BatchResultItem {
    pub fn success(custom_id: impl Into<String>, body: Value) -> Self {
        Self {
            custom_id: custom_id.into(),
            status_code: 200,
            body: Some(body),
            error: None,
        }
    }

    pub fn failure(custom_id: impl Into<String>, status_code: u16, error: Value) -> Self {
        Self {
            custom_id: custom_id.into(),
            status_code,
            body: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn terminal_states_accept_no_transitions() {
        for terminal in [
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
            BatchStatus::Expired,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(BatchStatus::InProgress));
            assert!(!terminal.can_transition_to(BatchStatus::Cancelling));
        }
    }

    #[test]
    fn forward_moves_and_cancellation_are_legal() {
        assert!(BatchStatus::Created.can_transition_to(BatchStatus::InProgress));
        assert!(BatchStatus::Validating.can_transition_to(BatchStatus::Cancelling));
        assert!(BatchStatus::InProgress.can_transition_to(BatchStatus::Cancelled));
        assert!(BatchStatus::Cancelling.can_transition_to(BatchStatus::Completed));
        assert!(!BatchStatus::Finalizing.can_transition_to(BatchStatus::Validating));
        assert!(!BatchStatus::Cancelling.can_transition_to(BatchStatus::InProgress));
    }

    #[test]
    fn anthropic_ended_batches_are_classified_by_counts() {
        let counts = |succeeded, canceled, expired| AnthropicRequestCounts {
            succeeded,
            canceled,
            expired,
            ..AnthropicRequestCounts::default()
        };

        assert_eq!(
            BatchStatus::from_anthropic("ended", &counts(3, 1, 0)),
            Some(BatchStatus::Completed)
        );
        assert_eq!(
            BatchStatus::from_anthropic("ended", &counts(0, 4, 0)),
            Some(BatchStatus::Cancelled)
        );
        assert_eq!(
            BatchStatus::from_anthropic("ended", &counts(0, 0, 2)),
            Some(BatchStatus::Expired)
        );
        assert_eq!(
            BatchStatus::from_anthropic("canceling", &counts(0, 0, 0)),
            Some(BatchStatus::Cancelling)
        );
    }

    #[test]
    fn provider_status_tables() {
        assert_eq!(BatchStatus::from_openai("finalizing"), Some(BatchStatus::Finalizing));
        assert_eq!(BatchStatus::from_gemini("BATCH_STATE_PENDING"), Some(BatchStatus::Validating));
        assert_eq!(BatchStatus::from_gemini("JOB_STATE_SUCCEEDED"), Some(BatchStatus::Completed));
        assert_eq!(BatchStatus::from_bedrock("PartiallyCompleted"), Some(BatchStatus::Completed));
        assert_eq!(BatchStatus::from_bedrock("Stopping"), Some(BatchStatus::Cancelling));
        assert_eq!(BatchStatus::from_openai("paused"), None);
    }

    #[test]
    fn jsonl_skips_blank_lines_and_reports_line_numbers() {
        let items = vec![BatchRequestItem {
            custom_id: "req-1".to_owned(),
            method: "POST".to_owned(),
            url: "/v1/chat/completions".to_owned(),
            body: json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}),
        }];

        let mut data = to_jsonl(&items).unwrap();
        data.extend_from_slice(b"\n");
        assert_eq!(from_jsonl(&data).unwrap(), items);

        let err = from_jsonl(b"{\"custom_id\": \"a\"}\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn chat_items_convert_to_canonical_requests() {
        let item = BatchRequestItem {
            custom_id: "req-1".to_owned(),
            method: "POST".to_owned(),
            url: "/v1/chat/completions".to_owned(),
            body: json!({"model": "claude-haiku", "max_tokens": 64, "messages": [{"role": "user", "content": "hi"}]}),
        };

        let request = item.completion_request(BatchEndpoint::ChatCompletions).unwrap();
        assert_eq!(request.model, "claude-haiku");
        assert_eq!(request.params.max_tokens, Some(64));
        assert!(item.completion_request(BatchEndpoint::Embeddings).is_err());
    }
}
