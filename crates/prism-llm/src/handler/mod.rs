//! Axum route handlers for every inbound wire format
//!
//! Each handler parses its native body, hands a canonical request to
//! [`LlmState`], and renders the result (or error) back in the caller's
//! own shape.

mod anthropic;
mod bedrock;
mod google;
mod lifecycle;
mod openai;

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::Multipart;
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use prism_core::HttpError;
use serde::Serialize;

use crate::error::LlmError;
use crate::protocol::anthropic::{AnthropicErrorDetail, AnthropicErrorResponse};
use crate::protocol::google::{GoogleErrorDetail, GoogleErrorResponse};
use crate::protocol::openai::{OpenAiErrorDetail, OpenAiErrorResponse};
use crate::state::LlmState;

/// Build the LLM router with all endpoints
pub fn llm_router(state: LlmState) -> Router {
    Router::new()
        // OpenAI-compatible
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/responses", post(openai::responses))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/v1/audio/speech", post(openai::speech))
        .route("/v1/audio/transcriptions", post(openai::transcriptions))
        .route("/v1/models", get(openai::list_models))
        // Anthropic-compatible
        .route("/v1/messages", post(anthropic::messages))
        // Files and batches; `/v1/files` answers in Anthropic shape when the
        // caller sends `anthropic-version`
        .route("/v1/files", get(lifecycle::list_files).post(lifecycle::upload_file))
        .route(
            "/v1/files/{file_id}",
            get(lifecycle::retrieve_file).delete(lifecycle::delete_file),
        )
        .route("/v1/files/{file_id}/content", get(lifecycle::file_content))
        .route("/v1/batches", get(lifecycle::list_batches).post(lifecycle::create_batch))
        .route("/v1/batches/{batch_id}", get(lifecycle::retrieve_batch))
        .route("/v1/batches/{batch_id}/cancel", post(lifecycle::cancel_batch))
        .route("/v1/batches/{batch_id}/results", get(lifecycle::batch_results))
        .route(
            "/v1/messages/batches",
            get(lifecycle::list_message_batches).post(lifecycle::create_message_batch),
        )
        .route("/v1/messages/batches/{batch_id}", get(lifecycle::retrieve_message_batch))
        .route("/v1/messages/batches/{batch_id}/cancel", post(lifecycle::cancel_message_batch))
        .route("/v1/messages/batches/{batch_id}/results", get(lifecycle::message_batch_results))
        // Google GenAI-compatible: `models/{model}:{method}`
        .route("/v1beta/models/{*target}", post(google::models_action))
        // AWS Bedrock runtime-compatible
        .route("/model/{model_id}/converse", post(bedrock::converse))
        .route("/model/{model_id}/converse-stream", post(bedrock::converse_stream))
        .route("/model/{model_id}/invoke", post(bedrock::invoke))
        .route(
            "/model/{model_id}/invoke-with-response-stream",
            post(bedrock::invoke_with_response_stream),
        )
        .with_state(state)
}

/// Wire format an error is rendered in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wire {
    OpenAi,
    Anthropic,
    Google,
    Bedrock,
}

impl Wire {
    /// Adapter for `map_err`
    pub(crate) fn err(self) -> impl FnOnce(LlmError) -> ApiError {
        move |error| ApiError { wire: self, error }
    }

    /// Error body in this wire's shape
    pub(crate) fn error_body(self, error: &LlmError) -> serde_json::Value {
        let message = error.client_message();

        let body = match self {
            Self::OpenAi => serde_json::to_value(OpenAiErrorResponse {
                error: OpenAiErrorDetail {
                    message,
                    error_type: Some(error.error_type().to_owned()),
                    param: None,
                    code: error.code().map(str::to_owned),
                },
            }),
            Self::Anthropic => serde_json::to_value(AnthropicErrorResponse {
                error_type: "error".to_owned(),
                error: AnthropicErrorDetail {
                    error_type: error.error_type().to_owned(),
                    message,
                },
            }),
            Self::Google => {
                let status = error.status_code();
                serde_json::to_value(GoogleErrorResponse {
                    error: GoogleErrorDetail {
                        code: status.as_u16(),
                        message,
                        status: google_status(status).to_owned(),
                    },
                })
            }
            Self::Bedrock => Ok(serde_json::json!({ "message": message })),
        };

        body.unwrap_or_default()
    }
}

/// Canonical status string Google APIs pair with an HTTP status
const fn google_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        409 => "FAILED_PRECONDITION",
        429 => "RESOURCE_EXHAUSTED",
        502 | 503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    }
}

/// AWS error type sent in `x-amzn-errortype`
pub(crate) const fn aws_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "ValidationException",
        401 | 403 => "AccessDeniedException",
        404 => "ResourceNotFoundException",
        409 => "ConflictException",
        429 => "ThrottlingException",
        502 | 503 => "ServiceUnavailableException",
        504 => "ModelTimeoutException",
        _ => "InternalServerException",
    }
}

/// Error paired with the wire format the caller speaks
#[derive(Debug)]
pub(crate) struct ApiError {
    wire: Wire,
    error: LlmError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self.error, "request failed");
        } else {
            tracing::debug!(error = %self.error, "request rejected");
        }

        let mut response = (status, Json(self.wire.error_body(&self.error))).into_response();
        if self.wire == Wire::Bedrock {
            response
                .headers_mut()
                .insert("x-amzn-errortype", HeaderValue::from_static(aws_error_type(status)));
        }

        response
    }
}

/// JSON `data:` event, optionally named
pub(crate) fn json_event(name: Option<&str>, payload: &impl Serialize) -> Event {
    let event = Event::default().data(serde_json::to_string(payload).unwrap_or_default());
    match name {
        Some(name) => event.event(name),
        None => event,
    }
}

/// Wrap already encoded SSE events into a response
pub(crate) fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = Event> + Send + 'static,
{
    Sse::new(events.map(Ok::<_, Infallible>))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Uploaded file part of a multipart form
pub(crate) struct FormFile {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Multipart form split into its file part and text fields
pub(crate) struct Form {
    pub file: Option<FormFile>,
    pub fields: HashMap<String, String>,
}

impl Form {
    pub(crate) async fn read(mut multipart: Multipart) -> Result<Self, LlmError> {
        let invalid = |e: axum::extract::multipart::MultipartError| {
            LlmError::InvalidRequest(format!("failed to parse multipart form: {e}"))
        };

        let mut form = Self {
            file: None,
            fields: HashMap::new(),
        };

        while let Some(field) = multipart.next_field().await.map_err(invalid)? {
            let name = field.name().unwrap_or_default().to_owned();

            if name == "file" {
                let filename = field.file_name().unwrap_or("upload").to_owned();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_owned();
                let data = field.bytes().await.map_err(invalid)?.to_vec();

                form.file = Some(FormFile {
                    filename,
                    content_type,
                    data,
                });
            } else {
                let value = field.text().await.map_err(invalid)?;
                form.fields.insert(name, value);
            }
        }

        Ok(form)
    }

    pub(crate) fn take_file(&mut self) -> Result<FormFile, LlmError> {
        self.file
            .take()
            .ok_or_else(|| LlmError::InvalidRequest("multipart form is missing the 'file' part".to_owned()))
    }

    pub(crate) fn field(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name).filter(|value| !value.is_empty())
    }

    pub(crate) fn require(&mut self, name: &str) -> Result<String, LlmError> {
        self.field(name)
            .ok_or_else(|| LlmError::InvalidRequest(format!("multipart form is missing '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies_follow_each_wire_shape() {
        let error = LlmError::unsupported("gemini", "vision_url");

        let openai = Wire::OpenAi.error_body(&error);
        assert_eq!(openai["error"]["type"], "invalid_request_error");
        assert_eq!(openai["error"]["code"], "unsupported_capability");
        assert!(openai["error"]["message"].as_str().unwrap().contains("gemini"));

        let anthropic = Wire::Anthropic.error_body(&error);
        assert_eq!(anthropic["type"], "error");
        assert_eq!(anthropic["error"]["type"], "invalid_request_error");

        let google = Wire::Google.error_body(&error);
        assert_eq!(google["error"]["code"], 400);
        assert_eq!(google["error"]["status"], "INVALID_ARGUMENT");

        let bedrock = Wire::Bedrock.error_body(&error);
        assert!(bedrock["message"].as_str().unwrap().contains("vision_url"));
    }

    #[test]
    fn bedrock_errors_carry_the_aws_error_type() {
        let error = LlmError::upstream("bedrock", Some(429), "Too many requests");
        let response = Wire::Bedrock.err()(error).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-amzn-errortype"], "ThrottlingException");
    }

    #[test]
    fn upstream_detail_survives_translation() {
        let error = LlmError::upstream("anthropic", Some(400), "messages.1.role: must alternate between user and assistant");
        let body = Wire::OpenAi.error_body(&error);
        let message = body["error"]["message"].as_str().unwrap();

        assert!(message.contains("anthropic"));
        assert!(message.contains("role"));
    }
}
