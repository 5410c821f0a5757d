//! AWS Bedrock runtime-compatible endpoints
//!
//! Streaming responses use the AWS event stream binary framing
//! (`application/vnd.amazon.eventstream`) so the AWS SDKs can decode them.

use std::time::Instant;

use aws_smithy_eventstream::frame::write_message_to;
use aws_smithy_types::event_stream::{Header, HeaderValue, Message};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use base64::Engine as _;
use futures_util::{StreamExt, stream};
use prism_core::{HttpError, RequestContext};
use serde_json::{Value, json};

use super::{ApiError, Wire, aws_error_type};
use crate::convert::anthropic::AnthropicStreamEncoder;
use crate::convert::bedrock::{ConverseStreamEncoder, converse_response};
use crate::error::LlmError;
use crate::protocol::anthropic::{AnthropicRequest, AnthropicResponse};
use crate::protocol::bedrock::ConverseRequest;
use crate::state::LlmState;
use crate::stream::EventStream;
use crate::types::CompletionRequest;

const EVENT_STREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";

/// Handle `POST /model/{modelId}/converse`
pub(super) async fn converse(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(model_id): Path<String>,
    Json(wire_request): Json<ConverseRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let request = converse_request(wire_request, model_id).map_err(Wire::Bedrock.err())?;

    let (_, response) = state.complete(request, &context).await.map_err(Wire::Bedrock.err())?;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    Ok(Json(converse_response(&response, latency_ms)).into_response())
}

/// Handle `POST /model/{modelId}/converse-stream`
pub(super) async fn converse_stream(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(model_id): Path<String>,
    Json(wire_request): Json<ConverseRequest>,
) -> Result<Response, ApiError> {
    let request = converse_request(wire_request, model_id).map_err(Wire::Bedrock.err())?;
    let (_, events) = state
        .complete_stream(request, &context)
        .await
        .map_err(Wire::Bedrock.err())?;

    let mut encoder = ConverseStreamEncoder::new();
    Ok(event_stream_response(events, move |event| {
        encoder
            .encode(event)
            .into_iter()
            .map(|(event_type, payload)| event_frame(event_type, &payload))
            .collect()
    }))
}

/// Handle `POST /model/{modelId}/invoke` with an Anthropic messages body
pub(super) async fn invoke(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(model_id): Path<String>,
    Json(wire_request): Json<AnthropicRequest>,
) -> Result<Response, ApiError> {
    let request = invoke_request(wire_request, model_id).map_err(Wire::Bedrock.err())?;

    let (_, response) = state.complete(request, &context).await.map_err(Wire::Bedrock.err())?;
    Ok(Json(AnthropicResponse::from(&response)).into_response())
}

/// Handle `POST /model/{modelId}/invoke-with-response-stream`
///
/// Each Anthropic stream event is sent as a `chunk` whose `bytes` field is
/// the base64 encoded event JSON.
pub(super) async fn invoke_with_response_stream(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(model_id): Path<String>,
    Json(wire_request): Json<AnthropicRequest>,
) -> Result<Response, ApiError> {
    let request = invoke_request(wire_request, model_id).map_err(Wire::Bedrock.err())?;
    let (target, events) = state
        .complete_stream(request, &context)
        .await
        .map_err(Wire::Bedrock.err())?;

    let mut encoder = AnthropicStreamEncoder::new(target.model);
    Ok(event_stream_response(events, move |event| {
        encoder
            .encode(event)
            .into_iter()
            .map(|(_, event)| {
                let bytes = serde_json::to_vec(&event).unwrap_or_default();
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                event_frame("chunk", &json!({ "bytes": encoded }))
            })
            .collect()
    }))
}

fn converse_request(wire_request: ConverseRequest, model_id: String) -> Result<CompletionRequest, LlmError> {
    let mut request = CompletionRequest::try_from(wire_request)?;
    request.model = model_id;
    Ok(request)
}

fn invoke_request(mut wire_request: AnthropicRequest, model_id: String) -> Result<CompletionRequest, LlmError> {
    wire_request.model = model_id;
    wire_request.anthropic_version = None;
    CompletionRequest::try_from(wire_request)
}

fn event_stream_response<F>(events: EventStream, mut encode: F) -> Response
where
    F: FnMut(&crate::types::StreamEvent) -> Vec<Vec<u8>> + Send + 'static,
{
    let frames = events.flat_map(move |item| {
        let frames = match item {
            Ok(event) => encode(&event),
            Err(e) => {
                tracing::warn!(error = %e, "stream ended with an error");
                vec![exception_frame(&e)]
            }
        };
        stream::iter(frames.into_iter().map(|frame| Ok::<_, std::convert::Infallible>(Bytes::from(frame))))
    });

    ([(header::CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE)], Body::from_stream(frames)).into_response()
}

fn frame(headers: [(&'static str, String); 3], payload: &Value) -> Vec<u8> {
    let mut message = Message::new(serde_json::to_vec(payload).unwrap_or_default());
    for (name, value) in headers {
        message = message.add_header(Header::new(name, HeaderValue::String(value.into())));
    }

    let mut buffer = Vec::new();
    if let Err(e) = write_message_to(&message, &mut buffer) {
        tracing::error!(error = %e, "failed to encode event stream frame");
        buffer.clear();
    }

    buffer
}

/// Event frame carrying a JSON payload
fn event_frame(event_type: &'static str, payload: &Value) -> Vec<u8> {
    frame(
        [
            (":event-type", event_type.to_owned()),
            (":content-type", "application/json".to_owned()),
            (":message-type", "event".to_owned()),
        ],
        payload,
    )
}

/// Exception frame the AWS SDKs surface as a modeled stream error
fn exception_frame(error: &LlmError) -> Vec<u8> {
    let exception = match error {
        LlmError::StreamInterrupted { .. } => "modelStreamErrorException",
        other => {
            let aws_type = aws_error_type(other.status_code());
            match aws_type {
                "ThrottlingException" => "throttlingException",
                "ValidationException" => "validationException",
                "ServiceUnavailableException" => "serviceUnavailableException",
                "ModelTimeoutException" => "modelTimeoutException",
                _ => "internalServerException",
            }
        }
    };

    frame(
        [
            (":exception-type", exception.to_owned()),
            (":content-type", "application/json".to_owned()),
            (":message-type", "exception".to_owned()),
        ],
        &Wire::Bedrock.error_body(error),
    )
}
