//! Anthropic-compatible messages endpoint

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::{StreamExt, stream};
use prism_core::RequestContext;

use super::{ApiError, Wire, json_event, sse_response};
use crate::convert::anthropic::AnthropicStreamEncoder;
use crate::protocol::anthropic::{AnthropicRequest, AnthropicResponse};
use crate::state::LlmState;
use crate::stream::EventStream;
use crate::types::CompletionRequest;

/// Handle `POST /v1/messages`
pub(super) async fn messages(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Json(wire_request): Json<AnthropicRequest>,
) -> Result<Response, ApiError> {
    let is_stream = wire_request.stream.unwrap_or(false);
    let request = CompletionRequest::try_from(wire_request).map_err(Wire::Anthropic.err())?;

    if is_stream {
        let (target, events) = state
            .complete_stream(request, &context)
            .await
            .map_err(Wire::Anthropic.err())?;

        return Ok(anthropic_sse(events, target.model));
    }

    let (_, response) = state.complete(request, &context).await.map_err(Wire::Anthropic.err())?;
    Ok(Json(AnthropicResponse::from(&response)).into_response())
}

/// Anthropic SSE stream; a failure becomes a named `error` event
fn anthropic_sse(events: EventStream, model: String) -> Response {
    let mut encoder = AnthropicStreamEncoder::new(model);

    let encoded = events.flat_map(move |item| {
        let encoded = match item {
            Ok(event) => encoder
                .encode(&event)
                .into_iter()
                .map(|(name, event)| json_event(Some(name), &event))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "stream ended with an error");
                vec![json_event(Some("error"), &Wire::Anthropic.error_body(&e))]
            }
        };
        stream::iter(encoded)
    });

    sse_response(encoded)
}
