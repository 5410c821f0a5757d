//! Google GenAI-compatible endpoints
//!
//! Google addresses the method in the last path segment
//! (`models/gemini-2.0-flash:generateContent`), so a single wildcard route
//! splits model and method and deserializes the body per method.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::{StreamExt, stream};
use prism_core::RequestContext;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ApiError, Wire, json_event, sse_response};
use crate::convert::google::{GoogleStreamEncoder, single_embedding};
use crate::error::LlmError;
use crate::protocol::google::{GoogleBatchEmbedRequest, GoogleBatchEmbedResponse, GoogleEmbedRequest, GoogleRequest, GoogleResponse};
use crate::state::LlmState;
use crate::types::{CompletionRequest, EmbeddingRequest};

/// Methods served under `/v1beta/models/{model}:{method}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    GenerateContent,
    StreamGenerateContent,
    EmbedContent,
    BatchEmbedContents,
}

impl Method {
    fn parse(method: &str) -> Option<Self> {
        Some(match method {
            "generateContent" => Self::GenerateContent,
            "streamGenerateContent" => Self::StreamGenerateContent,
            "embedContent" => Self::EmbedContent,
            "batchEmbedContents" => Self::BatchEmbedContents,
            _ => return None,
        })
    }
}

/// Split `gemini-2.0-flash:generateContent` into model and method
fn split_target(target: &str) -> Result<(&str, Method), LlmError> {
    let target = target.trim_start_matches('/');
    let Some((model, method)) = target.rsplit_once(':') else {
        return Err(LlmError::InvalidRequest(format!("missing method in '{target}'")));
    };

    let method = Method::parse(method)
        .ok_or_else(|| LlmError::InvalidRequest(format!("unsupported method '{method}'")))?;

    if model.is_empty() {
        return Err(LlmError::InvalidRequest("missing model".to_owned()));
    }

    Ok((model, method))
}

fn parse<T: DeserializeOwned>(body: Value) -> Result<T, LlmError> {
    serde_json::from_value(body).map_err(|e| LlmError::InvalidRequest(format!("invalid request body: {e}")))
}

/// Handle `POST /v1beta/models/{model}:{method}`
pub(super) async fn models_action(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(target): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let (model, method) = split_target(&target).map_err(Wire::Google.err())?;

    match method {
        Method::GenerateContent | Method::StreamGenerateContent => {
            let wire_request: GoogleRequest = parse(body).map_err(Wire::Google.err())?;
            let mut request = CompletionRequest::try_from(wire_request).map_err(Wire::Google.err())?;
            model.clone_into(&mut request.model);

            if method == Method::StreamGenerateContent {
                return stream_generate(&state, request, &context).await;
            }

            let (_, response) = state.complete(request, &context).await.map_err(Wire::Google.err())?;
            Ok(Json(GoogleResponse::from(&response)).into_response())
        }
        Method::EmbedContent => {
            let wire_request: GoogleEmbedRequest = parse(body).map_err(Wire::Google.err())?;
            let mut request = EmbeddingRequest::from(wire_request);
            model.clone_into(&mut request.model);

            let response = state.embed(request, &context).await.map_err(Wire::Google.err())?;
            let single = single_embedding(&response)
                .ok_or_else(|| LlmError::Internal(anyhow::anyhow!("provider returned no embedding")))
                .map_err(Wire::Google.err())?;

            Ok(Json(single).into_response())
        }
        Method::BatchEmbedContents => {
            let wire_request: GoogleBatchEmbedRequest = parse(body).map_err(Wire::Google.err())?;
            let mut request = EmbeddingRequest::from(wire_request);
            model.clone_into(&mut request.model);

            let response = state.embed(request, &context).await.map_err(Wire::Google.err())?;
            Ok(Json(GoogleBatchEmbedResponse::from(&response)).into_response())
        }
    }
}

/// `streamGenerateContent` as SSE, the `alt=sse` form
async fn stream_generate(
    state: &LlmState,
    request: CompletionRequest,
    context: &RequestContext,
) -> Result<Response, ApiError> {
    let (target, events) = state
        .complete_stream(request, context)
        .await
        .map_err(Wire::Google.err())?;

    let mut encoder = GoogleStreamEncoder::new(target.model);
    let encoded = events.flat_map(move |item| {
        let encoded = match item {
            Ok(event) => encoder.encode(&event).map(|chunk| json_event(None, &chunk)),
            Err(e) => {
                tracing::warn!(error = %e, "stream ended with an error");
                Some(json_event(None, &Wire::Google.error_body(&e)))
            }
        };
        stream::iter(encoded)
    });

    Ok(sse_response(encoded))
}
