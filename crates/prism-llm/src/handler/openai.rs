//! OpenAI-compatible endpoints

use axum::extract::{Multipart, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::{StreamExt, stream};
use prism_core::RequestContext;

use super::{ApiError, Form, Wire, json_event, sse_response};
use crate::convert::openai::{OpenAiStreamEncoder, TextCompletionEncoder, embedding_response, text_completion};
use crate::convert::responses::{ResponsesStreamEncoder, response_object};
use crate::error::LlmError;
use crate::protocol::openai::{
    OpenAiEmbeddingRequest, OpenAiModel, OpenAiModelList, OpenAiRequest, OpenAiResponse, OpenAiSpeechRequest,
    OpenAiTextRequest, OpenAiTranscription,
};
use crate::protocol::responses::ResponsesRequest;
use crate::state::LlmState;
use crate::stream::EventStream;
use crate::types::{CompletionRequest, TranscriptionRequest};

/// Terminal sentinel of an `OpenAI` SSE stream
const DONE: &str = "[DONE]";

/// Handle `POST /v1/chat/completions`
pub(super) async fn chat_completions(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Json(wire_request): Json<OpenAiRequest>,
) -> Result<Response, ApiError> {
    let is_stream = wire_request.stream.unwrap_or(false);
    let include_usage = wire_request
        .stream_options
        .as_ref()
        .is_some_and(|options| options.include_usage);
    let request = CompletionRequest::try_from(wire_request).map_err(Wire::OpenAi.err())?;

    if is_stream {
        let (target, events) = state
            .complete_stream(request, &context)
            .await
            .map_err(Wire::OpenAi.err())?;

        let mut encoder = OpenAiStreamEncoder::new(target.model, include_usage);
        return Ok(openai_sse(events, move |event| {
            encoder.encode(event).iter().map(|chunk| json_event(None, chunk)).collect()
        }));
    }

    let (_, response) = state.complete(request, &context).await.map_err(Wire::OpenAi.err())?;
    Ok(Json(OpenAiResponse::from(&response)).into_response())
}

/// Handle `POST /v1/completions`
pub(super) async fn completions(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Json(wire_request): Json<OpenAiTextRequest>,
) -> Result<Response, ApiError> {
    let is_stream = wire_request.stream.unwrap_or(false);
    let request = CompletionRequest::from(wire_request);

    if is_stream {
        let (target, events) = state
            .complete_stream(request, &context)
            .await
            .map_err(Wire::OpenAi.err())?;

        let encoder = TextCompletionEncoder::new(target.model);
        return Ok(openai_sse(events, move |event| {
            encoder.encode(event).iter().map(|chunk| json_event(None, chunk)).collect()
        }));
    }

    let (_, response) = state.complete(request, &context).await.map_err(Wire::OpenAi.err())?;
    Ok(Json(text_completion(&response)).into_response())
}

/// Handle `POST /v1/responses`
pub(super) async fn responses(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Json(wire_request): Json<ResponsesRequest>,
) -> Result<Response, ApiError> {
    let is_stream = wire_request.stream.unwrap_or(false);
    let request = CompletionRequest::try_from(wire_request).map_err(Wire::OpenAi.err())?;

    if is_stream {
        let (target, events) = state
            .complete_stream(request, &context)
            .await
            .map_err(Wire::OpenAi.err())?;

        let mut encoder = ResponsesStreamEncoder::new(target.model);
        let events = events.flat_map(move |item| {
            let encoded = match item {
                Ok(event) => encoder
                    .encode(&event)
                    .into_iter()
                    .map(|event| json_event(Some(event.name), &event.data))
                    .collect(),
                Err(e) => {
                    let payload = serde_json::json!({
                        "type": "error",
                        "code": e.code(),
                        "message": e.to_string(),
                    });
                    vec![json_event(Some("error"), &payload)]
                }
            };
            stream::iter(encoded)
        });

        return Ok(sse_response(events));
    }

    let (_, response) = state.complete(request, &context).await.map_err(Wire::OpenAi.err())?;
    Ok(Json(response_object(&response)).into_response())
}

/// Handle `POST /v1/embeddings`
pub(super) async fn embeddings(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Json(wire_request): Json<OpenAiEmbeddingRequest>,
) -> Result<Response, ApiError> {
    let base64 = wire_request.encoding_format.as_deref() == Some("base64");
    let response = state
        .embed(wire_request.into(), &context)
        .await
        .map_err(Wire::OpenAi.err())?;

    Ok(Json(embedding_response(&response, base64)).into_response())
}

/// Handle `POST /v1/audio/speech`
pub(super) async fn speech(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Json(wire_request): Json<OpenAiSpeechRequest>,
) -> Result<Response, ApiError> {
    let audio = state
        .speech(wire_request.into(), &context)
        .await
        .map_err(Wire::OpenAi.err())?;

    Ok(([(header::CONTENT_TYPE, audio.content_type)], audio.audio).into_response())
}

/// Handle `POST /v1/audio/transcriptions`
pub(super) async fn transcriptions(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut form = Form::read(multipart).await.map_err(Wire::OpenAi.err())?;
    let file = form.take_file().map_err(Wire::OpenAi.err())?;
    let response_format = form.field("response_format");

    let temperature = form
        .field("temperature")
        .map(|t| {
            t.parse::<f32>()
                .map_err(|e| LlmError::InvalidRequest(format!("invalid temperature '{t}': {e}")))
        })
        .transpose()
        .map_err(Wire::OpenAi.err())?;

    let request = TranscriptionRequest {
        model: form.require("model").map_err(Wire::OpenAi.err())?,
        audio: file.data,
        filename: file.filename,
        content_type: file.content_type,
        language: form.field("language"),
        prompt: form.field("prompt"),
        temperature,
    };

    let transcription = state.transcribe(request, &context).await.map_err(Wire::OpenAi.err())?;

    if response_format.as_deref() == Some("text") {
        return Ok(transcription.text.into_response());
    }

    Ok(Json(OpenAiTranscription::from(&transcription)).into_response())
}

/// Handle `GET /v1/models`
pub(super) async fn list_models(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
) -> Response {
    let now = crate::convert::unix_now();

    let data = state
        .list_models(&context)
        .await
        .into_iter()
        .map(|model| OpenAiModel {
            id: model.id,
            object: "model".to_owned(),
            created: model
                .created_at
                .and_then(|created| u64::try_from(created).ok())
                .unwrap_or(now),
            owned_by: model.owned_by.unwrap_or_default(),
        })
        .collect();

    Json(OpenAiModelList {
        object: "list".to_owned(),
        data,
    })
    .into_response()
}

/// SSE response for chat and legacy completions, terminated by `[DONE]`
///
/// A stream error is sent as an `{"error": ...}` chunk, the shape `OpenAI`
/// SDKs raise from.
fn openai_sse<F>(events: EventStream, mut encode: F) -> Response
where
    F: FnMut(&crate::types::StreamEvent) -> Vec<axum::response::sse::Event> + Send + 'static,
{
    let encoded = events
        .flat_map(move |item| {
            let encoded = match item {
                Ok(event) => encode(&event),
                Err(e) => {
                    tracing::warn!(error = %e, "stream ended with an error");
                    vec![json_event(None, &Wire::OpenAi.error_body(&e))]
                }
            };
            stream::iter(encoded)
        })
        .chain(stream::once(async { axum::response::sse::Event::default().data(DONE) }));

    sse_response(encoded)
}
