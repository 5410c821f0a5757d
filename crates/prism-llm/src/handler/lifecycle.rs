//! File and batch endpoints in `OpenAI` and Anthropic shapes
//!
//! Model-less calls pick their provider from `x-model-provider`, falling
//! back to the default provider.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use prism_core::RequestContext;
use serde::{Deserialize, Serialize};

use super::{ApiError, Form, Wire};
use crate::convert::lifecycle::{anthropic_list, openai_list};
use crate::error::LlmError;
use crate::lifecycle::{
    BatchCreate, BatchEndpoint, BatchJob, BatchRequestItem, BatchResultItem, BatchSource, FileObject, FilePurpose,
    FileUpload, ListQuery,
};
use crate::protocol::anthropic::{
    AnthropicBatch, AnthropicBatchCreate, AnthropicBatchResultLine, AnthropicFile, AnthropicFileDeleted,
};
use crate::protocol::openai::{OpenAiBatch, OpenAiBatchCreate, OpenAiBatchOutputLine, OpenAiFile, OpenAiFileDeleted};
use crate::state::LlmState;

const JSONL_CONTENT_TYPE: &str = "application/jsonl";

/// Anthropic pages with `after_id`; `OpenAI` with `after`
#[derive(Debug, Default, Deserialize)]
pub(super) struct PageParams {
    limit: Option<u32>,
    after: Option<String>,
    after_id: Option<String>,
}

impl From<PageParams> for ListQuery {
    fn from(params: PageParams) -> Self {
        Self {
            limit: params.limit,
            after: params.after.or(params.after_id),
        }
    }
}

/// Anthropic SDKs always send `anthropic-version`
fn wire_for(headers: &HeaderMap) -> Wire {
    if headers.contains_key("anthropic-version") {
        Wire::Anthropic
    } else {
        Wire::OpenAi
    }
}

fn provider(state: &LlmState, context: &RequestContext, wire: Wire) -> Result<String, ApiError> {
    state.lifecycle_provider(context).map_err(wire.err())
}

fn file_json(wire: Wire, file: &FileObject) -> Response {
    if wire == Wire::Anthropic {
        Json(AnthropicFile::from(file)).into_response()
    } else {
        Json(OpenAiFile::from(file)).into_response()
    }
}

/// Results as JSONL, one line per request
fn jsonl<T: Serialize>(lines: impl IntoIterator<Item = T>) -> Result<Response, LlmError> {
    let mut body = Vec::new();
    for line in lines {
        serde_json::to_writer(&mut body, &line).map_err(|e| LlmError::Internal(e.into()))?;
        body.push(b'\n');
    }

    Ok(([(header::CONTENT_TYPE, JSONL_CONTENT_TYPE)], body).into_response())
}

// -- Files --

/// Handle `GET /v1/files`
pub(super) async fn list_files(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    Query(params): Query<PageParams>,
) -> Result<Response, ApiError> {
    let wire = wire_for(&headers);
    let provider = provider(&state, &context, wire)?;
    let page = state
        .lifecycle()
        .list_files(&provider, &params.into(), &context)
        .await
        .map_err(wire.err())?;

    Ok(if wire == Wire::Anthropic {
        Json(anthropic_list(&page, |file| file.id.as_str(), |item| AnthropicFile::from(item))).into_response()
    } else {
        Json(openai_list(&page, |file| file.id.as_str(), |item| OpenAiFile::from(item))).into_response()
    })
}

/// Handle `POST /v1/files` (multipart)
///
/// Anthropic uploads carry no purpose and are stored as `user_data`.
pub(super) async fn upload_file(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let wire = wire_for(&headers);
    let provider = provider(&state, &context, wire)?;

    let mut form = Form::read(multipart).await.map_err(wire.err())?;
    let file = form.take_file().map_err(wire.err())?;
    let purpose = match form.field("purpose") {
        Some(purpose) => FilePurpose::parse(&purpose).map_err(wire.err())?,
        None if wire == Wire::Anthropic => FilePurpose::UserData,
        None => return Err(wire.err()(LlmError::InvalidRequest("multipart form is missing 'purpose'".to_owned()))),
    };

    let upload = FileUpload {
        filename: file.filename,
        purpose,
        content_type: file.content_type,
        data: file.data,
    };
    let stored = state
        .lifecycle()
        .upload_file(&provider, upload, &context)
        .await
        .map_err(wire.err())?;

    Ok(file_json(wire, &stored))
}

/// Handle `GET /v1/files/{file_id}`
pub(super) async fn retrieve_file(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
) -> Result<Response, ApiError> {
    let wire = wire_for(&headers);
    let provider = provider(&state, &context, wire)?;
    let file = state
        .lifecycle()
        .retrieve_file(&provider, &file_id, &context)
        .await
        .map_err(wire.err())?;

    Ok(file_json(wire, &file))
}

/// Handle `DELETE /v1/files/{file_id}`
pub(super) async fn delete_file(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
) -> Result<Response, ApiError> {
    let wire = wire_for(&headers);
    let provider = provider(&state, &context, wire)?;
    let deleted = state
        .lifecycle()
        .delete_file(&provider, &file_id, &context)
        .await
        .map_err(wire.err())?;

    Ok(if wire == Wire::Anthropic {
        Json(AnthropicFileDeleted {
            id: deleted.id,
            deleted_type: "file_deleted".to_owned(),
        })
        .into_response()
    } else {
        Json(OpenAiFileDeleted {
            id: deleted.id,
            object: "file".to_owned(),
            deleted: true,
        })
        .into_response()
    })
}

/// Handle `GET /v1/files/{file_id}/content`
pub(super) async fn file_content(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
) -> Result<Response, ApiError> {
    let wire = wire_for(&headers);
    let provider = provider(&state, &context, wire)?;
    let content = state
        .lifecycle()
        .file_content(&provider, &file_id, &context)
        .await
        .map_err(wire.err())?;

    Ok(([(header::CONTENT_TYPE, content.content_type)], content.data).into_response())
}

// -- OpenAI batches --

impl TryFrom<OpenAiBatchCreate> for BatchCreate {
    type Error = LlmError;

    fn try_from(body: OpenAiBatchCreate) -> Result<Self, LlmError> {
        if body.input_file_id.is_empty() {
            return Err(LlmError::InvalidRequest("input_file_id is required".to_owned()));
        }

        Ok(Self {
            endpoint: BatchEndpoint::parse(&body.endpoint)?,
            source: BatchSource::File(body.input_file_id),
            completion_window: body.completion_window,
            metadata: body.metadata,
        })
    }
}

/// Handle `POST /v1/batches`
pub(super) async fn create_batch(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Json(body): Json<OpenAiBatchCreate>,
) -> Result<Response, ApiError> {
    let provider = provider(&state, &context, Wire::OpenAi)?;
    let create = BatchCreate::try_from(body).map_err(Wire::OpenAi.err())?;

    let job = state
        .lifecycle()
        .create_batch(&provider, create, &context)
        .await
        .map_err(Wire::OpenAi.err())?;

    tracing::info!(provider = %provider, batch_id = %job.id, "batch created");
    Ok(Json(OpenAiBatch::from(&job)).into_response())
}

/// Handle `GET /v1/batches`
pub(super) async fn list_batches(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Query(params): Query<PageParams>,
) -> Result<Response, ApiError> {
    let provider = provider(&state, &context, Wire::OpenAi)?;
    let page = state
        .lifecycle()
        .list_batches(&provider, &params.into(), &context)
        .await
        .map_err(Wire::OpenAi.err())?;

    Ok(Json(openai_list(&page, |job| job.id.as_str(), |item| OpenAiBatch::from(item))).into_response())
}

/// Handle `GET /v1/batches/{batch_id}`
pub(super) async fn retrieve_batch(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(batch_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = fetch_batch(&state, &context, &batch_id, Wire::OpenAi).await?;
    Ok(Json(OpenAiBatch::from(&job)).into_response())
}

/// Handle `POST /v1/batches/{batch_id}/cancel`
pub(super) async fn cancel_batch(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(batch_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = cancel(&state, &context, &batch_id, Wire::OpenAi).await?;
    Ok(Json(OpenAiBatch::from(&job)).into_response())
}

/// Handle `GET /v1/batches/{batch_id}/results`
///
/// Results are rendered as `OpenAI` output lines whatever the backing
/// provider, so callers need not download and parse provider files.
pub(super) async fn batch_results(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(batch_id): Path<String>,
) -> Result<Response, ApiError> {
    let items = results(&state, &context, &batch_id, Wire::OpenAi).await?;
    jsonl(items.iter().map(OpenAiBatchOutputLine::from)).map_err(Wire::OpenAi.err())
}

// -- Anthropic message batches --

impl TryFrom<AnthropicBatchCreate> for BatchCreate {
    type Error = LlmError;

    fn try_from(body: AnthropicBatchCreate) -> Result<Self, LlmError> {
        if body.requests.is_empty() {
            return Err(LlmError::InvalidRequest("requests must not be empty".to_owned()));
        }

        let items = body
            .requests
            .into_iter()
            .map(|request| {
                Ok(BatchRequestItem {
                    custom_id: request.custom_id,
                    method: "POST".to_owned(),
                    url: BatchEndpoint::Messages.path().to_owned(),
                    body: serde_json::to_value(request.params).map_err(|e| LlmError::Internal(e.into()))?,
                })
            })
            .collect::<Result<Vec<_>, LlmError>>()?;

        Ok(Self {
            endpoint: BatchEndpoint::Messages,
            source: BatchSource::Inline(items),
            completion_window: "24h".to_owned(),
            metadata: None,
        })
    }
}

/// Handle `POST /v1/messages/batches`
pub(super) async fn create_message_batch(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Json(body): Json<AnthropicBatchCreate>,
) -> Result<Response, ApiError> {
    let provider = provider(&state, &context, Wire::Anthropic)?;
    let create = BatchCreate::try_from(body).map_err(Wire::Anthropic.err())?;

    let job = state
        .lifecycle()
        .create_batch(&provider, create, &context)
        .await
        .map_err(Wire::Anthropic.err())?;

    tracing::info!(provider = %provider, batch_id = %job.id, "message batch created");
    Ok(Json(AnthropicBatch::from(&job)).into_response())
}

/// Handle `GET /v1/messages/batches`
pub(super) async fn list_message_batches(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Query(params): Query<PageParams>,
) -> Result<Response, ApiError> {
    let provider = provider(&state, &context, Wire::Anthropic)?;
    let page = state
        .lifecycle()
        .list_batches(&provider, &params.into(), &context)
        .await
        .map_err(Wire::Anthropic.err())?;

    Ok(Json(anthropic_list(&page, |job| job.id.as_str(), |item| AnthropicBatch::from(item))).into_response())
}

/// Handle `GET /v1/messages/batches/{batch_id}`
pub(super) async fn retrieve_message_batch(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(batch_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = fetch_batch(&state, &context, &batch_id, Wire::Anthropic).await?;
    Ok(Json(AnthropicBatch::from(&job)).into_response())
}

/// Handle `POST /v1/messages/batches/{batch_id}/cancel`
pub(super) async fn cancel_message_batch(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(batch_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = cancel(&state, &context, &batch_id, Wire::Anthropic).await?;
    Ok(Json(AnthropicBatch::from(&job)).into_response())
}

/// Handle `GET /v1/messages/batches/{batch_id}/results`
pub(super) async fn message_batch_results(
    State(state): State<LlmState>,
    Extension(context): Extension<RequestContext>,
    Path(batch_id): Path<String>,
) -> Result<Response, ApiError> {
    let items = results(&state, &context, &batch_id, Wire::Anthropic).await?;
    jsonl(items.iter().map(AnthropicBatchResultLine::from)).map_err(Wire::Anthropic.err())
}

// -- Shared --

async fn fetch_batch(state: &LlmState, context: &RequestContext, id: &str, wire: Wire) -> Result<BatchJob, ApiError> {
    let provider = provider(state, context, wire)?;
    state
        .lifecycle()
        .retrieve_batch(&provider, id, context)
        .await
        .map_err(wire.err())
}

async fn cancel(state: &LlmState, context: &RequestContext, id: &str, wire: Wire) -> Result<BatchJob, ApiError> {
    let provider = provider(state, context, wire)?;
    let job = state
        .lifecycle()
        .cancel_batch(&provider, id, context)
        .await
        .map_err(wire.err())?;

    tracing::info!(provider = %provider, batch_id = %id, status = %job.status, "batch cancel requested");
    Ok(job)
}

async fn results(
    state: &LlmState,
    context: &RequestContext,
    id: &str,
    wire: Wire,
) -> Result<Vec<BatchResultItem>, ApiError> {
    let provider = provider(state, context, wire)?;
    state
        .lifecycle()
        .batch_results(&provider, id, context)
        .await
        .map_err(wire.err())
}
