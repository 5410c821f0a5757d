//! Batch and file objects to and from `OpenAI` and Anthropic wire shapes

use serde_json::{Value, json};

use crate::lifecycle::{
    BatchEndpoint, BatchJob, BatchRequestCounts, BatchResultItem, BatchStatus, FileObject, FilePurpose, FileStatus,
    Page,
};
use crate::protocol::anthropic::{
    AnthropicBatch, AnthropicBatchResult, AnthropicBatchResultLine, AnthropicFile, AnthropicList,
    AnthropicRequestCounts,
};
use crate::protocol::openai::{
    OpenAiBatch, OpenAiBatchLineError, OpenAiBatchOutputLine, OpenAiBatchOutputResponse, OpenAiFile, OpenAiList,
    OpenAiRequestCounts,
};

/// Status code recorded for requests that were canceled before running
const CANCELED_STATUS: u16 = 499;
/// Status code recorded for requests that expired before running
const EXPIRED_STATUS: u16 = 408;

fn rfc3339(seconds: i64) -> String {
    jiff::Timestamp::from_second(seconds)
        .unwrap_or(jiff::Timestamp::UNIX_EPOCH)
        .to_string()
}

fn unix_seconds(timestamp: &str) -> i64 {
    super::unix_seconds(timestamp).unwrap_or_default()
}

// -- OpenAI --

impl From<&FileObject> for OpenAiFile {
    fn from(file: &FileObject) -> Self {
        Self {
            id: file.id.clone(),
            object: "file".to_owned(),
            bytes: file.bytes,
            created_at: file.created_at,
            filename: file.filename.clone(),
            purpose: file.purpose.as_str().to_owned(),
            status: Some(file.status.as_str().to_owned()),
        }
    }
}

impl From<OpenAiFile> for FileObject {
    fn from(file: OpenAiFile) -> Self {
        let purpose = FilePurpose::parse(&file.purpose).unwrap_or_else(|_| {
            tracing::debug!(file_id = %file.id, purpose = %file.purpose, "unrecognized file purpose");
            FilePurpose::UserData
        });

        Self {
            id: file.id,
            filename: file.filename,
            purpose,
            bytes: file.bytes,
            created_at: file.created_at,
            status: file.status.as_deref().map_or(FileStatus::Processed, FileStatus::parse),
            content_type: None,
        }
    }
}

pub fn openai_list<T, U>(page: &Page<T>, id: impl Fn(&T) -> &str, convert: impl Fn(&T) -> U) -> OpenAiList<U> {
    OpenAiList {
        object: "list".to_owned(),
        data: page.data.iter().map(convert).collect(),
        has_more: page.has_more,
        first_id: page.data.first().map(|item| id(item).to_owned()),
        last_id: page.data.last().map(|item| id(item).to_owned()),
    }
}

impl From<&BatchJob> for OpenAiBatch {
    fn from(job: &BatchJob) -> Self {
        Self {
            id: job.id.clone(),
            object: "batch".to_owned(),
            endpoint: job.endpoint.path().to_owned(),
            input_file_id: job.input_file_id.clone().unwrap_or_default(),
            completion_window: "24h".to_owned(),
            // `created` has no counterpart upstream and reads as queued
            status: match job.status {
                BatchStatus::Created => BatchStatus::Validating,
                other => other,
            }
            .as_str()
            .to_owned(),
            output_file_id: job.output_file_id.clone(),
            error_file_id: job.error_file_id.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at.filter(|_| job.status == BatchStatus::Completed),
            cancelled_at: job.completed_at.filter(|_| job.status == BatchStatus::Cancelled),
            expires_at: job.expires_at,
            request_counts: OpenAiRequestCounts {
                total: job.request_counts.total,
                completed: job.request_counts.completed,
                failed: job.request_counts.failed,
            },
            metadata: job.metadata.clone(),
        }
    }
}

impl From<OpenAiBatch> for BatchJob {
    fn from(batch: OpenAiBatch) -> Self {
        let status = BatchStatus::from_openai(&batch.status).unwrap_or_else(|| {
            tracing::warn!(batch_id = %batch.id, status = %batch.status, "unknown batch status");
            BatchStatus::Validating
        });
        let endpoint = BatchEndpoint::parse(&batch.endpoint).unwrap_or(BatchEndpoint::ChatCompletions);

        Self {
            id: batch.id,
            provider: String::new(),
            endpoint,
            status,
            input_file_id: Some(batch.input_file_id).filter(|id| !id.is_empty()),
            output_file_id: batch.output_file_id,
            error_file_id: batch.error_file_id,
            request_counts: BatchRequestCounts {
                total: batch.request_counts.total,
                completed: batch.request_counts.completed,
                failed: batch.request_counts.failed,
            },
            created_at: batch.created_at,
            completed_at: batch.completed_at.or(batch.cancelled_at),
            expires_at: batch.expires_at,
            metadata: batch.metadata,
        }
    }
}

impl From<OpenAiBatchOutputLine> for BatchResultItem {
    fn from(line: OpenAiBatchOutputLine) -> Self {
        match (line.response, line.error) {
            (Some(response), None) if response.status_code < 400 => Self::success(line.custom_id, response.body),
            (Some(response), _) => Self::failure(line.custom_id, response.status_code, response.body),
            (None, Some(error)) => Self::failure(
                line.custom_id,
                500,
                json!({"type": error.code.unwrap_or_else(|| "batch_error".to_owned()), "message": error.message}),
            ),
            (None, None) => Self::failure(line.custom_id, 500, json!({"type": "batch_error", "message": "no response"})),
        }
    }
}

impl From<&BatchResultItem> for OpenAiBatchOutputLine {
    fn from(item: &BatchResultItem) -> Self {
        let body = item.body.clone().or_else(|| item.error.clone().map(|error| json!({"error": error})));

        Self {
            id: Some(format!("batch_req_{}", uuid::Uuid::new_v4().simple())),
            custom_id: item.custom_id.clone(),
            response: body.map(|body| OpenAiBatchOutputResponse {
                status_code: item.status_code,
                request_id: None,
                body,
            }),
            error: item.error.as_ref().filter(|_| item.body.is_none()).map(|error| OpenAiBatchLineError {
                code: error.get("type").and_then(Value::as_str).map(str::to_owned),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_owned(),
            }),
        }
    }
}

// -- Anthropic --

impl From<&FileObject> for AnthropicFile {
    fn from(file: &FileObject) -> Self {
        Self {
            id: file.id.clone(),
            file_type: "file".to_owned(),
            filename: file.filename.clone(),
            mime_type: file
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_owned()),
            size_bytes: file.bytes,
            created_at: rfc3339(file.created_at),
            downloadable: false,
        }
    }
}

impl From<AnthropicFile> for FileObject {
    fn from(file: AnthropicFile) -> Self {
        Self {
            created_at: unix_seconds(&file.created_at),
            id: file.id,
            filename: file.filename,
            purpose: FilePurpose::UserData,
            bytes: file.size_bytes,
            status: FileStatus::Processed,
            content_type: Some(file.mime_type).filter(|mime| !mime.is_empty()),
        }
    }
}

pub fn anthropic_list<T, U>(
    page: &Page<T>,
    id: impl Fn(&T) -> &str,
    convert: impl Fn(&T) -> U,
) -> AnthropicList<U> {
    AnthropicList {
        data: page.data.iter().map(convert).collect(),
        has_more: page.has_more,
        first_id: page.data.first().map(|item| id(item).to_owned()),
        last_id: page.data.last().map(|item| id(item).to_owned()),
    }
}

impl From<&BatchJob> for AnthropicBatch {
    fn from(job: &BatchJob) -> Self {
        let counts = job.request_counts;
        let unfinished = counts.total.saturating_sub(counts.completed + counts.failed);
        let mut request_counts = AnthropicRequestCounts {
            succeeded: counts.completed,
            errored: counts.failed,
            ..AnthropicRequestCounts::default()
        };
        match job.status {
            BatchStatus::Cancelled => request_counts.canceled = unfinished,
            BatchStatus::Expired => request_counts.expired = unfinished,
            status if !status.is_terminal() => request_counts.processing = unfinished,
            _ => {}
        }

        Self {
            id: job.id.clone(),
            batch_type: "message_batch".to_owned(),
            processing_status: job.status.anthropic_processing_status().to_owned(),
            request_counts,
            created_at: rfc3339(job.created_at),
            ended_at: job.completed_at.filter(|_| job.status.is_terminal()).map(rfc3339),
            expires_at: job.expires_at.map(rfc3339),
            cancel_initiated_at: None,
            archived_at: None,
            results_url: job
                .status
                .is_terminal()
                .then(|| format!("/v1/messages/batches/{}/results", job.id)),
        }
    }
}

impl From<AnthropicBatch> for BatchJob {
    fn from(batch: AnthropicBatch) -> Self {
        let counts = batch.request_counts;
        let status = BatchStatus::from_anthropic(&batch.processing_status, &counts).unwrap_or_else(|| {
            tracing::warn!(batch_id = %batch.id, status = %batch.processing_status, "unknown batch status");
            BatchStatus::InProgress
        });

        Self {
            id: batch.id,
            provider: String::new(),
            endpoint: BatchEndpoint::Messages,
            status,
            input_file_id: None,
            output_file_id: None,
            error_file_id: None,
            request_counts: BatchRequestCounts {
                total: counts.processing + counts.succeeded + counts.errored + counts.canceled + counts.expired,
                completed: counts.succeeded,
                failed: counts.errored + counts.canceled + counts.expired,
            },
            created_at: unix_seconds(&batch.created_at),
            completed_at: batch.ended_at.as_deref().map(unix_seconds),
            expires_at: batch.expires_at.as_deref().map(unix_seconds),
            metadata: None,
        }
    }
}

impl From<AnthropicBatchResultLine> for BatchResultItem {
    fn from(line: AnthropicBatchResultLine) -> Self {
        match line.result {
            AnthropicBatchResult::Succeeded { message } => Self::success(line.custom_id, message),
            AnthropicBatchResult::Errored { error } => Self::failure(
                line.custom_id,
                400,
                error.get("error").cloned().unwrap_or(error),
            ),
            AnthropicBatchResult::Canceled => Self::failure(
                line.custom_id,
                CANCELED_STATUS,
                json!({"type": "canceled", "message": "request was canceled before it ran"}),
            ),
            AnthropicBatchResult::Expired => Self::failure(
                line.custom_id,
                EXPIRED_STATUS,
                json!({"type": "expired", "message": "request expired before it ran"}),
            ),
        }
    }
}

impl From<&BatchResultItem> for AnthropicBatchResultLine {
    fn from(item: &BatchResultItem) -> Self {
        let result = match (&item.body, &item.error) {
            (Some(message), None) => AnthropicBatchResult::Succeeded {
                message: message.clone(),
            },
            _ if item.status_code == CANCELED_STATUS => AnthropicBatchResult::Canceled,
            _ if item.status_code == EXPIRED_STATUS => AnthropicBatchResult::Expired,
            (_, error) => AnthropicBatchResult::Errored {
                error: json!({
                    "type": "error",
                    "error": error.clone().unwrap_or_else(|| json!({"type": "api_error", "message": "request failed"})),
                }),
            },
        };

        Self {
            custom_id: item.custom_id.clone(),
            result,
        }
    }
}
