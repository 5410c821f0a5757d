//! Anthropic Messages API provider implementation

use async_trait::async_trait;
use prism_config::LlmProviderConfig;
use prism_core::RequestContext;
use reqwest::RequestBuilder;
use reqwest::multipart::{Form, Part};

use super::{HttpTransport, Provider};
use crate::capability::ProviderKind;
use crate::convert::anthropic::AnthropicStreamDecoder;
use crate::error::LlmError;
use crate::lifecycle::batch::render_completion;
use crate::lifecycle::{
    BatchCreate, BatchEndpoint, BatchJob, BatchResultItem, BatchSource, FileObject, FileUpload, ListQuery, Page,
};
use crate::protocol::anthropic::{
    AnthropicBatch, AnthropicBatchCreate, AnthropicBatchRequest, AnthropicBatchResultLine, AnthropicFile,
    AnthropicFileDeleted, AnthropicList, AnthropicModel, AnthropicRequest, AnthropicResponse,
};
use crate::stream::{self, EventStream};
use crate::types::{CompletionRequest, CompletionResponse, ModelInfo};

/// Default Anthropic API base URL
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Anthropic API version header value
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Beta flag required by the Files API
const FILES_BETA: &str = "files-api-2025-04-14";

/// Anthropic Messages API provider
pub struct AnthropicProvider {
    http: HttpTransport,
}

impl AnthropicProvider {
    /// Create from provider configuration
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Internal` if the base URL is invalid.
    pub fn new(name: String, config: &LlmProviderConfig) -> Result<Self, LlmError> {
        Ok(Self {
            http: HttpTransport::new(
                name,
                config.base_url.as_ref(),
                DEFAULT_BASE_URL,
                config.api_key.clone(),
                config.forward_authorization,
                &config.timeouts,
            )?,
        })
    }

    fn authorize(&self, builder: RequestBuilder, context: &RequestContext) -> RequestBuilder {
        let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        match self.http.api_key(context) {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    fn get(&self, path: &str, context: &RequestContext) -> RequestBuilder {
        self.authorize(self.http.client.get(self.http.url(path)), context)
    }

    fn post(&self, path: &str, context: &RequestContext) -> RequestBuilder {
        self.authorize(self.http.client.post(self.http.url(path)), context)
    }

    fn post_stream(&self, path: &str, context: &RequestContext) -> RequestBuilder {
        self.authorize(self.http.stream_client.post(self.http.url(path)), context)
    }

    fn paged(builder: RequestBuilder, query: &ListQuery) -> RequestBuilder {
        let builder = builder.query(&[("limit", query.limit_or(20))]);
        match &query.after {
            Some(after) => builder.query(&[("after_id", after)]),
            None => builder,
        }
    }

    fn page<T, U: From<T>>(list: AnthropicList<T>) -> Page<U> {
        Page {
            data: list.data.into_iter().map(U::from).collect(),
            has_more: list.has_more,
            last_id: list.last_id,
        }
    }

    /// Native request params for one inline batch item
    fn batch_params(&self, create: &BatchCreate) -> Result<Vec<AnthropicBatchRequest>, LlmError> {
        let BatchSource::Inline(items) = &create.source else {
            return Err(LlmError::InvalidRequest(
                "Anthropic batches take inline requests".to_owned(),
            ));
        };

        let prefix = format!("{}/", self.name());
        items
            .iter()
            .map(|item| {
                let mut request = item.completion_request(create.endpoint)?;
                if let Some(model) = request.model.strip_prefix(&prefix) {
                    request.model = model.to_owned();
                }
                request.stream = false;

                Ok(AnthropicBatchRequest {
                    custom_id: item.custom_id.clone(),
                    params: AnthropicRequest::from(&request),
                })
            })
            .collect()
    }
}

/// Re-render a native message body for a batch created through another endpoint
fn render_result(mut item: BatchResultItem, endpoint: BatchEndpoint) -> BatchResultItem {
    if endpoint == BatchEndpoint::Messages {
        return item;
    }

    if let Some(body) = item.body.take() {
        match serde_json::from_value::<AnthropicResponse>(body.clone()) {
            Ok(message) => item.body = Some(render_completion(endpoint, &CompletionResponse::from(message))),
            Err(e) => {
                tracing::warn!(custom_id = %item.custom_id, error = %e, "batch result is not a message; passing through");
                item.body = Some(body);
            }
        }
    }

    item
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.http.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<CompletionResponse, LlmError> {
        let mut wire_request = AnthropicRequest::from(request);
        wire_request.stream = None;

        let response: AnthropicResponse = self
            .http
            .json(self.post("messages", context).json(&wire_request))
            .await?;

        Ok(response.into())
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<EventStream, LlmError> {
        let mut wire_request = AnthropicRequest::from(request);
        wire_request.stream = Some(true);

        let response = self
            .http
            .send(self.post_stream("messages", context).json(&wire_request))
            .await?;

        Ok(stream::normalize(
            self.name(),
            &request.model,
            stream::sse_events(self.name(), response),
            AnthropicStreamDecoder::new(self.name()),
        ))
    }

    async fn list_models(&self, context: &RequestContext) -> Result<Vec<ModelInfo>, LlmError> {
        let list: AnthropicList<AnthropicModel> = self
            .http
            .json(self.get("models", context).query(&[("limit", 1000)]))
            .await?;

        Ok(list
            .data
            .into_iter()
            .map(|model| ModelInfo {
                display_name: model.display_name,
                created_at: model.created_at.as_deref().and_then(crate::convert::unix_seconds),
                owned_by: Some("anthropic".to_owned()),
                ..ModelInfo::new(model.id)
            })
            .collect())
    }

    async fn upload_file(&self, upload: &FileUpload, context: &RequestContext) -> Result<FileObject, LlmError> {
        let part = Part::bytes(upload.data.clone())
            .file_name(upload.filename.clone())
            .mime_str(&upload.content_type)
            .map_err(|e| LlmError::InvalidRequest(format!("invalid file content type: {e}")))?;

        let file: AnthropicFile = self
            .http
            .json(
                self.post("files", context)
                    .header("anthropic-beta", FILES_BETA)
                    .multipart(Form::new().part("file", part)),
            )
            .await?;

        Ok(FileObject {
            purpose: upload.purpose,
            ..file.into()
        })
    }

    async fn list_files(&self, query: &ListQuery, context: &RequestContext) -> Result<Page<FileObject>, LlmError> {
        let list: AnthropicList<AnthropicFile> = self
            .http
            .json(Self::paged(self.get("files", context), query).header("anthropic-beta", FILES_BETA))
            .await?;

        Ok(Self::page(list))
    }

    async fn retrieve_file(&self, id: &str, context: &RequestContext) -> Result<FileObject, LlmError> {
        let file: AnthropicFile = self
            .http
            .json(self.get(&format!("files/{id}"), context).header("anthropic-beta", FILES_BETA))
            .await?;

        Ok(file.into())
    }

    async fn delete_file(&self, id: &str, context: &RequestContext) -> Result<FileObject, LlmError> {
        let file = self.retrieve_file(id, context).await?;

        let path = format!("files/{id}");
        let _: AnthropicFileDeleted = self
            .http
            .json(
                self.authorize(self.http.client.delete(self.http.url(&path)), context)
                    .header("anthropic-beta", FILES_BETA),
            )
            .await?;

        Ok(file)
    }

    async fn create_batch(&self, create: &BatchCreate, context: &RequestContext) -> Result<BatchJob, LlmError> {
        let body = AnthropicBatchCreate {
            requests: self.batch_params(create)?,
        };

        let batch: AnthropicBatch = self
            .http
            .json(self.post("messages/batches", context).json(&body))
            .await?;

        Ok(BatchJob {
            endpoint: create.endpoint,
            metadata: create.metadata.clone(),
            ..batch.into()
        })
    }

    async fn list_batches(&self, query: &ListQuery, context: &RequestContext) -> Result<Page<BatchJob>, LlmError> {
        let list: AnthropicList<AnthropicBatch> = self
            .http
            .json(Self::paged(self.get("messages/batches", context), query))
            .await?;

        Ok(Self::page(list))
    }

    async fn retrieve_batch(&self, id: &str, context: &RequestContext) -> Result<BatchJob, LlmError> {
        let batch: AnthropicBatch = self
            .http
            .json(self.get(&format!("messages/batches/{id}"), context))
            .await?;

        Ok(batch.into())
    }

    async fn cancel_batch(&self, id: &str, context: &RequestContext) -> Result<BatchJob, LlmError> {
        let batch: AnthropicBatch = self
            .http
            .json(self.post(&format!("messages/batches/{id}/cancel"), context))
            .await?;

        Ok(batch.into())
    }

    async fn batch_results(&self, job: &BatchJob, context: &RequestContext) -> Result<Vec<BatchResultItem>, LlmError> {
        let (_, data) = self
            .http
            .bytes(self.get(&format!("messages/batches/{}/results", job.id), context))
            .await?;

        let text = String::from_utf8_lossy(&data);
        let mut items = Vec::new();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<AnthropicBatchResultLine>(line) {
                Ok(line) => items.push(render_result(BatchResultItem::from(line), job.endpoint)),
                Err(e) => {
                    tracing::warn!(provider = %self.name(), batch_id = %job.id, error = %e, "skipping malformed batch result line");
                }
            }
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::lifecycle::BatchRequestItem;

    fn provider() -> AnthropicProvider {
        let config: prism_config::LlmProviderConfig = toml::from_str(r#"type = "anthropic""#).unwrap();
        AnthropicProvider::new("claude".to_owned(), &config).unwrap()
    }

    #[test]
    fn chat_batch_items_become_native_params() {
        let create = BatchCreate {
            endpoint: BatchEndpoint::ChatCompletions,
            source: BatchSource::Inline(vec![BatchRequestItem {
                custom_id: "req-1".to_owned(),
                method: "POST".to_owned(),
                url: "/v1/chat/completions".to_owned(),
                body: json!({
                    "model": "claude/claude-3-5-haiku-20241022",
                    "messages": [
                        {"role": "system", "content": "Be terse."},
                        {"role": "user", "content": "hi"}
                    ]
                }),
            }]),
            completion_window: "24h".to_owned(),
            metadata: None,
        };

        let params = provider().batch_params(&create).unwrap();
        assert_eq!(params[0].custom_id, "req-1");
        assert_eq!(params[0].params.model, "claude-3-5-haiku-20241022");
        assert!(params[0].params.system.is_some());
        assert!(params[0].params.stream.is_none());
    }

    #[test]
    fn results_are_rendered_for_the_creating_endpoint() {
        let message = json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-haiku-20241022",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 1}
        });

        let item = render_result(BatchResultItem::success("a", message.clone()), BatchEndpoint::ChatCompletions);
        let body = item.body.unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "hello");

        let native = render_result(BatchResultItem::success("a", message.clone()), BatchEndpoint::Messages);
        assert_eq!(native.body, Some(message));
    }
}
