//! Google Generative Language API provider implementation

use async_trait::async_trait;
use prism_config::LlmProviderConfig;
use prism_core::RequestContext;
use reqwest::RequestBuilder;

use super::{HttpTransport, Provider};
use crate::capability::ProviderKind;
use crate::convert::google::{GoogleStreamDecoder, embedding_response, model_resource};
use crate::error::LlmError;
use crate::lifecycle::batch::render_completion;
use crate::lifecycle::{
    BatchCreate, BatchEndpoint, BatchJob, BatchRequestCounts, BatchResultItem, BatchSource, BatchStatus, ListQuery,
    Page,
};
use crate::protocol::google::{
    GoogleBatchConfig, GoogleBatchCreate, GoogleBatchEmbedRequest, GoogleBatchEmbedResponse, GoogleBatchInputConfig,
    GoogleBatchKey, GoogleBatchList, GoogleBatchOperation, GoogleInlinedRequest, GoogleInlinedRequests,
    GoogleInlinedResponse, GoogleModelList, GoogleRequest, GoogleResponse,
};
use crate::stream::{self, EventStream};
use crate::types::{CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, ModelInfo};

/// Default Google Generative Language API base URL
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const BATCH_PREFIX: &str = "batches/";

/// Google Gemini provider
pub struct GoogleProvider {
    http: HttpTransport,
}

impl GoogleProvider {
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
        match self.http.api_key(context) {
            Some(key) => builder.header("x-goog-api-key", key),
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

    async fn operation(&self, id: &str, context: &RequestContext) -> Result<GoogleBatchOperation, LlmError> {
        self.http
            .json(self.get(&format!("{BATCH_PREFIX}{}", batch_id(id)), context))
            .await
    }

    /// Native inline batch; every request must target the same model
    fn batch_body(&self, create: &BatchCreate) -> Result<(String, GoogleBatchCreate), LlmError> {
        let BatchSource::Inline(items) = &create.source else {
            return Err(LlmError::InvalidRequest("Google batches take inline requests".to_owned()));
        };

        let prefix = format!("{}/", self.name());
        let mut model: Option<String> = None;
        let mut requests = Vec::with_capacity(items.len());

        for item in items {
            let request = item.completion_request(create.endpoint)?;
            let item_model = request.model.strip_prefix(&prefix).unwrap_or(&request.model).to_owned();

            match &model {
                Some(first) if *first != item_model => {
                    return Err(LlmError::InvalidRequest(format!(
                        "all requests in a Google batch must use the same model; found '{first}' and '{item_model}'"
                    )));
                }
                Some(_) => {}
                None => model = Some(item_model),
            }

            requests.push(GoogleInlinedRequest {
                request: GoogleRequest::from(&request),
                metadata: GoogleBatchKey {
                    key: item.custom_id.clone(),
                },
            });
        }

        let Some(model) = model else {
            return Err(LlmError::InvalidRequest("batch has no requests".to_owned()));
        };

        let body = GoogleBatchCreate {
            batch: GoogleBatchConfig {
                display_name: format!("prism-{}", uuid::Uuid::new_v4().simple()),
                input_config: GoogleBatchInputConfig {
                    requests: GoogleInlinedRequests { requests },
                },
            },
        };

        Ok((model, body))
    }
}

/// Bare id from a `batches/{id}` resource name
fn batch_id(name: &str) -> &str {
    name.strip_prefix(BATCH_PREFIX).unwrap_or(name)
}

impl From<&GoogleBatchOperation> for BatchJob {
    fn from(operation: &GoogleBatchOperation) -> Self {
        let metadata = operation.metadata.clone().unwrap_or_default();
        let name = if operation.name.is_empty() { &metadata.name } else { &operation.name };

        let status = BatchStatus::from_gemini(&metadata.state).unwrap_or_else(|| {
            if operation.done {
                BatchStatus::Completed
            } else {
                tracing::debug!(batch = %name, state = %metadata.state, "unknown batch state");
                BatchStatus::Validating
            }
        });

        let stats = &metadata.batch_stats;
        Self {
            id: batch_id(name).to_owned(),
            provider: String::new(),
            endpoint: BatchEndpoint::ChatCompletions,
            status,
            input_file_id: None,
            output_file_id: None,
            error_file_id: None,
            request_counts: BatchRequestCounts {
                total: stats.request_count,
                completed: stats.successful_request_count,
                failed: stats.failed_request_count,
            },
            created_at: metadata
                .create_time
                .as_deref()
                .and_then(crate::convert::unix_seconds)
                .unwrap_or_default(),
            completed_at: None,
            expires_at: None,
            metadata: None,
        }
    }
}

fn result_item(response: GoogleInlinedResponse, index: usize, endpoint: BatchEndpoint) -> BatchResultItem {
    let custom_id = response
        .metadata
        .map_or_else(|| format!("request-{index}"), |metadata| metadata.key);

    if let Some(error) = response.error {
        let status = u16::try_from(error.code).ok().filter(|code| *code >= 400).unwrap_or(500);
        return BatchResultItem::failure(
            custom_id,
            status,
            serde_json::json!({"type": "upstream_error", "message": error.message}),
        );
    }

    let Some(body) = response.response else {
        return BatchResultItem::failure(
            custom_id,
            500,
            serde_json::json!({"type": "upstream_error", "message": "no response"}),
        );
    };

    match serde_json::from_value::<GoogleResponse>(body.clone()) {
        Ok(native) => BatchResultItem::success(custom_id, render_completion(endpoint, &CompletionResponse::from(native))),
        Err(e) => {
            tracing::warn!(custom_id = %custom_id, error = %e, "batch response is not a generateContent response");
            BatchResultItem::success(custom_id, body)
        }
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        &self.http.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<CompletionResponse, LlmError> {
        let wire_request = GoogleRequest::from(request);
        let path = format!("{}:generateContent", model_resource(&request.model));

        let response: GoogleResponse = self.http.json(self.post(&path, context).json(&wire_request)).await?;

        let mut response = CompletionResponse::from(response);
        if response.model.is_empty() {
            response.model.clone_from(&request.model);
        }
        Ok(response)
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<EventStream, LlmError> {
        let wire_request = GoogleRequest::from(request);
        let path = format!("{}:streamGenerateContent", model_resource(&request.model));

        let response = self
            .http
            .send(
                self.post_stream(&path, context)
                    .query(&[("alt", "sse")])
                    .json(&wire_request),
            )
            .await?;

        Ok(stream::normalize(
            self.name(),
            &request.model,
            stream::sse_events(self.name(), response),
            GoogleStreamDecoder::new(self.name()),
        ))
    }

    async fn list_models(&self, context: &RequestContext) -> Result<Vec<ModelInfo>, LlmError> {
        let list: GoogleModelList = self
            .http
            .json(self.get("models", context).query(&[("pageSize", 1000)]))
            .await?;

        Ok(list
            .models
            .into_iter()
            .map(|model| ModelInfo {
                display_name: model.display_name,
                owned_by: Some("google".to_owned()),
                ..ModelInfo::new(model.name.trim_start_matches("models/"))
            })
            .collect())
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        context: &RequestContext,
    ) -> Result<EmbeddingResponse, LlmError> {
        let wire_request = GoogleBatchEmbedRequest::from(request);
        let path = format!("{}:batchEmbedContents", model_resource(&request.model));

        let response: GoogleBatchEmbedResponse = self.http.json(self.post(&path, context).json(&wire_request)).await?;

        Ok(embedding_response(&request.model, response))
    }

    async fn create_batch(&self, create: &BatchCreate, context: &RequestContext) -> Result<BatchJob, LlmError> {
        let (model, body) = self.batch_body(create)?;
        let path = format!("{}:batchGenerateContent", model_resource(&model));

        let operation: GoogleBatchOperation = self.http.json(self.post(&path, context).json(&body)).await?;

        Ok(BatchJob {
            endpoint: create.endpoint,
            metadata: create.metadata.clone(),
            ..BatchJob::from(&operation)
        })
    }

    /// `after` carries Google's opaque page token
    async fn list_batches(&self, query: &ListQuery, context: &RequestContext) -> Result<Page<BatchJob>, LlmError> {
        let mut builder = self.get("batches", context).query(&[("pageSize", query.limit_or(20))]);
        if let Some(token) = &query.after {
            builder = builder.query(&[("pageToken", token)]);
        }

        let list: GoogleBatchList = self.http.json(builder).await?;

        Ok(Page {
            data: list.operations.iter().map(BatchJob::from).collect(),
            has_more: list.next_page_token.is_some(),
            last_id: list.next_page_token,
        })
    }

    async fn retrieve_batch(&self, id: &str, context: &RequestContext) -> Result<BatchJob, LlmError> {
        let operation = self.operation(id, context).await?;
        Ok(BatchJob::from(&operation))
    }

    async fn cancel_batch(&self, id: &str, context: &RequestContext) -> Result<BatchJob, LlmError> {
        self.http
            .send(self.post(&format!("{BATCH_PREFIX}{}:cancel", batch_id(id)), context))
            .await?;

        // Cancel returns an empty body; report the state it left behind
        let mut job = self.retrieve_batch(id, context).await?;
        if !job.status.is_terminal() {
            job.status = BatchStatus::Cancelling;
        }
        Ok(job)
    }

    async fn batch_results(&self, job: &BatchJob, context: &RequestContext) -> Result<Vec<BatchResultItem>, LlmError> {
        let operation = self.operation(&job.id, context).await?;

        let output = operation
            .response
            .or_else(|| operation.metadata.and_then(|metadata| metadata.output))
            .unwrap_or_default();

        if output.responses_file.is_some() && output.inlined_responses.is_none() {
            return Err(LlmError::unsupported(self.name(), "file_backed_batch_results"));
        }

        Ok(output
            .inlined_responses
            .map(|responses| responses.inlined_responses)
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, response)| result_item(response, index, job.endpoint))
            .collect())
    }
}
