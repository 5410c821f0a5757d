//! OpenAI-compatible provider implementation

use async_trait::async_trait;
use prism_config::LlmProviderConfig;
use prism_core::RequestContext;
use reqwest::RequestBuilder;
use reqwest::multipart::{Form, Part};
use url::Url;

use super::{HttpTransport, Provider};
use crate::capability::ProviderKind;
use crate::convert::openai::OpenAiStreamDecoder;
use crate::error::LlmError;
use crate::lifecycle::{
    BatchCreate, BatchJob, BatchResultItem, BatchSource, FileContent, FileObject, FileUpload, ListQuery, Page,
};
use crate::protocol::openai::{
    OpenAiBatch, OpenAiBatchCreate, OpenAiBatchOutputLine, OpenAiEmbeddingRequest, OpenAiEmbeddingResponse, OpenAiFile,
    OpenAiFileDeleted, OpenAiList, OpenAiModelList, OpenAiRequest, OpenAiResponse, OpenAiSpeechRequest,
    OpenAiStreamOptions, OpenAiTranscription,
};
use crate::stream::{self, EventStream};
use crate::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, ModelInfo, SpeechAudio,
    SpeechRequest, Transcription, TranscriptionRequest,
};

/// Default `OpenAI` API base URL
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Whether the provider is the canonical `OpenAI` API (vs a compatible third-party)
fn is_canonical_openai(base_url: &Url) -> bool {
    base_url.host_str().is_some_and(|h| h == "api.openai.com")
}

/// OpenAI-compatible provider
pub struct OpenAiProvider {
    http: HttpTransport,
}

impl OpenAiProvider {
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
            Some(key) => builder.bearer_auth(key),
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
            Some(after) => builder.query(&[("after", after)]),
            None => builder,
        }
    }

    fn page<T, U: From<T>>(list: OpenAiList<T>) -> Page<U> {
        Page {
            data: list.data.into_iter().map(U::from).collect(),
            has_more: list.has_more,
            last_id: list.last_id,
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.http.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<CompletionResponse, LlmError> {
        let mut wire_request = OpenAiRequest::from(request);
        wire_request.stream = None;

        let response: OpenAiResponse = self
            .http
            .json(self.post("chat/completions", context).json(&wire_request))
            .await?;

        Ok(response.into())
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<EventStream, LlmError> {
        let mut wire_request = OpenAiRequest::from(request);
        wire_request.stream = Some(true);

        // Only send stream_options to canonical OpenAI; many compatible
        // APIs reject the unsupported parameter
        wire_request.stream_options =
            is_canonical_openai(self.http.base_url()).then_some(OpenAiStreamOptions { include_usage: true });

        let response = self
            .http
            .send(self.post_stream("chat/completions", context).json(&wire_request))
            .await?;

        Ok(stream::normalize(
            self.name(),
            &request.model,
            stream::sse_events(self.name(), response),
            OpenAiStreamDecoder::new(self.name()),
        ))
    }

    async fn list_models(&self, context: &RequestContext) -> Result<Vec<ModelInfo>, LlmError> {
        let list: OpenAiModelList = self.http.json(self.get("models", context)).await?;

        Ok(list
            .data
            .into_iter()
            .map(|model| ModelInfo {
                created_at: i64::try_from(model.created).ok().filter(|created| *created > 0),
                owned_by: Some(model.owned_by).filter(|owner| !owner.is_empty()),
                ..ModelInfo::new(model.id)
            })
            .collect())
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        context: &RequestContext,
    ) -> Result<EmbeddingResponse, LlmError> {
        let wire_request = OpenAiEmbeddingRequest::from(request);
        let response: OpenAiEmbeddingResponse = self
            .http
            .json(self.post("embeddings", context).json(&wire_request))
            .await?;

        response.try_into()
    }

    async fn speech(&self, request: &SpeechRequest, context: &RequestContext) -> Result<SpeechAudio, LlmError> {
        let wire_request = OpenAiSpeechRequest::from(request);
        let (content_type, audio) = self
            .http
            .bytes(self.post("audio/speech", context).json(&wire_request))
            .await?;

        Ok(SpeechAudio { content_type, audio })
    }

    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        context: &RequestContext,
    ) -> Result<Transcription, LlmError> {
        let file = Part::bytes(request.audio.clone())
            .file_name(request.filename.clone())
            .mime_str(&request.content_type)
            .map_err(|e| LlmError::InvalidRequest(format!("invalid audio content type: {e}")))?;

        let mut form = Form::new()
            .part("file", file)
            .text("model", request.model.clone())
            .text("response_format", "json");
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(temperature) = request.temperature {
            form = form.text("temperature", temperature.to_string());
        }

        let response: OpenAiTranscription = self
            .http
            .json(self.post("audio/transcriptions", context).multipart(form))
            .await?;

        Ok(response.into())
    }

    async fn upload_file(&self, upload: &FileUpload, context: &RequestContext) -> Result<FileObject, LlmError> {
        let part = Part::bytes(upload.data.clone())
            .file_name(upload.filename.clone())
            .mime_str(&upload.content_type)
            .map_err(|e| LlmError::InvalidRequest(format!("invalid file content type: {e}")))?;
        let form = Form::new()
            .text("purpose", upload.purpose.as_str())
            .part("file", part);

        let file: OpenAiFile = self.http.json(self.post("files", context).multipart(form)).await?;
        Ok(file.into())
    }

    async fn list_files(&self, query: &ListQuery, context: &RequestContext) -> Result<Page<FileObject>, LlmError> {
        let list: OpenAiList<OpenAiFile> = self
            .http
            .json(Self::paged(self.get("files", context), query))
            .await?;

        Ok(Self::page(list))
    }

    async fn retrieve_file(&self, id: &str, context: &RequestContext) -> Result<FileObject, LlmError> {
        let file: OpenAiFile = self.http.json(self.get(&format!("files/{id}"), context)).await?;
        Ok(file.into())
    }

    async fn file_content(&self, id: &str, context: &RequestContext) -> Result<FileContent, LlmError> {
        let (content_type, data) = self
            .http
            .bytes(self.get(&format!("files/{id}/content"), context))
            .await?;

        Ok(FileContent { content_type, data })
    }

    async fn delete_file(&self, id: &str, context: &RequestContext) -> Result<FileObject, LlmError> {
        // Fetch first so the caller gets the full object back
        let file = self.retrieve_file(id, context).await?;

        let path = format!("files/{id}");
        let deleted: OpenAiFileDeleted = self
            .http
            .json(self.authorize(self.http.client.delete(self.http.url(&path)), context))
            .await?;

        if !deleted.deleted {
            return Err(LlmError::upstream(self.name(), None, format!("file '{id}' was not deleted")));
        }

        Ok(file)
    }

    async fn create_batch(&self, create: &BatchCreate, context: &RequestContext) -> Result<BatchJob, LlmError> {
        let BatchSource::File(input_file_id) = &create.source else {
            return Err(LlmError::InvalidRequest(
                "OpenAI batches need an uploaded input file".to_owned(),
            ));
        };

        let body = OpenAiBatchCreate {
            input_file_id: input_file_id.clone(),
            endpoint: create.endpoint.path().to_owned(),
            completion_window: create.completion_window.clone(),
            metadata: create.metadata.clone(),
        };

        let batch: OpenAiBatch = self.http.json(self.post("batches", context).json(&body)).await?;
        Ok(batch.into())
    }

    async fn list_batches(&self, query: &ListQuery, context: &RequestContext) -> Result<Page<BatchJob>, LlmError> {
        let list: OpenAiList<OpenAiBatch> = self
            .http
            .json(Self::paged(self.get("batches", context), query))
            .await?;

        Ok(Self::page(list))
    }

    async fn retrieve_batch(&self, id: &str, context: &RequestContext) -> Result<BatchJob, LlmError> {
        let batch: OpenAiBatch = self.http.json(self.get(&format!("batches/{id}"), context)).await?;
        Ok(batch.into())
    }

    async fn cancel_batch(&self, id: &str, context: &RequestContext) -> Result<BatchJob, LlmError> {
        let batch: OpenAiBatch = self
            .http
            .json(self.post(&format!("batches/{id}/cancel"), context))
            .await?;

        Ok(batch.into())
    }

    async fn batch_results(&self, job: &BatchJob, context: &RequestContext) -> Result<Vec<BatchResultItem>, LlmError> {
        let mut items = Vec::new();

        for file_id in [&job.output_file_id, &job.error_file_id].into_iter().flatten() {
            let content = self.file_content(file_id, context).await?;
            let text = String::from_utf8_lossy(&content.data);

            for line in text.lines().filter(|line| !line.trim().is_empty()) {
                match serde_json::from_str::<OpenAiBatchOutputLine>(line) {
                    Ok(line) => items.push(BatchResultItem::from(line)),
                    Err(e) => {
                        tracing::warn!(provider = %self.name(), file_id = %file_id, error = %e, "skipping malformed batch output line");
                    }
                }
            }
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_host_detection() {
        assert!(is_canonical_openai(&Url::parse("https://api.openai.com/v1").unwrap()));
        assert!(!is_canonical_openai(&Url::parse("https://integrate.api.nvidia.com/v1").unwrap()));
    }
}
