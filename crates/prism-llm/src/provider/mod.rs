//! Provider trait and implementations for LLM backends

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod google;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prism_config::{LlmConfig, LlmProviderType, TimeoutConfig};
use prism_core::RequestContext;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::capability::{ProviderKind, Scenario};
use crate::error::LlmError;
use crate::lifecycle::{
    BatchCreate, BatchJob, BatchResultItem, FileContent, FileObject, FileUpload, ListQuery, Page,
};
use crate::stream::EventStream;
use crate::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, ModelInfo, SpeechAudio,
    SpeechRequest, Transcription, TranscriptionRequest,
};

/// Trait implemented by each LLM provider backend
///
/// Only chat completion is mandatory. Every other operation defaults to
/// `UnsupportedCapability` so a backend opts in by overriding it.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Configured provider name
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Send a non-streaming completion request
    async fn complete(&self, request: &CompletionRequest, context: &RequestContext)
    -> Result<CompletionResponse, LlmError>;

    /// Send a streaming completion request
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<EventStream, LlmError>;

    async fn list_models(&self, _context: &RequestContext) -> Result<Vec<ModelInfo>, LlmError> {
        Err(LlmError::unsupported(self.name(), "models"))
    }

    async fn embed(
        &self,
        _request: &EmbeddingRequest,
        _context: &RequestContext,
    ) -> Result<EmbeddingResponse, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Embeddings.as_str()))
    }

    async fn speech(&self, _request: &SpeechRequest, _context: &RequestContext) -> Result<SpeechAudio, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Speech.as_str()))
    }

    async fn transcribe(
        &self,
        _request: &TranscriptionRequest,
        _context: &RequestContext,
    ) -> Result<Transcription, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Transcription.as_str()))
    }

    async fn upload_file(&self, _upload: &FileUpload, _context: &RequestContext) -> Result<FileObject, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Files.as_str()))
    }

    async fn list_files(&self, _query: &ListQuery, _context: &RequestContext) -> Result<Page<FileObject>, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Files.as_str()))
    }

    async fn retrieve_file(&self, _id: &str, _context: &RequestContext) -> Result<FileObject, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Files.as_str()))
    }

    async fn file_content(&self, _id: &str, _context: &RequestContext) -> Result<FileContent, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::FileDownload.as_str()))
    }

    /// Delete a file, returning its final state
    async fn delete_file(&self, _id: &str, _context: &RequestContext) -> Result<FileObject, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Files.as_str()))
    }

    async fn create_batch(&self, _create: &BatchCreate, _context: &RequestContext) -> Result<BatchJob, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Batch.as_str()))
    }

    async fn list_batches(&self, _query: &ListQuery, _context: &RequestContext) -> Result<Page<BatchJob>, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Batch.as_str()))
    }

    async fn retrieve_batch(&self, _id: &str, _context: &RequestContext) -> Result<BatchJob, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Batch.as_str()))
    }

    async fn cancel_batch(&self, _id: &str, _context: &RequestContext) -> Result<BatchJob, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Batch.as_str()))
    }

    /// Per-request outcomes of a finished batch
    async fn batch_results(
        &self,
        _job: &BatchJob,
        _context: &RequestContext,
    ) -> Result<Vec<BatchResultItem>, LlmError> {
        Err(LlmError::unsupported(self.name(), Scenario::Batch.as_str()))
    }
}

/// Instantiate every configured provider
///
/// # Errors
///
/// Returns an error if a provider cannot be constructed (bad base URL,
/// missing AWS region)
pub async fn build_providers(config: &LlmConfig) -> anyhow::Result<HashMap<String, Arc<dyn Provider>>> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();

    for (name, provider_config) in &config.providers {
        let provider: Arc<dyn Provider> = match &provider_config.provider_type {
            LlmProviderType::Openai => Arc::new(openai::OpenAiProvider::new(name.clone(), provider_config)?),
            LlmProviderType::Anthropic => Arc::new(anthropic::AnthropicProvider::new(name.clone(), provider_config)?),
            LlmProviderType::Google => Arc::new(google::GoogleProvider::new(name.clone(), provider_config)?),
            LlmProviderType::Bedrock(bedrock_config) => Arc::new(
                bedrock::BedrockProvider::new(name.clone(), provider_config, bedrock_config).await?,
            ),
            LlmProviderType::Azure(azure_config) => {
                Arc::new(azure::AzureProvider::new(name.clone(), provider_config, azure_config)?)
            }
        };

        tracing::debug!(provider = %name, kind = %provider.kind(), "provider initialized");
        providers.insert(name.clone(), provider);
    }

    Ok(providers)
}

/// HTTP plumbing shared by the REST backends
///
/// `client` bounds every call end to end. `stream_client` only bounds the
/// connect and the silence between chunks, so long generations are not cut
/// off while a stalled one still is.
pub(crate) struct HttpTransport {
    pub name: String,
    pub client: Client,
    pub stream_client: Client,
    base_url: Url,
    api_key: Option<SecretString>,
    forward_authorization: bool,
}

impl HttpTransport {
    pub fn new(
        name: String,
        base_url: Option<&Url>,
        default_base_url: &str,
        api_key: Option<SecretString>,
        forward_authorization: bool,
        timeouts: &TimeoutConfig,
    ) -> Result<Self, LlmError> {
        let base_url = match base_url {
            Some(url) => url.clone(),
            None => Url::parse(default_base_url)
                .map_err(|e| LlmError::Internal(anyhow::anyhow!("invalid default base URL: {e}")))?,
        };

        let connect = Duration::from_secs(timeouts.connect);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeouts.request))
            .connect_timeout(connect)
            .build()
            .map_err(|e| LlmError::Internal(anyhow::anyhow!("failed to build HTTP client: {e}")))?;
        let stream_client = Client::builder()
            .connect_timeout(connect)
            .read_timeout(Duration::from_secs(timeouts.stream_idle))
            .build()
            .map_err(|e| LlmError::Internal(anyhow::anyhow!("failed to build streaming HTTP client: {e}")))?;

        Ok(Self {
            name,
            client,
            stream_client,
            base_url,
            api_key,
            forward_authorization,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Join `path` onto the base URL, keeping any base path segment
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/{}", path.trim_start_matches('/'))
    }

    /// Caller's forwarded key when enabled, the configured key otherwise
    pub fn api_key(&self, context: &RequestContext) -> Option<String> {
        self.forwarded_key(context).or_else(|| self.configured_key())
    }

    /// Caller's key, only when forwarding is enabled
    pub fn forwarded_key(&self, context: &RequestContext) -> Option<String> {
        if !self.forward_authorization {
            return None;
        }

        context.api_key.as_ref().map(|key| key.expose_secret().to_owned())
    }

    pub fn configured_key(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| k.expose_secret().to_owned())
    }

    /// Send a request, turning transport failures and error statuses into
    /// `Upstream` errors that carry the provider's own message
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, LlmError> {
        let response = builder.send().await.map_err(|e| {
            tracing::error!(provider = %self.name, error = %e, "upstream request failed");
            self.transport_error(&e, "request failed")
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(provider = %self.name, status, "upstream returned error");

        Err(LlmError::upstream(&self.name, Some(status), error_message(&body)))
    }

    fn transport_error(&self, error: &reqwest::Error, context: &str) -> LlmError {
        if error.is_timeout() {
            LlmError::UpstreamTimeout {
                provider: self.name.clone(),
            }
        } else {
            LlmError::upstream(&self.name, None, format!("{context}: {error}"))
        }
    }

    /// Send and decode a JSON body
    pub async fn json<T: serde::de::DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, LlmError> {
        let response = self.send(builder).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(&e, "failed to read response"))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| LlmError::upstream(&self.name, None, format!("failed to parse response: {e}")))
    }

    /// Send and return the raw body with its content type
    pub async fn bytes(&self, builder: RequestBuilder) -> Result<(String, Vec<u8>), LlmError> {
        let response = self.send(builder).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_owned();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(&e, "failed to read response"))?;

        Ok((content_type, bytes.to_vec()))
    }
}

/// Provider error message from an error body
///
/// Every supported wire format nests it under `error.message`; anything
/// else is passed through as-is.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            let error = value.get("error")?;
            error
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| error.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| body.trim().to_owned())
}
