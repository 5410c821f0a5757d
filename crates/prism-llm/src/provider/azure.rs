//! Azure OpenAI provider
//!
//! Azure serves the `OpenAI` chat and embeddings formats, but every route
//! is scoped to a deployment: `{endpoint}/openai/deployments/{deployment}/{path}`
//! with a mandatory `api-version` query parameter. Models are mapped to
//! deployments through configuration; a model without one is not served.

use async_trait::async_trait;
use indexmap::IndexMap;
use prism_config::{AzureConfig, LlmProviderConfig};
use prism_core::RequestContext;
use reqwest::RequestBuilder;

use super::{HttpTransport, Provider};
use crate::capability::ProviderKind;
use crate::convert::openai::OpenAiStreamDecoder;
use crate::error::LlmError;
use crate::protocol::openai::{OpenAiEmbeddingRequest, OpenAiEmbeddingResponse, OpenAiRequest, OpenAiResponse};
use crate::stream::{self, EventStream};
use crate::types::{CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, ModelInfo};

const DEFAULT_API_VERSION: &str = "2024-02-01";

pub struct AzureProvider {
    http: HttpTransport,
    /// Model name -> deployment name
    deployments: IndexMap<String, String>,
    api_version: String,
}

impl AzureProvider {
    /// Create from provider configuration; `base_url` is the resource endpoint
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Internal` when no endpoint is configured.
    pub fn new(name: String, config: &LlmProviderConfig, azure: &AzureConfig) -> Result<Self, LlmError> {
        let Some(endpoint) = config.base_url.as_ref() else {
            return Err(LlmError::Internal(anyhow::anyhow!(
                "azure provider '{name}' needs base_url set to its resource endpoint"
            )));
        };

        Ok(Self {
            http: HttpTransport::new(
                name,
                Some(endpoint),
                endpoint.as_str(),
                config.api_key.clone(),
                config.forward_authorization,
                &config.timeouts,
            )?,
            deployments: azure.deployments.clone(),
            api_version: azure
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_owned()),
        })
    }

    fn deployment_url(&self, model: &str, path: &str) -> Result<String, LlmError> {
        let Some(deployment) = self.deployments.get(model) else {
            tracing::debug!(provider = %self.http.name, model, "no deployment configured for model");
            return Err(LlmError::ModelNotFound {
                model: model.to_owned(),
            });
        };

        Ok(self.http.url(&format!("openai/deployments/{deployment}/{path}")))
    }

    /// A forwarded caller token goes out as a bearer token, the configured
    /// key as `api-key`
    fn authorize(&self, builder: RequestBuilder, context: &RequestContext) -> RequestBuilder {
        let builder = builder.query(&[("api-version", self.api_version.as_str())]);

        if let Some(token) = self.http.forwarded_key(context) {
            return builder.bearer_auth(token);
        }

        match self.http.configured_key() {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    fn post(&self, model: &str, path: &str, context: &RequestContext) -> Result<RequestBuilder, LlmError> {
        let url = self.deployment_url(model, path)?;
        Ok(self.authorize(self.http.client.post(url), context))
    }

    fn post_stream(&self, model: &str, path: &str, context: &RequestContext) -> Result<RequestBuilder, LlmError> {
        let url = self.deployment_url(model, path)?;
        Ok(self.authorize(self.http.stream_client.post(url), context))
    }
}

#[async_trait]
impl Provider for AzureProvider {
    fn name(&self) -> &str {
        &self.http.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<CompletionResponse, LlmError> {
        let mut wire_request = OpenAiRequest::from(request);
        wire_request.stream = None;

        let builder = self.post(&request.model, "chat/completions", context)?;
        let response: OpenAiResponse = self.http.json(builder.json(&wire_request)).await?;

        Ok(response.into())
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<EventStream, LlmError> {
        let mut wire_request = OpenAiRequest::from(request);
        wire_request.stream = Some(true);

        let builder = self.post_stream(&request.model, "chat/completions", context)?;
        let response = self.http.send(builder.json(&wire_request)).await?;

        Ok(stream::normalize(
            self.name(),
            &request.model,
            stream::sse_events(self.name(), response),
            OpenAiStreamDecoder::new(self.name()),
        ))
    }

    /// Configured deployments; Azure has no deployment-scoped listing
    async fn list_models(&self, _context: &RequestContext) -> Result<Vec<ModelInfo>, LlmError> {
        Ok(self.deployments.keys().cloned().map(ModelInfo::new).collect())
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        context: &RequestContext,
    ) -> Result<EmbeddingResponse, LlmError> {
        let wire_request = OpenAiEmbeddingRequest::from(request);
        let builder = self.post(&request.model, "embeddings", context)?;
        let response: OpenAiEmbeddingResponse = self.http.json(builder.json(&wire_request)).await?;

        response.try_into()
    }
}
