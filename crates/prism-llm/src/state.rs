//! Shared gateway state: dispatch, providers, and the lifecycle manager

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use prism_config::LlmConfig;
use prism_core::RequestContext;

use crate::capability::{CapabilityRegistry, Scenario};
use crate::dispatch::{Dispatcher, ProviderTarget};
use crate::error::LlmError;
use crate::lifecycle::LifecycleManager;
use crate::provider::{self, Provider};
use crate::reconcile::{ResponseShape, StreamAccumulator, classify, reconcile};
use crate::retry::RetryPolicy;
use crate::stream::EventStream;
use crate::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, ModelInfo, SpeechAudio,
    SpeechRequest, StopReason, Transcription, TranscriptionRequest,
};

/// Shared state for LLM route handlers
#[derive(Clone)]
pub struct LlmState {
    inner: Arc<LlmStateInner>,
}

struct LlmStateInner {
    dispatcher: Dispatcher,
    providers: HashMap<String, Arc<dyn Provider>>,
    lifecycle: LifecycleManager,
    retry: RetryPolicy,
}

impl LlmState {
    /// Build state from configuration, constructing all providers
    ///
    /// # Errors
    ///
    /// Returns an error if any provider fails to initialize.
    pub async fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let providers = provider::build_providers(config).await?;
        Ok(Self::with_providers(config, providers))
    }

    /// Build state around already constructed providers
    pub fn with_providers(config: &LlmConfig, providers: HashMap<String, Arc<dyn Provider>>) -> Self {
        let registry = Arc::new(CapabilityRegistry::from_config(config));
        let retry = RetryPolicy::from_config(&config.retry);

        tracing::info!(
            providers = providers.len(),
            capabilities_version = %registry.version(),
            "llm state initialized"
        );

        Self {
            inner: Arc::new(LlmStateInner {
                dispatcher: Dispatcher::new(config, Arc::clone(&registry)),
                lifecycle: LifecycleManager::new(registry, providers.clone(), retry.clone(), &config.lifecycle),
                providers,
                retry,
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        self.inner.dispatcher.registry()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    fn provider(&self, name: &str) -> Result<&Arc<dyn Provider>, LlmError> {
        self.inner.providers.get(name).ok_or_else(|| LlmError::UnknownProvider {
            provider: name.to_owned(),
        })
    }

    /// Provider for model-less operations (files, batches)
    ///
    /// # Errors
    ///
    /// `UnknownProvider` for an unconfigured hint, `InvalidRequest` when
    /// there is neither a hint nor a default provider.
    pub fn lifecycle_provider(&self, context: &RequestContext) -> Result<String, LlmError> {
        self.inner
            .dispatcher
            .resolve_provider(context.provider_hint())
            .map(|(name, _)| name)
    }

    /// Dispatch and run a non-streaming completion
    ///
    /// Returns the resolved target alongside the reconciled response. A
    /// `stream_only` target is called in streaming mode and its events are
    /// folded into one response.
    pub async fn complete(
        &self,
        mut request: CompletionRequest,
        context: &RequestContext,
    ) -> Result<(ProviderTarget, CompletionResponse), LlmError> {
        request.stream = false;
        let target = self.inner.dispatcher.dispatch(&mut request, context)?;
        let provider = self.provider(&target.provider)?;

        let mut response = if target.capabilities.stream_only {
            request.stream = true;
            fold_stream(provider.complete_stream(&request, context).await?).await?
        } else {
            provider.complete(&request, context).await?
        };
        response.content = reconcile(response.content);
        settle_stop_reason(&target, &mut response);

        tracing::debug!(
            provider = %target.provider,
            model = %target.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "completion finished"
        );

        Ok((target, response))
    }

    /// Dispatch and open a normalized completion stream
    ///
    /// Streams are never retried; a failure after this returns surfaces as
    /// an error item in the stream.
    pub async fn complete_stream(
        &self,
        mut request: CompletionRequest,
        context: &RequestContext,
    ) -> Result<(ProviderTarget, EventStream), LlmError> {
        request.stream = true;
        let target = self.inner.dispatcher.dispatch(&mut request, context)?;
        let provider = self.provider(&target.provider)?;

        let stream = provider.complete_stream(&request, context).await?;
        Ok((target, stream))
    }

    pub async fn embed(
        &self,
        mut request: EmbeddingRequest,
        context: &RequestContext,
    ) -> Result<EmbeddingResponse, LlmError> {
        let target = self.target(&request.model, context, Scenario::Embeddings)?;
        request.model.clone_from(&target.model);

        self.provider(&target.provider)?.embed(&request, context).await
    }

    pub async fn speech(&self, mut request: SpeechRequest, context: &RequestContext) -> Result<SpeechAudio, LlmError> {
        let target = self.target(&request.model, context, Scenario::Speech)?;
        request.model.clone_from(&target.model);

        self.provider(&target.provider)?.speech(&request, context).await
    }

    pub async fn transcribe(
        &self,
        mut request: TranscriptionRequest,
        context: &RequestContext,
    ) -> Result<Transcription, LlmError> {
        let target = self.target(&request.model, context, Scenario::Transcription)?;
        request.model.clone_from(&target.model);

        self.provider(&target.provider)?.transcribe(&request, context).await
    }

    fn target(&self, model: &str, context: &RequestContext, scenario: Scenario) -> Result<ProviderTarget, LlmError> {
        let target = self.inner.dispatcher.resolve(model, context.provider_hint())?;
        target.require(scenario)?;
        Ok(target)
    }

    /// Models across all configured providers, ids rendered as aliases or
    /// `provider/model`
    ///
    /// A provider whose listing fails is skipped with a warning so one
    /// outage does not hide every other model.
    pub async fn list_models(&self, context: &RequestContext) -> Vec<ModelInfo> {
        let mut names: Vec<&str> = self.registry().providers().collect();
        names.sort_unstable();

        let mut models = Vec::new();
        for name in names {
            let Ok(provider) = self.provider(name) else {
                continue;
            };

            let listed = self
                .inner
                .retry
                .run("list_models", || provider.list_models(context))
                .await;

            match listed {
                Ok(listed) => models.extend(listed.into_iter().filter_map(|model| {
                    let id = self.inner.dispatcher.display_name(name, &model.id)?;
                    Some(ModelInfo {
                        id,
                        owned_by: model.owned_by.or_else(|| Some(name.to_owned())),
                        ..model
                    })
                })),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "failed to list models");
                }
            }
        }

        models
    }
}

async fn fold_stream(mut stream: EventStream) -> Result<CompletionResponse, LlmError> {
    let mut accumulator = StreamAccumulator::default();
    while let Some(event) = stream.next().await {
        accumulator.push(&event?);
    }
    Ok(accumulator.finish())
}

/// A turn that carries tool calls ends in `tool_use` unless it was cut short
fn settle_stop_reason(target: &ProviderTarget, response: &mut CompletionResponse) {
    match classify(&response.content) {
        ResponseShape::ToolCalls { calls, empty_arguments } => {
            if matches!(response.stop_reason, None | Some(StopReason::EndTurn)) {
                tracing::debug!(
                    provider = %target.provider,
                    calls = ?calls,
                    "tool calls reported with a plain stop reason"
                );
                response.stop_reason = Some(StopReason::ToolUse);
            }

            if !empty_arguments.is_empty() {
                tracing::debug!(ids = ?empty_arguments, "tool calls without arguments");
            }
        }
        ResponseShape::Empty => {
            tracing::warn!(provider = %target.provider, model = %target.model, "upstream returned an empty turn");
        }
        ResponseShape::NoToolCall => {}
    }
}
