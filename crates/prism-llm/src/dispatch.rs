//! Dispatch router
//!
//! Resolves the target provider for a request, applies the translation
//! policy, and rejects anything the target cannot serve before a single
//! upstream byte is sent.
//!
//! Resolution order:
//! 1. a `provider/model` prefix in the model string
//! 2. the `x-model-provider` header
//! 3. a configured alias that belongs to exactly one provider
//! 4. `default_provider` from configuration

use std::collections::HashMap;
use std::sync::Arc;

use prism_config::LlmConfig;
use prism_core::RequestContext;
use regex::Regex;

use crate::capability::{CapabilityRegistry, CapabilitySet, ProviderKind, Scenario};
use crate::convert::policy::{self, Adjustment};
use crate::error::LlmError;
use crate::reconcile::ToolCallLedger;
use crate::types::CompletionRequest;

/// Provider names that always denote a provider when used as a prefix
///
/// A prefix outside this list that is not configured either is treated as
/// part of the model name (`meta-llama/Llama-3.1-8B` on a compatible host).
const WELL_KNOWN_PROVIDERS: &[&str] = &[
    "openai",
    "azure",
    "anthropic",
    "bedrock",
    "vertex",
    "gemini",
    "google",
    "cohere",
    "mistral",
    "groq",
    "ollama",
    "openrouter",
    "xai",
    "perplexity",
    "cerebras",
    "elevenlabs",
    "huggingface",
    "parasail",
    "sgl",
    "vllm",
];

/// Resolved destination of one request
///
/// Built at request entry and dropped once the response has been sent.
#[derive(Debug, Clone)]
pub struct ProviderTarget {
    /// Provider name from configuration
    pub provider: String,
    pub kind: ProviderKind,
    /// Upstream model id, aliases already resolved
    pub model: String,
    pub capabilities: CapabilitySet,
}

impl ProviderTarget {
    /// Fail with `UnsupportedCapability` unless the target supports `scenario`
    pub fn require(&self, scenario: Scenario) -> Result<(), LlmError> {
        if self.capabilities.supports(scenario) {
            Ok(())
        } else {
            Err(LlmError::unsupported(&self.provider, scenario.as_str()))
        }
    }
}

#[derive(Debug, Default)]
struct ProviderModels {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    /// alias -> upstream model id
    reverse_aliases: HashMap<String, String>,
    /// upstream model id -> alias
    aliases: HashMap<String, String>,
}

impl ProviderModels {
    fn is_allowed(&self, model: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(model)) {
            return false;
        }

        !self.exclude.iter().any(|re| re.is_match(model))
    }

    fn resolve_alias<'a>(&'a self, model: &'a str) -> &'a str {
        self.reverse_aliases.get(model).map_or(model, String::as_str)
    }
}

/// Routes requests to configured providers
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    default_provider: Option<String>,
    models: HashMap<String, ProviderModels>,
}

impl Dispatcher {
    pub fn new(config: &LlmConfig, registry: Arc<CapabilityRegistry>) -> Self {
        let models = config
            .providers
            .iter()
            .map(|(name, provider)| {
                let compile = |patterns: &[String]| {
                    patterns
                        .iter()
                        .filter_map(|pattern| match Regex::new(pattern) {
                            Ok(re) => Some(re),
                            Err(e) => {
                                tracing::warn!(provider = %name, pattern, error = %e, "ignoring invalid model pattern");
                                None
                            }
                        })
                        .collect()
                };

                let mut entry = ProviderModels {
                    include: compile(&provider.models.include),
                    exclude: compile(&provider.models.exclude),
                    ..ProviderModels::default()
                };

                for (model, model_override) in &provider.models.overrides {
                    if let Some(alias) = &model_override.alias {
                        entry.aliases.insert(model.clone(), alias.clone());
                        entry.reverse_aliases.insert(alias.clone(), model.clone());
                    }
                }

                (name.clone(), entry)
            })
            .collect();

        Self {
            registry,
            default_provider: config.default_provider.clone(),
            models,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Resolve a model string and routing hint to a target
    ///
    /// # Errors
    ///
    /// `UnknownProvider` when the prefix or header names a provider that is
    /// not configured, `ModelNotFound` when the model is filtered out, and
    /// `InvalidRequest` when nothing names a provider and no default exists.
    pub fn resolve(&self, model: &str, hint: Option<&str>) -> Result<ProviderTarget, LlmError> {
        let (provider, model_id) = self.split_provider(model, hint)?;

        let Some(kind) = self.registry.kind(&provider) else {
            return Err(LlmError::UnknownProvider { provider });
        };

        let models = self.models.get(&provider);
        let upstream_model = models.map_or(model_id, |m| m.resolve_alias(model_id)).to_owned();

        if upstream_model.is_empty() || models.is_some_and(|m| !m.is_allowed(&upstream_model)) {
            return Err(LlmError::ModelNotFound {
                model: model.to_owned(),
            });
        }

        let capabilities = self.registry.lookup(&provider, &upstream_model);

        tracing::debug!(provider = %provider, model = %upstream_model, "resolved dispatch target");

        Ok(ProviderTarget {
            provider,
            kind,
            model: upstream_model,
            capabilities,
        })
    }

    /// Resolve only the provider, for operations without a model (files, batches)
    pub fn resolve_provider(&self, hint: Option<&str>) -> Result<(String, ProviderKind), LlmError> {
        let provider = match hint {
            Some(hint) => hint.to_owned(),
            None => self
                .default_provider
                .clone()
                .ok_or_else(|| LlmError::InvalidRequest("no provider specified and no default_provider configured".to_owned()))?,
        };

        match self.registry.kind(&provider) {
            Some(kind) => Ok((provider, kind)),
            None => Err(LlmError::UnknownProvider { provider }),
        }
    }

    /// Resolve the target and apply the translation policy to `request`
    ///
    /// On success `request.model` holds the upstream model id and every
    /// feature left in the request is supported by the target.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when a tool result answers a call that is not in the
    /// history, routing errors from [`Self::resolve`], or
    /// `UnsupportedCapability` when the request needs a feature the target
    /// lacks and the policy does not allow dropping it.
    pub fn dispatch(&self, request: &mut CompletionRequest, context: &RequestContext) -> Result<ProviderTarget, LlmError> {
        let ledger = ToolCallLedger::from_messages(&request.messages);
        let orphaned = ledger.orphaned_results(&request.messages);
        if !orphaned.is_empty() {
            return Err(LlmError::InvalidRequest(format!(
                "tool results without a matching tool call: {}",
                orphaned.join(", ")
            )));
        }

        let target = self.resolve(&request.model, context.provider_hint())?;
        request.model.clone_from(&target.model);

        let adjustments = policy::apply(request, &target)?;
        for adjustment in &adjustments {
            log_adjustment(&target, adjustment);
        }

        Ok(target)
    }

    /// Display name for a model: its alias, or `provider/model`
    pub fn display_name(&self, provider: &str, model: &str) -> Option<String> {
        let models = self.models.get(provider)?;

        if !models.is_allowed(model) {
            return None;
        }

        Some(
            models
                .aliases
                .get(model)
                .cloned()
                .unwrap_or_else(|| format!("{provider}/{model}")),
        )
    }

    fn split_provider<'a>(&self, model: &'a str, hint: Option<&str>) -> Result<(String, &'a str), LlmError> {
        if let Some((prefix, rest)) = model.split_once('/') {
            if self.registry.contains(prefix) {
                return Ok((prefix.to_owned(), rest));
            }

            if WELL_KNOWN_PROVIDERS.contains(&prefix) {
                return Err(LlmError::UnknownProvider {
                    provider: prefix.to_owned(),
                });
            }
        }

        if let Some(hint) = hint {
            return Ok((hint.to_owned(), model));
        }

        let mut alias_owners = self
            .models
            .iter()
            .filter(|(_, models)| models.reverse_aliases.contains_key(model))
            .map(|(name, _)| name);

        if let (Some(owner), None) = (alias_owners.next(), alias_owners.next()) {
            return Ok((owner.clone(), model));
        }

        match &self.default_provider {
            Some(default) => Ok((default.clone(), model)),
            None => Err(LlmError::InvalidRequest(format!(
                "model '{model}' has no provider prefix and no default_provider is configured"
            ))),
        }
    }
}

fn log_adjustment(target: &ProviderTarget, adjustment: &Adjustment) {
    tracing::warn!(
        provider = %target.provider,
        model = %target.model,
        adjustment = %adjustment,
        "request adjusted for target capabilities"
    );
}
