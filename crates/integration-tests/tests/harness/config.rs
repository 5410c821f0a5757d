//! Programmatic configuration builder for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;

use prism_config::{
    AzureConfig, CapabilityOverrides, Config, CorsConfig, HealthConfig, LlmProviderConfig, LlmProviderType, ModelConfig,
    ModelOverride, RetryConfig, ServerConfig, TimeoutConfig,
};
use secrecy::SecretString;

/// Builder for constructing test configurations
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Minimal config listening on an ephemeral port, with fast retries
    pub fn new() -> Self {
        let mut config = Config {
            server: ServerConfig {
                listen_address: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
                health: HealthConfig::default(),
                ..ServerConfig::default()
            },
            ..Config::default()
        };
        config.llm.retry = RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };

        Self { config }
    }

    fn with_provider(mut self, name: &str, provider_type: LlmProviderType, base_url: &str) -> Self {
        self.config.llm.providers.insert(
            name.to_owned(),
            LlmProviderConfig {
                provider_type,
                api_key: Some(SecretString::from("test-key")),
                base_url: Some(base_url.parse().expect("valid URL")),
                models: ModelConfig::default(),
                forward_authorization: false,
                capabilities: CapabilityOverrides::default(),
                timeouts: TimeoutConfig::default(),
            },
        );

        // The first provider added doubles as the default
        self.config.llm.default_provider.get_or_insert_with(|| name.to_owned());
        self
    }

    /// Add an OpenAI-compatible provider pointed at a mock backend
    pub fn with_openai_provider(self, name: &str, base_url: &str) -> Self {
        self.with_provider(name, LlmProviderType::Openai, base_url)
    }

    /// Add an Anthropic provider pointed at a mock backend
    pub fn with_anthropic_provider(self, name: &str, base_url: &str) -> Self {
        self.with_provider(name, LlmProviderType::Anthropic, base_url)
    }

    /// Add a Google provider pointed at a mock backend
    pub fn with_google_provider(self, name: &str, base_url: &str) -> Self {
        self.with_provider(name, LlmProviderType::Google, base_url)
    }

    /// Add an Azure provider with `(model, deployment)` pairs
    pub fn with_azure_provider(self, name: &str, endpoint: &str, deployments: &[(&str, &str)]) -> Self {
        let azure = AzureConfig {
            deployments: deployments
                .iter()
                .map(|(model, deployment)| ((*model).to_owned(), (*deployment).to_owned()))
                .collect(),
            api_version: None,
        };
        self.with_provider(name, LlmProviderType::Azure(azure), endpoint)
    }

    pub fn with_default_provider(mut self, name: &str) -> Self {
        self.config.llm.default_provider = Some(name.to_owned());
        self
    }

    /// Expose `model` of `provider` under `alias`
    pub fn with_alias(mut self, provider: &str, model: &str, alias: &str) -> Self {
        if let Some(config) = self.config.llm.providers.get_mut(provider) {
            config.models.overrides.insert(
                model.to_owned(),
                ModelOverride {
                    alias: Some(alias.to_owned()),
                    ..ModelOverride::default()
                },
            );
        }
        self
    }

    pub fn with_capabilities(mut self, provider: &str, overrides: CapabilityOverrides) -> Self {
        if let Some(config) = self.config.llm.providers.get_mut(provider) {
            config.capabilities = overrides;
        }
        self
    }

    pub fn with_request_timeout(mut self, provider: &str, seconds: u64) -> Self {
        if let Some(config) = self.config.llm.providers.get_mut(provider) {
            config.timeouts.request = seconds;
        }
        self
    }

    pub fn with_forward_authorization(mut self, provider: &str) -> Self {
        if let Some(config) = self.config.llm.providers.get_mut(provider) {
            config.forward_authorization = true;
        }
        self
    }

    pub fn with_cors(mut self, config: CorsConfig) -> Self {
        self.config.server.cors = Some(config);
        self
    }

    pub fn without_health(mut self) -> Self {
        self.config.server.health.enabled = false;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
