use std::collections::HashMap;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Top-level LLM configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// Provider used when neither the model prefix nor the
    /// `x-model-provider` header names one
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Version stamp of the capability table, reported at boot
    #[serde(default = "default_capabilities_version")]
    pub capabilities_version: u32,
    /// Backoff settings for idempotent upstream calls
    #[serde(default)]
    pub retry: RetryConfig,
    /// Bounds on the batch and file status mirror
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// LLM provider configurations keyed by name
    #[serde(default)]
    pub providers: IndexMap<String, LlmProviderConfig>,
}

/// Configuration for a single LLM provider
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmProviderConfig {
    /// Provider protocol type
    #[serde(rename = "type")]
    pub provider_type: LlmProviderType,
    /// API key for authentication
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Base URL override
    #[serde(default)]
    pub base_url: Option<Url>,
    /// Model configuration
    #[serde(default)]
    pub models: ModelConfig,
    /// Forward the caller's credential to the provider instead of `api_key`
    #[serde(default)]
    pub forward_authorization: bool,
    /// Provider-wide overrides on top of the protocol defaults
    #[serde(default)]
    pub capabilities: CapabilityOverrides,
    /// Upstream HTTP timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Upstream timeouts in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Whole-request limit for everything except streamed completions
    #[serde(default = "default_request_timeout")]
    pub request: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// Longest silence between two chunks of a streamed completion
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            connect: default_connect_timeout(),
            stream_idle: default_stream_idle_timeout(),
        }
    }
}

/// Supported LLM provider protocols
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderType {
    /// OpenAI-compatible API
    Openai,
    /// Anthropic Messages API
    Anthropic,
    /// Google Generative Language API
    Google,
    /// AWS Bedrock
    Bedrock(BedrockConfig),
    /// Azure OpenAI, reached through per-model deployments under `base_url`
    Azure(AzureConfig),
}

/// Azure OpenAI-specific configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AzureConfig {
    /// Model name -> deployment name
    pub deployments: IndexMap<String, String>,
    /// `api-version` query parameter, `2024-02-01` when unset
    #[serde(default)]
    pub api_version: Option<String>,
}

/// AWS Bedrock-specific configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BedrockConfig {
    /// AWS region
    pub region: String,
    /// Access key ID (optional, uses default credential chain if absent)
    #[serde(default)]
    pub access_key_id: Option<SecretString>,
    /// Secret access key
    #[serde(default)]
    pub secret_access_key: Option<SecretString>,
    /// IAM role assumed by model invocation jobs
    #[serde(default)]
    pub batch_role_arn: Option<String>,
    /// S3 prefix where invocation job output is written
    #[serde(default)]
    pub batch_output_uri: Option<String>,
}

/// Model configuration for a provider
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Include models matching these patterns (regex)
    #[serde(default)]
    pub include: Vec<String>,
    /// Exclude models matching these patterns (regex)
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Per-model overrides keyed by the upstream model id
    #[serde(default)]
    pub overrides: HashMap<String, ModelOverride>,
}

/// Per-model configuration overrides
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelOverride {
    /// Custom display name
    #[serde(default)]
    pub alias: Option<String>,
    /// Capability overrides applied after the provider-level ones
    #[serde(default)]
    pub capabilities: CapabilityOverrides,
}

/// Optional capability flags; `None` keeps the inherited value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityOverrides {
    pub tools: Option<bool>,
    pub vision_url: Option<bool>,
    pub vision_base64: Option<bool>,
    pub streaming: Option<bool>,
    pub thinking: Option<bool>,
    pub multiple_tool_calls: Option<bool>,
    pub prompt_caching: Option<bool>,
    pub forced_tool_choice: Option<bool>,
    pub batch: Option<bool>,
    pub files: Option<bool>,
    pub file_download: Option<bool>,
    pub embeddings: Option<bool>,
    pub speech: Option<bool>,
    pub transcription: Option<bool>,
    /// Upstream only answers over a stream
    pub stream_only: Option<bool>,
    /// What to do with an image URL sent to a target without URL vision
    pub image_url_policy: Option<ImageUrlPolicy>,
}

/// Handling of image URLs for targets that cannot fetch them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageUrlPolicy {
    /// Fail the request before any upstream call
    #[default]
    Reject,
    /// Remove the image block and log a warning
    Drop,
}

/// Bounded exponential backoff for list/retrieve calls
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Batch and file status mirror kept by the gateway
///
/// Entries older than `mirror_ttl_secs` are forgotten; the next poll
/// refetches them from the provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Upper bound on mirrored jobs, and separately on mirrored files
    #[serde(default = "default_mirror_capacity")]
    pub mirror_capacity: u64,
    #[serde(default = "default_mirror_ttl_secs")]
    pub mirror_ttl_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            mirror_capacity: default_mirror_capacity(),
            mirror_ttl_secs: default_mirror_ttl_secs(),
        }
    }
}

const fn default_capabilities_version() -> u32 {
    1
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    200
}

const fn default_max_delay_ms() -> u64 {
    5_000
}

const fn default_request_timeout() -> u64 {
    120
}

const fn default_connect_timeout() -> u64 {
    10
}

const fn default_stream_idle_timeout() -> u64 {
    300
}

const fn default_mirror_capacity() -> u64 {
    10_000
}

const fn default_mirror_ttl_secs() -> u64 {
    24 * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_table() {
        let config: LlmConfig = toml::from_str(
            r#"
            default_provider = "openai"

            [providers.openai]
            type = "openai"
            api_key = "sk-test"

            [providers.claude]
            type = "anthropic"

            [providers.claude.capabilities]
            image_url_policy = "drop"

            [providers.claude.models.overrides."claude-3-haiku-20240307"]
            alias = "haiku"
            capabilities = { thinking = false }
            "#,
        )
        .unwrap();

        assert_eq!(config.default_provider.as_deref(), Some("openai"));
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.lifecycle.mirror_ttl_secs, 86_400);
        assert_eq!(config.providers["openai"].timeouts.request, 120);

        let claude = &config.providers["claude"];
        assert!(matches!(claude.provider_type, LlmProviderType::Anthropic));
        assert_eq!(claude.capabilities.image_url_policy, Some(ImageUrlPolicy::Drop));

        let haiku = &claude.models.overrides["claude-3-haiku-20240307"];
        assert_eq!(haiku.alias.as_deref(), Some("haiku"));
        assert_eq!(haiku.capabilities.thinking, Some(false));
    }

    #[test]
    fn parses_azure_block() {
        let config: LlmConfig = toml::from_str(
            r#"
            [providers.azure]
            type = { azure = { deployments = { "gpt-4o" = "prod-gpt4o", "text-embedding-3-small" = "embed" } } }
            base_url = "https://contoso.openai.azure.com"
            "#,
        )
        .unwrap();

        let LlmProviderType::Azure(azure) = &config.providers["azure"].provider_type else {
            panic!("expected azure provider");
        };
        assert_eq!(azure.deployments["gpt-4o"], "prod-gpt4o");
        assert_eq!(azure.deployments.len(), 2);
        assert!(azure.api_version.is_none());
    }

    #[test]
    fn parses_bedrock_block() {
        let config: LlmConfig = toml::from_str(
            r#"
            [providers.aws]
            type = { bedrock = { region = "us-east-1", batch_role_arn = "arn:aws:iam::1:role/batch", batch_output_uri = "s3://out/" } }
            "#,
        )
        .unwrap();

        let LlmProviderType::Bedrock(bedrock) = &config.providers["aws"].provider_type else {
            panic!("expected bedrock provider");
        };
        assert_eq!(bedrock.region, "us-east-1");
        assert_eq!(bedrock.batch_output_uri.as_deref(), Some("s3://out/"));
    }

    #[test]
    fn timeouts_are_per_provider() {
        let config: LlmConfig = toml::from_str(
            r#"
            [providers.slow]
            type = "openai"
            timeouts = { request = 600, stream_idle = 30 }
            "#,
        )
        .unwrap();

        let timeouts = &config.providers["slow"].timeouts;
        assert_eq!(timeouts.request, 600);
        assert_eq!(timeouts.connect, 10);
        assert_eq!(timeouts.stream_idle, 30);
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let result: Result<LlmConfig, _> = toml::from_str(
            r#"
            [providers.openai]
            type = "openai"
            capabilities = { telepathy = true }
            "#,
        );
        assert!(result.is_err());
    }
}
