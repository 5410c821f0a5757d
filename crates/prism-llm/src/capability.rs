//! Declarative capability registry
//!
//! Built once from configuration at startup and read-only afterwards.
//! Provider-type defaults come from a static table, then provider-level
//! overrides, then per-model overrides.

use std::collections::HashMap;
use std::fmt;

use prism_config::{CapabilityOverrides, ImageUrlPolicy, LlmConfig, LlmProviderType};

/// Upstream protocol family of a configured provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Bedrock,
    Azure,
}

impl ProviderKind {
    pub const fn from_config(provider_type: &LlmProviderType) -> Self {
        match provider_type {
            LlmProviderType::Openai => Self::OpenAi,
            LlmProviderType::Anthropic => Self::Anthropic,
            LlmProviderType::Google => Self::Google,
            LlmProviderType::Bedrock(_) => Self::Bedrock,
            LlmProviderType::Azure(_) => Self::Azure,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Bedrock => "bedrock",
            Self::Azure => "azure",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a provider accepts batch jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Requests are embedded in the create call
    Inline,
    /// Requests live in a previously uploaded file (or object store URI)
    FileBacked,
}

/// Feature a request or operation depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    Tools,
    MultipleToolCalls,
    ForcedToolChoice,
    VisionUrl,
    VisionBase64,
    Streaming,
    Thinking,
    PromptCaching,
    Batch,
    Files,
    FileDownload,
    Embeddings,
    Speech,
    Transcription,
}

impl Scenario {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::MultipleToolCalls => "multiple_tool_calls",
            Self::ForcedToolChoice => "forced_tool_choice",
            Self::VisionUrl => "vision_url",
            Self::VisionBase64 => "vision_base64",
            Self::Streaming => "streaming",
            Self::Thinking => "thinking",
            Self::PromptCaching => "prompt_caching",
            Self::Batch => "batch",
            Self::Files => "files",
            Self::FileDownload => "file_download",
            Self::Embeddings => "embeddings",
            Self::Speech => "speech",
            Self::Transcription => "transcription",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature-support matrix for a (provider, model) pair
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    pub supports_tools: bool,
    pub supports_vision_url: bool,
    pub supports_vision_base64: bool,
    pub supports_streaming: bool,
    pub supports_thinking: bool,
    pub supports_multiple_tool_calls: bool,
    pub supports_prompt_caching: bool,
    pub supports_forced_tool_choice: bool,
    pub supports_batch: bool,
    pub supports_files: bool,
    pub supports_file_download: bool,
    pub supports_embeddings: bool,
    pub supports_speech: bool,
    pub supports_transcription: bool,
    /// Non-streaming completions are served by folding an upstream stream
    pub stream_only: bool,
    /// Submission path used when `supports_batch` is set
    pub batch_mode: Option<BatchMode>,
    /// Handling of image URLs when `supports_vision_url` is unset
    pub image_url_policy: ImageUrlPolicy,
}

impl CapabilitySet {
    /// Conservative set used for anything the registry does not know
    pub const fn none() -> Self {
        Self {
            supports_tools: false,
            supports_vision_url: false,
            supports_vision_base64: false,
            supports_streaming: false,
            supports_thinking: false,
            supports_multiple_tool_calls: false,
            supports_prompt_caching: false,
            supports_forced_tool_choice: false,
            supports_batch: false,
            supports_files: false,
            supports_file_download: false,
            supports_embeddings: false,
            supports_speech: false,
            supports_transcription: false,
            stream_only: false,
            batch_mode: None,
            image_url_policy: ImageUrlPolicy::Reject,
        }
    }

    /// Static defaults for a provider protocol
    pub const fn defaults_for(kind: ProviderKind) -> Self {
        let chat = Self {
            supports_tools: true,
            supports_streaming: true,
            supports_multiple_tool_calls: true,
            supports_forced_tool_choice: true,
            supports_vision_base64: true,
            ..Self::none()
        };

        match kind {
            ProviderKind::OpenAi => Self {
                supports_vision_url: true,
                supports_thinking: true,
                supports_prompt_caching: true,
                supports_batch: true,
                supports_files: true,
                supports_file_download: true,
                supports_embeddings: true,
                supports_speech: true,
                supports_transcription: true,
                batch_mode: Some(BatchMode::FileBacked),
                ..chat
            },
            ProviderKind::Anthropic => Self {
                supports_vision_url: true,
                supports_thinking: true,
                supports_prompt_caching: true,
                supports_batch: true,
                supports_files: true,
                batch_mode: Some(BatchMode::Inline),
                ..chat
            },
            ProviderKind::Google => Self {
                supports_thinking: true,
                supports_batch: true,
                supports_embeddings: true,
                batch_mode: Some(BatchMode::Inline),
                ..chat
            },
            ProviderKind::Bedrock => Self {
                supports_thinking: true,
                supports_prompt_caching: true,
                supports_batch: true,
                batch_mode: Some(BatchMode::FileBacked),
                ..chat
            },
            // Deployment-scoped routes cover chat and embeddings only
            ProviderKind::Azure => Self {
                supports_vision_url: true,
                supports_thinking: true,
                supports_embeddings: true,
                ..chat
            },
        }
    }

    /// Layer configured overrides on top of this set
    #[must_use]
    pub fn with_overrides(mut self, overrides: &CapabilityOverrides) -> Self {
        let flags = [
            (&mut self.supports_tools, overrides.tools),
            (&mut self.supports_vision_url, overrides.vision_url),
            (&mut self.supports_vision_base64, overrides.vision_base64),
            (&mut self.supports_streaming, overrides.streaming),
            (&mut self.supports_thinking, overrides.thinking),
            (&mut self.supports_multiple_tool_calls, overrides.multiple_tool_calls),
            (&mut self.supports_prompt_caching, overrides.prompt_caching),
            (&mut self.supports_forced_tool_choice, overrides.forced_tool_choice),
            (&mut self.supports_batch, overrides.batch),
            (&mut self.supports_files, overrides.files),
            (&mut self.supports_file_download, overrides.file_download),
            (&mut self.supports_embeddings, overrides.embeddings),
            (&mut self.supports_speech, overrides.speech),
            (&mut self.supports_transcription, overrides.transcription),
            (&mut self.stream_only, overrides.stream_only),
        ];

        for (flag, value) in flags {
            if let Some(value) = value {
                *flag = value;
            }
        }

        if let Some(policy) = overrides.image_url_policy {
            self.image_url_policy = policy;
        }

        self
    }

    pub const fn supports(&self, scenario: Scenario) -> bool {
        match scenario {
            Scenario::Tools => self.supports_tools,
            Scenario::MultipleToolCalls => self.supports_multiple_tool_calls,
            Scenario::ForcedToolChoice => self.supports_forced_tool_choice,
            Scenario::VisionUrl => self.supports_vision_url,
            Scenario::VisionBase64 => self.supports_vision_base64,
            Scenario::Streaming => self.supports_streaming,
            Scenario::Thinking => self.supports_thinking,
            Scenario::PromptCaching => self.supports_prompt_caching,
            Scenario::Batch => self.supports_batch,
            Scenario::Files => self.supports_files,
            Scenario::FileDownload => self.supports_files && self.supports_file_download,
            Scenario::Embeddings => self.supports_embeddings,
            Scenario::Speech => self.supports_speech,
            Scenario::Transcription => self.supports_transcription,
        }
    }

    /// Batch submission path, or `None` when batches are unsupported
    pub const fn batch_path(&self) -> Option<BatchMode> {
        if self.supports_batch { self.batch_mode } else { None }
    }
}

struct ProviderEntry {
    kind: ProviderKind,
    capabilities: CapabilitySet,
    models: HashMap<String, CapabilityOverrides>,
}

/// Versioned (provider, model) → capability table
pub struct CapabilityRegistry {
    version: u32,
    providers: HashMap<String, ProviderEntry>,
}

impl CapabilityRegistry {
    pub fn from_config(config: &LlmConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|(name, provider)| {
                let kind = ProviderKind::from_config(&provider.provider_type);
                let capabilities = CapabilitySet::defaults_for(kind).with_overrides(&provider.capabilities);
                let models = provider
                    .models
                    .overrides
                    .iter()
                    .map(|(model, model_override)| (model.clone(), model_override.capabilities.clone()))
                    .collect();

                (
                    name.clone(),
                    ProviderEntry {
                        kind,
                        capabilities,
                        models,
                    },
                )
            })
            .collect();

        Self {
            version: config.capabilities_version,
            providers,
        }
    }

    /// Table version from configuration
    pub const fn version(&self) -> u32 {
        self.version
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    pub fn kind(&self, provider: &str) -> Option<ProviderKind> {
        self.providers.get(provider).map(|entry| entry.kind)
    }

    /// Capability set for a (provider, model) pair
    ///
    /// Unknown providers yield [`CapabilitySet::none`] so callers can report
    /// a precise capability error instead of failing here.
    pub fn lookup(&self, provider: &str, model: &str) -> CapabilitySet {
        let Some(entry) = self.providers.get(provider) else {
            return CapabilitySet::none();
        };

        match entry.models.get(model) {
            Some(overrides) => entry.capabilities.with_overrides(overrides),
            None => entry.capabilities,
        }
    }

    /// Provider-level check that ignores per-model overrides
    pub fn supports_scenario(&self, provider: &str, scenario: Scenario) -> bool {
        self.providers
            .get(provider)
            .is_some_and(|entry| entry.capabilities.supports(scenario))
    }

    /// Batch submission path for a provider, discoverable before creating a job
    pub fn batch_mode(&self, provider: &str) -> Option<BatchMode> {
        self.providers
            .get(provider)
            .and_then(|entry| entry.capabilities.batch_path())
    }

    /// Configured provider names
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(toml: &str) -> CapabilityRegistry {
        let config: LlmConfig = toml::from_str(toml).unwrap();
        CapabilityRegistry::from_config(&config)
    }

    const CONFIG: &str = r#"
        capabilities_version = 7

        [providers.openai]
        type = "openai"

        [providers.claude]
        type = "anthropic"

        [providers.gemini]
        type = "google"

        [providers.gemini.capabilities]
        image_url_policy = "drop"

        [providers.gemini.models.overrides."gemini-1.0-pro"]
        capabilities = { thinking = false, tools = false }
    "#;

    #[test]
    fn unknown_provider_is_all_false() {
        let registry = registry(CONFIG);
        assert_eq!(registry.lookup("mistral", "large"), CapabilitySet::none());
        assert!(!registry.supports_scenario("mistral", Scenario::Streaming));
        assert!(registry.batch_mode("mistral").is_none());
    }

    #[test]
    fn defaults_follow_provider_type() {
        let registry = registry(CONFIG);

        let openai = registry.lookup("openai", "gpt-4o");
        assert!(openai.supports_vision_url);
        assert!(openai.supports(Scenario::FileDownload));

        let claude = registry.lookup("claude", "claude-sonnet-4-5");
        assert!(claude.supports_files);
        assert!(!claude.supports(Scenario::FileDownload));
        assert!(!claude.supports_embeddings);
    }

    #[test]
    fn azure_serves_chat_and_embeddings_only() {
        let azure = CapabilitySet::defaults_for(ProviderKind::Azure);
        assert!(azure.supports(Scenario::Tools));
        assert!(azure.supports(Scenario::Embeddings));
        assert!(!azure.supports(Scenario::Batch));
        assert!(!azure.supports(Scenario::Files));
        assert!(!azure.supports(Scenario::Speech));
        assert!(!azure.supports(Scenario::Transcription));
    }

    #[test]
    fn batch_path_is_discoverable() {
        let registry = registry(CONFIG);
        assert_eq!(registry.batch_mode("openai"), Some(BatchMode::FileBacked));
        assert_eq!(registry.batch_mode("claude"), Some(BatchMode::Inline));
        assert_eq!(registry.batch_mode("gemini"), Some(BatchMode::Inline));
    }

    #[test]
    fn model_overrides_apply_after_provider_overrides() {
        let registry = registry(CONFIG);

        let flash = registry.lookup("gemini", "gemini-2.5-flash");
        assert!(flash.supports_thinking);
        assert_eq!(flash.image_url_policy, ImageUrlPolicy::Drop);

        let legacy = registry.lookup("gemini", "gemini-1.0-pro");
        assert!(!legacy.supports_thinking);
        assert!(!legacy.supports_tools);
        assert_eq!(legacy.image_url_policy, ImageUrlPolicy::Drop);

        // scenario checks ignore model overrides
        assert!(registry.supports_scenario("gemini", Scenario::Tools));
    }

    #[test]
    fn disabling_batch_hides_the_mode() {
        let registry = registry(
            r#"
            [providers.openai]
            type = "openai"
            capabilities = { batch = false }
            "#,
        );
        assert!(registry.batch_mode("openai").is_none());
    }

    #[test]
    fn reports_version() {
        assert_eq!(registry(CONFIG).version(), 7);
    }
}
