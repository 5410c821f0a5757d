use std::path::Path;

use crate::{AnyOrList, Config, LlmProviderType};

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, environment variable
    /// expansion fails, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::parse(&raw)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing, or validation fails
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error if no provider is configured or a provider
    /// section is inconsistent
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.providers.is_empty() {
            anyhow::bail!("at least one LLM provider must be configured");
        }

        self.validate_default_provider()?;
        self.validate_providers()?;

        if let Some(ref cors) = self.server.cors
            && cors.credentials
            && cors.origins == AnyOrList::Any
        {
            anyhow::bail!("cors credentials require an explicit origins list");
        }

        Ok(())
    }

    fn validate_default_provider(&self) -> anyhow::Result<()> {
        if let Some(ref default) = self.llm.default_provider
            && !self.llm.providers.contains_key(default)
        {
            anyhow::bail!("default_provider '{default}' is not a configured provider");
        }

        Ok(())
    }

    fn validate_providers(&self) -> anyhow::Result<()> {
        for (name, provider) in &self.llm.providers {
            if name.contains('/') {
                anyhow::bail!("provider name '{name}' must not contain '/'");
            }

            for pattern in provider.models.include.iter().chain(&provider.models.exclude) {
                regex::Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("invalid model pattern for provider '{name}': {e}"))?;
            }

            if let LlmProviderType::Bedrock(ref bedrock) = provider.provider_type {
                if bedrock.batch_role_arn.is_some() != bedrock.batch_output_uri.is_some() {
                    anyhow::bail!("bedrock provider '{name}' needs both batch_role_arn and batch_output_uri");
                }

                if let Some(ref output) = bedrock.batch_output_uri
                    && !output.starts_with("s3://")
                {
                    anyhow::bail!("bedrock provider '{name}' batch_output_uri must be an s3:// URI");
                }
            }

            if let LlmProviderType::Azure(ref azure) = provider.provider_type {
                if provider.base_url.is_none() {
                    anyhow::bail!("azure provider '{name}' needs base_url set to its resource endpoint");
                }

                if azure.deployments.is_empty() {
                    anyhow::bail!("azure provider '{name}' needs at least one deployment");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::Config;

    #[test]
    fn loads_file_with_env_expansion() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[llm.providers.openai]
type = "openai"
api_key = "{{{{ env.PRISM_TEST_OPENAI_KEY }}}}"
"#
        )
        .unwrap();

        temp_env::with_var("PRISM_TEST_OPENAI_KEY", Some("sk-from-env"), || {
            let config = Config::load(file.path()).unwrap();
            assert!(config.llm.providers["openai"].api_key.is_some());
        });
    }

    #[test]
    fn empty_config_is_rejected() {
        let err = Config::parse("").unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"at least one LLM provider must be configured");
    }

    #[test]
    fn unknown_default_provider_is_rejected() {
        let err = Config::parse(
            r#"
            [llm]
            default_provider = "missing"

            [llm.providers.openai]
            type = "openai"
            "#,
        )
        .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"default_provider 'missing' is not a configured provider");
    }

    #[test]
    fn invalid_model_pattern_is_rejected() {
        let err = Config::parse(
            r#"
            [llm.providers.openai]
            type = "openai"
            models = { include = ["(unclosed"] }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid model pattern for provider 'openai'"));
    }

    #[test]
    fn bedrock_batch_settings_come_in_pairs() {
        let err = Config::parse(
            r#"
            [llm.providers.aws]
            type = { bedrock = { region = "us-west-2", batch_role_arn = "arn:aws:iam::1:role/x" } }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("needs both batch_role_arn and batch_output_uri"));
    }

    #[test]
    fn azure_needs_an_endpoint_and_deployments() {
        let err = Config::parse(
            r#"
            [llm.providers.azure]
            type = { azure = { deployments = { "gpt-4o" = "prod" } } }
            "#,
        )
        .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"azure provider 'azure' needs base_url set to its resource endpoint");

        let err = Config::parse(
            r#"
            [llm.providers.azure]
            type = { azure = { deployments = {} } }
            base_url = "https://contoso.openai.azure.com"
            "#,
        )
        .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"azure provider 'azure' needs at least one deployment");
    }

    #[test]
    fn unknown_section_is_rejected() {
        let err = Config::parse(
            r#"
            [cache]
            enabled = true

            [llm.providers.openai]
            type = "openai"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn cors_lists_collapse_wildcards() {
        let config = Config::parse(
            r#"
            [server.cors]
            origins = ["https://app.example.com", "*"]
            methods = ["GET", "POST"]
            max_age = 600

            [llm.providers.openai]
            type = "openai"
            "#,
        )
        .unwrap();

        let cors = config.server.cors.unwrap();
        assert_eq!(cors.origins, crate::AnyOrList::Any);
        assert_eq!(cors.methods, crate::AnyOrList::List(vec!["GET".to_owned(), "POST".to_owned()]));
        assert_eq!(cors.max_age_duration(), Some(std::time::Duration::from_secs(600)));
    }

    #[test]
    fn cors_credentials_need_explicit_origins() {
        let err = Config::parse(
            r#"
            [server.cors]
            credentials = true

            [llm.providers.openai]
            type = "openai"
            "#,
        )
        .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"cors credentials require an explicit origins list");
    }
}
