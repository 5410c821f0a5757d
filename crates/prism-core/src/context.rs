use secrecy::SecretString;

/// Header that overrides default provider resolution
pub const MODEL_PROVIDER_HEADER: &str = "x-model-provider";

/// Runtime context for provider requests
///
/// Built once per inbound request by the server middleware and passed
/// explicitly down the dispatch chain.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP request parts (method, URI, headers, extensions)
    pub parts: http::request::Parts,
    /// Caller-supplied provider credential, used only by providers
    /// configured with `forward_authorization`
    pub api_key: Option<SecretString>,
}

impl RequestContext {
    /// Create a minimal context for non-HTTP use (tests, batch workers)
    pub fn empty() -> Self {
        let (parts, ()) = http::Request::new(()).into_parts();

        Self { parts, api_key: None }
    }

    /// Access request headers
    pub fn headers(&self) -> &http::HeaderMap {
        &self.parts.headers
    }

    /// Read a header as UTF-8, ignoring values that are not valid strings
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Provider named by the `x-model-provider` header, if any
    pub fn provider_hint(&self) -> Option<&str> {
        self.header(MODEL_PROVIDER_HEADER)
            .map(str::trim)
            .filter(|hint| !hint.is_empty())
    }
}
