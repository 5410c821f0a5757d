use http::StatusCode;
use prism_core::HttpError;
use thiserror::Error;

/// Errors that can occur while translating, dispatching, or relaying
/// provider calls
#[derive(Debug, Error)]
pub enum LlmError {
    /// Routing resolved to a provider with no registered translator
    #[error("unknown provider: {provider}")]
    UnknownProvider { provider: String },

    /// Request uses a feature outside the target's capability set
    #[error("provider '{provider}' does not support {capability}")]
    UnsupportedCapability { provider: String, capability: String },

    /// Provider's native call failed (network error or non-success status)
    #[error("{provider} returned an error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Upstream {
        /// Provider name from configuration
        provider: String,
        /// Upstream HTTP status; `None` for transport failures
        status: Option<u16>,
        /// Upstream message, passed through untouched
        message: String,
    },

    /// Provider did not answer within the configured timeout
    #[error("{provider} did not respond in time")]
    UpstreamTimeout { provider: String },

    /// Operation is invalid for a batch job or file in a terminal state
    #[error("{resource} '{id}' is already {state}")]
    AlreadyTerminal {
        resource: &'static str,
        id: String,
        state: String,
    },

    /// Upstream stream closed before a terminal message stop
    #[error("stream from {provider} was interrupted: {reason}")]
    StreamInterrupted { provider: String, reason: String },

    /// Model was filtered out or is not served by the resolved provider
    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    /// Batch job, file, or other addressed resource does not exist
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Client sent a malformed or invalid request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Request lacks required credentials
    #[error("authentication required")]
    Unauthorized,

    /// Unexpected internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl LlmError {
    pub(crate) fn upstream(provider: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            provider: provider.to_owned(),
            status,
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(provider: &str, capability: impl Into<String>) -> Self {
        Self::UnsupportedCapability {
            provider: provider.to_owned(),
            capability: capability.into(),
        }
    }

    /// Whether a retry of an idempotent call may succeed
    ///
    /// Only transport failures, throttling, and upstream 5xx qualify.
    /// Generative calls are never retried regardless of this flag.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { status: None, .. } | Self::UpstreamTimeout { .. } => true,
            Self::Upstream {
                status: Some(status), ..
            } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Stable machine-readable code, exposed as `code` in `OpenAI` errors
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::UnknownProvider { .. } => Some("unknown_provider"),
            Self::UnsupportedCapability { .. } => Some("unsupported_capability"),
            Self::AlreadyTerminal { .. } => Some("already_terminal"),
            Self::StreamInterrupted { .. } => Some("stream_interrupted"),
            Self::ModelNotFound { .. } => Some("model_not_found"),
            Self::Upstream { .. } => Some("upstream_error"),
            Self::UpstreamTimeout { .. } => Some("upstream_timeout"),
            _ => None,
        }
    }
}

impl HttpError for LlmError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownProvider { .. } | Self::UnsupportedCapability { .. } | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::ModelNotFound { .. } | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyTerminal { .. } => StatusCode::CONFLICT,
            // 4xx from the provider is the caller's problem and is passed through
            Self::Upstream {
                status: Some(status), ..
            } if (400..500).contains(status) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Upstream { .. } | Self::StreamInterrupted { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::UnknownProvider { .. }
            | Self::UnsupportedCapability { .. }
            | Self::InvalidRequest(_)
            | Self::AlreadyTerminal { .. } => "invalid_request_error",
            Self::ModelNotFound { .. } | Self::NotFound { .. } => "not_found_error",
            Self::Upstream {
                status: Some(429), ..
            } => "rate_limit_error",
            Self::Upstream {
                status: Some(401 | 403),
                ..
            }
            | Self::Unauthorized => "authentication_error",
            Self::Upstream { .. } | Self::UpstreamTimeout { .. } => "upstream_error",
            Self::StreamInterrupted { .. } | Self::Internal(_) => "api_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "an internal error occurred".to_owned(),
            other => other.to_string(),
        }
    }
}
