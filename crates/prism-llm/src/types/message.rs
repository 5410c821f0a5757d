use serde::{Deserialize, Serialize};

/// Role of a message participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author
    pub role: Role,
    /// Ordered content parts
    pub content: Vec<ContentPart>,
}

impl Message {
    /// Message with a single text part
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(text)],
        }
    }

    /// Concatenated text of all text parts
    pub fn text_content(&self) -> String {
        ContentPart::text_of(&self.content)
    }
}

/// One typed unit of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        /// Always a JSON value, never a provider object or an encoded string
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        /// Text and image parts; other kinds are not valid here
        content: Vec<ContentPart>,
        #[serde(default)]
        status: ToolResultStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Thinking {
        text: String,
        /// Provider signature that must be echoed back verbatim
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl ContentPart {
    /// Plain text part without a cache marker
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    /// Successful tool result with a single text part
    pub fn tool_result(tool_use_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![Self::text(text)],
            status: ToolResultStatus::Success,
            cache_control: None,
        }
    }

    /// Concatenated text of the text parts in `parts`
    pub fn text_of(parts: &[Self]) -> String {
        parts
            .iter()
            .filter_map(|part| match part {
                Self::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub const fn cache_control(&self) -> Option<&CacheControl> {
        match self {
            Self::Text { cache_control, .. }
            | Self::Image { cache_control, .. }
            | Self::ToolResult { cache_control, .. } => cache_control.as_ref(),
            Self::ToolUse { .. } | Self::Thinking { .. } => None,
        }
    }

    /// Remove a cache marker, returning whether one was present
    pub fn clear_cache_control(&mut self) -> bool {
        match self {
            Self::Text { cache_control, .. }
            | Self::Image { cache_control, .. }
            | Self::ToolResult { cache_control, .. } => cache_control.take().is_some(),
            Self::ToolUse { .. } | Self::Thinking { .. } => false,
        }
    }
}

/// Where image bytes come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// Remote reference the provider must fetch itself
    Url { url: String },
    /// Inline payload
    Base64 { media_type: String, data: String },
}

impl ImageSource {
    /// Parse an image reference, splitting `data:` URIs into media type and payload
    ///
    /// `data:image/png;base64,AAAA` becomes `Base64 { media_type: "image/png", data: "AAAA" }`;
    /// anything else is kept as a URL.
    pub fn parse(reference: &str) -> Self {
        if let Some(rest) = reference.strip_prefix("data:")
            && let Some((header, data)) = rest.split_once(',')
            && let Some(media_type) = header.strip_suffix(";base64")
        {
            return Self::Base64 {
                media_type: media_type.to_owned(),
                data: data.to_owned(),
            };
        }

        Self::Url {
            url: reference.to_owned(),
        }
    }

    /// Render back to a single reference string
    pub fn to_reference(&self) -> String {
        match self {
            Self::Url { url } => url.clone(),
            Self::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        }
    }

    pub const fn is_url(&self) -> bool {
        matches!(self, Self::Url { .. })
    }
}

/// Prompt-cache checkpoint attached to a content part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    /// Checkpoint kind; `ephemeral` is the only kind providers accept today
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional time-to-live such as `5m` or `1h`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".to_owned(),
            ttl: None,
        }
    }
}

/// Outcome reported alongside a tool result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    #[default]
    Success,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_is_split() {
        let source = ImageSource::parse("data:image/png;base64,iVBORw0KGgo=");
        assert_eq!(
            source,
            ImageSource::Base64 {
                media_type: "image/png".to_owned(),
                data: "iVBORw0KGgo=".to_owned(),
            }
        );
        assert_eq!(source.to_reference(), "data:image/png;base64,iVBORw0KGgo=");
    }

    #[test]
    fn plain_url_is_kept() {
        let source = ImageSource::parse("https://example.com/cat.jpg");
        assert!(source.is_url());
    }

    #[test]
    fn non_base64_data_uri_is_treated_as_url() {
        let source = ImageSource::parse("data:text/plain,hello");
        assert!(source.is_url());
    }

    #[test]
    fn text_content_skips_other_parts() {
        let message = Message {
            role: Role::Assistant,
            content: vec![
                ContentPart::text("Hello, "),
                ContentPart::ToolUse {
                    id: "call_1".to_owned(),
                    name: "lookup".to_owned(),
                    input: serde_json::json!({}),
                },
                ContentPart::text("world"),
            ],
        };
        assert_eq!(message.text_content(), "Hello, world");
    }
}
