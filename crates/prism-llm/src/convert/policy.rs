//! Per-field translation policy
//!
//! Decides, before any translator runs, what happens to each request
//! feature the target's capability set lacks. Features are either rejected
//! with `UnsupportedCapability` or adjusted in place; every adjustment is
//! returned so the dispatcher can log it.
//!
//! | Feature                         | Missing capability       | Action                          |
//! |---------------------------------|--------------------------|---------------------------------|
//! | tool definitions                | `tools`                  | reject                          |
//! | `tool_choice: any` / named tool | `forced_tool_choice`     | downgrade to `auto`             |
//! | `tool_choice: none` on Bedrock  | (no native `none`)       | drop tools, choice becomes none |
//! | several tool calls per turn     | `multiple_tool_calls`    | set `parallel_tool_calls=false` |
//! | image URL                       | `vision_url`             | `image_url_policy`: reject/drop |
//! | base64 image                    | `vision_base64`          | reject                          |
//! | `thinking.enabled`              | `thinking`               | reject                          |
//! | thinking blocks in history      | `thinking`               | drop blocks                     |
//! | `cache_control` markers         | `prompt_caching`         | strip markers                   |
//! | `stream: true`                  | `streaming`              | reject                          |

use std::fmt;

use prism_config::ImageUrlPolicy;

use crate::capability::{ProviderKind, Scenario};
use crate::dispatch::ProviderTarget;
use crate::error::LlmError;
use crate::types::{CompletionRequest, ContentPart, ToolChoice};

/// A non-fatal change made to fit a request to its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adjustment {
    /// Forced tool choice relaxed to `auto`
    ToolChoiceDowngraded { from: String },
    /// `tool_choice: none` expressed by removing tool definitions
    ToolsRemovedForNone { count: usize },
    /// Parallel tool calls disabled
    ParallelToolCallsDisabled,
    /// Image URL parts removed under the drop policy
    ImageUrlsDropped { count: usize },
    /// Prompt-cache checkpoints removed
    CacheControlStripped { count: usize },
    /// Thinking blocks removed from the conversation history
    ThinkingHistoryDropped { count: usize },
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolChoiceDowngraded { from } => write!(f, "tool_choice '{from}' downgraded to 'auto'"),
            Self::ToolsRemovedForNone { count } => write!(f, "{count} tool definitions removed for tool_choice 'none'"),
            Self::ParallelToolCallsDisabled => f.write_str("parallel tool calls disabled"),
            Self::ImageUrlsDropped { count } => write!(f, "{count} image URLs dropped"),
            Self::CacheControlStripped { count } => write!(f, "{count} cache_control markers stripped"),
            Self::ThinkingHistoryDropped { count } => write!(f, "{count} thinking blocks dropped from history"),
        }
    }
}

/// Fit `request` to `target`, rejecting what cannot be fitted
///
/// Runs before any upstream call. On error the request may be partially
/// adjusted and must be discarded.
///
/// # Errors
///
/// `UnsupportedCapability` naming the first missing capability that has a
/// reject policy.
pub fn apply(request: &mut CompletionRequest, target: &ProviderTarget) -> Result<Vec<Adjustment>, LlmError> {
    let capabilities = &target.capabilities;
    let mut adjustments = Vec::new();

    if request.stream {
        target.require(Scenario::Streaming)?;
    }

    if request.wants_thinking() {
        target.require(Scenario::Thinking)?;
    }

    if !request.tools.is_empty() {
        target.require(Scenario::Tools)?;
    }

    check_images(request, target, &mut adjustments)?;

    if let Some(choice) = &request.tool_choice {
        if choice.is_forced() && !capabilities.supports_forced_tool_choice {
            let from = match choice {
                ToolChoice::Tool { name } => format!("tool:{name}"),
                _ => "any".to_owned(),
            };
            request.tool_choice = Some(ToolChoice::Auto);
            adjustments.push(Adjustment::ToolChoiceDowngraded { from });
        } else if *choice == ToolChoice::None && target.kind == ProviderKind::Bedrock && !request.tools.is_empty() {
            let count = request.tools.len();
            request.tools.clear();
            request.tool_choice = None;
            adjustments.push(Adjustment::ToolsRemovedForNone { count });
        }
    }

    if !request.tools.is_empty() && !capabilities.supports_multiple_tool_calls && request.parallel_tool_calls != Some(false) {
        request.parallel_tool_calls = Some(false);
        adjustments.push(Adjustment::ParallelToolCallsDisabled);
    }

    if !capabilities.supports_thinking {
        let mut count = 0;
        for message in &mut request.messages {
            message.content.retain(|part| {
                let keep = !matches!(part, ContentPart::Thinking { .. });
                if !keep {
                    count += 1;
                }
                keep
            });
        }
        request.messages.retain(|message| !message.content.is_empty());

        if count > 0 {
            adjustments.push(Adjustment::ThinkingHistoryDropped { count });
        }
    }

    if !capabilities.supports_prompt_caching {
        let mut count = 0;
        for part in request.messages.iter_mut().flat_map(|m| m.content.iter_mut()) {
            if part.clear_cache_control() {
                count += 1;
            }
        }
        for tool in &mut request.tools {
            if tool.cache_control.take().is_some() {
                count += 1;
            }
        }

        if count > 0 {
            adjustments.push(Adjustment::CacheControlStripped { count });
        }
    }

    Ok(adjustments)
}

fn check_images(
    request: &mut CompletionRequest,
    target: &ProviderTarget,
    adjustments: &mut Vec<Adjustment>,
) -> Result<(), LlmError> {
    let capabilities = &target.capabilities;
    let (mut urls, mut inline) = (0usize, 0usize);

    for part in request.parts().flat_map(with_nested) {
        if let ContentPart::Image { source, .. } = part {
            if source.is_url() {
                urls += 1;
            } else {
                inline += 1;
            }
        }
    }

    if inline > 0 {
        target.require(Scenario::VisionBase64)?;
    }

    if urls == 0 || capabilities.supports_vision_url {
        return Ok(());
    }

    match capabilities.image_url_policy {
        ImageUrlPolicy::Reject => Err(LlmError::unsupported(&target.provider, Scenario::VisionUrl.as_str())),
        ImageUrlPolicy::Drop => {
            for message in &mut request.messages {
                for part in &mut message.content {
                    if let ContentPart::ToolResult { content, .. } = part {
                        content.retain(|part| !is_image_url(part));
                    }
                }
                message.content.retain(|part| !is_image_url(part));
            }
            request.messages.retain(|message| !message.content.is_empty());
            adjustments.push(Adjustment::ImageUrlsDropped { count: urls });
            Ok(())
        }
    }
}

/// Tool results stand in for their content parts
fn with_nested(part: &ContentPart) -> &[ContentPart] {
    match part {
        ContentPart::ToolResult { content, .. } => content,
        other => std::slice::from_ref(other),
    }
}

fn is_image_url(part: &ContentPart) -> bool {
    matches!(part, ContentPart::Image { source, .. } if source.is_url())
}
