//! Provider-agnostic LLM gateway core
//!
//! Callers speak any of the supported wire formats (`OpenAI` chat,
//! completions and responses, Anthropic messages, Google `GenAI`, Bedrock
//! converse and invoke). Every request is translated into one canonical
//! model, dispatched to a configured provider after a capability check, and
//! the result is translated back into the caller's own shape. Streams are
//! normalized into a single event model so any upstream can feed any
//! downstream format.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod capability;
pub mod convert;
pub mod dispatch;
pub mod error;
#[cfg(feature = "http")]
mod handler;
pub mod lifecycle;
pub mod protocol;
pub mod provider;
pub mod reconcile;
pub mod retry;
pub mod state;
pub mod stream;
pub mod types;

pub use capability::{CapabilityRegistry, CapabilitySet, ProviderKind, Scenario};
pub use dispatch::{Dispatcher, ProviderTarget};
pub use error::LlmError;
#[cfg(feature = "http")]
pub use handler::llm_router;
pub use lifecycle::LifecycleManager;
pub use provider::Provider;
pub use state::LlmState;
pub use types::{CompletionRequest, CompletionResponse, StreamEvent};
