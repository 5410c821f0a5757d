//! Canonical, provider-agnostic request and response types
//!
//! Every inbound wire format converts into these types and every provider
//! translator converts out of them. Content is always an ordered list of
//! typed parts; position is significant.

pub mod media;
pub mod message;
pub mod model;
pub mod request;
pub mod response;
pub mod stream;
pub mod tool;

pub use media::{EmbeddingRequest, EmbeddingResponse, SpeechAudio, SpeechRequest, Transcription, TranscriptionRequest};
pub use message::{CacheControl, ContentPart, ImageSource, Message, Role, ToolResultStatus};
pub use model::ModelInfo;
pub use request::{CompletionParams, CompletionRequest, ThinkingConfig};
pub use response::{CompletionResponse, StopReason, Usage};
pub use stream::{BlockDelta, BlockKind, StreamEvent};
pub use tool::{ToolChoice, ToolSpec};
