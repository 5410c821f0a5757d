//! Shared request plumbing for prism crates

#![allow(clippy::must_use_candidate)]

mod context;
mod error;

pub use context::{MODEL_PROVIDER_HEADER, RequestContext};
pub use error::HttpError;
