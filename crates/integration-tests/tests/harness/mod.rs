//! Shared fixtures: config builder, gateway server, and mock upstreams

pub mod config;
pub mod mock_llm;
pub mod server;
