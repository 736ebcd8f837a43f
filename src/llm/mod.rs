//! Streaming LLM chat client (§4.3).

pub mod client;

pub use client::{LlmClient, ModelConfig};
