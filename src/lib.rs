//! Voice-agent call engine library.
//!
//! Bridges telephony audio (SIP/RTP or a hosted media-stream WebSocket) to
//! streaming STT/LLM/TTS providers, with a conversation orchestrator that
//! owns turn-taking, barge-in, and cancellation.
//!
//! # Example
//!
//! ```ignore
//! use my_agent::config::EngineConfig;
//! use my_agent::engine::CallEngine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load()?;
//!     let engine = CallEngine::new(config);
//!     engine.register().await?;
//!     Ok(())
//! }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod security;
pub mod codec;

pub mod rtp;
pub mod sip;
pub mod stt;
pub mod llm;
pub mod tts;
pub mod recording;
pub mod orchestrator;
pub mod bridge;
pub mod engine;

pub mod server;
pub mod cli;

pub use config::EngineConfig;
pub use engine::{CallEngine, CallEngineStats};
pub use error::{CallError, EndReason};
pub use security::{delete_credential, get_credential, has_credential, set_credential};
pub use types::{AgentProfile, CallRecord, CallStatus, CallStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - voice-agent call engine", NAME, VERSION)
}
