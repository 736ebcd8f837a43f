//! Streaming text-to-speech client (§4.4).

pub mod client;

pub use client::{TtsClient, VoiceConfig};
