//! Streaming speech-to-text client and utterance finalization (§4.2).

pub mod client;

pub use client::{SttClient, SttEvent, TranscriberConfig};
