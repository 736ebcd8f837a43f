//! Collaborator traits the orchestrator drives (§4.9, §3 ownership rules).
//!
//! Defined as traits — rather than the orchestrator holding concrete
//! `SttClient`/`LlmClient`/`TtsClient` types directly — so the state
//! machine can be driven by fakes in tests the same way the teacher's own
//! `agent/llm.rs` callers are tested against a mock `OpenRouterClient`.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CallError;
use crate::llm::LlmClient;
use crate::stt::SttClient;
use crate::tts::{TtsClient, VoiceConfig};

/// Control surface of a streaming recognizer connection. Transcript
/// delivery itself happens over the `mpsc::Receiver<SttEvent>` returned by
/// `SttClient::connect`, held directly by the orchestrator.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn send_audio(&self, bytes: Vec<u8>);
    async fn clear_buffer(&self);
    fn set_state_suppression(&self, suppress: bool);
}

#[async_trait]
impl SpeechRecognizer for SttClient {
    async fn send_audio(&self, bytes: Vec<u8>) {
        SttClient::send_audio(self, bytes).await
    }

    async fn clear_buffer(&self) {
        SttClient::clear_buffer(self).await
    }

    fn set_state_suppression(&self, suppress: bool) {
        SttClient::set_state_suppression(self, suppress)
    }
}

/// A chat turn collaborator (§4.3).
#[async_trait]
pub trait ChatClient: Send {
    async fn get_response(
        &mut self,
        user_text: &str,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String, CallError>;
}

#[async_trait]
impl ChatClient for LlmClient {
    async fn get_response(
        &mut self,
        user_text: &str,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String, CallError> {
        LlmClient::get_response(self, user_text, |chunk| on_chunk(chunk)).await
    }
}

/// A speech synthesis collaborator (§4.4).
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
        abort: Arc<AtomicBool>,
        on_chunk: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<(), CallError>;
}

#[async_trait]
impl SpeechSynthesizer for TtsClient {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
        abort: Arc<AtomicBool>,
        on_chunk: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<(), CallError> {
        TtsClient::text_to_speech_stream(self, text, voice, abort, |chunk| on_chunk(chunk)).await
    }
}
