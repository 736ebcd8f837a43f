//! Conversation orchestrator (§4.9): the state machine that owns one
//! call's STT/LLM/TTS collaborators and drives `idle → listening →
//! thinking → speaking → ended`.
//!
//! Grounded in the teacher's `server/realtime_voice.rs` turn loop: a
//! single task owning conversation state, an `interrupted`-style abort
//! flag checked at every suspension point, generalized to the spec's five
//! named states and `Arc<AtomicBool>` so the flag can be set from outside
//! the task (remote BYE, transport close).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{CallError, EndReason};
use crate::orchestrator::state::CallState;
use crate::orchestrator::traits::{ChatClient, SpeechRecognizer, SpeechSynthesizer};
use crate::stt::SttEvent;
use crate::tts::VoiceConfig;
use crate::types::{AgentProfile, ConversationEntry};

const APOLOGY: &str = "Sorry, I encountered an issue. Could you please repeat that?";
const STT_ERROR_REPEAT_WINDOW: Duration = Duration::from_secs(5);

/// Externally raised events the orchestrator must react to, e.g. a remote
/// BYE or a closed transport — these originate outside the orchestrator's
/// own task (§7).
pub enum ExternalEvent {
    End(CallError),
}

/// The final outcome of [`CallOrchestrator::run`]: why the call ended and
/// the conversation log accumulated along the way (§6.3).
pub struct CallOutcome {
    pub reason: EndReason,
    pub transcript: Vec<ConversationEntry>,
}

pub struct CallOrchestrator {
    state: CallState,
    aborted: Arc<AtomicBool>,
    recognizer: Arc<dyn SpeechRecognizer>,
    llm: Box<dyn ChatClient>,
    tts: Arc<dyn SpeechSynthesizer>,
    voice: VoiceConfig,
    profile: AgentProfile,
    audio_out: mpsc::Sender<Vec<u8>>,
    transcript: Vec<ConversationEntry>,
    last_stt_error_at: Option<Instant>,
}

impl CallOrchestrator {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        llm: Box<dyn ChatClient>,
        tts: Arc<dyn SpeechSynthesizer>,
        voice: VoiceConfig,
        profile: AgentProfile,
        audio_out: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            state: CallState::Idle,
            aborted: Arc::new(AtomicBool::new(false)),
            recognizer,
            llm,
            tts,
            voice,
            profile,
            audio_out,
            transcript: Vec::new(),
            last_stt_error_at: None,
        }
    }

    /// Handle shared with external callers (SIP dialog handling a BYE,
    /// the media bridge noticing a closed socket) so they can end the call
    /// without holding a reference to the orchestrator's task (§5 cancellation).
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// An abort observed mid-speak (TTS stopped early because `aborted` went
    /// true while a `synthesize()` call was in flight) may have been raised
    /// by an external event already queued on `external` — e.g. a SIP BYE
    /// (§7 S4). Drain it non-blockingly so the call ends with the precise
    /// reason instead of the generic `user_hangup` fallback.
    fn resolve_abort_reason(external: &mut mpsc::Receiver<ExternalEvent>) -> EndReason {
        match external.try_recv() {
            Ok(ExternalEvent::End(err)) => err.terminal_reason(),
            Err(_) => EndReason::UserHangup,
        }
    }

    /// Drive the call to completion. Consumes `self` because `Ended` is
    /// absorbing and there is nothing left to do with the orchestrator
    /// afterward.
    pub async fn run(
        mut self,
        mut stt_events: mpsc::Receiver<SttEvent>,
        mut external: mpsc::Receiver<ExternalEvent>,
    ) -> CallOutcome {
        let max_duration_deadline = Instant::now() + Duration::from_secs(self.profile.max_duration_seconds);
        let mut silence_deadline: Option<Instant> = None;

        if self.profile.first_message_mode == crate::types::FirstMessageMode::AssistantSpeaksFirst {
            self.state = CallState::Speaking;
            let first_message = self.profile.first_message.clone();
            if let Err(reason) = self.speak(&first_message).await {
                return self.finish(reason);
            }
            if self.is_aborted() {
                let reason = Self::resolve_abort_reason(&mut external);
                return self.finish(reason);
            }
        }

        self.state = CallState::Listening;
        silence_deadline = Some(Instant::now() + Duration::from_secs(self.profile.silence_timeout_seconds));

        loop {
            if self.is_aborted() {
                let reason = Self::resolve_abort_reason(&mut external);
                return self.finish(reason);
            }

            let silence_sleep = silence_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                Some(event) = external.recv() => {
                    match event {
                        ExternalEvent::End(err) => return self.finish(err.terminal_reason()),
                    }
                }
                _ = tokio::time::sleep_until(max_duration_deadline) => {
                    return self.finish(EndReason::MaxDuration);
                }
                _ = tokio::time::sleep_until(silence_sleep), if silence_deadline.is_some() && self.state == CallState::Listening => {
                    return self.finish(EndReason::SilenceTimeout);
                }
                maybe_event = stt_events.recv(), if self.state == CallState::Listening => {
                    let Some(event) = maybe_event else {
                        return self.finish(EndReason::TransportError);
                    };
                    match event {
                        SttEvent::Interim(_) => {
                            silence_deadline = Some(Instant::now() + Duration::from_secs(self.profile.silence_timeout_seconds));
                        }
                        SttEvent::Final(text) => {
                            silence_deadline = None;
                            if let Some(reason) = self.handle_user_utterance(text, &mut external).await {
                                return self.finish(reason);
                            }
                            if self.is_aborted() {
                                let reason = Self::resolve_abort_reason(&mut external);
                                return self.finish(reason);
                            }
                            silence_deadline = Some(Instant::now() + Duration::from_secs(self.profile.silence_timeout_seconds));
                        }
                        SttEvent::Error(message) => {
                            warn!(error = %message, "STT stream error");
                            let now = Instant::now();
                            if let Some(prev) = self.last_stt_error_at {
                                if now.duration_since(prev) < STT_ERROR_REPEAT_WINDOW {
                                    return self.finish(EndReason::Error);
                                }
                            }
                            self.last_stt_error_at = Some(now);
                        }
                    }
                }
            }
        }
    }

    /// Handles one committed user utterance: response delay, LLM turn,
    /// TTS playback, and the error-recovery apology path (§4.9, §7).
    /// Returns `Some(reason)` if the call must end as a result.
    async fn handle_user_utterance(&mut self, text: String, external: &mut mpsc::Receiver<ExternalEvent>) -> Option<EndReason> {
        self.transcript.push(ConversationEntry::user(&text));
        self.state = CallState::Thinking;
        self.recognizer.set_state_suppression(true);

        tokio::time::sleep(Duration::from_secs_f64(self.profile.response_delay_seconds)).await;
        if self.is_aborted() {
            return Some(Self::resolve_abort_reason(external));
        }

        self.recognizer.clear_buffer().await;

        let mut chunks_sink = |_chunk: &str| {};
        match self.llm.get_response(&text, &mut chunks_sink).await {
            Ok(reply) => {
                self.transcript.push(ConversationEntry::assistant(reply.clone()));
                if let Err(reason) = self.speak(&reply).await {
                    return Some(reason);
                }
                if self.is_aborted() {
                    return Some(Self::resolve_abort_reason(external));
                }
                self.state = CallState::Listening;
                self.recognizer.set_state_suppression(false);
                None
            }
            Err(e) => {
                warn!(error = %e, "LLM error; recovering with apology");
                match self.speak(APOLOGY).await {
                    Ok(()) => {
                        if self.is_aborted() {
                            return Some(Self::resolve_abort_reason(external));
                        }
                        self.state = CallState::Listening;
                        self.recognizer.set_state_suppression(false);
                        None
                    }
                    Err(_) => Some(EndReason::Error),
                }
            }
        }
    }

    /// Speak `text` through TTS, forwarding audio chunks on `audio_out`.
    /// On synthesis failure, attempts exactly the caller's fallback logic —
    /// the apology path calls this again, so a second failure here is the
    /// caller's job to turn into `EndReason::Error` (§7 TTSError row).
    async fn speak(&mut self, text: &str) -> Result<(), EndReason> {
        self.state = CallState::Speaking;
        self.recognizer.clear_buffer().await;

        let audio_out = self.audio_out.clone();
        let mut on_chunk = |chunk: &[u8]| {
            let _ = audio_out.try_send(chunk.to_vec());
        };

        let result = self
            .tts
            .synthesize(text, &self.voice, Arc::clone(&self.aborted), &mut on_chunk)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "TTS synthesis failed");
                Err(EndReason::Error)
            }
        }
    }

    fn finish(self, reason: EndReason) -> CallOutcome {
        self.aborted.store(true, Ordering::SeqCst);
        info!(reason = %reason, turns = self.transcript.len(), "call ended");
        CallOutcome {
            reason,
            transcript: self.transcript,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelConfig;
    use crate::stt::TranscriberConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct FakeRecognizer {
        suppressed: Mutex<bool>,
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn send_audio(&self, _bytes: Vec<u8>) {}
        async fn clear_buffer(&self) {}
        fn set_state_suppression(&self, suppress: bool) {
            *self.suppressed.lock().unwrap() = suppress;
        }
    }

    struct FakeLlm {
        reply: String,
        fail: bool,
    }

    #[async_trait]
    impl ChatClient for FakeLlm {
        async fn get_response(&mut self, _user_text: &str, on_chunk: &mut (dyn FnMut(&str) + Send)) -> Result<String, CallError> {
            if self.fail {
                return Err(CallError::LlmError("boom".to_string()));
            }
            on_chunk(&self.reply);
            Ok(self.reply.clone())
        }
    }

    struct FakeTts {
        fail: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeTts {
        async fn synthesize(
            &self,
            _text: &str,
            _voice: &VoiceConfig,
            _abort: Arc<AtomicBool>,
            on_chunk: &mut (dyn FnMut(&[u8]) + Send),
        ) -> Result<(), CallError> {
            if self.fail {
                return Err(CallError::TtsError("boom".to_string()));
            }
            on_chunk(&[0xFFu8; 160]);
            Ok(())
        }
    }

    fn test_profile(mode: crate::types::FirstMessageMode) -> AgentProfile {
        AgentProfile {
            model: ModelConfig {
                provider: "openrouter".to_string(),
                model_name: "test-model".to_string(),
                system_prompt: "test".to_string(),
                temperature: 0.5,
                max_tokens: 100,
            },
            voice: VoiceConfig {
                provider: "elevenlabs".to_string(),
                voice_id: "v1".to_string(),
                tts_model_id: "eleven_multilingual_v2".to_string(),
                stability: 0.5,
                similarity_boost: 0.75,
                speed: 1.0,
                language: None,
                output_format: "ulaw_8000".to_string(),
                use_speaker_boost: false,
                style: 0.0,
                hinglish_mode: false,
            },
            transcriber: TranscriberConfig {
                provider: "deepgram".to_string(),
                model_name: "nova-2".to_string(),
                language: "en".to_string(),
                encoding: "mulaw".to_string(),
                sample_rate: 8000,
                endpointing_ms: 300,
                utterance_end_ms: 1000,
            },
            first_message: "Hi there".to_string(),
            first_message_mode: mode,
            max_duration_seconds: 600,
            silence_timeout_seconds: 15,
            response_delay_seconds: 0.01,
        }
    }

    fn build(mode: crate::types::FirstMessageMode, llm_fail: bool, tts_fail: bool) -> (CallOrchestrator, mpsc::Receiver<Vec<u8>>) {
        let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(FakeRecognizer { suppressed: Mutex::new(false) });
        let llm: Box<dyn ChatClient> = Box::new(FakeLlm { reply: "hello back".to_string(), fail: llm_fail });
        let tts: Arc<dyn SpeechSynthesizer> = Arc::new(FakeTts { fail: tts_fail });
        let (audio_tx, audio_rx) = mpsc::channel(16);
        let profile = test_profile(mode);
        let voice = profile.voice.clone();
        (CallOrchestrator::new(recognizer, llm, tts, voice, profile, audio_tx), audio_rx)
    }

    #[tokio::test]
    async fn user_speaks_first_starts_in_listening() {
        let (orchestrator, _audio_rx) = build(crate::types::FirstMessageMode::UserSpeaksFirst, false, false);
        let abort = orchestrator.abort_flag();
        let (_stt_tx, stt_rx) = mpsc::channel(8);
        let (ext_tx, ext_rx) = mpsc::channel(1);

        let handle = tokio::spawn(orchestrator.run(stt_rx, ext_rx));
        abort.store(true, Ordering::SeqCst);
        drop(ext_tx);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.reason, EndReason::UserHangup);
    }

    #[tokio::test]
    async fn committed_utterance_produces_assistant_turn_and_audio() {
        let (orchestrator, mut audio_rx) = build(crate::types::FirstMessageMode::UserSpeaksFirst, false, false);
        let abort = orchestrator.abort_flag();
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (_ext_tx, ext_rx) = mpsc::channel(1);

        let handle = tokio::spawn(orchestrator.run(stt_rx, ext_rx));
        stt_tx.send(SttEvent::Final("hello agent".to_string())).await.unwrap();

        let chunk = audio_rx.recv().await.unwrap();
        assert_eq!(chunk.len(), 160);

        abort.store(true, Ordering::SeqCst);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.transcript.len(), 2);
    }

    #[tokio::test]
    async fn llm_error_recovers_with_apology_and_stays_alive() {
        let (orchestrator, mut audio_rx) = build(crate::types::FirstMessageMode::UserSpeaksFirst, true, false);
        let abort = orchestrator.abort_flag();
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (_ext_tx, ext_rx) = mpsc::channel(1);

        let handle = tokio::spawn(orchestrator.run(stt_rx, ext_rx));
        stt_tx.send(SttEvent::Final("hello agent".to_string())).await.unwrap();

        let chunk = audio_rx.recv().await.unwrap();
        assert_eq!(chunk.len(), 160);

        abort.store(true, Ordering::SeqCst);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.transcript.len(), 1);
    }

    #[tokio::test]
    async fn apology_tts_failure_ends_the_call_with_error() {
        let (orchestrator, _audio_rx) = build(crate::types::FirstMessageMode::UserSpeaksFirst, true, true);
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (_ext_tx, ext_rx) = mpsc::channel(1);

        let handle = tokio::spawn(orchestrator.run(stt_rx, ext_rx));
        stt_tx.send(SttEvent::Final("hello agent".to_string())).await.unwrap();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.reason, EndReason::Error);
    }

    #[tokio::test]
    async fn external_end_event_is_honored() {
        let (orchestrator, _audio_rx) = build(crate::types::FirstMessageMode::UserSpeaksFirst, false, false);
        let (_stt_tx, stt_rx) = mpsc::channel(8);
        let (ext_tx, ext_rx) = mpsc::channel(1);

        let handle = tokio::spawn(orchestrator.run(stt_rx, ext_rx));
        ext_tx.send(ExternalEvent::End(CallError::RemoteHangup)).await.unwrap();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.reason, EndReason::RemoteHangup);
    }
}
