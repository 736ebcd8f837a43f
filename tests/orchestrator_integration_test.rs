//! End-to-end orchestrator scenarios (S1, S2, S4) driven entirely through
//! the public trait surface with fake STT/LLM/TTS collaborators — no
//! network, no real telephony transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use my_agent::error::{CallError, EndReason};
use my_agent::llm::ModelConfig;
use my_agent::orchestrator::{CallOrchestrator, ChatClient, ExternalEvent, SpeechRecognizer, SpeechSynthesizer};
use my_agent::stt::{SttEvent, TranscriberConfig};
use my_agent::tts::VoiceConfig;
use my_agent::types::{AgentProfile, FirstMessageMode};

struct SilentRecognizer;

#[async_trait]
impl SpeechRecognizer for SilentRecognizer {
    async fn send_audio(&self, _bytes: Vec<u8>) {}
    async fn clear_buffer(&self) {}
    fn set_state_suppression(&self, _suppress: bool) {}
}

struct EchoLlm;

#[async_trait]
impl ChatClient for EchoLlm {
    async fn get_response(&mut self, user_text: &str, on_chunk: &mut (dyn FnMut(&str) + Send)) -> Result<String, CallError> {
        let reply = format!("It is noon, you said: {user_text}");
        on_chunk(&reply);
        Ok(reply)
    }
}

struct CountingTts {
    chunks_sent: std::sync::Mutex<usize>,
}

#[async_trait]
impl SpeechSynthesizer for CountingTts {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceConfig,
        abort: Arc<AtomicBool>,
        on_chunk: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<(), CallError> {
        for _ in 0..text.len().max(1) {
            if abort.load(Ordering::SeqCst) {
                return Ok(());
            }
            on_chunk(&[0xFFu8; 160]);
            *self.chunks_sent.lock().unwrap() += 1;
        }
        Ok(())
    }
}

fn test_profile(mode: FirstMessageMode, silence_timeout_seconds: u64) -> AgentProfile {
    AgentProfile {
        model: ModelConfig {
            provider: "openrouter".to_string(),
            model_name: "test-model".to_string(),
            system_prompt: "You are a helpful phone agent.".to_string(),
            temperature: 0.7,
            max_tokens: 500,
        },
        voice: VoiceConfig {
            provider: "elevenlabs".to_string(),
            voice_id: "voice-1".to_string(),
            tts_model_id: "eleven_turbo_v2".to_string(),
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
        first_message: "Hello.".to_string(),
        first_message_mode: mode,
        max_duration_seconds: 3600,
        silence_timeout_seconds,
        response_delay_seconds: 0.0,
    }
}

/// S1: a silent caller with assistant-speaks-first times out on silence;
/// the log contains only the first message.
#[tokio::test]
async fn silent_caller_ends_with_silence_timeout() {
    let tts = Arc::new(CountingTts { chunks_sent: std::sync::Mutex::new(0) });
    let orchestrator = CallOrchestrator::new(
        Arc::new(SilentRecognizer),
        Box::new(EchoLlm),
        tts,
        VoiceConfig {
            provider: "elevenlabs".to_string(),
            voice_id: "voice-1".to_string(),
            tts_model_id: "eleven_turbo_v2".to_string(),
            stability: 0.5,
            similarity_boost: 0.75,
            speed: 1.0,
            language: None,
            output_format: "ulaw_8000".to_string(),
            use_speaker_boost: false,
            style: 0.0,
            hinglish_mode: false,
        },
        test_profile(FirstMessageMode::AssistantSpeaksFirst, 1),
        mpsc::channel(64).0,
    );

    let (_stt_tx, stt_rx) = mpsc::channel::<SttEvent>(1);
    let (_ext_tx, ext_rx) = mpsc::channel::<ExternalEvent>(1);

    let outcome = orchestrator.run(stt_rx, ext_rx).await;

    assert_eq!(outcome.reason, EndReason::SilenceTimeout);
    assert_eq!(outcome.transcript.len(), 1);
    assert_eq!(outcome.transcript[0].content, "Hello.");
}

/// S2: one user turn produces a three-entry log and at least one outbound
/// audio chunk.
#[tokio::test]
async fn one_turn_call_produces_full_conversation_log() {
    let tts = Arc::new(CountingTts { chunks_sent: std::sync::Mutex::new(0) });
    let profile = test_profile(FirstMessageMode::AssistantSpeaksFirst, 3600);
    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);

    let orchestrator = CallOrchestrator::new(
        Arc::new(SilentRecognizer),
        Box::new(EchoLlm),
        tts,
        profile.voice.clone(),
        profile,
        audio_tx,
    );

    let (stt_tx, stt_rx) = mpsc::channel::<SttEvent>(4);
    let (ext_tx, ext_rx) = mpsc::channel::<ExternalEvent>(4);

    let run_task = tokio::spawn(orchestrator.run(stt_rx, ext_rx));

    stt_tx.send(SttEvent::Final("what time is it".to_string())).await.unwrap();
    // Let the orchestrator process the turn, then hang up.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    ext_tx.send(ExternalEvent::End(CallError::RemoteHangup)).await.unwrap();

    let outcome = run_task.await.unwrap();

    assert_eq!(outcome.transcript.len(), 3);
    assert_eq!(outcome.transcript[0].content, "Hello.");
    assert_eq!(outcome.transcript[1].content, "what time is it");
    assert!(outcome.transcript[2].content.contains("It is noon"));
    assert!(audio_rx.try_recv().is_ok(), "expected at least one outbound audio chunk");
}

/// S4: a remote hangup arriving mid-`speaking` aborts TTS (observed via the
/// shared `aborted` flag a caller gets from `abort_flag()`, exactly as the
/// media-stream bridge does on a closed transport) and ends the call with
/// `remote_hangup`, without the orchestrator ever reaching a second
/// `speak()` call.
#[tokio::test]
async fn remote_hangup_mid_speaking_aborts_tts() {
    struct BlockingTts {
        aborted_observed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SpeechSynthesizer for BlockingTts {
        async fn synthesize(
            &self,
            _text: &str,
            _voice: &VoiceConfig,
            abort: Arc<AtomicBool>,
            _on_chunk: &mut (dyn FnMut(&[u8]) + Send),
        ) -> Result<(), CallError> {
            for _ in 0..50 {
                if abort.load(Ordering::SeqCst) {
                    self.aborted_observed.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            Ok(())
        }
    }

    let aborted_observed = Arc::new(AtomicBool::new(false));
    let profile = test_profile(FirstMessageMode::AssistantSpeaksFirst, 3600);
    let (audio_tx, _audio_rx) = mpsc::channel::<Vec<u8>>(64);

    let orchestrator = CallOrchestrator::new(
        Arc::new(SilentRecognizer),
        Box::new(EchoLlm),
        Arc::new(BlockingTts { aborted_observed: Arc::clone(&aborted_observed) }),
        profile.voice.clone(),
        profile,
        audio_tx,
    );

    let aborted = orchestrator.abort_flag();
    let (_stt_tx, stt_rx) = mpsc::channel::<SttEvent>(1);
    let (ext_tx, ext_rx) = mpsc::channel::<ExternalEvent>(1);

    let run_task = tokio::spawn(orchestrator.run(stt_rx, ext_rx));

    // Mirror the media-stream bridge's transport-closed handler: flip the
    // shared abort flag directly (so the in-flight synthesize() call can
    // observe it between chunks) and queue the precise reason for the
    // orchestrator to pick up once it stops awaiting that call.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    aborted.store(true, Ordering::SeqCst);
    ext_tx.send(ExternalEvent::End(CallError::RemoteHangup)).await.unwrap();

    let outcome = run_task.await.unwrap();
    assert!(aborted_observed.load(Ordering::SeqCst), "TTS should have observed the abort flag mid-stream");
    assert_eq!(outcome.reason, EndReason::RemoteHangup);
}
