//! Streaming STT client (§4.2): a `tokio-tungstenite` connection to a
//! Deepgram-style streaming recognizer, wrapped by the utterance-
//! finalization state machine that turns interim/final noise into exactly
//! one committed utterance per user speech turn.
//!
//! Grounded in the same WS split/reader-task/writer-task shape the
//! teacher's `server/realtime_voice.rs` uses for its own audio session,
//! generalized from an axum-side socket to a client-side one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::CallError;

const FALLBACK_TIMER: Duration = Duration::from_millis(1500);
const CLEAR_BUFFER_SUPPRESSION: Duration = Duration::from_millis(500);

/// Per-call transcriber settings (§3).
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct TranscriberConfig {
    pub provider: String,
    pub model_name: String,
    pub language: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u64,
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u64,
}

fn default_encoding() -> String {
    "mulaw".to_string()
}
fn default_sample_rate() -> u32 {
    8000
}
fn default_endpointing_ms() -> u64 {
    300
}
fn default_utterance_end_ms() -> u64 {
    1000
}

/// Committed output of the utterance-finalization wrapper: the orchestrator
/// only ever sees these, never raw interim/final recognizer noise.
#[derive(Debug, Clone)]
pub enum SttEvent {
    Interim(String),
    Final(String),
    Error(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawRecognizerMessage {
    Results {
        channel: ResultsChannel,
        is_final: bool,
        speech_final: bool,
    },
    UtteranceEnd,
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct ResultsChannel {
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    transcript: String,
}

/// One step of the utterance-finalization rules (§4.2): given the next raw
/// recognizer frame and the finalizer's running state, decide what (if
/// anything) gets committed to the orchestrator. Pulled out of the
/// finalizer task as a pure function so the five rules — including the
/// empty-final salvage in scenario S3, where the recognizer marks a result
/// final with no transcript but a prior interim exists — are directly
/// testable without a live WebSocket.
fn finalize_step(msg: RawRecognizerMessage, last_interim: &mut String, fallback_deadline: &mut Option<Instant>) -> Option<SttEvent> {
    match msg {
        RawRecognizerMessage::Results { channel, is_final, speech_final } => {
            let transcript = channel.alternatives.first().map(|a| a.transcript.clone()).unwrap_or_default();
            if is_final || speech_final {
                if !transcript.is_empty() {
                    last_interim.clear();
                    *fallback_deadline = None;
                    Some(SttEvent::Final(transcript))
                } else if !last_interim.is_empty() {
                    let salvage = std::mem::take(last_interim);
                    *fallback_deadline = None;
                    Some(SttEvent::Final(salvage))
                } else {
                    None
                }
            } else if !transcript.is_empty() {
                *last_interim = transcript.clone();
                *fallback_deadline = Some(Instant::now() + FALLBACK_TIMER);
                Some(SttEvent::Interim(transcript))
            } else {
                None
            }
        }
        RawRecognizerMessage::UtteranceEnd => {
            if !last_interim.is_empty() {
                let salvage = std::mem::take(last_interim);
                *fallback_deadline = None;
                Some(SttEvent::Final(salvage))
            } else {
                None
            }
        }
        RawRecognizerMessage::Error { message } => Some(SttEvent::Error(message)),
    }
}

/// The fallback-timer branch of the finalizer: salvages a dangling interim
/// that neither a final result nor an `UtteranceEnd` ever closed out.
fn finalize_timeout(last_interim: &mut String) -> Option<SttEvent> {
    if last_interim.is_empty() {
        return None;
    }
    Some(SttEvent::Final(std::mem::take(last_interim)))
}

/// Handle to a live streaming recognizer connection plus the
/// utterance-finalization wrapper sitting in front of it.
pub struct SttClient {
    audio_tx: mpsc::Sender<Vec<u8>>,
    state_suppress: Arc<AtomicBool>,
    transient_suppress_until: Arc<Mutex<Option<Instant>>>,
    close_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl SttClient {
    /// Open the recognizer connection and spawn the reader/finalizer tasks.
    /// Returns the client handle and the channel of committed `SttEvent`s.
    pub async fn connect(
        websocket_url: &str,
        cfg: &TranscriberConfig,
        _engine_cfg: &EngineConfig,
    ) -> Result<(Self, mpsc::Receiver<SttEvent>), CallError> {
        let url = format!(
            "{websocket_url}?encoding={}&sample_rate={}&channels=1&interim_results=true&endpointing={}&utterance_end_ms={}&vad_events=true",
            cfg.encoding, cfg.sample_rate, cfg.endpointing_ms, cfg.utterance_end_ms
        );

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| CallError::SttError(format!("recognizer connect failed: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (raw_tx, mut raw_rx) = mpsc::channel::<RawRecognizerMessage>(32);
        let (out_tx, out_rx) = mpsc::channel::<SttEvent>(32);
        let (close_tx, mut close_rx) = tokio::sync::oneshot::channel::<()>();

        // Writer task: forwards outbound audio frames, closes on shutdown.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(bytes) = audio_rx.recv() => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            return;
                        }
                    }
                    _ = &mut close_rx => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return;
                    }
                    else => return,
                }
            }
        });

        // Reader task: parses JSON result frames off the wire.
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let Ok(Message::Text(text)) = msg else { continue };
                match serde_json::from_str::<RawRecognizerMessage>(&text) {
                    Ok(parsed) => {
                        if raw_tx.send(parsed).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!(error = %e, "unparseable recognizer frame"),
                }
            }
        });

        let state_suppress = Arc::new(AtomicBool::new(false));
        let transient_suppress_until = Arc::new(Mutex::new(None));

        // Finalizer task: implements the five utterance-finalization rules
        // from §4.2.
        {
            let state_suppress = Arc::clone(&state_suppress);
            let transient_suppress_until = Arc::clone(&transient_suppress_until);
            tokio::spawn(async move {
                let mut last_interim = String::new();
                let mut fallback_deadline: Option<Instant> = None;

                loop {
                    let sleep_for = fallback_deadline
                        .map(|d| d.saturating_duration_since(Instant::now()))
                        .unwrap_or(Duration::from_secs(3600));

                    tokio::select! {
                        msg = raw_rx.recv() => {
                            let Some(msg) = msg else { return };

                            let ignoring = state_suppress.load(Ordering::SeqCst)
                                || matches!(*transient_suppress_until.lock().await, Some(d) if Instant::now() < d);
                            if ignoring {
                                continue;
                            }

                            if let Some(event) = finalize_step(msg, &mut last_interim, &mut fallback_deadline) {
                                if out_tx.send(event).await.is_err() { return; }
                            }
                        }
                        _ = tokio::time::sleep(sleep_for), if fallback_deadline.is_some() => {
                            fallback_deadline = None;
                            if let Some(event) = finalize_timeout(&mut last_interim) {
                                if out_tx.send(event).await.is_err() { return; }
                            }
                        }
                    }
                }
            });
        }

        Ok((
            Self {
                audio_tx,
                state_suppress,
                transient_suppress_until,
                close_tx: Some(close_tx),
            },
            out_rx,
        ))
    }

    /// Ship an audio chunk to the recognizer. Sent even while transcripts
    /// are being ignored, so the recognizer session stays alive (§4.9).
    pub async fn send_audio(&self, bytes: Vec<u8>) {
        let _ = self.audio_tx.send(bytes).await;
    }

    /// Drop recognizer results for 500 ms (echo suppression ahead of LLM
    /// and TTS invocation, §4.9).
    pub async fn clear_buffer(&self) {
        *self.transient_suppress_until.lock().await = Some(Instant::now() + CLEAR_BUFFER_SUPPRESSION);
    }

    /// Latch transcript suppression on/off for the duration of
    /// `thinking`/`speaking` states (§4.9), independent of `clear_buffer`'s
    /// timed window.
    pub fn set_state_suppression(&self, suppress: bool) {
        self.state_suppress.store(suppress, Ordering::SeqCst);
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for SttClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::sync::Mutex as TokioMutex;

    /// Exercises the finalization rules directly against the state they
    /// operate on, without a live WebSocket.
    struct FinalizerHarness {
        state_suppress: Arc<AtomicBool>,
        transient_suppress_until: Arc<TokioMutex<Option<Instant>>>,
    }

    impl FinalizerHarness {
        fn new() -> Self {
            Self {
                state_suppress: Arc::new(AtomicBool::new(false)),
                transient_suppress_until: Arc::new(TokioMutex::new(None)),
            }
        }

        async fn is_ignoring(&self) -> bool {
            self.state_suppress.load(Ordering::SeqCst)
                || matches!(*self.transient_suppress_until.lock().await, Some(d) if Instant::now() < d)
        }
    }

    #[tokio::test]
    async fn state_suppression_overrides_clear_buffer_window_expiry() {
        let harness = FinalizerHarness::new();
        harness.state_suppress.store(true, Ordering::SeqCst);
        assert!(harness.is_ignoring().await);
    }

    #[tokio::test]
    async fn clear_buffer_window_expires_after_its_duration() {
        let harness = FinalizerHarness::new();
        *harness.transient_suppress_until.lock().await = Some(Instant::now() - Duration::from_millis(1));
        assert!(!harness.is_ignoring().await);
    }

    fn results(transcript: &str, is_final: bool, speech_final: bool) -> RawRecognizerMessage {
        RawRecognizerMessage::Results {
            channel: ResultsChannel { alternatives: vec![Alternative { transcript: transcript.to_string() }] },
            is_final,
            speech_final,
        }
    }

    /// S3: the recognizer marks a result final with an empty transcript
    /// (common when `speech_final` fires right after VAD cuts off audio);
    /// the last interim is salvaged as the committed utterance instead of
    /// losing the turn.
    #[test]
    fn empty_final_salvages_prior_interim() {
        let mut last_interim = String::new();
        let mut fallback_deadline = None;

        let event = finalize_step(results("what time is it", false, false), &mut last_interim, &mut fallback_deadline);
        assert!(matches!(event, Some(SttEvent::Interim(t)) if t == "what time is it"));
        assert_eq!(last_interim, "what time is it");
        assert!(fallback_deadline.is_some());

        let event = finalize_step(results("", true, true), &mut last_interim, &mut fallback_deadline);
        assert!(matches!(event, Some(SttEvent::Final(t)) if t == "what time is it"));
        assert!(last_interim.is_empty());
        assert!(fallback_deadline.is_none());
    }

    /// A final result with real text always wins outright, independent of
    /// whatever interim text preceded it.
    #[test]
    fn non_empty_final_is_committed_directly() {
        let mut last_interim = "stale interim".to_string();
        let mut fallback_deadline = Some(Instant::now() + FALLBACK_TIMER);

        let event = finalize_step(results("hello there", true, false), &mut last_interim, &mut fallback_deadline);
        assert!(matches!(event, Some(SttEvent::Final(t)) if t == "hello there"));
        assert!(last_interim.is_empty());
        assert!(fallback_deadline.is_none());
    }

    /// `UtteranceEnd` without any intervening final salvages a dangling
    /// interim the same way an empty final does.
    #[test]
    fn utterance_end_salvages_dangling_interim() {
        let mut last_interim = "partial phrase".to_string();
        let mut fallback_deadline = Some(Instant::now() + FALLBACK_TIMER);

        let event = finalize_step(RawRecognizerMessage::UtteranceEnd, &mut last_interim, &mut fallback_deadline);
        assert!(matches!(event, Some(SttEvent::Final(t)) if t == "partial phrase"));
        assert!(last_interim.is_empty());
        assert!(fallback_deadline.is_none());
    }

    /// No final and no `UtteranceEnd` ever arrives; the fallback timer
    /// salvages the interim once it expires.
    #[test]
    fn fallback_timeout_salvages_interim_with_no_final() {
        let mut last_interim = "never finalized".to_string();
        let event = finalize_timeout(&mut last_interim);
        assert!(matches!(event, Some(SttEvent::Final(t)) if t == "never finalized"));
        assert!(last_interim.is_empty());
    }

    #[test]
    fn fallback_timeout_is_a_no_op_with_nothing_pending() {
        let mut last_interim = String::new();
        assert!(finalize_timeout(&mut last_interim).is_none());
    }

    #[test]
    fn recognizer_error_is_forwarded() {
        let mut last_interim = String::new();
        let mut fallback_deadline = None;
        let event = finalize_step(
            RawRecognizerMessage::Error { message: "session closed".to_string() },
            &mut last_interim,
            &mut fallback_deadline,
        );
        assert!(matches!(event, Some(SttEvent::Error(m)) if m == "session closed"));
    }
}
