//! Hosted media-stream WebSocket transport (§4.8, §6.2). Grounded in the
//! teacher's `server/voice_ws.rs` axum handler shape: `ws.split()` into a
//! sender/receiver pair, a tagged-enum wire protocol, a dedicated sender
//! task fed by an `mpsc` channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{CallError, EndReason};
use crate::llm::LlmClient;
use crate::orchestrator::{CallOrchestrator, CallOutcome, ExternalEvent, SpeechRecognizer};
use crate::recording::RecordingSink;
use crate::stt::SttClient;
use crate::tts::TtsClient;
use crate::types::{AgentProfile, CallRecord, CallStatus, CallStore};

const START_BUFFER_LIMIT: usize = 500;

/// Resolves an `agentId` (§6.2 `customParameters.agentId`) to the
/// immutable per-call configuration the orchestrator needs.
#[async_trait]
pub trait AgentProfileStore: Send + Sync {
    async fn get_profile(&self, agent_id: &str) -> Option<AgentProfile>;
}

/// In-memory agent directory. Sufficient for this crate's scope; a real
/// deployment backs `AgentProfileStore` with its own agent-definition store.
#[derive(Default)]
pub struct InMemoryAgentProfileStore {
    profiles: RwLock<HashMap<String, AgentProfile>>,
}

impl InMemoryAgentProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, agent_id: impl Into<String>, profile: AgentProfile) {
        self.profiles.write().await.insert(agent_id.into(), profile);
    }
}

#[async_trait]
impl AgentProfileStore for InMemoryAgentProfileStore {
    async fn get_profile(&self, agent_id: &str) -> Option<AgentProfile> {
        self.profiles.read().await.get(agent_id).cloned()
    }
}

/// Upstream connection settings the bridge needs to build per-call
/// STT/LLM/TTS clients (§6.4 configuration: "API credentials for
/// STT/LLM/TTS").
#[derive(Clone)]
pub struct BridgeConfig {
    pub stt_websocket_url: String,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub tts_base_url: String,
    pub tts_api_key: String,
}

#[derive(Clone)]
pub struct MediaStreamState {
    pub profiles: Arc<dyn AgentProfileStore>,
    pub bridge_config: Arc<BridgeConfig>,
    pub http: Arc<Client>,
    pub engine_config: Arc<crate::config::EngineConfig>,
    pub call_store: Arc<dyn CallStore>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundFrame {
    Start { start: StartPayload },
    Media { media: MediaPayload },
    Stop {},
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(rename = "streamSid")]
    stream_sid: String,
    #[serde(rename = "callSid")]
    call_sid: String,
    #[serde(rename = "customParameters")]
    custom_parameters: CustomParameters,
}

#[derive(Debug, Deserialize)]
struct CustomParameters {
    #[serde(rename = "agentId")]
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Serialize)]
struct OutboundMediaFrame {
    event: &'static str,
    #[serde(rename = "streamSid")]
    stream_sid: String,
    media: OutboundMediaPayload,
}

#[derive(Debug, Serialize)]
struct OutboundMediaPayload {
    payload: String,
}

pub async fn media_stream_handler(ws: WebSocketUpgrade, State(state): State<MediaStreamState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_stream(socket, state))
}

async fn handle_media_stream(socket: WebSocket, state: MediaStreamState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let ws_sender = Arc::new(Mutex::new(ws_sender));

    let mut start_buffer: VecDeque<Vec<u8>> = VecDeque::new();

    // Buffer `media` frames until `start` arrives and the session has
    // loaded its agent configuration (§4.8 500-frame start buffer).
    let (session, stream_sid, call_sid, agent_id) = loop {
        let Some(Ok(msg)) = ws_receiver.next().await else {
            info!("media-stream socket closed before start");
            return;
        };
        let WsMessage::Text(text) = msg else { continue };
        match serde_json::from_str::<InboundFrame>(&text) {
            Ok(InboundFrame::Start { start }) => {
                let Some(profile) = state.profiles.get_profile(&start.custom_parameters.agent_id).await else {
                    warn!(agent_id = %start.custom_parameters.agent_id, "unknown agent; rejecting media stream");
                    return;
                };
                let agent_id = start.custom_parameters.agent_id.clone();
                let call_sid = start.call_sid.clone();

                match setup_session(&state, profile, start.stream_sid.clone(), Arc::clone(&ws_sender)).await {
                    Ok(session) => break (session, start.stream_sid, call_sid, agent_id),
                    Err(e) => {
                        warn!(error = %e, "failed to set up media-stream session");
                        return;
                    }
                }
            }
            Ok(InboundFrame::Media { media }) => {
                if start_buffer.len() < START_BUFFER_LIMIT {
                    if let Ok(bytes) = BASE64.decode(&media.payload) {
                        start_buffer.push_back(bytes);
                    }
                } else {
                    warn!("media-stream start buffer full; dropping frame");
                }
            }
            Ok(InboundFrame::Stop {}) => {
                info!("stop received before start; nothing to tear down");
                return;
            }
            Err(e) => warn!(error = %e, "unparseable media-stream frame"),
        }
    };

    for chunk in start_buffer.drain(..) {
        let _ = session.caller_audio_tx.send(chunk).await;
    }

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let WsMessage::Text(text) = msg else { continue };
        match serde_json::from_str::<InboundFrame>(&text) {
            Ok(InboundFrame::Media { media }) => {
                if let Ok(bytes) = BASE64.decode(&media.payload) {
                    let _ = session.caller_audio_tx.send(bytes).await;
                }
            }
            Ok(InboundFrame::Stop {}) => {
                info!(stream_sid = %stream_sid, "stop received");
                break;
            }
            Ok(InboundFrame::Start { .. }) => {
                warn!("duplicate start frame ignored");
            }
            Err(e) => warn!(error = %e, "unparseable media-stream frame"),
        }
    }

    session.aborted.store(true, Ordering::SeqCst);
    let _ = session.external_tx.send(ExternalEvent::End(CallError::RemoteHangup)).await;
    let outcome = session.orchestrator_task.await;

    if let Some(sink) = session.recording.lock().await.take() {
        if let Err(e) = sink.finalize(&stream_sid).await {
            warn!(error = %e, "recording finalize failed");
        }
    }

    // The call record is the only externally visible state the core
    // produces (§6.3), independent of which transport drove the call.
    let mut record = CallRecord::new(stream_sid, agent_id, call_sid);
    match outcome {
        Ok(outcome) => {
            record.transcript = outcome.transcript;
            let final_status = match outcome.reason {
                EndReason::UserHangup | EndReason::RemoteHangup => CallStatus::Completed,
                _ => CallStatus::Failed,
            };
            record.mark_ended(outcome.reason, final_status);
        }
        Err(e) => {
            warn!(error = %e, "orchestrator task panicked");
            record.mark_ended(EndReason::Error, CallStatus::Failed);
        }
    }
    state.call_store.save(record).await;
}

struct SessionHandle {
    aborted: Arc<std::sync::atomic::AtomicBool>,
    external_tx: mpsc::Sender<ExternalEvent>,
    orchestrator_task: tokio::task::JoinHandle<CallOutcome>,
    recording: Arc<Mutex<Option<RecordingSink>>>,
    caller_audio_tx: mpsc::Sender<Vec<u8>>,
}

async fn setup_session(
    state: &MediaStreamState,
    profile: AgentProfile,
    stream_sid: String,
    ws_sender: Arc<Mutex<futures_util::stream::SplitSink<WebSocket, WsMessage>>>,
) -> Result<SessionHandle, CallError> {
    let (stt_client, stt_events) = SttClient::connect(&state.bridge_config.stt_websocket_url, &profile.transcriber, &state.engine_config).await?;
    let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(stt_client);
    let recognizer_for_bridge = Arc::clone(&recognizer);

    let llm_client = LlmClient::new(
        Arc::clone(&state.http),
        state.bridge_config.llm_base_url.clone(),
        state.bridge_config.llm_api_key.clone(),
        profile.model.clone(),
    );

    let tts_client: Arc<dyn crate::orchestrator::SpeechSynthesizer> = Arc::new(TtsClient::new(
        Arc::clone(&state.http),
        state.bridge_config.tts_base_url.clone(),
        state.bridge_config.tts_api_key.clone(),
    ));

    let (agent_audio_tx, mut agent_audio_rx) = mpsc::channel::<Vec<u8>>(64);
    let recording = Arc::new(Mutex::new(Some(RecordingSink::new(&state.engine_config.recording))));

    let orchestrator = CallOrchestrator::new(recognizer, Box::new(llm_client), tts_client, profile.voice.clone(), profile, agent_audio_tx);
    let aborted = orchestrator.abort_flag();

    let (external_tx, external_rx) = mpsc::channel(4);
    let (caller_audio_tx, mut caller_audio_rx) = mpsc::channel::<Vec<u8>>(64);

    let recording_caller = Arc::clone(&recording);
    tokio::spawn(async move {
        while let Some(bytes) = caller_audio_rx.recv().await {
            if let Some(sink) = recording_caller.lock().await.as_mut() {
                sink.push_caller_audio(&bytes);
            }
            recognizer_for_bridge.send_audio(bytes).await;
        }
    });

    let recording_agent = Arc::clone(&recording);
    let outbound_stream_sid = stream_sid.clone();
    tokio::spawn(async move {
        while let Some(bytes) = agent_audio_rx.recv().await {
            if let Some(sink) = recording_agent.lock().await.as_mut() {
                sink.push_agent_audio(&bytes);
            }
            let frame = OutboundMediaFrame {
                event: "media",
                stream_sid: outbound_stream_sid.clone(),
                media: OutboundMediaPayload { payload: BASE64.encode(&bytes) },
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = ws_sender.lock().await.send(WsMessage::Text(text)).await;
            }
        }
    });

    let orchestrator_task = tokio::spawn(orchestrator.run(stt_events, external_rx));

    Ok(SessionHandle {
        aborted,
        external_tx,
        orchestrator_task,
        recording,
        caller_audio_tx,
    })
}
