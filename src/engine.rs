//! Call engine (§5 concurrency & resource model): owns the shared SIP
//! transport and the call registries, and drives outgoing calls end to
//! end. Modeled on the teacher's `Gateway` (`gateway/mod.rs`):
//! `Arc<Mutex<...>>` state, `register`/`dial`/`stats` lifecycle methods.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use reqwest::Client;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::bridge::{spawn_sip_bridge, BridgeConfig};
use crate::config::EngineConfig;
use crate::error::{CallError, EndReason};
use crate::llm::LlmClient;
use crate::orchestrator::{CallOrchestrator, ExternalEvent, SpeechRecognizer, SpeechSynthesizer};
use crate::recording::RecordingSink;
use crate::rtp::RtpSession;
use crate::security::keyring;
use crate::sip::sdp::parse_answer;
use crate::sip::{SdpAnswer, SipDialogState, SipTransport};
use crate::stt::SttClient;
use crate::tts::TtsClient;
use crate::types::{AgentProfile, CallRecord, CallStatus, CallStore, InMemoryCallStore};

/// Bookkeeping kept in the engine's `activeSessions` registry (§5) for the
/// lifetime of one outgoing call.
struct ActiveCall {
    aborted: Arc<AtomicBool>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CallEngineStats {
    pub active_calls: usize,
    pub registered: bool,
}

pub struct CallEngine {
    config: Arc<EngineConfig>,
    http: Arc<Client>,
    sip: Mutex<Option<Arc<SipTransport>>>,
    active_sessions: Arc<Mutex<HashMap<String, ActiveCall>>>,
    bridge_config: Arc<BridgeConfig>,
    call_store: Arc<dyn CallStore>,
}

impl CallEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_call_store(config, InMemoryCallStore::new())
    }

    pub fn with_call_store(config: EngineConfig, call_store: Arc<dyn CallStore>) -> Self {
        let bridge_config = Arc::new(BridgeConfig {
            stt_websocket_url: std::env::var("VOICE_ENGINE_STT_WS_URL")
                .unwrap_or_else(|_| "wss://api.deepgram.com/v1/listen".to_string()),
            llm_base_url: std::env::var("VOICE_ENGINE_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            llm_api_key: keyring::get_credential("llm").unwrap_or_default(),
            tts_base_url: std::env::var("VOICE_ENGINE_TTS_BASE_URL")
                .unwrap_or_else(|_| "https://api.elevenlabs.io".to_string()),
            tts_api_key: keyring::get_credential("tts").unwrap_or_default(),
        });

        Self {
            config: Arc::new(config),
            http: Arc::new(Client::new()),
            sip: Mutex::new(None),
            active_sessions: Arc::new(Mutex::new(HashMap::new())),
            bridge_config,
            call_store,
        }
    }

    pub fn call_store(&self) -> Arc<dyn CallStore> {
        Arc::clone(&self.call_store)
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config)
    }

    pub fn http_client(&self) -> Arc<Client> {
        Arc::clone(&self.http)
    }

    pub fn bridge_config(&self) -> Arc<BridgeConfig> {
        Arc::clone(&self.bridge_config)
    }

    /// Register with the configured SIP trunk, retaining the transport for
    /// outgoing calls (§4.6: the REGISTER socket is reused for INVITE).
    pub async fn register(&self) -> Result<(), CallError> {
        let transport = SipTransport::new(self.config.sip.clone()).await?;
        transport.register().await?;
        *self.sip.lock().await = Some(Arc::new(transport));
        info!("SIP trunk registration complete");
        Ok(())
    }

    pub async fn stats(&self) -> CallEngineStats {
        CallEngineStats {
            active_calls: self.active_sessions.lock().await.len(),
            registered: self.sip.lock().await.is_some(),
        }
    }

    /// Place an outgoing call and run it to completion, returning the
    /// persisted call record (§6.3).
    pub async fn dial(&self, call_id: String, destination_number: String, profile: AgentProfile) -> Result<CallRecord, CallError> {
        if profile.voice.voice_id.is_empty() || profile.transcriber.model_name.is_empty() || profile.model.model_name.is_empty() {
            return Err(CallError::ConfigInvalid("missing voice/transcriber/model".to_string()));
        }

        let sip = {
            let guard = self.sip.lock().await;
            guard.as_ref().cloned().ok_or_else(|| CallError::CallSetupFailure("not registered with trunk".to_string()))?
        };

        let mut record = CallRecord::new(call_id.clone(), "default-agent", destination_number.clone());
        record.status = CallStatus::Ringing;

        let local_rtp_port = pick_rtp_port(&self.config);
        let mut dialog = SipDialogState::new(local_rtp_port);

        let (answer, reroute_rx): (SdpAnswer, mpsc::Receiver<crate::sip::SipResponse>) =
            match sip.invite(&mut dialog, &destination_number, local_rtp_port).await {
                Ok(v) => v,
                Err(e) => {
                    record.mark_ended(e.terminal_reason(), CallStatus::Failed);
                    self.call_store.save(record).await;
                    return Err(e);
                }
            };
        record.status = CallStatus::InProgress;

        let in_dialog_rx = sip.register_dialog(&dialog.call_id).await;
        let dialog = Arc::new(Mutex::new(dialog));

        let remote_addr: std::net::SocketAddr = format!("{}:{}", answer.remote_ip, answer.remote_port)
            .parse()
            .map_err(|e| CallError::CallSetupFailure(format!("invalid remote RTP address: {e}")))?;
        let rtp = Arc::new(RtpSession::bind(local_rtp_port, remote_addr, answer.payload_type).await?);

        let (stt_client, stt_events) = SttClient::connect(&self.bridge_config.stt_websocket_url, &profile.transcriber, &self.config).await?;
        let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(stt_client);
        let recognizer_for_bridge = Arc::clone(&recognizer);

        let llm_client = LlmClient::new(Arc::clone(&self.http), self.bridge_config.llm_base_url.clone(), self.bridge_config.llm_api_key.clone(), profile.model.clone());
        let tts_client: Arc<dyn SpeechSynthesizer> = Arc::new(TtsClient::new(Arc::clone(&self.http), self.bridge_config.tts_base_url.clone(), self.bridge_config.tts_api_key.clone()));

        let (agent_audio_tx, agent_audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (caller_audio_tx, caller_audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let recording = Arc::new(Mutex::new(RecordingSink::new(&self.config.recording)));

        let voice = profile.voice.clone();
        let orchestrator = CallOrchestrator::new(recognizer, Box::new(llm_client), tts_client, voice, profile, agent_audio_tx);
        let aborted = orchestrator.abort_flag();

        rtp.spawn_receiver(caller_audio_tx, Arc::clone(&aborted));
        rtp.spawn_pacer(Arc::clone(&aborted));
        spawn_sip_bridge(Arc::clone(&rtp), caller_audio_rx, recognizer_for_bridge, agent_audio_rx, Arc::clone(&recording));

        self.active_sessions.lock().await.insert(call_id.clone(), ActiveCall { aborted: Arc::clone(&aborted) });

        let (external_tx, external_rx) = mpsc::channel(4);

        // Later 200 OKs on this dialog are mid-call SDP re-routes (§4.6
        // item 3): re-point the RTP session's remote endpoint instead of
        // letting them sit unread.
        tokio::spawn(reroute_listener(reroute_rx, Arc::clone(&rtp), Arc::clone(&dialog), Arc::clone(&aborted)));

        // In-dialog BYE/ACK/re-INVITE requests arrive on their own channel
        // (§4.6 "In-dialog request handling"); a BYE ends the call with
        // `remote_hangup` instead of leaving the orchestrator waiting on a
        // channel nothing ever feeds.
        tokio::spawn(bye_monitor(
            in_dialog_rx,
            Arc::clone(&sip),
            Arc::clone(&dialog),
            Arc::clone(&aborted),
            external_tx,
        ));

        let outcome = orchestrator.run(stt_events, external_rx).await;

        self.active_sessions.lock().await.remove(&call_id);

        record.transcript = outcome.transcript;
        let final_status = match outcome.reason {
            EndReason::UserHangup | EndReason::RemoteHangup => CallStatus::Completed,
            _ => CallStatus::Failed,
        };
        record.mark_ended(outcome.reason, final_status);

        {
            let mut dialog = dialog.lock().await;
            let _ = sip.send_bye(&mut dialog, &destination_number).await;
        }

        if let Ok(sink) = Arc::try_unwrap(recording) {
            record.recording_url = sink.into_inner().finalize(&call_id).await.unwrap_or(None);
        }

        self.call_store.save(record.clone()).await;

        Ok(record)
    }
}

fn pick_rtp_port(config: &EngineConfig) -> u16 {
    rand::thread_rng().gen_range(config.sip.rtp_port_min..=config.sip.rtp_port_max)
}

/// Re-point the RTP session's remote endpoint when a later 200 OK on the
/// same dialog carries a changed SDP answer (§4.6 item 3). Exits once the
/// response channel closes (dialog torn down) or the call is aborted.
async fn reroute_listener(
    mut reroute_rx: mpsc::Receiver<crate::sip::SipResponse>,
    rtp: Arc<RtpSession>,
    dialog: Arc<Mutex<SipDialogState>>,
    aborted: Arc<AtomicBool>,
) {
    while let Some(resp) = reroute_rx.recv().await {
        if aborted.load(Ordering::SeqCst) {
            return;
        }
        if !resp.is_success() {
            continue;
        }
        let Some(answer) = parse_answer(&resp.body) else {
            warn!("mid-call 200 OK without usable SDP; ignoring");
            continue;
        };
        let Ok(new_remote) = format!("{}:{}", answer.remote_ip, answer.remote_port).parse() else {
            warn!("mid-call 200 OK with invalid remote RTP address; ignoring");
            continue;
        };
        if rtp.apply_sdp_reroute(new_remote).await {
            let lockout_until = std::time::Instant::now() + crate::rtp::session::REROUTE_LOCKOUT;
            dialog.lock().await.mark_sdp_reroute(lockout_until);
        }
    }
}

/// Read in-dialog SIP requests (BYE/ACK/re-INVITE) for one call and, on a
/// BYE, abort the call and surface `ExternalEvent::End(RemoteHangup)` to the
/// orchestrator (§4.6 "In-dialog request handling").
async fn bye_monitor(
    mut in_dialog_rx: mpsc::Receiver<String>,
    sip: Arc<SipTransport>,
    dialog: Arc<Mutex<SipDialogState>>,
    aborted: Arc<AtomicBool>,
    external_tx: mpsc::Sender<ExternalEvent>,
) {
    while let Some(raw) = in_dialog_rx.recv().await {
        let is_bye = {
            let mut dialog = dialog.lock().await;
            sip.handle_in_dialog_request(&mut dialog, &raw).await
        };
        if is_bye {
            debug!("in-dialog BYE received, ending call");
            aborted.store(true, Ordering::SeqCst);
            let _ = external_tx.send(ExternalEvent::End(CallError::RemoteHangup)).await;
            return;
        }
    }
}
