//! SIP-path media bridge (§4.8): routes raw audio bytes between the RTP
//! transport, the STT recognizer, and the recording sink. Owns nothing
//! itself — it holds shared references to collaborators the orchestrator
//! and transport already own, matching §3's ownership rule.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::orchestrator::SpeechRecognizer;
use crate::recording::RecordingSink;
use crate::rtp::RtpSession;

/// Spawn the two forwarding tasks that make up a SIP call's media bridge:
/// caller audio (RTP → STT + recording) and agent audio (orchestrator →
/// RTP + recording). Returns the join handles so the caller can await
/// them at call teardown.
pub fn spawn_sip_bridge(
    rtp: Arc<RtpSession>,
    mut caller_audio_rx: mpsc::Receiver<Vec<u8>>,
    recognizer: Arc<dyn SpeechRecognizer>,
    mut agent_audio_rx: mpsc::Receiver<Vec<u8>>,
    recording: Arc<Mutex<RecordingSink>>,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let caller_recording = Arc::clone(&recording);
    let caller_task = tokio::spawn(async move {
        while let Some(bytes) = caller_audio_rx.recv().await {
            caller_recording.lock().await.push_caller_audio(&bytes);
            recognizer.send_audio(bytes).await;
        }
        debug!("SIP media bridge: caller audio channel closed");
    });

    let agent_task = tokio::spawn(async move {
        while let Some(bytes) = agent_audio_rx.recv().await {
            recording.lock().await.push_agent_audio(&bytes);
            rtp.enqueue_audio(&bytes).await;
        }
        debug!("SIP media bridge: agent audio channel closed");
    });

    (caller_task, agent_task)
}
