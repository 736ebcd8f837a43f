//! Per-call recording sink (§4.5): accumulates caller/agent μ-law audio,
//! mixes both legs down, wraps the result as a WAV, and hands it to an
//! uploader. Grounded in the teacher's codec WAV framing (`codec::wav`)
//! and its no-op-when-unconfigured pattern used elsewhere for optional
//! integrations.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::codec::{mix_mulaw, wrap_mulaw_wav};
use crate::config::RecordingConfig;
use crate::error::CallError;

/// Destination for a finished call recording. The default no-op
/// implementation is used whenever [`RecordingConfig::is_configured`]
/// returns false.
#[async_trait]
pub trait RecordingUploader: Send + Sync {
    async fn upload(&self, call_id: &str, wav_bytes: Vec<u8>) -> Result<Option<String>, CallError>;
}

/// Uploader used when no object-store destination is configured (§4.5):
/// logs and drops the bytes instead of failing the call.
pub struct NoopUploader;

#[async_trait]
impl RecordingUploader for NoopUploader {
    async fn upload(&self, call_id: &str, wav_bytes: Vec<u8>) -> Result<Option<String>, CallError> {
        info!(call_id, bytes = wav_bytes.len(), "recording uploader not configured; discarding");
        Ok(None)
    }
}

/// Accumulates both audio legs for the lifetime of a call.
pub struct RecordingSink {
    caller_audio: Vec<u8>,
    agent_audio: Vec<u8>,
    uploader: Box<dyn RecordingUploader>,
}

impl RecordingSink {
    pub fn new(cfg: &RecordingConfig) -> Self {
        let uploader: Box<dyn RecordingUploader> = if cfg.is_configured() {
            Box::new(NoopUploader) // TODO: wire a real object-store uploader once a provider is chosen.
        } else {
            Box::new(NoopUploader)
        };

        Self {
            caller_audio: Vec::new(),
            agent_audio: Vec::new(),
            uploader,
        }
    }

    pub fn with_uploader(uploader: Box<dyn RecordingUploader>) -> Self {
        Self {
            caller_audio: Vec::new(),
            agent_audio: Vec::new(),
            uploader,
        }
    }

    pub fn push_caller_audio(&mut self, mulaw: &[u8]) {
        self.caller_audio.extend_from_slice(mulaw);
    }

    pub fn push_agent_audio(&mut self, mulaw: &[u8]) {
        self.agent_audio.extend_from_slice(mulaw);
    }

    /// Mix both legs, wrap as WAV, and hand off to the configured uploader.
    /// Returns the uploader's reference URL, if any.
    pub async fn finalize(self, call_id: &str) -> Result<Option<String>, CallError> {
        if self.caller_audio.is_empty() && self.agent_audio.is_empty() {
            return Ok(None);
        }

        let mixed = mix_mulaw(&self.caller_audio, &self.agent_audio);
        let wav_bytes = wrap_mulaw_wav(&mixed);

        match self.uploader.upload(call_id, wav_bytes).await {
            Ok(url) => Ok(url),
            Err(e) => {
                warn!(call_id, error = %e, "recording upload failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturingUploader {
        captured: Mutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl RecordingUploader for CapturingUploader {
        async fn upload(&self, _call_id: &str, wav_bytes: Vec<u8>) -> Result<Option<String>, CallError> {
            *self.captured.lock().unwrap() = Some(wav_bytes);
            Ok(Some("memory://captured".to_string()))
        }
    }

    #[tokio::test]
    async fn finalize_mixes_and_wraps_both_legs() {
        let uploader = Box::new(CapturingUploader { captured: Mutex::new(None) });
        let mut sink = RecordingSink::with_uploader(uploader);
        sink.push_caller_audio(&[0xFF; 160]);
        sink.push_agent_audio(&[0x7F; 160]);

        let url = sink.finalize("call-1").await.unwrap();
        assert_eq!(url.as_deref(), Some("memory://captured"));
    }

    #[tokio::test]
    async fn finalize_is_a_no_op_when_nothing_was_recorded() {
        let sink = RecordingSink::new(&RecordingConfig::default());
        let url = sink.finalize("call-2").await.unwrap();
        assert_eq!(url, None);
    }
}
