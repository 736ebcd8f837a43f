//! Streaming TTS client (§4.4). Grounded in the teacher's `TtsConfig`
//! `with_*` builder idiom and the `interrupted` flag checked between
//! chunks in `server/realtime_voice.rs`, generalized to an `AtomicBool`
//! abort flag read inside the streaming body loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Per-call voice configuration (§3). `output_format` must be 8 kHz μ-law
/// for telephony; the client does not resample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub provider: String,
    pub voice_id: String,
    pub tts_model_id: String,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity")]
    pub similarity_boost: f32,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default)]
    pub use_speaker_boost: bool,
    #[serde(default)]
    pub style: f32,
    /// Forces `language_code` forwarding even when `language` looks like
    /// English, for mixed Hindi/English ("Hinglish") agents (§4.4).
    #[serde(default)]
    pub hinglish_mode: bool,
}

fn default_stability() -> f32 {
    0.5
}
fn default_similarity() -> f32 {
    0.75
}
fn default_speed() -> f32 {
    1.0
}
fn default_output_format() -> String {
    "ulaw_8000".to_string()
}

impl VoiceConfig {
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed.clamp(0.5, 2.0);
        self
    }

    /// Some providers version their models with trailing `v3`-family
    /// identifiers that reject the stability/similarity/style block
    /// entirely (§4.4).
    fn omits_voice_settings(&self) -> bool {
        const V3_MODEL_IDS: &[&str] = &["eleven_v3", "eleven_turbo_v3"];
        V3_MODEL_IDS.contains(&self.tts_model_id.as_str())
    }

    /// Whether `language_code` should be sent to the provider: the
    /// configured language isn't (American) English, or Hinglish mode is
    /// on regardless of the configured language (§4.4).
    fn language_forward_needed(&self) -> bool {
        self.hinglish_mode
            || self
                .language
                .as_deref()
                .map(|lang| lang != "en" && lang != "en-US")
                .unwrap_or(false)
    }
}

#[derive(Debug, Serialize)]
struct SynthesisRequest {
    text: String,
    model_id: String,
    output_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_settings: Option<VoiceSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    speed: f32,
    use_speaker_boost: bool,
    style: f32,
}

/// Streams synthesized audio one chunk at a time and exposes a cancel
/// handle read between chunks.
pub struct TtsClient {
    http: Arc<Client>,
    base_url: String,
    api_key: String,
}

impl TtsClient {
    pub fn new(http: Arc<Client>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Stream synthesized μ-law audio for `text`, invoking `on_chunk` per
    /// byte chunk received. Checks `abort` between chunks and returns
    /// early (without error) if it becomes true — this is the cooperative
    /// cancellation path for barge-in (§4.9).
    pub async fn text_to_speech_stream(
        &self,
        text: &str,
        voice: &VoiceConfig,
        abort: Arc<AtomicBool>,
        mut on_chunk: impl FnMut(&[u8]) + Send,
    ) -> Result<(), CallError> {
        let language_forward_needed = voice.language_forward_needed();

        let request = SynthesisRequest {
            text: text.to_string(),
            model_id: voice.tts_model_id.clone(),
            output_format: voice.output_format.clone(),
            voice_settings: if voice.omits_voice_settings() {
                None
            } else {
                Some(VoiceSettings {
                    stability: voice.stability,
                    similarity_boost: voice.similarity_boost,
                    speed: voice.speed,
                    use_speaker_boost: voice.use_speaker_boost,
                    style: voice.style,
                })
            },
            language_code: if language_forward_needed { voice.language.clone() } else { None },
        };

        let response = self
            .http
            .post(format!("{}/v1/text-to-speech/{}/stream", self.base_url, voice.voice_id))
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| CallError::TtsError(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::TtsError(format!("TTS API error ({status}): {body}")));
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if abort.load(Ordering::SeqCst) {
                return Ok(());
            }
            let chunk = chunk.map_err(|e| CallError::TtsError(format!("stream read failed: {e}")))?;
            on_chunk(&chunk);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(model_id: &str) -> VoiceConfig {
        VoiceConfig {
            provider: "elevenlabs".to_string(),
            voice_id: "voice-1".to_string(),
            tts_model_id: model_id.to_string(),
            stability: 0.5,
            similarity_boost: 0.75,
            speed: 1.0,
            language: None,
            output_format: default_output_format(),
            use_speaker_boost: false,
            style: 0.0,
            hinglish_mode: false,
        }
    }

    #[test]
    fn v3_models_omit_voice_settings() {
        assert!(voice("eleven_v3").omits_voice_settings());
    }

    #[test]
    fn non_v3_models_keep_voice_settings() {
        assert!(!voice("eleven_multilingual_v2").omits_voice_settings());
    }

    #[test]
    fn with_speed_clamps_to_valid_range() {
        let v = voice("eleven_multilingual_v2").with_speed(5.0);
        assert_eq!(v.speed, 2.0);
    }

    #[test]
    fn english_without_hinglish_mode_does_not_forward_language() {
        let mut v = voice("eleven_multilingual_v2");
        v.language = Some("en".to_string());
        assert!(!v.language_forward_needed());
    }

    #[test]
    fn non_english_language_forwards_regardless_of_hinglish_mode() {
        let mut v = voice("eleven_multilingual_v2");
        v.language = Some("hi".to_string());
        assert!(v.language_forward_needed());
    }

    #[test]
    fn hinglish_mode_forwards_even_for_english_language() {
        let mut v = voice("eleven_multilingual_v2");
        v.language = Some("en".to_string());
        v.hinglish_mode = true;
        assert!(v.language_forward_needed());
    }
}
