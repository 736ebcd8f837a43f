//! Error taxonomy for the call engine (§7).
//!
//! Call-engine code returns `CallError` so the orchestrator can match on
//! the kind and apply the recovery policy from the spec's error table.
//! Setup-time and CLI-facing code continues to use `anyhow::Result`,
//! exactly as the rest of this crate does.

use thiserror::Error;

/// An error surfaced by the call engine, tagged with the recovery policy
/// that applies to it (§7).
#[derive(Debug, Error)]
pub enum CallError {
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("SIP registration failed: {0}")]
    RegistrationFailure(String),

    #[error("call setup failed: {0}")]
    CallSetupFailure(String),

    #[error("remote hangup")]
    RemoteHangup,

    #[error("STT stream error: {0}")]
    SttError(String),

    #[error("LLM stream error: {0}")]
    LlmError(String),

    #[error("TTS stream error: {0}")]
    TtsError(String),

    #[error("silence timeout")]
    SilenceTimeout,

    #[error("max call duration exceeded")]
    MaxDuration,

    #[error("invalid agent configuration: {0}")]
    ConfigInvalid(String),
}

impl From<std::io::Error> for CallError {
    fn from(e: std::io::Error) -> Self {
        CallError::TransportFailure(e.to_string())
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        CallError::TransportFailure(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CallError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CallError::TransportFailure(e.to_string())
    }
}

/// The reason a call ended (§8 invariant 3: exactly one `ended` event per
/// call, carrying one of these).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserHangup,
    RemoteHangup,
    SilenceTimeout,
    MaxDuration,
    TransportError,
    Error,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndReason::UserHangup => "user_hangup",
            EndReason::RemoteHangup => "remote_hangup",
            EndReason::SilenceTimeout => "silence_timeout",
            EndReason::MaxDuration => "max_duration",
            EndReason::TransportError => "transport_error",
            EndReason::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl CallError {
    /// Map an error to the end reason it should produce if it is not
    /// recoverable in place (§7: LLM/TTS errors recover instead of ending).
    pub fn terminal_reason(&self) -> EndReason {
        match self {
            CallError::TransportFailure(_) => EndReason::TransportError,
            CallError::RemoteHangup => EndReason::RemoteHangup,
            CallError::SilenceTimeout => EndReason::SilenceTimeout,
            CallError::MaxDuration => EndReason::MaxDuration,
            _ => EndReason::Error,
        }
    }
}
