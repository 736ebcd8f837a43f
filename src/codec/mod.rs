//! Telephony codec utilities: G.711 μ-law/A-law and WAV framing.

pub mod mulaw;
pub mod wav;

pub use mulaw::{
    linear_to_mulaw, mix_mulaw, mulaw_buf_to_alaw, mulaw_to_alaw, mulaw_to_linear, ALAW_SILENCE,
    MULAW_SILENCE,
};
pub use wav::{parse_wav_header, wrap_mulaw_wav, WavHeaderInfo};
