//! Minimal RIFF/WAVE framing for μ-law telephony audio.
//!
//! `hound` (used elsewhere in this crate's ancestry for local audio I/O)
//! doesn't model G.711's `audioFormat = 7` well at the field level, so the
//! 44-byte header is written directly — same approach as hand-rolling a
//! small binary header that the rest of this crate already uses for RTP.

const RIFF_HEADER_LEN: usize = 44;

/// Wrap raw μ-law bytes in a minimal WAV container: mono, 8 kHz, 8 bits per
/// sample, `audioFormat = 7` (ITU-T G.711 μ-law).
pub fn wrap_mulaw_wav(mulaw_payload: &[u8]) -> Vec<u8> {
    let data_len = mulaw_payload.len() as u32;
    let riff_len = data_len + RIFF_HEADER_LEN as u32 - 8;

    let mut out = Vec::with_capacity(RIFF_HEADER_LEN + mulaw_payload.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_len.to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    out.extend_from_slice(&7u16.to_le_bytes()); // audioFormat = μ-law
    out.extend_from_slice(&1u16.to_le_bytes()); // channels = mono
    out.extend_from_slice(&8000u32.to_le_bytes()); // sampleRate
    out.extend_from_slice(&8000u32.to_le_bytes()); // byteRate = sampleRate * blockAlign
    out.extend_from_slice(&1u16.to_le_bytes()); // blockAlign = channels * bitsPerSample/8
    out.extend_from_slice(&8u16.to_le_bytes()); // bitsPerSample

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(mulaw_payload);
    out
}

/// Parsed subset of a WAV header, used by tests to check round-trip
/// framing without depending on the `hound` runtime dependency.
#[derive(Debug, PartialEq, Eq)]
pub struct WavHeaderInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub audio_format: u16,
    pub data_size: u32,
}

/// Parse a WAV byte buffer produced by [`wrap_mulaw_wav`] (or compatible).
pub fn parse_wav_header(bytes: &[u8]) -> Option<WavHeaderInfo> {
    if bytes.len() < RIFF_HEADER_LEN || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }
    if &bytes[12..16] != b"fmt " {
        return None;
    }
    let audio_format = u16::from_le_bytes([bytes[20], bytes[21]]);
    let channels = u16::from_le_bytes([bytes[22], bytes[23]]);
    let sample_rate = u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
    let bits_per_sample = u16::from_le_bytes([bytes[34], bytes[35]]);
    if &bytes[36..40] != b"data" {
        return None;
    }
    let data_size = u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]);
    Some(WavHeaderInfo {
        sample_rate,
        channels,
        bits_per_sample,
        audio_format,
        data_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_and_parses_header_fields() {
        let payload = vec![0x7Fu8; 320];
        let wav = wrap_mulaw_wav(&payload);
        let header = parse_wav_header(&wav).expect("valid header");
        assert_eq!(header.sample_rate, 8000);
        assert_eq!(header.channels, 1);
        assert_eq!(header.bits_per_sample, 8);
        assert_eq!(header.audio_format, 7);
        assert_eq!(header.data_size, payload.len() as u32);
    }

    #[test]
    fn total_length_matches_header_plus_payload() {
        let payload = vec![0xFFu8; 1600];
        let wav = wrap_mulaw_wav(&payload);
        assert_eq!(wav.len(), RIFF_HEADER_LEN + payload.len());
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert!(parse_wav_header(&[0u8; 10]).is_none());
    }
}
