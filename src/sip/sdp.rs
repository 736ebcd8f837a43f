//! SDP offer/answer handling for the outbound call (§4.6, §6.1).

use crate::rtp::{PAYLOAD_TYPE_PCMA, PAYLOAD_TYPE_PCMU};

/// Build the SDP body offered in the INVITE: codecs 0 (PCMU) and 8 (PCMA)
/// at 8 kHz, 20 ms ptime, sendrecv, on the given local RTP port.
pub fn build_offer(public_ip: &str, rtp_port: u16) -> String {
    format!(
        "v=0\r\n\
         o=- 0 0 IN IP4 {public_ip}\r\n\
         s=voice-call-engine\r\n\
         c=IN IP4 {public_ip}\r\n\
         t=0 0\r\n\
         m=audio {rtp_port} RTP/AVP 0 8\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n"
    )
}

/// The subset of the remote SDP answer the engine needs: RTP endpoint and
/// negotiated codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAnswer {
    pub remote_ip: String,
    pub remote_port: u16,
    pub payload_type: u8,
}

/// Parse a remote SDP answer. Payload type defaults to PCMU (0) if the
/// `m=audio` line lists a codec this engine doesn't negotiate for.
pub fn parse_answer(sdp: &str) -> Option<SdpAnswer> {
    let mut remote_ip = None;
    let mut remote_port = None;
    let mut payload_type = PAYLOAD_TYPE_PCMU;

    for line in sdp.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("c=") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 3 {
                remote_ip = Some(parts[2].to_string());
            }
        } else if let Some(rest) = line.strip_prefix("m=audio") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if let Some(port_str) = parts.first() {
                remote_port = port_str.parse().ok();
            }
            if let Some(pt_str) = parts.iter().find(|p| {
                p.parse::<u8>()
                    .map(|pt| pt == PAYLOAD_TYPE_PCMU || pt == PAYLOAD_TYPE_PCMA)
                    .unwrap_or(false)
            }) {
                payload_type = pt_str.parse().unwrap_or(PAYLOAD_TYPE_PCMU);
            }
        }
    }

    Some(SdpAnswer {
        remote_ip: remote_ip?,
        remote_port: remote_port?,
        payload_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_includes_both_codecs_and_ptime() {
        let offer = build_offer("203.0.113.9", 12000);
        assert!(offer.contains("m=audio 12000 RTP/AVP 0 8"));
        assert!(offer.contains("a=ptime:20"));
        assert!(offer.contains("a=sendrecv"));
        assert!(offer.contains("c=IN IP4 203.0.113.9"));
    }

    #[test]
    fn parses_pcmu_answer() {
        let sdp = "v=0\r\nc=IN IP4 192.168.1.100\r\nm=audio 12345 RTP/AVP 0\r\n";
        let answer = parse_answer(sdp).unwrap();
        assert_eq!(answer.remote_ip, "192.168.1.100");
        assert_eq!(answer.remote_port, 12345);
        assert_eq!(answer.payload_type, PAYLOAD_TYPE_PCMU);
    }

    #[test]
    fn parses_pcma_answer() {
        let sdp = "v=0\r\nc=IN IP4 10.0.0.5\r\nm=audio 30000 RTP/AVP 8\r\n";
        let answer = parse_answer(sdp).unwrap();
        assert_eq!(answer.payload_type, PAYLOAD_TYPE_PCMA);
    }
}
