//! Codec negotiation (scenario S6): a remote 200-OK SDP selecting
//! `RTP/AVP 8` (PCMA) is parsed into payload type 8, and the rest of the
//! engine's RTP path treats that like any other negotiated codec.

use my_agent::rtp::PAYLOAD_TYPE_PCMA;
use my_agent::sip::SdpAnswer;

#[test]
fn alaw_answer_selects_payload_type_8() {
    let sdp = "v=0\r\n\
        o=- 0 0 IN IP4 203.0.113.9\r\n\
        s=-\r\n\
        c=IN IP4 203.0.113.9\r\n\
        t=0 0\r\n\
        m=audio 40000 RTP/AVP 8\r\n\
        a=rtpmap:8 PCMA/8000\r\n";

    let answer: SdpAnswer = my_agent::sip::sdp::parse_answer(sdp).expect("valid SDP answer");
    assert_eq!(answer.remote_ip, "203.0.113.9");
    assert_eq!(answer.remote_port, 40000);
    assert_eq!(answer.payload_type, PAYLOAD_TYPE_PCMA);
}

#[test]
fn unrecognized_codec_falls_back_to_pcmu() {
    let sdp = "v=0\r\nc=IN IP4 10.0.0.5\r\nm=audio 30000 RTP/AVP 18\r\n";
    let answer = my_agent::sip::sdp::parse_answer(sdp).expect("valid SDP answer");
    assert_eq!(answer.payload_type, 0);
}
