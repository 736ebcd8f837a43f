//! SIP dialog state (§3): the per-outgoing-call bookkeeping that the
//! transport mutates as REGISTER/INVITE/BYE messages flow.

use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;

/// Generate a cryptographically random hex token for Call-ID/branch/tag
/// values, as required by §4.6.
pub fn random_token(len: usize) -> String {
    const CHARS: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
}

/// Per-dialog state for one outgoing call (§3).
#[derive(Debug)]
pub struct SipDialogState {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
    cseq: u32,
    pub remote_rtp: Option<SocketAddr>,
    pub local_rtp_port: u16,
    pub remote_codec: u8,
    answered: bool,
    auth_sent: bool,
    bye_received: bool,
    pub endpoint_lockout_until: Option<Instant>,
    pub sdp_reroute_occurred: bool,
}

impl SipDialogState {
    pub fn new(local_rtp_port: u16) -> Self {
        Self {
            call_id: random_token(32),
            from_tag: random_token(16),
            to_tag: None,
            cseq: 1,
            remote_rtp: None,
            local_rtp_port,
            remote_codec: crate::rtp::PAYLOAD_TYPE_PCMU,
            answered: false,
            auth_sent: false,
            bye_received: false,
            endpoint_lockout_until: None,
            sdp_reroute_occurred: false,
        }
    }

    /// Current CSeq, then advance it for the next request of any method
    /// family (the engine only ever has one outstanding request at a time).
    pub fn next_cseq(&mut self) -> u32 {
        let current = self.cseq;
        self.cseq += 1;
        current
    }

    pub fn current_cseq(&self) -> u32 {
        self.cseq
    }

    pub fn auth_sent(&self) -> bool {
        self.auth_sent
    }

    /// Mark that a digest-challenged retry has been sent for this dialog.
    /// One-shot per §4.6: only the first 401/407 on INVITE triggers a retry.
    pub fn mark_auth_sent(&mut self) {
        self.auth_sent = true;
    }

    pub fn answered(&self) -> bool {
        self.answered
    }

    /// Record the first 200 OK (one-shot) and the remote tag/RTP endpoint.
    pub fn mark_answered(&mut self, to_tag: String, remote_rtp: SocketAddr, remote_codec: u8) {
        self.to_tag = Some(to_tag);
        self.remote_rtp = Some(remote_rtp);
        self.remote_codec = remote_codec;
        self.answered = true;
    }

    pub fn bye_received(&self) -> bool {
        self.bye_received
    }

    pub fn mark_bye_received(&mut self) {
        self.bye_received = true;
    }

    /// Record that a mid-call SDP re-route was observed on this dialog
    /// (§4.6 item 3), mirroring the bookkeeping `RtpSession` keeps for the
    /// actual symmetric-RTP lockout.
    pub fn mark_sdp_reroute(&mut self, lockout_until: Instant) {
        self.sdp_reroute_occurred = true;
        self.endpoint_lockout_until = Some(lockout_until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cseq_advances_monotonically() {
        let mut dialog = SipDialogState::new(12000);
        assert_eq!(dialog.next_cseq(), 1);
        assert_eq!(dialog.next_cseq(), 2);
        assert_eq!(dialog.current_cseq(), 3);
    }

    #[test]
    fn answered_and_auth_sent_are_one_shot_flags() {
        let mut dialog = SipDialogState::new(12000);
        assert!(!dialog.answered());
        dialog.mark_answered("tag1".into(), "127.0.0.1:5004".parse().unwrap(), 0);
        assert!(dialog.answered());

        assert!(!dialog.auth_sent());
        dialog.mark_auth_sent();
        assert!(dialog.auth_sent());
    }

    #[test]
    fn random_token_has_requested_length() {
        assert_eq!(random_token(24).len(), 24);
    }

    #[test]
    fn sdp_reroute_is_recorded_on_the_dialog() {
        let mut dialog = SipDialogState::new(12000);
        assert!(!dialog.sdp_reroute_occurred);
        assert!(dialog.endpoint_lockout_until.is_none());

        let until = Instant::now() + std::time::Duration::from_secs(5);
        dialog.mark_sdp_reroute(until);
        assert!(dialog.sdp_reroute_occurred);
        assert_eq!(dialog.endpoint_lockout_until, Some(until));
    }
}
