//! Minimal outbound SIP UA (§4.6): REGISTER with digest retry, INVITE with
//! digest retry and SDP offer/answer, ACK, BYE, and in-dialog request
//! handling (BYE/ACK/re-INVITE). One UDP socket is opened and kept for the
//! lifetime of the transport — the same socket used for REGISTER carries
//! subsequent INVITEs, giving a stable dialog source port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SipConfig;
use crate::error::CallError;
use crate::sip::digest::{build_authorization_header, parse_challenge};
use crate::sip::dialog::{random_token, SipDialogState};
use crate::sip::sdp::{build_offer, parse_answer, SdpAnswer};

/// A parsed SIP response's status line, headers, and body.
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl SipResponse {
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_auth_challenge(&self) -> bool {
        self.status_code == 401 || self.status_code == 407
    }
}

fn header_lookup<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers.get(&name.to_ascii_lowercase()).map(String::as_str)
}

/// Parse a raw SIP response datagram.
pub fn parse_response(raw: &str) -> Option<SipResponse> {
    let mut lines = raw.split("\r\n");
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status_code: u16 = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = HashMap::new();
    let mut body_lines = Vec::new();
    let mut in_body = false;
    for line in lines {
        if in_body {
            body_lines.push(line);
            continue;
        }
        if line.is_empty() {
            in_body = true;
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Some(SipResponse {
        status_code,
        reason,
        headers,
        body: body_lines.join("\r\n"),
    })
}

/// Detect the method of an inbound SIP request datagram.
fn request_method(raw: &str) -> Option<&str> {
    raw.split_whitespace().next()
}

fn header_value(raw: &str, name: &str) -> Option<String> {
    for line in raw.split("\r\n") {
        if let Some((n, v)) = line.split_once(':') {
            if n.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

/// Strip a leading `+` and an optional configured country-code prefix
/// (§4.6, §9: configurable policy, default mirrors the source's "drop
/// leading 91 if remainder is ≥10 digits").
pub fn canonicalize_number(raw: &str, cfg: &crate::config::NumberCanonicalizationConfig) -> String {
    let mut number = raw.to_string();
    if cfg.strip_leading_plus {
        number = number.trim_start_matches('+').to_string();
    }
    if let Some(code) = &cfg.strip_country_code {
        if let Some(rest) = number.strip_prefix(code.as_str()) {
            if rest.len() >= cfg.min_remainder_digits {
                number = rest.to_string();
            }
        }
    }
    number
}

/// Discover the process's public IPv4 address (§4.6). Falls back to the
/// local address of the outbound route to a well-known host if the HTTPS
/// discovery endpoint is unreachable.
pub async fn discover_public_ip(discovery_url: &str) -> String {
    if let Ok(response) = reqwest::get(discovery_url).await {
        if let Ok(text) = response.text().await {
            let ip = text.trim();
            if ip.parse::<std::net::Ipv4Addr>().is_ok() {
                return ip.to_string();
            }
        }
    }

    warn!(url = discovery_url, "public IP discovery failed, falling back to local route address");
    match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").await.is_ok() {
                if let Ok(addr) = socket.local_addr() {
                    return addr.ip().to_string();
                }
            }
            "127.0.0.1".to_string()
        }
        Err(_) => "127.0.0.1".to_string(),
    }
}

enum SipInbound {
    Response(SipResponse),
    Request(String),
}

/// The outbound SIP user agent: one UDP socket, shared across the engine's
/// calls, demultiplexing inbound datagrams by Call-ID.
pub struct SipTransport {
    socket: Arc<UdpSocket>,
    trunk_addr: SocketAddr,
    pub public_ip: String,
    local_sip_port: u16,
    cfg: SipConfig,
    response_channels: Arc<Mutex<HashMap<String, mpsc::Sender<SipResponse>>>>,
    request_channels: Arc<Mutex<HashMap<String, mpsc::Sender<String>>>>,
    cseq_for_register: AtomicU16,
}

impl SipTransport {
    pub async fn new(cfg: SipConfig) -> Result<Self, CallError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| CallError::TransportFailure(format!("SIP socket bind: {e}")))?;
        let local_sip_port = socket
            .local_addr()
            .map_err(|e| CallError::TransportFailure(e.to_string()))?
            .port();

        let trunk_addr = tokio::net::lookup_host((cfg.trunk_host.as_str(), cfg.trunk_port))
            .await
            .map_err(|e| CallError::RegistrationFailure(format!("trunk DNS lookup failed: {e}")))?
            .next()
            .ok_or_else(|| CallError::RegistrationFailure("trunk host resolved to no addresses".into()))?;

        let public_ip = discover_public_ip(&cfg.public_ip_discovery_url).await;

        let transport = Self {
            socket: Arc::new(socket),
            trunk_addr,
            public_ip,
            local_sip_port,
            cfg,
            response_channels: Arc::new(Mutex::new(HashMap::new())),
            request_channels: Arc::new(Mutex::new(HashMap::new())),
            cseq_for_register: AtomicU16::new(1),
        };
        transport.spawn_receive_loop();
        Ok(transport)
    }

    fn spawn_receive_loop(&self) {
        let socket = Arc::clone(&self.socket);
        let response_channels = Arc::clone(&self.response_channels);
        let request_channels = Arc::clone(&self.request_channels);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (size, _from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "SIP socket recv failed");
                        continue;
                    }
                };
                let raw = String::from_utf8_lossy(&buf[..size]).to_string();
                let inbound = if raw.starts_with("SIP/2.0") {
                    parse_response(&raw).map(SipInbound::Response)
                } else {
                    Some(SipInbound::Request(raw.clone()))
                };

                let Some(inbound) = inbound else { continue };
                let call_id = header_value(&raw, "Call-ID").or_else(|| {
                    if let SipInbound::Response(ref r) = inbound {
                        header_lookup(&r.headers, "call-id").map(String::from)
                    } else {
                        None
                    }
                });
                let Some(call_id) = call_id else { continue };

                match inbound {
                    SipInbound::Response(resp) => {
                        let channels = response_channels.lock().await;
                        if let Some(tx) = channels.get(&call_id) {
                            let _ = tx.send(resp).await;
                        }
                    }
                    SipInbound::Request(raw) => {
                        let channels = request_channels.lock().await;
                        if let Some(tx) = channels.get(&call_id) {
                            let _ = tx.send(raw).await;
                        } else {
                            debug!(call_id, "no dialog registered for inbound SIP request");
                        }
                    }
                }
            }
        });
    }

    async fn register_response_channel(&self, call_id: &str) -> mpsc::Receiver<SipResponse> {
        let (tx, rx) = mpsc::channel(8);
        self.response_channels.lock().await.insert(call_id.to_string(), tx);
        rx
    }

    async fn unregister_response_channel(&self, call_id: &str) {
        self.response_channels.lock().await.remove(call_id);
    }

    /// Register an in-dialog request channel for a call; stays open for the
    /// lifetime of the dialog so BYE/ACK/re-INVITE route to the caller.
    pub async fn register_dialog(&self, call_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(8);
        self.request_channels.lock().await.insert(call_id.to_string(), tx);
        rx
    }

    pub async fn unregister_dialog(&self, call_id: &str) {
        self.request_channels.lock().await.remove(call_id);
        self.response_channels.lock().await.remove(call_id);
    }

    async fn send_raw(&self, raw: &str) -> Result<(), CallError> {
        self.socket
            .send_to(raw.as_bytes(), self.trunk_addr)
            .await
            .map_err(|e| CallError::TransportFailure(format!("SIP send: {e}")))?;
        Ok(())
    }

    fn via_header(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/UDP {}:{};branch=z9hG4bK{}",
            self.public_ip, self.local_sip_port, branch
        )
    }

    fn contact_header(&self) -> String {
        format!("<sip:{}@{}:{}>", self.cfg.username, self.public_ip, self.local_sip_port)
    }

    fn build_register(&self, cseq: u32, auth_header: Option<&str>) -> (String, String) {
        let call_id = random_token(32);
        let branch = random_token(16);
        let uri = format!("sip:{}", self.cfg.trunk_host);
        let mut msg = format!(
            "REGISTER {uri} SIP/2.0\r\n\
             Via: {via}\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:{user}@{host}>;tag={tag}\r\n\
             To: <sip:{user}@{host}>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} REGISTER\r\n\
             Contact: {contact}\r\n",
            via = self.via_header(&branch),
            user = self.cfg.username,
            host = self.cfg.trunk_host,
            tag = random_token(8),
            contact = self.contact_header(),
        );
        if let Some(auth) = auth_header {
            msg.push_str(&format!("Authorization: {auth}\r\n"));
        }
        msg.push_str("Expires: 3600\r\nContent-Length: 0\r\n\r\n");
        (msg, call_id)
    }

    /// REGISTER with the trunk, retrying once with digest credentials on a
    /// 401/407 challenge (§4.6).
    pub async fn register(&self) -> Result<(), CallError> {
        let cseq = self.cseq_for_register.fetch_add(1, Ordering::SeqCst) as u32;
        let (msg, call_id) = self.build_register(cseq, None);
        let mut rx = self.register_response_channel(&call_id).await;
        self.send_raw(&msg).await?;

        let timeout_dur = Duration::from_secs(self.cfg.registration_timeout_seconds);
        let first = timeout(timeout_dur, rx.recv())
            .await
            .map_err(|_| CallError::RegistrationFailure("REGISTER timed out".into()))?
            .ok_or_else(|| CallError::RegistrationFailure("SIP socket closed".into()))?;

        if first.is_success() {
            self.unregister_response_channel(&call_id).await;
            return Ok(());
        }
        if !first.is_auth_challenge() {
            self.unregister_response_channel(&call_id).await;
            return Err(CallError::RegistrationFailure(format!(
                "REGISTER failed: {} {}",
                first.status_code, first.reason
            )));
        }

        let www_auth = header_lookup(&first.headers, "www-authenticate")
            .or_else(|| header_lookup(&first.headers, "proxy-authenticate"))
            .ok_or_else(|| CallError::RegistrationFailure("401/407 without challenge header".into()))?;
        let challenge = parse_challenge(www_auth)
            .ok_or_else(|| CallError::RegistrationFailure("unparseable digest challenge".into()))?;

        let uri = format!("sip:{}", self.cfg.trunk_host);
        let password = self.cfg.password.as_deref().unwrap_or("");
        let auth_header = build_authorization_header(
            &self.cfg.username,
            &challenge.realm,
            password,
            &challenge.nonce,
            "REGISTER",
            &uri,
        );

        let cseq2 = self.cseq_for_register.fetch_add(1, Ordering::SeqCst) as u32;
        let (msg2, call_id2) = self.build_register(cseq2, Some(&auth_header));
        self.unregister_response_channel(&call_id).await;
        let mut rx2 = self.register_response_channel(&call_id2).await;
        self.send_raw(&msg2).await?;

        let final_resp = timeout(timeout_dur, rx2.recv())
            .await
            .map_err(|_| CallError::RegistrationFailure("REGISTER retry timed out".into()))?
            .ok_or_else(|| CallError::RegistrationFailure("SIP socket closed".into()))?;
        self.unregister_response_channel(&call_id2).await;

        if final_resp.is_success() {
            Ok(())
        } else {
            Err(CallError::RegistrationFailure(format!(
                "REGISTER failed after digest retry: {} {}",
                final_resp.status_code, final_resp.reason
            )))
        }
    }

    fn build_invite(
        &self,
        dialog: &SipDialogState,
        dest_number: &str,
        sdp: &str,
        branch: &str,
        auth_header: Option<&str>,
    ) -> String {
        let uri = format!("sip:{dest_number}@{}", self.cfg.trunk_host);
        let mut msg = format!(
            "INVITE {uri} SIP/2.0\r\n\
             Via: {via}\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:{user}@{host}>;tag={from_tag}\r\n\
             To: <{uri}>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} INVITE\r\n\
             Contact: {contact}\r\n",
            via = self.via_header(branch),
            user = self.cfg.username,
            host = self.cfg.trunk_host,
            from_tag = dialog.from_tag,
            call_id = dialog.call_id,
            cseq = dialog.current_cseq(),
            contact = self.contact_header(),
        );
        if let Some(auth) = auth_header {
            msg.push_str(&format!("Authorization: {auth}\r\n"));
        }
        msg.push_str("Content-Type: application/sdp\r\n");
        msg.push_str(&format!("Content-Length: {}\r\n\r\n{sdp}", sdp.len()));
        msg
    }

    /// Place an outbound call: build and send the SDP offer, handle
    /// provisional responses, retry once on digest challenge, and on 200 OK
    /// return the parsed remote SDP answer together with the still-open
    /// response channel. A 30 s watchdog aborts the call if it never leaves
    /// `trying`/`initiating` (§4.6 item 5).
    ///
    /// The response channel stays registered past the first 200 OK: later
    /// 200 OKs on the same Call-ID are mid-call SDP re-routes (§4.6 item 3),
    /// not noise, so the caller keeps reading it for the dialog's lifetime.
    pub async fn invite(
        &self,
        dialog: &mut SipDialogState,
        dest_number: &str,
        local_rtp_port: u16,
    ) -> Result<(SdpAnswer, mpsc::Receiver<SipResponse>), CallError> {
        let dest_number = canonicalize_number(dest_number, &crate::config::NumberCanonicalizationConfig::default());
        let sdp = build_offer(&self.public_ip, local_rtp_port);

        let mut rx = self.register_response_channel(&dialog.call_id).await;
        let cseq = dialog.next_cseq();
        let branch = random_token(16);
        let msg = self.build_invite(dialog, &dest_number, &sdp, &branch, None);
        let _ = cseq;
        self.send_raw(&msg).await?;

        let watchdog = Duration::from_secs(self.cfg.invite_timeout_seconds);
        let deadline = tokio::time::Instant::now() + watchdog;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                self.unregister_response_channel(&dialog.call_id).await;
                return Err(CallError::CallSetupFailure("INVITE watchdog timeout".into()));
            }

            let resp = timeout(remaining, rx.recv())
                .await
                .map_err(|_| CallError::CallSetupFailure("INVITE watchdog timeout".into()))?
                .ok_or_else(|| CallError::CallSetupFailure("SIP socket closed".into()))?;

            if resp.is_provisional() {
                debug!(status = resp.status_code, "SIP provisional response");
                continue;
            }

            if resp.is_auth_challenge() && !dialog.auth_sent() {
                dialog.mark_auth_sent();
                let www_auth = header_lookup(&resp.headers, "www-authenticate")
                    .or_else(|| header_lookup(&resp.headers, "proxy-authenticate"))
                    .ok_or_else(|| CallError::CallSetupFailure("401/407 without challenge header".into()))?;
                let challenge = parse_challenge(www_auth)
                    .ok_or_else(|| CallError::CallSetupFailure("unparseable digest challenge".into()))?;
                let uri = format!("sip:{dest_number}@{}", self.cfg.trunk_host);
                let password = self.cfg.password.as_deref().unwrap_or("");
                let auth_header = build_authorization_header(
                    &self.cfg.username,
                    &challenge.realm,
                    password,
                    &challenge.nonce,
                    "INVITE",
                    &uri,
                );
                dialog.next_cseq();
                let retry_msg = self.build_invite(dialog, &dest_number, &sdp, &branch, Some(&auth_header));
                self.send_raw(&retry_msg).await?;
                continue;
            }

            if resp.is_success() {
                let answer = parse_answer(&resp.body)
                    .ok_or_else(|| CallError::CallSetupFailure("200 OK without usable SDP".into()))?;
                let to_tag = header_lookup(&resp.headers, "to")
                    .and_then(|to| to.split("tag=").nth(1))
                    .unwrap_or("")
                    .to_string();
                let remote_addr: SocketAddr = format!("{}:{}", answer.remote_ip, answer.remote_port)
                    .parse()
                    .map_err(|e| CallError::CallSetupFailure(format!("invalid remote RTP address: {e}")))?;
                dialog.mark_answered(to_tag, remote_addr, answer.payload_type);

                self.send_ack(dialog, &dest_number).await?;
                info!(call_id = %dialog.call_id, "INVITE answered");
                return Ok((answer, rx));
            }

            self.unregister_response_channel(&dialog.call_id).await;
            return Err(CallError::CallSetupFailure(format!(
                "INVITE failed: {} {}",
                resp.status_code, resp.reason
            )));
        }
    }

    async fn send_ack(&self, dialog: &SipDialogState, dest_number: &str) -> Result<(), CallError> {
        let uri = format!("sip:{dest_number}@{}", self.cfg.trunk_host);
        let msg = format!(
            "ACK {uri} SIP/2.0\r\n\
             Via: {via}\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:{user}@{host}>;tag={from_tag}\r\n\
             To: <{uri}>;tag={to_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} ACK\r\n\
             Content-Length: 0\r\n\r\n",
            via = self.via_header(&random_token(16)),
            user = self.cfg.username,
            host = self.cfg.trunk_host,
            from_tag = dialog.from_tag,
            to_tag = dialog.to_tag.as_deref().unwrap_or(""),
            call_id = dialog.call_id,
            cseq = dialog.current_cseq() - 1,
        );
        self.send_raw(&msg).await
    }

    /// Send BYE to end an established call.
    pub async fn send_bye(&self, dialog: &mut SipDialogState, dest_number: &str) -> Result<(), CallError> {
        let cseq = dialog.next_cseq();
        let uri = format!("sip:{dest_number}@{}", self.cfg.trunk_host);
        let msg = format!(
            "BYE {uri} SIP/2.0\r\n\
             Via: {via}\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:{user}@{host}>;tag={from_tag}\r\n\
             To: <{uri}>;tag={to_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} BYE\r\n\
             Content-Length: 0\r\n\r\n",
            via = self.via_header(&random_token(16)),
            user = self.cfg.username,
            host = self.cfg.trunk_host,
            from_tag = dialog.from_tag,
            to_tag = dialog.to_tag.as_deref().unwrap_or(""),
            call_id = dialog.call_id,
        );
        self.send_raw(&msg).await?;
        self.unregister_dialog(&dialog.call_id).await;
        Ok(())
    }

    /// Handle one in-dialog request datagram. Returns `true` if it was a
    /// BYE (caller should treat the call as remotely ended); ACK and
    /// re-INVITE are logged and otherwise ignored (§4.6).
    pub async fn handle_in_dialog_request(&self, dialog: &mut SipDialogState, raw: &str) -> bool {
        match request_method(raw) {
            Some("BYE") => {
                if dialog.bye_received() {
                    return true;
                }
                dialog.mark_bye_received();
                let response = format!(
                    "SIP/2.0 200 OK\r\nCall-ID: {}\r\nContent-Length: 0\r\n\r\n",
                    dialog.call_id
                );
                let _ = self.send_raw(&response).await;
                true
            }
            Some("ACK") => {
                debug!(call_id = %dialog.call_id, "ignoring in-dialog ACK");
                false
            }
            Some("INVITE") => {
                debug!(call_id = %dialog.call_id, "ignoring re-INVITE");
                false
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_line_and_headers() {
        let raw = "SIP/2.0 401 Unauthorized\r\nCall-ID: abc\r\nWWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status_code, 401);
        assert!(resp.is_auth_challenge());
        assert_eq!(header_lookup(&resp.headers, "call-id"), Some("abc"));
    }

    #[test]
    fn parses_response_with_sdp_body() {
        let raw = "SIP/2.0 200 OK\r\nCall-ID: xyz\r\n\r\nv=0\r\nc=IN IP4 1.2.3.4\r\nm=audio 6000 RTP/AVP 0\r\n";
        let resp = parse_response(raw).unwrap();
        assert!(resp.is_success());
        assert!(resp.body.contains("c=IN IP4 1.2.3.4"));
    }

    #[test]
    fn canonicalizes_leading_plus_and_country_code() {
        let cfg = crate::config::NumberCanonicalizationConfig::default();
        assert_eq!(canonicalize_number("+919876543210", &cfg), "9876543210");
        assert_eq!(canonicalize_number("18005551234", &cfg), "18005551234");
    }

    #[test]
    fn leaves_short_remainder_untouched() {
        let cfg = crate::config::NumberCanonicalizationConfig::default();
        // "91" + 8 digits: remainder shorter than min_remainder_digits, so
        // the prefix must NOT be stripped.
        assert_eq!(canonicalize_number("9112345678", &cfg), "9112345678");
    }
}
