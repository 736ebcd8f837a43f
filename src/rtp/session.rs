//! Per-call RTP session (§4.7): paced 20 ms send loop, keep-alive silence,
//! symmetric-RTP endpoint tracking, and the receive path that surfaces
//! inbound audio to the media bridge.
//!
//! Built directly on `tokio::net::UdpSocket`, the same primitive the
//! teacher's gateway daemon uses for its own long-running I/O loops.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::codec::{mulaw_buf_to_alaw, ALAW_SILENCE, MULAW_SILENCE};
use crate::error::CallError;
use crate::rtp::packet::RtpPacket;

const SAMPLES_PER_PACKET: usize = 160;
const PACKET_INTERVAL: Duration = Duration::from_millis(20);
const KEEPALIVE_GAP: Duration = Duration::from_millis(40);
/// Symmetric-RTP lockout armed after an SDP-driven re-route (§4.6 item 3).
pub const REROUTE_LOCKOUT: Duration = Duration::from_secs(5);

pub const PAYLOAD_TYPE_PCMU: u8 = 0;
pub const PAYLOAD_TYPE_PCMA: u8 = 8;

/// Per-call RTP endpoint: one UDP socket, a FIFO of outbound μ-law chunks,
/// and the symmetric-RTP bookkeeping described in §4.6/§4.7.
pub struct RtpSession {
    socket: Arc<UdpSocket>,
    local_port: u16,
    ssrc: u32,
    sequence: AtomicU16,
    timestamp: AtomicU32,
    payload_type: AtomicU8,
    remote_addr: Mutex<SocketAddr>,
    audio_queue: Mutex<VecDeque<[u8; SAMPLES_PER_PACKET]>>,
    last_audio_sent_at: Mutex<Instant>,
    is_sending_audio: AtomicBool,
    /// Set once an SDP-driven re-route has been observed; after that,
    /// symmetric RTP is permanently disabled for the call (§4.6).
    sdp_reroute_occurred: AtomicBool,
    /// While `Some(deadline)` in the future, inbound-source endpoint
    /// updates are ignored in favor of the SDP-advertised endpoint.
    reroute_lockout_until: Mutex<Option<Instant>>,
}

impl RtpSession {
    pub async fn bind(local_port: u16, remote_addr: SocketAddr, payload_type: u8) -> Result<Self, CallError> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .map_err(|e| CallError::TransportFailure(format!("RTP bind on port {local_port}: {e}")))?;

        Ok(Self {
            socket: Arc::new(socket),
            local_port,
            ssrc: rand::random(),
            sequence: AtomicU16::new(rand::random()),
            timestamp: AtomicU32::new(0),
            payload_type: AtomicU8::new(payload_type),
            remote_addr: Mutex::new(remote_addr),
            audio_queue: Mutex::new(VecDeque::new()),
            last_audio_sent_at: Mutex::new(Instant::now() - KEEPALIVE_GAP),
            is_sending_audio: AtomicBool::new(false),
            sdp_reroute_occurred: AtomicBool::new(false),
            reroute_lockout_until: Mutex::new(None),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn set_payload_type(&self, payload_type: u8) {
        self.payload_type.store(payload_type, Ordering::SeqCst);
    }

    /// Split an arbitrary-length μ-law buffer into 160-byte chunks and
    /// enqueue them for the pacer, padding a short final chunk with silence.
    pub async fn enqueue_audio(&self, mulaw: &[u8]) {
        let mut queue = self.audio_queue.lock().await;
        for chunk in mulaw.chunks(SAMPLES_PER_PACKET) {
            let mut buf = [MULAW_SILENCE; SAMPLES_PER_PACKET];
            buf[..chunk.len()].copy_from_slice(chunk);
            queue.push_back(buf);
        }
        self.is_sending_audio.store(true, Ordering::SeqCst);
    }

    pub fn is_sending_audio(&self) -> bool {
        self.is_sending_audio.load(Ordering::SeqCst)
    }

    /// Record a mid-call SDP endpoint change (§4.6: re-routing). Arms a 5 s
    /// symmetric-RTP lockout and permanently disables symmetric RTP once
    /// any re-route has occurred. Returns `true` if the endpoint actually
    /// changed (a repeated 200 OK for the same address is a no-op).
    pub async fn apply_sdp_reroute(&self, new_remote: SocketAddr) -> bool {
        let mut remote = self.remote_addr.lock().await;
        if *remote == new_remote {
            return false;
        }
        *remote = new_remote;
        drop(remote);

        *self.reroute_lockout_until.lock().await = Some(Instant::now() + REROUTE_LOCKOUT);
        self.sdp_reroute_occurred.store(true, Ordering::SeqCst);
        info!(port = self.local_port, %new_remote, "RTP endpoint re-routed via SDP");
        true
    }

    /// Spawn the 20 ms pacer: dequeues one chunk (or sends keep-alive
    /// silence), transcodes to A-law if negotiated, and sends. Exits once
    /// `aborted` is observed.
    pub fn spawn_pacer(self: &Arc<Self>, aborted: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(PACKET_INTERVAL);
            loop {
                ticker.tick().await;
                if aborted.load(Ordering::SeqCst) {
                    debug!(port = session.local_port, "RTP pacer stopping: call aborted");
                    return;
                }

                let chunk = {
                    let mut queue = session.audio_queue.lock().await;
                    let chunk = queue.pop_front();
                    if queue.is_empty() {
                        session.is_sending_audio.store(false, Ordering::SeqCst);
                    }
                    chunk
                };

                let payload = match chunk {
                    Some(real_audio) => {
                        *session.last_audio_sent_at.lock().await = Instant::now();
                        real_audio.to_vec()
                    }
                    None => {
                        let since_last = session.last_audio_sent_at.lock().await.elapsed();
                        if since_last < KEEPALIVE_GAP {
                            continue;
                        }
                        let pt = session.payload_type.load(Ordering::SeqCst);
                        let silence = if pt == PAYLOAD_TYPE_PCMA { ALAW_SILENCE } else { MULAW_SILENCE };
                        vec![silence; SAMPLES_PER_PACKET]
                    }
                };

                if let Err(e) = session.send_one(payload).await {
                    warn!(port = session.local_port, error = %e, "RTP send failed");
                }
            }
        })
    }

    async fn send_one(&self, mulaw_payload: Vec<u8>) -> Result<(), CallError> {
        let pt = self.payload_type.load(Ordering::SeqCst);
        let payload = if pt == PAYLOAD_TYPE_PCMA {
            mulaw_buf_to_alaw(&mulaw_payload)
        } else {
            mulaw_payload
        };

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let ts = self.timestamp.fetch_add(SAMPLES_PER_PACKET as u32, Ordering::SeqCst);
        let packet = RtpPacket::new(pt, seq, ts, self.ssrc, payload);
        let remote = *self.remote_addr.lock().await;

        self.socket
            .send_to(&packet.to_bytes(), remote)
            .await
            .map_err(|e| CallError::TransportFailure(format!("RTP send to {remote}: {e}")))?;
        Ok(())
    }

    /// Spawn the receive loop: strips RTP headers, applies symmetric-RTP
    /// endpoint tracking, and forwards payload bytes on `audio_in_tx`.
    pub fn spawn_receiver(
        self: &Arc<Self>,
        audio_in_tx: mpsc::Sender<Vec<u8>>,
        aborted: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                if aborted.load(Ordering::SeqCst) {
                    return;
                }

                let (size, from) = match session.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(port = session.local_port, error = %e, "RTP recv failed");
                        continue;
                    }
                };
                if aborted.load(Ordering::SeqCst) {
                    return;
                }

                let Some(packet) = RtpPacket::from_bytes(&buf[..size]) else {
                    continue;
                };

                session.maybe_update_endpoint_from_source(from).await;

                if audio_in_tx.send(packet.payload).await.is_err() {
                    return;
                }
            }
        })
    }

    async fn maybe_update_endpoint_from_source(&self, from: SocketAddr) {
        if self.sdp_reroute_occurred.load(Ordering::SeqCst) {
            return;
        }

        let lockout_active = {
            let lockout = self.reroute_lockout_until.lock().await;
            matches!(*lockout, Some(deadline) if Instant::now() < deadline)
        };
        if lockout_active {
            return;
        }

        let mut remote = self.remote_addr.lock().await;
        if *remote != from {
            info!(port = self.local_port, old = %*remote, new = %from, "symmetric RTP endpoint update");
            *remote = from;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_audio_splits_into_160_byte_chunks() {
        let session = RtpSession::bind(0, "127.0.0.1:5004".parse().unwrap(), PAYLOAD_TYPE_PCMU)
            .await
            .unwrap();
        session.enqueue_audio(&vec![0x7Fu8; 320]).await;
        assert_eq!(session.audio_queue.lock().await.len(), 2);
        assert!(session.is_sending_audio());
    }

    #[tokio::test]
    async fn short_final_chunk_is_padded_with_silence() {
        let session = RtpSession::bind(0, "127.0.0.1:5004".parse().unwrap(), PAYLOAD_TYPE_PCMU)
            .await
            .unwrap();
        session.enqueue_audio(&vec![0x01u8; 50]).await;
        let chunk = session.audio_queue.lock().await.pop_front().unwrap();
        assert_eq!(chunk.len(), SAMPLES_PER_PACKET);
        assert_eq!(chunk[50], MULAW_SILENCE);
    }

    #[tokio::test]
    async fn reroute_arms_lockout_and_disables_symmetric_rtp_permanently() {
        let session = RtpSession::bind(0, "127.0.0.1:5004".parse().unwrap(), PAYLOAD_TYPE_PCMU)
            .await
            .unwrap();
        session.apply_sdp_reroute("127.0.0.1:6000".parse().unwrap()).await;
        assert!(session.sdp_reroute_occurred.load(Ordering::SeqCst));

        session
            .maybe_update_endpoint_from_source("127.0.0.1:7000".parse().unwrap())
            .await;
        assert_eq!(*session.remote_addr.lock().await, "127.0.0.1:6000".parse().unwrap());
    }
}
