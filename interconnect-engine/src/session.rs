//! Per-peer media session
//!
//! One session per remote interconnect: the DTLS association, the SRTP
//! contexts derived from it, the keepalive probe and the loop bindings that
//! drive SSRC rewriting in both directions.
//!
//! ```text
//!     CREATED ──connect_media ok──▶ HANDSHAKING ──DTLS done──▶ SRTP_READY
//!        │                              │                          │
//!        │                              └─handshake-retry-timer────┘
//!        │                                                         │
//!        └──────────── any error / signaling close ────────────▶ CLOSED
//! ```
//!
//! Media arriving before SRTP_READY is silently discarded; a single failed
//! protect or unprotect drops that packet and leaves the session up.
// Copyright 2026 Loopgrid Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::dtls::{fingerprint_of_cert, verify_fingerprint, DtlsContext, DtlsRole};
use crate::error::{EngineError, EngineResult};
use crate::filter::DatagramChannel;
use crate::loops::MediaLoop;
use crate::srtp::{KeyingMaterial, KeyingRole, SrtpPair, SrtpProfile, KEYING_LABEL, KEY_MATERIAL_LEN};
use crate::stun;
use openssl::ssl::{ErrorCode, SslStream};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// SSRC field position in the RTP fixed header
pub const RTP_SSRC_OFFSET: usize = 8;
/// Smallest RTP packet the session will touch
pub const RTP_HEADER_MIN_LEN: usize = 12;
/// Retry ticks before an active handshake is abandoned
pub const HANDSHAKE_MAX_ATTEMPTS: u32 = 100;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Both map entries installed, no DTLS state yet
    Created,
    /// DTLS in flight
    Handshaking,
    /// SRTP contexts installed, media flows
    SrtpReady,
    /// Torn down, waiting to be dropped from the maps
    Closed,
}

/// Progress of the connect_loops exchange for this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSync {
    /// Nothing sent or received yet
    Pending,
    /// Request is out, answer outstanding (active side only)
    Requested,
    /// Exchange finished, bindings are final
    Added,
}

/// Notifications a session pushes to its node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake finished, SRTP contexts installed
    SrtpReady { signaling: SocketAddr },
    /// Session died on its own (handshake abandoned or DTLS failure)
    Closed { signaling: SocketAddr },
}

/// Identity and timing of one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Remote interface name from the signaling exchange
    pub remote_name: String,
    /// Remote signaling tuple, the session's key in the signaling map
    pub remote_signaling: SocketAddr,
    /// Remote media tuple, the session's key in the media map
    pub remote_media: SocketAddr,
    /// Handshake retry tick on the active side
    pub reconnect_interval: Duration,
    /// STUN keepalive trigger
    pub keepalive: Duration,
}

struct LoopBinding {
    media_loop: Arc<MediaLoop>,
    remote_ssrc: u32,
    local_ssrc: u32,
}

enum DriveOutcome {
    Pending,
    Completed,
    Failed(String),
    Idle,
}

struct SessionInner {
    state: SessionState,
    role: DtlsRole,
    stream: Option<SslStream<DatagramChannel>>,
    expected_fingerprint: Option<String>,
    srtp: Option<SrtpPair>,
    loops: HashMap<String, LoopBinding>,
    by_remote_ssrc: HashMap<u32, String>,
    loop_sync: LoopSync,
    handshake_attempts: u32,
}

/// Per-peer media session
pub struct MediaSession {
    config: SessionConfig,
    dtls: Arc<DtlsContext>,
    media_socket: Arc<UdpSocket>,
    channel: DatagramChannel,
    events: mpsc::UnboundedSender<SessionEvent>,
    inner: Mutex<SessionInner>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MediaSession {
    /// Create a session in CREATED state. The passive side stays here until
    /// the peer's ClientHello arrives on the media socket.
    pub fn new(
        config: SessionConfig,
        dtls: Arc<DtlsContext>,
        media_socket: Arc<UdpSocket>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<MediaSession> {
        Arc::new(MediaSession {
            config,
            dtls,
            media_socket,
            channel: DatagramChannel::new(),
            events,
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                role: DtlsRole::Passive,
                stream: None,
                expected_fingerprint: None,
                srtp: None,
                loops: HashMap::new(),
                by_remote_ssrc: HashMap::new(),
                loop_sync: LoopSync::Pending,
                handshake_attempts: 0,
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn remote_name(&self) -> &str {
        &self.config.remote_name
    }

    pub fn remote_signaling(&self) -> SocketAddr {
        self.config.remote_signaling
    }

    pub fn remote_media(&self) -> SocketAddr {
        self.config.remote_media
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn loop_sync(&self) -> LoopSync {
        self.inner.lock().unwrap().loop_sync
    }

    pub fn mark_loops_requested(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.loop_sync == LoopSync::Pending {
            inner.loop_sync = LoopSync::Requested;
        }
    }

    pub fn mark_loops_added(&self) {
        self.inner.lock().unwrap().loop_sync = LoopSync::Added;
    }

    pub fn loops_added(&self) -> bool {
        self.loop_sync() == LoopSync::Added
    }

    /// Record a loop binding: packets from this loop leave with
    /// `remote_ssrc`, packets arriving with `remote_ssrc` are delivered to
    /// the loop under its own SSRC.
    pub fn add_loop(&self, media_loop: &Arc<MediaLoop>, remote_ssrc: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Closed {
            return false;
        }

        let name = media_loop.name().to_string();
        // Inbound demux must find the loop under the SSRC the peer recorded
        // for it as well as under our own advertised SSRC, which is what a
        // peer applying the same outbound rewrite actually stamps.
        inner.by_remote_ssrc.insert(remote_ssrc, name.clone());
        inner.by_remote_ssrc.insert(media_loop.ssrc(), name.clone());
        inner.loops.insert(
            name,
            LoopBinding {
                media_loop: Arc::clone(media_loop),
                remote_ssrc,
                local_ssrc: media_loop.ssrc(),
            },
        );
        true
    }

    /// Names of the loops currently bound
    pub fn bound_loops(&self) -> Vec<String> {
        self.inner.lock().unwrap().loops.keys().cloned().collect()
    }

    /// Start the client-side handshake. The expected peer fingerprint comes
    /// from the connect_media response and is checked once the handshake
    /// finishes. A repeating timer at the reconnect interval drives retries
    /// until the stack completes or the retry allowance runs out.
    pub fn handshake_active(self: &Arc<Self>, fingerprint: &str) -> EngineResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.stream.is_some() {
                return Err(EngineError::Dtls("handshake already started".to_string()));
            }

            let ssl = self.dtls.new_ssl(DtlsRole::Active)?;
            let stream = SslStream::new(ssl, self.channel.clone())
                .map_err(|e| EngineError::Dtls(e.to_string()))?;

            inner.role = DtlsRole::Active;
            inner.expected_fingerprint = Some(fingerprint.to_string());
            inner.stream = Some(stream);
            inner.state = SessionState::Handshaking;
        }

        let session = Arc::clone(self);
        let tick = self.config.reconnect_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                ticker.tick().await;
                match session.state() {
                    SessionState::Handshaking => {}
                    _ => break,
                }
                session.pump().await;

                let attempts = {
                    let mut inner = session.inner.lock().unwrap();
                    inner.handshake_attempts += 1;
                    inner.handshake_attempts
                };
                if attempts > HANDSHAKE_MAX_ATTEMPTS
                    && session.state() == SessionState::Handshaking
                {
                    warn!(
                        peer = %session.config.remote_name,
                        "abandoning DTLS handshake after {attempts} attempts"
                    );
                    session.close_with_event();
                    break;
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);

        Ok(())
    }

    /// Feed one DTLS datagram from the media socket into the stack and
    /// drive it. The passive side builds its SSL state on the first call.
    pub async fn ssl_io(self: &Arc<Self>, buffer: &[u8]) {
        self.channel.push_datagram(buffer);
        self.pump().await;
    }

    /// Drive the SSL stack once and flush whatever it produced
    async fn pump(self: &Arc<Self>) {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            self.drive_locked(&mut inner)
        };
        self.flush_channel().await;

        match outcome {
            DriveOutcome::Completed => {
                info!(
                    peer = %self.config.remote_name,
                    media = %self.config.remote_media,
                    "DTLS handshake complete, SRTP ready"
                );
                self.start_keepalive();
                let _ = self.events.send(SessionEvent::SrtpReady {
                    signaling: self.config.remote_signaling,
                });
            }
            DriveOutcome::Failed(reason) => {
                warn!(
                    peer = %self.config.remote_name,
                    reason,
                    "DTLS failure, closing session"
                );
                self.close_with_event();
            }
            DriveOutcome::Pending | DriveOutcome::Idle => {}
        }
    }

    fn drive_locked(&self, inner: &mut SessionInner) -> DriveOutcome {
        match inner.state {
            SessionState::Created => {
                // first ClientHello on the passive side
                let ssl = match self.dtls.new_ssl(DtlsRole::Passive) {
                    Ok(ssl) => ssl,
                    Err(e) => return DriveOutcome::Failed(e.to_string()),
                };
                let stream = match SslStream::new(ssl, self.channel.clone()) {
                    Ok(stream) => stream,
                    Err(e) => return DriveOutcome::Failed(e.to_string()),
                };
                inner.role = DtlsRole::Passive;
                inner.stream = Some(stream);
                inner.state = SessionState::Handshaking;
                self.drive_handshake(inner)
            }
            SessionState::Handshaking => self.drive_handshake(inner),
            SessionState::SrtpReady => {
                // post-handshake records: drain and ignore application data
                if let Some(stream) = inner.stream.as_mut() {
                    let mut scratch = [0u8; 2048];
                    loop {
                        match std::io::Read::read(stream, &mut scratch) {
                            Ok(0) => {
                                debug!(peer = %self.config.remote_name, "DTLS closed by peer");
                                break;
                            }
                            Ok(_) => continue,
                            Err(_) => break,
                        }
                    }
                }
                DriveOutcome::Idle
            }
            SessionState::Closed => DriveOutcome::Idle,
        }
    }

    fn drive_handshake(&self, inner: &mut SessionInner) -> DriveOutcome {
        let stream = match inner.stream.as_mut() {
            Some(stream) => stream,
            None => return DriveOutcome::Idle,
        };

        match stream.do_handshake() {
            Ok(()) => match self.install_srtp(inner) {
                Ok(()) => DriveOutcome::Completed,
                Err(e) => DriveOutcome::Failed(e.to_string()),
            },
            Err(e)
                if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE =>
            {
                DriveOutcome::Pending
            }
            Err(e) => DriveOutcome::Failed(e.to_string()),
        }
    }

    /// Verify the peer, export keying material and install both SRTP
    /// directions. Only ever called right after `do_handshake` succeeded.
    fn install_srtp(&self, inner: &mut SessionInner) -> EngineResult<()> {
        let stream = inner
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::Dtls("no stream".to_string()))?;
        let ssl = stream.ssl();

        if let Some(ref expected) = inner.expected_fingerprint {
            let cert = ssl
                .peer_certificate()
                .ok_or_else(|| EngineError::Dtls("peer sent no certificate".to_string()))?;
            if !verify_fingerprint(&cert, expected)? {
                return Err(EngineError::FingerprintMismatch {
                    expected: expected.clone(),
                    actual: fingerprint_of_cert(&cert)?,
                });
            }
        }

        let profile_name = ssl
            .selected_srtp_profile()
            .map(|p| p.name().to_string())
            .ok_or_else(|| EngineError::Dtls("no SRTP profile negotiated".to_string()))?;
        let profile = SrtpProfile::from_negotiated_name(&profile_name).ok_or_else(|| {
            EngineError::Srtp(format!("unsupported profile {profile_name}"))
        })?;

        let mut material = [0u8; KEY_MATERIAL_LEN];
        ssl.export_keying_material(&mut material, KEYING_LABEL, None)?;

        let role = match inner.role {
            DtlsRole::Active => KeyingRole::Active,
            DtlsRole::Passive => KeyingRole::Passive,
        };
        let keys = KeyingMaterial::split(&material, role)?;
        inner.srtp = Some(SrtpPair::from_material(profile, &keys)?);
        inner.state = SessionState::SrtpReady;

        Ok(())
    }

    /// Send everything the DTLS stack queued to the remote media tuple
    async fn flush_channel(&self) {
        for record in self.channel.drain_outbound() {
            if let Err(e) = self
                .media_socket
                .send_to(&record, self.config.remote_media)
                .await
            {
                warn!(
                    peer = %self.config.remote_name,
                    error = %e,
                    "failed to send DTLS record"
                );
            }
        }
    }

    fn start_keepalive(&self) {
        let socket = Arc::clone(&self.media_socket);
        let remote = self.config.remote_media;
        let peer = self.config.remote_name.clone();
        let trigger = self.config.keepalive;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(trigger);
            // skip the immediate first tick, the handshake just proved the path
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let probe = stun::binding_request();
                match socket.send_to(&probe, remote).await {
                    Ok(_) => debug!(peer = %peer, "sent STUN keepalive"),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "keepalive send failed");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Inbound SRTP from the peer: unprotect, remap the SSRC to the bound
    /// loop's own SSRC and deliver into the loop's multicast group.
    pub async fn media_io(&self, buffer: &[u8]) {
        let delivery = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != SessionState::SrtpReady {
                // no keys yet, discard silently
                return;
            }

            let mut packet = buffer.to_vec();
            let Some(srtp) = inner.srtp.as_mut() else {
                return;
            };
            if let Err(e) = srtp.inbound.unprotect(&mut packet) {
                debug!(peer = %self.config.remote_name, error = %e, "dropping packet");
                return;
            }
            if packet.len() < RTP_HEADER_MIN_LEN {
                return;
            }

            let remote_ssrc = u32::from_be_bytes([
                packet[RTP_SSRC_OFFSET],
                packet[RTP_SSRC_OFFSET + 1],
                packet[RTP_SSRC_OFFSET + 2],
                packet[RTP_SSRC_OFFSET + 3],
            ]);

            let name = match inner.by_remote_ssrc.get(&remote_ssrc) {
                Some(name) => name.clone(),
                None => {
                    debug!(
                        peer = %self.config.remote_name,
                        ssrc = remote_ssrc,
                        "RTP for unbound SSRC"
                    );
                    return;
                }
            };
            let binding = &inner.loops[&name];
            packet[RTP_SSRC_OFFSET..RTP_SSRC_OFFSET + 4]
                .copy_from_slice(&binding.local_ssrc.to_be_bytes());

            (Arc::clone(&binding.media_loop), packet)
        };

        let (media_loop, packet) = delivery;
        if let Err(e) = media_loop.send(&packet).await {
            warn!(
                peer = %self.config.remote_name,
                loop_name = media_loop.name(),
                error = %e,
                "multicast delivery failed"
            );
        }
    }

    /// Outbound RTP from a local loop: rewrite the SSRC to the peer-agreed
    /// remote SSRC, protect and send on the shared media socket.
    pub async fn forward_loop_io(&self, loop_name: &str, buffer: &[u8]) {
        let packet = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != SessionState::SrtpReady {
                return;
            }
            if buffer.len() < RTP_HEADER_MIN_LEN {
                return;
            }
            let Some(binding) = inner.loops.get(loop_name) else {
                // peer does not subscribe to this loop
                return;
            };
            let remote_ssrc = binding.remote_ssrc;

            let mut packet = buffer.to_vec();
            packet[RTP_SSRC_OFFSET..RTP_SSRC_OFFSET + 4]
                .copy_from_slice(&remote_ssrc.to_be_bytes());

            let Some(srtp) = inner.srtp.as_mut() else {
                return;
            };
            if let Err(e) = srtp.outbound.protect(&mut packet) {
                debug!(peer = %self.config.remote_name, error = %e, "dropping packet");
                return;
            }
            packet
        };

        if let Err(e) = self
            .media_socket
            .send_to(&packet, self.config.remote_media)
            .await
        {
            warn!(
                peer = %self.config.remote_name,
                error = %e,
                "media send failed"
            );
        }
    }

    /// Tear the session down: timers disarmed, SSL and SRTP state dropped.
    /// The owning maps release the object itself.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.stream = None;
            inner.srtp = None;
            inner.loops.clear();
            inner.by_remote_ssrc.clear();
        }
        self.channel.close();

        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        debug!(peer = %self.config.remote_name, "session closed");
    }

    fn close_with_event(&self) {
        self.close();
        let _ = self.events.send(SessionEvent::Closed {
            signaling: self.config.remote_signaling,
        });
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtls::generate_self_signed;
    use loopgrid_config::DtlsConfig;
    use loopgrid_types::Endpoint;
    use std::io::Write;

    async fn test_session() -> (Arc<MediaSession>, mpsc::UnboundedReceiver<SessionEvent>) {
        let dir = tempfile::tempdir().unwrap();
        let (cert_pem, key_pem) = generate_self_signed("session-test").unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(&cert_pem)
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(&key_pem)
            .unwrap();

        let config: DtlsConfig = serde_json::from_value(serde_json::json!({
            "certificate": cert_path,
            "key": key_path,
        }))
        .unwrap();
        let dtls = Arc::new(crate::dtls::DtlsContext::new(&config).unwrap());

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        let session = MediaSession::new(
            SessionConfig {
                remote_name: "site2".to_string(),
                remote_signaling: "127.0.0.1:12345".parse().unwrap(),
                remote_media: "127.0.0.1:40000".parse().unwrap(),
                reconnect_interval: Duration::from_millis(100),
                keepalive: Duration::from_secs(300),
            },
            dtls,
            socket,
            tx,
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_session_starts_created() {
        let (session, _rx) = test_session().await;
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(session.loop_sync(), LoopSync::Pending);
        assert!(!session.loops_added());
    }

    #[tokio::test]
    async fn test_loop_binding_registration() {
        let (session, _rx) = test_session().await;
        let media_loop = MediaLoop::bind("alpha", Endpoint::udp("224.0.0.7", 5000), "127.0.0.1")
            .await
            .unwrap();

        assert!(session.add_loop(&media_loop, 0xBEEF));
        assert_eq!(session.bound_loops(), vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_no_media_before_srtp_ready() {
        let (session, _rx) = test_session().await;
        let media_loop = MediaLoop::bind("alpha", Endpoint::udp("224.0.0.7", 5000), "127.0.0.1")
            .await
            .unwrap();
        session.add_loop(&media_loop, 0xBEEF);

        // neither direction may emit anything before the handshake is done
        let rtp = [0x80u8; 64];
        session.forward_loop_io("alpha", &rtp).await;
        session.media_io(&rtp).await;

        assert_eq!(session.state(), SessionState::Created);
        assert!(session.channel.drain_outbound().is_empty());
    }

    #[tokio::test]
    async fn test_active_handshake_emits_client_hello() {
        let (session, _rx) = test_session().await;
        session.handshake_active("sha-256 AA:BB").unwrap();

        assert_eq!(session.state(), SessionState::Handshaking);
        // the retry task fires immediately and must push a ClientHello
        // through the write filter to the media socket
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.state(), SessionState::Handshaking);
    }

    #[tokio::test]
    async fn test_double_handshake_rejected() {
        let (session, _rx) = test_session().await;
        session.handshake_active("sha-256 AA:BB").unwrap();
        assert!(session.handshake_active("sha-256 AA:BB").is_err());
    }

    #[tokio::test]
    async fn test_close_clears_state() {
        let (session, _rx) = test_session().await;
        let media_loop = MediaLoop::bind("alpha", Endpoint::udp("224.0.0.7", 5000), "127.0.0.1")
            .await
            .unwrap();
        session.add_loop(&media_loop, 0xBEEF);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.bound_loops().is_empty());
        // closed sessions refuse new bindings
        assert!(!session.add_loop(&media_loop, 0xBEEF));
    }
}
