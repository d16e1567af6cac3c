//! The interconnect node
//!
//! Ties everything together: the signaling channel (listener or
//! auto-reconnecting client), the mixer listener, the shared media socket
//! with its RFC 7983 demux, the loop fan-out and the two session maps. The
//! maps are kept consistent as a pair: a session is present in both or in
//! neither.
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


use crate::control::{
    self, ChannelKind, ClientTls, ConnectionHandle, ControlEvent, ControlIo,
};
use crate::demux::PacketKind;
use crate::dtls::DtlsContext;
use crate::error::{EngineError, EngineResult};
use crate::loops::MediaLoop;
use crate::messages::{self, DEFAULT_CODEC, EVENT_ACQUIRE, EVENT_CONNECT_LOOPS, EVENT_CONNECT_MEDIA, EVENT_JOIN, EVENT_REGISTER};
use crate::mixer::MixerRegistry;
use crate::session::{LoopSync, MediaSession, SessionConfig, SessionEvent};
use crate::stun;
use loopgrid_config::InterconnectConfig;
use loopgrid_types::{
    Endpoint, Envelope, ErrorCode, MonitorEvent, MonitorRecord, MonitorSink, NullSink,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Receive buffer for the media and loop sockets
const UDP_RECV_BUF_SIZE: usize = 65535;

#[derive(Default)]
struct SessionMaps {
    by_signaling: HashMap<SocketAddr, Arc<MediaSession>>,
    by_media: HashMap<SocketAddr, Arc<MediaSession>>,
}

/// One site-local interconnect node
pub struct Interconnect {
    config: InterconnectConfig,
    dtls: Arc<DtlsContext>,
    media_socket: Arc<UdpSocket>,
    loops: HashMap<String, Arc<MediaLoop>>,
    sessions: Mutex<SessionMaps>,
    registered: Mutex<HashSet<SocketAddr>>,
    mixers: Mutex<MixerRegistry>,
    signaling_conns: Mutex<HashMap<SocketAddr, ConnectionHandle>>,
    mixer_conns: Mutex<HashMap<SocketAddr, ConnectionHandle>>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    monitor: Arc<dyn MonitorSink>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Interconnect {
    /// Build the node state: DTLS context, media socket and loops. No
    /// control channel is running yet; [`Interconnect::start`] wires those.
    pub async fn new(
        config: InterconnectConfig,
        monitor: Option<Arc<dyn MonitorSink>>,
    ) -> EngineResult<(Arc<Interconnect>, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;

        let dtls = Arc::new(DtlsContext::new(&config.tls.dtls)?);

        let media_socket = Arc::new(
            UdpSocket::bind((config.socket.media.host.as_str(), config.socket.media.port))
                .await
                .map_err(|e| {
                    EngineError::Network(format!(
                        "cannot open media socket {}: {e}",
                        config.socket.media
                    ))
                })?,
        );
        info!(media = %config.socket.media, "opened media socket");

        let mut loops = HashMap::new();
        for (name, multicast) in &config.loops {
            let media_loop =
                MediaLoop::bind(name, multicast.clone(), &config.socket.internal.host).await?;
            info!(
                loop_name = name.as_str(),
                multicast = %multicast,
                ssrc = media_loop.ssrc(),
                "loaded loop"
            );
            loops.insert(name.clone(), media_loop);
        }

        let (session_events, session_rx) = mpsc::unbounded_channel();

        let node = Arc::new(Interconnect {
            config,
            dtls,
            media_socket,
            loops,
            sessions: Mutex::new(SessionMaps::default()),
            registered: Mutex::new(HashSet::new()),
            mixers: Mutex::new(MixerRegistry::new()),
            signaling_conns: Mutex::new(HashMap::new()),
            mixer_conns: Mutex::new(HashMap::new()),
            session_events,
            monitor: monitor.unwrap_or_else(|| Arc::new(NullSink)),
            tasks: Mutex::new(Vec::new()),
        });

        Ok((node, session_rx))
    }

    /// Bring the node fully up: cookie rotation, media demux, loop readers
    /// and both control channels.
    pub async fn start(
        config: InterconnectConfig,
        monitor: Option<Arc<dyn MonitorSink>>,
    ) -> EngineResult<Arc<Interconnect>> {
        let (node, session_rx) = Interconnect::new(config, monitor).await?;
        let mut tasks = Vec::new();

        tasks.push(node.dtls.spawn_cookie_renewal());

        node.spawn_media_tasks();

        // control channels
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let identity = control::identity_from_pem(
            &node.config.tls.dtls.certificate,
            &node.config.tls.dtls.key,
        )?;

        if node.config.socket.client {
            let tls = ClientTls {
                domain: node.config.tls.client.domain.clone(),
                ca_file: node.config.tls.client.ca.file.clone(),
            };
            let endpoint = node.config.socket.signaling.clone();
            let events = control_tx.clone();
            let reconnect = node.config.limits.reconnect_interval();
            tasks.push(tokio::spawn(async move {
                control::run_client(endpoint, tls, ChannelKind::Signaling, events, reconnect)
                    .await;
            }));
        } else {
            let acceptor = control::acceptor_from_identity(identity.clone())?;
            let endpoint = node.config.socket.signaling.clone();
            let events = control_tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) =
                    control::run_listener(endpoint.clone(), acceptor, ChannelKind::Signaling, events)
                        .await
                {
                    error!(%endpoint, error = %e, "signaling listener failed");
                }
            }));
        }

        let mixer_acceptor = control::acceptor_from_identity(identity)?;
        let mixer_endpoint = node.config.socket.mixer.clone();
        let mixer_events = control_tx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = control::run_listener(
                mixer_endpoint.clone(),
                mixer_acceptor,
                ChannelKind::Mixer,
                mixer_events,
            )
            .await
            {
                error!(endpoint = %mixer_endpoint, error = %e, "mixer listener failed");
            }
        }));

        // event pump
        tasks.push(tokio::spawn(
            Arc::clone(&node).run_dispatch(control_rx, session_rx),
        ));

        node.tasks.lock().unwrap().extend(tasks);
        info!(name = node.config.name.as_str(), "interconnect node up");
        Ok(node)
    }

    /// Start the media demux and the per-loop readers. Separate from
    /// [`Interconnect::start`] so a node can run its media path without the
    /// control listeners.
    pub fn spawn_media_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(Arc::clone(self).run_media_io()));
        for media_loop in self.loops.values() {
            tasks.push(tokio::spawn(
                Arc::clone(self).run_loop_io(Arc::clone(media_loop)),
            ));
        }
    }

    /// Stop every task and close every session
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.close_all_sessions();
    }

    fn close_all_sessions(&self) {
        let mut maps = self.sessions.lock().unwrap();
        for session in maps.by_signaling.values() {
            session.close();
        }
        maps.by_signaling.clear();
        maps.by_media.clear();
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn fingerprint(&self) -> &str {
        self.dtls.fingerprint()
    }

    pub fn media_local_addr(&self) -> EngineResult<SocketAddr> {
        Ok(self.media_socket.local_addr()?)
    }

    /// Loop lookup by name
    pub fn media_loop(&self, name: &str) -> Option<&Arc<MediaLoop>> {
        self.loops.get(name)
    }

    /// `[{name, ssrc}, …]` for every local loop
    pub fn loop_definitions(&self) -> Value {
        let definitions: Vec<Value> = self
            .loops
            .values()
            .map(|media_loop| {
                json!({
                    "name": media_loop.name(),
                    "ssrc": media_loop.ssrc(),
                })
            })
            .collect();
        Value::Array(definitions)
    }

    /// Session lookup by remote signaling tuple
    pub fn session_by_signaling(&self, remote: &SocketAddr) -> Option<Arc<MediaSession>> {
        self.sessions.lock().unwrap().by_signaling.get(remote).cloned()
    }

    /// Session lookup by remote media tuple
    pub fn session_by_media(&self, remote: &SocketAddr) -> Option<Arc<MediaSession>> {
        self.sessions.lock().unwrap().by_media.get(remote).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().by_signaling.len()
    }

    fn emit(&self, event: MonitorEvent) {
        self.monitor.emit(MonitorRecord::new(&self.config.name, event));
    }

    /// Install a session in both maps
    fn install_session(&self, session: Arc<MediaSession>) {
        let mut maps = self.sessions.lock().unwrap();
        maps.by_signaling
            .insert(session.remote_signaling(), Arc::clone(&session));
        maps.by_media
            .insert(session.remote_media(), Arc::clone(&session));
        drop(maps);

        self.emit(MonitorEvent::SessionCreated {
            peer: session.remote_name().to_string(),
            signaling: session.remote_signaling().to_string(),
            media: session.remote_media().to_string(),
        });
    }

    /// Remove a session from both maps and close it
    fn drop_session_by_signaling(&self, remote: &SocketAddr) {
        let session = {
            let mut maps = self.sessions.lock().unwrap();
            let session = maps.by_signaling.remove(remote);
            if let Some(ref session) = session {
                maps.by_media.remove(&session.remote_media());
            }
            session
        };

        if let Some(session) = session {
            session.close();
            self.emit(MonitorEvent::SessionClosed {
                peer: session.remote_name().to_string(),
            });
        }
    }

    fn send_signaling(&self, remote: &SocketAddr, envelope: Envelope) -> bool {
        match self.signaling_conns.lock().unwrap().get(remote) {
            Some(handle) => handle.send(envelope),
            None => {
                debug!(%remote, "no signaling connection for send");
                false
            }
        }
    }

    fn send_mixer(&self, remote: &SocketAddr, envelope: Envelope) -> bool {
        match self.mixer_conns.lock().unwrap().get(remote) {
            Some(handle) => handle.send(envelope),
            None => {
                debug!(%remote, "no mixer connection for send");
                false
            }
        }
    }

    /*
     *  ------------------------------------------------------------------
     *  event pump
     *  ------------------------------------------------------------------
     */

    async fn run_dispatch(
        self: Arc<Self>,
        mut control_rx: mpsc::UnboundedReceiver<ControlEvent>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                event = control_rx.recv() => match event {
                    Some(event) => self.dispatch_control(event).await,
                    None => break,
                },
                event = session_rx.recv() => match event {
                    Some(event) => self.handle_session_event(event).await,
                    None => break,
                },
            }
        }
    }

    async fn dispatch_control(self: &Arc<Self>, event: ControlEvent) {
        match (event.kind, event.io) {
            (ChannelKind::Signaling, ControlIo::Connected(handle)) => {
                self.handle_signaling_connected(handle);
            }
            (ChannelKind::Signaling, ControlIo::Message(envelope)) => {
                self.handle_signaling_message(event.remote, envelope).await;
            }
            (ChannelKind::Signaling, ControlIo::Closed) => {
                self.handle_signaling_closed(event.remote);
            }
            (ChannelKind::Mixer, ControlIo::Connected(handle)) => {
                self.handle_mixer_connected(handle);
            }
            (ChannelKind::Mixer, ControlIo::Message(envelope)) => {
                self.handle_mixer_message(event.remote, envelope);
            }
            (ChannelKind::Mixer, ControlIo::Closed) => {
                self.handle_mixer_closed(event.remote);
            }
        }
    }

    /*
     *  ------------------------------------------------------------------
     *  signaling events
     *  ------------------------------------------------------------------
     */

    /// A signaling connection came up. The active side registers itself
    /// right away and marks its own connection as registered so the
    /// responses are accepted on it.
    pub fn handle_signaling_connected(&self, handle: ConnectionHandle) {
        let remote = handle.remote();
        self.signaling_conns
            .lock()
            .unwrap()
            .insert(remote, handle);

        if self.config.socket.client {
            debug!(%remote, "signaling connected, sending register");
            let msg = messages::register(&self.config.name, &self.config.password);
            self.send_signaling(&remote, msg);
            self.registered.lock().unwrap().insert(remote);
        }
    }

    /// A signaling connection went away: the peer's session leaves both
    /// maps and no media flows in either direction afterwards.
    pub fn handle_signaling_closed(&self, remote: SocketAddr) {
        self.signaling_conns.lock().unwrap().remove(&remote);
        self.registered.lock().unwrap().remove(&remote);
        self.drop_session_by_signaling(&remote);
    }

    /// Dispatch one signaling envelope, request or answer
    pub async fn handle_signaling_message(
        self: &Arc<Self>,
        remote: SocketAddr,
        envelope: Envelope,
    ) {
        match envelope.event.as_str() {
            EVENT_REGISTER => {
                if envelope.is_answer() {
                    self.on_register_response(remote, envelope);
                } else {
                    let reply = self.on_register_request(remote, &envelope);
                    self.send_signaling(&remote, reply);
                }
            }
            EVENT_CONNECT_MEDIA => {
                if envelope.is_answer() {
                    self.on_connect_media_response(remote, envelope);
                } else if let Some(reply) = self.on_connect_media_request(remote, &envelope) {
                    self.send_signaling(&remote, reply);
                }
            }
            EVENT_CONNECT_LOOPS => {
                if envelope.is_answer() {
                    self.on_connect_loops_response(remote, envelope);
                } else {
                    let reply = self.on_connect_loops_request(remote, &envelope);
                    self.send_signaling(&remote, reply);
                }
            }
            other => debug!(%remote, event = other, "unhandled signaling event"),
        }
    }

    /// `register {name, password}`: exact password match marks the
    /// connection registered; the answer carries the local name.
    pub fn on_register_request(&self, remote: SocketAddr, envelope: &Envelope) -> Envelope {
        let name = envelope.parameter_str("name");
        let password = envelope.parameter_str("password");

        let (Some(name), Some(password)) = (name, password) else {
            return envelope.error_response(ErrorCode::ParameterMissing);
        };

        if password != self.config.password {
            warn!(%remote, peer = name, "register with wrong password");
            return envelope.error_response(ErrorCode::AuthenticationFailed);
        }

        debug!(%remote, peer = name, "registered signaling peer");
        self.registered.lock().unwrap().insert(remote);

        let mut reply = envelope.success_response();
        if let Some(response) = reply.response_object_mut() {
            response.insert("name".to_string(), json!(self.config.name));
        }
        reply
    }

    /// Register answer on the active side: on success, offer our media
    /// socket unless a session already exists for this connection.
    pub fn on_register_response(&self, remote: SocketAddr, envelope: Envelope) {
        if envelope.error_code() != 0 {
            error!(
                code = envelope.error_code(),
                description = envelope.error_description(),
                "register failed"
            );
            return;
        }

        let peer = envelope.response_str("name").unwrap_or("");
        debug!(%remote, peer, "register accepted");

        if self.session_by_signaling(&remote).is_none() {
            let msg = messages::connect_media(
                &self.config.name,
                DEFAULT_CODEC,
                &self.config.socket.media.host,
                self.config.socket.media.port,
            );
            if self.send_signaling(&remote, msg) {
                debug!(%remote, "sent connect_media");
            }
        }
    }

    /// `connect_media {name, codec, host, port}` on the passive side:
    /// validate, create the session eagerly and answer with our media
    /// endpoint and DTLS fingerprint.
    pub fn on_connect_media_request(
        &self,
        remote: SocketAddr,
        envelope: &Envelope,
    ) -> Option<Envelope> {
        if !self.registered.lock().unwrap().contains(&remote) {
            error!(%remote, "connect_media from unregistered peer, ignoring");
            return None;
        }

        let name = envelope.parameter_str("name");
        let codec = envelope.parameter_str("codec");
        let host = envelope.parameter_str("host");
        let port = envelope.parameter_u64("port").unwrap_or(0);

        let (Some(name), Some(codec), Some(host)) = (name, codec, host) else {
            return Some(envelope.error_response(ErrorCode::ParameterMissing));
        };
        if port == 0 || port > u16::MAX as u64 {
            return Some(envelope.error_response(ErrorCode::ParameterMissing));
        }

        if codec != DEFAULT_CODEC {
            warn!(%remote, codec, "unsupported codec offered");
            return Some(envelope.error_response(ErrorCode::UnknownCodec));
        }

        // one media session per signaling connection
        if self.session_by_signaling(&remote).is_some() {
            return Some(envelope.error_response(ErrorCode::ProcessingError));
        }

        let media_remote = match Endpoint::udp(host, port as u16).to_socket_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(%remote, error = %e, "unresolvable media endpoint");
                return Some(envelope.error_response(ErrorCode::ProcessingError));
            }
        };

        let session = MediaSession::new(
            SessionConfig {
                remote_name: name.to_string(),
                remote_signaling: remote,
                remote_media: media_remote,
                reconnect_interval: self.config.limits.reconnect_interval(),
                keepalive: self.config.limits.keepalive(),
            },
            Arc::clone(&self.dtls),
            Arc::clone(&self.media_socket),
            self.session_events.clone(),
        );
        self.install_session(session);

        debug!(peer = name, media = %media_remote, "media invite accepted");

        let mut reply = envelope.success_response();
        if let Some(response) = reply.response_object_mut() {
            response.insert("name".to_string(), json!(self.config.name));
            response.insert("host".to_string(), json!(self.config.socket.media.host));
            response.insert("port".to_string(), json!(self.config.socket.media.port));
            response.insert("fingerprint".to_string(), json!(self.dtls.fingerprint()));
        }
        Some(reply)
    }

    /// connect_media answer on the active side: build the session and start
    /// the DTLS handshake towards the peer's media endpoint.
    pub fn on_connect_media_response(&self, remote: SocketAddr, envelope: Envelope) {
        if envelope.error_code() != 0 {
            error!(
                code = envelope.error_code(),
                description = envelope.error_description(),
                "connect_media failed"
            );
            return;
        }

        let name = envelope.response_str("name");
        let host = envelope.response_str("host");
        let fingerprint = envelope.response_str("fingerprint");
        let port = envelope.response_u64("port").unwrap_or(0);

        let (Some(name), Some(host), Some(fingerprint)) = (name, host, fingerprint) else {
            error!("connect_media response parameter missing");
            return;
        };
        if port == 0 || port > u16::MAX as u64 {
            error!("connect_media response parameter missing");
            return;
        }

        if self.session_by_signaling(&remote).is_some() {
            debug!(%remote, "session already exists, ignoring duplicate response");
            return;
        }

        let media_remote = match Endpoint::udp(host, port as u16).to_socket_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(%remote, error = %e, "unresolvable media endpoint");
                return;
            }
        };

        debug!(peer = name, media = %media_remote, "got remote media parameter");

        let session = MediaSession::new(
            SessionConfig {
                remote_name: name.to_string(),
                remote_signaling: remote,
                remote_media: media_remote,
                reconnect_interval: self.config.limits.reconnect_interval(),
                keepalive: self.config.limits.keepalive(),
            },
            Arc::clone(&self.dtls),
            Arc::clone(&self.media_socket),
            self.session_events.clone(),
        );
        self.install_session(Arc::clone(&session));

        if let Err(e) = session.handshake_active(fingerprint) {
            error!(peer = name, error = %e, "could not start handshake");
            self.drop_session_by_signaling(&remote);
        }
    }

    /// `connect_loops {loops}` request: bind every loop that exists on both
    /// sides, answer with our own definitions. Loop names only one side
    /// knows are silently ignored.
    pub fn on_connect_loops_request(&self, remote: SocketAddr, envelope: &Envelope) -> Envelope {
        let loops = envelope
            .parameter
            .as_ref()
            .and_then(|p| p.get("loops"))
            .and_then(Value::as_array);

        let Some(loops) = loops else {
            return envelope.error_response(ErrorCode::ParameterMissing);
        };

        let Some(session) = self.session_by_signaling(&remote) else {
            return envelope.error_response(ErrorCode::SessionUnknown);
        };

        let mut definitions = Vec::new();
        for item in loops {
            let name = item.get("name").and_then(Value::as_str);
            let ssrc = item.get("ssrc").and_then(Value::as_u64);

            let (Some(name), Some(ssrc)) = (name, ssrc) else {
                return envelope.error_response(ErrorCode::ProcessingError);
            };
            if ssrc == 0 || ssrc > u32::MAX as u64 {
                return envelope.error_response(ErrorCode::ProcessingError);
            }

            let Some(media_loop) = self.loops.get(name) else {
                // not configured here, skip without complaint
                continue;
            };

            if session.add_loop(media_loop, ssrc as u32) {
                debug!(loop_name = name, remote_ssrc = ssrc, "bound loop to session");
                self.emit(MonitorEvent::LoopBound {
                    peer: session.remote_name().to_string(),
                    loop_name: name.to_string(),
                    remote_ssrc: ssrc as u32,
                });
                definitions.push(json!({
                    "name": name,
                    "ssrc": media_loop.ssrc(),
                }));
            }
        }

        session.mark_loops_added();

        let mut reply = envelope.success_response();
        if let Some(response) = reply.response_object_mut() {
            response.insert("loops".to_string(), Value::Array(definitions));
        }
        reply
    }

    /// connect_loops answer on the active side: bind the peer's SSRCs for
    /// every loop both sides share, then mark the exchange done.
    pub fn on_connect_loops_response(&self, remote: SocketAddr, envelope: Envelope) {
        if envelope.error_code() != 0 {
            error!(
                code = envelope.error_code(),
                description = envelope.error_description(),
                "connect_loops failed"
            );
            return;
        }

        let loops = envelope
            .response
            .as_ref()
            .and_then(|r| r.get("loops"))
            .and_then(Value::as_array);
        let Some(loops) = loops else {
            error!("connect_loops response without loops");
            return;
        };

        let Some(session) = self.session_by_signaling(&remote) else {
            debug!(%remote, "connect_loops response without session");
            return;
        };

        for item in loops {
            let name = item.get("name").and_then(Value::as_str);
            let ssrc = item.get("ssrc").and_then(Value::as_u64);
            let (Some(name), Some(ssrc)) = (name, ssrc) else {
                continue;
            };
            if ssrc == 0 || ssrc > u32::MAX as u64 {
                continue;
            }

            if let Some(media_loop) = self.loops.get(name) {
                if session.add_loop(media_loop, ssrc as u32) {
                    debug!(loop_name = name, remote_ssrc = ssrc, "bound loop to session");
                    self.emit(MonitorEvent::LoopBound {
                        peer: session.remote_name().to_string(),
                        loop_name: name.to_string(),
                        remote_ssrc: ssrc as u32,
                    });
                }
            }
        }

        session.mark_loops_added();
    }

    /*
     *  ------------------------------------------------------------------
     *  session events
     *  ------------------------------------------------------------------
     */

    /// SRTP came up or a session died on its own
    pub async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::SrtpReady { signaling } => {
                let Some(session) = self.session_by_signaling(&signaling) else {
                    return;
                };
                self.emit(MonitorEvent::SrtpReady {
                    peer: session.remote_name().to_string(),
                });

                // only the active side starts the loop dance, and only once
                if !self.config.socket.client {
                    return;
                }
                if session.loop_sync() != LoopSync::Pending {
                    return;
                }

                debug!("connecting all loops from client to server");
                let mut msg = messages::connect_loops();
                msg = msg.with_parameter(json!({ "loops": self.loop_definitions() }));
                if self.send_signaling(&signaling, msg) {
                    session.mark_loops_requested();
                }
            }
            SessionEvent::Closed { signaling } => {
                self.drop_session_by_signaling(&signaling);
            }
        }
    }

    /*
     *  ------------------------------------------------------------------
     *  mixer events
     *  ------------------------------------------------------------------
     */

    /// A mixer connection came up
    pub fn handle_mixer_connected(&self, handle: ConnectionHandle) {
        self.mixer_conns
            .lock()
            .unwrap()
            .insert(handle.remote(), handle);
    }

    /// Dispatch one mixer envelope
    pub fn handle_mixer_message(&self, remote: SocketAddr, envelope: Envelope) {
        match envelope.event.as_str() {
            EVENT_REGISTER if !envelope.is_answer() => self.on_mixer_register(remote),
            EVENT_ACQUIRE if envelope.is_answer() => self.on_mixer_acquire_response(remote, envelope),
            EVENT_JOIN if envelope.is_answer() => self.on_mixer_join_response(remote, envelope),
            other => debug!(%remote, event = other, "unhandled mixer event"),
        }
    }

    /// Mixer registered: push its configuration and retry assignment for
    /// every loop that still runs without a mixer.
    pub fn on_mixer_register(&self, remote: SocketAddr) {
        self.mixers.lock().unwrap().register_mixer(remote);
        debug!(%remote, "registered mixer");
        self.emit(MonitorEvent::MixerRegistered {
            remote: remote.to_string(),
        });

        self.send_mixer(&remote, messages::mixer_configure(&self.config.mixer));
        self.assign_mixers_to_loops();
    }

    /// Reserve a slot for every unserved loop on any mixer with capacity
    pub fn assign_mixers_to_loops(&self) {
        for media_loop in self.loops.values() {
            if media_loop.has_mixer() {
                continue;
            }

            let Some(data) = self.mixers.lock().unwrap().acquire_user(media_loop.name())
            else {
                continue;
            };

            media_loop.set_mixer(data.clone());
            debug!(loop_name = media_loop.name(), mixer = %data.remote, "assigned mixer to loop");

            let msg = messages::mixer_acquire(&data.user, &media_loop.forward_descriptor());
            if !self.send_mixer(&data.remote, msg) {
                // connection raced away, undo the reservation
                media_loop.clear_mixer();
                self.mixers
                    .lock()
                    .unwrap()
                    .release_user(&data.remote, &data.user);
            }
        }
    }

    /// Acquire answer: on success send `join` for the loop, on failure free
    /// the slot so the loop can retry when the next mixer registers
    pub fn on_mixer_acquire_response(&self, remote: SocketAddr, envelope: Envelope) {
        let user = envelope
            .request
            .as_ref()
            .and_then(|r| r.get("user"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let media_loop = self.loops.values().find(|media_loop| {
            match (media_loop.mixer(), user.as_deref()) {
                (Some(data), Some(user)) => data.remote == remote && data.user == user,
                (Some(data), None) => data.remote == remote,
                (None, _) => false,
            }
        });

        let Some(media_loop) = media_loop else {
            debug!(%remote, "acquire response without matching loop");
            return;
        };

        if envelope.error_code() != 0 {
            error!(
                loop_name = media_loop.name(),
                code = envelope.error_code(),
                "mixer acquire failed"
            );
            if let Some(data) = media_loop.clear_mixer() {
                self.mixers
                    .lock()
                    .unwrap()
                    .release_user(&data.remote, &data.user);
            }
            return;
        }

        let msg = messages::mixer_join(&media_loop.loop_data());
        self.send_mixer(&remote, msg);
    }

    /// Join answer closes the acquisition dance
    pub fn on_mixer_join_response(&self, remote: SocketAddr, envelope: Envelope) {
        let media_loop = self
            .loops
            .values()
            .find(|media_loop| matches!(media_loop.mixer(), Some(data) if data.remote == remote));

        match (media_loop, envelope.error_code()) {
            (Some(media_loop), 0) => {
                info!(loop_name = media_loop.name(), "mixer joined loop");
            }
            (Some(media_loop), code) => {
                error!(loop_name = media_loop.name(), code, "mixer join failed");
            }
            (None, _) => debug!(%remote, "join response without matching loop"),
        }
    }

    /// Mixer connection gone: unregister it and free every loop slot it
    /// held. Loops retry when the next mixer registers.
    pub fn handle_mixer_closed(&self, remote: SocketAddr) {
        self.mixer_conns.lock().unwrap().remove(&remote);
        self.mixers.lock().unwrap().unregister_mixer(&remote);

        for media_loop in self.loops.values() {
            if matches!(media_loop.mixer(), Some(data) if data.remote == remote) {
                media_loop.clear_mixer();
                debug!(loop_name = media_loop.name(), "loop lost its mixer");
            }
        }

        self.emit(MonitorEvent::MixerLost {
            remote: remote.to_string(),
        });
    }

    /*
     *  ------------------------------------------------------------------
     *  media io
     *  ------------------------------------------------------------------
     */

    /// Demux loop on the shared media socket. A socket error here is fatal
    /// to all sessions.
    async fn run_media_io(self: Arc<Self>) {
        let mut buf = vec![0u8; UDP_RECV_BUF_SIZE];

        loop {
            let (len, remote) = match self.media_socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // fatal to every session; the signaling flow may
                    // rebuild them once the socket is back
                    error!(error = %e, "media socket failed, stopping media io");
                    self.close_all_sessions();
                    break;
                }
            };
            let packet = &buf[..len];

            match PacketKind::identify(packet) {
                PacketKind::Stun => self.handle_stun(packet, remote).await,
                PacketKind::Dtls => match self.session_by_media(&remote) {
                    Some(session) => session.ssl_io(packet).await,
                    None => debug!(%remote, "DTLS without session, dropping"),
                },
                PacketKind::Rtp => match self.session_by_media(&remote) {
                    Some(session) => session.media_io(packet).await,
                    None => debug!(%remote, "RTP without session, dropping"),
                },
                PacketKind::Unknown => {
                    debug!(%remote, first = ?packet.first(), "unclassified datagram, dropping")
                }
            }
        }
    }

    /// Binding requests get a success response; binding responses are our
    /// own keepalives coming back.
    async fn handle_stun(&self, packet: &[u8], remote: SocketAddr) {
        if stun::is_success_response(packet) {
            debug!(%remote, "STUN keepalive answered");
            return;
        }
        if !stun::is_binding_request(packet) {
            return;
        }

        match stun::binding_success_response(packet, remote) {
            Ok(response) => {
                if let Err(e) = self.media_socket.send_to(&response, remote).await {
                    warn!(%remote, error = %e, "cannot answer STUN request");
                } else {
                    debug!(%remote, "sent STUN response");
                }
            }
            Err(e) => debug!(%remote, error = %e, "malformed STUN request"),
        }
    }

    /// Reader for one loop's receive socket; every packet fans out to all
    /// sessions, each of which forwards it only if the peer subscribes to
    /// the loop.
    async fn run_loop_io(self: Arc<Self>, media_loop: Arc<MediaLoop>) {
        let socket = media_loop.socket();
        let mut buf = vec![0u8; UDP_RECV_BUF_SIZE];

        loop {
            let len = match socket.recv_from(&mut buf).await {
                Ok((len, _mixer)) => len,
                Err(e) => {
                    warn!(loop_name = media_loop.name(), error = %e, "loop socket failed");
                    break;
                }
            };
            self.fan_out(&media_loop, &buf[..len]).await;
        }
    }

    /// Hand one loop packet to every session
    pub async fn fan_out(&self, media_loop: &Arc<MediaLoop>, buffer: &[u8]) {
        let sessions: Vec<Arc<MediaSession>> = self
            .sessions
            .lock()
            .unwrap()
            .by_media
            .values()
            .cloned()
            .collect();

        for session in sessions {
            session.forward_loop_io(media_loop.name(), buffer).await;
        }
    }
}

impl Drop for Interconnect {
    fn drop(&mut self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
