//! One physical connection to a peer and its handshake state machine
//!
//! ```text
//!   initiator:  Connecting ──connect──▶ AwaitingHandshake ──peer handshake──▶ Ready
//!   acceptor:   AwaitingHandshake ──peer handshake──▶ (pairing request) ──accept()──▶ Ready
//!                                                                      └─reject()──▶ Closed
//!   any state ──error / timeout / close──▶ Closed (terminal)
//! ```

use bytes::Bytes;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::constants::{HANDSHAKE_TIMEOUT_MS, KEEP_ALIVE_INTERVAL_MS, KEEP_ALIVE_TIMEOUT_MS, MAX_FRAME_LEN};
use crate::error::SessionError;
use crate::network::framing::{encode_frame, FrameDecoder};
use crate::network::link::{stream_target, Link, SessionId};
use crate::protocol::{
    AppEnvelope, DeviceIdentity, Handshake, HandshakeFrame, ServiceData, StreamEnvelope, WireMessage,
};

/// Which side opened the transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingHandshake,
    Ready,
    Closed,
}

/// Timer settings for a session
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            keep_alive_interval: Duration::from_millis(KEEP_ALIVE_INTERVAL_MS),
            keep_alive_timeout: Duration::from_millis(KEEP_ALIVE_TIMEOUT_MS),
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

/// Something the owner of a session needs to react to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Acceptor received the peer's handshake; answer with `accept`/`reject`
    PairingRequest(Handshake),
    /// Handshake complete
    Ready,
    /// Application payload (`message` or an unrecognised type)
    Message(Value),
    ServiceUpdate(ServiceData),
    /// Peer said goodbye; a `Closed` event follows
    Disconnect { reason: Option<String> },
    /// Side-channel payload received while ready
    StreamData { data: Value, from: SocketAddr },
    Closed { error: Option<SessionError> },
}

/// A single framed connection
#[derive(Debug)]
pub struct PeerSession {
    id: SessionId,
    role: Role,
    state: SessionState,
    local: DeviceIdentity,
    enable_stream: bool,
    stream_port: Option<u16>,
    remote: Option<DeviceIdentity>,
    remote_stream_port: Option<u16>,
    remote_addr: SocketAddr,
    link: Link,
    decoder: FrameDecoder,
    timings: SessionTimings,
    last_message_at: Instant,
    handshake_deadline: Option<Instant>,
    next_keep_alive: Option<Instant>,
    pending_request: Option<Handshake>,
}

impl PeerSession {
    /// Outgoing session, waiting for its TCP connect to complete.
    ///
    /// No handshake timer runs on this side; a silent peer is only detected
    /// once the session is ready and keep-alive starts.
    pub fn initiator(
        id: SessionId,
        local: DeviceIdentity,
        target: SocketAddr,
        link: Link,
        enable_stream: bool,
        timings: SessionTimings,
        now: Instant,
    ) -> Self {
        Self::new(id, Role::Initiator, SessionState::Connecting, local, target, link, enable_stream, None, timings, now)
    }

    /// Incoming session; the handshake timer starts now.
    #[allow(clippy::too_many_arguments)]
    pub fn acceptor(
        id: SessionId,
        local: DeviceIdentity,
        peer: SocketAddr,
        link: Link,
        enable_stream: bool,
        stream_port: Option<u16>,
        timings: SessionTimings,
        now: Instant,
    ) -> Self {
        let mut session = Self::new(
            id,
            Role::Acceptor,
            SessionState::AwaitingHandshake,
            local,
            peer,
            link,
            enable_stream,
            stream_port,
            timings,
            now,
        );
        session.handshake_deadline = Some(now + timings.handshake_timeout);
        session
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: SessionId,
        role: Role,
        state: SessionState,
        local: DeviceIdentity,
        remote_addr: SocketAddr,
        link: Link,
        enable_stream: bool,
        stream_port: Option<u16>,
        timings: SessionTimings,
        now: Instant,
    ) -> Self {
        Self {
            id,
            role,
            state,
            local,
            enable_stream,
            stream_port,
            remote: None,
            remote_stream_port: None,
            remote_addr,
            link,
            decoder: FrameDecoder::with_max_frame_len(timings.max_frame_len),
            timings,
            last_message_at: now,
            handshake_deadline: None,
            next_keep_alive: None,
            pending_request: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Set once the handshake completes; never changes afterwards
    pub fn remote_identity(&self) -> Option<&DeviceIdentity> {
        self.remote.as_ref()
    }

    /// Transport-level address of the peer
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stream_port(&self) -> Option<u16> {
        self.stream_port
    }

    pub fn remote_stream_port(&self) -> Option<u16> {
        self.remote_stream_port
    }

    pub fn last_message_at(&self) -> Instant {
        self.last_message_at
    }

    /// Handshake received from the peer and waiting on a decision
    pub fn pending_request(&self) -> Option<&Handshake> {
        self.pending_request.as_ref()
    }

    /// The outgoing TCP connect completed; send our handshake.
    pub fn on_connected(&mut self, stream_port: Option<u16>, now: Instant) -> Vec<SessionEvent> {
        if self.state != SessionState::Connecting {
            return Vec::new();
        }
        self.state = SessionState::AwaitingHandshake;
        self.stream_port = stream_port;
        self.last_message_at = now;

        match self.send_handshake() {
            Ok(()) => Vec::new(),
            Err(e) => self.close(Some(e)).into_iter().collect(),
        }
    }

    /// Raw bytes arrived on the stream
    pub fn on_data(&mut self, data: &[u8], now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.is_closed() {
            return events;
        }

        self.decoder.extend(data);
        while !self.is_closed() {
            let frame = match self.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    events.extend(self.close(Some(SessionError::Protocol(e.to_string()))));
                    break;
                }
            };

            self.last_message_at = now;
            let result = if self.is_ready() {
                self.handle_message(&frame, &mut events)
            } else {
                self.handle_handshake_frame(&frame, now, &mut events)
            };

            if let Err(e) = result {
                events.extend(self.close(Some(e)));
            }
        }
        events
    }

    /// A reassembled side-channel datagram arrived
    pub fn on_datagram(&mut self, payload: &[u8], from: SocketAddr) -> Vec<SessionEvent> {
        if !self.is_ready() {
            tracing::trace!(session_id = self.id, %from, "Discarding stream data received before handshake");
            return Vec::new();
        }
        match serde_json::from_slice::<Value>(payload) {
            Ok(data) => vec![SessionEvent::StreamData { data, from }],
            Err(e) => {
                tracing::trace!(session_id = self.id, "Ignoring malformed stream data: {}", e);
                Vec::new()
            }
        }
    }

    /// The transport went away underneath us
    pub fn on_transport_closed(&mut self, error: Option<String>) -> Vec<SessionEvent> {
        self.close(error.map(SessionError::Transport)).into_iter().collect()
    }

    /// Fire any due timers
    pub fn poll(&mut self, now: Instant) -> Vec<SessionEvent> {
        match self.state {
            SessionState::AwaitingHandshake => {
                if self.handshake_deadline.is_some_and(|deadline| now >= deadline) {
                    return self.close(Some(SessionError::HandshakeTimeout)).into_iter().collect();
                }
            }
            SessionState::Ready => {
                if self.next_keep_alive.is_some_and(|at| now >= at) {
                    let idle = now.saturating_duration_since(self.last_message_at);
                    if idle > self.timings.keep_alive_timeout {
                        let error = SessionError::KeepAliveTimeout {
                            idle_ms: idle.as_millis() as u64,
                        };
                        return self.close(Some(error)).into_iter().collect();
                    }
                    self.send_wire(&WireMessage::Ping);
                    self.next_keep_alive = Some(now + self.timings.keep_alive_interval);
                }
            }
            SessionState::Connecting | SessionState::Closed => {}
        }
        Vec::new()
    }

    /// Accept the peer's pairing request and answer with our handshake
    pub fn accept(&mut self, now: Instant) -> Vec<SessionEvent> {
        if self.role != Role::Acceptor || self.state != SessionState::AwaitingHandshake {
            return Vec::new();
        }
        let Some(handshake) = self.pending_request.take() else {
            return Vec::new();
        };

        tracing::info!(session_id = self.id, device_id = %handshake.device_id, "Pairing accepted");
        let result = self
            .complete_handshake(handshake, now)
            .and_then(|_| self.send_handshake());
        match result {
            Ok(()) => vec![SessionEvent::Ready],
            Err(e) => self.close(Some(e)).into_iter().collect(),
        }
    }

    /// Refuse the peer's pairing request, then close
    pub fn reject(&mut self, reason: &str) -> Vec<SessionEvent> {
        if self.is_closed() {
            return Vec::new();
        }
        if let Some(request) = self.pending_request.take() {
            tracing::info!(session_id = self.id, device_id = %request.device_id, "Pairing rejected: {}", reason);
        }
        self.send_pairing_rejection(reason);
        self.close(Some(SessionError::PairingRejected("Pairing rejected by manager.".into())))
            .into_iter()
            .collect()
    }

    /// Terminal; returns the close event only the first time.
    pub fn close(&mut self, error: Option<SessionError>) -> Option<SessionEvent> {
        if self.is_closed() {
            return None;
        }
        match &error {
            Some(e) => tracing::debug!(session_id = self.id, remote = %self.remote_addr, "Session closed: {}", e),
            None => tracing::debug!(session_id = self.id, remote = %self.remote_addr, "Session closed"),
        }
        self.state = SessionState::Closed;
        self.handshake_deadline = None;
        self.next_keep_alive = None;
        self.pending_request = None;
        self.link.close();
        Some(SessionEvent::Closed { error })
    }

    pub fn send_message(&self, envelope: &AppEnvelope) -> bool {
        if !self.is_ready() {
            return false;
        }
        match serde_json::to_value(envelope) {
            Ok(payload) => self.send_wire(&WireMessage::Message(payload)),
            Err(_) => false,
        }
    }

    pub fn send_service_update(&self, data: &ServiceData) -> bool {
        self.is_ready() && self.send_wire(&WireMessage::ServiceUpdate(Some(data.clone())))
    }

    pub fn send_disconnect(&self, reason: &str) -> bool {
        self.is_ready()
            && self.send_wire(&WireMessage::Disconnect {
                reason: Some(reason.to_string()),
            })
    }

    /// Sent regardless of handshake state so a connecting peer learns of it too
    pub fn send_pairing_rejection(&self, reason: &str) -> bool {
        !self.is_closed()
            && self.send_wire(&WireMessage::PairingResponse {
                accepted: false,
                reason: Some(reason.to_string()),
            })
    }

    /// Send a payload over the side channel
    pub fn send_stream(&self, envelope: &StreamEnvelope) -> Result<(), SessionError> {
        let port = match (self.enable_stream, self.is_ready(), self.remote_stream_port) {
            (true, true, Some(port)) => port,
            _ => return Err(SessionError::StreamUnavailable),
        };
        let payload = serde_json::to_vec(envelope).map_err(|e| SessionError::Protocol(e.to_string()))?;
        let target = stream_target(self.remote_addr.ip(), port);
        if self.link.send_datagram(Bytes::from(payload), target) {
            Ok(())
        } else {
            Err(SessionError::Transport("link closed".into()))
        }
    }

    fn handle_handshake_frame(
        &mut self,
        frame: &[u8],
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SessionError> {
        match HandshakeFrame::decode(frame)? {
            HandshakeFrame::PairingResponse { accepted: false, reason } => Err(SessionError::PairingRejected(
                reason.unwrap_or_else(|| "Pairing rejected by peer.".into()),
            )),
            HandshakeFrame::PairingResponse { accepted: true, .. } => Ok(()),
            HandshakeFrame::Identify(handshake) => match self.role {
                Role::Initiator => {
                    self.complete_handshake(handshake, now)?;
                    events.push(SessionEvent::Ready);
                    Ok(())
                }
                Role::Acceptor => {
                    self.handshake_deadline = None;
                    if self.pending_request.is_some() {
                        tracing::debug!(session_id = self.id, "Ignoring repeated handshake while awaiting decision");
                        return Ok(());
                    }
                    self.pending_request = Some(handshake.clone());
                    events.push(SessionEvent::PairingRequest(handshake));
                    Ok(())
                }
            },
        }
    }

    fn complete_handshake(&mut self, handshake: Handshake, now: Instant) -> Result<(), SessionError> {
        if self.enable_stream {
            self.remote_stream_port = Some(handshake.stream_port.ok_or(SessionError::MissingStreamPort)?);
        }
        self.remote = Some(handshake.identity());
        self.state = SessionState::Ready;
        self.handshake_deadline = None;
        self.last_message_at = now;
        self.next_keep_alive = Some(now + self.timings.keep_alive_interval);
        tracing::debug!(
            session_id = self.id,
            role = ?self.role,
            device_id = %handshake.device_id,
            remote = %self.remote_addr,
            "Handshake complete"
        );
        Ok(())
    }

    fn handle_message(&mut self, frame: &[u8], events: &mut Vec<SessionEvent>) -> Result<(), SessionError> {
        match WireMessage::decode(frame)? {
            WireMessage::Ping => {
                self.send_wire(&WireMessage::Pong);
            }
            WireMessage::Pong => {}
            WireMessage::ServiceUpdate(Some(data)) => events.push(SessionEvent::ServiceUpdate(data)),
            WireMessage::ServiceUpdate(None) => {
                tracing::trace!(session_id = self.id, "Ignoring incomplete service update");
            }
            WireMessage::Disconnect { reason } => {
                events.push(SessionEvent::Disconnect { reason });
                events.extend(self.close(None));
            }
            WireMessage::PairingResponse { accepted: false, reason } => {
                return Err(SessionError::PairingRejected(
                    reason.unwrap_or_else(|| "Pairing rejected by peer.".into()),
                ));
            }
            WireMessage::PairingResponse { accepted: true, .. } => {}
            WireMessage::Message(payload) => events.push(SessionEvent::Message(payload)),
        }
        Ok(())
    }

    fn send_handshake(&self) -> Result<(), SessionError> {
        if self.enable_stream && self.stream_port.is_none() {
            return Err(SessionError::StreamNotReady);
        }
        let handshake = Handshake::new(&self.local, self.enable_stream, self.stream_port.filter(|_| self.enable_stream));
        self.link.send_frame(encode_frame(&handshake.encode()));
        Ok(())
    }

    fn send_wire(&self, message: &WireMessage) -> bool {
        self.link.send_frame(encode_frame(&message.encode()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::link::{LinkCommand, LinkReceiver};
    use crate::protocol::DeviceType;
    use serde_json::json;

    pub(crate) fn identity(id: &str, device_type: DeviceType) -> DeviceIdentity {
        DeviceIdentity::new(id, device_type, format!("{} device", id))
    }

    pub(crate) fn handshake_bytes(id: &str, device_type: DeviceType, stream_port: Option<u16>) -> Bytes {
        let hs = Handshake::new(&identity(id, device_type), stream_port.is_some(), stream_port);
        encode_frame(&hs.encode())
    }

    pub(crate) fn wire(value: Value) -> Bytes {
        encode_frame(&serde_json::to_vec(&value).unwrap())
    }

    /// Drain queued link commands, decoding frames to JSON
    pub(crate) fn drain(rx: &mut LinkReceiver) -> (Vec<Value>, usize, bool) {
        let mut frames = Vec::new();
        let mut datagrams = 0;
        let mut closed = false;
        let mut decoder = FrameDecoder::new();
        while let Ok(command) = rx.try_recv() {
            match command {
                LinkCommand::Frame(bytes) => {
                    for frame in decoder.decode(&bytes).unwrap() {
                        frames.push(serde_json::from_slice(&frame).unwrap());
                    }
                }
                LinkCommand::Datagram { .. } => datagrams += 1,
                LinkCommand::Close => closed = true,
            }
        }
        (frames, datagrams, closed)
    }

    fn peer_addr() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 50], 40000))
    }

    fn acceptor(now: Instant) -> (PeerSession, LinkReceiver) {
        let (link, rx) = Link::channel();
        let session = PeerSession::acceptor(
            1,
            identity("local", DeviceType::Main),
            peer_addr(),
            link,
            true,
            Some(6000),
            SessionTimings::default(),
            now,
        );
        (session, rx)
    }

    fn ready_initiator(now: Instant) -> (PeerSession, LinkReceiver) {
        let (link, mut rx) = Link::channel();
        let mut session = PeerSession::initiator(
            2,
            identity("local", DeviceType::Connector),
            peer_addr(),
            link,
            true,
            SessionTimings::default(),
            now,
        );
        assert!(session.on_connected(Some(7000), now).is_empty());
        let events = session.on_data(&handshake_bytes("remote", DeviceType::Main, Some(8000)), now);
        assert_eq!(events, vec![SessionEvent::Ready]);
        drain(&mut rx);
        (session, rx)
    }

    #[test]
    fn test_acceptor_handshake_timeout() {
        let t0 = Instant::now();
        let (mut session, _rx) = acceptor(t0);

        assert!(session.poll(t0 + Duration::from_millis(39_999)).is_empty());
        assert_eq!(
            session.poll(t0 + Duration::from_secs(40)),
            vec![SessionEvent::Closed {
                error: Some(SessionError::HandshakeTimeout)
            }]
        );
        assert!(session.is_closed());
        assert!(session.poll(t0 + Duration::from_secs(41)).is_empty());
    }

    #[test]
    fn test_acceptor_handshake_then_accept() {
        let t0 = Instant::now();
        let (mut session, mut rx) = acceptor(t0);

        let t1 = t0 + Duration::from_secs(10);
        let events = session.on_data(&handshake_bytes("remote", DeviceType::Connector, Some(9000)), t1);
        assert!(matches!(&events[..], [SessionEvent::PairingRequest(hs)] if hs.device_id == "remote"));
        assert_eq!(session.state(), SessionState::AwaitingHandshake);

        // The handshake deadline no longer applies once the request is pending
        assert!(session.poll(t0 + Duration::from_secs(45)).is_empty());

        let t2 = t0 + Duration::from_secs(46);
        assert_eq!(session.accept(t2), vec![SessionEvent::Ready]);
        assert!(session.is_ready());
        assert_eq!(session.remote_identity().unwrap().device_id, "remote");
        assert_eq!(session.remote_stream_port(), Some(9000));

        let (frames, _, _) = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["deviceId"], "local");
        assert_eq!(frames[0]["streamPort"], 6000);

        // A second accept is a no-op
        assert!(session.accept(t2).is_empty());
    }

    #[test]
    fn test_initiator_sends_handshake_on_connect() {
        let t0 = Instant::now();
        let (link, mut rx) = Link::channel();
        let mut session = PeerSession::initiator(
            3,
            identity("local", DeviceType::Connector),
            peer_addr(),
            link,
            false,
            SessionTimings::default(),
            t0,
        );
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.on_connected(None, t0).is_empty());

        let (frames, _, _) = drain(&mut rx);
        assert_eq!(frames[0]["deviceType"], "connector");
        assert_eq!(frames[0]["enableStream"], false);
        assert!(frames[0].get("streamPort").is_none());

        // No handshake timer on the initiator side
        assert!(session.poll(t0 + Duration::from_secs(120)).is_empty());
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
    }

    #[test]
    fn test_missing_stream_port_is_fatal() {
        let t0 = Instant::now();
        let (link, _rx) = Link::channel();
        let mut session = PeerSession::initiator(
            4,
            identity("local", DeviceType::Connector),
            peer_addr(),
            link,
            true,
            SessionTimings::default(),
            t0,
        );
        session.on_connected(Some(7000), t0);
        let events = session.on_data(&handshake_bytes("remote", DeviceType::Main, None), t0);
        assert_eq!(
            events,
            vec![SessionEvent::Closed {
                error: Some(SessionError::MissingStreamPort)
            }]
        );
    }

    #[test]
    fn test_stream_enabled_without_port_cannot_handshake() {
        let t0 = Instant::now();
        let (link, _rx) = Link::channel();
        let mut session = PeerSession::initiator(
            5,
            identity("local", DeviceType::Connector),
            peer_addr(),
            link,
            true,
            SessionTimings::default(),
            t0,
        );
        assert_eq!(
            session.on_connected(None, t0),
            vec![SessionEvent::Closed {
                error: Some(SessionError::StreamNotReady)
            }]
        );
    }

    #[test]
    fn test_rejection_while_awaiting_handshake() {
        let t0 = Instant::now();
        let (link, _rx) = Link::channel();
        let mut session = PeerSession::initiator(
            6,
            identity("local", DeviceType::Connector),
            peer_addr(),
            link,
            false,
            SessionTimings::default(),
            t0,
        );
        session.on_connected(None, t0);
        let events = session.on_data(
            &wire(json!({"type": "pairingResponse", "accepted": false, "reason": "Already paired"})),
            t0,
        );
        assert_eq!(
            events,
            vec![SessionEvent::Closed {
                error: Some(SessionError::PairingRejected("Already paired".into()))
            }]
        );
    }

    #[test]
    fn test_keep_alive_cadence_and_timeout() {
        let t0 = Instant::now();
        let (mut session, mut rx) = ready_initiator(t0);

        assert!(session.poll(t0 + Duration::from_secs(5)).is_empty());
        assert!(session.poll(t0 + Duration::from_secs(10)).is_empty());
        let (frames, _, _) = drain(&mut rx);
        assert_eq!(frames, vec![json!({"type": "ping"}), json!({"type": "ping"})]);

        let events = session.poll(t0 + Duration::from_secs(15));
        assert_eq!(
            events,
            vec![SessionEvent::Closed {
                error: Some(SessionError::KeepAliveTimeout { idle_ms: 15_000 })
            }]
        );
        let (_, _, closed) = drain(&mut rx);
        assert!(closed);
    }

    #[test]
    fn test_traffic_keeps_session_alive() {
        let t0 = Instant::now();
        let (mut session, mut rx) = ready_initiator(t0);

        for secs in [4, 9, 14, 19] {
            let at = t0 + Duration::from_secs(secs);
            assert!(session.on_data(&wire(json!({"type": "pong"})), at).is_empty());
            assert!(session.poll(at + Duration::from_secs(1)).is_empty());
        }
        assert!(session.is_ready());
        drain(&mut rx);
    }

    #[test]
    fn test_ready_dispatch() {
        let t0 = Instant::now();
        let (mut session, mut rx) = ready_initiator(t0);

        assert!(session.on_data(&wire(json!({"type": "ping"})), t0).is_empty());
        let (frames, _, _) = drain(&mut rx);
        assert_eq!(frames, vec![json!({"type": "pong"})]);

        let events = session.on_data(
            &wire(json!({"type": "service_update", "payload": {"addresses": ["10.0.0.9"], "port": 5100, "version": 7}})),
            t0,
        );
        assert!(matches!(&events[..], [SessionEvent::ServiceUpdate(data)] if data.port == 5100 && data.version == 7));

        let events = session.on_data(&wire(json!({"type": "custom", "payload": {"x": 1}})), t0);
        assert_eq!(events, vec![SessionEvent::Message(json!({"x": 1}))]);

        let events = session.on_data(&wire(json!({"type": "disconnect", "payload": {"reason": "bye"}})), t0);
        assert_eq!(
            events,
            vec![
                SessionEvent::Disconnect {
                    reason: Some("bye".into())
                },
                SessionEvent::Closed { error: None },
            ]
        );
        // Graceful close sends nothing further
        let (frames, _, closed) = drain(&mut rx);
        assert!(frames.is_empty());
        assert!(closed);
        assert!(session.close(None).is_none());
    }

    #[test]
    fn test_malformed_payload_closes_session() {
        let t0 = Instant::now();
        let (mut session, _rx) = ready_initiator(t0);
        let events = session.on_data(&encode_frame(b"{oops"), t0);
        assert!(matches!(
            &events[..],
            [SessionEvent::Closed {
                error: Some(SessionError::Protocol(_))
            }]
        ));
    }

    #[test]
    fn test_stream_data_gated_on_ready() {
        let t0 = Instant::now();
        let (mut pending, _rx) = acceptor(t0);
        assert!(pending.on_datagram(br#"{"type":"x"}"#, peer_addr()).is_empty());

        let (mut session, mut rx) = ready_initiator(t0);
        let events = session.on_datagram(br#"{"data":{"type":"x"},"streamDataId":"s1"}"#, peer_addr());
        assert!(matches!(&events[..], [SessionEvent::StreamData { .. }]));

        let envelope = StreamEnvelope {
            data: json!({"type": "x"}),
            stream_data_id: "s2".into(),
        };
        assert!(session.send_stream(&envelope).is_ok());
        let (_, datagrams, _) = drain(&mut rx);
        assert_eq!(datagrams, 1);
        assert_eq!(pending.send_stream(&envelope), Err(SessionError::StreamUnavailable));
    }

    #[test]
    fn test_reject_sends_response_then_closes() {
        let t0 = Instant::now();
        let (mut session, mut rx) = acceptor(t0);
        session.on_data(&handshake_bytes("remote", DeviceType::Connector, Some(9000)), t0);

        let events = session.reject("Pairing rejected by user.");
        assert!(matches!(
            &events[..],
            [SessionEvent::Closed {
                error: Some(SessionError::PairingRejected(_))
            }]
        ));
        let (frames, _, closed) = drain(&mut rx);
        assert_eq!(frames[0]["type"], "pairingResponse");
        assert_eq!(frames[0]["accepted"], false);
        assert_eq!(frames[0]["reason"], "Pairing rejected by user.");
        assert!(closed);
    }
}
