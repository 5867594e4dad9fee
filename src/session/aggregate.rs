//! Logical device built from every session to the same remote identity

use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use uuid::Uuid;

use crate::constants::DEDUPE_CAPACITY;
use crate::error::SessionError;
use crate::network::link::SessionId;
use crate::protocol::{AppEnvelope, ClockSyncProbe, DeviceIdentity, DeviceType, ServiceData, StreamEnvelope};
use crate::session::peer::{PeerSession, SessionEvent};

/// Bounded set of recently seen ids; the oldest id is forgotten first.
#[derive(Debug, Clone)]
pub struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; returns false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(DEDUPE_CAPACITY)
    }
}

/// Why a device stopped being reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Every path failed or closed
    Network,
    /// This side unpaired
    Local,
    /// The peer unpaired or refused
    Remote,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Network => "network",
            DisconnectReason::Local => "local",
            DisconnectReason::Remote => "remote",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications raised by a [`PeerAggregate`]
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// First ready session in any direction
    Found,
    /// Ready sessions exist in both directions
    Connected,
    Disconnected { reason: DisconnectReason },
    /// Deduplicated application message
    Message { data: Value, remote_addr: IpAddr },
    StreamData {
        data: Value,
        remote_addr: IpAddr,
        session_id: SessionId,
    },
    /// Advertised addresses, port or name changed
    InfoUpdated,
    /// An outgoing session finished its handshake
    OutgoingReady(SessionId),
    /// The peer sent a graceful `disconnect`
    ManualDisconnect { reason: Option<String> },
    /// An outgoing session was refused or cancelled by the peer
    PairingRejected { reason: String },
    /// A single session failed; the device may still be reachable
    SessionError(SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

/// All sessions believed to reach one remote device
#[derive(Debug)]
pub struct PeerAggregate {
    device_id: String,
    device_type: DeviceType,
    device_name: String,
    addresses: Vec<IpAddr>,
    port: Option<u16>,
    last_version: Option<u64>,
    outgoing: BTreeMap<SessionId, PeerSession>,
    incoming: BTreeMap<SessionId, PeerSession>,
    found: bool,
    connected: bool,
    seen_messages: RecentIds,
    seen_stream: RecentIds,
}

impl PeerAggregate {
    pub fn new(device_id: impl Into<String>, device_type: DeviceType, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            device_name: device_name.into(),
            addresses: Vec::new(),
            port: None,
            last_version: None,
            outgoing: BTreeMap::new(),
            incoming: BTreeMap::new(),
            found: false,
            connected: false,
            seen_messages: RecentIds::default(),
            seen_stream: RecentIds::default(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.device_id, self.device_type, &self.device_name)
    }

    /// Advertised addresses, most preferred first
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn last_version(&self) -> Option<u64> {
        self.last_version
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn ready_outgoing(&self) -> usize {
        self.outgoing.values().filter(|s| s.is_ready()).count()
    }

    pub fn ready_incoming(&self) -> usize {
        self.incoming.values().filter(|s| s.is_ready()).count()
    }

    pub fn ready_count(&self) -> usize {
        self.ready_outgoing() + self.ready_incoming()
    }

    pub fn session_count(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.outgoing.contains_key(&session_id) || self.incoming.contains_key(&session_id)
    }

    /// True if a live outgoing session already targets `target`
    pub fn has_connection_to(&self, target: SocketAddr) -> bool {
        self.outgoing
            .values()
            .any(|s| !s.is_closed() && s.remote_addr() == target)
    }

    pub fn add_outgoing(&mut self, session: PeerSession) -> Vec<DeviceEvent> {
        tracing::debug!(
            device_id = %self.device_id,
            session_id = session.id(),
            remote = %session.remote_addr(),
            "Adding outgoing session"
        );
        self.outgoing.insert(session.id(), session);
        self.recompute()
    }

    pub fn add_incoming(&mut self, session: PeerSession) -> Vec<DeviceEvent> {
        tracing::debug!(
            device_id = %self.device_id,
            session_id = session.id(),
            remote = %session.remote_addr(),
            "Adding incoming session"
        );
        self.incoming.insert(session.id(), session);
        self.recompute()
    }

    pub fn on_connected(&mut self, session_id: SessionId, stream_port: Option<u16>, now: Instant) -> Vec<DeviceEvent> {
        self.drive(session_id, |s| s.on_connected(stream_port, now))
    }

    pub fn on_data(&mut self, session_id: SessionId, data: &[u8], now: Instant) -> Vec<DeviceEvent> {
        self.drive(session_id, |s| s.on_data(data, now))
    }

    pub fn on_datagram(&mut self, session_id: SessionId, payload: &[u8], from: SocketAddr) -> Vec<DeviceEvent> {
        self.drive(session_id, |s| s.on_datagram(payload, from))
    }

    pub fn on_transport_closed(&mut self, session_id: SessionId, error: Option<String>) -> Vec<DeviceEvent> {
        self.drive(session_id, |s| s.on_transport_closed(error))
    }

    /// Run every session's timers
    pub fn poll(&mut self, now: Instant) -> Vec<DeviceEvent> {
        let ids: Vec<SessionId> = self.outgoing.keys().chain(self.incoming.keys()).copied().collect();
        let mut events = Vec::new();
        for id in ids {
            events.extend(self.drive(id, |s| s.poll(now)));
        }
        events
    }

    /// Close every session. Raises `Disconnected` only if the device was
    /// found or connected.
    pub fn destroy_all(&mut self, reason: DisconnectReason) -> Vec<DeviceEvent> {
        tracing::info!(
            device_id = %self.device_id,
            sessions = self.session_count(),
            %reason,
            "Destroying all sessions"
        );
        for session in self.outgoing.values_mut().chain(self.incoming.values_mut()) {
            session.close(None);
        }
        self.outgoing.clear();
        self.incoming.clear();

        let was_active = self.found || self.connected;
        self.found = false;
        self.connected = false;
        if was_active {
            vec![DeviceEvent::Disconnected { reason }]
        } else {
            Vec::new()
        }
    }

    /// Apply advertised peer data.
    ///
    /// A version lower than the last accepted one is ignored entirely. An
    /// equal version may still refresh addresses and name but not the port.
    /// Returns true if anything changed.
    pub fn update_remote_info(
        &mut self,
        addresses: &[IpAddr],
        port: Option<u16>,
        version: Option<u64>,
        name: Option<&str>,
    ) -> bool {
        let mut port_allowed = true;
        if let (Some(version), Some(last)) = (version, self.last_version) {
            if version < last {
                return false;
            }
            port_allowed = version > last;
        }

        let mut changed = false;
        if let Some(version) = version {
            if self.last_version != Some(version) {
                tracing::debug!(device_id = %self.device_id, version, "Updating remote info");
                self.last_version = Some(version);
            }
        }
        if let Some(port) = port.filter(|_| port_allowed) {
            changed |= self.port != Some(port);
            self.port = Some(port);
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            changed |= self.device_name != name;
            self.device_name = name.to_string();
        }
        if !addresses.is_empty() {
            let mut deduped: Vec<IpAddr> = Vec::with_capacity(addresses.len());
            for ip in addresses {
                if !deduped.contains(ip) {
                    deduped.push(*ip);
                }
            }
            changed |= self.addresses != deduped;
            self.addresses = deduped;
        }
        changed
    }

    /// Send an application payload over every ready outgoing session.
    ///
    /// Returns the generated message id, or `None` if nothing could carry it.
    pub fn send_message(&self, data: Value) -> Option<String> {
        let envelope = AppEnvelope {
            data,
            message_id: Uuid::new_v4().to_string(),
        };
        let sent = self
            .outgoing
            .values()
            .filter(|s| s.send_message(&envelope))
            .count();
        (sent > 0).then_some(envelope.message_id)
    }

    /// Send a side-channel payload over every ready outgoing session.
    pub fn send_stream_payload(&self, data: Value) -> usize {
        let envelope = StreamEnvelope {
            data,
            stream_data_id: Uuid::new_v4().to_string(),
        };
        self.outgoing
            .values()
            .filter(|s| s.send_stream(&envelope).is_ok())
            .count()
    }

    /// Send a side-channel payload over one specific session in either direction
    pub fn send_stream_on(&self, session_id: SessionId, data: Value) -> Result<(), SessionError> {
        let session = self
            .outgoing
            .get(&session_id)
            .or_else(|| self.incoming.get(&session_id))
            .ok_or(SessionError::StreamUnavailable)?;
        session.send_stream(&StreamEnvelope {
            data,
            stream_data_id: Uuid::new_v4().to_string(),
        })
    }

    /// Push service data to one outgoing session, or to all of them
    pub fn send_service_update(&self, data: &ServiceData, target: Option<SessionId>) -> usize {
        match target {
            Some(id) => self
                .outgoing
                .get(&id)
                .map_or(0, |s| usize::from(s.send_service_update(data))),
            None => self.outgoing.values().filter(|s| s.send_service_update(data)).count(),
        }
    }

    pub fn send_disconnect(&self, reason: &str) -> usize {
        self.outgoing.values().filter(|s| s.send_disconnect(reason)).count()
    }

    /// Sent on outgoing sessions regardless of handshake state
    pub fn send_pairing_rejection(&self, reason: &str) -> usize {
        self.outgoing
            .values()
            .filter(|s| s.send_pairing_rejection(reason))
            .count()
    }

    fn drive<F>(&mut self, session_id: SessionId, f: F) -> Vec<DeviceEvent>
    where
        F: FnOnce(&mut PeerSession) -> Vec<SessionEvent>,
    {
        let (direction, session) = if let Some(s) = self.outgoing.get_mut(&session_id) {
            (Direction::Outgoing, s)
        } else if let Some(s) = self.incoming.get_mut(&session_id) {
            (Direction::Incoming, s)
        } else {
            return Vec::new();
        };
        let remote_ip = session.remote_addr().ip();
        let session_events = f(session);

        let mut events = Vec::new();
        for event in session_events {
            self.translate(session_id, direction, remote_ip, event, &mut events);
        }
        events
    }

    fn translate(
        &mut self,
        session_id: SessionId,
        direction: Direction,
        remote_ip: IpAddr,
        event: SessionEvent,
        events: &mut Vec<DeviceEvent>,
    ) {
        match event {
            SessionEvent::Ready => {
                if direction == Direction::Outgoing {
                    events.push(DeviceEvent::OutgoingReady(session_id));
                }
                events.extend(self.recompute());
            }
            SessionEvent::Message(payload) => {
                if let Some(data) = self.dedupe_message(payload) {
                    events.push(DeviceEvent::Message {
                        data,
                        remote_addr: remote_ip,
                    });
                }
            }
            SessionEvent::StreamData { data, from } => {
                if let Some(data) = self.dedupe_stream(data) {
                    events.push(DeviceEvent::StreamData {
                        data,
                        remote_addr: from.ip(),
                        session_id,
                    });
                }
            }
            SessionEvent::ServiceUpdate(data) => {
                if self.update_remote_info(&data.addresses, Some(data.port), Some(data.version), None) {
                    events.push(DeviceEvent::InfoUpdated);
                }
            }
            SessionEvent::Disconnect { reason } => {
                tracing::info!(device_id = %self.device_id, reason = ?reason, "Peer requested disconnect");
                events.push(DeviceEvent::ManualDisconnect { reason });
            }
            SessionEvent::Closed { error } => {
                let removed = match direction {
                    Direction::Outgoing => self.outgoing.remove(&session_id).is_some(),
                    Direction::Incoming => self.incoming.remove(&session_id).is_some(),
                };
                match error {
                    Some(SessionError::PairingRejected(reason)) if direction == Direction::Outgoing => {
                        events.push(DeviceEvent::PairingRejected { reason });
                    }
                    Some(error) => events.push(DeviceEvent::SessionError(error)),
                    None => {}
                }
                if removed {
                    events.extend(self.recompute());
                }
            }
            SessionEvent::PairingRequest(handshake) => {
                tracing::debug!(
                    device_id = %self.device_id,
                    session_id,
                    remote = %handshake.device_id,
                    "Ignoring pairing request on an attached session"
                );
            }
        }
    }

    /// Unwrap `{data, messageId}` and drop ids already delivered.
    /// Payloads without an id are passed through unchanged.
    fn dedupe_message(&mut self, payload: Value) -> Option<Value> {
        match serde_json::from_value::<AppEnvelope>(payload.clone()) {
            Ok(envelope) => self.seen_messages.insert(&envelope.message_id).then_some(envelope.data),
            Err(_) => Some(payload),
        }
    }

    /// Clock-sync probes are per-path measurements and are never deduplicated.
    fn dedupe_stream(&mut self, payload: Value) -> Option<Value> {
        match serde_json::from_value::<StreamEnvelope>(payload.clone()) {
            Ok(envelope) => {
                if ClockSyncProbe::parse(&envelope.data).is_some()
                    || self.seen_stream.insert(&envelope.stream_data_id)
                {
                    Some(envelope.data)
                } else {
                    None
                }
            }
            Err(_) => Some(payload),
        }
    }

    fn recompute(&mut self) -> Vec<DeviceEvent> {
        let ready_out = self.ready_outgoing();
        let ready_in = self.ready_incoming();
        let total = ready_out + ready_in;
        let mut events = Vec::new();

        if !self.found && total > 0 {
            self.found = true;
            tracing::info!(device_id = %self.device_id, "Device found");
            events.push(DeviceEvent::Found);
        }

        if total == 0 {
            if self.found || self.connected {
                self.found = false;
                self.connected = false;
                tracing::info!(device_id = %self.device_id, "Device disconnected");
                events.push(DeviceEvent::Disconnected {
                    reason: DisconnectReason::Network,
                });
            }
        } else if ready_out > 0 && ready_in > 0 {
            if !self.connected {
                self.connected = true;
                tracing::info!(device_id = %self.device_id, ready_out, ready_in, "Device connected");
                events.push(DeviceEvent::Connected);
            }
        } else {
            self.connected = false;
        }
        events
    }
}
