//! Pairing arbitration, connection maintenance and presence publication
//!
//! [`SessionCoordinator`] owns every aggregate and every session that has
//! not yet been attached to one. It performs no I/O itself: socket activity
//! arrives as [`NetEvent`]s, advertisements as [`DirectoryEvent`]s, time as
//! an `Instant` passed to each call, and everything the application should
//! know about is queued as a [`CoordinatorEvent`].

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::constants::{
    CANCEL_GRACE_MS, CLOCK_SYNC_INTERVAL_MS, DISCONNECT_GRACE_MS, MAINTENANCE_INTERVAL_MS,
    PAIRING_REQUEST_TIMEOUT_MS, PUBLISH_CHECK_INTERVAL_MS,
};
use crate::discovery::{DirectoryEvent, Origin, ServiceDirectory, ServiceRecord};
use crate::error::{PairingError, SessionError};
use crate::network::addresses::{same_address_set, AddressSource};
use crate::network::link::{Link, LinkReceiver, NetEvent, SessionId, SessionIds};
use crate::protocol::{ClockSyncProbe, DeviceIdentity, DeviceType, Handshake, ServiceData};
use crate::session::aggregate::{DeviceEvent, DisconnectReason, PeerAggregate};
use crate::session::peer::{PeerSession, SessionEvent, SessionTimings};
use crate::session::rtt::{round_trip, RttReport, RttTable};
use crate::time::MonotonicClock;

const REJECT_BY_USER: &str = "Pairing rejected by user.";
const REJECT_TIMED_OUT: &str = "Pairing request timed out.";
const REJECT_ALREADY_PAIRED: &str = "Already paired with another device.";
const REJECT_INCOMPATIBLE: &str = "Incompatible device type.";
const CANCELED_BY_USER: &str = "Pairing canceled by user.";
const USER_DISCONNECTED: &str = "User disconnected from presenter.";

/// Opens outgoing transport connections on behalf of the coordinator
pub trait Connector: Send {
    /// Start connecting `session_id` to `target`; the driver consumes `rx`
    /// and reports progress as `NetEvent`s.
    fn connect(&mut self, session_id: SessionId, target: SocketAddr, rx: LinkReceiver);
}

/// Coordinator-level timers
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorTimings {
    pub session: SessionTimings,
    pub pairing_request_timeout: Duration,
    pub maintenance_interval: Duration,
    pub publish_check_interval: Duration,
    pub clock_sync_interval: Duration,
    pub cancel_grace: Duration,
    pub disconnect_grace: Duration,
}

impl Default for CoordinatorTimings {
    fn default() -> Self {
        Self {
            session: SessionTimings::default(),
            pairing_request_timeout: Duration::from_millis(PAIRING_REQUEST_TIMEOUT_MS),
            maintenance_interval: Duration::from_millis(MAINTENANCE_INTERVAL_MS),
            publish_check_interval: Duration::from_millis(PUBLISH_CHECK_INTERVAL_MS),
            clock_sync_interval: Duration::from_millis(CLOCK_SYNC_INTERVAL_MS),
            cancel_grace: Duration::from_millis(CANCEL_GRACE_MS),
            disconnect_grace: Duration::from_millis(DISCONNECT_GRACE_MS),
        }
    }
}

/// Outcome of an inbound pairing request; settles exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pending,
    Accepted,
    Rejected,
}

impl Decision {
    /// Returns false if the decision was already made
    pub fn settle(&mut self, accept: bool) -> bool {
        if *self != Decision::Pending {
            return false;
        }
        *self = if accept { Decision::Accepted } else { Decision::Rejected };
        true
    }
}

/// Handle for answering one inbound pairing request.
///
/// Not `Clone`: passing it to [`SessionCoordinator::decide_pairing`]
/// consumes it, so a request can only be answered once.
#[derive(Debug)]
pub struct PairingTicket {
    id: u64,
    device: DeviceIdentity,
}

impl PairingTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }
}

#[derive(Debug)]
struct PendingRequest {
    device_id: String,
    deadline: Instant,
    decision: Decision,
}

#[derive(Debug)]
struct Teardown {
    at: Instant,
    device_id: String,
    reason: DisconnectReason,
}

/// Everything the application layer is told about
#[derive(Debug)]
pub enum CoordinatorEvent {
    DiscoverableDeviceFound(DeviceIdentity),
    DiscoverableDeviceLost { device_id: String },
    /// An unpaired device wants to pair; answer with `decide_pairing`
    PairingRequest(PairingTicket),
    /// A request was settled without the application (timeout or peer gone)
    PairingRequestExpired { ticket_id: u64, device_id: String },
    DeviceFound(DeviceIdentity),
    DeviceConnected(DeviceIdentity),
    DeviceDisconnected { device: DeviceIdentity, reason: DisconnectReason },
    PairingFailed { device_id: String, reason: String },
    /// Application message from the paired device. `received_at` is on the
    /// coordinator's clock, moved back by half the path's average RTT.
    Message {
        device_id: String,
        data: Value,
        remote_addr: IpAddr,
        received_at: f64,
    },
    StreamData {
        device_id: String,
        data: Value,
        remote_addr: IpAddr,
    },
    RttUpdated(Vec<RttReport>),
    ServicePublished(ServiceData),
    SessionError { device_id: Option<String>, error: SessionError },
    Error(PairingError),
}

/// Serializable view of one known device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
    pub addresses: Vec<IpAddr>,
    pub port: Option<u16>,
    pub found: bool,
    pub connected: bool,
    pub ready_outgoing: usize,
    pub ready_incoming: usize,
}

impl DeviceSummary {
    fn of(device: &PeerAggregate) -> Self {
        Self {
            device_id: device.device_id().to_string(),
            device_type: device.device_type(),
            device_name: device.device_name().to_string(),
            addresses: device.addresses().to_vec(),
            port: device.port(),
            found: device.is_found(),
            connected: device.is_connected(),
            ready_outgoing: device.ready_outgoing(),
            ready_incoming: device.ready_incoming(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub ticket_id: u64,
    pub device_id: String,
}

/// Point-in-time snapshot for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub identity: DeviceIdentity,
    pub running: bool,
    pub listen_port: Option<u16>,
    pub paired: Option<DeviceSummary>,
    pub devices: Vec<DeviceSummary>,
    pub pending: Vec<PendingSummary>,
    pub rtt: Vec<RttReport>,
    pub published_addresses: Vec<Ipv4Addr>,
    pub service_version: u64,
}

/// Top-level pairing state machine
pub struct SessionCoordinator {
    identity: DeviceIdentity,
    enable_stream: bool,
    timings: CoordinatorTimings,
    clock: MonotonicClock,
    ids: SessionIds,
    connector: Box<dyn Connector>,
    directory: Box<dyn ServiceDirectory>,
    addresses: Box<dyn AddressSource>,

    running: bool,
    listen_port: Option<u16>,
    devices: HashMap<String, PeerAggregate>,
    /// The single paired device, by id
    paired: Option<String>,
    pending: HashMap<u64, PendingRequest>,
    next_ticket: u64,
    /// Accepted sessions whose pairing request has not been settled
    unattached: HashMap<SessionId, PeerSession>,
    rtt: RttTable,
    last_published: Vec<Ipv4Addr>,
    service_version: u64,

    next_maintenance: Option<Instant>,
    next_publish_check: Option<Instant>,
    next_clock_sync: Option<Instant>,
    teardowns: Vec<Teardown>,
    events: Vec<CoordinatorEvent>,
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: DeviceIdentity,
        enable_stream: bool,
        timings: CoordinatorTimings,
        clock: MonotonicClock,
        ids: SessionIds,
        connector: Box<dyn Connector>,
        directory: Box<dyn ServiceDirectory>,
        addresses: Box<dyn AddressSource>,
    ) -> Self {
        Self {
            identity,
            enable_stream,
            timings,
            clock,
            ids,
            connector,
            directory,
            addresses,
            running: false,
            listen_port: None,
            devices: HashMap::new(),
            paired: None,
            pending: HashMap::new(),
            next_ticket: 0,
            unattached: HashMap::new(),
            rtt: RttTable::new(),
            last_published: Vec::new(),
            service_version: 0,
            next_maintenance: None,
            next_publish_check: None,
            next_clock_sync: None,
            teardowns: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn paired_device_id(&self) -> Option<&str> {
        self.paired.as_deref()
    }

    pub fn device(&self, device_id: &str) -> Option<&PeerAggregate> {
        self.devices.get(device_id)
    }

    pub fn service_version(&self) -> u64 {
        self.service_version
    }

    /// Drain queued notifications
    pub fn take_events(&mut self) -> Vec<CoordinatorEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn status(&self) -> CoordinatorStatus {
        let mut devices: Vec<DeviceSummary> = self.devices.values().map(DeviceSummary::of).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        let mut pending: Vec<PendingSummary> = self
            .pending
            .iter()
            .map(|(id, request)| PendingSummary {
                ticket_id: *id,
                device_id: request.device_id.clone(),
            })
            .collect();
        pending.sort_by_key(|p| p.ticket_id);

        CoordinatorStatus {
            identity: self.identity.clone(),
            running: self.running,
            listen_port: self.listen_port,
            paired: self
                .paired
                .as_ref()
                .and_then(|id| self.devices.get(id))
                .map(DeviceSummary::of),
            devices,
            pending,
            rtt: self.rtt.reports(),
            published_addresses: self.last_published.clone(),
            service_version: self.service_version,
        }
    }

    /// Begin publishing and maintaining connections. `listen_port` is the
    /// bound session listener port.
    pub fn start(&mut self, listen_port: u16, now: Instant) {
        if self.running {
            tracing::debug!("Start called, but coordinator is already running");
            return;
        }
        tracing::info!(
            device_id = %self.identity.device_id,
            device_type = %self.identity.device_type,
            listen_port,
            "Starting session coordinator"
        );
        self.running = true;
        self.listen_port = Some(listen_port);
        self.check_publication(true);
        self.next_publish_check = Some(now + self.timings.publish_check_interval);
        self.next_maintenance = Some(now + self.timings.maintenance_interval);
    }

    /// Unpair, close every session and withdraw the advertisement
    pub fn shutdown(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        tracing::info!("Stopping session coordinator");

        if let Some(device_id) = self.paired.clone() {
            if let Some(device) = self.devices.get(&device_id) {
                // Queued ahead of the close, so it is flushed before shutdown
                device.send_disconnect(USER_DISCONNECTED);
            }
            self.unpair();
        }
        let ids: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in ids {
            self.destroy_device(&device_id, DisconnectReason::Local, now);
        }
        for (_, mut session) in self.unattached.drain() {
            session.close(None);
        }
        self.pending.clear();
        self.teardowns.clear();
        self.devices.clear();
        self.directory.stop();

        self.running = false;
        self.next_maintenance = None;
        self.next_publish_check = None;
        self.next_clock_sync = None;
    }

    /// Feed socket activity
    pub fn handle_net_event(&mut self, event: NetEvent, now: Instant) {
        match event {
            NetEvent::Accepted {
                session_id,
                link,
                peer,
                stream_port,
            } => {
                if !self.running {
                    link.close();
                    return;
                }
                tracing::debug!(session_id, %peer, "New incoming connection established");
                let session = PeerSession::acceptor(
                    session_id,
                    self.identity.clone(),
                    peer,
                    link,
                    self.enable_stream,
                    stream_port,
                    self.timings.session,
                    now,
                );
                self.unattached.insert(session_id, session);
            }
            NetEvent::Connected {
                session_id,
                stream_port,
            } => {
                self.with_owner(session_id, now, |device| device.on_connected(session_id, stream_port, now));
            }
            NetEvent::ConnectFailed { session_id, error } => {
                tracing::debug!(session_id, "Connect failed: {}", error);
                self.with_owner(session_id, now, |device| {
                    device.on_transport_closed(session_id, Some(error.to_string()))
                });
            }
            NetEvent::Data { session_id, bytes } => {
                if let Some(session) = self.unattached.get_mut(&session_id) {
                    let events = session.on_data(&bytes, now);
                    self.handle_unattached_events(session_id, events, now);
                } else {
                    self.with_owner(session_id, now, |device| device.on_data(session_id, &bytes, now));
                }
            }
            NetEvent::Datagram {
                session_id,
                payload,
                from,
            } => {
                self.with_owner(session_id, now, |device| device.on_datagram(session_id, &payload, from));
            }
            NetEvent::Closed { session_id, error } => {
                let error = error.map(|e| e.to_string());
                if let Some(session) = self.unattached.get_mut(&session_id) {
                    let events = session.on_transport_closed(error);
                    self.handle_unattached_events(session_id, events, now);
                } else {
                    self.with_owner(session_id, now, |device| device.on_transport_closed(session_id, error));
                }
            }
        }
    }

    /// Feed browse results from the service directory
    pub fn handle_directory_event(&mut self, event: DirectoryEvent, now: Instant) {
        match event {
            DirectoryEvent::Up { txt, origin } => {
                let record = match ServiceRecord::from_txt(&txt) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::debug!("Ignoring advertisement: {}", e);
                        return;
                    }
                };
                if record.device_id == self.identity.device_id
                    || !self.identity.device_type.can_pair_with(record.device_type)
                {
                    return;
                }

                tracing::debug!(
                    device_id = %record.device_id,
                    version = record.version,
                    ?origin,
                    "Discovered service"
                );
                self.events
                    .push(CoordinatorEvent::DiscoverableDeviceFound(record.identity()));
                if record.addresses.is_empty() {
                    return;
                }
                if origin == Origin::Advertisement {
                    for ip in &record.addresses {
                        self.directory.announce_to(*ip);
                    }
                }

                let device = self
                    .devices
                    .entry(record.device_id.clone())
                    .or_insert_with(|| {
                        PeerAggregate::new(&record.device_id, record.device_type, &record.device_name)
                    });
                device.update_remote_info(
                    &record.addresses,
                    Some(record.port),
                    Some(record.version),
                    Some(&record.device_name),
                );

                if self.paired.as_deref() == Some(record.device_id.as_str()) {
                    self.trigger_maintenance(now);
                }
            }
            DirectoryEvent::Down { device_id } => {
                self.events
                    .push(CoordinatorEvent::DiscoverableDeviceLost { device_id });
            }
        }
    }

    /// Make `device_id` the paired device and start connecting to it
    pub fn pair_with(&mut self, device_id: &str, now: Instant) -> Result<(), PairingError> {
        if !self.running {
            return Err(PairingError::Stopped);
        }
        if !self.devices.contains_key(device_id) {
            tracing::error!(%device_id, "Attempted to pair with unknown device");
            let error = PairingError::UnknownDevice(device_id.to_string());
            self.events.push(CoordinatorEvent::Error(error.clone()));
            return Err(error);
        }

        tracing::info!(%device_id, "Initiating pairing");
        if let Some(previous) = self.paired.clone().filter(|p| p != device_id) {
            tracing::info!(device_id = %previous, "Unpairing from previous device");
            self.unpair();
            self.destroy_device(&previous, DisconnectReason::Local, now);
        }
        self.adopt_paired(device_id, now);
        self.trigger_maintenance(now);
        Ok(())
    }

    /// Abandon pairing with `device_id`, telling the peer why
    pub fn cancel_pairing(&mut self, device_id: &str, now: Instant) -> Result<(), PairingError> {
        if self.paired.as_deref() != Some(device_id) {
            tracing::warn!(%device_id, "Tried to cancel pairing with a device that is not paired");
            return Err(PairingError::NotPaired(device_id.to_string()));
        }
        tracing::info!(%device_id, "Cancelling pairing");
        self.unpair();
        if let Some(device) = self.devices.get(device_id) {
            device.send_pairing_rejection(CANCELED_BY_USER);
        }
        self.schedule_teardown(device_id, now + self.timings.cancel_grace);
        self.events.push(CoordinatorEvent::PairingFailed {
            device_id: device_id.to_string(),
            reason: CANCELED_BY_USER.to_string(),
        });
        Ok(())
    }

    /// Gracefully unpair from the current device
    pub fn disconnect_from_paired(&mut self, now: Instant) -> Result<(), PairingError> {
        let Some(device_id) = self.paired.clone() else {
            return Err(PairingError::NoPairedDevice);
        };
        tracing::info!(%device_id, "Disconnecting from paired device");
        if let Some(device) = self.devices.get(&device_id) {
            device.send_disconnect(USER_DISCONNECTED);
        }
        self.unpair();
        self.schedule_teardown(&device_id, now + self.timings.disconnect_grace);
        Ok(())
    }

    /// Answer an inbound pairing request
    pub fn decide_pairing(&mut self, ticket: PairingTicket, accept: bool, now: Instant) -> Result<(), PairingError> {
        let Some(mut request) = self.pending.remove(&ticket.id) else {
            return Err(PairingError::UnknownRequest(ticket.id));
        };
        if !request.decision.settle(accept) {
            return Err(PairingError::UnknownRequest(ticket.id));
        }
        if accept {
            tracing::info!(device_id = %request.device_id, "Application accepted pairing");
        } else {
            tracing::info!(device_id = %request.device_id, "Application rejected pairing");
        }
        self.settle_request(&request.device_id, request.decision, REJECT_BY_USER, now);
        Ok(())
    }

    /// Send an application payload to the paired device
    pub fn send_message(&mut self, data: Value) -> Result<String, PairingError> {
        let device = self.paired_device().ok_or(PairingError::NoPairedDevice)?;
        if device.ready_count() == 0 {
            tracing::debug!("Could not send message, paired device has no ready session");
            return Err(PairingError::NoPairedDevice);
        }
        device.send_message(data).ok_or(PairingError::NoPairedDevice)
    }

    /// Send a side-channel payload to the paired device
    pub fn send_stream(&mut self, data: Value) -> Result<usize, PairingError> {
        let device = self.paired_device().ok_or(PairingError::NoPairedDevice)?;
        Ok(device.send_stream_payload(data))
    }

    /// Fire due timers
    pub fn tick(&mut self, now: Instant) {
        let ids: Vec<SessionId> = self.unattached.keys().copied().collect();
        for id in ids {
            if let Some(session) = self.unattached.get_mut(&id) {
                let events = session.poll(now);
                self.handle_unattached_events(id, events, now);
            }
        }

        let device_ids: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in device_ids {
            self.with_device(&device_id, now, |device| device.poll(now));
        }

        self.expire_requests(now);
        self.run_teardowns(now);

        if !self.running {
            return;
        }
        if self.next_maintenance.is_some_and(|at| now >= at) {
            self.trigger_maintenance(now);
        }
        if self.next_publish_check.is_some_and(|at| now >= at) {
            self.check_publication(false);
            self.next_publish_check = Some(now + self.timings.publish_check_interval);
        }
        if self.next_clock_sync.is_some_and(|at| now >= at) {
            self.send_clock_sync_ping(now);
            self.next_clock_sync = Some(now + self.timings.clock_sync_interval);
        }
    }

    fn paired_device(&self) -> Option<&PeerAggregate> {
        self.paired.as_ref().and_then(|id| self.devices.get(id))
    }

    fn is_paired_with(&self, device_id: &str) -> bool {
        self.paired.as_deref() == Some(device_id)
    }

    /// Clear the paired slot and everything tied to it
    fn unpair(&mut self) {
        if self.paired.take().is_none() {
            return;
        }
        self.next_clock_sync = None;
        if !self.rtt.is_empty() {
            self.rtt.clear();
            self.events.push(CoordinatorEvent::RttUpdated(Vec::new()));
        }
    }

    /// Fill the paired slot. A device re-paired inside a teardown grace
    /// window keeps its paths, so it will not report `Connected` again.
    fn adopt_paired(&mut self, device_id: &str, now: Instant) {
        self.paired = Some(device_id.to_string());
        self.teardowns.retain(|t| t.device_id != device_id);
        if self.devices.get(device_id).is_some_and(|d| d.is_connected()) {
            self.next_clock_sync = Some(now + self.timings.clock_sync_interval);
        }
    }

    fn schedule_teardown(&mut self, device_id: &str, at: Instant) {
        self.teardowns.push(Teardown {
            at,
            device_id: device_id.to_string(),
            reason: DisconnectReason::Local,
        });
    }

    fn run_teardowns(&mut self, now: Instant) {
        let (due, waiting): (Vec<Teardown>, Vec<Teardown>) =
            std::mem::take(&mut self.teardowns).into_iter().partition(|t| now >= t.at);
        self.teardowns = waiting;
        for teardown in due {
            if self.is_paired_with(&teardown.device_id) {
                continue;
            }
            self.destroy_device(&teardown.device_id, teardown.reason, now);
        }
    }

    fn destroy_device(&mut self, device_id: &str, reason: DisconnectReason, now: Instant) {
        self.with_device(device_id, now, |device| device.destroy_all(reason));
    }

    fn owner_of(&self, session_id: SessionId) -> Option<String> {
        self.devices
            .values()
            .find(|d| d.contains(session_id))
            .map(|d| d.device_id().to_string())
    }

    fn with_owner<F>(&mut self, session_id: SessionId, now: Instant, f: F)
    where
        F: FnOnce(&mut PeerAggregate) -> Vec<DeviceEvent>,
    {
        match self.owner_of(session_id) {
            Some(device_id) => self.with_device(&device_id, now, f),
            None => tracing::trace!(session_id, "Event for unknown session"),
        }
    }

    fn with_device<F>(&mut self, device_id: &str, now: Instant, f: F)
    where
        F: FnOnce(&mut PeerAggregate) -> Vec<DeviceEvent>,
    {
        let Some(device) = self.devices.get_mut(device_id) else {
            return;
        };
        let events = f(device);
        self.handle_device_events(device_id, events, now);
    }

    fn handle_device_events(&mut self, device_id: &str, events: Vec<DeviceEvent>, now: Instant) {
        let mut queue: VecDeque<DeviceEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            let Some(device) = self.devices.get(device_id) else {
                return;
            };
            let identity = device.identity();
            let paired = self.is_paired_with(device_id);

            match event {
                DeviceEvent::Found => {
                    self.events.push(CoordinatorEvent::DeviceFound(identity));
                }
                DeviceEvent::Connected => {
                    if paired {
                        self.next_clock_sync = Some(now + self.timings.clock_sync_interval);
                    }
                    self.events.push(CoordinatorEvent::DeviceConnected(identity));
                }
                DeviceEvent::Disconnected { reason } => {
                    if paired {
                        tracing::info!(%device_id, "Paired device disconnected, unpairing");
                        self.unpair();
                    }
                    self.events.push(CoordinatorEvent::DeviceDisconnected {
                        device: identity,
                        reason,
                    });
                }
                DeviceEvent::OutgoingReady(session_id) => {
                    if let Some(data) = self.current_service_data() {
                        device.send_service_update(&data, Some(session_id));
                    }
                }
                DeviceEvent::InfoUpdated => {
                    if paired {
                        self.trigger_maintenance(now);
                    }
                }
                DeviceEvent::Message { data, remote_addr } => {
                    if !paired {
                        continue;
                    }
                    let half_rtt = self.rtt.average_for(remote_addr).map_or(0.0, |avg| avg / 2.0);
                    self.events.push(CoordinatorEvent::Message {
                        device_id: device_id.to_string(),
                        data,
                        remote_addr,
                        received_at: self.clock.to_ms(now) - half_rtt,
                    });
                }
                DeviceEvent::StreamData {
                    data,
                    remote_addr,
                    session_id,
                } => {
                    if paired {
                        self.handle_stream_data(device_id, session_id, data, remote_addr, now);
                    }
                }
                DeviceEvent::ManualDisconnect { reason } => {
                    if paired {
                        tracing::info!(%device_id, ?reason, "Manual disconnect from paired device");
                        self.unpair();
                        if let Some(device) = self.devices.get_mut(device_id) {
                            queue.extend(device.destroy_all(DisconnectReason::Remote));
                        }
                    }
                }
                DeviceEvent::PairingRejected { reason } => {
                    if paired {
                        tracing::info!(%device_id, %reason, "Pairing rejected by peer");
                        self.unpair();
                        self.events.push(CoordinatorEvent::PairingFailed {
                            device_id: device_id.to_string(),
                            reason,
                        });
                        if let Some(device) = self.devices.get_mut(device_id) {
                            queue.extend(device.destroy_all(DisconnectReason::Remote));
                        }
                    }
                }
                DeviceEvent::SessionError(error) => {
                    tracing::debug!(%device_id, "Session error: {}", error);
                    self.events.push(CoordinatorEvent::SessionError {
                        device_id: Some(device_id.to_string()),
                        error,
                    });
                }
            }
        }
    }

    fn handle_stream_data(
        &mut self,
        device_id: &str,
        session_id: SessionId,
        data: Value,
        remote_addr: IpAddr,
        now: Instant,
    ) {
        let local_sender = self.identity.device_type.as_str();
        match ClockSyncProbe::parse(&data) {
            Some(probe) if probe.sender() == local_sender => {
                tracing::trace!("Ignoring echoed clock-sync probe");
            }
            Some(ClockSyncProbe::Ping { t1, .. }) => {
                let at = self.clock.to_ms(now);
                let pong = ClockSyncProbe::Pong {
                    sender: local_sender.to_string(),
                    t1,
                    t2: at,
                    t3: at,
                    source_ip: Some(remote_addr.to_string()),
                };
                if let Some(device) = self.devices.get(device_id) {
                    if let Err(e) = device.send_stream_on(session_id, pong.to_value()) {
                        tracing::trace!(session_id, "Could not answer clock-sync ping: {}", e);
                    }
                }
            }
            Some(ClockSyncProbe::Pong { t1, t2, t3, .. }) => {
                let rtt = round_trip(t1, t2, t3, self.clock.to_ms(now));
                self.rtt.record(remote_addr, rtt);
                tracing::trace!(%remote_addr, rtt, "Clock-sync sample");
                self.events.push(CoordinatorEvent::RttUpdated(self.rtt.reports()));
            }
            None => self.events.push(CoordinatorEvent::StreamData {
                device_id: device_id.to_string(),
                data,
                remote_addr,
            }),
        }
    }

    fn send_clock_sync_ping(&mut self, now: Instant) {
        let Some(device) = self.paired_device() else {
            self.next_clock_sync = None;
            return;
        };
        if !device.is_connected() {
            return;
        }
        let ping = ClockSyncProbe::ping(self.identity.device_type, self.clock.to_ms(now));
        device.send_stream_payload(ping.to_value());
    }

    fn handle_unattached_events(&mut self, session_id: SessionId, events: Vec<SessionEvent>, now: Instant) {
        for event in events {
            match event {
                SessionEvent::PairingRequest(handshake) => self.handle_pairing_request(session_id, handshake, now),
                SessionEvent::Closed { error } => {
                    self.unattached.remove(&session_id);
                    match error {
                        // Our own refusal
                        Some(SessionError::PairingRejected(_)) => {}
                        Some(error) => {
                            tracing::debug!(session_id, "Unattached session closed: {}", error);
                            self.events.push(CoordinatorEvent::SessionError {
                                device_id: None,
                                error,
                            });
                        }
                        None => {}
                    }
                    self.drop_orphaned_requests();
                }
                other => tracing::trace!(session_id, event = ?other, "Ignoring event on unattached session"),
            }
        }
    }

    fn handle_pairing_request(&mut self, session_id: SessionId, handshake: Handshake, now: Instant) {
        let remote_id = handshake.device_id.clone();
        tracing::info!(
            session_id,
            device_id = %remote_id,
            device_name = %handshake.device_name,
            "Received pairing request"
        );

        if remote_id == self.identity.device_id
            || !self.identity.device_type.can_pair_with(handshake.device_type)
        {
            self.reject_unattached(session_id, REJECT_INCOMPATIBLE, now);
            return;
        }

        match self.paired.clone() {
            Some(paired) if paired == remote_id => {
                tracing::info!(device_id = %remote_id, "Request is from the paired device, accepting");
                self.accept_unattached(session_id, &remote_id, now);
            }
            Some(paired) => {
                tracing::info!(paired = %paired, device_id = %remote_id, "Already paired, rejecting request");
                self.reject_unattached(session_id, REJECT_ALREADY_PAIRED, now);
            }
            None => {
                if self.pending.values().any(|r| r.device_id == remote_id) {
                    tracing::debug!(device_id = %remote_id, "Ignoring duplicate pairing request");
                    return;
                }

                match self.devices.get_mut(&remote_id) {
                    Some(device) => {
                        device.update_remote_info(&[], None, None, Some(&handshake.device_name));
                    }
                    None => {
                        let device = PeerAggregate::new(&remote_id, handshake.device_type, &handshake.device_name);
                        self.devices.insert(remote_id.clone(), device);
                    }
                }

                self.next_ticket += 1;
                let ticket_id = self.next_ticket;
                self.pending.insert(
                    ticket_id,
                    PendingRequest {
                        device_id: remote_id,
                        deadline: now + self.timings.pairing_request_timeout,
                        decision: Decision::Pending,
                    },
                );
                tracing::info!(ticket_id, "Forwarding pairing request to application");
                self.events.push(CoordinatorEvent::PairingRequest(PairingTicket {
                    id: ticket_id,
                    device: handshake.identity(),
                }));
            }
        }
    }

    /// Apply a settled decision to every unattached session from `device_id`
    fn settle_request(&mut self, device_id: &str, decision: Decision, reject_reason: &str, now: Instant) {
        let mut sessions: Vec<SessionId> = self
            .unattached
            .iter()
            .filter(|(_, s)| s.pending_request().is_some_and(|h| h.device_id == device_id))
            .map(|(id, _)| *id)
            .collect();
        sessions.sort_unstable();

        match decision {
            Decision::Accepted => {
                if let Some(previous) = self.paired.clone().filter(|p| p != device_id) {
                    self.unpair();
                    self.destroy_device(&previous, DisconnectReason::Local, now);
                }
                self.adopt_paired(device_id, now);
                for session_id in sessions {
                    self.accept_unattached(session_id, device_id, now);
                }
                self.trigger_maintenance(now);
            }
            Decision::Rejected => {
                for session_id in sessions {
                    self.reject_unattached(session_id, reject_reason, now);
                }
            }
            Decision::Pending => {}
        }
    }

    fn accept_unattached(&mut self, session_id: SessionId, device_id: &str, now: Instant) {
        let Some(session) = self.unattached.get_mut(&session_id) else {
            return;
        };
        let events = session.accept(now);
        if !session.is_ready() {
            tracing::warn!(session_id, %device_id, "Accepted session failed to become ready");
            self.handle_unattached_events(session_id, events, now);
            return;
        }
        if let Some(session) = self.unattached.remove(&session_id) {
            self.with_device(device_id, now, move |device| device.add_incoming(session));
        }
    }

    fn reject_unattached(&mut self, session_id: SessionId, reason: &str, now: Instant) {
        if let Some(session) = self.unattached.get_mut(&session_id) {
            let events = session.reject(reason);
            self.handle_unattached_events(session_id, events, now);
        }
    }

    fn expire_requests(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, r)| now >= r.deadline)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for ticket_id in expired {
            let Some(mut request) = self.pending.remove(&ticket_id) else {
                continue;
            };
            request.decision.settle(false);
            tracing::info!(ticket_id, device_id = %request.device_id, "Pairing request timed out, rejecting");
            self.settle_request(&request.device_id, request.decision, REJECT_TIMED_OUT, now);
            self.events.push(CoordinatorEvent::PairingRequestExpired {
                ticket_id,
                device_id: request.device_id,
            });
        }
    }

    /// Forget requests whose sessions have all gone away
    fn drop_orphaned_requests(&mut self) {
        let orphaned: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, r)| {
                !self
                    .unattached
                    .values()
                    .any(|s| s.pending_request().is_some_and(|h| h.device_id == r.device_id))
            })
            .map(|(id, _)| *id)
            .collect();
        for ticket_id in orphaned {
            if let Some(request) = self.pending.remove(&ticket_id) {
                tracing::debug!(ticket_id, device_id = %request.device_id, "Pairing request abandoned by peer");
                self.events.push(CoordinatorEvent::PairingRequestExpired {
                    ticket_id,
                    device_id: request.device_id,
                });
            }
        }
    }

    fn trigger_maintenance(&mut self, now: Instant) {
        self.maintain_connections(now);
        self.next_maintenance = Some(now + self.timings.maintenance_interval);
    }

    /// Open an outgoing session to every advertised address of the paired
    /// device that has none. Existing sessions are never pruned here.
    fn maintain_connections(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        let Some(device_id) = self.paired.clone() else {
            return;
        };
        let Some(device) = self.devices.get_mut(&device_id) else {
            return;
        };
        let Some(port) = device.port() else {
            return;
        };

        for ip in device.addresses().to_vec() {
            let target = SocketAddr::new(ip, port);
            if device.has_connection_to(target) {
                continue;
            }
            tracing::info!(%device_id, %target, "No connection to paired device, initiating");
            let session_id = self.ids.next();
            let (link, rx) = Link::channel();
            let session = PeerSession::initiator(
                session_id,
                self.identity.clone(),
                target,
                link,
                self.enable_stream,
                self.timings.session,
                now,
            );
            device.add_outgoing(session);
            self.connector.connect(session_id, target, rx);
        }
    }

    fn current_service_data(&self) -> Option<ServiceData> {
        let port = self.listen_port?;
        if self.last_published.is_empty() {
            return None;
        }
        Some(ServiceData {
            addresses: self.last_published.iter().map(|ip| IpAddr::V4(*ip)).collect(),
            port,
            version: self.service_version,
        })
    }

    /// Republish when the routable address set changed (or when forced)
    fn check_publication(&mut self, force: bool) {
        let Some(port) = self.listen_port else {
            return;
        };
        let current = self.addresses.routable_ipv4();
        if !force && same_address_set(&current, &self.last_published) {
            return;
        }
        if !force {
            tracing::info!(old = ?self.last_published, new = ?current, "Local addresses changed");
        }
        if current.is_empty() {
            tracing::warn!("No suitable network interface found to advertise");
            self.last_published.clear();
            return;
        }

        self.last_published = current;
        let wall_clock = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.service_version = wall_clock.max(self.service_version + 1);

        let data = ServiceData {
            addresses: self.last_published.iter().map(|ip| IpAddr::V4(*ip)).collect(),
            port,
            version: self.service_version,
        };
        let record = ServiceRecord {
            device_id: self.identity.device_id.clone(),
            device_type: self.identity.device_type,
            device_name: self.identity.device_name.clone(),
            port,
            addresses: data.addresses.clone(),
            version: self.service_version,
        };

        tracing::info!(version = self.service_version, addresses = ?self.last_published, "Publishing service");
        if let Some(device) = self.paired_device() {
            device.send_service_update(&data, None);
        }
        self.directory.publish(&record);
        for device in self.devices.values() {
            for ip in device.addresses() {
                self.directory.announce_to(*ip);
            }
        }
        self.events.push(CoordinatorEvent::ServicePublished(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::TxtRecord;
    use crate::error::NetworkError;
    use crate::network::addresses::StaticAddresses;
    use crate::session::peer::tests::{drain, handshake_bytes, wire};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    const LOCAL_ID: &str = "presenter-1";
    const REMOTE_ID: &str = "companion-1";
    const OTHER_ID: &str = "companion-2";
    const REMOTE_PORT: u16 = 6000;

    type Connects = Arc<Mutex<Vec<(SessionId, SocketAddr, LinkReceiver)>>>;

    struct MockConnector(Connects);

    impl Connector for MockConnector {
        fn connect(&mut self, session_id: SessionId, target: SocketAddr, rx: LinkReceiver) {
            self.0.lock().push((session_id, target, rx));
        }
    }

    #[derive(Default)]
    struct DirectoryLog {
        published: Vec<ServiceRecord>,
        announced: Vec<IpAddr>,
        stopped: bool,
    }

    struct MockDirectory(Arc<Mutex<DirectoryLog>>);

    impl ServiceDirectory for MockDirectory {
        fn publish(&mut self, record: &ServiceRecord) {
            self.0.lock().published.push(record.clone());
        }

        fn unpublish(&mut self) {
            self.0.lock().stopped = true;
        }

        fn announce_to(&mut self, target: IpAddr) {
            self.0.lock().announced.push(target);
        }
    }

    struct Harness {
        coordinator: SessionCoordinator,
        connects: Connects,
        directory: Arc<Mutex<DirectoryLog>>,
        t0: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let t0 = Instant::now();
            let connects = Connects::default();
            let directory = Arc::new(Mutex::new(DirectoryLog::default()));
            let mut coordinator = SessionCoordinator::new(
                DeviceIdentity::new(LOCAL_ID, DeviceType::Main, "Stage"),
                true,
                CoordinatorTimings::default(),
                MonotonicClock::with_origin(t0),
                SessionIds::new(),
                Box::new(MockConnector(connects.clone())),
                Box::new(MockDirectory(directory.clone())),
                Box::new(StaticAddresses(vec![Ipv4Addr::new(192, 168, 1, 10)])),
            );
            coordinator.start(41000, t0);
            coordinator.take_events();
            Self {
                coordinator,
                connects,
                directory,
                t0,
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.t0 + Duration::from_millis(ms)
        }

        fn discover(&mut self, device_id: &str, addresses: &str, version: u64, now: Instant) {
            let mut txt = TxtRecord::new();
            txt.insert("deviceId".into(), device_id.into());
            txt.insert("deviceType".into(), "connector".into());
            txt.insert("deviceName".into(), format!("{} tablet", device_id));
            txt.insert("port".into(), REMOTE_PORT.to_string());
            txt.insert("addresses".into(), addresses.into());
            txt.insert("version".into(), version.to_string());
            self.coordinator.handle_directory_event(
                DirectoryEvent::Up {
                    txt,
                    origin: Origin::Advertisement,
                },
                now,
            );
        }

        /// Accept an inbound connection and deliver the peer's handshake
        fn inbound(&mut self, session_id: SessionId, device_id: &str, last: u8, now: Instant) -> LinkReceiver {
            let (link, rx) = Link::channel();
            self.coordinator.handle_net_event(
                NetEvent::Accepted {
                    session_id,
                    link,
                    peer: SocketAddr::from(([10, 0, 0, last], 50000)),
                    stream_port: Some(7000),
                },
                now,
            );
            self.data(session_id, handshake_bytes(device_id, DeviceType::Connector, Some(9000)), now);
            rx
        }

        /// Complete the most recent outgoing connect from the peer's side
        fn complete_outgoing(&mut self, device_id: &str, now: Instant) -> (SessionId, LinkReceiver) {
            let (session_id, _, rx) = self.connects.lock().remove(0);
            self.coordinator.handle_net_event(
                NetEvent::Connected {
                    session_id,
                    stream_port: Some(7100),
                },
                now,
            );
            self.data(session_id, handshake_bytes(device_id, DeviceType::Connector, Some(9100)), now);
            (session_id, rx)
        }

        fn data(&mut self, session_id: SessionId, bytes: Bytes, now: Instant) {
            self.coordinator
                .handle_net_event(NetEvent::Data { session_id, bytes }, now);
        }

        fn take_ticket(&mut self) -> PairingTicket {
            let events = self.coordinator.take_events();
            events
                .into_iter()
                .find_map(|e| match e {
                    CoordinatorEvent::PairingRequest(ticket) => Some(ticket),
                    _ => None,
                })
                .expect("pairing request")
        }

        /// Pair with REMOTE_ID through an inbound request plus one outgoing path
        fn connected(&mut self) -> (LinkReceiver, SessionId, LinkReceiver) {
            let now = self.at(0);
            self.discover(REMOTE_ID, "10.0.0.20", 1, now);
            let rx_in = self.inbound(100, REMOTE_ID, 20, now);
            let ticket = self.take_ticket();
            self.coordinator.decide_pairing(ticket, true, now).unwrap();
            let (out_id, rx_out) = self.complete_outgoing(REMOTE_ID, now);
            assert!(self.coordinator.device(REMOTE_ID).unwrap().is_connected());
            self.coordinator.take_events();
            (rx_in, out_id, rx_out)
        }
    }

    fn names(events: &[CoordinatorEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                CoordinatorEvent::DiscoverableDeviceFound(_) => "discoverable-found",
                CoordinatorEvent::DiscoverableDeviceLost { .. } => "discoverable-lost",
                CoordinatorEvent::PairingRequest(_) => "pairing-request",
                CoordinatorEvent::PairingRequestExpired { .. } => "pairing-expired",
                CoordinatorEvent::DeviceFound(_) => "found",
                CoordinatorEvent::DeviceConnected(_) => "connected",
                CoordinatorEvent::DeviceDisconnected { .. } => "disconnected",
                CoordinatorEvent::PairingFailed { .. } => "pairing-failed",
                CoordinatorEvent::Message { .. } => "message",
                CoordinatorEvent::StreamData { .. } => "stream",
                CoordinatorEvent::RttUpdated(_) => "rtt",
                CoordinatorEvent::ServicePublished(_) => "published",
                CoordinatorEvent::SessionError { .. } => "session-error",
                CoordinatorEvent::Error(_) => "error",
            })
            .collect()
    }

    #[test]
    fn test_start_publishes() {
        let h = Harness::new();
        let log = h.directory.lock();
        assert_eq!(log.published.len(), 1);
        let record = &log.published[0];
        assert_eq!(record.port, 41000);
        assert_eq!(record.addresses, vec![IpAddr::from([192, 168, 1, 10])]);
        assert_eq!(record.version, h.coordinator.service_version());
        assert!(record.version > 0);
    }

    #[test]
    fn test_discovery_filters_and_announces() {
        let mut h = Harness::new();
        let now = h.at(0);

        // Our own record and same-type devices are ignored
        let mut own = TxtRecord::new();
        own.insert("deviceId".into(), LOCAL_ID.into());
        h.coordinator.handle_directory_event(
            DirectoryEvent::Up {
                txt: own,
                origin: Origin::Advertisement,
            },
            now,
        );
        assert!(h.coordinator.take_events().is_empty());

        h.discover(REMOTE_ID, "10.0.0.20,192.168.1.20", 5, now);
        assert_eq!(names(&h.coordinator.take_events()), vec!["discoverable-found"]);
        let device = h.coordinator.device(REMOTE_ID).unwrap();
        assert_eq!(device.port(), Some(REMOTE_PORT));
        assert_eq!(device.addresses().len(), 2);
        assert_eq!(h.directory.lock().announced.len(), 2);

        // An older advertisement does not roll the record back
        h.discover(REMOTE_ID, "10.0.0.99", 3, now);
        assert_eq!(h.coordinator.device(REMOTE_ID).unwrap().addresses().len(), 2);

        h.coordinator.handle_directory_event(
            DirectoryEvent::Down {
                device_id: REMOTE_ID.into(),
            },
            now,
        );
        assert_eq!(names(&h.coordinator.take_events()), vec!["discoverable-lost"]);
    }

    #[test]
    fn test_pair_with_unknown_device() {
        let mut h = Harness::new();
        assert_eq!(
            h.coordinator.pair_with("ghost", h.at(0)),
            Err(PairingError::UnknownDevice("ghost".into()))
        );
        assert_eq!(names(&h.coordinator.take_events()), vec!["error"]);
    }

    #[test]
    fn test_pair_with_connects_and_pushes_service_data() {
        let mut h = Harness::new();
        let now = h.at(0);
        h.discover(REMOTE_ID, "10.0.0.20,192.168.1.20", 1, now);
        h.coordinator.take_events();

        h.coordinator.pair_with(REMOTE_ID, now).unwrap();
        assert_eq!(h.connects.lock().len(), 2);
        assert_eq!(h.connects.lock()[0].1, SocketAddr::from(([10, 0, 0, 20], REMOTE_PORT)));

        let (_, mut rx) = h.complete_outgoing(REMOTE_ID, now);
        assert_eq!(names(&h.coordinator.take_events()), vec!["found"]);

        let (frames, _, _) = drain(&mut rx);
        assert_eq!(frames[0]["deviceId"], LOCAL_ID);
        assert_eq!(frames[1]["type"], "service_update");
        assert_eq!(frames[1]["payload"]["port"], 41000);

        // Maintenance does not duplicate live paths
        h.coordinator.tick(h.at(5_000));
        assert_eq!(h.connects.lock().len(), 1);
    }

    #[test]
    fn test_inbound_request_accept() {
        let mut h = Harness::new();
        let now = h.at(0);
        let mut rx = h.inbound(100, REMOTE_ID, 20, now);
        let ticket = h.take_ticket();
        assert_eq!(ticket.device().device_id, REMOTE_ID);

        // A second path from the same undecided device is not re-prompted
        let mut rx2 = h.inbound(101, REMOTE_ID, 21, now);
        assert!(h.coordinator.take_events().is_empty());
        assert_eq!(h.coordinator.status().pending.len(), 1);

        h.coordinator.decide_pairing(ticket, true, h.at(1_000)).unwrap();
        assert_eq!(h.coordinator.paired_device_id(), Some(REMOTE_ID));
        assert_eq!(names(&h.coordinator.take_events()), vec!["found"]);
        assert_eq!(h.coordinator.device(REMOTE_ID).unwrap().ready_incoming(), 2);

        assert_eq!(drain(&mut rx).0[0]["deviceId"], LOCAL_ID);
        assert_eq!(drain(&mut rx2).0[0]["deviceId"], LOCAL_ID);
    }

    #[test]
    fn test_failed_accept_is_reported() {
        let mut h = Harness::new();
        let now = h.at(0);
        h.discover(REMOTE_ID, "10.0.0.20", 1, now);

        // Side channel never bound, so our handshake cannot be sent
        let (link, _rx) = Link::channel();
        h.coordinator.handle_net_event(
            NetEvent::Accepted {
                session_id: 100,
                link,
                peer: SocketAddr::from(([10, 0, 0, 20], 50000)),
                stream_port: None,
            },
            now,
        );
        h.data(100, handshake_bytes(REMOTE_ID, DeviceType::Connector, Some(9000)), now);
        let ticket = h.take_ticket();
        h.coordinator.decide_pairing(ticket, true, now).unwrap();

        let events = h.coordinator.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            CoordinatorEvent::SessionError {
                error: SessionError::StreamNotReady,
                ..
            }
        )));
        assert_eq!(h.coordinator.device(REMOTE_ID).unwrap().ready_incoming(), 0);
    }

    #[test]
    fn test_inbound_request_times_out() {
        let mut h = Harness::new();
        let mut rx = h.inbound(100, REMOTE_ID, 20, h.at(0));
        let ticket = h.take_ticket();

        h.coordinator.tick(h.at(34_999));
        assert!(h.coordinator.take_events().is_empty());
        h.coordinator.tick(h.at(35_000));
        assert_eq!(names(&h.coordinator.take_events()), vec!["pairing-expired"]);

        let (frames, _, closed) = drain(&mut rx);
        assert_eq!(frames[0]["type"], "pairingResponse");
        assert_eq!(frames[0]["reason"], REJECT_TIMED_OUT);
        assert!(closed);

        // A late decision is refused
        assert_eq!(
            h.coordinator.decide_pairing(ticket, true, h.at(36_000)),
            Err(PairingError::UnknownRequest(1))
        );
        assert_eq!(h.coordinator.paired_device_id(), None);
    }

    #[test]
    fn test_inbound_while_paired() {
        let mut h = Harness::new();
        h.connected();

        // Another path from the paired device is accepted automatically
        let mut rx_same = h.inbound(200, REMOTE_ID, 21, h.at(100));
        assert!(h.coordinator.take_events().is_empty());
        assert_eq!(h.coordinator.device(REMOTE_ID).unwrap().ready_incoming(), 2);
        assert_eq!(drain(&mut rx_same).0[0]["deviceId"], LOCAL_ID);

        // A different device is turned away
        let mut rx_other = h.inbound(201, OTHER_ID, 30, h.at(100));
        let (frames, _, closed) = drain(&mut rx_other);
        assert_eq!(frames[0]["reason"], REJECT_ALREADY_PAIRED);
        assert!(closed);
        assert!(h.coordinator.status().pending.is_empty());
    }

    #[test]
    fn test_repair_tears_down_previous() {
        let mut h = Harness::new();
        let (mut rx_in, _, mut rx_out) = h.connected();
        h.discover(OTHER_ID, "10.0.0.30", 1, h.at(10));
        h.coordinator.take_events();

        h.coordinator.pair_with(OTHER_ID, h.at(20)).unwrap();
        let events = h.coordinator.take_events();
        assert!(matches!(
            &events[0],
            CoordinatorEvent::DeviceDisconnected { device, reason: DisconnectReason::Local } if device.device_id == REMOTE_ID
        ));
        assert_eq!(h.coordinator.paired_device_id(), Some(OTHER_ID));
        assert!(drain(&mut rx_in).2);
        assert!(drain(&mut rx_out).2);
        assert_eq!(h.coordinator.device(REMOTE_ID).unwrap().session_count(), 0);
    }

    #[test]
    fn test_cancel_pairing_reports_then_tears_down() {
        let mut h = Harness::new();
        let now = h.at(0);
        h.discover(REMOTE_ID, "10.0.0.20", 1, now);
        h.coordinator.pair_with(REMOTE_ID, now).unwrap();
        h.coordinator.take_events();
        let (_, _, mut rx) = h.connects.lock().remove(0);

        assert_eq!(
            h.coordinator.cancel_pairing(OTHER_ID, now),
            Err(PairingError::NotPaired(OTHER_ID.into()))
        );
        h.coordinator.cancel_pairing(REMOTE_ID, now).unwrap();
        assert_eq!(names(&h.coordinator.take_events()), vec!["pairing-failed"]);
        assert_eq!(h.coordinator.paired_device_id(), None);

        let (frames, _, closed) = drain(&mut rx);
        assert_eq!(frames[0]["reason"], CANCELED_BY_USER);
        assert!(!closed);

        h.coordinator.tick(h.at(99));
        assert!(!drain(&mut rx).2);
        h.coordinator.tick(h.at(100));
        assert!(drain(&mut rx).2);
    }

    #[test]
    fn test_disconnect_from_paired() {
        let mut h = Harness::new();
        assert_eq!(
            h.coordinator.disconnect_from_paired(h.at(0)),
            Err(PairingError::NoPairedDevice)
        );

        let (mut rx_in, _, mut rx_out) = h.connected();
        h.coordinator.disconnect_from_paired(h.at(10)).unwrap();
        assert_eq!(h.coordinator.paired_device_id(), None);
        let (frames, _, _) = drain(&mut rx_out);
        assert_eq!(frames.last().unwrap()["type"], "disconnect");
        assert_eq!(frames.last().unwrap()["payload"]["reason"], USER_DISCONNECTED);

        h.coordinator.tick(h.at(260));
        assert_eq!(names(&h.coordinator.take_events()), vec!["disconnected"]);
        assert!(drain(&mut rx_in).2);
    }

    #[test]
    fn test_repair_within_grace_resumes_clock_sync() {
        let mut h = Harness::new();
        let (mut rx_in, _, mut rx_out) = h.connected();
        h.coordinator.disconnect_from_paired(h.at(10)).unwrap();
        h.coordinator.pair_with(REMOTE_ID, h.at(20)).unwrap();
        drain(&mut rx_in);
        drain(&mut rx_out);

        h.coordinator.tick(h.at(600));
        assert_eq!(h.coordinator.paired_device_id(), Some(REMOTE_ID));
        assert!(h.coordinator.device(REMOTE_ID).unwrap().is_connected());
        assert_eq!(drain(&mut rx_out).1, 1);

        h.coordinator.tick(h.at(1_200));
        assert_eq!(drain(&mut rx_out).1, 1);
    }

    #[test]
    fn test_peer_disconnect_unpairs() {
        let mut h = Harness::new();
        let (_rx_in, _, _rx_out) = h.connected();
        h.data(100, wire(json!({"type": "disconnect", "payload": {"reason": "bye"}})), h.at(10));
        assert_eq!(h.coordinator.paired_device_id(), None);
        let events = h.coordinator.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            CoordinatorEvent::DeviceDisconnected { reason: DisconnectReason::Remote, .. }
        )));
    }

    #[test]
    fn test_losing_all_paths_unpairs() {
        let mut h = Harness::new();
        let (_rx_in, out_id, _rx_out) = h.connected();

        h.coordinator.handle_net_event(NetEvent::Closed { session_id: out_id, error: None }, h.at(10));
        assert!(h.coordinator.take_events().is_empty());
        assert_eq!(h.coordinator.paired_device_id(), Some(REMOTE_ID));

        h.coordinator.handle_net_event(
            NetEvent::Closed {
                session_id: 100,
                error: Some(NetworkError::ReceiveFailed("reset".into())),
            },
            h.at(20),
        );
        assert_eq!(names(&h.coordinator.take_events()), vec!["session-error", "disconnected"]);
        assert_eq!(h.coordinator.paired_device_id(), None);
    }

    #[test]
    fn test_clock_sync_round_trip() {
        let mut h = Harness::new();
        let (mut rx_in, out_id, mut rx_out) = h.connected();
        drain(&mut rx_in);
        drain(&mut rx_out);

        // Probe goes out over the outgoing path once connected
        h.coordinator.tick(h.at(500));
        assert_eq!(drain(&mut rx_out).1, 1);

        // Peer's ping is answered on the path it arrived on
        let from = SocketAddr::from(([10, 0, 0, 20], 9000));
        let ping = json!({"data": {"type": "clock_sync_ping_connector", "t1": 42.0}, "streamDataId": "p1"});
        h.coordinator.handle_net_event(
            NetEvent::Datagram {
                session_id: 100,
                payload: Bytes::from(ping.to_string()),
                from,
            },
            h.at(600),
        );
        assert_eq!(drain(&mut rx_in).1, 1);

        // Pong: t4 = 1000, rtt = (1000 - 400) - (520 - 500) = 580
        let pong = json!({
            "data": {"type": "clock_sync_pong_connector", "t1": 400.0, "t2": 500.0, "t3": 520.0},
            "streamDataId": "p2"
        });
        h.coordinator.handle_net_event(
            NetEvent::Datagram {
                session_id: out_id,
                payload: Bytes::from(pong.to_string()),
                from,
            },
            h.at(1_000),
        );
        match &h.coordinator.take_events()[..] {
            [CoordinatorEvent::RttUpdated(reports)] => {
                assert_eq!(reports[0].ip, from.ip());
                assert!((reports[0].avg_rtt - 580.0).abs() < 1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Messages are back-dated by half the path RTT
        h.data(
            100,
            wire(json!({"type": "message", "payload": {"data": {"type": "play"}, "messageId": "m1"}})),
            h.at(2_000),
        );
        match &h.coordinator.take_events()[..] {
            [CoordinatorEvent::Message { received_at, data, .. }] => {
                assert_eq!(data["type"], "play");
                assert!((received_at - 1_710.0).abs() < 1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_shutdown() {
        let mut h = Harness::new();
        let (mut rx_in, _, mut rx_out) = h.connected();
        h.coordinator.shutdown(h.at(10));
        assert!(!h.coordinator.is_running());
        assert!(h.directory.lock().stopped);
        let (frames, _, closed) = drain(&mut rx_out);
        assert_eq!(frames.last().unwrap()["type"], "disconnect");
        assert!(closed);
        assert!(drain(&mut rx_in).2);
        assert_eq!(
            h.coordinator.pair_with(REMOTE_ID, h.at(10)),
            Err(PairingError::Stopped)
        );
    }
}
