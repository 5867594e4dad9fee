//! Identity beacons on a fixed UDP port
//!
//! Each device broadcasts a small JSON identity packet periodically and
//! whenever its advertisement changes. It also unicasts the packet to known
//! peer addresses on request, which reaches peers on routes broadcast does
//! not cover. Peers that stop beaconing are reported lost after a few missed
//! periods.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{DirectoryEvent, Origin, ServiceDirectory, ServiceRecord};
use crate::error::NetworkError;
use crate::protocol::DeviceType;

/// Missed beacon periods before a peer is considered gone
const EXPIRY_PERIODS: u32 = 3;

/// Wire form of an identity beacon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPacket {
    #[serde(rename = "type")]
    pub kind: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub tcp_port: u16,
    pub version: u64,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

impl IdentityPacket {
    pub fn from_record(record: &ServiceRecord) -> Self {
        Self {
            kind: "identity".into(),
            device_id: record.device_id.clone(),
            device_name: record.device_name.clone(),
            device_type: record.device_type,
            tcp_port: record.port,
            version: record.version,
            addresses: record.addresses.clone(),
        }
    }

    /// Convert to a record as seen from `sender`, whose address goes first
    pub fn into_record(self, sender: IpAddr) -> ServiceRecord {
        let mut addresses = vec![sender];
        addresses.extend(self.addresses.into_iter().filter(|ip| *ip != sender));
        ServiceRecord {
            device_id: self.device_id,
            device_type: self.device_type,
            device_name: self.device_name,
            port: self.tcp_port,
            addresses,
            version: self.version,
        }
    }
}

/// Directory backed by UDP identity beacons
pub struct BeaconDirectory {
    socket: Arc<UdpSocket>,
    port: u16,
    current: Arc<Mutex<Option<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl BeaconDirectory {
    /// Bind the beacon port and start listening. Must be called from within
    /// a tokio runtime.
    pub fn bind(
        port: u16,
        local_device_id: String,
        interval: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DirectoryEvent>), NetworkError> {
        let socket = bind_socket(port).map_err(|e| NetworkError::BindFailed(format!("beacon port {}: {}", port, e)))?;
        let socket = Arc::new(socket);
        let current = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!("Identity beacon listening on 0.0.0.0:{}", port);
        let task = tokio::spawn(run_beacon(
            socket.clone(),
            port,
            local_device_id,
            interval,
            current.clone(),
            tx,
        ));

        Ok((
            Self {
                socket,
                port,
                current,
                task,
            },
            rx,
        ))
    }

    fn send(&self, target: SocketAddr) {
        let Some(payload) = self.current.lock().clone() else {
            return;
        };
        if let Err(e) = self.socket.try_send_to(&payload, target) {
            tracing::debug!(%target, "Failed to send identity: {}", e);
        }
    }
}

impl ServiceDirectory for BeaconDirectory {
    fn publish(&mut self, record: &ServiceRecord) {
        match serde_json::to_vec(&IdentityPacket::from_record(record)) {
            Ok(payload) => *self.current.lock() = Some(payload),
            Err(e) => {
                tracing::warn!("Failed to encode identity: {}", e);
                return;
            }
        }
        self.send(SocketAddr::from((Ipv4Addr::BROADCAST, self.port)));
    }

    fn unpublish(&mut self) {
        *self.current.lock() = None;
    }

    fn announce_to(&mut self, target: IpAddr) {
        self.send(SocketAddr::new(target, self.port));
    }
}

impl Drop for BeaconDirectory {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn bind_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

async fn run_beacon(
    socket: Arc<UdpSocket>,
    port: u16,
    local_device_id: String,
    interval: Duration,
    current: Arc<Mutex<Option<Vec<u8>>>>,
    events: mpsc::UnboundedSender<DirectoryEvent>,
) {
    let mut buf = vec![0u8; 4096];
    let mut last_seen: HashMap<String, Instant> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    let broadcast = SocketAddr::from((Ipv4Addr::BROADCAST, port));
    let expiry = interval * EXPIRY_PERIODS;

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::trace!("Beacon receive error: {}", e);
                        continue;
                    }
                };
                let packet: IdentityPacket = match serde_json::from_slice(&buf[..n]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::debug!(%from, "Ignoring malformed beacon: {}", e);
                        continue;
                    }
                };
                if packet.kind != "identity" || packet.device_id.is_empty() || packet.device_id == local_device_id {
                    continue;
                }

                tracing::trace!(device_id = %packet.device_id, %from, "Identity received");
                last_seen.insert(packet.device_id.clone(), Instant::now());
                let record = packet.into_record(from.ip());
                let event = DirectoryEvent::Up { txt: record.to_txt(), origin: Origin::Beacon };
                if events.send(event).is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let payload = current.lock().clone();
                if let Some(payload) = payload {
                    if let Err(e) = socket.send_to(&payload, broadcast).await {
                        tracing::trace!("Beacon broadcast failed: {}", e);
                    }
                }

                let now = Instant::now();
                let expired: Vec<String> = last_seen
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) > expiry)
                    .map(|(id, _)| id.clone())
                    .collect();
                for device_id in expired {
                    last_seen.remove(&device_id);
                    tracing::debug!(%device_id, "Beacon expired");
                    if events.send(DirectoryEvent::Down { device_id }).is_err() {
                        return;
                    }
                }
            }
        }
    }
}
