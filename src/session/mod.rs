//! Session layer: per-connection handshake, per-device aggregation and the
//! pairing coordinator

pub mod aggregate;
pub mod coordinator;
pub mod peer;
pub mod rtt;
pub mod runtime;

pub use aggregate::{DeviceEvent, DisconnectReason, PeerAggregate, RecentIds};
pub use coordinator::{
    Connector, CoordinatorEvent, CoordinatorStatus, CoordinatorTimings, DeviceSummary, PairingTicket,
    SessionCoordinator,
};
pub use peer::{PeerSession, Role, SessionEvent, SessionState, SessionTimings};
pub use rtt::{round_trip, RttReport, RttStats, RttTable};
pub use runtime::{spawn, CoordinatorHandle, CoordinatorRuntime, RuntimeOptions, TcpConnector};
