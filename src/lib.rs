//! # LiveSync
//!
//! Presenter/companion pairing over a LAN with a resilient dual-channel
//! session protocol and a latency-corrected musical playback clock.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        PRESENTER (main) / COMPANION (connector)          │
//! │                                                                          │
//! │  ┌──────────────┐   DirectoryEvent   ┌────────────────────────────────┐  │
//! │  │  Service     │ ─────────────────▶ │      Coordinator task           │  │
//! │  │  Directory   │ ◀───── publish ─── │  (session::runtime)             │  │
//! │  └──────────────┘                    │                                  │  │
//! │                                      │  SessionCoordinator              │  │
//! │  ┌──────────────┐      NetEvent      │   ├─ paired PeerAggregate        │  │
//! │  │ TCP listener │ ─────────────────▶ │   │   ├─ outgoing PeerSessions   │  │
//! │  │ + connectors │                    │   │   └─ incoming PeerSessions   │  │
//! │  │ (link tasks) │ ◀──── LinkCommand ─│   ├─ unattached sessions         │  │
//! │  └──────┬───────┘                    │   └─ RTT table (per source IP)   │  │
//! │         │                            └───────────────┬────────────────┘  │
//! │         │ [u32 len][JSON]  TCP                        │ CoordinatorEvent  │
//! │         │ chunked JSON     UDP side channel           ▼                   │
//! │         │                            ┌────────────────────────────────┐  │
//! │         │                            │ PlaybackClock + UI (axum)       │  │
//! │         │                            └────────────────────────────────┘  │
//! └─────────┼────────────────────────────────────────────────────────────────┘
//!           ▼
//!      paired peer (one or more redundant paths per direction)
//! ```
//!
//! Protocol state machines (`session::peer`, `session::aggregate`,
//! `session::coordinator`, `playback::clock`) are free of I/O: time is passed
//! in and sockets are reached through channels. A single coordinator task
//! owns all of them, so no protocol state is ever touched concurrently.

pub mod config;
pub mod discovery;
pub mod error;
pub mod network;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod time;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Length prefix size of a TCP frame
    pub const FRAME_HEADER_SIZE: usize = 4;

    /// Largest accepted TCP frame body
    pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    /// Largest side-channel chunk body
    pub const MAX_CHUNK_PAYLOAD: usize = 1200;

    /// Partial side-channel messages kept per sender
    pub const MAX_PARTIAL_MESSAGES: usize = 64;

    /// Side-channel messages are no larger than a TCP frame
    pub const MAX_CHUNKS_PER_MESSAGE: usize = (MAX_FRAME_LEN + MAX_CHUNK_PAYLOAD - 1) / MAX_CHUNK_PAYLOAD;

    /// Distinct source addresses tracked per side-channel socket
    pub const MAX_STREAM_SENDERS: usize = 16;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// TCP read buffer per link
    pub const READ_BUFFER_SIZE: usize = 16 * 1024;

    /// Outgoing TCP connect timeout
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Acceptor-side wait for the peer's handshake
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 40_000;

    /// Keep-alive ping period
    pub const KEEP_ALIVE_INTERVAL_MS: u64 = 5_000;

    /// Silence after which a ready session is dead
    pub const KEEP_ALIVE_TIMEOUT_MS: u64 = 10_000;

    /// Time the application has to accept or reject a pairing request
    pub const PAIRING_REQUEST_TIMEOUT_MS: u64 = 35_000;

    /// Connection maintenance sweep period
    pub const MAINTENANCE_INTERVAL_MS: u64 = 5_000;

    /// Local address re-check period
    pub const PUBLISH_CHECK_INTERVAL_MS: u64 = 5_000;

    /// Clock-sync probe period while connected
    pub const CLOCK_SYNC_INTERVAL_MS: u64 = 500;

    /// Delay between a pairing cancellation message and socket teardown
    pub const CANCEL_GRACE_MS: u64 = 100;

    /// Delay between a disconnect message and socket teardown
    pub const DISCONNECT_GRACE_MS: u64 = 250;

    /// Coordinator timer resolution
    pub const COORDINATOR_TICK_MS: u64 = 100;

    /// RTT samples kept per remote address
    pub const MAX_RTT_SAMPLES: usize = 20;

    /// Recently seen message ids remembered per device
    pub const DEDUPE_CAPACITY: usize = 512;

    /// Service type used for advertisement
    pub const DEFAULT_SERVICE_TYPE: &str = "livelyrics";

    /// Default UDP port for identity beacons
    pub const DEFAULT_DISCOVERY_PORT: u16 = 54321;

    /// Default HTTP port for the control surface
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Tempo used when a song does not specify one
    pub const DEFAULT_BPM: f64 = 120.0;
}
