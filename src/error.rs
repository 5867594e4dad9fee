//! Error types for the pairing, session and playback subsystems

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transport-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid datagram: {0}")]
    InvalidDatagram(String),

    #[error("Connect to {0} timed out")]
    Timeout(std::net::SocketAddr),
}

/// Reasons a single peer session ends abnormally.
///
/// These never escape the owning aggregate except as a readiness change, so
/// they are cheap to clone into close events.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Handshake timeout: did not receive identification from peer")]
    HandshakeTimeout,

    #[error("Keep-alive timeout after {idle_ms}ms")]
    KeepAliveTimeout { idle_ms: u64 },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Handshake failed: peer did not provide a stream port")]
    MissingStreamPort,

    #[error("Cannot send handshake: stream socket not ready")]
    StreamNotReady,

    #[error("Stream is not enabled or connection is not complete")]
    StreamUnavailable,

    #[error("Pairing rejected: {0}")]
    PairingRejected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Coordinator-level pairing errors surfaced to the application
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PairingError {
    #[error("Device {0} not found")]
    UnknownDevice(String),

    #[error("Device {0} is not the paired device")]
    NotPaired(String),

    #[error("No paired device")]
    NoPairedDevice,

    #[error("Pairing request {0} is no longer pending")]
    UnknownRequest(u64),

    #[error("Coordinator is not running")]
    Stopped,
}

/// Service advertisement parsing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
