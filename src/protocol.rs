//! Wire records exchanged between paired devices
//!
//! Every TCP frame body is UTF-8 JSON. The first frame in each direction is
//! a bare [`Handshake`] (no `type` field); everything after it is a
//! [`WireMessage`] discriminated by `type`. Side-channel datagrams carry a
//! [`StreamEnvelope`] whose `data` may be a [`ClockSyncProbe`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::SessionError;

/// Role a device plays in a pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Presenter
    Main,
    /// Companion
    Connector,
}

impl DeviceType {
    /// Pairing is only allowed between complementary types
    pub fn can_pair_with(self, other: DeviceType) -> bool {
        self != other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Main => "main",
            DeviceType::Connector => "connector",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(DeviceType::Main),
            "connector" => Ok(DeviceType::Connector),
            other => Err(format!("unknown device type '{}'", other)),
        }
    }
}

/// Who a device is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
}

impl DeviceIdentity {
    pub fn new(
        device_id: impl Into<String>,
        device_type: DeviceType,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            device_name: device_name.into(),
        }
    }
}

/// First frame sent by each side of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
    #[serde(default)]
    pub enable_stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_port: Option<u16>,
}

impl Handshake {
    pub fn new(identity: &DeviceIdentity, enable_stream: bool, stream_port: Option<u16>) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            device_type: identity.device_type,
            device_name: identity.device_name.clone(),
            enable_stream,
            stream_port,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.device_id, self.device_type, &self.device_name)
    }

    pub fn encode(&self) -> Vec<u8> {
        // A struct of strings, bools and integers cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Address data a device advertises over an established session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceData {
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub version: u64,
}

/// Application payload carried by a `message` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEnvelope {
    pub data: Value,
    pub message_id: String,
}

/// Side-channel payload wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnvelope {
    pub data: Value,
    pub stream_data_id: String,
}

/// Frames exchanged once the handshake has completed
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Ping,
    Pong,
    /// `None` when the payload did not carry a complete address record
    ServiceUpdate(Option<ServiceData>),
    Disconnect { reason: Option<String> },
    PairingResponse { accepted: bool, reason: Option<String> },
    /// `message` and any unrecognised `type`, forwarded with its payload
    Message(Value),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    accepted: Option<bool>,
    #[serde(default)]
    reason: Option<String>,
}

impl WireMessage {
    /// Decode a frame body received after the handshake.
    pub fn decode(body: &[u8]) -> Result<Self, SessionError> {
        let raw: RawFrame = serde_json::from_slice(body)
            .map_err(|e| SessionError::Protocol(format!("Message processing error: {}", e)))?;

        let message = match raw.kind.as_deref().unwrap_or("message") {
            "ping" => WireMessage::Ping,
            "pong" => WireMessage::Pong,
            "service_update" => WireMessage::ServiceUpdate(serde_json::from_value(raw.payload).ok()),
            "disconnect" => WireMessage::Disconnect {
                reason: raw
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "pairingResponse" => WireMessage::PairingResponse {
                accepted: raw.accepted.unwrap_or(false),
                reason: raw.reason,
            },
            _ => WireMessage::Message(raw.payload),
        };
        Ok(message)
    }

    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            WireMessage::Ping => json!({ "type": "ping" }),
            WireMessage::Pong => json!({ "type": "pong" }),
            WireMessage::ServiceUpdate(data) => json!({ "type": "service_update", "payload": data }),
            WireMessage::Disconnect { reason } => {
                json!({ "type": "disconnect", "payload": { "reason": reason } })
            }
            WireMessage::PairingResponse { accepted, reason } => {
                json!({ "type": "pairingResponse", "accepted": accepted, "reason": reason })
            }
            WireMessage::Message(payload) => json!({ "type": "message", "payload": payload }),
        };
        serde_json::to_vec(&value).unwrap_or_default()
    }
}

/// First frame received while the handshake is outstanding
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeFrame {
    Identify(Handshake),
    PairingResponse { accepted: bool, reason: Option<String> },
}

impl HandshakeFrame {
    pub fn decode(body: &[u8]) -> Result<Self, SessionError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| SessionError::Protocol(format!("Message processing error: {}", e)))?;

        if value.get("type").and_then(Value::as_str) == Some("pairingResponse") {
            return Ok(HandshakeFrame::PairingResponse {
                accepted: value.get("accepted").and_then(Value::as_bool).unwrap_or(false),
                reason: value.get("reason").and_then(Value::as_str).map(str::to_string),
            });
        }

        serde_json::from_value(value)
            .map(HandshakeFrame::Identify)
            .map_err(|e| SessionError::Protocol(format!("Invalid handshake: {}", e)))
    }
}

const PING_PREFIX: &str = "clock_sync_ping_";
const PONG_PREFIX: &str = "clock_sync_pong_";

/// Four-timestamp clock-sync exchange carried on the side channel
#[derive(Debug, Clone, PartialEq)]
pub enum ClockSyncProbe {
    Ping {
        sender: String,
        t1: f64,
    },
    Pong {
        sender: String,
        t1: f64,
        t2: f64,
        t3: f64,
        source_ip: Option<String>,
    },
}

impl ClockSyncProbe {
    /// Parse a side-channel payload; `None` if it is not a clock-sync probe.
    pub fn parse(value: &Value) -> Option<Self> {
        let kind = value.get("type")?.as_str()?;
        let number = |key: &str| value.get(key).and_then(Value::as_f64);

        if let Some(sender) = kind.strip_prefix(PING_PREFIX) {
            return Some(ClockSyncProbe::Ping {
                sender: sender.to_string(),
                t1: number("t1")?,
            });
        }
        if let Some(sender) = kind.strip_prefix(PONG_PREFIX) {
            return Some(ClockSyncProbe::Pong {
                sender: sender.to_string(),
                t1: number("t1")?,
                t2: number("t2")?,
                t3: number("t3")?,
                source_ip: value.get("sourceIp").and_then(Value::as_str).map(str::to_string),
            });
        }
        None
    }

    pub fn ping(sender: DeviceType, t1: f64) -> Self {
        ClockSyncProbe::Ping {
            sender: sender.as_str().to_string(),
            t1,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ClockSyncProbe::Ping { sender, t1 } => json!({
                "type": format!("{}{}", PING_PREFIX, sender),
                "t1": t1,
            }),
            ClockSyncProbe::Pong {
                sender,
                t1,
                t2,
                t3,
                source_ip,
            } => json!({
                "type": format!("{}{}", PONG_PREFIX, sender),
                "t1": t1,
                "t2": t2,
                "t3": t3,
                "sourceIp": source_ip,
            }),
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            ClockSyncProbe::Ping { sender, .. } | ClockSyncProbe::Pong { sender, .. } => sender,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untyped_frame_is_generic_message() {
        let msg = WireMessage::decode(br#"{"payload":{"data":1,"messageId":"a"}}"#).unwrap();
        assert_eq!(msg, WireMessage::Message(json!({"data": 1, "messageId": "a"})));

        let msg = WireMessage::decode(br#"{"type":"future_thing","payload":[1,2]}"#).unwrap();
        assert_eq!(msg, WireMessage::Message(json!([1, 2])));
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        assert!(matches!(
            WireMessage::decode(b"{not json"),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_handshake_frame_variants() {
        let body = br#"{"deviceId":"a","deviceType":"main","deviceName":"Stage","enableStream":true,"streamPort":4000}"#;
        match HandshakeFrame::decode(body).unwrap() {
            HandshakeFrame::Identify(hs) => {
                assert_eq!(hs.device_type, DeviceType::Main);
                assert_eq!(hs.stream_port, Some(4000));
            }
            other => panic!("unexpected {:?}", other),
        }

        let body = br#"{"type":"pairingResponse","accepted":false,"reason":"busy"}"#;
        assert_eq!(
            HandshakeFrame::decode(body).unwrap(),
            HandshakeFrame::PairingResponse {
                accepted: false,
                reason: Some("busy".into())
            }
        );

        assert!(HandshakeFrame::decode(br#"{"deviceId":"a"}"#).is_err());
    }

    #[test]
    fn test_service_update_without_port_is_ignored() {
        let msg = WireMessage::decode(br#"{"type":"service_update","payload":{"addresses":[]}}"#).unwrap();
        assert_eq!(msg, WireMessage::ServiceUpdate(None));
    }

    #[test]
    fn test_clock_sync_probe_parse() {
        let ping = ClockSyncProbe::parse(&json!({"type": "clock_sync_ping_connector", "t1": 12.5})).unwrap();
        assert_eq!(ping.sender(), "connector");

        let pong = ClockSyncProbe::parse(&json!({
            "type": "clock_sync_pong_main", "t1": 1.0, "t2": 2.0, "t3": 3.0, "sourceIp": "10.0.0.2"
        }))
        .unwrap();
        assert!(matches!(pong, ClockSyncProbe::Pong { t3, .. } if t3 == 3.0));

        assert!(ClockSyncProbe::parse(&json!({"type": "telemetry"})).is_none());
        assert!(ClockSyncProbe::parse(&json!({"type": "clock_sync_ping_main"})).is_none());
    }
}
