//! Network subsystem: framing, side-channel chunking and socket drivers

pub mod addresses;
pub mod datagram;
pub mod framing;
pub mod link;

pub use addresses::{AddressSource, StaticAddresses, SystemAddresses};
pub use framing::{encode_frame, FrameDecoder};
pub use link::{Link, LinkCommand, LinkReceiver, NetEvent, SessionId, SessionIds};
