//! Side-channel datagram chunking
//!
//! Stream payloads are split into chunks small enough for a single UDP
//! packet. The receiver reassembles by message id and drops anything older
//! than the last message it completed, so late telemetry never overwrites
//! newer telemetry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::constants::{MAX_CHUNKS_PER_MESSAGE, MAX_CHUNK_PAYLOAD, MAX_PARTIAL_MESSAGES, MAX_STREAM_SENDERS};
use crate::error::NetworkError;

/// One UDP packet of a side-channel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatagramChunk {
    pub message_id: u64,
    pub sequence: u16,
    pub total: u16,
    /// Sender wall-clock milliseconds, shared by every chunk of a message
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl DatagramChunk {
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        bincode::serialize(self).map_err(|e| NetworkError::InvalidDatagram(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetworkError> {
        let chunk: DatagramChunk =
            bincode::deserialize(bytes).map_err(|e| NetworkError::InvalidDatagram(e.to_string()))?;
        if chunk.total == 0 || chunk.sequence >= chunk.total {
            return Err(NetworkError::InvalidDatagram(format!(
                "sequence {} out of range for {} chunks",
                chunk.sequence, chunk.total
            )));
        }
        if chunk.total as usize > MAX_CHUNKS_PER_MESSAGE {
            return Err(NetworkError::InvalidDatagram(format!(
                "{} chunks exceeds the limit of {}",
                chunk.total, MAX_CHUNKS_PER_MESSAGE
            )));
        }
        Ok(chunk)
    }
}

/// Split `payload` into chunks of at most [`MAX_CHUNK_PAYLOAD`] bytes
pub fn split_message(message_id: u64, timestamp: u64, payload: &[u8]) -> Vec<DatagramChunk> {
    let pieces: Vec<&[u8]> = if payload.is_empty() {
        vec![&[][..]]
    } else {
        payload.chunks(MAX_CHUNK_PAYLOAD).collect()
    };
    let total = pieces.len() as u16;

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| DatagramChunk {
            message_id,
            sequence: i as u16,
            total,
            timestamp,
            payload: piece.to_vec(),
        })
        .collect()
}

struct PartialMessage {
    total: u16,
    timestamp: u64,
    pieces: HashMap<u16, Vec<u8>>,
}

/// Per-sender reassembly state
#[derive(Default)]
pub struct Reassembler {
    partial: HashMap<u64, PartialMessage>,
    last_completed_timestamp: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a chunk; returns the full payload once its message completes
    pub fn accept(&mut self, chunk: DatagramChunk) -> Option<Vec<u8>> {
        if chunk.timestamp < self.last_completed_timestamp {
            return None;
        }

        if !self.partial.contains_key(&chunk.message_id) && self.partial.len() >= MAX_PARTIAL_MESSAGES {
            // Evict the oldest message to keep the table bounded
            if let Some(oldest) = self
                .partial
                .iter()
                .min_by_key(|(_, m)| m.timestamp)
                .map(|(id, _)| *id)
            {
                self.partial.remove(&oldest);
            }
        }

        let message = self
            .partial
            .entry(chunk.message_id)
            .or_insert_with(|| PartialMessage {
                total: chunk.total,
                timestamp: chunk.timestamp,
                pieces: HashMap::new(),
            });
        if chunk.total != message.total {
            return None;
        }
        message.pieces.entry(chunk.sequence).or_insert(chunk.payload);

        if message.pieces.len() < message.total as usize {
            return None;
        }

        let mut message = self.partial.remove(&chunk.message_id)?;
        let mut payload = Vec::new();
        for seq in 0..message.total {
            payload.extend(message.pieces.remove(&seq)?);
        }

        self.last_completed_timestamp = message.timestamp;
        let cutoff = self.last_completed_timestamp;
        self.partial.retain(|_, m| m.timestamp >= cutoff);

        Some(payload)
    }

    pub fn pending_messages(&self) -> usize {
        self.partial.len()
    }
}

/// Reassembly state for every sender seen on one socket. Past
/// [`MAX_STREAM_SENDERS`] the sender heard from least recently is dropped.
#[derive(Default)]
pub struct SenderTable {
    senders: HashMap<SocketAddr, (Reassembler, u64)>,
    arrivals: u64,
}

impl SenderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, from: SocketAddr, chunk: DatagramChunk) -> Option<Vec<u8>> {
        self.arrivals += 1;
        if !self.senders.contains_key(&from) && self.senders.len() >= MAX_STREAM_SENDERS {
            if let Some(idle) = self
                .senders
                .iter()
                .min_by_key(|(_, (_, seen))| *seen)
                .map(|(addr, _)| *addr)
            {
                tracing::debug!(%idle, "Dropping idle stream sender");
                self.senders.remove(&idle);
            }
        }
        let (reassembler, seen) = self.senders.entry(from).or_default();
        *seen = self.arrivals;
        reassembler.accept(chunk)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn contains(&self, from: &SocketAddr) -> bool {
        self.senders.contains_key(from)
    }
}
