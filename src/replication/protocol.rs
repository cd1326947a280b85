//! Replication wire protocol
//!
//! Encoding and decoding of the messages exchanged between replicas.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────────────────┐
//! │ Type (1) │ Len (4)  │ CRC (4)  │         Payload             │
//! └──────────┴──────────┴──────────┴─────────────────────────────┘
//! ```
//! Integers are big-endian; the CRC32 covers the payload only.
//!
//! ### Payload by Message Type
//! - 0x01 HANDSHAKE:          bincode `Handshake { node_id, watermarks }`
//! - 0x02 ENTRY:              origin (1) + ts (8) + kind (1) + key_len (4) + key
//!                            + value_len (4) + value
//! - 0x03 HEARTBEAT:          empty
//! - 0x04 BOOTSTRAP_COMPLETE: high (8)
//!
//! Key and value bytes are interop encodings, exactly as stored in the arena.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::error::{DriftError, Result};
use crate::store::{ReplicatedEntry, Stamp};

/// Header size: 1 byte type + 4 bytes length + 4 bytes CRC
pub const HEADER_SIZE: usize = 9;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

const KIND_LIVE: u8 = 0;
const KIND_TOMBSTONE: u8 = 1;

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0x01,
    Entry = 0x02,
    Heartbeat = 0x03,
    BootstrapComplete = 0x04,
}

/// First message on every connection, sent by both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: u8,
    /// origin -> highest timestamp received contiguously from that origin
    pub watermarks: BTreeMap<u8, u64>,
}

/// A decoded replication message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    Entry(ReplicatedEntry),
    Heartbeat,
    /// Every entry above the receiver's watermarks up to `high` has been sent
    BootstrapComplete { high: u64 },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::Entry(_) => MessageType::Entry,
            Message::Heartbeat => MessageType::Heartbeat,
            Message::BootstrapComplete { .. } => MessageType::BootstrapComplete,
        }
    }
}

// =============================================================================
// Message Encoding/Decoding
// =============================================================================

/// Encode a message into a complete frame
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let payload = match message {
        Message::Handshake(handshake) => bincode::serialize(handshake)?,
        Message::Entry(entry) => encode_entry(entry),
        Message::Heartbeat => Vec::new(),
        Message::BootstrapComplete { high } => high.to_be_bytes().to_vec(),
    };

    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(DriftError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.push(message.message_type() as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn encode_entry(entry: &ReplicatedEntry) -> Vec<u8> {
    let value = entry.value.as_deref().unwrap_or(&[]);
    let mut payload = Vec::with_capacity(1 + 8 + 1 + 4 + entry.key.len() + 4 + value.len());
    payload.put_u8(entry.stamp.origin);
    payload.put_u64(entry.stamp.timestamp);
    payload.put_u8(if entry.is_tombstone() {
        KIND_TOMBSTONE
    } else {
        KIND_LIVE
    });
    payload.put_u32(entry.key.len() as u32);
    payload.put_slice(&entry.key);
    payload.put_u32(value.len() as u32);
    payload.put_slice(value);
    payload
}

/// Decode a complete frame
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    if bytes.len() < HEADER_SIZE {
        return Err(DriftError::Protocol(format!(
            "Incomplete header: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }

    let mut header = &bytes[..HEADER_SIZE];
    let message_type = header.get_u8();
    let payload_len = header.get_u32() as usize;
    let crc = header.get_u32();

    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(DriftError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }
    if bytes.len() != HEADER_SIZE + payload_len {
        return Err(DriftError::Protocol(format!(
            "Frame length mismatch: header declares {} payload bytes, got {}",
            payload_len,
            bytes.len() - HEADER_SIZE
        )));
    }

    let payload = &bytes[HEADER_SIZE..];
    let actual = crc32fast::hash(payload);
    if actual != crc {
        return Err(DriftError::Protocol(format!(
            "Checksum mismatch: expected {:#010x}, got {:#010x}",
            crc, actual
        )));
    }

    match message_type {
        0x01 => Ok(Message::Handshake(bincode::deserialize(payload)?)),
        0x02 => decode_entry(payload).map(Message::Entry),
        0x03 => {
            if !payload.is_empty() {
                return Err(DriftError::Protocol(format!(
                    "HEARTBEAT: unexpected payload of {} bytes",
                    payload.len()
                )));
            }
            Ok(Message::Heartbeat)
        }
        0x04 => {
            if payload.len() != 8 {
                return Err(DriftError::Protocol(format!(
                    "BOOTSTRAP_COMPLETE: expected 8 payload bytes, got {}",
                    payload.len()
                )));
            }
            let mut payload = payload;
            Ok(Message::BootstrapComplete {
                high: payload.get_u64(),
            })
        }
        _ => Err(DriftError::Protocol(format!(
            "Unknown message type: 0x{:02x}",
            message_type
        ))),
    }
}

fn decode_entry(mut payload: &[u8]) -> Result<ReplicatedEntry> {
    if payload.remaining() < 1 + 8 + 1 + 4 {
        return Err(DriftError::Protocol(
            "ENTRY: truncated header".to_string(),
        ));
    }
    let origin = payload.get_u8();
    let timestamp = payload.get_u64();
    let kind = payload.get_u8();

    let key = take_sized(&mut payload, "key")?;
    if payload.remaining() < 4 {
        return Err(DriftError::Protocol(
            "ENTRY: missing value length".to_string(),
        ));
    }
    let value = take_sized(&mut payload, "value")?;
    if payload.has_remaining() {
        return Err(DriftError::Protocol(format!(
            "ENTRY: {} trailing bytes",
            payload.remaining()
        )));
    }

    let stamp = Stamp::new(origin, timestamp);
    match kind {
        KIND_LIVE => Ok(ReplicatedEntry::put(stamp, key, value)),
        KIND_TOMBSTONE if value.is_empty() => Ok(ReplicatedEntry::tombstone(stamp, key)),
        KIND_TOMBSTONE => Err(DriftError::Protocol(
            "ENTRY: tombstone carries a value".to_string(),
        )),
        other => Err(DriftError::Protocol(format!(
            "ENTRY: unknown kind 0x{:02x}",
            other
        ))),
    }
}

/// Read a u32 length followed by that many bytes
fn take_sized(payload: &mut &[u8], what: &str) -> Result<Bytes> {
    let len = payload.get_u32() as usize;
    if payload.remaining() < len {
        return Err(DriftError::Protocol(format!(
            "ENTRY: incomplete {} (expected {}, got {})",
            what,
            len,
            payload.remaining()
        )));
    }
    Ok(payload.copy_to_bytes(len))
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete message from a stream
///
/// Blocks until a complete message is received or an error occurs
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(DriftError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = vec![0u8; HEADER_SIZE + payload_len];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_SIZE..])?;

    decode_message(&frame)
}

/// Write a message to a stream without flushing it
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = encode_message(message)?;
    writer.write_all(&frame)?;
    Ok(())
}
