//! Length-prefixed JSON framing.
//!
//! A frame is `[u32 big-endian total length][UTF-8 JSON body]`, where the
//! declared length counts the 4 header bytes too.

use crate::{Operation, Packet};
use thiserror::Error;

pub const HEADER_LEN: usize = 4;

/// Largest frame accepted in either direction.
pub const MAX_PACKET_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("malformed {operation:?} packet: {reason}")]
    Malformed {
        operation: Operation,
        reason: &'static str,
    },
    #[error("declared length {declared} does not match the {actual} bytes received")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("declared length {0} outside the accepted range")]
    InvalidLength(usize),
    #[error("unparsable packet body: {source}")]
    Json {
        /// Operation recovered from the raw body, when the `op` key survived.
        operation: Option<Operation>,
        #[source]
        source: serde_json::Error,
    },
}

impl PacketError {
    /// Operation the failing packet declared, when it is known.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            PacketError::Malformed { operation, .. } => Some(*operation),
            PacketError::Json { operation, .. } => *operation,
            _ => None,
        }
    }

    /// Whether the byte stream can no longer be trusted to stay in sync.
    pub fn breaks_framing(&self) -> bool {
        matches!(
            self,
            PacketError::LengthMismatch { .. } | PacketError::InvalidLength(_)
        )
    }
}

/// Serializes `packet` into a single frame.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, PacketError> {
    let body = serde_json::to_vec(packet).map_err(|source| PacketError::Json {
        operation: Some(packet.operation),
        source,
    })?;
    let total = body.len() + HEADER_LEN;
    if total > MAX_PACKET_LEN {
        return Err(PacketError::InvalidLength(total));
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Rebuilds a packet from the chunks of exactly one frame, in arrival order.
pub fn decode<C: AsRef<[u8]>>(chunks: &[C]) -> Result<Packet, PacketError> {
    let frame: Vec<u8> = chunks
        .iter()
        .flat_map(|chunk| chunk.as_ref().iter().copied())
        .collect();
    decode_frame(&frame)
}

/// Single-buffer variant of [`decode`], used for UDP datagrams.
pub fn decode_frame(frame: &[u8]) -> Result<Packet, PacketError> {
    if frame.len() < HEADER_LEN {
        return Err(PacketError::LengthMismatch {
            declared: HEADER_LEN,
            actual: frame.len(),
        });
    }

    let declared = declared_length(&frame[..HEADER_LEN]);
    if declared != frame.len() {
        return Err(PacketError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }

    let body = &frame[HEADER_LEN..];
    serde_json::from_slice(body).map_err(|source| PacketError::Json {
        operation: recover_operation(body),
        source,
    })
}

/// Reads the declared total length from a 4-byte header.
pub(crate) fn declared_length(header: &[u8]) -> usize {
    let mut bytes = [0u8; HEADER_LEN];
    bytes.copy_from_slice(&header[..HEADER_LEN]);
    u32::from_be_bytes(bytes) as usize
}

fn recover_operation(body: &[u8]) -> Option<Operation> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    serde_json::from_value(value.get("op")?.clone()).ok()
}
