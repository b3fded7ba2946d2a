//! Framed binary codec for IPC messages.
//!
//! Wire format:
//! ```text
//! [version:1][payload_len:4][payload:N]
//! ```
//! The payload is a bincode-encoded [`IpcMessage`]; bincode carries the
//! message discriminant, so the frame header only needs the version and
//! the length. The length is big-endian.

use thiserror::Error;

use crate::protocol::messages::{IpcMessage, HEADER_SIZE, MAX_PAYLOAD, PROTOCOL_VERSION};

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The byte slice is shorter than the declared frame.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The version byte is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The declared payload length exceeds [`MAX_PAYLOAD`].
    #[error("payload length {0} exceeds maximum")]
    PayloadTooLarge(usize),

    /// The payload could not be serialized or deserialized.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Encodes an [`IpcMessage`] into a byte vector including the frame header.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if serialization fails,
/// which only happens for messages whose encoded size exceeds
/// [`MAX_PAYLOAD`].
pub fn encode_frame(msg: &IpcMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        bincode::serialize(msg).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes one [`IpcMessage`] from the beginning of `bytes`.
///
/// Returns the decoded message and the total number of bytes consumed
/// (header + payload), so the caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when `bytes` holds less
/// than one complete frame — the caller should read more and retry.
pub fn decode_frame(bytes: &[u8]) -> Result<(IpcMessage, usize), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let payload_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }

    let total = HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let msg = bincode::deserialize(&bytes[HEADER_SIZE..total])
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    Ok((msg, total))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
