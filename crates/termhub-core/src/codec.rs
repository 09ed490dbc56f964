//! Length-prefixed CBOR framing.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`. Each WebSocket
//! binary message carries one or more whole frames.

use crate::error::{HubError, HubResult};
use std::io::Cursor;

/// Largest payload a peer may announce (1 MiB).
pub const MAX_FRAME_LEN: usize = 1_048_576;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn encode_frame<T: serde::Serialize>(value: &T) -> HubResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(HubError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_LEN})",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn decode_payload<T: serde::de::DeserializeOwned>(data: &[u8]) -> HubResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every message completed by them.
    ///
    /// A frame announcing more than [`MAX_FRAME_LEN`] bytes poisons the
    /// stream; the caller is expected to drop the connection.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> HubResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        while self.buffer.len() >= 4 {
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if len > MAX_FRAME_LEN {
                return Err(HubError::InvalidMessage(format!(
                    "announced frame length {len} exceeds {MAX_FRAME_LEN}"
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            messages.push(decode_payload(&self.buffer[4..4 + len])?);
            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
