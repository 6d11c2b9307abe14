//! Codec for encoding and decoding Relay frames.
//!
//! Every frame on the wire, client link or hub link, is a 4-byte big-endian
//! length prefix followed by a MessagePack body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Serialize the frame body and check it against the size bound.
fn body(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    Ok(payload)
}

/// Total encoded size of the frame at the front of `data`, if the prefix is present.
fn framed_len(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(Some(LENGTH_PREFIX_SIZE + length))
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = body(frame)?;
    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Decode a single complete frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let total = framed_len(data)?
        .ok_or_else(|| ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()))?;
    if data.len() < total {
        return Err(ProtocolError::Incomplete(total - data.len()));
    }
    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(total) = framed_len(buf)? else {
        return Ok(None);
    };
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(total - LENGTH_PREFIX_SIZE);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}
