use crate::error::{DiffuseError, Result};
use crate::protocol::header::{HEADER_SIZE, Header, Lane};
use crate::protocol::message::WireMessage;
use crate::types::PROTOCOL_VERSION;

/// Encode a `WireMessage` into a framed byte buffer: `[header][rkyv payload]`.
pub fn encode_message(msg: &WireMessage, lane: Lane) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| DiffuseError::EncodeFailed(e.to_string()))?;

    if payload.len() > u32::MAX as usize {
        return Err(DiffuseError::EncodeFailed(format!(
            "{} payload too large for framed header: {} bytes exceeds u32::MAX",
            msg.kind(),
            payload.len()
        )));
    }

    let header = Header::new(payload.len() as u32, lane);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a framed byte buffer back into a `(Header, WireMessage)`.
///
/// Rejects frames from a different protocol version.
pub fn decode_message(buf: &[u8]) -> Result<(Header, WireMessage)> {
    if buf.len() < HEADER_SIZE {
        return Err(DiffuseError::DecodeFailed(format!(
            "buffer too short: {} < {HEADER_SIZE}",
            buf.len()
        )));
    }

    let header_bytes: &[u8; HEADER_SIZE] = buf[..HEADER_SIZE]
        .try_into()
        .map_err(|_| DiffuseError::DecodeFailed("header slice length mismatch".into()))?;

    let header = Header::decode(header_bytes)
        .ok_or_else(|| DiffuseError::DecodeFailed("invalid header: unknown lane".into()))?;

    if header.version != PROTOCOL_VERSION {
        return Err(DiffuseError::DecodeFailed(format!(
            "protocol version {} (expected {PROTOCOL_VERSION})",
            header.version
        )));
    }

    let payload_end = HEADER_SIZE + header.payload_length as usize;
    if buf.len() < payload_end {
        return Err(DiffuseError::DecodeFailed(format!(
            "buffer too short for payload: {} < {payload_end}",
            buf.len()
        )));
    }

    let payload = &buf[HEADER_SIZE..payload_end];
    let msg = rkyv::from_bytes::<WireMessage, rkyv::rancor::Error>(payload)
        .map_err(|e| DiffuseError::DecodeFailed(e.to_string()))?;

    Ok((header, msg))
}
