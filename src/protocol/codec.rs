use serde_json::Value;

use super::error::DriverError;
use super::types::{QueryType, VERSION_V0_4, WIRE_PROTOCOL_JSON};

/// Maximum accepted frame payload (64 MB). A header announcing more than
/// this is treated as a protocol violation instead of being allocated.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Size of the frame header: token (8 bytes) + payload length (4 bytes).
pub const HEADER_SIZE: usize = 12;

/// Handshake success string sent by the server, without the trailing NUL.
pub const HANDSHAKE_SUCCESS: &str = "SUCCESS";

/// Encode a request frame: `token u64 LE | len u32 LE | payload`.
pub fn encode_frame(token: u64, payload: &[u8]) -> Result<Vec<u8>, DriverError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(DriverError::Protocol(format!(
            "frame payload {} bytes exceeds maximum {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&token.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a response frame header into `(token, payload_len)`.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(u64, usize), DriverError> {
    let mut token_bytes = [0u8; 8];
    token_bytes.copy_from_slice(&header[..8]);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[8..]);

    let token = u64::from_le_bytes(token_bytes);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(DriverError::Protocol(format!(
            "frame length {} exceeds maximum {}",
            len, MAX_FRAME_SIZE
        )));
    }
    Ok((token, len))
}

/// Encode a query frame. The payload is the JSON array
/// `[query_type, body, global_opts]`; body and opts are omitted for
/// CONTINUE / STOP / NOREPLY_WAIT frames.
pub fn encode_query(
    token: u64,
    qtype: QueryType,
    body: Option<&Value>,
    opts: Option<&Value>,
) -> Result<Vec<u8>, DriverError> {
    let mut parts = vec![Value::from(qtype as u64)];
    if let Some(body) = body {
        parts.push(body.clone());
        if let Some(opts) = opts {
            parts.push(opts.clone());
        }
    }
    let payload = serde_json::to_vec(&Value::Array(parts))?;
    encode_frame(token, &payload)
}

/// Build the handshake preamble:
/// `magic u32 LE | auth_key_len u32 LE | auth_key | wire_protocol u32 LE`.
pub fn handshake_preamble(auth_key: &str) -> Vec<u8> {
    let key = auth_key.as_bytes();
    let mut buf = Vec::with_capacity(12 + key.len());
    buf.extend_from_slice(&VERSION_V0_4.to_le_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&WIRE_PROTOCOL_JSON.to_le_bytes());
    buf
}
