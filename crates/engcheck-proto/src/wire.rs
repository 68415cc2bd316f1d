// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Packet framing and CBOR helpers.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR `OpEnvelope`
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{Message, OpEnvelope, Value};

/// Protocol magic constant "ENGC".
pub const MAGIC: [u8; 4] = *b"ENGC";
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (set to zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Fixed header length.
pub const HEADER_BYTES: usize = 12;
/// Trailing checksum length.
pub const CHECKSUM_BYTES: usize = 32;
/// Largest payload either side accepts.
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Framing and codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Fewer bytes than the header/length field promise.
    #[error("incomplete packet")]
    Incomplete,
    /// Magic bytes do not match.
    #[error("bad magic")]
    BadMagic,
    /// Version field is not [`VERSION`].
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    /// Payload exceeds [`MAX_PAYLOAD`].
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
    /// Checksum does not cover header||payload.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
    /// Envelope names an op this version does not know.
    #[error("unknown op {0}")]
    UnknownOp(String),
}

/// Encode to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, WireError> {
    Value::serialized(value).map_err(|e| WireError::Encode(e.to_string()))
}

fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, WireError> {
    value
        .deserialized()
        .map_err(|e| WireError::Decode(e.to_string()))
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header (12 bytes).
    pub header: [u8; HEADER_BYTES],
    /// CBOR payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header||payload.
    pub checksum: [u8; CHECKSUM_BYTES],
}

impl Packet {
    /// Build a packet from a CBOR payload.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, WireError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }
        let len = u32::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge(payload.len()))?;
        let mut header = [0u8; HEADER_BYTES];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        header[8..12].copy_from_slice(&len.to_be_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&payload);
        let checksum = *hasher.finalize().as_bytes();

        Ok(Packet {
            header,
            payload,
            checksum,
        })
    }

    /// Concatenate header, payload and checksum.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_BYTES + self.payload.len() + CHECKSUM_BYTES);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }

    /// Encode an `OpEnvelope` into a full packet byte vector.
    pub fn encode_envelope<P: Serialize>(env: &OpEnvelope<P>) -> Result<Vec<u8>, WireError> {
        let payload = to_cbor(env)?;
        Ok(Packet::from_payload(payload)?.into_bytes())
    }

    /// Decode a packet from a byte slice, returning the envelope and bytes consumed.
    pub fn decode_envelope<P: DeserializeOwned>(bytes: &[u8]) -> Result<(OpEnvelope<P>, usize), WireError> {
        let frame_len = frame_len(bytes)?.ok_or(WireError::Incomplete)?;
        if bytes.len() < frame_len {
            return Err(WireError::Incomplete);
        }
        let payload_end = frame_len - CHECKSUM_BYTES;
        let header = &bytes[0..HEADER_BYTES];
        let payload = &bytes[HEADER_BYTES..payload_end];
        let checksum = &bytes[payload_end..frame_len];

        let mut hasher = Hasher::new();
        hasher.update(header);
        hasher.update(payload);
        if hasher.finalize().as_bytes() != checksum {
            return Err(WireError::ChecksumMismatch);
        }

        let env: OpEnvelope<P> = from_cbor(payload)?;
        Ok((env, frame_len))
    }
}

/// Total packet length announced by a buffered header.
///
/// Returns `Ok(None)` while fewer than [`HEADER_BYTES`] are available.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, WireError> {
    if buf.len() < HEADER_BYTES {
        return Ok(None);
    }
    if buf[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = u16::from_be_bytes([buf[4], buf[5]]);
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload_len));
    }
    Ok(Some(HEADER_BYTES + payload_len + CHECKSUM_BYTES))
}

/// Encode a `Message` into a packet with the provided logical timestamp.
pub fn encode_message(msg: &Message, ts: u64) -> Result<Vec<u8>, WireError> {
    let payload = match msg {
        Message::Handshake(p) => to_value(p)?,
        Message::HandshakeAck(p) => to_value(p)?,
        Message::Error(p) => to_value(p)?,
        Message::Subscribe(p) => to_value(p)?,
        Message::RequestSnapshot(p) => to_value(p)?,
        Message::Snapshot(p) => to_value(p)?,
        Message::Event(raw) => raw.clone(),
        Message::Notification(n) => to_value(n)?,
    };
    let env = OpEnvelope {
        op: msg.op_name().to_string(),
        ts,
        payload,
    };
    Packet::encode_envelope(&env)
}

/// Decode bytes into (Message, ts, bytes_consumed).
pub fn decode_message(bytes: &[u8]) -> Result<(Message, u64, usize), WireError> {
    let (env, used) = Packet::decode_envelope::<Value>(bytes)?;
    let p = &env.payload;
    let msg = match env.op.as_str() {
        "handshake" => Message::Handshake(from_value(p)?),
        "handshake_ack" => Message::HandshakeAck(from_value(p)?),
        "error" => Message::Error(from_value(p)?),
        "subscribe" => Message::Subscribe(from_value(p)?),
        "request_snapshot" => Message::RequestSnapshot(from_value(p)?),
        "snapshot" => Message::Snapshot(from_value(p)?),
        "event" => Message::Event(env.payload),
        "notification" => Message::Notification(from_value(p)?),
        other => return Err(WireError::UnknownOp(other.to_string())),
    };
    Ok((msg, env.ts, used))
}
