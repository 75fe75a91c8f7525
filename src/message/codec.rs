//! Framing of application messages.
//!
//! Layout: `[message type byte][bincode body]`. Relayed messages nest a full
//! message behind a header: `[Relay][bincode RelayHeader][type][body]`.

use super::types::{MessageType, RelayHeader};
use crate::error::ProtocolError;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;

pub fn encode_message<T: Serialize>(kind: MessageType, msg: &T) -> Result<Vec<u8>, bincode::Error> {
    let mut buf = vec![kind as u8];
    bincode::serialize_into(&mut buf, msg)?;
    Ok(buf)
}

/// Splits the type byte off a raw message.
pub fn split_message(buf: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
    let (&kind, body) = buf.split_first().ok_or(ProtocolError::EmptyMessage)?;
    Ok((MessageType::try_from(kind)?, body))
}

pub fn decode_message<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(body)?)
}

pub fn encode_relay_message<T: Serialize>(
    kind: MessageType,
    dest: SocketAddr,
    msg: &T,
) -> Result<Vec<u8>, bincode::Error> {
    let mut buf = vec![MessageType::Relay as u8];
    bincode::serialize_into(&mut buf, &RelayHeader { dest })?;
    buf.push(kind as u8);
    bincode::serialize_into(&mut buf, msg)?;
    Ok(buf)
}

/// Decodes the relay header and returns it with the untouched inner message.
pub fn decode_relay(body: &[u8]) -> Result<(RelayHeader, &[u8]), ProtocolError> {
    let mut rest = body;
    let header: RelayHeader = bincode::deserialize_from(&mut rest)?;
    Ok((header, rest))
}
