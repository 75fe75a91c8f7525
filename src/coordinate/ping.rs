//! Coordinate exchange piggybacked on probe acks.
//!
//! Ack payload layout: `[PING_VERSION][bincode Coordinate]`, or empty when
//! coordinates are disabled. An empty payload from a peer simply means it
//! has nothing to share.

use super::client::CoordinateClient;
use super::types::Coordinate;
use crate::error::ProtocolError;
use crate::membership::transport::PingDelegate;
use crate::membership::types::Member;

use std::sync::Arc;
use std::time::Duration;

pub const PING_VERSION: u8 = 1;

pub struct CoordinateDelegate {
    enabled: bool,
    client: Arc<CoordinateClient>,
}

impl CoordinateDelegate {
    pub fn new(client: Arc<CoordinateClient>, enabled: bool) -> Self {
        Self { enabled, client }
    }

    pub fn client(&self) -> &Arc<CoordinateClient> {
        &self.client
    }
}

/// Builds an ack payload carrying `coord`.
pub fn encode_ping_payload(coord: &Coordinate) -> Result<Vec<u8>, bincode::Error> {
    let mut buf = vec![PING_VERSION];
    bincode::serialize_into(&mut buf, coord)?;
    Ok(buf)
}

/// Returns `None` for an empty payload.
pub fn decode_ping_payload(payload: &[u8]) -> Result<Option<Coordinate>, ProtocolError> {
    let Some((&version, body)) = payload.split_first() else {
        return Ok(None);
    };
    if version != PING_VERSION {
        return Err(ProtocolError::UnsupportedPingVersion(version));
    }
    Ok(Some(bincode::deserialize(body)?))
}

impl PingDelegate for CoordinateDelegate {
    fn ack_payload(&self) -> Vec<u8> {
        if !self.enabled {
            return Vec::new();
        }

        match encode_ping_payload(&self.client.get_coordinate()) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::error!("Failed to encode coordinate: {}", e);
                Vec::new()
            }
        }
    }

    fn notify_ping_complete(&self, peer: &Member, rtt: Duration, payload: &[u8]) {
        if !self.enabled {
            return;
        }

        let coord = match decode_ping_payload(payload) {
            Ok(Some(coord)) => coord,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Ignoring ping payload from {}: {}", peer.name, e);
                return;
            }
        };

        match self.client.update(&peer.name, &coord, rtt) {
            Ok(local) => {
                tracing::trace!(
                    "Coordinate updated from {} (rtt={:?}, error={:.3})",
                    peer.name,
                    rtt,
                    local.error
                );
            }
            Err(e) => {
                tracing::warn!("Rejected coordinate from {}: {}", peer.name, e);
            }
        }
    }
}
