//! The seam between this crate and the membership transport.
//!
//! A transport maintains the member list, detects failures and moves bytes.
//! It reports what it observes as [`TransportEvent`]s on a channel and calls a
//! [`PingDelegate`] from its probe cycle.

use super::types::Member;
use crate::event::types::MemberEvent;

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_member(&self) -> Member;

    /// Every member the transport knows about, including the local one.
    fn members(&self) -> Vec<Member>;

    /// Estimated number of live members.
    fn num_members(&self) -> usize;

    /// Sends an application message to a single address, wrapped in the
    /// transport's user-message envelope.
    async fn send_to_address(&self, addr: SocketAddr, msg: Vec<u8>) -> Result<()>;

    /// Disseminates an application message to the rest of the cluster.
    async fn broadcast(&self, msg: Vec<u8>) -> Result<()>;
}

/// Hook invoked by the transport's probe cycle.
///
/// Both methods run on the probe path: they must not block and must not fail.
pub trait PingDelegate: Send + Sync + 'static {
    /// Bytes to attach to an outgoing probe ack.
    fn ack_payload(&self) -> Vec<u8>;

    /// Called after a direct probe of `peer` completed in `rtt`, with the
    /// payload the peer attached to its ack.
    fn notify_ping_complete(&self, peer: &Member, rtt: Duration, payload: &[u8]);
}

#[derive(Debug)]
pub enum TransportEvent {
    Member(MemberEvent),
    Message { from: SocketAddr, payload: Vec<u8> },
}
