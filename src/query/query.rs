//! A query as seen by a responding node.
//!
//! Every node that accepts an inbound query hands the application a [`Query`].
//! The application answers it at most once with [`Query::respond`]. Callers
//! of one query take turns on a per-query lock held across the send, so a
//! failed attempt is visible to the next caller instead of reported as sent.
//! The state itself is an atomic and can be read without the lock.

use crate::clock::LamportTime;
use crate::error::QueryError;
use crate::membership::transport::Transport;
use crate::membership::types::{Member, MemberStatus};
use crate::message::codec::{encode_message, encode_relay_message};
use crate::message::types::{MessageQueryResponse, MessageType};

use rand::seq::SliceRandom;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Mutex;
use tokio::time::Instant;

const STATE_ACTIVE: u8 = 0;
const STATE_RESPONDED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

/// Public view of a query's response state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Active,
    Responded,
    Expired,
}

/// What a responder needs to reach the query's origin.
pub(crate) struct ResponderContext {
    pub local_name: String,
    pub response_size_limit: usize,
    pub transport: Arc<dyn Transport>,
}

#[derive(Clone)]
pub struct Query {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,

    id: u32,
    origin: SocketAddr,
    source_node: String,
    deadline: Instant,
    relay_factor: u8,

    state: Arc<AtomicU8>,
    /// Serializes responders of this query only.
    respond_lock: Arc<Mutex<()>>,
    ctx: Arc<ResponderContext>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("ltime", &self.ltime)
            .field("name", &self.name)
            .field("id", &self.id)
            .field("source_node", &self.source_node)
            .field("origin", &self.origin)
            .field("relay_factor", &self.relay_factor)
            .field("state", &self.state())
            .finish()
    }
}

impl Query {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ltime: LamportTime,
        id: u32,
        name: String,
        payload: Vec<u8>,
        origin: SocketAddr,
        source_node: String,
        deadline: Instant,
        relay_factor: u8,
        ctx: Arc<ResponderContext>,
    ) -> Self {
        Self {
            ltime,
            name,
            payload,
            id,
            origin,
            source_node,
            deadline,
            relay_factor,
            state: Arc::new(AtomicU8::new(STATE_ACTIVE)),
            respond_lock: Arc::new(Mutex::new(())),
            ctx,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name of the node that issued the query.
    pub fn source_node(&self) -> &str {
        &self.source_node
    }

    pub fn origin(&self) -> SocketAddr {
        self.origin
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn relay_factor(&self) -> u8 {
        self.relay_factor
    }

    pub fn state(&self) -> QueryState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RESPONDED => QueryState::Responded,
            STATE_EXPIRED => QueryState::Expired,
            STATE_ACTIVE if Instant::now() >= self.deadline => QueryState::Expired,
            _ => QueryState::Active,
        }
    }

    /// Sends `payload` back to the query's origin.
    ///
    /// Succeeds at most once per query. A failed send leaves the query
    /// answerable, so the caller may try again before the deadline.
    ///
    /// Concurrent callers wait for the one in flight; they only see
    /// `AlreadyResponded` once a response actually went out.
    pub async fn respond(&self, payload: Vec<u8>) -> Result<(), QueryError> {
        let _turn = self.respond_lock.lock().await;
        self.check_active()?;

        self.send_response(payload).await?;
        self.state.store(STATE_RESPONDED, Ordering::SeqCst);
        Ok(())
    }

    fn check_active(&self) -> Result<(), QueryError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_RESPONDED => return Err(QueryError::AlreadyResponded),
            STATE_EXPIRED => return Err(QueryError::DeadlineExceeded),
            _ => {}
        }

        if Instant::now() >= self.deadline {
            self.state.store(STATE_EXPIRED, Ordering::SeqCst);
            return Err(QueryError::DeadlineExceeded);
        }
        Ok(())
    }

    async fn send_response(&self, payload: Vec<u8>) -> Result<(), QueryError> {
        let resp = MessageQueryResponse {
            ltime: self.ltime,
            id: self.id,
            from: self.ctx.local_name.clone(),
            flags: 0,
            payload,
        };

        let raw = encode_message(MessageType::QueryResponse, &resp)?;
        let limit = self.ctx.response_size_limit;
        if raw.len() > limit {
            return Err(QueryError::ResponseTooLarge {
                size: raw.len(),
                limit,
            });
        }

        let direct = self.ctx.transport.send_to_address(self.origin, raw).await;

        spawn_relay(
            self.ctx.clone(),
            self.relay_factor,
            self.origin,
            self.source_node.clone(),
            resp,
        );

        direct.map_err(QueryError::Transport)
    }
}

/// Starts relaying `resp` in the background. Does nothing for a zero factor.
pub(crate) fn spawn_relay(
    ctx: Arc<ResponderContext>,
    relay_factor: u8,
    origin: SocketAddr,
    origin_name: String,
    resp: MessageQueryResponse,
) {
    if relay_factor == 0 {
        return;
    }
    tokio::spawn(async move {
        relay_response(&ctx, relay_factor, origin, &origin_name, &resp).await;
    });
}

/// Forwards `resp` to the origin through up to `relay_factor` random members.
///
/// Best effort: failures are logged and never surfaced.
async fn relay_response(
    ctx: &ResponderContext,
    relay_factor: u8,
    origin: SocketAddr,
    origin_name: &str,
    resp: &MessageQueryResponse,
) {
    let raw = match encode_relay_message(MessageType::QueryResponse, origin, resp) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!("Failed to encode relay message: {}", e);
            return;
        }
    };
    if raw.len() > ctx.response_size_limit {
        tracing::warn!(
            "Relayed response of {} bytes exceeds limit of {} bytes, not relaying",
            raw.len(),
            ctx.response_size_limit
        );
        return;
    }

    let peers = relay_peers(
        ctx.transport.members(),
        &ctx.local_name,
        origin_name,
        relay_factor as usize,
    );
    if peers.len() < relay_factor as usize {
        tracing::debug!(
            "Only {} relay peers available for factor {}",
            peers.len(),
            relay_factor
        );
    }

    for peer in peers {
        let addr = peer.socket_addr();
        if let Err(e) = ctx.transport.send_to_address(addr, raw.clone()).await {
            tracing::warn!("Failed to relay response via {}: {}", peer.name, e);
        }
    }
}

/// Uniform random sample without replacement of live members, excluding the
/// local node and the query's origin.
pub(crate) fn relay_peers(
    members: Vec<Member>,
    local_name: &str,
    origin_name: &str,
    count: usize,
) -> Vec<Member> {
    let candidates: Vec<Member> = members
        .into_iter()
        .filter(|m| m.status == MemberStatus::Alive)
        .filter(|m| m.name != local_name && m.name != origin_name)
        .collect();

    candidates
        .choose_multiple(&mut rand::thread_rng(), count)
        .cloned()
        .collect()
}
