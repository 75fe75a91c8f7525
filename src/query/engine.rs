//! Query Engine
//!
//! Issues queries to the cluster and routes everything that comes back.
//!
//! ## Responsibilities
//! - **Issuing**: Stamps a query with the query clock and a fresh id, registers
//!   it as outstanding, processes it locally and broadcasts it.
//! - **Sweeping**: A timer per query closes and evicts it at its deadline.
//! - **Inbound queries**: Suppresses old and duplicate queries, applies the
//!   filters, acknowledges when asked and hands the query to the application.
//! - **Inbound responses**: Matches acks and responses to outstanding queries,
//!   dropping duplicates and late arrivals.

use super::query::{Query, ResponderContext, spawn_relay};
use super::response::{Delivery, NodeResponse, PendingQuery, QueryResponse};
use crate::clock::{Admission, LamportBuffer, LamportClock};
use crate::config::ClusterConfig;
use crate::error::QueryError;
use crate::event::coalesce::deliver;
use crate::event::types::Event;
use crate::membership::transport::Transport;
use crate::message::codec::encode_message;
use crate::message::types::{
    MessageQuery, MessageQueryResponse, MessageType, QUERY_FLAG_ACK, QueryFilter, QueryParam,
};

use dashmap::DashMap;
use regex::Regex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Floor for the per-query response channel capacity.
const MIN_RESPONSE_CAPACITY: usize = 64;

/// Outstanding queries keyed by (origin name, query id).
type PendingTable = DashMap<(String, u32), Arc<PendingQuery>>;

pub struct QueryEngine {
    config: ClusterConfig,
    clock: LamportClock,
    next_id: AtomicU32,
    transport: Arc<dyn Transport>,
    ctx: Arc<ResponderContext>,
    outstanding: Arc<PendingTable>,
    /// Recently seen (origin, id) pairs.
    buffer: Mutex<LamportBuffer<(String, u32)>>,
    /// Where accepted inbound queries go.
    events: mpsc::Sender<Event>,
}

impl QueryEngine {
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let ctx = Arc::new(ResponderContext {
            local_name: config.node_name.clone(),
            response_size_limit: config.query_response_size_limit,
            transport: transport.clone(),
        });

        Self {
            buffer: Mutex::new(LamportBuffer::new(config.query_buffer_size)),
            config,
            clock: LamportClock::new(),
            next_id: AtomicU32::new(0),
            transport,
            ctx,
            outstanding: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Number of queries still waiting for their deadline.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Parameters used when the caller has no preference.
    pub fn default_params(&self) -> QueryParam {
        QueryParam {
            relay_factor: self.config.default_relay_factor,
            timeout: Some(
                self.config
                    .default_query_timeout(self.transport.num_members()),
            ),
            ..QueryParam::default()
        }
    }

    /// Broadcasts a query and returns the handle collecting its answers.
    pub async fn issue_query(
        &self,
        name: &str,
        payload: Vec<u8>,
        params: QueryParam,
    ) -> Result<QueryResponse, QueryError> {
        let local = self.transport.local_member();
        let timeout = params
            .timeout
            .unwrap_or_else(|| self.config.default_query_timeout(self.transport.num_members()));

        let query = MessageQuery {
            ltime: self.clock.increment(),
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            addr: local.addr,
            port: local.port,
            source_node: self.config.node_name.clone(),
            filters: params.filters(),
            flags: params.flags(),
            relay_factor: params.relay_factor,
            timeout,
            name: name.to_string(),
            payload,
        };

        let raw = encode_message(MessageType::Query, &query)?;
        let limit = self.config.query_size_limit;
        if raw.len() > limit {
            return Err(QueryError::QueryTooLarge {
                size: raw.len(),
                limit,
            });
        }

        let deadline = Instant::now() + timeout;
        let (handle, pending) = QueryResponse::new(
            query.id,
            query.ltime,
            deadline,
            params.request_ack,
            self.transport.num_members().max(MIN_RESPONSE_CAPACITY),
        );
        let key = (self.config.node_name.clone(), query.id);
        self.register(key.clone(), pending);

        tracing::debug!(
            "Issuing query '{}' (id={}, ltime={}, timeout={:?})",
            query.name,
            query.id,
            query.ltime,
            timeout
        );

        // The local node is a member too
        self.handle_query(query).await;

        if let Err(e) = self.transport.broadcast(raw).await {
            if let Some((_, pending)) = self.outstanding.remove(&key) {
                pending.close();
            }
            return Err(QueryError::Transport(e));
        }

        Ok(handle)
    }

    fn register(&self, key: (String, u32), pending: Arc<PendingQuery>) {
        let deadline = pending.deadline;
        self.outstanding.insert(key.clone(), pending);

        let outstanding = self.outstanding.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some((_, pending)) = outstanding.remove(&key) {
                pending.close();
                tracing::debug!("Query {} expired", key.1);
            }
        });
    }

    /// Processes a query received from the cluster.
    ///
    /// Returns false when the query was already seen or is too old.
    pub async fn handle_query(&self, query: MessageQuery) -> bool {
        self.clock.witness(query.ltime);

        let admission = {
            let mut buffer = self
                .buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            buffer.admit(
                self.clock.time(),
                query.ltime,
                (query.source_node.clone(), query.id),
            )
        };
        match admission {
            Admission::New => {}
            Admission::Duplicate => {
                tracing::trace!(
                    "Duplicate query {} from {}",
                    query.id,
                    query.source_node
                );
                return false;
            }
            Admission::TooOld => {
                tracing::debug!(
                    "Ignoring old query '{}' (ltime={}, now={})",
                    query.name,
                    query.ltime,
                    self.clock.time()
                );
                return false;
            }
        }

        if !self.should_process(&query.filters) {
            tracing::trace!("Query '{}' filtered out", query.name);
            return true;
        }

        if query.ack() {
            self.send_ack(&query).await;
        }

        let origin = query.origin();
        let event = Event::Query(Query::new(
            query.ltime,
            query.id,
            query.name,
            query.payload,
            origin,
            query.source_node,
            Instant::now() + query.timeout,
            query.relay_factor,
            self.ctx.clone(),
        ));
        deliver(&self.events, event);
        true
    }

    async fn send_ack(&self, query: &MessageQuery) {
        let ack = MessageQueryResponse {
            ltime: query.ltime,
            id: query.id,
            from: self.config.node_name.clone(),
            flags: QUERY_FLAG_ACK,
            payload: Vec::new(),
        };

        match encode_message(MessageType::QueryResponse, &ack) {
            Ok(raw) => {
                if let Err(e) = self.transport.send_to_address(query.origin(), raw).await {
                    tracing::warn!("Failed to send ack to {}: {}", query.source_node, e);
                }
            }
            Err(e) => {
                tracing::error!("Failed to encode ack: {}", e);
                return;
            }
        }

        spawn_relay(
            self.ctx.clone(),
            query.relay_factor,
            query.origin(),
            query.source_node.clone(),
            ack,
        );
    }

    fn should_process(&self, filters: &[QueryFilter]) -> bool {
        if filters.is_empty() {
            return true;
        }

        let local = self.transport.local_member();
        filters.iter().all(|filter| match filter {
            QueryFilter::Nodes(names) => names.iter().any(|n| *n == self.config.node_name),
            QueryFilter::Tag { tag, expr } => {
                let value = local.tags.get(tag).map(String::as_str).unwrap_or("");
                match Regex::new(expr) {
                    Ok(re) => re.is_match(value),
                    Err(e) => {
                        tracing::warn!("Invalid tag filter '{}': {}", expr, e);
                        false
                    }
                }
            }
        })
    }

    /// Routes an ack or response to the query it answers.
    pub fn handle_query_response(&self, resp: MessageQueryResponse) {
        let key = (self.config.node_name.clone(), resp.id);
        let Some(pending) = self.outstanding.get(&key).map(|p| p.value().clone()) else {
            tracing::debug!(
                "Response from {} for unknown or expired query {}",
                resp.from,
                resp.id
            );
            return;
        };

        if pending.ltime != resp.ltime {
            tracing::warn!(
                "Response from {} for query {} has ltime {}, expected {}",
                resp.from,
                resp.id,
                resp.ltime,
                pending.ltime
            );
            return;
        }

        let delivery = if resp.ack() {
            pending.deliver_ack(&resp.from)
        } else {
            pending.deliver_response(NodeResponse {
                from: resp.from.clone(),
                payload: resp.payload,
            })
        };

        match delivery {
            Delivery::Delivered | Delivery::Duplicate => {}
            Delivery::Finished => {
                tracing::debug!("Late response from {} for query {}", resp.from, resp.id);
            }
            Delivery::Dropped => {
                tracing::warn!(
                    "Response channel full, dropping response from {}",
                    resp.from
                );
            }
        }
    }
}
