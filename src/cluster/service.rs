use crate::clock::{Admission, LamportBuffer, LamportClock};
use crate::config::ClusterConfig;
use crate::coordinate::{Coordinate, CoordinateClient};
use crate::error::{ProtocolError, QueryError, UserEventError};
use crate::event::coalesce::{coalesced_event_channel, deliver};
use crate::event::member::MemberEventCoalescer;
use crate::event::types::{Event, MemberEvent, MemberEventType, UserEvent};
use crate::event::user::UserEventCoalescer;
use crate::membership::transport::{Transport, TransportEvent};
use crate::membership::types::Member;
use crate::message::codec::{decode_message, decode_relay, encode_message, split_message};
use crate::message::types::{
    MessageQuery, MessageQueryResponse, MessageType, MessageUserEvent, QueryParam,
};
use crate::query::{QueryEngine, QueryResponse};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A node's view of the cluster above the membership transport.
///
/// Owns the event pipeline (member coalescer, then user event coalescer, then
/// the application channel), the query engine and the user event clock.
pub struct Cluster {
    config: ClusterConfig,
    transport: Arc<dyn Transport>,
    queries: QueryEngine,
    coordinates: Option<Arc<CoordinateClient>>,

    event_clock: LamportClock,
    /// Recently seen (name, payload) pairs.
    event_buffer: Mutex<LamportBuffer<(String, Vec<u8>)>>,

    /// Input of the event pipeline.
    ingest: mpsc::Sender<Event>,

    shutdown: watch::Sender<bool>,
    user_stage_shutdown: watch::Sender<bool>,
    member_stage: Mutex<Option<JoinHandle<()>>>,
    user_stage: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Builds the event pipeline and returns the application's end of it.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        coordinates: Option<Arc<CoordinateClient>>,
    ) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (out_tx, out_rx) = mpsc::channel(config.event_queue_size.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (user_stage_shutdown, user_shutdown_rx) = watch::channel(false);

        let (user_in, user_stage) = coalesced_event_channel(
            out_tx,
            user_shutdown_rx,
            config.user_coalesce_period,
            config.user_quiescent_period,
            config.ingest_queue_size.max(1),
            UserEventCoalescer::new(),
        );
        let (ingest, member_stage) = coalesced_event_channel(
            user_in,
            shutdown_rx,
            config.coalesce_period,
            config.quiescent_period,
            config.ingest_queue_size.max(1),
            MemberEventCoalescer::new(),
        );

        let queries = QueryEngine::new(config.clone(), transport.clone(), ingest.clone());

        tracing::info!("Cluster layer started for node {}", config.node_name);

        let cluster = Arc::new(Self {
            event_buffer: Mutex::new(LamportBuffer::new(config.event_buffer_size)),
            config,
            transport,
            queries,
            coordinates,
            event_clock: LamportClock::new(),
            ingest,
            shutdown,
            user_stage_shutdown,
            member_stage: Mutex::new(Some(member_stage)),
            user_stage: Mutex::new(Some(user_stage)),
            pump: Mutex::new(None),
        });

        (cluster, out_rx)
    }

    /// Starts consuming the transport's event stream.
    pub fn start(self: &Arc<Self>, events: mpsc::Receiver<TransportEvent>) {
        let cluster = self.clone();
        let handle = tokio::spawn(async move {
            cluster.run(events).await;
        });
        *lock(&self.pump) = Some(handle);
    }

    async fn run(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(TransportEvent::Member(event)) => self.handle_member_event(event),
                    Some(TransportEvent::Message { from, payload }) => {
                        if let Err(e) = self.handle_message(from, &payload).await {
                            tracing::warn!("Dropping message from {}: {}", from, e);
                        }
                    }
                    None => break,
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Transport event pump stopped");
    }

    /// Hands a member change from the transport to the coalescer.
    pub fn handle_member_event(&self, event: MemberEvent) {
        if let Some(client) = &self.coordinates
            && matches!(event.kind, MemberEventType::Leave | MemberEventType::Reap)
        {
            for member in &event.members {
                client.forget_node(&member.name);
            }
        }

        deliver(&self.ingest, Event::Member(event));
    }

    /// Dispatches one application message by its type byte.
    pub async fn handle_message(&self, from: SocketAddr, buf: &[u8]) -> Result<(), ProtocolError> {
        let (kind, body) = split_message(buf)?;

        match kind {
            MessageType::Query => {
                let query: MessageQuery = decode_message(body)?;
                tracing::debug!("Query '{}' from {}", query.name, query.source_node);
                self.queries.handle_query(query).await;
            }
            MessageType::QueryResponse => {
                let resp: MessageQueryResponse = decode_message(body)?;
                self.queries.handle_query_response(resp);
            }
            MessageType::UserEvent => {
                let event: MessageUserEvent = decode_message(body)?;
                self.handle_user_event(event);
            }
            MessageType::Relay => {
                let (header, inner) = decode_relay(body)?;
                tracing::trace!("Relaying message from {} to {}", from, header.dest);
                if let Err(e) = self
                    .transport
                    .send_to_address(header.dest, inner.to_vec())
                    .await
                {
                    tracing::warn!("Failed to relay message to {}: {}", header.dest, e);
                }
            }
            MessageType::Join | MessageType::Leave => {
                // Membership intents are the transport's business
                tracing::trace!("Ignoring {:?} message from {}", kind, from);
            }
        }
        Ok(())
    }

    /// Broadcasts a user event to the cluster, the local node included.
    pub async fn user_event(
        &self,
        name: &str,
        payload: Vec<u8>,
        coalesce: bool,
    ) -> Result<(), UserEventError> {
        let msg = MessageUserEvent {
            ltime: self.event_clock.increment(),
            name: name.to_string(),
            payload,
            coalesce,
        };

        let raw = encode_message(MessageType::UserEvent, &msg)?;
        let limit = self.config.user_event_size_limit;
        if raw.len() > limit {
            return Err(UserEventError::TooLarge {
                size: raw.len(),
                limit,
            });
        }

        self.handle_user_event(msg);
        self.transport
            .broadcast(raw)
            .await
            .map_err(UserEventError::Transport)
    }

    /// Processes a user event. Returns false when it was already seen or is too old.
    pub fn handle_user_event(&self, msg: MessageUserEvent) -> bool {
        self.event_clock.witness(msg.ltime);

        let admission = {
            let mut buffer = lock(&self.event_buffer);
            buffer.admit(
                self.event_clock.time(),
                msg.ltime,
                (msg.name.clone(), msg.payload.clone()),
            )
        };
        match admission {
            Admission::New => {}
            Admission::Duplicate => return false,
            Admission::TooOld => {
                tracing::debug!(
                    "Ignoring old user event '{}' (ltime={}, now={})",
                    msg.name,
                    msg.ltime,
                    self.event_clock.time()
                );
                return false;
            }
        }

        deliver(
            &self.ingest,
            Event::User(UserEvent {
                ltime: msg.ltime,
                name: msg.name,
                payload: msg.payload,
                coalesce: msg.coalesce,
            }),
        );
        true
    }

    pub async fn query(
        &self,
        name: &str,
        payload: Vec<u8>,
        params: QueryParam,
    ) -> Result<QueryResponse, QueryError> {
        self.queries.issue_query(name, payload, params).await
    }

    pub fn default_query_params(&self) -> QueryParam {
        self.queries.default_params()
    }

    pub fn default_query_timeout(&self) -> Duration {
        self.config
            .default_query_timeout(self.transport.num_members())
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.queries
    }

    pub fn event_clock(&self) -> &LamportClock {
        &self.event_clock
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn local_member(&self) -> Member {
        self.transport.local_member()
    }

    pub fn members(&self) -> Vec<Member> {
        self.transport.members()
    }

    pub fn num_members(&self) -> usize {
        self.transport.num_members()
    }

    /// The local network coordinate, when coordinates are enabled.
    pub fn coordinate(&self) -> Option<Coordinate> {
        self.coordinates.as_ref().map(|c| c.get_coordinate())
    }

    pub fn cached_coordinate(&self, node: &str) -> Option<Coordinate> {
        self.coordinates.as_ref()?.cached_coordinate(node)
    }

    /// Estimated round trip time to `node` from the coordinate cache.
    pub fn estimate_rtt(&self, node: &str) -> Option<Duration> {
        self.coordinates.as_ref()?.estimate_rtt(node)
    }

    /// Stops the pump and drains the event pipeline.
    ///
    /// Outstanding queries are left to run into their deadlines.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down cluster layer for {}", self.config.node_name);

        let _ = self.shutdown.send(true);
        for slot in [&self.pump, &self.member_stage] {
            let handle = lock(slot).take();
            if let Some(handle) = handle
                && let Err(e) = handle.await
            {
                tracing::error!("Cluster task failed: {}", e);
            }
        }

        // The member stage has flushed into the user stage by now
        let _ = self.user_stage_shutdown.send(true);
        let handle = lock(&self.user_stage).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!("User event stage failed: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
