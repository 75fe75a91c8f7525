use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::transport::{PingDelegate, Transport, TransportEvent};
use super::types::{GossipMessage, Member, NodeRecord, NodeState};
use crate::event::types::{MemberEvent, MemberEventType};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const REAP_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const EVENT_QUEUE_SIZE: usize = 1024;

struct PendingProbe {
    name: String,
    sent_at: Instant,
}

/// Reference UDP gossip transport.
///
/// Probes a random live member every gossip interval, exchanges member lists
/// on acks and walks silent members through Suspect, Dead and finally out of
/// the list. Application messages ride in [`GossipMessage::User`].
pub struct MembershipService {
    local_name: String,
    pub members: Arc<DashMap<String, NodeRecord>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    probe_seq: AtomicU32,
    pending_probes: DashMap<u32, PendingProbe>,
    delegate: Option<Arc<dyn PingDelegate>>,
    events: mpsc::Sender<TransportEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipService {
    /// Binds the gossip socket and announces the node to the seeds.
    ///
    /// The bound address is advertised to peers as-is.
    pub async fn new(
        name: impl Into<String>,
        bind_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
        tags: HashMap<String, String>,
        delegate: Option<Arc<dyn PingDelegate>>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>)> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;

        let local = NodeRecord::new(Member::new(name, local_addr).with_tags(tags), 1);
        let local_name = local.name().to_string();

        let members = Arc::new(DashMap::new());
        members.insert(local_name.clone(), local.clone());

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            let encoded = bincode::serialize(&GossipMessage::Join { node: local })?;
            for seed_node in seed_nodes.iter() {
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        let (events, rx) = mpsc::channel(EVENT_QUEUE_SIZE);

        let service = Arc::new(Self {
            local_name,
            members,
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            probe_seq: AtomicU32::new(0),
            pending_probes: DashMap::new(),
            delegate,
            events,
            tasks: Mutex::new(Vec::new()),
        });

        Ok((service, rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        let gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        self.lock_tasks()
            .extend([gossip_handle, receive_handle, failure_detection_handle]);

        tracing::info!("All background tasks started");
    }

    /// Aborts the background loops.
    pub fn stop(&self) {
        for handle in self.lock_tasks().drain(..) {
            handle.abort();
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_alive_members(&self) -> Vec<NodeRecord> {
        self.members
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Moves the local incarnation past both itself and `seen`, saturating.
    fn next_incarnation(&self, seen: u64) -> u64 {
        let next = |cur: u64| cur.max(seen).saturating_add(1);
        let prev = self
            .incarnation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(next(cur)))
            .unwrap_or_else(|prev| prev);
        next(prev)
    }

    fn local_record(&self) -> NodeRecord {
        let mut record = match self.members.get(&self.local_name) {
            Some(entry) => entry.value().clone(),
            None => NodeRecord::new(
                Member::new(self.local_name.clone(), self.socket_addr()),
                self.incarnation(),
            ),
        };
        record.incarnation = self.incarnation();
        record
    }

    fn socket_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Replaces the local tags and spreads them with a new incarnation.
    pub async fn set_tags(&self, tags: HashMap<String, String>) {
        let incarnation = self.next_incarnation(0);
        if let Some(mut local) = self.members.get_mut(&self.local_name) {
            local.member.tags = tags;
            local.incarnation = incarnation;
        }

        let msg = GossipMessage::Alive {
            node: self.local_record(),
        };
        self.broadcast_message(msg).await;
    }

    /// Announces a graceful departure.
    pub async fn leave(&self) {
        let incarnation = self.next_incarnation(0);
        if let Some(mut local) = self.members.get_mut(&self.local_name) {
            local.state = NodeState::Left;
            local.incarnation = incarnation;
        }

        info!("Leaving cluster (inc={})", incarnation);
        let msg = GossipMessage::Leave {
            name: self.local_name.clone(),
            incarnation,
        };
        self.broadcast_message(msg).await;
    }

    fn notify(&self, kind: MemberEventType, member: Member) {
        let event = MemberEvent::new(kind, vec![member]);
        if let Err(e) = self.events.try_send(TransportEvent::Member(event)) {
            tracing::warn!("Dropped member event: {}", e);
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<NodeRecord> = self
                .members
                .iter()
                .filter(|entry| entry.value().name() != self.local_name && entry.value().is_alive())
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            let target = {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..alive_members.len());
                alive_members[idx].clone()
            };

            let seq = self.probe_seq.fetch_add(1, Ordering::SeqCst);
            let msg = GossipMessage::Ping {
                seq,
                node: self.local_record(),
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    self.pending_probes.insert(
                        seq,
                        PendingProbe {
                            name: target.name().to_string(),
                            sent_at: Instant::now(),
                        },
                    );
                    let addr = target.member.socket_addr();
                    if let Err(e) = self.socket.send_to(&encoded, addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.name(), e);
                    } else {
                        tracing::debug!("Sent ping {} to {}", seq, target.name());
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize GossipMessage::Ping: {}", e);
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub(crate) async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { seq, node } => {
                self.handle_ping(seq, node, src).await?;
            }

            GossipMessage::Ack {
                seq,
                node,
                members,
                payload,
            } => {
                self.handle_ack(seq, node, members, payload).await;
            }

            GossipMessage::Join { node } => {
                self.handle_join(node, src).await?;
            }

            GossipMessage::Suspect { name, incarnation } => {
                self.handle_suspect(name, incarnation).await;
            }

            GossipMessage::Alive { node } => {
                self.merge_member(node).await;
            }

            GossipMessage::Leave { name, incarnation } => {
                self.handle_leave(name, incarnation);
            }

            GossipMessage::User { payload } => {
                let event = TransportEvent::Message { from: src, payload };
                if let Err(e) = self.events.try_send(event) {
                    tracing::warn!("Dropped message from {}: {}", src, e);
                }
            }
        }

        Ok(())
    }

    async fn handle_ping(&self, seq: u32, node: NodeRecord, src: SocketAddr) -> Result<()> {
        tracing::debug!("Received ping {} from {}", seq, node.name());

        let name = node.name().to_string();
        self.merge_member(node).await;
        self.touch(&name);

        let all_members: Vec<NodeRecord> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let payload = self
            .delegate
            .as_ref()
            .map(|d| d.ack_payload())
            .unwrap_or_default();

        let reply = GossipMessage::Ack {
            seq,
            node: self.local_record(),
            members: all_members,
            payload,
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        tracing::debug!("Sent ack {} to {} with {} members", seq, name, self.members.len());

        Ok(())
    }

    async fn handle_ack(
        &self,
        seq: u32,
        node: NodeRecord,
        members: Vec<NodeRecord>,
        payload: Vec<u8>,
    ) {
        tracing::debug!(
            "Received ack {} from {} (inc={}) with {} members",
            seq,
            node.name(),
            node.incarnation,
            members.len()
        );

        if let Some((_, probe)) = self.pending_probes.remove(&seq)
            && probe.name == node.name()
        {
            let rtt = probe.sent_at.elapsed();
            if let Some(delegate) = &self.delegate {
                delegate.notify_ping_complete(&node.to_member(), rtt, &payload);
            }
        }

        let name = node.name().to_string();
        self.merge_member(node).await;
        self.touch(&name);

        for member in members {
            self.merge_member(member).await;
        }
    }

    /// Records direct contact with a node.
    fn touch(&self, name: &str) {
        if let Some(mut existing) = self.members.get_mut(name) {
            existing.last_seen = Some(Instant::now());
            if existing.state == NodeState::Suspect {
                tracing::info!("Node {} answered, no longer suspected", name);
                existing.state = NodeState::Alive;
            }
        }
    }

    /// Folds a record learned from the network into the member list.
    pub(crate) async fn merge_member(&self, mut record: NodeRecord) {
        if record.name() == self.local_name {
            if matches!(record.state, NodeState::Suspect | NodeState::Dead)
                && record.incarnation >= self.incarnation()
            {
                self.refute(record.incarnation).await;
            }
            return;
        }

        record.last_seen = Some(Instant::now());

        let change = match self.members.entry(record.name().to_string()) {
            Entry::Vacant(vacant) => {
                tracing::info!(
                    "Discovered new member: {} at {}",
                    record.name(),
                    record.member.socket_addr()
                );
                let event = record.is_alive().then(|| MemberEventType::Join);
                let member = record.to_member();
                vacant.insert(record);
                event.map(|kind| (kind, member))
            }
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                let change = Self::transition(existing, &record);
                if record.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {}: inc {} -> {}",
                        record.name(),
                        existing.incarnation,
                        record.incarnation,
                    );
                    existing.member = record.member.clone();
                    existing.incarnation = record.incarnation;
                    existing.state = record.state;
                    existing.last_seen = record.last_seen;
                } else if record.incarnation == existing.incarnation
                    && Self::overrides(record.state, existing.state)
                {
                    existing.state = record.state;
                }
                change.map(|kind| (kind, existing.to_member()))
            }
        };

        if let Some((kind, member)) = change {
            self.notify(kind, member);
        }
    }

    /// Member event caused by replacing `existing` with `incoming`, if any.
    fn transition(existing: &NodeRecord, incoming: &NodeRecord) -> Option<MemberEventType> {
        let newer = incoming.incarnation > existing.incarnation;
        let same = incoming.incarnation == existing.incarnation;
        if !newer && !(same && Self::overrides(incoming.state, existing.state)) {
            return None;
        }

        match (existing.is_alive(), incoming.state) {
            (false, NodeState::Alive | NodeState::Suspect) => Some(MemberEventType::Join),
            (true, NodeState::Dead) => Some(MemberEventType::Failed),
            (_, NodeState::Left) if existing.state != NodeState::Left => {
                Some(MemberEventType::Leave)
            }
            (true, NodeState::Alive | NodeState::Suspect)
                if incoming.member.tags != existing.member.tags
                    || incoming.member.socket_addr() != existing.member.socket_addr() =>
            {
                Some(MemberEventType::Update)
            }
            _ => None,
        }
    }

    /// At equal incarnation, worse news wins.
    fn overrides(incoming: NodeState, existing: NodeState) -> bool {
        fn rank(state: NodeState) -> u8 {
            match state {
                NodeState::Alive => 0,
                NodeState::Suspect => 1,
                NodeState::Dead => 2,
                NodeState::Left => 3,
            }
        }
        rank(incoming) > rank(existing)
    }

    async fn refute(&self, accused: u64) {
        let incarnation = self.next_incarnation(accused);
        if let Some(mut local) = self.members.get_mut(&self.local_name) {
            local.incarnation = incarnation;
            local.state = NodeState::Alive;
        }

        tracing::info!("Refuting suspicion with incarnation {}", incarnation);
        let msg = GossipMessage::Alive {
            node: self.local_record(),
        };
        self.broadcast_message(msg).await;
    }

    pub(crate) async fn handle_suspect(&self, name: String, incarnation: u64) {
        if name == self.local_name {
            if incarnation >= self.incarnation() {
                self.refute(incarnation).await;
            }
            return;
        }

        match self.members.get_mut(&name) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive {
                    tracing::info!("Node {} at {} suspected", name, existing.member.socket_addr());
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                }
            }
            None => {
                tracing::debug!("Suspected node {} doesn't exist", name);
            }
        }
    }

    pub(crate) fn handle_leave(&self, name: String, incarnation: u64) {
        let left = match self.members.get_mut(&name) {
            Some(mut existing)
                if incarnation >= existing.incarnation && existing.state != NodeState::Left =>
            {
                let was_alive = existing.is_alive();
                existing.state = NodeState::Left;
                existing.incarnation = incarnation;
                existing.last_seen = Some(Instant::now());
                was_alive.then(|| existing.to_member())
            }
            _ => None,
        };

        if let Some(member) = left {
            tracing::info!("Node {} left the cluster", name);
            self.notify(MemberEventType::Leave, member);
        }
    }

    async fn handle_join(&self, mut node: NodeRecord, src: SocketAddr) -> Result<()> {
        tracing::info!("Node {} joining cluster at {}", node.name(), src);

        // A restarted node starts over at a low incarnation
        if let Some(existing) = self.members.get(node.name()).map(|e| e.value().clone())
            && !existing.is_alive()
        {
            node.incarnation = node.incarnation.max(existing.incarnation.saturating_add(1));
        }
        let name = node.name().to_string();
        self.merge_member(node).await;
        self.touch(&name);

        // Reply with the member list so the joiner learns the cluster
        let reply = GossipMessage::Ack {
            seq: u32::MAX,
            node: self.local_record(),
            members: self.members.iter().map(|e| e.value().clone()).collect(),
            payload: Vec::new(),
        };
        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        tracing::info!("Cluster size now: {}", self.members.len());

        Ok(())
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            self.detect_failures(Instant::now()).await;
        }
    }

    /// One pass of the failure detector at time `now`.
    pub(crate) async fn detect_failures(&self, now: Instant) {
        let mut messages_to_broadcast = Vec::new();
        let mut failed = Vec::new();
        let mut reaped = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();

            if member.name() == self.local_name {
                continue;
            }

            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.saturating_duration_since(last_seen);

            match member.state {
                NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                    tracing::warn!(
                        "Node {} suspected (no contact for {:?})",
                        member.name(),
                        elapsed
                    );
                    member.state = NodeState::Suspect;
                    messages_to_broadcast.push(GossipMessage::Suspect {
                        name: member.name().to_string(),
                        incarnation: member.incarnation,
                    });
                }
                NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                    tracing::info!(
                        "Node {} declared DEAD (no contact for {:?})",
                        member.name(),
                        elapsed
                    );
                    member.state = NodeState::Dead;
                    failed.push(member.to_member());
                }
                NodeState::Dead | NodeState::Left if elapsed > REAP_TIMEOUT => {
                    reaped.push(member.name().to_string());
                }
                _ => {}
            }
        }

        for name in reaped {
            if let Some((_, record)) = self.members.remove(&name) {
                tracing::info!("Reaped node {}", name);
                self.notify(MemberEventType::Reap, record.to_member());
            }
        }
        for member in failed {
            self.notify(MemberEventType::Failed, member);
        }

        self.pending_probes
            .retain(|_, probe| now.saturating_duration_since(probe.sent_at) < PROBE_TIMEOUT);

        if !messages_to_broadcast.is_empty() {
            tracing::info!(
                "Cluster size now: {} alive nodes",
                self.get_alive_members().len()
            );
        }
        for msg in messages_to_broadcast {
            self.broadcast_message(msg).await;
        }
    }

    fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.members
            .iter()
            .filter(|entry| entry.value().name() != self.local_name && entry.value().is_alive())
            .map(|entry| entry.value().member.socket_addr())
            .collect()
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize gossip message: {}", e);
                return;
            }
        };

        for addr in self.peer_addrs() {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", addr, e);
            }
        }
    }
}

#[async_trait]
impl Transport for MembershipService {
    fn local_member(&self) -> Member {
        self.local_record().to_member()
    }

    fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .iter()
            .map(|entry| entry.value().to_member())
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    fn num_members(&self) -> usize {
        self.members.iter().filter(|e| e.value().is_alive()).count()
    }

    async fn send_to_address(&self, addr: SocketAddr, msg: Vec<u8>) -> Result<()> {
        let encoded = bincode::serialize(&GossipMessage::User { payload: msg })?;
        self.socket.send_to(&encoded, addr).await?;
        Ok(())
    }

    async fn broadcast(&self, msg: Vec<u8>) -> Result<()> {
        let encoded = bincode::serialize(&GossipMessage::User { payload: msg })?;
        for addr in self.peer_addrs() {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to send to {}: {}", addr, e);
            }
        }
        Ok(())
    }
}
