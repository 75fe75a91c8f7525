//! In-process transport.
//!
//! Every node registered on a [`MemoryNetwork`] gets a [`MemoryTransport`] and
//! the receiving side of its event channel. Sends are delivered straight into
//! the destination's channel, so a whole cluster can run inside one runtime.
//! Used by the test suites and handy for embedding without sockets.

use super::transport::{Transport, TransportEvent};
use super::types::{Member, MemberStatus};
use crate::event::types::{MemberEvent, MemberEventType};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

const NODE_QUEUE_SIZE: usize = 1024;

struct MemoryNode {
    member: Member,
    tx: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<String, MemoryNode>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node and announces it to everyone already on the network.
    pub fn join(
        self: &Arc<Self>,
        member: Member,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(NODE_QUEUE_SIZE);

        self.notify_all(MemberEventType::Join, &member);
        self.nodes.insert(
            member.name.clone(),
            MemoryNode {
                member: member.clone(),
                tx,
            },
        );

        let transport = Arc::new(MemoryTransport {
            network: self.clone(),
            name: member.name.clone(),
            addr: member.socket_addr(),
            sent: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            blocked: DashMap::new(),
        });

        (transport, rx)
    }

    /// Changes a node's status and tells the other nodes about it.
    pub fn set_status(&self, name: &str, status: MemberStatus) {
        let member = match self.nodes.get_mut(name) {
            Some(mut node) => {
                node.member.status = status;
                node.member.clone()
            }
            None => return,
        };

        let kind = match status {
            MemberStatus::Alive => MemberEventType::Join,
            MemberStatus::Leaving | MemberStatus::Left => MemberEventType::Leave,
            MemberStatus::Failed => MemberEventType::Failed,
        };
        self.notify_all(kind, &member);
    }

    fn notify_all(&self, kind: MemberEventType, member: &Member) {
        for node in self.nodes.iter() {
            if node.member.name == member.name {
                continue;
            }
            let event = MemberEvent::new(kind, vec![member.clone()]);
            if node.tx.try_send(TransportEvent::Member(event)).is_err() {
                tracing::warn!("Dropped member event for {}", node.member.name);
            }
        }
    }

    fn route(&self, addr: SocketAddr) -> Option<mpsc::Sender<TransportEvent>> {
        self.nodes
            .iter()
            .find(|node| {
                node.member.socket_addr() == addr && node.member.status == MemberStatus::Alive
            })
            .map(|node| node.tx.clone())
    }

    fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.nodes.iter().map(|n| n.member.clone()).collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    name: String,
    addr: SocketAddr,
    sent: AtomicUsize,
    fail_sends: AtomicBool,
    blocked: DashMap<SocketAddr, ()>,
}

impl MemoryTransport {
    /// Number of messages successfully handed to the network.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Makes every direct send fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Makes direct sends to one address fail.
    pub fn block_address(&self, addr: SocketAddr) {
        self.blocked.insert(addr, ());
    }

    fn deliver(&self, addr: SocketAddr, payload: Vec<u8>) -> Result<()> {
        let tx = self
            .network
            .route(addr)
            .ok_or_else(|| anyhow::anyhow!("No route to {}", addr))?;

        tx.try_send(TransportEvent::Message {
            from: self.addr,
            payload,
        })
        .map_err(|e| anyhow::anyhow!("Failed to deliver to {}: {}", addr, e))?;

        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_member(&self) -> Member {
        self.network
            .nodes
            .get(&self.name)
            .map(|node| node.member.clone())
            .unwrap_or_else(|| Member::new(self.name.clone(), self.addr))
    }

    fn members(&self) -> Vec<Member> {
        self.network.members()
    }

    fn num_members(&self) -> usize {
        self.network
            .nodes
            .iter()
            .filter(|n| n.member.status == MemberStatus::Alive)
            .count()
    }

    async fn send_to_address(&self, addr: SocketAddr, msg: Vec<u8>) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) || self.blocked.contains_key(&addr) {
            return Err(anyhow::anyhow!("Send to {} failed", addr));
        }
        self.deliver(addr, msg)
    }

    async fn broadcast(&self, msg: Vec<u8>) -> Result<()> {
        for member in self.network.members() {
            if member.name == self.name || member.status != MemberStatus::Alive {
                continue;
            }
            if let Err(e) = self.deliver(member.socket_addr(), msg.clone()) {
                tracing::warn!("Failed to broadcast to {}: {}", member.name, e);
            }
        }
        Ok(())
    }
}
