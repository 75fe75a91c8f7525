use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

pub const PROTOCOL_VERSION_MIN: u8 = 2;
pub const PROTOCOL_VERSION_MAX: u8 = 5;
pub const DELEGATE_VERSION_MIN: u8 = 2;
pub const DELEGATE_VERSION_MAX: u8 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
}

/// A single member of the cluster as seen by the application.
///
/// The `name` is the unique key. Address and port locate the member's gossip
/// endpoint; tags carry free-form metadata used for query filtering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
    pub protocol_min: u8,
    pub protocol_max: u8,
    pub protocol_cur: u8,
    pub delegate_min: u8,
    pub delegate_max: u8,
    pub delegate_cur: u8,
}

impl Member {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr: addr.ip(),
            port: addr.port(),
            tags: HashMap::new(),
            status: MemberStatus::Alive,
            protocol_min: PROTOCOL_VERSION_MIN,
            protocol_max: PROTOCOL_VERSION_MAX,
            protocol_cur: PROTOCOL_VERSION_MAX,
            delegate_min: DELEGATE_VERSION_MIN,
            delegate_max: DELEGATE_VERSION_MAX,
            delegate_cur: DELEGATE_VERSION_MAX,
        }
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Health of a node inside the gossip transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    Left,
}

/// Transport-side record for one node.
///
/// The `incarnation` field is a logical clock used to order updates about the
/// node and to refute a false "Suspect" claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub member: Member,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl NodeRecord {
    pub fn new(member: Member, incarnation: u64) -> Self {
        Self {
            member,
            state: NodeState::Alive,
            incarnation,
            last_seen: Some(Instant::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.member.name
    }

    /// The member as exposed to the application, with its status derived
    /// from the transport state.
    pub fn to_member(&self) -> Member {
        let mut member = self.member.clone();
        member.status = match self.state {
            NodeState::Alive | NodeState::Suspect => MemberStatus::Alive,
            NodeState::Dead => MemberStatus::Failed,
            NodeState::Left => MemberStatus::Left,
        };
        member
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state, NodeState::Alive | NodeState::Suspect)
    }
}

/// The wire protocol of the reference UDP transport.
///
/// - `Ping/Ack`: direct probes; the ack carries the responder's member list
///   and the ping delegate's payload.
/// - `Join`: sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive/Leave`: disseminate changes in node health.
/// - `User`: envelope for application messages (queries, responses, events).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        seq: u32,
        node: NodeRecord,
    },

    Ack {
        seq: u32,
        node: NodeRecord,
        members: Vec<NodeRecord>,
        payload: Vec<u8>,
    },

    Join {
        node: NodeRecord,
    },

    Suspect {
        name: String,
        incarnation: u64,
    },

    Alive {
        node: NodeRecord,
    },

    Leave {
        name: String,
        incarnation: u64,
    },

    User {
        payload: Vec<u8>,
    },
}
