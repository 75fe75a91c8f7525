use crate::clock::LamportTime;
use crate::error::ProtocolError;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Leading byte of every application message carried by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Leave = 0,
    Join = 1,
    UserEvent = 3,
    Query = 4,
    QueryResponse = 5,
    Relay = 9,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Leave),
            1 => Ok(MessageType::Join),
            3 => Ok(MessageType::UserEvent),
            4 => Ok(MessageType::Query),
            5 => Ok(MessageType::QueryResponse),
            9 => Ok(MessageType::Relay),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

pub const QUERY_FLAG_ACK: u32 = 1 << 0;

/// Restricts which nodes process a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum QueryFilter {
    /// Only the named nodes respond.
    Nodes(Vec<String>),
    /// Only nodes whose tag value matches the regular expression respond.
    Tag { tag: String, expr: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageQuery {
    pub ltime: LamportTime,
    pub id: u32,
    pub addr: IpAddr,
    pub port: u16,
    pub source_node: String,
    pub filters: Vec<QueryFilter>,
    pub flags: u32,
    pub relay_factor: u8,
    pub timeout: Duration,
    pub name: String,
    pub payload: Vec<u8>,
}

impl MessageQuery {
    pub fn ack(&self) -> bool {
        self.flags & QUERY_FLAG_ACK != 0
    }

    pub fn origin(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageQueryResponse {
    pub ltime: LamportTime,
    pub id: u32,
    pub from: String,
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl MessageQueryResponse {
    pub fn ack(&self) -> bool {
        self.flags & QUERY_FLAG_ACK != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageUserEvent {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

/// Header of a relayed message: the receiver forwards the inner message to `dest`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayHeader {
    pub dest: SocketAddr,
}

/// Caller-facing options for issuing a query.
#[derive(Debug, Clone, Default)]
pub struct QueryParam {
    pub filter_nodes: Vec<String>,
    pub filter_tags: HashMap<String, String>,
    pub request_ack: bool,
    pub relay_factor: u8,
    /// `None` picks the cluster-size based default.
    pub timeout: Option<Duration>,
}

impl QueryParam {
    pub fn filters(&self) -> Vec<QueryFilter> {
        let mut filters = Vec::new();
        if !self.filter_nodes.is_empty() {
            filters.push(QueryFilter::Nodes(self.filter_nodes.clone()));
        }

        let mut tags: Vec<_> = self.filter_tags.iter().collect();
        tags.sort();
        for (tag, expr) in tags {
            filters.push(QueryFilter::Tag {
                tag: tag.clone(),
                expr: expr.clone(),
            });
        }
        filters
    }

    pub fn flags(&self) -> u32 {
        if self.request_ack { QUERY_FLAG_ACK } else { 0 }
    }
}
