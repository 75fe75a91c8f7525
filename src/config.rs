//! Settings consumed by the event, query and coordinate layer.
//!
//! [`ClusterConfig`] is a plain settings object. It is built in code or
//! deserialized by whatever loader embeds this crate; nothing here reads the
//! environment or the filesystem.

use crate::coordinate::CoordinateConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Unique name of the local node. Must match the transport's local member.
    pub node_name: String,

    /// Piggyback network coordinates on probe acks.
    pub coordinates_enabled: bool,
    pub coordinate: CoordinateConfig,

    /// Upper bound on a single coalescing window for member events.
    pub coalesce_period: Duration,
    /// A window also closes once no member event arrived for this long.
    pub quiescent_period: Duration,
    pub user_coalesce_period: Duration,
    pub user_quiescent_period: Duration,

    /// Capacity of the channel feeding the coalescers.
    pub ingest_queue_size: usize,
    /// Capacity of the application event channel.
    pub event_queue_size: usize,

    /// Default query timeout is `query_timeout_base + gossip_interval * ceil(log2(n + 1))`.
    pub query_timeout_base: Duration,
    pub gossip_interval: Duration,
    pub query_size_limit: usize,
    pub query_response_size_limit: usize,
    /// Number of Lamport slots remembered for duplicate query suppression.
    pub query_buffer_size: usize,
    pub default_relay_factor: u8,

    pub user_event_size_limit: usize,
    /// Number of Lamport slots remembered for duplicate user event suppression.
    pub event_buffer_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: uuid::Uuid::new_v4().to_string(),
            coordinates_enabled: true,
            coordinate: CoordinateConfig::default(),
            coalesce_period: Duration::from_millis(200),
            quiescent_period: Duration::from_millis(100),
            user_coalesce_period: Duration::from_millis(500),
            user_quiescent_period: Duration::from_millis(200),
            ingest_queue_size: 1024,
            event_queue_size: 1024,
            query_timeout_base: Duration::from_secs(1),
            gossip_interval: Duration::from_millis(200),
            query_size_limit: 1024,
            query_response_size_limit: 1024,
            query_buffer_size: 512,
            default_relay_factor: 0,
            user_event_size_limit: 512,
            event_buffer_size: 512,
        }
    }
}

impl ClusterConfig {
    pub fn with_name(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Default query window for a cluster of `members` nodes.
    ///
    /// Larger clusters need more gossip rounds for a query to reach everyone
    /// and for the replies to come back.
    pub fn default_query_timeout(&self, members: usize) -> Duration {
        let rounds = ((members as f64) + 1.0).log2().ceil() as u32;
        self.query_timeout_base + self.gossip_interval * rounds
    }
}
