//! Distributed Query Module
//!
//! Request/response on top of gossip: a query is broadcast to the whole
//! cluster, every node that passes the filters may answer it once, and the
//! issuer collects the answers until a deadline.
//!
//! ## Core Mechanisms
//! - **Lamport Ordering**: Queries carry a time from a dedicated clock, used to
//!   discard stale and duplicate deliveries.
//! - **Respond Once**: Each received [`Query`] answers at most once and never
//!   after its deadline.
//! - **Relay**: Responses may additionally travel through random members to
//!   survive a lossy direct path.

pub mod engine;
pub mod query;
pub mod response;

pub use engine::QueryEngine;
pub use query::{Query, QueryState};
pub use response::{NodeResponse, QueryResponse, QuerySummary};
