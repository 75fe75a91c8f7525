//! Cluster Facade
//!
//! Ties the layer together on top of a membership [`Transport`](crate::membership::transport::Transport).
//!
//! ## Core Mechanisms
//! - **Event Pipeline**: Member changes flow through the member coalescer, then
//!   the user event coalescer, into one bounded application channel.
//! - **Dispatch**: Application messages are routed by their type byte to the
//!   query engine, the user event path or the relay forwarder.
//! - **Shutdown**: A watch signal stops the pump and drains both coalescers.

pub mod service;

pub use service::Cluster;
