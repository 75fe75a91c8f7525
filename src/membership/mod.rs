//! Membership & Discovery Module
//!
//! The transport layer underneath the event and query machinery. Everything
//! above it talks to the [`transport::Transport`] trait; two implementations
//! ship with the crate.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Nodes periodically probe each other over UDP and exchange member lists on acks.
//! - **Failure Detection**: Uses a "Suspect" -> "Dead" -> reaped transition model with timeouts to handle node crashes.
//! - **Incarnation Numbers**: Solves conflict resolution when node state (Alive/Suspect) is disputed.
//! - **Probe Hook**: Every completed probe reports its RTT and the peer's ack payload to a [`transport::PingDelegate`].
//!
//! ## Implementations
//! - **`service`**: The UDP gossip transport used by the binary.
//! - **`memory`**: An in-process network for tests and embedding.

pub mod memory;
pub mod service;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;
