//! Gossip Cluster Event Layer
//!
//! This library crate implements the event, query and coordinate subsystem
//! that sits on top of a gossip membership transport.
//! It serves as the foundation for the demo node binary (`main.rs`).
//!
//! ## Architecture Modules
//! - **`clock`**: Lamport clocks and the duplicate suppression buffer built on them.
//! - **`cluster`**: The facade wiring transport, event pipeline and queries together.
//! - **`config`**: The plain settings object consumed by every other module.
//! - **`coordinate`**: Vivaldi network coordinates piggybacked on probe acks.
//! - **`error`**: Error types of the public operations.
//! - **`event`**: Event types and the coalescing stages that batch them.
//! - **`membership`**: The transport seam, a UDP gossip transport and an
//!   in-memory one.
//! - **`message`**: Wire messages of the layer and their framing.
//! - **`query`**: Distributed queries with deadlines, size limits and relay.

pub mod clock;
pub mod cluster;
pub mod config;
pub mod coordinate;
pub mod error;
pub mod event;
pub mod membership;
pub mod message;
pub mod query;
