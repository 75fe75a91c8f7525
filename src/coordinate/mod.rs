//! Network Coordinates Module
//!
//! Estimates every node's position in a virtual space where distance
//! approximates round trip time, using the Vivaldi algorithm. Estimates ride
//! for free on the membership transport's probe acks.
//!
//! - **`types`**: The coordinate itself and its vector math.
//! - **`client`**: The estimator that folds RTT samples into the local coordinate.
//! - **`ping`**: The probe hook that encodes and consumes ack payloads.

pub mod client;
pub mod ping;
pub mod types;

pub use client::CoordinateClient;
pub use types::{Coordinate, CoordinateConfig};
