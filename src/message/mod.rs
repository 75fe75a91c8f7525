//! Network Protocol Definitions
//!
//! Messages exchanged by the event and query layer on top of the membership
//! transport. Every message is a type byte followed by a bincode body, carried
//! inside the transport's user-message envelope.

pub mod codec;
pub mod types;

#[cfg(test)]
mod tests;
