use std::time::Duration;
use thiserror::Error;

/// Malformed or unsupported input arriving from a peer.
///
/// These never escape the probe or gossip paths: callers log them and move on.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("unsupported ping version {0}")]
    UnsupportedPingVersion(u8),

    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("response already sent")]
    AlreadyResponded,

    #[error("response is past the deadline")]
    DeadlineExceeded,

    #[error("response of {size} bytes exceeds limit of {limit} bytes")]
    ResponseTooLarge { size: usize, limit: usize },

    #[error("query of {size} bytes exceeds limit of {limit} bytes")]
    QueryTooLarge { size: usize, limit: usize },

    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum UserEventError {
    #[error("user event of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

#[derive(Error, Debug, PartialEq)]
pub enum CoordinateError {
    #[error("dimensionality mismatch: expected {expected}, got {got}")]
    DimensionalityMismatch { expected: usize, got: usize },

    #[error("round trip time {0:?} is out of range")]
    RttOutOfRange(Duration),

    #[error("coordinate became invalid and was reset")]
    Reset,
}
