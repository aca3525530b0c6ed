//! Error types for link negotiation and signaling

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("operation not allowed in current state: {0}")]
    InvalidState(&'static str),
    #[error("link closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

pub type LinkResult<T> = Result<T, LinkError>;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling connection closed")]
    Disconnected,
    #[error("signaling I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("signaling codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("signaling handshake failed: {0}")]
    Handshake(String),
    #[error("not in a room")]
    NotInRoom,
}
