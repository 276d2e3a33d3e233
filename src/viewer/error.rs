// ABOUTME: Viewer client error types covering transport, protocol, and authentication failures

use crate::codec::CodecError;
use std::io;
use thiserror::Error;

/// Errors surfaced by viewer client operations. Most are absorbed by the
/// reconnect loop; they only reach the caller when reconnecting is off.
#[derive(Debug, Error)]
pub enum ViewerError {
    /// I/O error during connect, read, or write.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Server replied `AUTH_FAIL`.
    #[error("authentication rejected")]
    AuthRejected,

    /// Peer closed or sent something the dialogue does not allow here.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,
}

/// Result alias for viewer operations.
pub type ViewerResult<T> = Result<T, ViewerError>;
