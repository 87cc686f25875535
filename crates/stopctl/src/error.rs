//! Error types for the control protocol and client.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Framing and encoding failures on a control connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed request: {source}")]
    Malformed {
        id: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("connection closed before a response was received")]
    Closed,

    #[error("response id {got} does not match request id {expected}")]
    MismatchedResponse { expected: u64, got: u64 },
}

impl ProtocolError {
    /// Id of the request this error belongs to, or 0 when unknown.
    pub fn request_id(&self) -> u64 {
        match self {
            ProtocolError::Malformed { id, .. } => *id,
            _ => 0,
        }
    }
}

/// Errors surfaced to control clients.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to control socket {}: {source}", .path.display())]
    Connection {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("remote operation failed: {0}")]
    Rpc(String),

    #[error("control transport failed: {0}")]
    Transport(#[from] ProtocolError),
}
