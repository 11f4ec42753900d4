//! Error types for the socket client.

use dirsession_core::{ProtocolError, ResultCode};
use thiserror::Error;

/// Transport-level failures of a `WireConnection`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("server disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<ClientError> for ProtocolError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Io(_) | ClientError::Disconnected => ProtocolError::server_down(err.to_string()),
            ClientError::Serialization(_) | ClientError::Protocol(_) => {
                ProtocolError::decoding(err.to_string())
            }
        }
    }
}

/// Failure to reach the server at all.
pub(crate) fn connect_error(err: std::io::Error) -> ProtocolError {
    ProtocolError::new(ResultCode::CONNECT_ERROR, format!("connect failed: {err}"))
}
