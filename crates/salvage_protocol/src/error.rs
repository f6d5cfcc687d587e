//! Protocol error types.

use crate::MessageType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised at the wire boundary.
///
/// Every variant is terminal for the connection that produced it, never for
/// the coordinator process.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("empty frame")]
    EmptyFrame,

    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("invalid '{message_type}' payload: {source}")]
    Schema {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
}
