//! Wire protocol for Coordinator <-> Worker communication.
//!
//! # Framing
//!
//! Each message is one newline-terminated UTF-8 JSON object:
//!
//! ```text
//! { "message_type": "...", "sender_id": "...",
//!   "timestamp": "ISO-8601", "message_id": "...", "data": { ... } }\n
//! ```
//!
//! Frames above the configured maximum (default 1 MiB) are terminal for the
//! offending connection, never for the process. Payload schemas are enforced
//! per `message_type` when a handler calls [`Envelope::decode_data`].

pub mod defaults;
pub mod error;
pub mod types;

// Re-export types for convenience
pub use types::{
    ClusterStatusPayload,
    // Canonical enums (use these everywhere)
    DeviceCapabilities,
    DeviceId,
    DeviceStatus,
    ErrorPayload,
    FailureReason,
    HeartbeatAck,
    HeartbeatPayload,
    Platform,
    // Protocol payloads
    RegisterAck,
    RegisterPayload,
    StatusQueryPayload,
    TaskAssignPayload,
    TaskCancelPayload,
    TaskError,
    TaskId,
    TaskOutcome,
    TaskPriority,
    TaskRequirements,
    TaskResultPayload,
    TaskStartedPayload,
    TaskState,
};

pub use error::{ProtocolError, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Every message kind carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    RegisterAck,
    Heartbeat,
    HeartbeatAck,
    TaskAssign,
    TaskResult,
    TaskCancel,
    StatusQuery,
    StatusReply,
    Error,
}

impl MessageType {
    pub const ALL: &'static [MessageType] = &[
        MessageType::Register,
        MessageType::RegisterAck,
        MessageType::Heartbeat,
        MessageType::HeartbeatAck,
        MessageType::TaskAssign,
        MessageType::TaskResult,
        MessageType::TaskCancel,
        MessageType::StatusQuery,
        MessageType::StatusReply,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "register",
            MessageType::RegisterAck => "register_ack",
            MessageType::Heartbeat => "heartbeat",
            MessageType::HeartbeatAck => "heartbeat_ack",
            MessageType::TaskAssign => "task_assign",
            MessageType::TaskResult => "task_result",
            MessageType::TaskCancel => "task_cancel",
            MessageType::StatusQuery => "status_query",
            MessageType::StatusReply => "status_reply",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid message type: '{}'", s))
    }
}

/// Common envelope wrapping every wire payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_type: MessageType,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Wrap `data` in a fresh envelope stamped now, with a generated
    /// `message_id` for correlation.
    pub fn new(
        message_type: MessageType,
        sender_id: impl Into<String>,
        data: &impl Serialize,
    ) -> Result<Self> {
        Ok(Self {
            message_type,
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            message_id: Some(Uuid::new_v4().to_string()),
            data: serde_json::to_value(data).map_err(ProtocolError::Encode)?,
        })
    }

    /// Replies carry the request's `message_id`.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Decode `data` against the schema for this message type.
    pub fn decode_data<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|source| ProtocolError::Schema {
            message_type: self.message_type,
            source,
        })
    }
}

/// Newline-delimited JSON codec with a max-frame bound.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub const fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Serialize an envelope to one newline-terminated frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;
        if buf.len() + 1 > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: buf.len() + 1,
                max: self.max_frame,
            });
        }
        buf.push(b'\n');
        Ok(buf)
    }

    /// Parse one frame. The trailing newline (and an optional carriage
    /// return) may be present or already stripped by the reader.
    pub fn decode(&self, frame: &[u8]) -> Result<Envelope> {
        if frame.len() > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame,
            });
        }
        let mut line = frame;
        while let Some((&last, rest)) = line.split_last() {
            if last == b'\n' || last == b'\r' {
                line = rest;
            } else {
                break;
            }
        }
        if line.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        serde_json::from_slice(line).map_err(ProtocolError::Malformed)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(defaults::DEFAULT_MAX_FRAME_BYTES)
    }
}
