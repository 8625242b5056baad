//! Frames and control messages

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit on a PTY stream connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON-encoded [`ControlMessage`]
    Text(String),
    /// Raw terminal bytes
    Binary(Bytes),
}

impl Frame {
    /// Build a text frame carrying a control message
    pub fn control(msg: &ControlMessage) -> Result<Self, serde_json::Error> {
        serde_json::to_string(msg).map(Frame::Text)
    }

    /// Build a binary frame
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Frame::Binary(data.into())
    }

    /// Parse the control message of a text frame
    ///
    /// Returns `None` for binary frames.
    pub fn parse_control(&self) -> Option<Result<ControlMessage, serde_json::Error>> {
        match self {
            Frame::Text(text) => Some(serde_json::from_str(text)),
            Frame::Binary(_) => None,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON control messages carried in text frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First message from the client: join `session_id`, or create a new session
    Attach {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        cols: u16,
        rows: u16,
    },
    /// The server has attached the pty; client input is safe from here on
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
    },
    /// New terminal geometry
    Resize { cols: u16, rows: u16 },
    /// Something went wrong on the other side
    Error { message: String },
    /// The attached process exited
    Exit {
        code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

impl ControlMessage {
    /// Shorthand for an error message
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
