//! Records emitted on the process-log and watch event streams

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a process log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRecordKind {
    Stdout,
    Stderr,
    Exit,
    Error,
}

/// One entry of a process log stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "type")]
    pub kind: LogRecordKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(kind: LogRecordKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::new(LogRecordKind::Stdout, data)
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::new(LogRecordKind::Stderr, data)
    }

    /// Whether the stream ends after this record
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, LogRecordKind::Exit | LogRecordKind::Error)
    }
}

/// Normalized filesystem change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventType {
    Create,
    Modify,
    Delete,
    MoveFrom,
    MoveTo,
}

impl FileEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::MoveFrom => "move_from",
            Self::MoveTo => "move_to",
        }
    }
}

impl std::fmt::Display for FileEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a watch event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    pub watch_id: String,
    pub event_type: FileEventType,
    pub path: String,
    pub is_directory: bool,
    pub timestamp: DateTime<Utc>,
}
