//! Error types for sandboxd
//!
//! Provides a unified error type used across all sandboxd crates.
//! Caller-actionable conditions (queue full, circuit open, not found)
//! are ordinary variants so the control plane never has to treat them
//! as fatal.

use std::path::PathBuf;

/// Main error type for sandboxd operations
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    // === Process Errors ===

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("Timeout exceeded after {timeout_ms}ms")]
    TimeoutExceeded { timeout_ms: u64 },

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    // === PTY Errors ===

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("PTY session not found: {0}")]
    PtySessionNotFound(String),

    #[error("Handle is closed: {0}")]
    Closed(String),

    // === Watch Errors ===

    #[error("Watch not found: {0}")]
    WatchNotFound(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(String),

    // === Admission Errors ===

    #[error("Request queue is full ({queue_size} waiting)")]
    QueueFull { queue_size: usize },

    #[error("Request timed out in queue after {wait_time_ms}ms")]
    QueueTimeout { wait_time_ms: u64 },

    #[error("Request queue cleared: {reason}")]
    QueueCleared { reason: String },

    #[error("Circuit breaker is open, retry in {remaining_ms}ms")]
    CircuitOpen { remaining_ms: u64 },

    // === Connection / Protocol Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a PTY error
    pub fn pty(msg: impl Into<String>) -> Self {
        Self::Pty(msg.into())
    }

    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::ProcessSpawn(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. }
                | Self::QueueTimeout { .. }
                | Self::CircuitOpen { .. }
                | Self::Connection(_)
                | Self::ConnectionClosed
        )
    }

    /// Check if this error reports a missing entity
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProcessNotFound(_)
                | Self::WatchNotFound(_)
                | Self::PtySessionNotFound(_)
                | Self::FileNotFound(_)
        )
    }
}

/// Result type alias using SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Display Tests ====================

    #[test]
    fn test_error_display() {
        let err = SandboxError::ProcessNotFound("proc-1".into());
        assert_eq!(err.to_string(), "Process not found: proc-1");
    }

    #[test]
    fn test_error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = SandboxError::Io(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_display_file_read() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied");
        let err = SandboxError::FileRead {
            path: PathBuf::from("/etc/shadow"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to read file"));
        assert!(msg.contains("/etc/shadow"));
    }

    #[test]
    fn test_error_display_queue_full() {
        let err = SandboxError::QueueFull { queue_size: 3 };
        assert_eq!(err.to_string(), "Request queue is full (3 waiting)");
    }

    #[test]
    fn test_error_display_circuit_open() {
        let err = SandboxError::CircuitOpen { remaining_ms: 1500 };
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn test_error_display_closed() {
        let err = SandboxError::Closed("pty-7".into());
        assert_eq!(err.to_string(), "Handle is closed: pty-7");
    }

    // ==================== Helper Tests ====================

    #[test]
    fn test_helper_constructors() {
        assert!(matches!(SandboxError::config("x"), SandboxError::Config(_)));
        assert!(matches!(SandboxError::pty("x"), SandboxError::Pty(_)));
        assert!(matches!(SandboxError::spawn("x"), SandboxError::ProcessSpawn(_)));
        assert!(matches!(SandboxError::connection("x"), SandboxError::Connection(_)));
        assert!(matches!(SandboxError::protocol("x"), SandboxError::Protocol(_)));
        assert!(matches!(SandboxError::internal("x"), SandboxError::Internal(_)));
    }

    #[test]
    fn test_is_retryable() {
        assert!(SandboxError::QueueFull { queue_size: 1 }.is_retryable());
        assert!(SandboxError::QueueTimeout { wait_time_ms: 10 }.is_retryable());
        assert!(SandboxError::CircuitOpen { remaining_ms: 10 }.is_retryable());
        assert!(SandboxError::ConnectionClosed.is_retryable());

        assert!(!SandboxError::ProcessNotFound("p".into()).is_retryable());
        assert!(!SandboxError::spawn("boom").is_retryable());
        assert!(!SandboxError::Closed("p".into()).is_retryable());
    }

    #[test]
    fn test_is_not_found() {
        assert!(SandboxError::ProcessNotFound("p".into()).is_not_found());
        assert!(SandboxError::WatchNotFound("w".into()).is_not_found());
        assert!(SandboxError::FileNotFound(PathBuf::from("/nope")).is_not_found());
        assert!(!SandboxError::QueueFull { queue_size: 1 }.is_not_found());
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: SandboxError = io_err.into();
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[test]
    fn test_result_alias() {
        fn fails() -> Result<()> {
            Err(SandboxError::WatchNotFound("w-1".into()))
        }
        assert!(fails().unwrap_err().is_not_found());
    }
}
