//! Configuration schema structs

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_PTY_BUFFER_BYTES;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::process::SupervisorConfig;
use crate::queue::QueueConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ListenConfig,
    pub process: ProcessSettings,
    pub pty: PtySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub queue: QueueSettings,
    pub watch: WatchSettings,
}

/// Network listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address the PTY stream listener binds to
    pub listen_addr: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7681".into(),
        }
    }
}

/// Process supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    pub shell: String,
    pub retention_secs: u64,
    pub cleanup_interval_secs: u64,
    pub kill_grace_ms: u64,
    pub log_buffer_bytes: usize,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".into(),
            retention_secs: 3600,
            cleanup_interval_secs: 300,
            kill_grace_ms: 5000,
            log_buffer_bytes: 1024 * 1024,
        }
    }
}

impl From<&ProcessSettings> for SupervisorConfig {
    fn from(settings: &ProcessSettings) -> Self {
        Self {
            shell: settings.shell.clone(),
            retention: Duration::from_secs(settings.retention_secs),
            kill_grace: Duration::from_millis(settings.kill_grace_ms),
            log_buffer_bytes: settings.log_buffer_bytes,
        }
    }
}

/// Pseudo-terminal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtySettings {
    /// Shell to launch; `$SHELL` or `/bin/bash` when unset
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub buffer_bytes: usize,
    pub destroy_grace_ms: u64,
}

impl Default for PtySettings {
    fn default() -> Self {
        Self {
            shell: None,
            cols: 80,
            rows: 24,
            buffer_bytes: DEFAULT_PTY_BUFFER_BYTES,
            destroy_grace_ms: 2000,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub failure_window_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_ms: 30_000,
            failure_window_ms: 60_000,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig::new()
            .with_failure_threshold(settings.failure_threshold)
            .with_success_threshold(settings.success_threshold)
            .with_recovery_timeout(Duration::from_millis(settings.recovery_timeout_ms))
            .with_failure_window(Duration::from_millis(settings.failure_window_ms))
    }
}

/// Request queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub queue_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 100,
            queue_timeout_ms: 30_000,
        }
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        QueueConfig::new()
            .with_max_concurrent(settings.max_concurrent)
            .with_max_queue_size(settings.max_queue_size)
            .with_queue_timeout(Duration::from_millis(settings.queue_timeout_ms))
    }
}

/// Watch service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Notification executable
    pub binary: String,
    /// Globs excluded from every watch in addition to per-watch excludes
    pub default_excludes: Vec<String>,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            binary: "inotifywait".into(),
            default_excludes: crate::watch::DEFAULT_EXCLUDES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
