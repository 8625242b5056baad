//! Default configuration values
//!
//! These are embedded in the binary and used when no config file exists.

/// Default configuration as TOML (for reference/documentation)
pub const DEFAULT_CONFIG_TOML: &str = r##"
# sandboxd configuration

[server]
listen_addr = "127.0.0.1:7681"

[process]
shell = "/bin/sh"
# Terminal-state processes are swept after this long
retention_secs = 3600
cleanup_interval_secs = 300
# SIGTERM -> SIGKILL escalation delay for timeouts
kill_grace_ms = 5000
# Per-stream stdout/stderr capture
log_buffer_bytes = 1048576

[pty]
# shell = "/bin/bash"
cols = 80
rows = 24
buffer_bytes = 262144
destroy_grace_ms = 2000

[circuit_breaker]
failure_threshold = 5
success_threshold = 2
recovery_timeout_ms = 30000
failure_window_ms = 60000

[queue]
max_concurrent = 10
max_queue_size = 100
queue_timeout_ms = 30000

[watch]
binary = "inotifywait"
default_excludes = [".git", "node_modules", ".DS_Store", "__pycache__", ".svn", ".hg"]
"##;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn test_default_toml_matches_defaults() {
        let parsed: ServerConfig = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        let defaults = ServerConfig::default();

        assert_eq!(parsed.server.listen_addr, defaults.server.listen_addr);
        assert_eq!(parsed.process.retention_secs, defaults.process.retention_secs);
        assert_eq!(parsed.pty.buffer_bytes, defaults.pty.buffer_bytes);
        assert_eq!(parsed.circuit_breaker, defaults.circuit_breaker);
        assert_eq!(parsed.queue, defaults.queue);
        assert_eq!(parsed.watch.default_excludes, defaults.watch.default_excludes);
    }
}
