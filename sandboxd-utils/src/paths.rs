//! Path utilities for sandboxd
//!
//! Handles XDG Base Directory specification compliance for config,
//! state and runtime directories.

use directories::ProjectDirs;
use std::path::PathBuf;

/// Application identifier for XDG directories
const APP_NAME: &str = "sandboxd";

/// Environment variable that overrides the config file location
pub const CONFIG_ENV_VAR: &str = "SANDBOXD_CONFIG";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the runtime directory
///
/// Location: `$XDG_RUNTIME_DIR/sandboxd` or `/tmp/sandboxd-$UID`
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join(APP_NAME)
    } else {
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    }
}

/// Get the configuration directory
///
/// Location: `$XDG_CONFIG_HOME/sandboxd` or `~/.config/sandboxd`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| home_fallback(".config"))
}

/// Get the main configuration file path
///
/// `$SANDBOXD_CONFIG` wins over `$XDG_CONFIG_HOME/sandboxd/config.toml`.
pub fn config_file() -> PathBuf {
    match std::env::var(CONFIG_ENV_VAR) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => config_dir().join("config.toml"),
    }
}

/// Get the state directory
///
/// Location: `$XDG_STATE_HOME/sandboxd` or `~/.local/state/sandboxd`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| home_fallback(".local/state"))
}

/// Get the log directory
///
/// Location: `$XDG_STATE_HOME/sandboxd/log`
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

fn home_fallback(relative: &str) -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(relative)
        .join(APP_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_name() {
        if std::env::var(CONFIG_ENV_VAR).is_err() {
            assert_eq!(config_file().file_name().unwrap(), "config.toml");
        }
    }

    #[test]
    fn test_log_dir_under_state_dir() {
        assert!(log_dir().starts_with(state_dir()));
        assert!(log_dir().ends_with("log"));
    }

    #[test]
    fn test_runtime_dir_mentions_app() {
        let dir = runtime_dir();
        assert!(dir.to_string_lossy().contains(APP_NAME));
    }

    #[test]
    fn test_config_dir_mentions_app() {
        assert!(config_dir().to_string_lossy().contains(APP_NAME));
    }
}
