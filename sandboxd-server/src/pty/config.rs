//! PTY configuration types

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::buffer::DEFAULT_PTY_BUFFER_BYTES;
use crate::config::PtySettings;

/// Manager-wide defaults applied to every new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyManagerConfig {
    /// Program launched when a session names no command
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    /// History kept for late-joining viewers
    pub buffer_bytes: usize,
    /// Wait between the hangup and SIGKILL on destroy
    pub destroy_grace: Duration,
}

impl Default for PtyManagerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            cols: 80,
            rows: 24,
            buffer_bytes: DEFAULT_PTY_BUFFER_BYTES,
            destroy_grace: Duration::from_secs(2),
        }
    }
}

impl From<&PtySettings> for PtyManagerConfig {
    fn from(settings: &PtySettings) -> Self {
        Self {
            shell: settings.shell.clone().unwrap_or_else(default_shell),
            cols: settings.cols,
            rows: settings.rows,
            buffer_bytes: settings.buffer_bytes,
            destroy_grace: Duration::from_millis(settings.destroy_grace_ms),
        }
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".into())
}

/// Per-session options; unset fields fall back to the manager config
#[derive(Debug, Clone, Default)]
pub struct PtyOptions {
    /// Reuse a caller-chosen id instead of generating one
    pub session_id: Option<Uuid>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl PtyOptions {
    /// Options for the default shell
    pub fn shell() -> Self {
        Self::default()
    }

    /// Options for a specific program
    pub fn command(cmd: impl Into<String>) -> Self {
        Self {
            command: Some(cmd.into()),
            ..Default::default()
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = Some(cols);
        self.rows = Some(rows);
        self
    }

    pub fn with_session_id(mut self, id: Uuid) -> Self {
        self.session_id = Some(id);
        self
    }
}
