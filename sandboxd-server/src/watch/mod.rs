//! Filesystem change watching
//!
//! Wraps an external notification tool behind [`FileWatcher`], normalizes
//! its events and filters them through literal-safe glob patterns.

mod glob;
mod service;
mod watcher;

pub use glob::{glob_to_regex, Glob, PathFilter, MAX_PATTERN_LEN};
pub use service::{WatchInfo, WatchOptions, WatchService};
pub use watcher::{parse_inotify_event, FileWatcher, InotifyWatcher, ParsedEvent};

/// Excluded from every watch: VCS metadata, dependency trees, OS litter
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "__pycache__",
    ".venv",
    "target",
    ".DS_Store",
    "Thumbs.db",
];
