//! Directory watches backed by notification subprocesses

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use sandboxd_protocol::WatchEvent;
use sandboxd_utils::{Result, SandboxError};

use super::glob::PathFilter;
use super::watcher::{FileWatcher, InotifyWatcher};
use crate::config::WatchSettings;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Options for a new watch
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub recursive: bool,
    /// Globs excluded on top of the service defaults
    pub exclude: Vec<String>,
    /// When non-empty, only paths matching one of these are reported
    pub patterns: Vec<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            exclude: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_exclude(mut self, glob: impl Into<String>) -> Self {
        self.exclude.push(glob.into());
        self
    }

    pub fn with_pattern(mut self, glob: impl Into<String>) -> Self {
        self.patterns.push(glob.into());
        self
    }
}

/// Snapshot of a watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchInfo {
    pub id: String,
    pub path: PathBuf,
    pub recursive: bool,
    pub patterns: Vec<String>,
    pub excludes: Vec<String>,
    pub pid: Option<u32>,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

struct WatchHandle {
    info: WatchInfo,
    active: AtomicBool,
    cancel: CancellationToken,
    events: broadcast::Sender<WatchEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatchHandle {
    fn info(&self) -> WatchInfo {
        WatchInfo {
            active: self.active.load(Ordering::SeqCst),
            ..self.info.clone()
        }
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Registry of directory watches
pub struct WatchService {
    watcher: Arc<dyn FileWatcher>,
    default_excludes: Vec<String>,
    watches: Arc<DashMap<String, Arc<WatchHandle>>>,
}

impl WatchService {
    pub fn new(watcher: Arc<dyn FileWatcher>, default_excludes: Vec<String>) -> Self {
        Self {
            watcher,
            default_excludes,
            watches: Arc::new(DashMap::new()),
        }
    }

    /// Service backed by `inotifywait`
    pub fn from_settings(settings: &WatchSettings) -> Self {
        Self::new(
            Arc::new(InotifyWatcher::new(settings.binary.clone())),
            settings.default_excludes.clone(),
        )
    }

    /// Start watching `path`
    pub fn watch_directory(&self, path: impl AsRef<Path>, options: WatchOptions) -> Result<WatchInfo> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SandboxError::FileNotFound(path.to_path_buf()));
        }

        let mut excludes = self.default_excludes.clone();
        excludes.extend(options.exclude.iter().cloned());
        let filter = PathFilter::new(&options.patterns, &excludes)?;

        let mut child = self
            .watcher
            .command(path, options.recursive)
            .spawn()
            .map_err(|e| SandboxError::spawn(format!("Failed to start {}: {}", self.watcher.name(), e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::internal("watcher stdout was not captured"))?;

        let id = format!("watch_{}", Uuid::new_v4().simple());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handle = Arc::new(WatchHandle {
            info: WatchInfo {
                id: id.clone(),
                path: path.to_path_buf(),
                recursive: options.recursive,
                patterns: options.patterns,
                excludes,
                pid: child.id(),
                active: true,
                started_at: Utc::now(),
            },
            active: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            events,
            task: Mutex::new(None),
        });

        self.watches.insert(id.clone(), Arc::clone(&handle));
        let task = tokio::spawn(run_watch(
            Arc::clone(&handle),
            Arc::clone(&self.watcher),
            Arc::clone(&self.watches),
            child,
            stdout,
            filter,
        ));
        *handle.task.lock() = Some(task);

        info!(
            watch_id = %id,
            path = %path.display(),
            recursive = options.recursive,
            "Watch started"
        );
        Ok(handle.info())
    }

    /// Receive events of one watch from now on
    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        self.watches
            .get(id)
            .map(|h| h.events.subscribe())
            .ok_or_else(|| SandboxError::WatchNotFound(id.to_string()))
    }

    pub fn get_watch(&self, id: &str) -> Result<WatchInfo> {
        self.watches
            .get(id)
            .map(|h| h.info())
            .ok_or_else(|| SandboxError::WatchNotFound(id.to_string()))
    }

    pub fn get_active_watches(&self) -> Vec<WatchInfo> {
        let mut list: Vec<WatchInfo> = self
            .watches
            .iter()
            .map(|h| h.value().info())
            .filter(|info| info.active)
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    /// Stop one watch and its subprocess
    pub async fn stop_watch(&self, id: &str) -> Result<()> {
        let (_, handle) = self
            .watches
            .remove(id)
            .ok_or_else(|| SandboxError::WatchNotFound(id.to_string()))?;
        handle.stop().await;
        info!(watch_id = %id, "Watch stopped");
        Ok(())
    }

    /// Stop every watch; returns how many were stopped
    pub async fn stop_all_watches(&self) -> usize {
        let ids: Vec<String> = self.watches.iter().map(|h| h.key().clone()).collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop_watch(&id).await.is_ok() {
                stopped += 1;
            }
        }
        stopped
    }

    pub async fn shutdown(&self) {
        let stopped = self.stop_all_watches().await;
        debug!(count = stopped, "Watch service shut down");
    }
}

impl std::fmt::Debug for WatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchService")
            .field("watcher", &self.watcher.name())
            .field("watches", &self.watches.len())
            .finish()
    }
}

async fn run_watch(
    handle: Arc<WatchHandle>,
    watcher: Arc<dyn FileWatcher>,
    watches: Arc<DashMap<String, Arc<WatchHandle>>>,
    mut child: Child,
    stdout: ChildStdout,
    filter: PathFilter,
) {
    let id = handle.info.id.clone();
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(parsed) = watcher.parse_line(&line) else {
                        debug!(watch_id = %id, line = %line, "Dropping unrecognized watcher output");
                        continue;
                    };
                    if !filter.admits(&parsed.path) {
                        trace!(watch_id = %id, path = %parsed.path, "Filtered watch event");
                        continue;
                    }
                    let _ = handle.events.send(WatchEvent {
                        watch_id: id.clone(),
                        event_type: parsed.event_type,
                        path: parsed.path,
                        is_directory: parsed.is_directory,
                        timestamp: Utc::now(),
                    });
                }
                Ok(None) => {
                    let status = child.wait().await;
                    info!(watch_id = %id, status = ?status.ok(), "Watcher process exited");
                    break;
                }
                Err(e) => {
                    warn!(watch_id = %id, error = %e, "Failed to read watcher output");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break;
                }
            }
        }
    }

    handle.active.store(false, Ordering::SeqCst);
    watches.remove_if(&id, |_, current| Arc::ptr_eq(current, &handle));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::process::Command;

    use super::super::watcher::{parse_inotify_event, ParsedEvent};
    use sandboxd_protocol::FileEventType;

    /// Prints canned inotify lines after a short delay, then idles
    struct ScriptedWatcher {
        lines: Vec<&'static str>,
    }

    impl FileWatcher for ScriptedWatcher {
        fn name(&self) -> &str {
            "scripted"
        }

        fn command(&self, _path: &Path, _recursive: bool) -> Command {
            let script = format!(
                "sleep 0.2; printf '{}'; sleep 30",
                self.lines.iter().map(|l| format!("{}\\n", l)).collect::<String>()
            );
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c")
                .arg(script)
                .stdout(std::process::Stdio::piped())
                .kill_on_drop(true);
            cmd
        }

        fn parse_line(&self, line: &str) -> Option<ParsedEvent> {
            parse_inotify_event(line)
        }
    }

    fn service(lines: Vec<&'static str>) -> WatchService {
        WatchService::new(
            Arc::new(ScriptedWatcher { lines }),
            crate::watch::DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_missing_path_is_file_not_found() {
        let service = service(vec![]);
        let result = service.watch_directory("/definitely/not/here", WatchOptions::new());
        assert!(matches!(result, Err(SandboxError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_events_are_parsed_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(vec![
            "CREATE|/app/src/main.ts|CREATE",
            "bad-line",
            "MODIFY|/app/.git/index|MODIFY",
            "CLOSE_WRITE,CLOSE|/app/notes.md|CLOSE_WRITE,CLOSE",
            "CREATE,ISDIR|/app/newdir|ISDIR",
        ]);

        let info = service.watch_directory(dir.path(), WatchOptions::new()).unwrap();
        assert!(info.active);
        assert!(info.excludes.iter().any(|e| e == ".git"));
        let mut rx = service.subscribe(&info.id).unwrap();

        let mut events = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(event);
        }

        assert_eq!(events[0].path, "/app/src/main.ts");
        assert_eq!(events[0].event_type, FileEventType::Create);
        assert_eq!(events[0].watch_id, info.id);
        assert_eq!(events[1].event_type, FileEventType::Modify);
        assert_eq!(events[1].path, "/app/notes.md");
        assert!(events[2].is_directory);

        service.stop_watch(&info.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_patterns_limit_events() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(vec![
            "CREATE|/app/readme.md|CREATE",
            "CREATE|/app/lib.rs|CREATE",
        ]);
        let info = service
            .watch_directory(dir.path(), WatchOptions::new().with_pattern("*.rs"))
            .unwrap();
        let mut rx = service.subscribe(&info.id).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, "/app/lib.rs");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(vec![]);
        let long = "z".repeat(super::super::glob::MAX_PATTERN_LEN + 1);
        let result = service.watch_directory(dir.path(), WatchOptions::new().with_pattern(long));
        assert!(matches!(result, Err(SandboxError::InvalidPattern(_))));
        assert!(service.get_active_watches().is_empty());
    }

    #[tokio::test]
    async fn test_stop_watch_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(vec![]);
        let a = service.watch_directory(dir.path(), WatchOptions::new()).unwrap();
        let b = service
            .watch_directory(dir.path(), WatchOptions::new().recursive(false))
            .unwrap();
        assert_eq!(service.get_active_watches().len(), 2);
        assert!(!service.get_watch(&b.id).unwrap().recursive);

        service.stop_watch(&a.id).await.unwrap();
        assert!(matches!(
            service.stop_watch(&a.id).await,
            Err(SandboxError::WatchNotFound(_))
        ));
        assert!(matches!(
            service.subscribe(&a.id),
            Err(SandboxError::WatchNotFound(_))
        ));

        assert_eq!(service.stop_all_watches().await, 1);
        assert!(service.get_active_watches().is_empty());
    }

    #[tokio::test]
    async fn test_exited_watcher_is_removed() {
        struct ShortLived;
        impl FileWatcher for ShortLived {
            fn name(&self) -> &str {
                "short-lived"
            }
            fn command(&self, _path: &Path, _recursive: bool) -> Command {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg("exit 0").stdout(std::process::Stdio::piped());
                cmd
            }
            fn parse_line(&self, line: &str) -> Option<ParsedEvent> {
                parse_inotify_event(line)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let service = WatchService::new(Arc::new(ShortLived), Vec::new());
        let info = service.watch_directory(dir.path(), WatchOptions::new()).unwrap();

        for _ in 0..200 {
            if service.get_watch(&info.id).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.get_active_watches().is_empty());
    }
}
