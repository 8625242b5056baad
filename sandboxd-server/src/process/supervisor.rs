//! Child process supervision
//!
//! Every command runs through the configured shell in its own process
//! group, so signals reach the whole tree the command creates. Output is
//! captured per stream into bounded ring buffers and fanned out to any
//! number of log subscribers.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sandboxd_protocol::{LogRecord, LogRecordKind};
use sandboxd_utils::{Result, SandboxError};

use super::signal::{parse_signal, signal_name, signal_process_group};
use super::types::{ExecResult, Process, ProcessLogs, ProcessOptions, ProcessStatus, TIMEOUT_EXIT_CODE};
use crate::buffer::RingBuffer;

const READ_CHUNK_SIZE: usize = 8192;
const LOG_CHANNEL_CAPACITY: usize = 1024;

/// How long pipes are drained after the group leader exits
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How often a killed group is checked for survivors
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Append-only stream of log records for one process
pub type LogStream = BoxStream<'static, LogRecord>;

/// Supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Shell used as `<shell> -c <command>`
    pub shell: String,
    /// How long terminal processes stay listed before cleanup
    pub retention: Duration,
    /// Wait between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// Capacity of each per-stream output buffer
    pub log_buffer_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".into(),
            retention: Duration::from_secs(3600),
            kill_grace: Duration::from_secs(5),
            log_buffer_bytes: 1024 * 1024,
        }
    }
}

struct EntryState {
    process: Process,
    finished_at: Option<Instant>,
}

struct LogState {
    stdout: RingBuffer,
    stderr: RingBuffer,
    /// Final record, once the process is terminal
    closing: Option<LogRecord>,
}

struct ProcessEntry {
    state: Mutex<EntryState>,
    logs: Mutex<LogState>,
    log_tx: broadcast::Sender<LogRecord>,
    status_tx: watch::Sender<ProcessStatus>,
    kill_requested: AtomicBool,
    timed_out: AtomicBool,
}

impl ProcessEntry {
    fn new(process: Process, log_buffer_bytes: usize) -> Self {
        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(process.status);
        Self {
            state: Mutex::new(EntryState {
                process,
                finished_at: None,
            }),
            logs: Mutex::new(LogState {
                stdout: RingBuffer::new(log_buffer_bytes),
                stderr: RingBuffer::new(log_buffer_bytes),
                closing: None,
            }),
            log_tx,
            status_tx,
            kill_requested: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> Process {
        self.state.lock().process.clone()
    }

    fn id(&self) -> String {
        self.state.lock().process.id.clone()
    }

    fn status(&self) -> ProcessStatus {
        self.state.lock().process.status
    }

    fn pid(&self) -> Option<u32> {
        self.state.lock().process.pid
    }

    fn is_expired(&self, retention: Duration) -> bool {
        self.state
            .lock()
            .finished_at
            .map_or(false, |at| at.elapsed() >= retention)
    }

    /// Apply a forward status change; backward or repeated changes are ignored
    fn transition(&self, next: ProcessStatus, update: impl FnOnce(&mut Process)) -> bool {
        let mut state = self.state.lock();
        let current = state.process.status;
        if !current.can_transition_to(next) {
            debug!(
                process_id = %state.process.id,
                from = %current,
                to = %next,
                "Ignoring status change"
            );
            return false;
        }

        state.process.status = next;
        update(&mut state.process);
        if next.is_terminal() {
            state.process.end_time = Some(Utc::now());
            state.finished_at = Some(Instant::now());
        }
        drop(state);

        self.status_tx.send_replace(next);
        true
    }

    fn append(&self, kind: LogRecordKind, bytes: &[u8]) {
        let mut logs = self.logs.lock();
        match kind {
            LogRecordKind::Stdout => logs.stdout.write(bytes),
            LogRecordKind::Stderr => logs.stderr.write(bytes),
            _ => {}
        }
        let _ = self
            .log_tx
            .send(LogRecord::new(kind, String::from_utf8_lossy(bytes)));
    }

    fn close_log(&self, record: LogRecord) {
        let mut logs = self.logs.lock();
        if logs.closing.is_some() {
            return;
        }
        logs.closing = Some(record.clone());
        let _ = self.log_tx.send(record);
    }

    fn logs(&self) -> ProcessLogs {
        let logs = self.logs.lock();
        ProcessLogs {
            stdout: logs.stdout.read_string(),
            stderr: logs.stderr.read_string(),
        }
    }

    /// Buffered history followed by live output, ending at the closing record
    fn stream(&self) -> LogStream {
        // Snapshot and subscribe under one lock so nothing falls in between
        let logs = self.logs.lock();
        let rx = self.log_tx.subscribe();
        let mut history = Vec::new();
        if !logs.stdout.is_empty() {
            history.push(LogRecord::stdout(logs.stdout.read_string()));
        }
        if !logs.stderr.is_empty() {
            history.push(LogRecord::stderr(logs.stderr.read_string()));
        }
        let closing = logs.closing.clone();
        drop(logs);

        if let Some(closing) = closing {
            history.push(closing);
            return stream::iter(history).boxed();
        }

        let live = stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            match rx.recv().await {
                Ok(record) => {
                    let next = if record.is_terminal() { None } else { Some(rx) };
                    Some((record, next))
                }
                Err(RecvError::Lagged(skipped)) => Some((
                    LogRecord::new(
                        LogRecordKind::Stderr,
                        format!("[log stream lagged, {} records dropped]\n", skipped),
                    ),
                    Some(rx),
                )),
                Err(RecvError::Closed) => None,
            }
        });

        stream::iter(history).chain(live).boxed()
    }

    async fn wait_terminal(&self) -> Process {
        let mut rx = self.status_tx.subscribe();
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.snapshot()
    }

    fn finish(&self, status: io::Result<ExitStatus>) {
        let id = self.id();
        match status {
            Ok(status) => {
                let code = status.code();
                let signal = status.signal().map(|n| {
                    signal_name(n)
                        .map(str::to_string)
                        .unwrap_or_else(|| n.to_string())
                });
                let next = if self.kill_requested.load(Ordering::SeqCst) {
                    ProcessStatus::Killed
                } else if code == Some(0) {
                    ProcessStatus::Completed
                } else {
                    ProcessStatus::Failed
                };

                self.transition(next, |p| {
                    p.exit_code = code;
                    p.signal = signal.clone();
                });

                let data = match (code, &signal) {
                    (Some(code), _) => code.to_string(),
                    (None, Some(signal)) => signal.clone(),
                    (None, None) => "unknown".to_string(),
                };
                self.close_log(LogRecord::new(LogRecordKind::Exit, data));
                info!(
                    process_id = %id,
                    status = %next,
                    exit_code = ?code,
                    signal = ?signal,
                    "Process exited"
                );
            }
            Err(e) => {
                let message = format!("wait failed: {}", e);
                self.transition(ProcessStatus::Failed, |p| p.error = Some(message.clone()));
                self.close_log(LogRecord::new(LogRecordKind::Error, message));
                warn!(process_id = %id, error = %e, "Failed to wait for process");
            }
        }
    }
}

/// Registry and lifecycle owner for child processes
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    processes: DashMap<String, Arc<ProcessEntry>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            processes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn entry(&self, id: &str) -> Result<Arc<ProcessEntry>> {
        self.processes
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SandboxError::ProcessNotFound(id.to_string()))
    }

    /// Spawn `command` and return its record
    ///
    /// The returned record carries the pid and `starting` status. A failed
    /// spawn is not an error here: the record comes back with status
    /// `error` and the cause in `error`.
    pub fn start_process(&self, command: &str, opts: ProcessOptions) -> Result<Process> {
        let id = opts
            .process_id
            .clone()
            .unwrap_or_else(generate_process_id);

        let entry = Arc::new(ProcessEntry::new(
            Process {
                id: id.clone(),
                pid: None,
                command: command.to_string(),
                status: ProcessStatus::Starting,
                start_time: Utc::now(),
                end_time: None,
                exit_code: None,
                signal: None,
                session_id: opts.session_id.clone(),
                error: None,
            },
            self.config.log_buffer_bytes,
        ));

        match self.processes.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(SandboxError::spawn(format!("process id already in use: {}", id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(command)
            .envs(&opts.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = e.to_string();
                warn!(process_id = %id, command = %command, error = %e, "Failed to spawn process");
                entry.transition(ProcessStatus::Error, |p| p.error = Some(message.clone()));
                entry.close_log(LogRecord::new(LogRecordKind::Error, message));
                return Ok(entry.snapshot());
            }
        };

        let pid = child.id();
        entry.state.lock().process.pid = pid;
        let snapshot = entry.snapshot();
        info!(process_id = %id, pid = ?pid, command = %command, "Process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(monitor(
            entry,
            child,
            stdout,
            stderr,
            opts.timeout,
            self.config.kill_grace,
        ));

        Ok(snapshot)
    }

    /// Run `command` to completion and collect its output
    ///
    /// When `opts.timeout` elapses the process tree is terminated and the
    /// result reports `timed_out` with exit code 124.
    pub async fn exec(&self, command: &str, opts: ProcessOptions) -> Result<ExecResult> {
        let started = Instant::now();
        let process = self.start_process(command, opts)?;
        let entry = self.entry(&process.id)?;

        if process.status == ProcessStatus::Error {
            self.processes.remove(&process.id);
            return Err(SandboxError::spawn(process.error.unwrap_or_default()));
        }

        let finished = entry.wait_terminal().await;
        let logs = entry.logs();
        let timed_out = entry.timed_out.load(Ordering::SeqCst);
        self.processes.remove(&finished.id);

        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            match (finished.exit_code, finished.signal.as_deref()) {
                (Some(code), _) => code,
                (None, Some(signal)) => parse_signal(signal).map(|n| 128 + n).unwrap_or(-1),
                (None, None) => -1,
            }
        };

        Ok(ExecResult {
            exit_code,
            stdout: logs.stdout,
            stderr: logs.stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
        })
    }

    /// Signal the process group of `id` (default `SIGTERM`)
    ///
    /// Unknown and already-finished processes report `ProcessNotFound`.
    /// A SIGTERM that is ignored past the kill grace period is followed by
    /// SIGKILL, and group members still alive a grace period after the
    /// leader exits are killed before the process is reported finished.
    pub fn kill_process(&self, id: &str, signal: Option<&str>) -> Result<()> {
        let signal = parse_signal(signal.unwrap_or("SIGTERM"))?;
        let entry = self.entry(id)?;

        if entry.status().is_terminal() {
            return Err(SandboxError::ProcessNotFound(id.to_string()));
        }
        let pid = entry
            .pid()
            .ok_or_else(|| SandboxError::ProcessNotFound(id.to_string()))?;

        entry.kill_requested.store(true, Ordering::SeqCst);
        if !signal_process_group(pid, signal) {
            debug!(process_id = %id, pid = pid, "Process group already gone");
        }
        info!(process_id = %id, pid = pid, signal = ?signal_name(signal), "Process signalled");

        if signal == libc::SIGTERM {
            let grace = self.config.kill_grace;
            let id = id.to_string();
            tokio::spawn(async move {
                if tokio::time::timeout(grace, entry.wait_terminal()).await.is_err() {
                    warn!(process_id = %id, "Process ignored SIGTERM, sending SIGKILL");
                    signal_process_group(pid, libc::SIGKILL);
                }
            });
        }

        Ok(())
    }

    /// Terminate every live process; returns how many were signalled
    pub fn kill_all_processes(&self) -> usize {
        let live: Vec<String> = self
            .processes
            .iter()
            .filter(|e| !e.value().status().is_terminal())
            .map(|e| e.key().clone())
            .collect();

        let killed = live
            .iter()
            .filter(|id| self.kill_process(id, None).is_ok())
            .count();
        if killed > 0 {
            info!(count = killed, "Killed all processes");
        }
        killed
    }

    /// Resolve once `id` reaches a terminal status
    pub async fn wait_for_exit(&self, id: &str, timeout: Option<Duration>) -> Result<Process> {
        let entry = self.entry(id)?;
        match timeout {
            Some(limit) => tokio::time::timeout(limit, entry.wait_terminal())
                .await
                .map_err(|_| SandboxError::TimeoutExceeded {
                    timeout_ms: limit.as_millis() as u64,
                }),
            None => Ok(entry.wait_terminal().await),
        }
    }

    pub fn get_process(&self, id: &str) -> Result<Process> {
        Ok(self.entry(id)?.snapshot())
    }

    /// All known processes, oldest first
    pub fn list_processes(&self) -> Vec<Process> {
        let mut list: Vec<Process> = self
            .processes
            .iter()
            .map(|e| e.value().snapshot())
            .collect();
        list.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        list
    }

    pub fn get_process_logs(&self, id: &str) -> Result<ProcessLogs> {
        Ok(self.entry(id)?.logs())
    }

    /// Buffered history, then live output, ending with an exit or error record
    pub fn stream_process_logs(&self, id: &str) -> Result<LogStream> {
        Ok(self.entry(id)?.stream())
    }

    /// Drop terminal processes older than the retention window
    pub fn cleanup_completed_processes(&self) -> usize {
        let retention = self.config.retention;
        let mut removed = 0;
        self.processes.retain(|id, entry| {
            if entry.is_expired(retention) {
                debug!(process_id = %id, "Removing expired process");
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            info!(count = removed, "Cleaned up completed processes");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.processes.len()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.config)
            .field("processes", &self.processes.len())
            .finish()
    }
}

fn generate_process_id() -> String {
    format!("proc_{}", Uuid::new_v4().simple())
}

async fn monitor(
    entry: Arc<ProcessEntry>,
    mut child: Child,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    timeout: Option<Duration>,
    kill_grace: Duration,
) {
    entry.transition(ProcessStatus::Running, |_| {});

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = stdout {
        pumps.push(tokio::spawn(pump(Arc::clone(&entry), stdout, LogRecordKind::Stdout)));
    }
    if let Some(stderr) = stderr {
        pumps.push(tokio::spawn(pump(Arc::clone(&entry), stderr, LogRecordKind::Stderr)));
    }

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    process_id = %entry.id(),
                    timeout_ms = limit.as_millis() as u64,
                    "Process timed out, terminating process group"
                );
                entry.timed_out.store(true, Ordering::SeqCst);
                entry.kill_requested.store(true, Ordering::SeqCst);
                terminate_group(&mut child, kill_grace).await
            }
        },
        None => child.wait().await,
    };

    // A killed leader can leave group members behind; sweep them before
    // the process is reported as finished
    if entry.kill_requested.load(Ordering::SeqCst) {
        if let Some(pid) = entry.pid() {
            sweep_group(pid, kill_grace).await;
        }
    }

    // Background grandchildren may hold the pipes open
    for mut handle in pumps {
        if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut handle).await.is_err() {
            handle.abort();
        }
    }

    entry.finish(status);
}

/// SIGTERM the group, then SIGKILL whatever is left after `grace`
async fn terminate_group(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        return child.wait().await;
    };

    signal_process_group(pid, libc::SIGTERM);
    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            signal_process_group(pid, libc::SIGKILL);
            child.wait().await
        }
    };

    // The leader is gone; make sure nothing in its group outlives it
    signal_process_group(pid, libc::SIGKILL);
    status
}

/// Wait up to `grace` for the group to empty, then SIGKILL what remains
async fn sweep_group(pid: u32, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while signal_process_group(pid, 0) {
        if tokio::time::Instant::now() >= deadline {
            debug!(pid = pid, "Process group outlived its leader, sending SIGKILL");
            signal_process_group(pid, libc::SIGKILL);
            return;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }
}

async fn pump<R>(entry: Arc<ProcessEntry>, mut reader: R, kind: LogRecordKind)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => entry.append(kind, &buf[..n]),
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}
