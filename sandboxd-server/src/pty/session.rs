//! A pseudo-terminal paired with the process running inside it
//!
//! Output is read on a blocking thread, appended to a bounded history
//! buffer and fanned out to every registered listener. Each listener call
//! runs behind its own panic boundary so one faulty consumer cannot stop
//! the others or the history.

use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use sandboxd_utils::{Result, SandboxError};

use super::config::{PtyManagerConfig, PtyOptions};
use crate::buffer::RingBuffer;
use crate::process::signal_process_group;

const READ_BUFFER_SIZE: usize = 4096;

/// How long output is still drained after the process exits
const PTY_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Callback receiving every chunk of terminal output
pub type DataListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyState {
    Uninitialized,
    Active,
    Closed,
}

/// How the attached process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PtyExit {
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// Snapshot of a session for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyInfo {
    pub id: Uuid,
    pub pid: Option<u32>,
    pub command: String,
    pub cols: u16,
    pub rows: u16,
    pub state: PtyState,
    pub buffered_bytes: usize,
    pub created_at: DateTime<Utc>,
}

struct Inner {
    state: PtyState,
    cols: u16,
    rows: u16,
    buffer: RingBuffer,
    listeners: Vec<(u64, DataListener)>,
    next_listener: u64,
}

/// One terminal session
pub struct PtySession {
    id: Uuid,
    pid: Option<u32>,
    command: String,
    created_at: DateTime<Utc>,
    destroy_grace: Duration,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    inner: Mutex<Inner>,
    exit_tx: watch::Sender<Option<PtyExit>>,
    destroying: AtomicBool,
    cancel: CancellationToken,
}

/// Registration of a data listener; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    session: Weak<PtySession>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.inner.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl PtySession {
    /// Allocate a pty, start the command in it and begin reading output
    pub fn spawn(options: PtyOptions, config: &PtyManagerConfig) -> Result<Arc<Self>> {
        let id = options.session_id.unwrap_or_else(Uuid::new_v4);
        let cols = options.cols.unwrap_or(config.cols);
        let rows = options.rows.unwrap_or(config.rows);
        let command = options.command.clone().unwrap_or_else(|| config.shell.clone());

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SandboxError::pty(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&command);
        cmd.args(&options.args);
        if let Some(cwd) = &options.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SandboxError::spawn(format!("Failed to spawn {}: {}", command, e)))?;
        // The slave must close here or the reader never sees EOF
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SandboxError::pty(format!("Failed to clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SandboxError::pty(format!("Failed to get writer: {}", e)))?;

        let pid = child.process_id();
        let (exit_tx, _) = watch::channel(None);

        let session = Arc::new(Self {
            id,
            pid,
            command,
            created_at: Utc::now(),
            destroy_grace: config.destroy_grace,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            inner: Mutex::new(Inner {
                state: PtyState::Uninitialized,
                cols,
                rows,
                buffer: RingBuffer::new(config.buffer_bytes),
                listeners: Vec::new(),
                next_listener: 0,
            }),
            exit_tx,
            destroying: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        session.inner.lock().state = PtyState::Active;
        tokio::spawn(Arc::clone(&session).run(reader, child));

        info!(session_id = %id, pid = ?pid, command = %session.command, "PTY session created");
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> PtyState {
        self.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PtyState::Closed
    }

    pub fn size(&self) -> (u16, u16) {
        let inner = self.inner.lock();
        (inner.cols, inner.rows)
    }

    pub fn info(&self) -> PtyInfo {
        let inner = self.inner.lock();
        PtyInfo {
            id: self.id,
            pid: self.pid,
            command: self.command.clone(),
            cols: inner.cols,
            rows: inner.rows,
            state: inner.state,
            buffered_bytes: inner.buffer.len(),
            created_at: self.created_at,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.destroying.load(Ordering::SeqCst) || self.is_closed() {
            return Err(SandboxError::Closed(self.id.to_string()));
        }
        Ok(())
    }

    /// Forward input to the terminal
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock();
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| SandboxError::pty(format!("Write failed: {}", e)))
    }

    /// Change the terminal geometry seen by the attached process
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.ensure_open()?;
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SandboxError::pty(format!("Resize failed: {}", e)))?;

        let mut inner = self.inner.lock();
        inner.cols = cols;
        inner.rows = rows;
        debug!(session_id = %self.id, cols = cols, rows = rows, "PTY resized");
        Ok(())
    }

    /// Register a listener for output produced from now on
    pub fn on_data(self: &Arc<Self>, listener: DataListener) -> Result<Subscription> {
        self.ensure_open()?;
        let mut inner = self.inner.lock();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.push((id, listener));
        Ok(Subscription {
            id,
            session: Arc::downgrade(self),
        })
    }

    /// Register a listener and return the history it follows, atomically
    pub fn attach(self: &Arc<Self>, listener: DataListener) -> Result<(Vec<u8>, Subscription)> {
        self.ensure_open()?;
        let mut inner = self.inner.lock();
        let history = inner.buffer.read_all();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.push((id, listener));
        Ok((
            history,
            Subscription {
                id,
                session: Arc::downgrade(self),
            },
        ))
    }

    /// Recent output kept for replay
    pub fn history(&self) -> Vec<u8> {
        self.inner.lock().buffer.read_all()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Receiver that yields the exit once the session closes
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<PtyExit>> {
        self.exit_tx.subscribe()
    }

    /// Resolve once the session is closed
    pub async fn wait_closed(&self) -> Option<PtyExit> {
        let mut rx = self.exit_tx.subscribe();
        let exit = rx.wait_for(|exit| exit.is_some()).await.ok()?.clone();
        exit
    }

    /// Terminate the attached process and release the session
    ///
    /// Sends SIGHUP and SIGTERM to the process group, then SIGKILL if it
    /// is still alive after the grace period. Safe to call repeatedly and
    /// concurrently with the process exiting on its own.
    pub async fn destroy(&self) {
        if self.destroying.swap(true, Ordering::SeqCst) {
            self.wait_closed().await;
            return;
        }

        if !self.is_closed() {
            if let Some(pid) = self.pid {
                signal_process_group(pid, libc::SIGHUP);
                signal_process_group(pid, libc::SIGTERM);
                if tokio::time::timeout(self.destroy_grace, self.wait_closed())
                    .await
                    .is_err()
                {
                    warn!(session_id = %self.id, pid = pid, "PTY process ignored hangup, sending SIGKILL");
                    signal_process_group(pid, libc::SIGKILL);
                }
            }
        }

        self.cancel.cancel();
        if tokio::time::timeout(self.destroy_grace, self.wait_closed())
            .await
            .is_err()
        {
            self.mark_closed(PtyExit {
                code: None,
                signal: Some("SIGKILL".into()),
            });
        }
        info!(session_id = %self.id, "PTY session destroyed");
    }

    fn dispatch(&self, data: &[u8]) {
        let listeners = {
            let mut inner = self.inner.lock();
            inner.buffer.write(data);
            inner.listeners.clone()
        };

        for (listener_id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(data))).is_err() {
                warn!(
                    session_id = %self.id,
                    listener = listener_id,
                    "PTY data listener panicked"
                );
            }
        }
    }

    fn mark_closed(&self, exit: PtyExit) {
        {
            let mut inner = self.inner.lock();
            if inner.state == PtyState::Closed {
                return;
            }
            inner.state = PtyState::Closed;
            inner.listeners.clear();
            inner.buffer.clear();
        }
        info!(
            session_id = %self.id,
            code = ?exit.code,
            signal = ?exit.signal,
            "PTY session closed"
        );
        self.exit_tx.send_replace(Some(exit));
    }

    async fn run(
        self: Arc<Self>,
        reader: Box<dyn Read + Send>,
        child: Box<dyn Child + Send + Sync>,
    ) {
        let (data_tx, mut data_rx) = mpsc::channel::<Vec<u8>>(64);
        let session_id = self.id;
        tokio::task::spawn_blocking(move || read_loop(reader, data_tx, session_id));

        let mut child = child;
        let mut wait_task = tokio::task::spawn_blocking(move || child.wait());

        let mut exit: Option<PtyExit> = None;
        let drain = tokio::time::sleep(Duration::from_secs(u32::MAX as u64));
        tokio::pin!(drain);

        loop {
            tokio::select! {
                chunk = data_rx.recv() => match chunk {
                    Some(data) => self.dispatch(&data),
                    None => break,
                },
                status = &mut wait_task, if exit.is_none() => {
                    exit = Some(exit_from(status));
                    drain.as_mut().reset(tokio::time::Instant::now() + PTY_DRAIN_TIMEOUT);
                }
                _ = &mut drain, if exit.is_some() => break,
                _ = self.cancel.cancelled() => break,
            }
        }

        let exit = match exit {
            Some(exit) => exit,
            None => exit_from((&mut wait_task).await),
        };
        self.mark_closed(exit);
    }
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn exit_from(
    status: std::result::Result<std::io::Result<portable_pty::ExitStatus>, tokio::task::JoinError>,
) -> PtyExit {
    match status {
        Ok(Ok(status)) => PtyExit {
            code: Some(status.exit_code() as i32),
            signal: status.signal().map(str::to_string),
        },
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to wait for PTY process");
            PtyExit {
                code: None,
                signal: None,
            }
        }
        Err(e) => {
            warn!(error = %e, "PTY wait task failed");
            PtyExit {
                code: None,
                signal: None,
            }
        }
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, data_tx: mpsc::Sender<Vec<u8>>, session_id: Uuid) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if data_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    trace!(session_id = %session_id, "Data channel closed, reader exiting");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the slave side is gone
                trace!(session_id = %session_id, error = %e, "PTY read ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config() -> PtyManagerConfig {
        PtyManagerConfig {
            shell: "/bin/sh".into(),
            destroy_grace: Duration::from_millis(500),
            ..PtyManagerConfig::default()
        }
    }

    fn collector() -> (DataListener, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: DataListener = Arc::new(move |data: &[u8]| sink.lock().extend_from_slice(data));
        (listener, seen)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached");
    }

    fn contains(haystack: &[u8], needle: &str) -> bool {
        String::from_utf8_lossy(haystack).contains(needle)
    }

    #[tokio::test]
    async fn test_output_reaches_listeners() {
        let session = PtySession::spawn(PtyOptions::command("cat"), &config()).unwrap();
        assert_eq!(session.state(), PtyState::Active);
        assert!(session.pid().is_some());

        let (listener, seen) = collector();
        let _sub = session.on_data(listener).unwrap();
        session.write(b"ping\n").unwrap();

        wait_until(|| contains(&seen.lock(), "ping")).await;
        assert!(contains(&session.history(), "ping"));
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let session = PtySession::spawn(PtyOptions::command("cat"), &config()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _bad = session
            .on_data(Arc::new(move |_: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("listener failure");
            }))
            .unwrap();
        let (listener, seen) = collector();
        let _good = session.on_data(listener).unwrap();

        session.write(b"first\n").unwrap();
        wait_until(|| contains(&seen.lock(), "first")).await;
        session.write(b"second\n").unwrap();
        wait_until(|| contains(&seen.lock(), "second")).await;

        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(session.listener_count(), 2);
        assert!(contains(&session.history(), "second"));
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let session = PtySession::spawn(PtyOptions::command("cat"), &config()).unwrap();
        let (listener, _) = collector();
        let sub = session.on_data(listener).unwrap();
        assert_eq!(session.listener_count(), 1);
        sub.unsubscribe();
        assert_eq!(session.listener_count(), 0);
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = PtyManagerConfig {
            buffer_bytes: 64,
            ..config()
        };
        let session = PtySession::spawn(
            PtyOptions::command("/bin/sh")
                .with_args(["-c", "i=0; while [ $i -lt 50 ]; do echo line-$i; i=$((i+1)); done; sleep 5"]),
            &config,
        )
        .unwrap();

        wait_until(|| contains(&session.history(), "line-49")).await;
        assert!(session.history().len() <= 64);
        assert!(!contains(&session.history(), "line-0\r"));
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_process_exit_closes_session() {
        let session = PtySession::spawn(
            PtyOptions::command("/bin/sh").with_args(["-c", "exit 3"]),
            &config(),
        )
        .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), session.wait_closed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(session.is_closed());
        assert!(matches!(session.write(b"x"), Err(SandboxError::Closed(_))));
        assert!(matches!(session.resize(10, 10), Err(SandboxError::Closed(_))));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let session = PtySession::spawn(PtyOptions::command("sleep").with_arg("300"), &config()).unwrap();
        let (listener, _) = collector();
        let _sub = session.on_data(listener).unwrap();

        tokio::join!(session.destroy(), session.destroy());
        session.destroy().await;

        assert!(session.is_closed());
        assert_eq!(session.listener_count(), 0);
        assert!(session.history().is_empty());
        assert!(matches!(session.write(b"x"), Err(SandboxError::Closed(_))));
        assert!(session.subscribe_exit().borrow().is_some());
    }

    #[tokio::test]
    async fn test_resize_updates_size() {
        let session = PtySession::spawn(PtyOptions::command("cat").with_size(100, 30), &config()).unwrap();
        assert_eq!(session.size(), (100, 30));
        session.resize(132, 43).unwrap();
        assert_eq!(session.size(), (132, 43));
        assert_eq!(session.info().cols, 132);
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_attach_returns_history() {
        let session = PtySession::spawn(
            PtyOptions::command("/bin/sh").with_args(["-c", "echo banner; sleep 5"]),
            &config(),
        )
        .unwrap();
        wait_until(|| contains(&session.history(), "banner")).await;

        let (listener, _) = collector();
        let (history, _sub) = session.attach(listener).unwrap();
        assert!(contains(&history, "banner"));
        session.destroy().await;
    }
}
